use std::io::{ErrorKind, Read};

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::tag;
use crate::value::Value;

/// Upper bound on up-front allocation for a declared length; longer items
/// grow as bytes actually arrive.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Parse a complete buffer holding one top-level list or map.
///
/// Trailing bytes after the top-level container are rejected.
pub fn parse(bytes: &[u8]) -> Result<Value> {
    let mut src = bytes;
    let value = read(&mut src)?;
    if !src.is_empty() {
        return Err(CodecError::InvalidFormat(format!(
            "{} trailing bytes after top-level value",
            src.len()
        )));
    }
    Ok(value)
}

/// Read one top-level list or map from a byte source.
///
/// End of input while reading container items is treated as a terminator.
pub fn read<R: Read>(source: &mut R) -> Result<Value> {
    let first = read_tag(source)?
        .ok_or_else(|| CodecError::InvalidFormat("empty input".to_string()))?;

    match first {
        tag::MAP => read_map(source, 0),
        tag::LIST => read_list(source, 0),
        other => Err(CodecError::InvalidFormat(format!(
            "top-level tag must be map or list, got {other:#04x}"
        ))),
    }
}

fn read_list<R: Read>(src: &mut R, depth: usize) -> Result<Value> {
    check_depth(depth)?;
    let mut items = Vec::new();
    while let Some(item_tag) = read_tag(src)? {
        if item_tag == tag::END {
            break;
        }
        items.push(read_item(src, item_tag, depth)?);
    }
    Ok(Value::List(items))
}

fn read_map<R: Read>(src: &mut R, depth: usize) -> Result<Value> {
    check_depth(depth)?;
    let mut entries = Vec::new();
    while let Some(key_tag) = read_tag(src)? {
        if key_tag == tag::END {
            break;
        }
        let key = read_item(src, key_tag, depth)?;
        let value_tag = match read_tag(src)? {
            Some(t) if t != tag::END => t,
            _ => {
                return Err(CodecError::InvalidFormat(format!(
                    "map key {key} has no value"
                )))
            }
        };
        let value = read_item(src, value_tag, depth)?;
        entries.push((key, value));
    }
    Ok(Value::Map(entries))
}

/// Decode the item introduced by `item_tag`; `depth` is that of the
/// enclosing container.
fn read_item<R: Read>(src: &mut R, item_tag: u8, depth: usize) -> Result<Value> {
    let kind = item_tag & tag::TYPE_MASK;
    if !tag::is_integer(kind) && item_tag != kind {
        return Err(CodecError::InvalidFormat(format!(
            "unexpected high bits on tag {item_tag:#04x}"
        )));
    }

    let value = match kind {
        tag::MAP => read_map(src, depth + 1)?,
        tag::LIST => read_list(src, depth + 1)?,
        tag::FLOAT => Value::Float(f32::from_bits(read_uint(src, 4, "float")? as u32)),
        tag::DOUBLE => Value::Double(f64::from_bits(read_uint(src, 8, "double")?)),
        tag::SHORT => {
            let v = read_integer(src, item_tag)?;
            Value::Short(narrow(v, "short")?)
        }
        tag::INT => {
            let v = read_integer(src, item_tag)?;
            Value::Int(narrow(v, "int")?)
        }
        tag::LONG => Value::Long(read_integer(src, item_tag)?),
        tag::TIMESTAMP => Value::Timestamp(read_integer(src, item_tag)?),
        tag::TRUE => Value::Bool(true),
        tag::FALSE => Value::Bool(false),
        tag::NULL => Value::Null,
        tag::SHORT_STRING | tag::LONG_STRING => {
            let len = read_len(src, kind == tag::LONG_STRING, "string length")?;
            let data = read_bytes(src, len, "string")?;
            let text = String::from_utf8(data)
                .map_err(|err| CodecError::InvalidFormat(format!("string is not UTF-8: {err}")))?;
            Value::String(text)
        }
        tag::SHORT_BINARY | tag::LONG_BINARY => {
            let len = read_len(src, kind == tag::LONG_BINARY, "binary length")?;
            Value::Binary(Bytes::from(read_bytes(src, len, "binary")?))
        }
        _ => {
            return Err(CodecError::InvalidFormat(format!(
                "unexpected terminator tag {item_tag:#04x}"
            )))
        }
    };
    Ok(value)
}

fn check_depth(depth: usize) -> Result<()> {
    if depth >= tag::MAX_DEPTH {
        return Err(CodecError::InvalidFormat(format!(
            "nesting deeper than {} levels",
            tag::MAX_DEPTH
        )));
    }
    Ok(())
}

fn read_integer<R: Read>(src: &mut R, item_tag: u8) -> Result<i64> {
    let kind = item_tag & tag::TYPE_MASK;
    let index = usize::from((item_tag >> tag::WIDTH_SHIFT) & tag::WIDTH_MASK);
    let width = *tag::widths(kind).get(index).ok_or_else(|| {
        CodecError::InvalidFormat(format!("invalid integer width on tag {item_tag:#04x}"))
    })?;

    let magnitude = read_uint(src, width, "integer")?;
    if magnitude > i64::MAX as u64 {
        return Err(CodecError::InvalidFormat(format!(
            "integer magnitude {magnitude} out of range"
        )));
    }

    let magnitude = magnitude as i64;
    if item_tag & tag::SIGN_BIT != 0 {
        Ok(!magnitude)
    } else {
        Ok(magnitude)
    }
}

fn narrow<T: TryFrom<i64>>(value: i64, what: &str) -> Result<T> {
    T::try_from(value)
        .map_err(|_| CodecError::InvalidFormat(format!("{value} does not fit in a {what}")))
}

fn read_len<R: Read>(src: &mut R, long: bool, what: &str) -> Result<usize> {
    let width = if long { 3 } else { 1 };
    Ok(read_uint(src, width, what)? as usize)
}

fn read_uint<R: Read>(src: &mut R, width: usize, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    fill(src, &mut buf[8 - width..], what)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_bytes<R: Read>(src: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    src.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() < len {
        return Err(CodecError::short_read(what, len, data.len()));
    }
    Ok(data)
}

fn fill<R: Read>(src: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => return Err(CodecError::short_read(what, buf.len(), filled)),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(CodecError::Io(err)),
        }
    }
    Ok(())
}

/// Next tag byte, or `None` at end of input.
fn read_tag<R: Read>(src: &mut R) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match src.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(CodecError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::encode::generate;

    fn roundtrip(value: Value) {
        let bytes = generate(&value).unwrap();
        assert_eq!(parse(&bytes).unwrap(), value, "bytes: {:02x?}", bytes.as_ref());
    }

    #[test]
    fn rpc_test_list() {
        let value = Value::List(vec!["rpc test".into(), "rpc".into(), "test".into()]);
        roundtrip(value);
    }

    #[test]
    fn integer_boundaries() {
        let longs = [
            0,
            1,
            -1,
            255,
            256,
            -256,
            -257,
            65535,
            65536,
            16_777_215,
            16_777_216,
            i64::from(u32::MAX),
            1 << 40,
            (1 << 48) - 1,
            1 << 48,
            i64::MAX,
            i64::MIN,
        ];
        let mut items = Vec::new();
        for v in longs {
            items.push(Value::Long(v));
            items.push(Value::Timestamp(v));
            if let Ok(v) = i32::try_from(v) {
                items.push(Value::Int(v));
            }
            if let Ok(v) = i16::try_from(v) {
                items.push(Value::Short(v));
            }
        }
        items.extend([
            Value::Short(i16::MIN),
            Value::Short(i16::MAX),
            Value::Int(i32::MIN),
            Value::Int(i32::MAX),
        ]);
        roundtrip(Value::List(items));
    }

    #[test]
    fn float_extremes_preserve_bits() {
        let doubles = [0.0, -0.0, f64::MIN, f64::MAX, f64::MIN_POSITIVE, f64::INFINITY];
        let floats = [0.0f32, -0.0, f32::MIN, f32::MAX, f32::EPSILON, f32::NEG_INFINITY];
        let mut items: Vec<Value> = doubles.iter().map(|d| Value::Double(*d)).collect();
        items.extend(floats.iter().map(|f| Value::Float(*f)));

        let bytes = generate(&Value::List(items.clone())).unwrap();
        let decoded = parse(&bytes).unwrap();
        let decoded = decoded.as_list().unwrap();
        for (orig, back) in items.iter().zip(decoded) {
            match (orig, back) {
                (Value::Double(a), Value::Double(b)) => assert_eq!(a.to_bits(), b.to_bits()),
                (Value::Float(a), Value::Float(b)) => assert_eq!(a.to_bits(), b.to_bits()),
                other => panic!("kind changed: {other:?}"),
            }
        }
    }

    #[test]
    fn strings_and_binaries_at_length_boundaries() {
        for len in [0usize, 1, 255, 256, 65536] {
            let text = "a".repeat(len);
            roundtrip(Value::List(vec![
                Value::String(text),
                Value::from(vec![0xA5u8; len]),
            ]));
        }
    }

    #[test]
    fn longest_binary_roundtrips() {
        roundtrip(Value::List(vec![Value::from(vec![7u8; tag::LONG_LEN_MAX])]));
    }

    #[test]
    fn longest_string_roundtrips() {
        let text = "z".repeat(tag::LONG_LEN_MAX);
        let bytes = generate(&Value::List(vec![Value::String(text.clone())])).unwrap();
        assert_eq!(&bytes[1..5], &[tag::LONG_STRING, 0xFF, 0xFF, 0xFF]);
        assert_eq!(parse(&bytes).unwrap(), Value::List(vec![Value::String(text)]));
    }

    #[test]
    fn nested_maps_and_lists() {
        let value = Value::Map(vec![
            (Value::from("list"), Value::List(vec![Value::Int(1), Value::list()])),
            (Value::Int(7), Value::Map(vec![(Value::Null, Value::Bool(false))])),
            (Value::List(vec![Value::from("k")]), Value::Timestamp(-5)),
        ]);
        roundtrip(value);
    }

    #[test]
    fn rejects_non_container_top_level() {
        let err = parse(&[tag::NULL]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
        let err = parse(&[]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn end_of_input_terminates_containers() {
        assert_eq!(parse(&[tag::LIST]).unwrap(), Value::list());
        assert_eq!(
            parse(&[tag::LIST, tag::TRUE, tag::LIST, tag::NULL]).unwrap(),
            Value::List(vec![Value::Bool(true), Value::List(vec![Value::Null])])
        );
    }

    #[test]
    fn short_read_reports_counts() {
        let err = parse(&[tag::LIST, tag::SHORT_STRING, 5, b'a', b'b']).unwrap_err();
        match err {
            CodecError::InvalidFormat(msg) => {
                assert!(msg.contains("expected 5"), "{msg}");
                assert!(msg.contains("got 2"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = parse(&[tag::LIST, tag::DOUBLE, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn map_key_without_value_is_invalid() {
        let err = parse(&[tag::MAP, tag::TRUE]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
        let err = parse(&[tag::MAP, tag::TRUE, tag::END]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn trailing_bytes_are_invalid() {
        let err = parse(&[tag::LIST, tag::END, tag::NULL]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn high_bits_on_plain_tags_are_invalid() {
        let err = parse(&[tag::LIST, 0x80 | tag::TRUE, tag::END]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn invalid_width_index_is_invalid() {
        // Index 4 is not a legal width for int.
        let err = parse(&[tag::LIST, 0x46, 0, 0, 0, 0, 0, 0, tag::END]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn out_of_range_short_is_invalid() {
        // Magnitude 0x8000 does not fit in an i16.
        let err = parse(&[tag::LIST, 0x15, 0x80, 0x00, tag::END]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn non_minimal_width_is_accepted() {
        let value = parse(&[tag::LIST, 0x36, 0, 0, 0, 5, tag::END]).unwrap();
        assert_eq!(value, Value::List(vec![Value::Int(5)]));
    }

    #[test]
    fn invalid_utf8_is_invalid() {
        let err = parse(&[tag::LIST, tag::SHORT_STRING, 2, 0xC3, 0x28, tag::END]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn nested_terminator_tag_in_item_position_is_invalid() {
        // A map key tag of 0x10 has kind END with stray high bits.
        let err = parse(&[tag::MAP, 0x10, tag::END]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn hostile_depth_does_not_overflow() {
        let bytes = vec![tag::LIST; 100_000];
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn read_from_stream_leaves_following_bytes() {
        let mut wire = generate(&Value::List(vec![Value::Int(1)])).unwrap().to_vec();
        wire.extend_from_slice(b"rest");
        let mut cursor = Cursor::new(wire);

        let value = read(&mut cursor).unwrap();
        assert_eq!(value, Value::List(vec![Value::Int(1)]));

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"rest");
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn value_strategy() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i16>().prop_map(Value::Short),
                any::<i32>().prop_map(Value::Int),
                any::<i64>().prop_map(Value::Long),
                any::<i64>().prop_map(Value::Timestamp),
                (-1.0e30f32..1.0e30f32).prop_map(Value::Float),
                (-1.0e300f64..1.0e300f64).prop_map(Value::Double),
                ".{0,300}".prop_map(Value::String),
                prop::collection::vec(any::<u8>(), 0..300).prop_map(Value::from),
            ];
            leaf.prop_recursive(4, 64, 8, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
                    prop::collection::vec((inner.clone(), inner), 0..8).prop_map(Value::Map),
                ]
            })
        }

        proptest! {
            #[test]
            fn prop_parse_inverts_generate(items in prop::collection::vec(value_strategy(), 0..6)) {
                let value = Value::List(items);
                let bytes = generate(&value).unwrap();
                prop_assert_eq!(parse(&bytes).unwrap(), value);
            }

            #[test]
            fn prop_parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
                let _ = parse(&bytes);
            }
        }
    }
}
