use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::tag;
use crate::value::Value;

/// Serialize a top-level list or map into a new buffer.
///
/// Any other top-level kind is rejected with [`CodecError::UnsupportedType`].
pub fn generate(value: &Value) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    generate_into(value, &mut dst)?;
    Ok(dst.freeze())
}

/// Serialize a top-level list or map, appending to `dst`.
///
/// On error `dst` is restored to its original length.
pub fn generate_into(value: &Value, dst: &mut BytesMut) -> Result<()> {
    if !value.is_container() {
        return Err(CodecError::UnsupportedType(format!(
            "top-level value must be a list or map, got {}",
            value.kind()
        )));
    }

    let start = dst.len();
    if let Err(err) = put_item(dst, value, 0) {
        dst.truncate(start);
        return Err(err);
    }
    Ok(())
}

/// Serialize a top-level list or map to a writer.
pub fn write<W: Write>(sink: &mut W, value: &Value) -> Result<()> {
    let bytes = generate(value)?;
    sink.write_all(&bytes)?;
    Ok(())
}

fn put_item(dst: &mut BytesMut, value: &Value, depth: usize) -> Result<()> {
    match value {
        Value::Null => dst.put_u8(tag::NULL),
        Value::Bool(true) => dst.put_u8(tag::TRUE),
        Value::Bool(false) => dst.put_u8(tag::FALSE),
        Value::Short(v) => put_integer(dst, tag::SHORT, i64::from(*v)),
        Value::Int(v) => put_integer(dst, tag::INT, i64::from(*v)),
        Value::Long(v) => put_integer(dst, tag::LONG, *v),
        Value::Timestamp(ms) => put_integer(dst, tag::TIMESTAMP, *ms),
        Value::Float(v) => {
            dst.put_u8(tag::FLOAT);
            dst.put_u32(v.to_bits());
        }
        Value::Double(v) => {
            dst.put_u8(tag::DOUBLE);
            dst.put_u64(v.to_bits());
        }
        Value::String(s) => put_sized(
            dst,
            tag::SHORT_STRING,
            tag::LONG_STRING,
            s.as_bytes(),
            "string",
        )?,
        Value::Binary(b) => put_sized(dst, tag::SHORT_BINARY, tag::LONG_BINARY, b, "binary")?,
        Value::List(items) => {
            check_depth(depth)?;
            dst.put_u8(tag::LIST);
            for item in items {
                put_item(dst, item, depth + 1)?;
            }
            dst.put_u8(tag::END);
        }
        Value::Map(entries) => {
            check_depth(depth)?;
            dst.put_u8(tag::MAP);
            for (key, item) in entries {
                put_item(dst, key, depth + 1)?;
                put_item(dst, item, depth + 1)?;
            }
            dst.put_u8(tag::END);
        }
    }
    Ok(())
}

fn check_depth(depth: usize) -> Result<()> {
    if depth >= tag::MAX_DEPTH {
        return Err(CodecError::UnsupportedType(format!(
            "nesting deeper than {} levels",
            tag::MAX_DEPTH
        )));
    }
    Ok(())
}

/// Sign-magnitude integer: negatives store `!v`, i.e. `-(v + 1)`, so the
/// minimum of every width still fits that width.
fn put_integer(dst: &mut BytesMut, kind: u8, value: i64) {
    let (sign, magnitude) = if value < 0 {
        (tag::SIGN_BIT, !value as u64)
    } else {
        (0, value as u64)
    };

    let widths = tag::widths(kind);
    let index = widths
        .iter()
        .position(|&width| width >= 8 || magnitude >> (8 * width) == 0)
        .unwrap_or(widths.len() - 1);
    let width = widths[index];

    dst.put_u8(kind | sign | ((index as u8) << tag::WIDTH_SHIFT));
    dst.put_slice(&magnitude.to_be_bytes()[8 - width..]);
}

fn put_sized(
    dst: &mut BytesMut,
    short_tag: u8,
    long_tag: u8,
    data: &[u8],
    what: &str,
) -> Result<()> {
    let len = data.len();
    if len <= tag::SHORT_LEN_MAX {
        dst.put_u8(short_tag);
        dst.put_u8(len as u8);
    } else if len <= tag::LONG_LEN_MAX {
        dst.put_u8(long_tag);
        dst.put_uint(len as u64, 3);
    } else {
        return Err(CodecError::UnsupportedType(format!(
            "{what} of {len} bytes exceeds {} byte limit",
            tag::LONG_LEN_MAX
        )));
    }
    dst.put_slice(data);
    Ok(())
}
