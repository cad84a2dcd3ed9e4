use bytes::{BufMut, Bytes, BytesMut};
use packrpc_codec::Value;

use crate::error::{FrameError, Result};

/// Magic bytes opening every frame.
pub const MAGIC: [u8; 2] = [0x01, 0x07];

/// Size of the trailing CRC32.
pub const CRC_SIZE: usize = 4;

/// Largest request type id (14 bits).
pub const MAX_REQUEST_TYPE_ID: u16 = 0x3FFF;

/// Largest request id (30 bits).
pub const MAX_REQUEST_ID: u32 = 0x3FFF_FFFF;

/// Largest content length the length field can carry (31 bits).
pub const MAX_CONTENT_LENGTH: usize = 0x7FFF_FFFF;

/// Default maximum content size: 16 MiB.
pub const DEFAULT_MAX_CONTENT: usize = 16 * 1024 * 1024;

/// Lengths up to this use the 2-byte form.
const SHORT_LENGTH_MAX: usize = 0x7FFF;
const LONG_LENGTH_FLAG: u32 = 0x8000_0000;

const SHORT_ID_MAX: u32 = 0x7FFF;
const MEDIUM_ID_MAX: u32 = 0x3F_FFFF;
const MEDIUM_ID_FLAG: u32 = 0x80_0000;
const LONG_ID_FLAG: u32 = 0xC000_0000;

const RESPONSE_BIT: u8 = 0x80;
const EXTENDED_TYPE_BIT: u8 = 0x40;
const SHORT_TYPE_MAX: u16 = 0x3F;

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// True when this packet answers an earlier request.
    pub is_response: bool,
    /// Selects the remote handler.
    pub request_type_id: u16,
    /// Correlation token; 0 means no response is expected.
    pub request_id: u32,
    /// The decoded content. Empty content decodes to `Value::Null`.
    pub content: Value,
}

impl Packet {
    /// A request packet. `request_id` 0 marks it fire-and-forget.
    pub fn request(request_type_id: u16, request_id: u32, content: impl Into<Value>) -> Self {
        Self {
            is_response: false,
            request_type_id,
            request_id,
            content: content.into(),
        }
    }

    /// A response packet answering `request_id`.
    pub fn response(request_type_id: u16, request_id: u32, content: impl Into<Value>) -> Self {
        Self {
            is_response: true,
            request_type_id,
            request_id,
            content: content.into(),
        }
    }

    /// True for a request whose sender waits for an answer.
    pub fn expects_response(&self) -> bool {
        !self.is_response && self.request_id != 0
    }

    /// Encode this packet into a complete wire frame.
    pub fn to_bytes(&self) -> Result<Bytes> {
        pack(
            self.is_response,
            self.request_type_id,
            self.request_id,
            &self.content,
        )
    }
}

/// Encode one wire frame.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────────┬──────────────┬─────────────┬───────────┬───────────┐
/// │ Magic (2B) │ Length (2/4B)│ Length copy  │ Fields      │ Content   │ CRC32     │
/// │ 0x01 0x07  │ BE           │ (same bytes) │ (3-6B)      │ (Length)  │ (4B LE)   │
/// └────────────┴──────────────┴──────────────┴─────────────┴───────────┴───────────┘
/// ```
///
/// Fields are the request id (2, 3 or 4 bytes, width in the top bits of the
/// first byte) followed by the type byte(s): response flag in bit 7, and
/// either a 6-bit type id or, with bit 6 set, a 14-bit id spread over two
/// bytes. The CRC covers the fields and the content.
pub fn pack(
    is_response: bool,
    request_type_id: u16,
    request_id: u32,
    content: &Value,
) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    pack_into(is_response, request_type_id, request_id, content, &mut dst)?;
    Ok(dst.freeze())
}

/// Encode one wire frame, appending to `dst`.
///
/// `Value::Null` content is sent as an empty content section. Any other
/// content must be a list or map.
pub fn pack_into(
    is_response: bool,
    request_type_id: u16,
    request_id: u32,
    content: &Value,
    dst: &mut BytesMut,
) -> Result<()> {
    let mut body = BytesMut::new();
    if !content.is_null() {
        packrpc_codec::generate_into(content, &mut body)?;
    }
    pack_content(is_response, request_type_id, request_id, &body, dst)
}

/// Encode one wire frame around already-encoded content bytes.
pub fn pack_content(
    is_response: bool,
    request_type_id: u16,
    request_id: u32,
    content: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    check_range("request type id", request_type_id.into(), MAX_REQUEST_TYPE_ID.into())?;
    check_range("request id", request_id.into(), MAX_REQUEST_ID.into())?;
    if content.len() > MAX_CONTENT_LENGTH {
        return Err(FrameError::ContentTooLarge {
            size: content.len(),
            max: MAX_CONTENT_LENGTH,
        });
    }

    dst.reserve(MAGIC.len() + 8 + 6 + content.len() + CRC_SIZE);
    dst.put_slice(&MAGIC);
    put_length(dst, content.len());
    put_length(dst, content.len());

    let fields_start = dst.len();
    put_fields(dst, is_response, request_type_id, request_id);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&dst[fields_start..]);
    hasher.update(content);
    dst.put_slice(content);
    dst.put_u32_le(hasher.finalize());
    Ok(())
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<()> {
    if value > max {
        return Err(FrameError::FieldOutOfRange { field, value, max });
    }
    Ok(())
}

fn put_length(dst: &mut BytesMut, len: usize) {
    if len <= SHORT_LENGTH_MAX {
        dst.put_u16(len as u16);
    } else {
        dst.put_u32(LONG_LENGTH_FLAG | len as u32);
    }
}

fn put_fields(dst: &mut BytesMut, is_response: bool, request_type_id: u16, request_id: u32) {
    if request_id <= SHORT_ID_MAX {
        dst.put_u16(request_id as u16);
    } else if request_id <= MEDIUM_ID_MAX {
        dst.put_uint(u64::from(MEDIUM_ID_FLAG | request_id), 3);
    } else {
        dst.put_u32(LONG_ID_FLAG | request_id);
    }

    let response = if is_response { RESPONSE_BIT } else { 0 };
    if request_type_id <= SHORT_TYPE_MAX {
        dst.put_u8(response | request_type_id as u8);
    } else {
        dst.put_u8(response | EXTENDED_TYPE_BIT | (request_type_id >> 8) as u8);
        dst.put_u8(request_type_id as u8);
    }
}

/// Size of the doubled length field, given the bytes seen so far.
///
/// With no bytes yet this is the minimum size, so callers can fill up to the
/// returned size and ask again.
pub(crate) fn length_field_size(buf: &[u8]) -> usize {
    match buf.first() {
        Some(&b) if b & 0x80 != 0 => 8,
        _ => 4,
    }
}

/// Decode a complete doubled length field. `None` when the copies disagree.
pub(crate) fn decode_length(buf: &[u8]) -> Option<usize> {
    let (first, second) = buf.split_at(buf.len() / 2);
    if first != second {
        return None;
    }
    let len = match *first {
        [hi, lo] => usize::from(u16::from_be_bytes([hi, lo])),
        [a, b, c, d] => (u32::from_be_bytes([a, b, c, d]) & !LONG_LENGTH_FLAG) as usize,
        _ => return None,
    };
    Some(len)
}

/// Size of the header fields, given the bytes seen so far.
///
/// Like [`length_field_size`], the result is a lower bound until enough bytes
/// have arrived to read both width markers.
pub(crate) fn fields_size(buf: &[u8]) -> usize {
    let id_width = match buf.first() {
        Some(&b) if b & 0xC0 == 0xC0 => 4,
        Some(&b) if b & 0x80 != 0 => 3,
        _ => 2,
    };
    match buf.get(id_width) {
        Some(&b) if b & EXTENDED_TYPE_BIT != 0 => id_width + 2,
        _ => id_width + 1,
    }
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fields {
    pub is_response: bool,
    pub request_type_id: u16,
    pub request_id: u32,
}

/// Decode complete header fields (`buf.len() == fields_size(buf)`).
pub(crate) fn decode_fields(buf: &[u8]) -> Fields {
    let (request_id, rest) = match buf[0] {
        b if b & 0xC0 == 0xC0 => {
            let id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & !LONG_ID_FLAG;
            (id, &buf[4..])
        }
        b if b & 0x80 != 0 => {
            let id = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) & !MEDIUM_ID_FLAG;
            (id, &buf[3..])
        }
        _ => (u32::from(u16::from_be_bytes([buf[0], buf[1]])), &buf[2..]),
    };

    let is_response = rest[0] & RESPONSE_BIT != 0;
    let request_type_id = if rest[0] & EXTENDED_TYPE_BIT != 0 {
        (u16::from(rest[0] & 0x3F) << 8) | u16::from(rest[1])
    } else {
        u16::from(rest[0] & 0x3F)
    };

    Fields {
        is_response,
        request_type_id,
        request_id,
    }
}

/// Configuration for packet readers, writers and deframers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum content size in bytes. Default: 16 MiB.
    pub max_content_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_content_size: DEFAULT_MAX_CONTENT,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
