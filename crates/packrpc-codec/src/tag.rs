//! Item tags.
//!
//! Every item starts with one tag byte. The low nibble selects the kind.
//! Integer kinds (short, int, long, timestamp) also use the high nibble:
//! bit `0x80` marks a negative value and bits `0x70` index the payload width.
//! All other kinds require a zero high nibble.

/// Terminates a list or map.
pub const END: u8 = 0;
pub const MAP: u8 = 1;
pub const LIST: u8 = 2;
pub const FLOAT: u8 = 3;
pub const DOUBLE: u8 = 4;
pub const SHORT: u8 = 5;
pub const INT: u8 = 6;
pub const LONG: u8 = 7;
pub const TRUE: u8 = 8;
pub const FALSE: u8 = 9;
pub const NULL: u8 = 10;
pub const TIMESTAMP: u8 = 11;
pub const SHORT_STRING: u8 = 12;
pub const LONG_STRING: u8 = 13;
pub const SHORT_BINARY: u8 = 14;
pub const LONG_BINARY: u8 = 15;

/// Negative-value marker on integer tags.
pub const SIGN_BIT: u8 = 0x80;
/// Mask selecting the type nibble.
pub const TYPE_MASK: u8 = 0x0F;
/// Shift of the width index inside an integer tag.
pub const WIDTH_SHIFT: u8 = 4;
/// Mask of the width index after shifting.
pub const WIDTH_MASK: u8 = 0x07;

/// Payload widths for short and int, indexed by the tag's width bits.
pub const INT_WIDTHS: &[usize] = &[1, 2, 3, 4];
/// Payload widths for long and timestamp, indexed by the tag's width bits.
pub const LONG_WIDTHS: &[usize] = &[1, 2, 3, 4, 6, 8];

/// Largest length a short string/binary can carry.
pub const SHORT_LEN_MAX: usize = 0xFF;
/// Largest length a long string/binary can carry (3-byte length).
pub const LONG_LEN_MAX: usize = 0xFF_FFFF;

/// Maximum container nesting accepted by both directions.
pub const MAX_DEPTH: usize = 512;

/// True if `tag`'s low nibble is an integer kind that uses the high nibble.
pub fn is_integer(kind: u8) -> bool {
    matches!(kind, SHORT | INT | LONG | TIMESTAMP)
}

/// Width table for an integer kind.
pub fn widths(kind: u8) -> &'static [usize] {
    match kind {
        SHORT | INT => INT_WIDTHS,
        _ => LONG_WIDTHS,
    }
}
