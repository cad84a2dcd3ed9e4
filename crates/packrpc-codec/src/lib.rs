//! Self-describing compact binary encoding for dynamic RPC values.
//!
//! A message body is always a top-level list or map. Every item carries a
//! one-byte tag:
//! - Integers use the fewest big-endian bytes that hold their magnitude
//! - Strings and binaries use a 1-byte length up to 255 bytes, 3 bytes beyond
//! - Containers are closed by a zero terminator byte
//!
//! [`generate`] and [`parse`] are exact inverses for every representable value.

pub mod decode;
pub mod encode;
pub mod error;
pub mod tag;
pub mod value;

pub use decode::{parse, read};
pub use encode::{generate, generate_into, write};
pub use error::{CodecError, Result};
pub use value::Value;
