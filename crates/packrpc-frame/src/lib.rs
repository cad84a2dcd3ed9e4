//! CRC-checked packet framing for packrpc.
//!
//! Every frame carries:
//! - A 2-byte magic number (0x01 0x07) for stream synchronization
//! - A doubled, variable-width content length
//! - Header fields: request id, response flag and request type id
//! - The codec-encoded content and a CRC32 over fields and content
//!
//! The [`Deframer`] turns an arbitrarily chunked byte stream back into
//! packets and recovers from corruption by rescanning for magic.

pub mod codec;
#[cfg(feature = "async")]
pub mod codec_async;
pub mod deframer;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    pack, pack_content, pack_into, FrameConfig, Packet, DEFAULT_MAX_CONTENT, MAGIC,
    MAX_REQUEST_ID, MAX_REQUEST_TYPE_ID,
};
#[cfg(feature = "async")]
pub use codec_async::PacketCodec;
pub use deframer::{Deframer, DeframerStats};
pub use error::{FrameError, Result};
pub use reader::PacketReader;
pub use writer::PacketWriter;
