use packrpc_codec::CodecError;

/// Errors that can occur during packet framing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The packet content could not be encoded or decoded.
    #[error("content codec error: {0}")]
    Codec(#[from] CodecError),

    /// A header field does not fit its wire encoding.
    #[error("{field} {value} out of range (max {max})")]
    FieldOutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    /// The encoded content exceeds the configured maximum size.
    #[error("content too large ({size} bytes, max {max})")]
    ContentTooLarge { size: usize, max: usize },

    /// The trailing checksum does not match the received bytes.
    #[error("crc mismatch (wire {wire:#010x}, computed {computed:#010x})")]
    CrcMismatch { wire: u32, computed: u32 },

    /// An I/O error occurred while reading or writing packets.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete packet was received.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
