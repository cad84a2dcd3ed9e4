/// Errors produced while encoding or decoding values.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value cannot be represented on the wire.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// The input bytes are not a valid encoding.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// An I/O error occurred on the underlying sink or source.
    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub(crate) fn short_read(what: &str, expected: usize, actual: usize) -> Self {
        Self::InvalidFormat(format!(
            "short read for {what}: expected {expected} bytes, got {actual}"
        ))
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
