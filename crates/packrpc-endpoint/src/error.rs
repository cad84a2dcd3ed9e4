use std::time::Duration;

/// Errors that can occur in endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No transport is attached to the endpoint.
    #[error("endpoint is not connected")]
    NotConnected,

    /// No handler is registered for the request type id.
    #[error("no handler registered for request type {0}")]
    UnknownHandler(u16),

    /// A handler is already registered for the request type id.
    #[error("request type {0} registered twice")]
    DuplicateHandler(u16),

    /// The method name is already mapped to a request type id.
    #[error("method {interface}.{method} registered twice")]
    DuplicateMethod { interface: String, method: String },

    /// The method name is not mapped to any request type id.
    #[error("unknown method {interface}.{method}")]
    UnknownMethod { interface: String, method: String },

    /// The response did not arrive before the call's deadline.
    #[error("request {request_id} expired after {after:?}")]
    Expired { request_id: u32, after: Duration },

    /// The wait for a response was aborted, usually because the endpoint
    /// was detached or closed.
    #[error("request {0} interrupted")]
    Interrupted(u32),

    /// Call options that cannot be honored together.
    #[error("invalid call options: {0}")]
    InvalidOptions(&'static str),

    /// A handler returned an error or panicked.
    #[error("handler for request type {type_id} failed: {message}")]
    Handler { type_id: u16, message: String },

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] packrpc_frame::FrameError),

    /// Content codec error.
    #[error("codec error: {0}")]
    Codec(#[from] packrpc_codec::CodecError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] packrpc_transport::TransportError),

    /// I/O error outside the framing layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RpcError> for std::io::Error {
    fn from(err: RpcError) -> Self {
        use std::io::ErrorKind;

        if let RpcError::Io(io) = err {
            return io;
        }
        let kind = match &err {
            RpcError::NotConnected => ErrorKind::NotConnected,
            RpcError::Interrupted(_) => ErrorKind::Interrupted,
            RpcError::Expired { .. } => ErrorKind::TimedOut,
            RpcError::InvalidOptions(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
