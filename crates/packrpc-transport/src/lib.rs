//! Byte-stream transports for packrpc.
//!
//! Everything above this layer reads and writes an [`RpcStream`], which wraps
//! one of:
//! - Unix domain sockets (Linux/macOS)
//! - TCP connections
//! - In-memory duplex pipes, for tests and in-process peers

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{pipe, PipeEnd};
pub use traits::RpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
