//! Compact binary RPC transport.
//!
//! packrpc moves dynamically typed [`Value`] trees between peers as
//! CRC-checked frames, recovers from stream corruption, and correlates
//! blocking calls with their responses.
//!
//! # Crate Structure
//!
//! - [`codec`]: Self-describing binary encoding of `Value`
//! - [`frame`]: Packet framing and the resynchronizing deframer
//! - [`transport`]: Unix socket, TCP and in-memory byte streams
//! - [`endpoint`]: Request correlation, handler dispatch and listeners

/// Re-export codec types.
pub mod codec {
    pub use packrpc_codec::*;
}

/// Re-export frame types.
pub mod frame {
    pub use packrpc_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use packrpc_transport::*;
}

/// Re-export endpoint types.
pub mod endpoint {
    pub use packrpc_endpoint::*;
}

pub use packrpc_codec::Value;
pub use packrpc_endpoint::{CallOptions, Endpoint, HandlerTable, RpcError};
pub use packrpc_frame::{Deframer, Packet};
