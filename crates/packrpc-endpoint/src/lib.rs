//! Request correlation and dispatch for packrpc.
//!
//! An [`Endpoint`] is one side of a connection. It correlates outbound
//! calls with their responses, runs registered handlers for inbound
//! requests, and notifies packet listeners. Endpoints are connected with
//! [`connect`] or accepted from an [`EndpointListener`], or attached to any
//! transport by hand.

pub mod correlator;
pub mod endpoint;
pub mod error;
pub mod registry;

pub mod connector;
#[cfg(unix)]
pub mod listener;

#[cfg(unix)]
pub use connector::{connect, connect_with};
pub use connector::connect_tcp;
pub use correlator::{Correlator, PendingRequest};
pub use endpoint::{
    broadcast, CallOptions, Endpoint, EndpointConfig, ListenerId, Transport,
};
pub use error::{Result, RpcError};
#[cfg(unix)]
pub use listener::EndpointListener;
pub use registry::{Handler, HandlerResult, HandlerTable, MethodTable};
