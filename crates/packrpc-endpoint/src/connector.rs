use std::net::ToSocketAddrs;
#[cfg(unix)]
use std::path::Path;

use packrpc_transport::RpcStream;
#[cfg(unix)]
use packrpc_transport::UnixDomainSocket;

use crate::endpoint::{Endpoint, EndpointConfig};
use crate::error::Result;

/// Connect to a listening endpoint over a Unix domain socket.
#[cfg(unix)]
pub fn connect(path: impl AsRef<Path>) -> Result<Endpoint> {
    connect_with(path, Endpoint::new(EndpointConfig::default()))
}

/// Connect a prepared endpoint, with handlers and methods already bound,
/// so requests the peer sends right away are not dropped.
#[cfg(unix)]
pub fn connect_with(path: impl AsRef<Path>, endpoint: Endpoint) -> Result<Endpoint> {
    let stream = UnixDomainSocket::connect(path)?;
    endpoint.attach_stream(stream)?;
    Ok(endpoint)
}

/// Connect a prepared endpoint over TCP.
pub fn connect_tcp(
    addr: impl ToSocketAddrs + std::fmt::Display,
    endpoint: Endpoint,
) -> Result<Endpoint> {
    let stream = RpcStream::connect_tcp(addr)?;
    endpoint.attach_stream(stream)?;
    Ok(endpoint)
}
