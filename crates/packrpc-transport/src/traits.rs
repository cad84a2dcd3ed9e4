use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::memory::PipeEnd;

/// A connected byte stream: implements Read + Write.
///
/// This is the I/O type every transport hands to the framing layer. It wraps
/// a Unix domain socket, a TCP connection, or one end of an in-memory pipe.
pub struct RpcStream {
    inner: RpcStreamInner,
}

enum RpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
    Memory(PipeEnd),
}

impl Read for RpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.read(buf),
            RpcStreamInner::Tcp(stream) => stream.read(buf),
            RpcStreamInner::Memory(end) => end.read(buf),
        }
    }
}

impl Write for RpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.write(buf),
            RpcStreamInner::Tcp(stream) => stream.write(buf),
            RpcStreamInner::Memory(end) => end.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.flush(),
            RpcStreamInner::Tcp(stream) => stream.flush(),
            RpcStreamInner::Memory(end) => end.flush(),
        }
    }
}

impl RpcStream {
    /// Connect over TCP, trying each resolved address in turn.
    pub fn connect_tcp(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let label = addr.to_string();
        let addrs = addr.to_socket_addrs().map_err(|e| TransportError::Connect {
            addr: label.clone(),
            source: e,
        })?;

        let mut last_err = None;
        for socket_addr in addrs {
            match TcpStream::connect(socket_addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(addr = %socket_addr, "connected over tcp");
                    return Ok(Self::from(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(TransportError::Connect {
            addr: label,
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
            }),
        })
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            RpcStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            RpcStreamInner::Memory(end) => end.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    ///
    /// In-memory pipes never block on write, so the timeout is ignored there.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            RpcStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            RpcStreamInner::Memory(_) => Ok(()),
        }
    }

    /// Try to clone this stream. Socket clones get a new file descriptor;
    /// pipe clones share the same end.
    pub fn try_clone(&self) -> Result<Self> {
        let inner = match &self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => RpcStreamInner::Unix(stream.try_clone()?),
            RpcStreamInner::Tcp(stream) => RpcStreamInner::Tcp(stream.try_clone()?),
            RpcStreamInner::Memory(end) => RpcStreamInner::Memory(end.clone()),
        };
        Ok(Self { inner })
    }

    /// Shut down both directions. A reader blocked on any clone of this
    /// stream wakes with EOF.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both)?,
            RpcStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both)?,
            RpcStreamInner::Memory(end) => end.shutdown(),
        }
        Ok(())
    }

    /// Transport name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            RpcStreamInner::Unix(_) => "unix",
            RpcStreamInner::Tcp(_) => "tcp",
            RpcStreamInner::Memory(_) => "memory",
        }
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixStream> for RpcStream {
    fn from(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: RpcStreamInner::Unix(stream),
        }
    }
}

impl From<TcpStream> for RpcStream {
    fn from(stream: TcpStream) -> Self {
        Self {
            inner: RpcStreamInner::Tcp(stream),
        }
    }
}

impl From<PipeEnd> for RpcStream {
    fn from(end: PipeEnd) -> Self {
        Self {
            inner: RpcStreamInner::Memory(end),
        }
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("type", &self.kind())
            .finish()
    }
}
