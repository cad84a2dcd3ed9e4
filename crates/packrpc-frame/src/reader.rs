use std::collections::VecDeque;
use std::io::{ErrorKind, Read};

use packrpc_transport::RpcStream;

use crate::codec::{FrameConfig, Packet};
use crate::deframer::{Deframer, DeframerStats};
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete packets from any `Read` stream.
///
/// Partial reads and corrupt frames are handled internally; callers only
/// ever see whole, CRC-checked packets.
pub struct PacketReader<T> {
    inner: T,
    deframer: Deframer,
    ready: VecDeque<Packet>,
}

impl<T: Read> PacketReader<T> {
    /// Create a new packet reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new packet reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            deframer: Deframer::with_config(&config),
            ready: VecDeque::new(),
        }
    }

    /// Read the next complete packet (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_packet(&mut self) -> Result<Packet> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(packet);
            }

            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            let ready = &mut self.ready;
            self.deframer
                .feed_with(&chunk[..read], |packet| ready.push_back(packet));
        }
    }

    /// Counters from the underlying deframer.
    pub fn stats(&self) -> DeframerStats {
        self.deframer.stats()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    ///
    /// Packets already decoded but not yet returned are dropped.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum content size for subsequent frames.
    pub fn set_max_content_size(&mut self, max_content_size: usize) {
        self.deframer.set_max_content_size(max_content_size);
    }
}

impl PacketReader<RpcStream> {
    /// Create a packet reader for `RpcStream` and apply the read timeout from config.
    pub fn with_config_stream(inner: RpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: packrpc_transport::TransportError) -> FrameError {
    use packrpc_transport::TransportError;

    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        TransportError::Closed => FrameError::ConnectionClosed,
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
