use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use packrpc_codec::Value;
use packrpc_transport::RpcStream;

use crate::codec::{pack_content, FrameConfig, Packet};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
pub struct PacketWriter<T> {
    inner: T,
    buf: BytesMut,
    content: BytesMut,
    config: FrameConfig,
}

impl<T: Write> PacketWriter<T> {
    /// Create a new packet writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new packet writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            content: BytesMut::new(),
            config,
        }
    }

    /// Write a complete packet (blocking).
    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.send(
            packet.is_response,
            packet.request_type_id,
            packet.request_id,
            &packet.content,
        )
    }

    /// Encode and send one frame.
    pub fn send(
        &mut self,
        is_response: bool,
        request_type_id: u16,
        request_id: u32,
        content: &Value,
    ) -> Result<()> {
        self.content.clear();
        if !content.is_null() {
            packrpc_codec::generate_into(content, &mut self.content)?;
        }
        if self.content.len() > self.config.max_content_size {
            return Err(FrameError::ContentTooLarge {
                size: self.content.len(),
                max: self.config.max_content_size,
            });
        }

        self.buf.clear();
        pack_content(
            is_response,
            request_type_id,
            request_id,
            &self.content,
            &mut self.buf,
        )?;

        let frame = std::mem::take(&mut self.buf);
        let result = self.send_frame(&frame);
        self.buf = frame;
        result
    }

    /// Send an already packed frame.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < frame.len() {
            match self.inner.write(&frame[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if self.should_retry(&err) => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if self.should_retry(&err) => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    // With a write timeout set, WouldBlock and TimedOut mean the timeout
    // fired and the peer is not draining the stream.
    fn should_retry(&self, err: &std::io::Error) -> bool {
        match err.kind() {
            ErrorKind::Interrupted => true,
            ErrorKind::WouldBlock => self.config.write_timeout.is_none(),
            _ => false,
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum content size for subsequent frames.
    pub fn set_max_content_size(&mut self, max_content_size: usize) {
        self.config.max_content_size = max_content_size;
    }

    /// Current packet writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl PacketWriter<RpcStream> {
    /// Create a packet writer for `RpcStream` and apply the write timeout from config.
    pub fn with_config_stream(inner: RpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
