//! `tokio_util::codec` adapter over the same deframer used by the blocking reader.

use std::collections::VecDeque;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{pack_content, FrameConfig, Packet};
use crate::deframer::{Deframer, DeframerStats};
use crate::error::{FrameError, Result};

/// Packet codec for `FramedRead`/`FramedWrite`.
///
/// Decoding drains every byte handed to it; bytes of a partial frame are
/// buffered inside the deframer rather than left in the read buffer.
#[derive(Debug)]
pub struct PacketCodec {
    deframer: Deframer,
    ready: VecDeque<Packet>,
    content: BytesMut,
    max_content_size: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::with_config(&FrameConfig::default())
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            deframer: Deframer::with_config(config),
            ready: VecDeque::new(),
            content: BytesMut::new(),
            max_content_size: config.max_content_size,
        }
    }

    pub fn stats(&self) -> DeframerStats {
        self.deframer.stats()
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if !src.is_empty() {
            let data = src.split();
            let ready = &mut self.ready;
            self.deframer.feed_with(&data, |packet| ready.push_back(packet));
        }
        Ok(self.ready.pop_front())
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        <Self as Encoder<&Packet>>::encode(self, &item, dst)
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<()> {
        self.content.clear();
        if !item.content.is_null() {
            packrpc_codec::generate_into(&item.content, &mut self.content)?;
        }
        if self.content.len() > self.max_content_size {
            return Err(FrameError::ContentTooLarge {
                size: self.content.len(),
                max: self.max_content_size,
            });
        }
        pack_content(
            item.is_response,
            item.request_type_id,
            item.request_id,
            &self.content,
            dst,
        )
    }
}
