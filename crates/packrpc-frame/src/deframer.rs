//! Incremental frame parser.
//!
//! [`Deframer`] accepts bytes in chunks of any size and emits one [`Packet`]
//! per valid frame. Corruption never surfaces as an error: when a frame fails
//! its length, range, CRC or content checks, every byte read after its magic
//! is pushed back in front of the unread input and scanned again for magic.
//! A spurious magic pair inside a corrupt frame therefore still lines up the
//! next real frame.

use packrpc_codec::Value;
use tracing::debug;

use crate::codec::{
    decode_fields, decode_length, fields_size, length_field_size, FrameConfig, Packet, CRC_SIZE,
    DEFAULT_MAX_CONTENT, MAGIC,
};

/// Upper bound on up-front allocation for a declared content length.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Counters describing what a deframer has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeframerStats {
    /// Packets emitted.
    pub packets: u64,
    /// Frames abandoned and rescanned.
    pub resyncs: u64,
    /// Frames whose CRC did not match.
    pub crc_failures: u64,
    /// Frames whose content did not decode.
    pub decode_failures: u64,
    /// Frames with out-of-range header fields.
    pub range_failures: u64,
    /// Frames with disagreeing or oversized length fields.
    pub length_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekingHeader { saw_first: bool },
    ReadingLength,
    ReadingFields,
    ReadingContent,
    ReadingCrc,
}

/// Why a frame was abandoned.
#[derive(Debug, Clone, Copy)]
enum Fault {
    Length,
    Range,
    Crc,
    Decode,
}

/// Resumable frame parser for one inbound byte stream.
///
/// Not shareable between streams; callers feeding from several threads must
/// serialize access.
pub struct Deframer {
    state: State,
    max_content_size: usize,
    length_buf: Vec<u8>,
    field_buf: Vec<u8>,
    content_len: usize,
    content: Vec<u8>,
    crc_buf: Vec<u8>,
    hasher: crc32fast::Hasher,
    stats: DeframerStats,
}

impl std::fmt::Debug for Deframer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deframer")
            .field("state", &self.state)
            .field("max_content_size", &self.max_content_size)
            .field("buffered", &self.buffered())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT)
    }
}

impl Deframer {
    /// Create a deframer accepting content up to `max_content_size` bytes.
    pub fn new(max_content_size: usize) -> Self {
        Self {
            state: State::SeekingHeader { saw_first: false },
            max_content_size,
            length_buf: Vec::with_capacity(8),
            field_buf: Vec::with_capacity(6),
            content_len: 0,
            content: Vec::new(),
            crc_buf: Vec::with_capacity(CRC_SIZE),
            hasher: crc32fast::Hasher::new(),
            stats: DeframerStats::default(),
        }
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self::new(config.max_content_size)
    }

    /// Feed bytes, collecting every completed packet.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Packet> {
        let mut packets = Vec::new();
        self.feed_with(data, |packet| packets.push(packet));
        packets
    }

    /// Feed bytes, handing each completed packet to `emit` in stream order.
    ///
    /// All of `data` is consumed before returning. Bytes of an incomplete
    /// frame are kept for the next call.
    pub fn feed_with<F: FnMut(Packet)>(&mut self, data: &[u8], mut emit: F) {
        let mut replay = self.run(data, &mut emit);
        while let Some(bytes) = replay {
            replay = self.run(&bytes, &mut emit);
        }
    }

    /// Counters accumulated since creation.
    pub fn stats(&self) -> DeframerStats {
        self.stats
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::SeekingHeader { .. })
    }

    /// Number of bytes held for the frame in progress.
    pub fn buffered(&self) -> usize {
        self.length_buf.len() + self.field_buf.len() + self.content.len() + self.crc_buf.len()
    }

    /// Drop any partial frame and start scanning for magic again.
    pub fn reset(&mut self) {
        self.clear_frame();
        self.state = State::SeekingHeader { saw_first: false };
    }

    pub fn max_content_size(&self) -> usize {
        self.max_content_size
    }

    pub fn set_max_content_size(&mut self, max_content_size: usize) {
        self.max_content_size = max_content_size;
    }

    /// Process `input` until it is exhausted or a frame fails. On failure,
    /// returns the bytes that must be scanned again.
    fn run<F: FnMut(Packet)>(&mut self, input: &[u8], emit: &mut F) -> Option<Vec<u8>> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                State::SeekingHeader { saw_first } => {
                    let byte = input[pos];
                    pos += 1;
                    if saw_first && byte == MAGIC[1] {
                        self.clear_frame();
                        self.state = State::ReadingLength;
                    } else {
                        self.state = State::SeekingHeader {
                            saw_first: byte == MAGIC[0],
                        };
                    }
                }
                State::ReadingLength => {
                    let needed = length_field_size(&self.length_buf);
                    pos += fill(&mut self.length_buf, needed, &input[pos..]);
                    if self.length_buf.len() < length_field_size(&self.length_buf) {
                        continue;
                    }
                    match decode_length(&self.length_buf) {
                        Some(len) if len <= self.max_content_size => {
                            self.content_len = len;
                            self.state = State::ReadingFields;
                        }
                        _ => return Some(self.resync(Fault::Length, &input[pos..])),
                    }
                }
                State::ReadingFields => {
                    let needed = fields_size(&self.field_buf);
                    pos += fill(&mut self.field_buf, needed, &input[pos..]);
                    if self.field_buf.len() < fields_size(&self.field_buf) {
                        continue;
                    }
                    let fields = decode_fields(&self.field_buf);
                    if fields.is_response && fields.request_id == 0 {
                        return Some(self.resync(Fault::Range, &input[pos..]));
                    }
                    self.hasher.update(&self.field_buf);
                    self.content = Vec::with_capacity(self.content_len.min(PREALLOC_LIMIT));
                    self.state = if self.content_len == 0 {
                        State::ReadingCrc
                    } else {
                        State::ReadingContent
                    };
                }
                State::ReadingContent => {
                    pos += fill(&mut self.content, self.content_len, &input[pos..]);
                    if self.content.len() == self.content_len {
                        self.hasher.update(&self.content);
                        self.state = State::ReadingCrc;
                    }
                }
                State::ReadingCrc => {
                    pos += fill(&mut self.crc_buf, CRC_SIZE, &input[pos..]);
                    if self.crc_buf.len() < CRC_SIZE {
                        continue;
                    }
                    if let Err(fault) = self.finish_frame(emit) {
                        return Some(self.resync(fault, &input[pos..]));
                    }
                }
            }
        }
        None
    }

    fn finish_frame<F: FnMut(Packet)>(&mut self, emit: &mut F) -> Result<(), Fault> {
        let computed = std::mem::replace(&mut self.hasher, crc32fast::Hasher::new()).finalize();
        let wire = u32::from_le_bytes([
            self.crc_buf[0],
            self.crc_buf[1],
            self.crc_buf[2],
            self.crc_buf[3],
        ]);
        if wire != computed {
            debug!(wire, computed, "frame crc mismatch");
            return Err(Fault::Crc);
        }

        let content = if self.content.is_empty() {
            Value::Null
        } else {
            match packrpc_codec::parse(&self.content) {
                Ok(value) => value,
                Err(err) => {
                    debug!(error = %err, "frame content failed to decode");
                    return Err(Fault::Decode);
                }
            }
        };

        let fields = decode_fields(&self.field_buf);
        self.clear_frame();
        self.state = State::SeekingHeader { saw_first: false };
        self.stats.packets += 1;
        emit(Packet {
            is_response: fields.is_response,
            request_type_id: fields.request_type_id,
            request_id: fields.request_id,
            content,
        });
        Ok(())
    }

    /// Abandon the current frame. Returns its post-magic bytes followed by
    /// the unread input.
    fn resync(&mut self, fault: Fault, rest: &[u8]) -> Vec<u8> {
        match fault {
            Fault::Length => self.stats.length_failures += 1,
            Fault::Range => self.stats.range_failures += 1,
            Fault::Crc => self.stats.crc_failures += 1,
            Fault::Decode => self.stats.decode_failures += 1,
        }
        self.stats.resyncs += 1;

        let mut replay = Vec::with_capacity(self.buffered() + rest.len());
        replay.extend_from_slice(&self.length_buf);
        replay.extend_from_slice(&self.field_buf);
        replay.extend_from_slice(&self.content);
        replay.extend_from_slice(&self.crc_buf);
        replay.extend_from_slice(rest);
        debug!(?fault, rescan = replay.len(), "resynchronizing");

        self.reset();
        replay
    }

    fn clear_frame(&mut self) {
        self.length_buf.clear();
        self.field_buf.clear();
        self.content_len = 0;
        self.content = Vec::new();
        self.crc_buf.clear();
        self.hasher = crc32fast::Hasher::new();
    }
}

/// Move bytes from `src` into `buf` until it holds `target` bytes. Returns
/// the number of bytes taken.
fn fill(buf: &mut Vec<u8>, target: usize, src: &[u8]) -> usize {
    let take = target.saturating_sub(buf.len()).min(src.len());
    buf.extend_from_slice(&src[..take]);
    take
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec::{pack, pack_content};

    const CHUNK_SIZES: [usize; 13] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 12, 13, 16, 17];

    fn feed_in_chunks(deframer: &mut Deframer, bytes: &[u8], chunk: usize) -> Vec<Packet> {
        let mut packets = Vec::new();
        for piece in bytes.chunks(chunk) {
            deframer.feed_with(piece, |packet| packets.push(packet));
        }
        packets
    }

    /// Encoded content of exactly `len` bytes, plus the value it decodes to.
    fn content_of_len(len: usize) -> (Vec<u8>, Value) {
        let value = match len {
            0 => return (Vec::new(), Value::Null),
            // A bare list tag; end of input closes it.
            1 => return (vec![packrpc_codec::tag::LIST], Value::list()),
            2 => Value::list(),
            3 => Value::List(vec![Value::Null]),
            4..=259 => Value::List(vec![Value::from(vec![0x5Au8; len - 4])]),
            260 | 261 => {
                let mut items = vec![Value::Null; len - 259];
                items.push(Value::from(vec![0x5Au8; 255]));
                Value::List(items)
            }
            _ => Value::List(vec![Value::from(vec![0x5Au8; len - 6])]),
        };
        let bytes = packrpc_codec::generate(&value).unwrap().to_vec();
        assert_eq!(bytes.len(), len);
        (bytes, value)
    }

    fn frame_with_content(
        is_response: bool,
        type_id: u16,
        request_id: u32,
        content: &[u8],
    ) -> Vec<u8> {
        let mut dst = BytesMut::new();
        pack_content(is_response, type_id, request_id, content, &mut dst).unwrap();
        dst.to_vec()
    }

    fn list(items: &[&str]) -> Value {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    #[test]
    fn rpc_test_scenario() {
        let content = list(&["rpc test", "rpc", "test"]);
        let frame = pack(false, 4, 10, &content).unwrap();

        let packets = Deframer::default().feed(&frame);
        assert_eq!(packets, vec![Packet::request(4, 10, content)]);
    }

    #[test]
    fn framing_grid_whole_and_chunked() {
        let type_ids = [0u16, 1, 63, 64, 16383];
        let request_ids = [1u32, 32767, 32768, 4_194_303, 4_194_304, 1_073_741_823];
        let lengths = [0usize, 1, 2, 255, 256, 32767, 32768, 65535, 65536];

        for len in lengths {
            let (content, value) = content_of_len(len);
            // Large bodies make the full id grid slow; corner ids are enough there.
            let (types, ids): (&[u16], &[u32]) = if len > 256 {
                (&[0, 16383], &[1, 1_073_741_823])
            } else {
                (&type_ids, &request_ids)
            };

            for &is_response in &[false, true] {
                for &type_id in types {
                    for &request_id in ids {
                        let frame =
                            frame_with_content(is_response, type_id, request_id, &content);
                        let expected = Packet {
                            is_response,
                            request_type_id: type_id,
                            request_id,
                            content: value.clone(),
                        };

                        let whole = Deframer::default().feed(&frame);
                        assert_eq!(
                            whole,
                            vec![expected.clone()],
                            "len {len} type {type_id} id {request_id}"
                        );

                        for chunk in CHUNK_SIZES {
                            let mut deframer = Deframer::default();
                            let packets = feed_in_chunks(&mut deframer, &frame, chunk);
                            assert_eq!(packets.len(), 1, "len {len} chunk {chunk}");
                            assert_eq!(packets[0], expected);
                            assert!(deframer.is_idle());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn back_to_back_frames_in_order() {
        let mut wire = Vec::new();
        for i in 1..=5u32 {
            wire.extend_from_slice(&pack(false, 2, i, &list(&["n"])).unwrap());
        }

        for chunk in CHUNK_SIZES {
            let packets = feed_in_chunks(&mut Deframer::default(), &wire, chunk);
            let ids: Vec<u32> = packets.iter().map(|p| p.request_id).collect();
            assert_eq!(ids, vec![1, 2, 3, 4, 5], "chunk {chunk}");
        }
    }

    #[test]
    fn leading_garbage_and_stray_magic_byte_are_skipped() {
        let frame = pack(false, 1, 1, &list(&["ok"])).unwrap();
        let mut wire = vec![0xFF, MAGIC[0], 0x33, MAGIC[0], MAGIC[0]];
        wire.extend_from_slice(&frame);

        let mut deframer = Deframer::default();
        let packets = deframer.feed(&wire);
        assert_eq!(packets.len(), 1);
        assert_eq!(deframer.stats().resyncs, 0);
    }

    #[test]
    fn corrupted_content_with_spurious_magic_recovers_next_frame() {
        // Content carries a magic pair so the rescan has a false start.
        let content = Value::List(vec![Value::from(vec![0x01u8, 0x07, 0x01, 0x07])]);
        let mut bad = pack(false, 1, 1, &content).unwrap().to_vec();
        let last = bad.len() - 6;
        bad[last] ^= 0xFF;

        let good = pack(false, 9, 2, &list(&["after"])).unwrap();
        let mut wire = bad;
        wire.extend_from_slice(&good);

        for chunk in CHUNK_SIZES.iter().copied().chain([wire.len()]) {
            let mut deframer = Deframer::default();
            let packets = feed_in_chunks(&mut deframer, &wire, chunk);
            assert_eq!(
                packets,
                vec![Packet::request(9, 2, list(&["after"]))],
                "chunk {chunk}"
            );
            assert!(deframer.stats().resyncs >= 1);
            assert!(deframer.stats().crc_failures >= 1);
        }
    }

    #[test]
    fn corrupted_crc_is_dropped() {
        let mut bad = pack(true, 3, 5, &list(&["x"])).unwrap().to_vec();
        let end = bad.len() - 1;
        bad[end] ^= 0x01;
        let good = pack(true, 3, 6, &list(&["y"])).unwrap();
        bad.extend_from_slice(&good);

        let mut deframer = Deframer::default();
        let packets = deframer.feed(&bad);
        assert_eq!(packets, vec![Packet::response(3, 6, list(&["y"]))]);
        assert_eq!(deframer.stats().crc_failures, 1);
    }

    #[test]
    fn disagreeing_length_copies_resync() {
        let mut bad = pack(false, 1, 1, &list(&["a"])).unwrap().to_vec();
        bad[5] ^= 0x01;
        let good = pack(false, 1, 2, &list(&["b"])).unwrap();
        bad.extend_from_slice(&good);

        let mut deframer = Deframer::default();
        let packets = deframer.feed(&bad);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].request_id, 2);
        assert!(deframer.stats().length_failures >= 1);
    }

    #[test]
    fn oversized_length_resyncs() {
        let big = pack(false, 1, 1, &Value::List(vec![Value::from(vec![0u8; 100])])).unwrap();
        let good = pack(false, 1, 2, &list(&["ok"])).unwrap();
        let mut wire = big.to_vec();
        wire.extend_from_slice(&good);

        let mut deframer = Deframer::new(64);
        let packets = deframer.feed(&wire);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].request_id, 2);
        assert!(deframer.stats().length_failures >= 1);
    }

    #[test]
    fn response_without_request_id_is_out_of_range() {
        let bad = pack(true, 1, 0, &list(&["a"])).unwrap();
        let good = pack(true, 1, 4, &list(&["b"])).unwrap();
        let mut wire = bad.to_vec();
        wire.extend_from_slice(&good);

        let mut deframer = Deframer::default();
        let packets = deframer.feed(&wire);
        assert_eq!(packets, vec![Packet::response(1, 4, list(&["b"]))]);
        assert_eq!(deframer.stats().range_failures, 1);
    }

    #[test]
    fn undecodable_content_with_valid_crc_resyncs() {
        // A scalar tag at top level passes the CRC but is not valid content.
        let bad = frame_with_content(false, 1, 1, &[packrpc_codec::tag::NULL]);
        let good = pack(false, 1, 2, &list(&["ok"])).unwrap();
        let mut wire = bad;
        wire.extend_from_slice(&good);

        let mut deframer = Deframer::default();
        let packets = deframer.feed(&wire);
        assert_eq!(packets.len(), 1);
        assert_eq!(deframer.stats().decode_failures, 1);
    }

    #[test]
    fn truncated_head_is_discarded() {
        let frame = pack(false, 1, 1, &list(&["lost"])).unwrap();
        let good = pack(false, 1, 2, &list(&["kept"])).unwrap();
        let mut wire = frame[5..].to_vec();
        wire.extend_from_slice(&good);

        let packets = Deframer::default().feed(&wire);
        assert_eq!(packets, vec![Packet::request(1, 2, list(&["kept"]))]);
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let frame = pack(false, 1, 1, &list(&["lost"])).unwrap();
        let good = pack(false, 1, 2, &list(&["kept"])).unwrap();

        for cut in [3, 6, 9, frame.len() - 4, frame.len() - 1] {
            let mut wire = frame[..cut].to_vec();
            wire.extend_from_slice(&good);
            for chunk in [1, 5, wire.len()] {
                let packets = feed_in_chunks(&mut Deframer::default(), &wire, chunk);
                assert_eq!(
                    packets,
                    vec![Packet::request(1, 2, list(&["kept"]))],
                    "cut {cut} chunk {chunk}"
                );
            }
        }
    }

    #[test]
    fn partial_frame_is_held_across_calls() {
        let frame = pack(false, 1, 1, &list(&["wait"])).unwrap();
        let mut deframer = Deframer::default();

        assert!(deframer.feed(&frame[..frame.len() - 2]).is_empty());
        assert!(!deframer.is_idle());
        assert!(deframer.buffered() > 0);

        let packets = deframer.feed(&frame[frame.len() - 2..]);
        assert_eq!(packets.len(), 1);
        assert!(deframer.is_idle());
        assert_eq!(deframer.buffered(), 0);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let frame = pack(false, 1, 1, &list(&["x"])).unwrap();
        let mut deframer = Deframer::default();
        deframer.feed(&frame[..6]);
        deframer.reset();
        assert!(deframer.is_idle());
        assert!(deframer.feed(&frame[6..]).is_empty());
        assert_eq!(deframer.feed(&frame).len(), 1);
    }

    #[test]
    fn empty_feed_is_a_no_op() {
        let mut deframer = Deframer::default();
        assert!(deframer.feed(&[]).is_empty());
        assert_eq!(deframer.stats(), DeframerStats::default());
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn frames() -> impl Strategy<Value = Vec<(bool, u16, u32, Vec<String>)>> {
            prop::collection::vec(
                (
                    any::<bool>(),
                    0u16..=16383,
                    1u32..=1_073_741_823,
                    prop::collection::vec("[a-z]{0,40}", 0..4),
                ),
                1..6,
            )
        }

        proptest! {
            #[test]
            fn prop_chunking_does_not_change_output(
                frames in frames(),
                noise in prop::collection::vec(any::<u8>(), 0..16),
                splits in prop::collection::vec(1usize..32, 1..64),
            ) {
                let mut wire = noise;
                for (is_response, type_id, request_id, items) in &frames {
                    let content: Value = items.iter().map(|s| Value::from(s.as_str())).collect();
                    wire.extend_from_slice(&pack(*is_response, *type_id, *request_id, &content).unwrap());
                }

                let whole = Deframer::default().feed(&wire);

                let mut chunked = Vec::new();
                let mut deframer = Deframer::default();
                let mut rest = wire.as_slice();
                let mut sizes = splits.iter().cycle();
                while !rest.is_empty() {
                    let take = (*sizes.next().unwrap()).min(rest.len());
                    deframer.feed_with(&rest[..take], |p| chunked.push(p));
                    rest = &rest[take..];
                }

                prop_assert_eq!(&whole, &chunked);
                prop_assert!(chunked.len() <= frames.len() + 1);
                let tail: Vec<u32> = chunked.iter().rev().take(frames.len()).map(|p| p.request_id).collect();
                let expected: Vec<u32> = frames.iter().rev().map(|f| f.2).take(tail.len()).collect();
                prop_assert_eq!(tail, expected);
            }
        }
    }
}
