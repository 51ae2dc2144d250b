//! Wire framing (§4.1): magic/command/length/checksum envelope around a
//! [`Message`] payload, plus the resumable decoder that turns a byte stream
//! from a peer into a sequence of framed messages.

pub mod message;
pub mod varint;

pub use message::{
    FilterLoadPayload, Message, NetworkAddress, RejectCode, RejectPayload, VersionPayload,
    MIN_FILTERED_BLOCK_VERSION, SERVICE_NODE_NETWORK,
};

use crate::error::CodecError;
use crate::hash::Hash256;
use bytes::{Buf, BufMut, BytesMut};

/// Maximum payload size a single frame may claim (§4.1).
pub const MAX_PAYLOAD_LEN: usize = 32 * 1024 * 1024;

const MAGIC_LEN: usize = 4;
const COMMAND_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC_LEN + COMMAND_LEN + 4 + 4;

/// Encode a complete frame: magic, fixed 12-byte command, payload length,
/// first-4-bytes-of-double-SHA256 checksum, then the payload itself.
pub fn encode_frame(magic: u32, message: &Message) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32_le(magic);
    out.put_slice(&command_bytes(message.command()));
    out.put_u32_le(payload.len() as u32);
    out.put_slice(&checksum(&payload));
    out.put_slice(&payload);
    out.to_vec()
}

fn command_bytes(command: &str) -> [u8; COMMAND_LEN] {
    let mut bytes = [0u8; COMMAND_LEN];
    let src = command.as_bytes();
    bytes[..src.len()].copy_from_slice(src);
    bytes
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Hash256::double_sha256(payload);
    [hash.0[0], hash.0[1], hash.0[2], hash.0[3]]
}

/// Phase of the resumable frame decoder (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning for the next occurrence of `magic` in the buffer.
    SeekingMagic,
    /// Magic found; waiting for the rest of the 20-byte header.
    ReadingHeader,
    /// Header parsed; waiting for `payload_len` bytes of payload.
    ReadingPayload,
}

#[derive(Debug, Clone)]
struct PendingHeader {
    command: String,
    payload_len: u32,
    checksum: [u8; 4],
}

/// A decoded frame: the raw command name (useful even when the payload
/// itself failed to parse) and the decoded message, if recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub message: Message,
}

/// Resumable decoder over a rolling byte buffer (§4.1).
///
/// Feed bytes as they arrive from the socket with [`FrameDecoder::feed`],
/// then repeatedly call [`FrameDecoder::next_frame`] until it returns
/// `Ok(None)`, meaning the buffer is exhausted and more bytes are needed.
/// A checksum failure or an oversize length both resume magic-scanning
/// rather than treating the connection as unrecoverable, per §4.1.
pub struct FrameDecoder {
    magic: u32,
    buffer: BytesMut,
    state: State,
    pending_header: Option<PendingHeader>,
    max_payload_len: usize,
}

impl FrameDecoder {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            buffer: BytesMut::new(),
            state: State::SeekingMagic,
            pending_header: None,
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempt to extract one frame from the buffered bytes.
    ///
    /// Returns `Ok(Some(frame))` on success, `Ok(None)` if more bytes are
    /// needed, or `Err` for a checksum mismatch or oversize payload — in
    /// both error cases the decoder has already resumed magic-scanning and
    /// the caller may call `next_frame` again immediately.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                State::SeekingMagic => {
                    if !self.seek_magic() {
                        return Ok(None);
                    }
                    self.state = State::ReadingHeader;
                }
                State::ReadingHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let mut header = self.buffer.split_to(HEADER_LEN);
                    header.advance(MAGIC_LEN);
                    let mut command_raw = [0u8; COMMAND_LEN];
                    header.copy_to_slice(&mut command_raw);
                    let command = command_from_bytes(&command_raw);
                    let payload_len = header.get_u32_le();
                    let mut checksum = [0u8; 4];
                    header.copy_to_slice(&mut checksum);

                    if payload_len as usize > self.max_payload_len {
                        self.state = State::SeekingMagic;
                        return Err(CodecError::OversizePayload {
                            len: payload_len as usize,
                            max: self.max_payload_len,
                        });
                    }

                    self.pending_header = Some(PendingHeader {
                        command,
                        payload_len,
                        checksum,
                    });
                    self.state = State::ReadingPayload;
                }
                State::ReadingPayload => {
                    let header = self.pending_header.as_ref().expect("set entering this state");
                    let needed = header.payload_len as usize;
                    if self.buffer.len() < needed {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(needed);
                    let header = self.pending_header.take().expect("checked above");
                    self.state = State::SeekingMagic;

                    if checksum(&payload) != header.checksum {
                        return Err(CodecError::ChecksumMismatch {
                            command: header.command,
                        });
                    }

                    let message = Message::decode_payload(&header.command, &payload)?;
                    return Ok(Some(Frame {
                        command: header.command,
                        message,
                    }));
                }
            }
        }
    }

    /// Advance past bytes until `self.buffer` starts with `self.magic`, or
    /// drain the buffer entirely if the magic never appears. Returns `true`
    /// once the buffer starts with the magic and has at least 4 bytes.
    fn seek_magic(&mut self) -> bool {
        let magic_bytes = self.magic.to_le_bytes();
        loop {
            if self.buffer.len() < MAGIC_LEN {
                return false;
            }
            if self.buffer[..MAGIC_LEN] == magic_bytes {
                return true;
            }
            self.buffer.advance(1);
        }
    }
}

fn command_from_bytes(raw: &[u8; COMMAND_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::message::VersionPayload;

    const TEST_MAGIC: u32 = 0xd9b4_bef9;

    fn sample_ping() -> Message {
        Message::Ping { nonce: 0x1122_3344_5566_7788 }
    }

    #[test]
    fn round_trips_a_single_frame() {
        let frame = encode_frame(TEST_MAGIC, &sample_ping());
        let mut decoder = FrameDecoder::new(TEST_MAGIC);
        decoder.feed(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.command, "ping");
        assert_eq!(decoded.message, sample_ping());
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn decodes_across_partial_feeds() {
        let frame = encode_frame(TEST_MAGIC, &sample_ping());
        let mut decoder = FrameDecoder::new(TEST_MAGIC);
        for chunk in frame.chunks(3) {
            decoder.feed(chunk);
        }
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.message, sample_ping());
    }

    #[test]
    fn resyncs_after_garbage_bytes() {
        let mut decoder = FrameDecoder::new(TEST_MAGIC);
        decoder.feed(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04, 0x05]);
        let frame = encode_frame(TEST_MAGIC, &sample_ping());
        decoder.feed(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.message, sample_ping());
    }

    #[test]
    fn checksum_mismatch_resumes_scanning() {
        let mut frame = encode_frame(TEST_MAGIC, &sample_ping());
        let last = frame.len() - 1;
        frame[last] ^= 0xff; // corrupt the payload without touching the header
        let mut decoder = FrameDecoder::new(TEST_MAGIC);
        decoder.feed(&frame);
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, CodecError::ChecksumMismatch { .. }));

        // The decoder should now be back in SeekingMagic and accept a fresh
        // well-formed frame appended after the corrupt one.
        let good = encode_frame(TEST_MAGIC, &sample_ping());
        decoder.feed(&good);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.message, sample_ping());
    }

    #[test]
    fn oversize_payload_length_is_rejected() {
        let mut header = BytesMut::new();
        header.put_u32_le(TEST_MAGIC);
        header.put_slice(b"ping\0\0\0\0\0\0\0\0");
        header.put_u32_le((MAX_PAYLOAD_LEN + 1) as u32);
        header.put_slice(&[0u8; 4]);

        let mut decoder = FrameDecoder::new(TEST_MAGIC);
        decoder.feed(&header);
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, CodecError::OversizePayload { .. }));
    }

    #[test]
    fn resync_with_ten_random_bytes_then_a_valid_ping_frame() {
        // Mirrors the concrete scenario: 10 bytes of noise followed by a
        // well-formed frame must still decode the valid frame.
        let mut decoder = FrameDecoder::new(TEST_MAGIC);
        decoder.feed(&[7u8; 10]);
        decoder.feed(&encode_frame(TEST_MAGIC, &sample_ping()));
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.message, sample_ping());
    }

    #[test]
    fn version_message_frame_round_trips() {
        let version = Message::Version(VersionPayload {
            protocol_version: 70015,
            services: SERVICE_NODE_NETWORK,
            timestamp: 1_700_000_000,
            receiver: NetworkAddress::new(0, std::net::IpAddr::from([127, 0, 0, 1]), 8333, None),
            sender: NetworkAddress::new(0, std::net::IpAddr::from([127, 0, 0, 1]), 8333, None),
            nonce: 1,
            user_agent: "/spv:0.1.0/".into(),
            start_height: 0,
            relay: true,
        });
        let frame = encode_frame(TEST_MAGIC, &version);
        let mut decoder = FrameDecoder::new(TEST_MAGIC);
        decoder.feed(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.message, version);
    }
}
