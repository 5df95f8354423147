//! Serial API frame encoder/decoder.
//!
//! # Frame format
//!
//! ```text
//! SOF <len> <type> <function> [<payload>...] <checksum>
//! ```
//!
//! - `SOF`: `0x01`
//! - `len`: number of bytes that follow, checksum included
//! - `type`: `0x00` request, `0x01` response
//! - `checksum`: `0xFF` XOR every byte from `len` through the payload
//!
//! ACK/NAK/CAN travel as lone bytes between frames and are reported as
//! [`DecodeEvent::Control`].

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::constants::{
    CHECKSUM_SEED, MAX_FRAME_LENGTH, MIN_FRAME_LENGTH, REQUEST, RESPONSE, SOF,
};
use super::control::ControlByte;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Direction/role of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Request,
    Response,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            REQUEST => Some(Self::Request),
            RESPONSE => Some(Self::Response),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Request => REQUEST,
            Self::Response => RESPONSE,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Request => write!(f, "REQ"),
            FrameType::Response => write!(f, "RES"),
        }
    }
}

/// A decoded data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Largest payload that still fits the length byte.
    pub const MAX_PAYLOAD: usize = (MAX_FRAME_LENGTH - MIN_FRAME_LENGTH) as usize;

    pub fn request(function: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Request,
            function,
            payload,
        }
    }

    pub fn response(function: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Response,
            function,
            payload,
        }
    }

    pub fn is_request(&self) -> bool {
        self.frame_type == FrameType::Request
    }

    pub fn is_response(&self) -> bool {
        self.frame_type == FrameType::Response
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > Self::MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
                max: Self::MAX_PAYLOAD,
            });
        }

        let mut buf = Vec::with_capacity(self.payload.len() + 5);
        buf.push(SOF);
        buf.push(self.payload.len() as u8 + MIN_FRAME_LENGTH);
        buf.push(self.frame_type.as_byte());
        buf.push(self.function);
        buf.extend_from_slice(&self.payload);
        buf.push(checksum(&buf[1..]));
        Ok(buf)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} func=0x{:02X} [{}]",
            self.frame_type,
            self.function,
            hex_dump(&self.payload)
        )
    }
}

/// XOR checksum over `bytes`, seeded with `0xFF`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b)
}

/// Space-separated upper-case hex.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of a single decode attempt on a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete, valid data frame.
    Frame { frame: Frame, consumed: usize },
    /// A lone control byte.
    Control { control: ControlByte, consumed: usize },
    /// Not enough bytes yet. `skipped` leading bytes were noise and may be dropped.
    Incomplete { skipped: usize },
    /// Corrupt frame start (bad checksum, length or type).
    ///
    /// `consumed` covers leading noise plus the SOF byte only, so decoding
    /// resumes right after the false start.
    ChecksumError { consumed: usize },
}

/// Decode the first frame or control byte in `buf`.
///
/// Bytes that are neither SOF nor a control byte are skipped.
pub fn decode(buf: &[u8]) -> DecodeResult {
    let skip = buf
        .iter()
        .position(|&b| b == SOF || ControlByte::from_byte(b).is_some())
        .unwrap_or(buf.len());
    let rest = &buf[skip..];

    let Some(&first) = rest.first() else {
        return DecodeResult::Incomplete { skipped: skip };
    };

    if let Some(control) = ControlByte::from_byte(first) {
        return DecodeResult::Control {
            control,
            consumed: skip + 1,
        };
    }

    let Some(&len) = rest.get(1) else {
        return DecodeResult::Incomplete { skipped: skip };
    };
    if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&len) {
        return DecodeResult::ChecksumError { consumed: skip + 1 };
    }

    let Some(&type_byte) = rest.get(2) else {
        return DecodeResult::Incomplete { skipped: skip };
    };
    let Some(frame_type) = FrameType::from_byte(type_byte) else {
        return DecodeResult::ChecksumError { consumed: skip + 1 };
    };

    let total = len as usize + 2;
    if rest.len() < total {
        return DecodeResult::Incomplete { skipped: skip };
    }

    let body = &rest[1..total - 1];
    if checksum(body) != rest[total - 1] {
        return DecodeResult::ChecksumError { consumed: skip + 1 };
    }

    DecodeResult::Frame {
        frame: Frame {
            frame_type,
            function: rest[3],
            payload: rest[4..total - 1].to_vec(),
        },
        consumed: skip + total,
    }
}

/// Event produced by [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    Frame(Frame),
    Control(ControlByte),
    /// A corrupt frame was dropped; the peer should be sent a NAK.
    ChecksumError,
}

/// Streaming decoder that tolerates partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    partial_since: Option<Instant>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next event, or `None` if more bytes are needed.
    pub fn next_event(&mut self) -> Option<DecodeEvent> {
        self.next_event_at(Instant::now())
    }

    fn next_event_at(&mut self, now: Instant) -> Option<DecodeEvent> {
        match decode(&self.buf) {
            DecodeResult::Frame { frame, consumed } => {
                self.consume(consumed);
                Some(DecodeEvent::Frame(frame))
            }
            DecodeResult::Control { control, consumed } => {
                self.consume(consumed);
                Some(DecodeEvent::Control(control))
            }
            DecodeResult::ChecksumError { consumed } => {
                tracing::warn!(
                    dropped = %hex_dump(&self.buf[..consumed]),
                    "Frame checksum error, resynchronising"
                );
                self.consume(consumed);
                Some(DecodeEvent::ChecksumError)
            }
            DecodeResult::Incomplete { skipped } => {
                if skipped > 0 {
                    self.buf.drain(..skipped);
                }
                if self.buf.is_empty() {
                    self.partial_since = None;
                } else if self.partial_since.is_none() {
                    self.partial_since = Some(now);
                }
                None
            }
        }
    }

    /// Lazily drain every event currently decodable.
    pub fn events(&mut self) -> impl Iterator<Item = DecodeEvent> + '_ {
        std::iter::from_fn(move || self.next_event())
    }

    /// Drop a partial frame that has been waiting longer than `timeout`.
    ///
    /// Only the stale SOF byte is discarded; anything behind it is decoded again.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> bool {
        match self.partial_since {
            Some(since) if now.saturating_duration_since(since) >= timeout => {
                tracing::warn!(
                    buffered = self.buf.len(),
                    "Partial frame timed out, discarding start byte"
                );
                self.consume(1);
                true
            }
            _ => false,
        }
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.partial_since = None;
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.partial_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::request(FUNC_ID_ZW_GET_VERSION, vec![]),
            Frame::response(FUNC_ID_ZW_MEMORY_GET_ID, vec![0xC0, 0xFF, 0xEE, 0x42, 0x01]),
            Frame::request(
                FUNC_ID_ZW_SEND_DATA,
                vec![0x05, 0x03, 0x25, 0x01, 0xFF, TRANSMIT_OPTIONS, 0x0A],
            ),
            Frame::request(FUNC_ID_APPLICATION_COMMAND_HANDLER, vec![0x00; Frame::MAX_PAYLOAD]),
        ]
    }

    #[test]
    fn test_encode_layout() {
        let bytes = Frame::request(FUNC_ID_ZW_GET_VERSION, vec![]).encode().unwrap();
        assert_eq!(bytes, vec![0x01, 0x03, 0x00, 0x15, 0xE9]);
    }

    #[test]
    fn test_roundtrip() {
        for frame in sample_frames() {
            let bytes = frame.encode().unwrap();
            match decode(&bytes) {
                DecodeResult::Frame { frame: decoded, consumed } => {
                    assert_eq!(decoded, frame);
                    assert_eq!(consumed, bytes.len());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_payload_too_large() {
        let frame = Frame::request(0x13, vec![0; Frame::MAX_PAYLOAD + 1]);
        assert!(matches!(
            frame.encode(),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_incomplete_then_complete() {
        let bytes = Frame::response(FUNC_ID_ZW_MEMORY_GET_ID, vec![1, 2, 3, 4, 5])
            .encode()
            .unwrap();
        let mut decoder = FrameDecoder::new();
        for &b in &bytes[..bytes.len() - 1] {
            decoder.push(&[b]);
            assert_eq!(decoder.next_event(), None);
        }
        decoder.push(&bytes[bytes.len() - 1..]);
        assert!(matches!(decoder.next_event(), Some(DecodeEvent::Frame(_))));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_control_bytes_between_frames() {
        let frame = Frame::request(FUNC_ID_ZW_GET_VERSION, vec![]);
        let mut stream = vec![ACK];
        stream.extend(frame.encode().unwrap());
        stream.push(NAK);
        stream.push(CAN);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        let events: Vec<_> = decoder.events().collect();
        assert_eq!(
            events,
            vec![
                DecodeEvent::Control(ControlByte::Ack),
                DecodeEvent::Frame(frame),
                DecodeEvent::Control(ControlByte::Nak),
                DecodeEvent::Control(ControlByte::Can),
            ]
        );
    }

    #[test]
    fn test_noise_is_skipped() {
        let frame = Frame::request(FUNC_ID_ZW_GET_VERSION, vec![]);
        let mut stream = vec![0x42, 0x99];
        stream.extend(frame.encode().unwrap());
        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert_eq!(decoder.next_event(), Some(DecodeEvent::Frame(frame)));
    }

    /// Frames whose bytes after SOF never look like a marker, so a single
    /// corruption can only ever affect the frame it lands in.
    fn marker_free_frames() -> Vec<Vec<u8>> {
        // 0xFE and 0xA4 turn into SOF under the two corruption masks below.
        let forbidden = [SOF, ACK, NAK, CAN, 0xFE, 0xA4];
        (0u8..=0xFF)
            .map(|seed| {
                Frame::request(
                    0x30 + (seed % 0x20),
                    vec![seed, seed.wrapping_add(0x11), seed.wrapping_mul(3)],
                )
                .encode()
                .unwrap()
            })
            .filter(|bytes| bytes[1..].iter().all(|b| !forbidden.contains(b)))
            .take(3)
            .collect()
    }

    #[test]
    fn test_resync_after_single_corrupted_byte() {
        let frames = marker_free_frames();
        assert_eq!(frames.len(), 3);

        for mask in [0xFFu8, 0xA5] {
            for pos in 0..frames[0].len() {
                let mut stream = frames[0].clone();
                stream[pos] ^= mask;
                stream.extend(&frames[1]);
                stream.extend(&frames[2]);

                let mut decoder = FrameDecoder::new();
                decoder.push(&stream);
                let decoded: Vec<Vec<u8>> = decoder
                    .events()
                    .filter_map(|e| match e {
                        DecodeEvent::Frame(f) => Some(f.encode().unwrap()),
                        _ => None,
                    })
                    .collect();

                assert_eq!(
                    decoded,
                    vec![frames[1].clone(), frames[2].clone()],
                    "mask {:02X} at byte {}",
                    mask,
                    pos
                );
            }
        }
    }

    #[test]
    fn test_checksum_error_event() {
        let mut bytes = Frame::request(FUNC_ID_ZW_GET_VERSION, vec![]).encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_event(), Some(DecodeEvent::ChecksumError));
    }

    #[test]
    fn test_expire_partial_frame() {
        let start = Instant::now();
        let mut decoder = FrameDecoder::new();
        decoder.push(&[SOF, 0x10, REQUEST, 0x13]);
        assert_eq!(decoder.next_event_at(start), None);
        assert!(!decoder.expire(start, Duration::from_millis(100)));
        assert!(decoder.expire(start + Duration::from_millis(150), Duration::from_millis(100)));
        assert_eq!(decoder.buffered(), 3);
    }
}
