//! Link-layer packet codec for the camera BLE protocol
//!
//! Every BLE write/notification is at most 20 bytes. A logical message body
//! (feature, action, payload) that does not fit is split into a start frame
//! followed by continuation frames.
//!
//! ```text
//! byte0 bit7 = 1            continuation   [1sss_nnnn] + up to 19 body bytes (nnnn = seq)
//! byte0 bits6..5 = 00       5-bit length   [000L_LLLL] feature action payload...
//! byte0 bits6..5 = 01       13-bit length  [001L_LLLL][LLLL_LLLL] feature action payload...
//! byte0 bits6..5 = 10       16-bit length  [0100_0000][LLLL_LLLL][LLLL_LLLL] feature action payload...
//! byte0 bits6..5 = 11       invalid
//! ```
//!
//! The declared length counts the whole body: feature + action + payload
//! bytes across all frames.

use thiserror::Error;

use crate::channel::Channel;
use crate::message::{LogicalMessage, MAX_BLE_PAYLOAD};

/// Continuation frame marker
const CONTINUATION_BIT: u8 = 0x80;
const CLASS_MASK: u8 = 0x60;
const CLASS_SHIFT: u8 = 5;
const SHORT_LEN_MASK: u8 = 0x1F;
const SEQ_MASK: u8 = 0x0F;

/// Largest body a 5-bit frame carries in one write
pub const SHORT_MAX_BODY: usize = MAX_BLE_PAYLOAD - 1;
/// Bodies at or above this length switch from the 13-bit to the 16-bit class
pub const MEDIUM_LIMIT: usize = 0x1FFF;
/// Largest body describable by the 16-bit class
pub const LONG_MAX_BODY: usize = 0xFFFF;
/// Body bytes carried by one continuation frame
pub const CONTINUATION_CHUNK: usize = MAX_BLE_PAYLOAD - 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Empty frame")]
    Empty,

    #[error("Invalid packet class in header byte 0x{0:02X}")]
    InvalidClass(u8),

    #[error("Frame of {len} bytes is shorter than its {header_len}-byte header")]
    Truncated { len: usize, header_len: usize },

    #[error("Body of {0} bytes exceeds the 16-bit length field")]
    PayloadTooLarge(usize),
}

/// Frame class derived from the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// 5-bit declared length, 1-byte header
    Short,
    /// 13-bit declared length, 2-byte header
    Medium,
    /// 16-bit declared length, 3-byte header
    Long,
    /// Tail of a message started by a previous frame
    Continuation,
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub class: PacketClass,
    /// Body length (feature + action + payload) of the whole message; 0 for continuations
    pub declared_len: usize,
    pub header_len: usize,
    pub feature: Option<u8>,
    pub action: Option<u8>,
    /// Sequence number of a continuation frame (wraps 0..=15)
    pub seq: Option<u8>,
}

impl PacketHeader {
    pub fn is_continuation(&self) -> bool {
        self.class == PacketClass::Continuation
    }

    /// Offset of the first payload byte inside the frame
    pub fn payload_offset(&self) -> usize {
        if self.is_continuation() {
            self.header_len
        } else {
            self.header_len + 2
        }
    }

    /// Payload length of the whole message, excluding feature and action
    pub fn payload_len(&self) -> usize {
        self.declared_len.saturating_sub(2)
    }
}

/// Classify a frame and read its header fields
pub fn decode(frame: &[u8]) -> Result<PacketHeader, PacketError> {
    let byte0 = *frame.first().ok_or(PacketError::Empty)?;

    if byte0 & CONTINUATION_BIT != 0 {
        return Ok(PacketHeader {
            class: PacketClass::Continuation,
            declared_len: 0,
            header_len: 1,
            feature: None,
            action: None,
            seq: Some(byte0 & SEQ_MASK),
        });
    }

    let (class, header_len) = match (byte0 & CLASS_MASK) >> CLASS_SHIFT {
        0 => (PacketClass::Short, 1),
        1 => (PacketClass::Medium, 2),
        2 => (PacketClass::Long, 3),
        _ => return Err(PacketError::InvalidClass(byte0)),
    };

    if frame.len() < header_len {
        return Err(PacketError::Truncated {
            len: frame.len(),
            header_len,
        });
    }

    let declared_len = match class {
        PacketClass::Short => (byte0 & SHORT_LEN_MASK) as usize,
        PacketClass::Medium => (((byte0 & SHORT_LEN_MASK) as usize) << 8) | frame[1] as usize,
        _ => ((frame[1] as usize) << 8) | frame[2] as usize,
    };

    Ok(PacketHeader {
        class,
        declared_len,
        header_len,
        feature: frame.get(header_len).copied(),
        action: frame.get(header_len + 1).copied(),
        seq: None,
    })
}

/// Split a message body into frames, each at most 20 bytes
///
/// Bodies up to 19 bytes produce one 5-bit frame. Longer bodies start with a
/// 13-bit (or, from 8191 bytes, 16-bit) frame filled to 20 bytes and continue
/// in 19-byte continuation frames.
pub fn encode_body(body: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
    let len = body.len();

    if len <= SHORT_MAX_BODY {
        let mut frame = Vec::with_capacity(len + 1);
        frame.push(len as u8 & SHORT_LEN_MASK);
        frame.extend_from_slice(body);
        return Ok(vec![frame]);
    }

    let header: Vec<u8> = if len < MEDIUM_LIMIT {
        vec![(1 << CLASS_SHIFT) | ((len >> 8) as u8 & SHORT_LEN_MASK), len as u8]
    } else if len <= LONG_MAX_BODY {
        vec![2 << CLASS_SHIFT, (len >> 8) as u8, len as u8]
    } else {
        return Err(PacketError::PayloadTooLarge(len));
    };

    let first_chunk = MAX_BLE_PAYLOAD - header.len();
    let (head, tail) = body.split_at(first_chunk);

    let mut frames = Vec::with_capacity(2 + tail.len() / CONTINUATION_CHUNK);
    let mut first = header;
    first.extend_from_slice(head);
    frames.push(first);

    for (seq, chunk) in tail.chunks(CONTINUATION_CHUNK).enumerate() {
        let mut frame = Vec::with_capacity(chunk.len() + 1);
        frame.push(CONTINUATION_BIT | (seq as u8 & SEQ_MASK));
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }

    Ok(frames)
}

/// Frame a `(feature, action, payload)` message
pub fn encode(feature: u8, action: u8, payload: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
    let mut body = Vec::with_capacity(payload.len() + 2);
    body.push(feature);
    body.push(action);
    body.extend_from_slice(payload);
    encode_body(&body)
}

/// Frame a body into logical messages ready for the BLE write queue
pub fn encode_messages(channel: Channel, body: &[u8]) -> Result<Vec<LogicalMessage>, PacketError> {
    encode_body(body)?
        .into_iter()
        .map(|frame| {
            // encode_body never emits more than MAX_BLE_PAYLOAD bytes per frame
            LogicalMessage::new(channel, &frame).map_err(|_| PacketError::PayloadTooLarge(body.len()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(frames: &[Vec<u8>]) -> Vec<u8> {
        let first = decode(&frames[0]).unwrap();
        let mut body = frames[0][first.header_len..].to_vec();
        for (i, frame) in frames[1..].iter().enumerate() {
            let hdr = decode(frame).unwrap();
            assert!(hdr.is_continuation());
            assert_eq!(hdr.seq, Some((i % 16) as u8));
            body.extend_from_slice(&frame[1..]);
        }
        assert_eq!(body.len(), first.declared_len);
        body
    }

    #[test]
    fn decode_short_frame() {
        let hdr = decode(&[0x04, 0xF1, 0x69, 0x01, 0x02]).unwrap();
        assert_eq!(hdr.class, PacketClass::Short);
        assert_eq!(hdr.declared_len, 4);
        assert_eq!(hdr.header_len, 1);
        assert_eq!(hdr.feature, Some(0xF1));
        assert_eq!(hdr.action, Some(0x69));
        assert_eq!(hdr.payload_offset(), 3);
        assert_eq!(hdr.payload_len(), 2);
    }

    #[test]
    fn decode_medium_frame() {
        let hdr = decode(&[0x21, 0x2C, 0x02, 0x83, 0xAA]).unwrap();
        assert_eq!(hdr.class, PacketClass::Medium);
        assert_eq!(hdr.declared_len, 0x12C);
        assert_eq!(hdr.feature, Some(0x02));
        assert_eq!(hdr.action, Some(0x83));
        assert_eq!(hdr.payload_offset(), 4);
    }

    #[test]
    fn decode_long_frame() {
        let hdr = decode(&[0x40, 0x20, 0x00, 0xF5, 0xEE]).unwrap();
        assert_eq!(hdr.class, PacketClass::Long);
        assert_eq!(hdr.declared_len, 0x2000);
        assert_eq!(hdr.header_len, 3);
        assert_eq!(hdr.payload_offset(), 5);
    }

    #[test]
    fn decode_continuation_and_invalid() {
        let hdr = decode(&[0x8F, 1, 2, 3]).unwrap();
        assert!(hdr.is_continuation());
        assert_eq!(hdr.seq, Some(0x0F));
        assert_eq!(hdr.feature, None);

        assert_eq!(decode(&[0x60, 0, 0]), Err(PacketError::InvalidClass(0x60)));
        assert_eq!(decode(&[]), Err(PacketError::Empty));
        assert_eq!(
            decode(&[0x40, 0x01]),
            Err(PacketError::Truncated {
                len: 2,
                header_len: 3
            })
        );
    }

    #[test]
    fn seventeen_byte_payload_is_single_short_frame() {
        let frames = encode(0x02, 0x0B, &[0x55; 17]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 20);
        assert_eq!(frames[0][0], 19);
    }

    #[test]
    fn eighteen_byte_payload_uses_medium_class() {
        let frames = encode(0x02, 0x0B, &[0x55; 18]).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][..2], [0x20, 20]);
        // 2-byte header + feature + action + 16 payload bytes
        assert_eq!(frames[0].len(), 20);
        assert_eq!(frames[1], vec![0x80, 0x55, 0x55]);
    }

    #[test]
    fn continuation_frames_split_at_nineteen_bytes() {
        let payload: Vec<u8> = (0..16 + 19 + 5).map(|i| i as u8).collect();
        let frames = encode(0xF5, 0xEE, &payload).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].len(), 20);
        assert_eq!(frames[1][0], 0x80);
        assert_eq!(frames[2].len(), 6);
        assert_eq!(frames[2][0], 0x81);
    }

    #[test]
    fn sequence_numbers_wrap_every_sixteen_frames() {
        let frames = encode(0x02, 0x83, &vec![0xA5; 16 + 19 * 17]).unwrap();
        assert_eq!(frames.len(), 18);
        assert_eq!(frames[16][0], 0x8F);
        assert_eq!(frames[17][0], 0x80);
    }

    #[test]
    fn round_trip_across_class_boundaries() {
        for n in [0usize, 1, 17, 18, 35, 36, 300, 8188, 8189, 8190] {
            let payload: Vec<u8> = (0..n).map(|i| (i * 7) as u8).collect();
            let frames = encode(0x3C, 0x01, &payload).unwrap();
            assert!(frames.iter().all(|f| f.len() <= MAX_BLE_PAYLOAD));
            let body = reassemble(&frames);
            assert_eq!(body[0], 0x3C);
            assert_eq!(body[1], 0x01);
            assert_eq!(&body[2..], &payload[..], "payload of {} bytes", n);
        }
    }

    #[test]
    fn long_class_starts_at_8191_byte_body() {
        let frames = encode(0x01, 0x02, &[0u8; 8188]).unwrap();
        assert_eq!(decode(&frames[0]).unwrap().class, PacketClass::Medium);

        let frames = encode(0x01, 0x02, &[0u8; 8189]).unwrap();
        let hdr = decode(&frames[0]).unwrap();
        assert_eq!(hdr.class, PacketClass::Long);
        assert_eq!(hdr.declared_len, 8191);
    }

    #[test]
    fn oversized_body_is_rejected() {
        assert_eq!(
            encode_body(&vec![0u8; LONG_MAX_BODY + 1]),
            Err(PacketError::PayloadTooLarge(LONG_MAX_BODY + 1))
        );
    }

    #[test]
    fn encode_messages_keeps_channel() {
        let msgs = encode_messages(Channel::Net, &[0x02, 0x02, 1, 2, 3]).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].channel(), Channel::Net);
        assert_eq!(msgs[0].payload(), &[0x05, 0x02, 0x02, 1, 2, 3]);
    }
}
