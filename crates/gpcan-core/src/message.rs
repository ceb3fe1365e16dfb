//! Logical messages and CAN frames exchanged between the transports

use bytes::Bytes;
use thiserror::Error;

use crate::channel::{can_id, Channel};

/// Largest payload carried by one BLE characteristic write
pub const MAX_BLE_PAYLOAD: usize = 20;

/// Largest payload of a classic CAN frame
pub const MAX_CAN_DLC: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLong { len: usize, max: usize },

    #[error("CAN id 0x{0:X} is not an 11-bit identifier")]
    InvalidCanId(u16),
}

/// One BLE-sized unit of work on a channel
///
/// Built by the codec decoder, by CAN ingress or by a local caller; consumed
/// exactly once by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    channel: Channel,
    payload: Bytes,
}

impl LogicalMessage {
    pub fn new(channel: Channel, payload: &[u8]) -> Result<Self, MessageError> {
        Self::from_bytes(channel, Bytes::copy_from_slice(payload))
    }

    pub fn from_bytes(channel: Channel, payload: Bytes) -> Result<Self, MessageError> {
        if payload.len() > MAX_BLE_PAYLOAD {
            return Err(MessageError::PayloadTooLong {
                len: payload.len(),
                max: MAX_BLE_PAYLOAD,
            });
        }
        Ok(Self { channel, payload })
    }

    /// One-byte message on the control channel
    pub fn control(value: u8) -> Self {
        Self {
            channel: Channel::Control,
            payload: Bytes::copy_from_slice(&[value]),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Classic CAN frame with a standard identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub dlc: u8,
    pub data: [u8; MAX_CAN_DLC],
}

impl CanFrame {
    pub fn new(id: u16, data: &[u8]) -> Result<Self, MessageError> {
        if id > can_id::MAX_STANDARD {
            return Err(MessageError::InvalidCanId(id));
        }
        if data.len() > MAX_CAN_DLC {
            return Err(MessageError::PayloadTooLong {
                len: data.len(),
                max: MAX_CAN_DLC,
            });
        }
        let mut buf = [0u8; MAX_CAN_DLC];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    /// The fixed frame reported for oversize replies and rejected commands
    pub fn error_frame() -> Self {
        let mut data = [0u8; MAX_CAN_DLC];
        data[0] = 0xFF;
        Self {
            id: can_id::ERROR_REPLY,
            dlc: 1,
            data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.dlc as usize).min(MAX_CAN_DLC)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_message_rejects_oversize_payload() {
        assert!(LogicalMessage::new(Channel::Cmd, &[0u8; 20]).is_ok());
        assert_eq!(
            LogicalMessage::new(Channel::Cmd, &[0u8; 21]),
            Err(MessageError::PayloadTooLong { len: 21, max: 20 })
        );
    }

    #[test]
    fn can_frame_limits() {
        let frame = CanFrame::new(0x773, &[1, 2, 3]).unwrap();
        assert_eq!(frame.dlc, 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(CanFrame::new(0x800, &[]).is_err());
        assert!(CanFrame::new(0x773, &[0u8; 9]).is_err());
    }

    #[test]
    fn error_frame_is_fixed() {
        let frame = CanFrame::error_frame();
        assert_eq!(frame.id, 0x740);
        assert_eq!(frame.payload(), &[0xFF]);
    }
}
