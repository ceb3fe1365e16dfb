//! Local bridge commands carried on the control channel

use crate::channel::Channel;
use crate::message::LogicalMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Drop the stored bond with the camera
    ForgetPairing,
    /// Connect to the camera even if it is not advertising as online
    ForceConnect,
    /// Send the camera name back over the large-payload path
    RequestName,
}

impl ControlCommand {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0xDA => Some(Self::ForgetPairing),
            0xAF => Some(Self::ForceConnect),
            0xBB => Some(Self::RequestName),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Self::ForgetPairing => 0xDA,
            Self::ForceConnect => 0xAF,
            Self::RequestName => 0xBB,
        }
    }

    /// A control message is exactly one byte on the control channel
    pub fn from_message(msg: &LogicalMessage) -> Option<Self> {
        match (msg.channel(), msg.payload()) {
            (Channel::Control, [value]) => Self::from_byte(*value),
            _ => None,
        }
    }

    pub fn to_message(self) -> LogicalMessage {
        LogicalMessage::control(self.byte())
    }
}
