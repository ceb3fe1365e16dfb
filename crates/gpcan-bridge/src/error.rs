//! Bridge errors

use gpcan_core::{EnvelopeError, MessageError, PacketError};
use thiserror::Error;

use crate::transport::{BleError, TransportError};

/// Failure to hand a message to a topic
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The topic validator refused the message
    #[error("Message rejected by topic '{0}'")]
    Rejected(&'static str),

    /// A subscriber queue stayed full for the whole publish timeout
    #[error("Publish on topic '{0}' timed out")]
    Timeout(&'static str),

    #[error("Topic '{0}' subscriber closed")]
    Closed(&'static str),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ble(#[from] BleError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Message(#[from] MessageError),

    /// Previous inbound ISO-TP payload not consumed in time
    #[error("ISO-TP receive busy")]
    ReceiveBusy,

    /// A large reply is still being transmitted
    #[error("ISO-TP reply busy")]
    ReplyBusy,

    #[error("Cannot allocate {0} bytes for ISO-TP payload")]
    Allocation(usize),

    #[error("ISO-TP payload overflow: {received} bytes of announced {expected}")]
    Overflow { expected: usize, received: usize },
}
