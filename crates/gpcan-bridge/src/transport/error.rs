//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("BLE link not connected")]
    NotConnected,

    #[error("Channel {0} has no BLE characteristic")]
    NoCharacteristic(gpcan_core::Channel),

    #[error("BLE write failed: {0}")]
    WriteFailed(String),

    #[error("BLE operation failed: {0}")]
    OperationFailed(String),
}
