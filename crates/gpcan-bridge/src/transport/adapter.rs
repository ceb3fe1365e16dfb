//! Transport traits and the events they produce

use async_trait::async_trait;
use bytes::Bytes;
use gpcan_core::{AdvertisedStatus, CanFrame, Channel};
use tokio::sync::broadcast;

use super::{BleError, TransportError};

/// ATT status reported for a successful write
pub const ATT_SUCCESS: u8 = 0;

/// Events raised by the BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    /// Advertisement seen from the camera
    Advertisement {
        status: AdvertisedStatus,
        name: Option<String>,
    },
    /// Security established and all characteristics discovered
    Connected,
    /// Notifications enabled on a channel's notify characteristic
    Subscribed(Channel),
    Unsubscribed(Channel),
    /// One notification (a single link-layer frame, at most 20 bytes)
    Notification { channel: Channel, data: Bytes },
    /// Completion of the last write on a channel
    WriteComplete { channel: Channel, status: u8 },
    AuthFailed,
    Disconnected,
}

/// GATT client side of the camera link
///
/// Connection management, discovery and bonding live behind this trait;
/// the bridge only writes frames and reacts to events.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Start a write on a channel's write characteristic
    ///
    /// Returns once the write is queued; completion is reported as
    /// [`BleEvent::WriteComplete`].
    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), BleError>;

    /// Subscribe to link events
    fn subscribe(&self) -> broadcast::Receiver<BleEvent>;

    /// Remove the stored bond
    async fn forget_pairing(&self) -> Result<(), BleError>;

    /// Connect without waiting for an "online" advertisement
    async fn force_connect(&self) -> Result<(), BleError>;
}

/// Raw CAN bus carrying single frames
#[async_trait]
pub trait CanBus: Send + Sync {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Subscribe to frames received from the bus
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;
}

/// One piece of an ISO-TP transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoTpSegment {
    pub data: Bytes,
    /// Bytes of the transfer still to come after this segment
    pub remaining: usize,
}

/// One ISO-TP address pair
#[async_trait]
pub trait IsoTpLink: Send + Sync {
    /// Wait for the next segment of an inbound transfer
    async fn recv_segment(&self) -> Result<IsoTpSegment, TransportError>;

    /// Send a whole payload, returning once the transfer finished
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;
}
