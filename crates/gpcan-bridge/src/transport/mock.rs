//! Mock transports for testing and demo mode

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gpcan_core::{CanFrame, Channel};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};

use super::{
    BleError, BleEvent, BleLink, CanBus, IsoTpLink, IsoTpSegment, TransportError, ATT_SUCCESS,
};
use crate::config::MockConfig;

// =============================================================================
// BLE
// =============================================================================

/// Mock camera link
///
/// Records every write. With auto-ack on (the default) each write is
/// completed immediately; canned responses are sent back as notifications.
pub struct MockBleLink {
    events_tx: broadcast::Sender<BleEvent>,
    writes: RwLock<Vec<(Channel, Vec<u8>)>>,
    auto_ack: AtomicBool,
    connected: AtomicBool,
    forget_calls: AtomicUsize,
    force_connect_calls: AtomicUsize,
    /// (channel, request) -> notification frames
    responses: RwLock<Vec<(Channel, Vec<u8>, Vec<Vec<u8>>)>>,
}

impl MockBleLink {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            events_tx,
            writes: RwLock::new(Vec::new()),
            auto_ack: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            forget_calls: AtomicUsize::new(0),
            force_connect_calls: AtomicUsize::new(0),
            responses: RwLock::new(Vec::new()),
        }
    }

    /// Inject an event as if raised by the BLE stack
    pub fn inject(&self, event: BleEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn inject_notification(&self, channel: Channel, data: &[u8]) {
        self.inject(BleEvent::Notification {
            channel,
            data: Bytes::copy_from_slice(data),
        });
    }

    /// Answer writes of `request` on `channel` with these notification frames
    pub fn add_response(&self, channel: Channel, request: Vec<u8>, frames: Vec<Vec<u8>>) {
        self.responses.write().push((channel, request, frames));
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(Channel, Vec<u8>)> {
        self.writes.read().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.read().len()
    }

    pub fn forget_calls(&self) -> usize {
        self.forget_calls.load(Ordering::SeqCst)
    }

    pub fn force_connect_calls(&self) -> usize {
        self.force_connect_calls.load(Ordering::SeqCst)
    }

    fn find_response(&self, channel: Channel, data: &[u8]) -> Option<Vec<Vec<u8>>> {
        self.responses
            .read()
            .iter()
            .find(|(ch, req, _)| *ch == channel && req.as_slice() == data)
            .map(|(_, _, frames)| frames.clone())
    }
}

impl Default for MockBleLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleLink for MockBleLink {
    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), BleError> {
        if !channel.is_ble() {
            return Err(BleError::NoCharacteristic(channel));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BleError::NotConnected);
        }

        self.writes.write().push((channel, data.to_vec()));

        if self.auto_ack.load(Ordering::SeqCst) {
            self.inject(BleEvent::WriteComplete {
                channel,
                status: ATT_SUCCESS,
            });
        }
        if let Some(frames) = self.find_response(channel, data) {
            for frame in frames {
                self.inject_notification(channel, &frame);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BleEvent> {
        self.events_tx.subscribe()
    }

    async fn forget_pairing(&self) -> Result<(), BleError> {
        self.forget_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn force_connect(&self) -> Result<(), BleError> {
        self.force_connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// CAN
// =============================================================================

/// Mock CAN bus recording every sent frame
pub struct MockCanBus {
    incoming_tx: broadcast::Sender<CanFrame>,
    sent_tx: broadcast::Sender<CanFrame>,
    sent: RwLock<Vec<CanFrame>>,
    failing: AtomicBool,
}

impl MockCanBus {
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(256);
        let (sent_tx, _) = broadcast::channel(1024);
        Self {
            incoming_tx,
            sent_tx,
            sent: RwLock::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Inject a frame as if received from the bus
    pub fn inject_incoming(&self, frame: CanFrame) {
        let _ = self.incoming_tx.send(frame);
    }

    /// Watch frames as they are sent
    pub fn subscribe_sent(&self) -> broadcast::Receiver<CanFrame> {
        self.sent_tx.subscribe()
    }

    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.read().clone()
    }

    /// Make every send fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for MockCanBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CanBus for MockCanBus {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("bus off".to_string()));
        }
        self.sent.write().push(*frame);
        let _ = self.sent_tx.send(*frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }
}

// =============================================================================
// ISO-TP
// =============================================================================

/// Mock ISO-TP address pair
pub struct MockIsoTpLink {
    segments_tx: mpsc::UnboundedSender<Result<IsoTpSegment, TransportError>>,
    segments_rx: Mutex<mpsc::UnboundedReceiver<Result<IsoTpSegment, TransportError>>>,
    sent_tx: broadcast::Sender<Vec<u8>>,
    sent: RwLock<Vec<Vec<u8>>>,
    latency: RwLock<Duration>,
}

impl MockIsoTpLink {
    pub fn new(config: &MockConfig) -> Self {
        let (segments_tx, segments_rx) = mpsc::unbounded_channel();
        let (sent_tx, _) = broadcast::channel(64);
        Self {
            segments_tx,
            segments_rx: Mutex::new(segments_rx),
            sent_tx,
            sent: RwLock::new(Vec::new()),
            latency: RwLock::new(Duration::from_millis(config.latency_ms)),
        }
    }

    pub fn inject_segment(&self, data: &[u8], remaining: usize) {
        let _ = self.segments_tx.send(Ok(IsoTpSegment {
            data: Bytes::copy_from_slice(data),
            remaining,
        }));
    }

    /// Queue a whole transfer split into segments of `segment_len` bytes
    pub fn inject_payload(&self, payload: &[u8], segment_len: usize) {
        let segment_len = segment_len.max(1);
        let mut remaining = payload.len();
        for chunk in payload.chunks(segment_len) {
            remaining -= chunk.len();
            self.inject_segment(chunk, remaining);
        }
    }

    /// Queue a receive error
    pub fn inject_error(&self) {
        let _ = self
            .segments_tx
            .send(Err(TransportError::ReceiveFailed("segment lost".to_string())));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn subscribe_sent(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sent_tx.subscribe()
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.read().clone()
    }
}

impl Default for MockIsoTpLink {
    fn default() -> Self {
        Self::new(&MockConfig::default())
    }
}

#[async_trait]
impl IsoTpLink for MockIsoTpLink {
    async fn recv_segment(&self) -> Result<IsoTpSegment, TransportError> {
        self.segments_rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(TransportError::ConnectionClosed))
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.sent.write().push(data.to_vec());
        let _ = self.sent_tx.send(data.to_vec());
        Ok(())
    }
}
