//! SocketCAN raw-frame bus and ISO-TP links

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gpcan_core::CanFrame;
use parking_lot::Mutex;
use socketcan::{CanFrame as RawFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use socketcan_isotp::IsoTpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::transport::{CanBus, IsoTpLink, IsoTpSegment, TransportError};

/// Attempts for a write that keeps returning WouldBlock (1 ms apart)
const WRITE_RETRIES: usize = 1000;

fn standard_id(id: u16) -> Result<StandardId, TransportError> {
    StandardId::new(id)
        .ok_or_else(|| TransportError::InvalidConfig(format!("Invalid standard CAN ID: 0x{:X}", id)))
}

// =============================================================================
// Raw CAN
// =============================================================================

/// Raw CAN socket carrying the single-frame traffic
pub struct SocketCanBus {
    interface: String,
    socket: Arc<Mutex<CanSocket>>,
    incoming_tx: broadcast::Sender<CanFrame>,
    running: Arc<AtomicBool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanBus {
    pub fn new(interface: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                interface, e
            ))
        })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        let (incoming_tx, _) = broadcast::channel(1024);

        let bus = Self {
            interface: interface.to_string(),
            socket: Arc::new(Mutex::new(socket)),
            incoming_tx,
            running: Arc::new(AtomicBool::new(true)),
            listener_handle: Mutex::new(None),
        };
        bus.start_listener();
        Ok(bus)
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let incoming_tx = self.incoming_tx.clone();
        let running = self.running.clone();
        let interface = self.interface.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(frame) => {
                        // only standard data frames carry bridge traffic
                        if !matches!(frame, RawFrame::Data(_)) || frame.is_extended() {
                            continue;
                        }
                        let id = frame.raw_id() as u16;
                        match CanFrame::new(id, frame.data()) {
                            Ok(frame) => {
                                let _ = incoming_tx.send(frame);
                            }
                            Err(e) => debug!(error = %e, "Ignoring CAN frame"),
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!(interface = %interface, error = %e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!(interface = %interface, "SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }
}

#[async_trait]
impl CanBus for SocketCanBus {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let raw = RawFrame::new(standard_id(frame.id)?, frame.payload()).ok_or_else(|| {
            TransportError::SendFailed(format!("Cannot build CAN frame 0x{:03X}", frame.id))
        })?;
        let socket = self.socket.clone();

        tokio::task::spawn_blocking(move || {
            for _ in 0..WRITE_RETRIES {
                match socket.lock().write_frame(&raw) {
                    Ok(()) => return Ok(()),
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => return Err(TransportError::SendFailed(e.to_string())),
                }
            }
            Err(TransportError::Timeout("CAN transmit queue full".to_string()))
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
    }
}

// =============================================================================
// ISO-TP
// =============================================================================

/// One ISO-TP address pair
///
/// The kernel reassembles transfers, so every read yields a whole payload
/// delivered as a single segment.
pub struct SocketIsoTpLink {
    rx_id: u16,
    socket: Arc<Mutex<IsoTpSocket>>,
    payloads_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    running: Arc<AtomicBool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketIsoTpLink {
    /// Open a link listening on `rx_id` and transmitting on `tx_id`
    pub fn new(interface: &str, rx_id: u16, tx_id: u16) -> Result<Self, TransportError> {
        let mut socket = IsoTpSocket::open(interface, standard_id(rx_id)?, standard_id(tx_id)?)
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to open ISO-TP socket: {}", e))
            })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        // drop transfers left over from a previous run
        while let Ok(data) = socket.read() {
            if data.is_empty() {
                break;
            }
            debug!(len = data.len(), "Drained stale ISO-TP payload");
        }

        let (payloads_tx, payloads_rx) = mpsc::channel(4);
        let link = Self {
            rx_id,
            socket: Arc::new(Mutex::new(socket)),
            payloads_rx: tokio::sync::Mutex::new(payloads_rx),
            running: Arc::new(AtomicBool::new(true)),
            listener_handle: Mutex::new(None),
        };
        link.start_listener(payloads_tx);
        Ok(link)
    }

    fn start_listener(&self, payloads_tx: mpsc::Sender<Vec<u8>>) {
        let socket = self.socket.clone();
        let running = self.running.clone();
        let rx_id = self.rx_id;

        let handle = tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let result = socket.lock().read().map(|data| data.to_vec());
                match result {
                    Ok(data) if !data.is_empty() => {
                        debug!(
                            rx_id = format!("0x{:03X}", rx_id),
                            len = data.len(),
                            "ISO-TP payload received"
                        );
                        if payloads_tx.blocking_send(data).is_err() {
                            break;
                        }
                    }
                    Ok(_) => std::thread::sleep(Duration::from_millis(1)),
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!(rx_id = format!("0x{:03X}", rx_id), error = %e, "ISO-TP read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!(rx_id = format!("0x{:03X}", rx_id), "ISO-TP listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }
}

#[async_trait]
impl IsoTpLink for SocketIsoTpLink {
    async fn recv_segment(&self) -> Result<IsoTpSegment, TransportError> {
        let data = self
            .payloads_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)?;
        Ok(IsoTpSegment {
            data: Bytes::from(data),
            remaining: 0,
        })
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.clone();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            for _ in 0..WRITE_RETRIES {
                match socket.lock().write(&data) {
                    Ok(()) => return Ok(()),
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => return Err(TransportError::SendFailed(e.to_string())),
                }
            }
            Err(TransportError::Timeout("ISO-TP transmit busy".to_string()))
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }
}

impl Drop for SocketIsoTpLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
    }
}
