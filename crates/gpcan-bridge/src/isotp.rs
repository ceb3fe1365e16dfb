//! ISO-TP bridge: large payloads between the CAN host and the camera
//!
//! Inbound, one reception runs at a time and the next one only starts once
//! the previous payload was consumed downstream. Outbound, a single reply
//! permit keeps at most one large reply in flight.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::transport::IsoTpLink;

enum Hold {
    Consumed(oneshot::Sender<()>),
    Permit(OwnedSemaphorePermit),
}

/// Hand-off marker travelling with a payload
///
/// The first holder to call [`release`](Self::release) frees the producer;
/// dropping every clone without releasing has the same effect.
#[derive(Clone)]
pub struct ReleaseToken {
    hold: Arc<Mutex<Option<Hold>>>,
}

impl ReleaseToken {
    fn new(hold: Hold) -> Self {
        Self {
            hold: Arc::new(Mutex::new(Some(hold))),
        }
    }

    /// Token whose release completes the returned receiver
    pub fn consumed() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(Hold::Consumed(tx)), rx)
    }

    /// Token holding a semaphore permit until released
    pub fn permit(permit: OwnedSemaphorePermit) -> Self {
        Self::new(Hold::Permit(permit))
    }

    pub fn release(&self) {
        if let Some(Hold::Consumed(tx)) = self.hold.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn is_released(&self) -> bool {
        self.hold.lock().is_none()
    }
}

impl std::fmt::Debug for ReleaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseToken")
            .field("released", &self.is_released())
            .finish()
    }
}

/// A complete payload received from the host
#[derive(Debug, Clone)]
pub struct InboundPayload {
    pub data: Bytes,
    /// Release once the payload has been handled
    pub token: ReleaseToken,
}

/// A large reply queued for the host
#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub data: Bytes,
    /// Reply permit, released when the transfer finished
    pub permit: ReleaseToken,
}

/// Receive side of the ISO-TP bridge
pub struct IsoTpReceiver {
    link: Arc<dyn IsoTpLink>,
    /// One reception at a time
    reception: tokio::sync::Mutex<()>,
    /// Completion of the last published payload
    consumed: Mutex<Option<oneshot::Receiver<()>>>,
    permit_timeout: Duration,
}

impl IsoTpReceiver {
    pub fn new(link: Arc<dyn IsoTpLink>, permit_timeout: Duration) -> Self {
        Self {
            link,
            reception: tokio::sync::Mutex::new(()),
            consumed: Mutex::new(None),
            permit_timeout,
        }
    }

    /// Receive one whole payload
    ///
    /// Fails with [`BridgeError::ReceiveBusy`] when another reception is
    /// running or the previous payload was not consumed within the permit
    /// timeout. A failed reception leaves nothing outstanding.
    pub async fn receive(&self) -> Result<InboundPayload, BridgeError> {
        let _reception = self
            .reception
            .try_lock()
            .map_err(|_| BridgeError::ReceiveBusy)?;

        self.wait_consumed().await?;

        let first = self.link.recv_segment().await?;
        let expected = first.data.len() + first.remaining;
        debug!(expected, "ISO-TP reception started");

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(expected)
            .map_err(|_| BridgeError::Allocation(expected))?;
        buffer.extend_from_slice(&first.data);

        let mut remaining = first.remaining;
        while remaining > 0 {
            let segment = self.link.recv_segment().await?;
            if buffer.len() + segment.data.len() > expected {
                return Err(BridgeError::Overflow {
                    expected,
                    received: buffer.len() + segment.data.len(),
                });
            }
            buffer.extend_from_slice(&segment.data);
            remaining = segment.remaining;
        }

        info!(received = buffer.len(), expected, "ISO-TP payload received");

        let (token, consumed) = ReleaseToken::consumed();
        *self.consumed.lock() = Some(consumed);

        Ok(InboundPayload {
            data: Bytes::from(buffer),
            token,
        })
    }

    /// True while a published payload has not been released
    pub fn is_outstanding(&self) -> bool {
        self.consumed.lock().is_some()
    }

    async fn wait_consumed(&self) -> Result<(), BridgeError> {
        let pending = self.consumed.lock().take();
        let Some(mut pending) = pending else {
            return Ok(());
        };

        // a dropped sender counts as consumed
        match tokio::time::timeout(self.permit_timeout, &mut pending).await {
            Ok(_) => Ok(()),
            Err(_) => {
                *self.consumed.lock() = Some(pending);
                warn!("Previous ISO-TP payload not consumed, reception refused");
                Err(BridgeError::ReceiveBusy)
            }
        }
    }
}

/// Reply permit of the transmit side
#[derive(Clone)]
pub struct ReplyPermits {
    semaphore: Arc<Semaphore>,
}

impl ReplyPermits {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the permit without waiting
    pub fn try_acquire(&self) -> Result<ReleaseToken, BridgeError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(ReleaseToken::permit)
            .map_err(|_| BridgeError::ReplyBusy)
    }

    pub fn available(&self) -> bool {
        self.semaphore.available_permits() > 0
    }
}

impl Default for ReplyPermits {
    fn default() -> Self {
        Self::new()
    }
}
