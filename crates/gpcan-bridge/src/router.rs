//! Bridge router
//!
//! Owns the topics and the shared device state, and spawns one worker per
//! direction of traffic:
//!
//! ```text
//!  CAN 0x772..0x77A ──► outgoing-command ──► BLE writer ──► camera
//!  camera ──► BLE events ──► incoming-reply ──► reply mapper ──► outgoing-can-frame ──► CAN
//!                        └─► large replies ──► isotp-outbound ──► ISO-TP 0x783
//!  ISO-TP 0x753 ──► isotp-inbound ──► envelope consumer ──► outgoing-batch ──► BLE writer
//!  heartbeat timer ──► outgoing-can-frame
//! ```

use std::sync::Arc;

use bytes::Bytes;
use gpcan_core::{
    CanFrame, Channel, Connectivity, DeviceStateHandle, Envelope, LogicalMessage, MAX_BLE_PAYLOAD,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BridgeConfig, TimingConfig};
use crate::error::{BridgeError, PublishError};
use crate::gate::WriteGates;
use crate::isotp::{InboundPayload, IsoTpReceiver, OutboundReply, ReplyPermits};
use crate::topic::Topic;
use crate::transport::{BleLink, CanBus, IsoTpLinks};
use crate::workers;

/// Topic names as they appear in logs and errors
pub mod topic_name {
    pub const OUTGOING_COMMAND: &str = "outgoing-command";
    pub const OUTGOING_BATCH: &str = "outgoing-batch";
    pub const OUTGOING_CAN_FRAME: &str = "outgoing-can-frame";
    pub const INCOMING_REPLY: &str = "incoming-reply";
    pub const ISOTP_INBOUND: &str = "isotp-inbound";
    pub const ISOTP_OUTBOUND: &str = "isotp-outbound";
}

/// Whether a command may be queued for the camera
///
/// Control commands are handled locally and pass in any state; everything
/// else needs a connected camera.
pub fn command_allowed(msg: &LogicalMessage, state: &DeviceStateHandle) -> bool {
    if msg.len() > MAX_BLE_PAYLOAD {
        return false;
    }
    match msg.channel() {
        Channel::Control => true,
        _ => state.connectivity() == Connectivity::Connected,
    }
}

pub struct Topics {
    pub outgoing_command: Topic<LogicalMessage>,
    /// Multi-frame host payloads, one queue slot per payload
    pub outgoing_batch: Topic<Vec<LogicalMessage>>,
    pub outgoing_can_frame: Topic<CanFrame>,
    pub incoming_reply: Topic<LogicalMessage>,
    pub isotp_inbound: Topic<InboundPayload>,
    pub isotp_outbound: Topic<OutboundReply>,
}

impl Topics {
    fn new(state: &DeviceStateHandle) -> Self {
        let command_state = state.clone();
        let batch_state = state.clone();
        Self {
            outgoing_command: Topic::with_validator(
                topic_name::OUTGOING_COMMAND,
                move |msg: &LogicalMessage| command_allowed(msg, &command_state),
            ),
            outgoing_batch: Topic::with_validator(
                topic_name::OUTGOING_BATCH,
                move |msgs: &Vec<LogicalMessage>| {
                    !msgs.is_empty() && msgs.iter().all(|m| command_allowed(m, &batch_state))
                },
            ),
            outgoing_can_frame: Topic::new(topic_name::OUTGOING_CAN_FRAME),
            incoming_reply: Topic::new(topic_name::INCOMING_REPLY),
            isotp_inbound: Topic::new(topic_name::ISOTP_INBOUND),
            isotp_outbound: Topic::new(topic_name::ISOTP_OUTBOUND),
        }
    }
}

/// State shared by every worker
pub(crate) struct Shared {
    pub timing: TimingConfig,
    pub state: DeviceStateHandle,
    pub topics: Topics,
    pub gates: WriteGates,
    pub replies: ReplyPermits,
    pub ble: Arc<dyn BleLink>,
    /// Pending startup query task of the current connection
    pub startup: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub async fn submit_command(&self, msg: LogicalMessage) -> Result<(), PublishError> {
        self.topics
            .outgoing_command
            .publish(msg, self.timing.publish_timeout())
            .await
    }

    /// Queue the frames of one host payload; the writer keeps them together
    pub async fn submit_batch(&self, msgs: Vec<LogicalMessage>) -> Result<(), PublishError> {
        self.topics
            .outgoing_batch
            .publish(msgs, self.timing.publish_timeout())
            .await
    }

    pub async fn publish_can_frame(&self, frame: CanFrame) -> Result<(), PublishError> {
        self.topics
            .outgoing_can_frame
            .publish(frame, self.timing.publish_timeout())
            .await
    }

    /// Wrap `body` in an envelope and queue it for the ISO-TP reply link
    ///
    /// Fails with [`BridgeError::ReplyBusy`] while the previous reply is
    /// still being transmitted.
    pub async fn send_large_reply(&self, channel: Channel, body: Vec<u8>) -> Result<(), BridgeError> {
        let permit = self.replies.try_acquire().map_err(|e| {
            warn!(%channel, len = body.len(), "Large reply dropped, previous one still in flight");
            e
        })?;

        let data = Bytes::from(Envelope::new(channel, body).to_bytes());
        self.topics
            .isotp_outbound
            .publish(OutboundReply { data, permit }, self.timing.publish_timeout())
            .await?;
        Ok(())
    }

    pub fn cancel_startup(&self) {
        if let Some(task) = self.startup.lock().take() {
            task.abort();
        }
    }
}

/// Cloneable handle for code outside the router (CLI, tests, BLE glue)
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl BridgeHandle {
    pub fn state(&self) -> DeviceStateHandle {
        self.shared.state.clone()
    }

    /// Queue a command for the camera, subject to the connectivity gate
    pub async fn submit_command(&self, msg: LogicalMessage) -> Result<(), PublishError> {
        self.shared.submit_command(msg).await
    }

    pub async fn send_large_reply(&self, channel: Channel, body: Vec<u8>) -> Result<(), BridgeError> {
        self.shared.send_large_reply(channel, body).await
    }

    /// Tap the frames queued for the CAN bus
    pub fn subscribe_can_frames(&self, capacity: usize) -> mpsc::Receiver<CanFrame> {
        self.shared.topics.outgoing_can_frame.subscribe(capacity)
    }

    pub fn is_write_pending(&self, channel: Channel) -> bool {
        self.shared.gates.is_pending(channel)
    }
}

/// The transports a router runs on
pub struct Transports {
    pub ble: Arc<dyn BleLink>,
    pub can: Arc<dyn CanBus>,
    pub isotp: IsoTpLinks,
}

/// Running bridge; dropping it stops every worker
pub struct Router {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Router {
    /// Subscribe every worker to its topic, then spawn them
    pub fn start(config: &BridgeConfig, transports: Transports) -> Self {
        Self::start_with_state(config, transports, DeviceStateHandle::new())
    }

    pub fn start_with_state(
        config: &BridgeConfig,
        transports: Transports,
        state: DeviceStateHandle,
    ) -> Self {
        let Transports { ble, can, isotp } = transports;
        let depth = config.queue_depth;

        let shared = Arc::new(Shared {
            timing: config.timing.clone(),
            topics: Topics::new(&state),
            state,
            gates: WriteGates::new(),
            replies: ReplyPermits::new(),
            ble: ble.clone(),
            startup: Mutex::new(None),
        });

        // all subscriptions exist before the first message can be published
        let commands = shared.topics.outgoing_command.subscribe(depth);
        let batches = shared.topics.outgoing_batch.subscribe(depth);
        let ble_events = ble.subscribe();
        let can_incoming = can.subscribe();
        let replies = shared.topics.incoming_reply.subscribe(depth);
        let can_outgoing = shared.topics.outgoing_can_frame.subscribe(depth);
        let inbound = shared.topics.isotp_inbound.subscribe(depth);
        let outbound = shared.topics.isotp_outbound.subscribe(depth);
        let receiver = IsoTpReceiver::new(isotp.inbound, shared.timing.isotp_permit_timeout());

        let workers = vec![
            tokio::spawn(workers::ble_writer(shared.clone(), commands, batches)),
            tokio::spawn(workers::ble_events(shared.clone(), ble_events)),
            tokio::spawn(workers::can_ingress(shared.clone(), can_incoming)),
            tokio::spawn(workers::reply_mapper(shared.clone(), replies)),
            tokio::spawn(workers::heartbeat(shared.clone())),
            tokio::spawn(workers::can_egress(shared.clone(), can, can_outgoing)),
            tokio::spawn(workers::isotp_receive(shared.clone(), receiver)),
            tokio::spawn(workers::isotp_consume(shared.clone(), inbound)),
            tokio::spawn(workers::isotp_transmit(shared.clone(), isotp.reply, outbound)),
        ];

        info!(workers = workers.len(), "Bridge router started");
        Self { shared, workers }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> DeviceStateHandle {
        self.shared.state.clone()
    }

    pub async fn submit_command(&self, msg: LogicalMessage) -> Result<(), PublishError> {
        self.shared.submit_command(msg).await
    }

    pub async fn send_large_reply(&self, channel: Channel, body: Vec<u8>) -> Result<(), BridgeError> {
        self.shared.send_large_reply(channel, body).await
    }

    pub fn subscribe_can_frames(&self, capacity: usize) -> mpsc::Receiver<CanFrame> {
        self.shared.topics.outgoing_can_frame.subscribe(capacity)
    }

    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.cancel_startup();
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        info!("Bridge router stopped");
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}
