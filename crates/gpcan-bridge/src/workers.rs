//! Router workers, one task per direction of traffic

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gpcan_core::packet;
use gpcan_core::status::STARTUP_QUERIES;
use gpcan_core::{
    CanFrame, Channel, ConnectionEvent, Connectivity, ControlCommand, Envelope, EnvelopeTarget,
    LogicalMessage, Reassembler, MAX_BLE_PAYLOAD, MAX_CAN_DLC,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatch::{self, ReplyWarning};
use crate::error::{BridgeError, PublishError};
use crate::gate::AckOutcome;
use crate::isotp::{InboundPayload, IsoTpReceiver, OutboundReply};
use crate::router::Shared;
use crate::transport::{BleEvent, CanBus, IsoTpLink, TransportError, ATT_SUCCESS};

// =============================================================================
// BLE
// =============================================================================

/// Drain the command topics into the BLE link, one write per ack
///
/// The frames of a host payload are written back to back; commands queued
/// meanwhile wait for the payload to finish.
pub(crate) async fn ble_writer(
    shared: Arc<Shared>,
    mut commands: mpsc::Receiver<LogicalMessage>,
    mut batches: mpsc::Receiver<Vec<LogicalMessage>>,
) {
    loop {
        tokio::select! {
            biased;
            Some(msg) = commands.recv() => write_command(&shared, &msg).await,
            Some(batch) = batches.recv() => write_batch(&shared, &batch).await,
            else => break,
        }
    }
}

async fn write_command(shared: &Shared, msg: &LogicalMessage) {
    if msg.channel() == Channel::Control {
        match ControlCommand::from_message(msg) {
            Some(cmd) => run_control(shared, cmd).await,
            None => warn!(data = %hex::encode(msg.payload()), "Unknown control command"),
        }
        return;
    }

    if shared.state.connectivity() != Connectivity::Connected {
        debug!(channel = %msg.channel(), "Camera not connected, command dropped");
        return;
    }

    write_one(shared, msg).await;
}

async fn write_batch(shared: &Shared, batch: &[LogicalMessage]) {
    for (sent, msg) in batch.iter().enumerate() {
        if shared.state.connectivity() != Connectivity::Connected {
            warn!(
                channel = %msg.channel(),
                sent,
                frames = batch.len(),
                "Camera disconnected, rest of host payload dropped"
            );
            return;
        }
        write_one(shared, msg).await;
    }
}

async fn write_one(shared: &Shared, msg: &LogicalMessage) {
    let channel = msg.channel();
    if !shared.gates.is_subscribed(channel) {
        debug!(%channel, "Writing before notifications are enabled");
    }
    if !shared.gates.begin(channel) {
        warn!(%channel, "Previous write still marked pending");
    }

    debug!(%channel, data = %hex::encode(msg.payload()), "BLE write");
    if let Err(e) = shared.ble.write(channel, msg.payload()).await {
        shared.gates.cancel(channel);
        warn!(%channel, error = %e, "BLE write failed");
        return;
    }

    match shared
        .gates
        .wait_ack(channel, shared.timing.ble_ack_timeout())
        .await
    {
        AckOutcome::Acked | AckOutcome::NotApplicable => {}
        AckOutcome::TimedOut => warn!(%channel, "BLE write not acknowledged, continuing"),
    }
}

async fn run_control(shared: &Shared, cmd: ControlCommand) {
    info!(?cmd, "Control command");
    let result = match cmd {
        ControlCommand::ForgetPairing => shared.ble.forget_pairing().await,
        ControlCommand::ForceConnect => shared.ble.force_connect().await,
        ControlCommand::RequestName => {
            let name = shared.state.snapshot().name.unwrap_or_default();
            if let Err(e) = shared
                .send_large_reply(Channel::Control, name.into_bytes())
                .await
            {
                warn!(error = %e, "Camera name not sent");
            }
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(?cmd, error = %e, "Control command failed");
    }
}

/// React to BLE stack events
pub(crate) async fn ble_events(shared: Arc<Shared>, mut events: broadcast::Receiver<BleEvent>) {
    let mut reassembler = Reassembler::new();
    let idle = shared.timing.idle_timeout();

    loop {
        let next = match idle {
            Some(idle) => match tokio::time::timeout(idle, events.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    on_idle(&shared, &mut reassembler);
                    continue;
                }
            },
            None => events.recv().await,
        };

        match next {
            Ok(event) => on_ble_event(&shared, &mut reassembler, event).await,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "BLE events lagged"),
            Err(RecvError::Closed) => {
                debug!("BLE event stream closed");
                break;
            }
        }
    }
}

fn on_idle(shared: &Shared, reassembler: &mut Reassembler) {
    match shared.state.connectivity() {
        Connectivity::Connected | Connectivity::Unknown => {}
        _ => {
            shared.state.apply(ConnectionEvent::IdleTimeout);
            reassembler.reset();
        }
    }
}

async fn on_ble_event(shared: &Arc<Shared>, reassembler: &mut Reassembler, event: BleEvent) {
    match event {
        BleEvent::Advertisement { status, name } => {
            shared.state.apply(ConnectionEvent::Advertised(status));
            if let Some(name) = name {
                shared.state.update(|s| s.name = Some(name));
            }
        }
        BleEvent::Connected => {
            shared.state.apply(ConnectionEvent::Connected);
            schedule_startup_queries(shared);
        }
        BleEvent::Subscribed(channel) => shared.gates.set_subscribed(channel, true),
        BleEvent::Unsubscribed(channel) => shared.gates.set_subscribed(channel, false),
        BleEvent::Notification { channel, data } => {
            on_notification(shared, reassembler, channel, &data).await
        }
        BleEvent::WriteComplete { channel, status } => {
            if status != ATT_SUCCESS {
                warn!(%channel, status, "BLE write completed with error");
            }
            if !shared.gates.complete(channel) {
                debug!(%channel, "Write completion without pending write");
            }
        }
        BleEvent::AuthFailed => {
            shared.state.apply(ConnectionEvent::AuthFailed);
        }
        BleEvent::Disconnected => {
            shared.state.apply(ConnectionEvent::Disconnected);
            shared.cancel_startup();
            shared.gates.reset();
            reassembler.reset();
        }
    }
}

fn schedule_startup_queries(shared: &Arc<Shared>) {
    let delay = shared.timing.startup_query_delay();
    let task_shared = shared.clone();

    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        debug!(count = STARTUP_QUERIES.len(), "Sending startup queries");
        for (channel, body) in STARTUP_QUERIES {
            let result = match LogicalMessage::new(*channel, body) {
                Ok(msg) => task_shared.submit_command(msg).await.map_err(BridgeError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(%channel, error = %e, "Startup query not queued");
            }
        }
    });

    if let Some(previous) = shared.startup.lock().replace(task) {
        previous.abort();
    }
}

async fn on_notification(
    shared: &Shared,
    reassembler: &mut Reassembler,
    channel: Channel,
    data: &[u8],
) {
    debug!(%channel, data = %hex::encode(data), "BLE notification");

    // every frame that starts a message is also answered on CAN
    let starts_message = packet::decode(data).is_ok_and(|header| !header.is_continuation());
    if starts_message && data.len() <= MAX_BLE_PAYLOAD {
        match LogicalMessage::new(channel, data) {
            Ok(msg) => {
                if let Err(e) = shared
                    .topics
                    .incoming_reply
                    .publish(msg, shared.timing.publish_timeout())
                    .await
                {
                    warn!(%channel, error = %e, "Reply not forwarded");
                }
            }
            Err(e) => warn!(%channel, error = %e, "Invalid notification"),
        }
    }

    match reassembler.push(channel, data) {
        Ok(Some(msg)) => {
            dispatch::demux(&msg, &shared.state);
            if msg.frames > 1 || data.len() > MAX_CAN_DLC {
                if let Err(e) = shared.send_large_reply(channel, msg.body).await {
                    warn!(%channel, error = %e, "Large reply not forwarded");
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!(%channel, error = %e, "Notification dropped"),
    }
}

// =============================================================================
// CAN
// =============================================================================

/// Forward host frames on the input identifiers to the command topic
pub(crate) async fn can_ingress(shared: Arc<Shared>, mut frames: broadcast::Receiver<CanFrame>) {
    loop {
        match frames.recv().await {
            Ok(frame) => on_can_frame(&shared, frame).await,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "CAN receive lagged"),
            Err(RecvError::Closed) => {
                debug!("CAN receive stream closed");
                break;
            }
        }
    }
}

async fn on_can_frame(shared: &Shared, frame: CanFrame) {
    let Some(channel) = Channel::from_input_can_id(frame.id) else {
        return;
    };
    let msg = match LogicalMessage::new(channel, frame.payload()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(can_id = format!("0x{:03X}", frame.id), error = %e, "Invalid CAN frame");
            return;
        }
    };

    debug!(%channel, data = %hex::encode(frame.payload()), "Command from CAN");
    match shared.submit_command(msg).await {
        Ok(()) => {}
        Err(PublishError::Rejected(_)) => {
            warn!(
                %channel,
                state = ?shared.state.connectivity(),
                "Command rejected, camera not connected"
            );
            if let Err(e) = shared.publish_can_frame(CanFrame::error_frame()).await {
                warn!(error = %e, "Error frame not queued");
            }
        }
        Err(e) => warn!(%channel, error = %e, "Command dropped"),
    }
}

/// Turn single-frame replies into CAN frames on the reply identifiers
pub(crate) async fn reply_mapper(shared: Arc<Shared>, mut replies: mpsc::Receiver<LogicalMessage>) {
    while let Some(msg) = replies.recv().await {
        let channel = msg.channel();
        let Some(reply) = dispatch::reply_frame(channel, msg.payload()) else {
            continue;
        };

        match reply.warning {
            Some(ReplyWarning::LengthMismatch { declared, len }) => {
                warn!(%channel, declared, len, "Reply length byte mismatch, using frame length")
            }
            Some(ReplyWarning::Oversize { len }) => {
                warn!(%channel, len, "Reply does not fit a CAN frame, sending error frame")
            }
            None => {}
        }

        if let Err(e) = shared.publish_can_frame(reply.frame).await {
            warn!(%channel, error = %e, "Reply frame not queued");
        }
    }
}

/// Periodic camera status frame
pub(crate) async fn heartbeat(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.timing.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let frame = dispatch::heartbeat_frame(&shared.state);
        if let Err(e) = shared.publish_can_frame(frame).await {
            debug!(error = %e, "Heartbeat not queued");
        }
    }
}

/// Write queued frames to the bus
///
/// Failures are logged once until the bus recovers.
pub(crate) async fn can_egress(
    shared: Arc<Shared>,
    can: Arc<dyn CanBus>,
    mut frames: mpsc::Receiver<CanFrame>,
) {
    let timeout = shared.timing.can_send_timeout();
    let mut failing = false;

    while let Some(frame) = frames.recv().await {
        let result = match tokio::time::timeout(timeout, can.send(&frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "CAN frame 0x{:03X} not sent within {:?}",
                frame.id, timeout
            ))),
        };

        match result {
            Ok(()) if failing => {
                info!("CAN transmit recovered");
                failing = false;
            }
            Ok(()) => {}
            Err(e) if !failing => {
                error!(can_id = format!("0x{:03X}", frame.id), error = %e, "CAN transmit failed");
                failing = true;
            }
            Err(e) => debug!(can_id = format!("0x{:03X}", frame.id), error = %e, "CAN transmit failed"),
        }
    }
}

// =============================================================================
// ISO-TP
// =============================================================================

/// Receive host payloads and publish them for the envelope consumer
pub(crate) async fn isotp_receive(shared: Arc<Shared>, receiver: IsoTpReceiver) {
    loop {
        match receiver.receive().await {
            Ok(payload) => {
                // a payload that never reaches a consumer is released on drop
                if let Err(e) = shared
                    .topics
                    .isotp_inbound
                    .publish(payload, shared.timing.publish_timeout())
                    .await
                {
                    warn!(error = %e, "ISO-TP payload dropped");
                }
            }
            Err(BridgeError::ReceiveBusy) => {}
            Err(BridgeError::Transport(TransportError::ConnectionClosed)) => {
                debug!("ISO-TP link closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "ISO-TP reception failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Decode host envelopes and act on them
pub(crate) async fn isotp_consume(shared: Arc<Shared>, mut payloads: mpsc::Receiver<InboundPayload>) {
    while let Some(payload) = payloads.recv().await {
        if let Err(e) = consume_envelope(&shared, &payload.data).await {
            warn!(len = payload.data.len(), error = %e, "Host payload dropped");
        }
        payload.token.release();
    }
}

async fn consume_envelope(shared: &Shared, data: &Bytes) -> Result<(), BridgeError> {
    let envelope = Envelope::from_bytes(data)?;

    match envelope.target()? {
        EnvelopeTarget::Channel(Channel::Control) => {
            let msg = LogicalMessage::new(Channel::Control, &envelope.data)?;
            shared.submit_command(msg).await?;
        }
        EnvelopeTarget::Channel(channel) => {
            let msgs = packet::encode_messages(channel, &envelope.data)?;
            debug!(%channel, len = envelope.data.len(), frames = msgs.len(), "Host payload to camera");
            shared.submit_batch(msgs).await?;
        }
        EnvelopeTarget::WifiCredentials => {
            let creds = envelope.wifi()?;
            info!(ssid = %creds.ssid, "Wi-Fi credentials updated");
            shared.state.update(|s| {
                s.wifi_ssid = Some(creds.ssid);
                s.wifi_pass = Some(creds.password);
            });
        }
    }
    Ok(())
}

/// Send queued large replies to the host, releasing the reply permit after each
pub(crate) async fn isotp_transmit(
    shared: Arc<Shared>,
    link: Arc<dyn IsoTpLink>,
    mut replies: mpsc::Receiver<OutboundReply>,
) {
    let timeout = shared.timing.isotp_send_timeout();

    while let Some(reply) = replies.recv().await {
        debug!(len = reply.data.len(), "ISO-TP reply");
        match tokio::time::timeout(timeout, link.send(&reply.data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(len = reply.data.len(), error = %e, "ISO-TP reply failed"),
            Err(_) => error!(len = reply.data.len(), "ISO-TP reply timed out"),
        }
        reply.permit.release();
    }
}
