//! Router tests over the mock transports
//!
//! Each test starts a full router (all workers) against a mock camera, a
//! mock CAN bus and two mock ISO-TP links, then drives it from the outside.

use std::sync::Arc;
use std::time::Duration;

use gpcan_bridge::config::TimingConfig;
use gpcan_bridge::transport::mock::{MockBleLink, MockCanBus, MockIsoTpLink};
use gpcan_bridge::transport::{BleEvent, IsoTpLinks};
use gpcan_bridge::{BridgeConfig, BridgeError, Router, Transports};
use gpcan_core::packet;
use gpcan_core::{AdvertisedStatus, CanFrame, Channel, Connectivity, Envelope, LogicalMessage};
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    router: Router,
    camera: Arc<MockBleLink>,
    bus: Arc<MockCanBus>,
    inbound: Arc<MockIsoTpLink>,
    reply: Arc<MockIsoTpLink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_timing(|_| {})
    }

    fn with_timing(tune: impl FnOnce(&mut TimingConfig)) -> Self {
        let mut config = BridgeConfig::default();
        config.timing.heartbeat_interval_ms = 10_000;
        // keep the startup queries out of the way unless a test wants them
        config.timing.startup_query_delay_ms = 60_000;
        tune(&mut config.timing);

        let camera = Arc::new(MockBleLink::new());
        let bus = Arc::new(MockCanBus::new());
        let inbound = Arc::new(MockIsoTpLink::default());
        let reply = Arc::new(MockIsoTpLink::default());

        let router = Router::start(
            &config,
            Transports {
                ble: camera.clone(),
                can: bus.clone(),
                isotp: IsoTpLinks {
                    inbound: inbound.clone(),
                    reply: reply.clone(),
                },
            },
        );

        Self {
            router,
            camera,
            bus,
            inbound,
            reply,
        }
    }

    async fn connect(&self) {
        self.camera.inject(BleEvent::Connected);
        let state = self.router.state();
        assert!(wait_until(|| state.connectivity() == Connectivity::Connected).await);
    }

    fn frames_with_id(&self, id: u16) -> Vec<CanFrame> {
        self.bus
            .sent_frames()
            .into_iter()
            .filter(|f| f.id == id)
            .collect()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn can(id: u16, data: &[u8]) -> CanFrame {
    CanFrame::new(id, data).unwrap()
}

// =============================================================================
// Single-frame traffic
// =============================================================================

#[tokio::test]
async fn command_while_disconnected_gets_one_error_frame() {
    let h = Harness::new();

    h.bus.inject_incoming(can(0x772, &[0x01, 0x05]));

    assert!(wait_until(|| !h.frames_with_id(0x740).is_empty()).await);
    sleep(Duration::from_millis(50)).await;

    let errors = h.frames_with_id(0x740);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload(), &[0xFF]);
    assert_eq!(h.camera.write_count(), 0);
}

#[tokio::test]
async fn query_while_disconnected_gets_one_error_frame() {
    let h = Harness::new();

    h.bus.inject_incoming(can(0x776, &[0x02, 0x13, 0x00]));

    assert!(wait_until(|| !h.frames_with_id(0x740).is_empty()).await);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(h.frames_with_id(0x740).len(), 1);
    assert!(h.frames_with_id(0x777).is_empty());
    assert_eq!(h.camera.write_count(), 0);
}

#[tokio::test]
async fn force_connect_is_accepted_while_disconnected() {
    let h = Harness::new();

    h.bus.inject_incoming(can(0x77A, &[0xAF]));

    assert!(wait_until(|| h.camera.force_connect_calls() == 1).await);
    assert!(h.frames_with_id(0x740).is_empty());
    assert_eq!(h.camera.write_count(), 0);
}

#[tokio::test]
async fn forget_pairing_reaches_ble_stack() {
    let h = Harness::new();

    h.bus.inject_incoming(can(0x77A, &[0xDA]));

    assert!(wait_until(|| h.camera.forget_calls() == 1).await);
}

#[tokio::test]
async fn command_and_reply_round_trip() {
    let h = Harness::new();
    h.camera.add_response(
        Channel::Cmd,
        vec![0x03, 0x01, 0x01, 0x01],
        vec![vec![0x02, 0x01, 0x00]],
    );
    h.connect().await;

    h.bus.inject_incoming(can(0x772, &[0x03, 0x01, 0x01, 0x01]));

    assert!(wait_until(|| !h.frames_with_id(0x773).is_empty()).await);
    assert_eq!(h.camera.writes(), vec![(Channel::Cmd, vec![0x03, 0x01, 0x01, 0x01])]);

    let reply = h.frames_with_id(0x773)[0];
    assert_eq!(reply.dlc, 3);
    assert_eq!(reply.payload(), &[0x02, 0x01, 0x00]);
}

#[tokio::test]
async fn reply_with_foreign_length_byte_keeps_raw_length() {
    let h = Harness::new();
    h.connect().await;

    // first byte announces five bytes, the frame carries three
    h.camera.inject_notification(Channel::Settings, &[0x05, 0x02, 0x00]);
    assert!(wait_until(|| !h.frames_with_id(0x775).is_empty()).await);
    sleep(Duration::from_millis(50)).await;

    let replies = h.frames_with_id(0x775);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].dlc, 3);
    assert_eq!(replies[0].payload(), &[0x05, 0x02, 0x00]);

    // complete 13-bit frame; its first byte is not a frame length either
    h.camera
        .inject_notification(Channel::Settings, &[0x20, 0x03, 0x02, 0x00, 0x01]);
    assert!(wait_until(|| h.frames_with_id(0x775).len() == 2).await);

    let reply = h.frames_with_id(0x775)[1];
    assert_eq!(reply.dlc, 5);
    assert_eq!(reply.payload(), &[0x20, 0x03, 0x02, 0x00, 0x01]);
}

#[tokio::test]
async fn writes_are_single_flight_per_channel() {
    let h = Harness::with_timing(|t| t.ble_ack_timeout_ms = 5_000);
    h.camera.set_auto_ack(false);
    h.connect().await;

    let handle = h.router.handle();
    for feature in [0x01, 0x02] {
        let msg = LogicalMessage::new(Channel::Cmd, &[0x01, feature]).unwrap();
        handle.submit_command(msg).await.unwrap();
    }

    assert!(wait_until(|| h.camera.write_count() == 1).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.camera.write_count(), 1);
    assert!(handle.is_write_pending(Channel::Cmd));

    h.camera.inject(BleEvent::WriteComplete {
        channel: Channel::Cmd,
        status: 0,
    });
    assert!(wait_until(|| h.camera.write_count() == 2).await);
    assert_eq!(h.camera.writes()[1], (Channel::Cmd, vec![0x01, 0x02]));
}

#[tokio::test]
async fn missing_ack_times_out_and_moves_on() {
    let h = Harness::with_timing(|t| t.ble_ack_timeout_ms = 30);
    h.camera.set_auto_ack(false);
    h.connect().await;

    let handle = h.router.handle();
    for feature in [0x01, 0x02] {
        let msg = LogicalMessage::new(Channel::Query, &[0x01, feature]).unwrap();
        handle.submit_command(msg).await.unwrap();
    }

    assert!(wait_until(|| h.camera.write_count() == 2).await);
}

// =============================================================================
// Connection lifecycle and heartbeat
// =============================================================================

#[tokio::test]
async fn startup_queries_follow_connection() {
    let h = Harness::with_timing(|t| t.startup_query_delay_ms = 10);
    h.connect().await;

    assert!(wait_until(|| h.camera.write_count() == 5).await);
    let writes = h.camera.writes();
    assert_eq!(writes[0], (Channel::Query, vec![0x04, 0x53, 10, 39, 70]));
    assert_eq!(writes[4], (Channel::Cmd, vec![0x01, 0x3C]));
}

#[tokio::test]
async fn status_reply_shows_up_in_heartbeat() {
    let h = Harness::with_timing(|t| {
        t.startup_query_delay_ms = 10;
        t.heartbeat_interval_ms = 20;
    });
    h.camera.add_response(
        Channel::Query,
        vec![0x04, 0x53, 10, 39, 70],
        vec![vec![0x0B, 0x53, 0x00, 10, 1, 1, 39, 1, 3, 70, 1, 87]],
    );
    h.connect().await;

    assert!(
        wait_until(|| h
            .frames_with_id(0x734)
            .iter()
            .any(|f| f.payload() == [3, 1, 87, 3]))
        .await
    );
}

#[tokio::test]
async fn advertisement_and_disconnect_drive_connectivity() {
    let h = Harness::new();
    let state = h.router.state();

    h.camera.inject(BleEvent::Advertisement {
        status: AdvertisedStatus::Pairing,
        name: Some("GoPro 0042".to_string()),
    });
    assert!(wait_until(|| state.connectivity() == Connectivity::Pairing).await);
    assert_eq!(state.snapshot().name.as_deref(), Some("GoPro 0042"));

    h.connect().await;
    h.camera.inject(BleEvent::Disconnected);
    assert!(wait_until(|| state.connectivity() == Connectivity::Unknown).await);
    assert_eq!(state.snapshot().name, None);
}

#[tokio::test]
async fn auth_failure_needs_pairing() {
    let h = Harness::new();
    let state = h.router.state();

    h.camera.inject(BleEvent::AuthFailed);
    assert!(wait_until(|| state.connectivity() == Connectivity::NeedPairing).await);
}

#[tokio::test]
async fn idle_camera_is_forgotten() {
    let h = Harness::with_timing(|t| t.idle_timeout_secs = 1);
    let state = h.router.state();

    h.camera.inject(BleEvent::Advertisement {
        status: AdvertisedStatus::Online,
        name: None,
    });
    assert!(wait_until(|| state.connectivity() == Connectivity::Online).await);
    assert!(wait_until(|| state.connectivity() == Connectivity::Unknown).await);
}

// =============================================================================
// Large payloads
// =============================================================================

#[tokio::test]
async fn host_envelope_is_framed_onto_ble() {
    let h = Harness::new();
    h.connect().await;

    let body: Vec<u8> = (0..45).collect();
    let envelope = Envelope::new(Channel::Settings, body.clone()).to_bytes();
    h.inbound.inject_payload(&envelope, 7);

    let expected: Vec<(Channel, Vec<u8>)> = packet::encode_body(&body)
        .unwrap()
        .into_iter()
        .map(|frame| (Channel::Settings, frame))
        .collect();
    assert_eq!(expected.len(), 3);

    assert!(wait_until(|| h.camera.write_count() == expected.len()).await);
    assert_eq!(h.camera.writes(), expected);
}

#[tokio::test]
async fn commands_are_accepted_while_a_host_payload_drains() {
    let h = Harness::with_timing(|t| t.ble_ack_timeout_ms = 300);
    h.camera.set_auto_ack(false);
    h.connect().await;

    // more frames than any queue holds, each waiting for an ack that never comes
    let body: Vec<u8> = (0..800).map(|i| i as u8).collect();
    let frames = packet::encode_body(&body).unwrap();
    assert!(frames.len() > BridgeConfig::default().queue_depth);
    let envelope = Envelope::new(Channel::Settings, body).to_bytes();
    h.inbound.inject_payload(&envelope, 64);
    assert!(wait_until(|| h.camera.write_count() == 1).await);

    let handle = h.router.handle();
    let started = tokio::time::Instant::now();
    let cmd = LogicalMessage::new(Channel::Cmd, &[0x01, 0x05]).unwrap();
    assert_eq!(handle.submit_command(cmd).await, Ok(()));
    assert!(started.elapsed() < Duration::from_millis(500));

    // a host command arriving on CAN is queued too, not answered with an error
    h.bus.inject_incoming(can(0x772, &[0x01, 0x06]));
    sleep(Duration::from_millis(50)).await;
    assert!(h.frames_with_id(0x740).is_empty());

    // the payload goes out whole, the commands follow it
    h.camera.set_auto_ack(true);
    assert!(wait_until(|| h.camera.write_count() == frames.len() + 2).await);
    let writes = h.camera.writes();
    let settings: Vec<Vec<u8>> = writes[..frames.len()]
        .iter()
        .map(|(channel, data)| {
            assert_eq!(*channel, Channel::Settings);
            data.clone()
        })
        .collect();
    assert_eq!(settings, frames);
    assert_eq!(writes[frames.len()], (Channel::Cmd, vec![0x01, 0x05]));
    assert_eq!(writes[frames.len() + 1], (Channel::Cmd, vec![0x01, 0x06]));
}

#[tokio::test]
async fn consecutive_host_payloads_are_both_handled() {
    let h = Harness::new();
    h.connect().await;

    for feature in [0x10, 0x11] {
        let envelope = Envelope::new(Channel::Net, vec![feature, 0x00]).to_bytes();
        h.inbound.inject_payload(&envelope, 8);
    }

    assert!(wait_until(|| h.camera.write_count() == 2).await);
    assert_eq!(h.camera.writes()[0], (Channel::Net, vec![0x02, 0x10, 0x00]));
    assert_eq!(h.camera.writes()[1], (Channel::Net, vec![0x02, 0x11, 0x00]));
}

#[tokio::test]
async fn wifi_credentials_update_state() {
    let h = Harness::new();
    let state = h.router.state();

    let envelope = Envelope::wifi_credentials("gp-net", "hunter22").to_bytes();
    h.inbound.inject_payload(&envelope, 8);

    assert!(wait_until(|| state.snapshot().wifi_ssid.is_some()).await);
    let snap = state.snapshot();
    assert_eq!(snap.wifi_ssid.as_deref(), Some("gp-net"));
    assert_eq!(snap.wifi_pass.as_deref(), Some("hunter22"));
    assert_eq!(h.camera.write_count(), 0);
}

#[tokio::test]
async fn garbage_envelope_does_not_block_reception() {
    let h = Harness::new();
    let state = h.router.state();

    h.inbound.inject_payload(&[0xFF, 0xFF, 0xFF], 8);
    let envelope = Envelope::wifi_credentials("after", "garbage").to_bytes();
    h.inbound.inject_payload(&envelope, 8);

    assert!(wait_until(|| state.snapshot().wifi_ssid.as_deref() == Some("after")).await);
}

#[tokio::test]
async fn multi_frame_notification_goes_out_over_isotp() {
    let h = Harness::new();
    h.connect().await;

    let body: Vec<u8> = (0..30).map(|i| 0x40 + i).collect();
    for frame in packet::encode_body(&body).unwrap() {
        h.camera.inject_notification(Channel::Net, &frame);
    }

    assert!(wait_until(|| h.reply.sent_payloads().len() == 1).await);
    let envelope = Envelope::from_bytes(&h.reply.sent_payloads()[0]).unwrap();
    assert_eq!(envelope.target_channel, 3);
    assert_eq!(envelope.data, body);
    assert!(h.frames_with_id(0x779).is_empty());
}

#[tokio::test]
async fn request_name_is_answered_over_isotp() {
    let h = Harness::new();
    h.camera.inject(BleEvent::Advertisement {
        status: AdvertisedStatus::Online,
        name: Some("GoPro 1234".to_string()),
    });
    let state = h.router.state();
    assert!(wait_until(|| state.snapshot().name.is_some()).await);

    h.bus.inject_incoming(can(0x77A, &[0xBB]));

    assert!(wait_until(|| h.reply.sent_payloads().len() == 1).await);
    let envelope = Envelope::from_bytes(&h.reply.sent_payloads()[0]).unwrap();
    assert_eq!(envelope.target_channel, 0xFF);
    assert_eq!(envelope.data, b"GoPro 1234".to_vec());
}

#[tokio::test]
async fn only_one_large_reply_in_flight() {
    let h = Harness::new();
    h.reply.set_latency(Duration::from_millis(200));
    let handle = h.router.handle();

    handle
        .send_large_reply(Channel::Query, vec![0x13, 0x00, 70, 1, 50])
        .await
        .unwrap();
    assert!(matches!(
        handle.send_large_reply(Channel::Query, vec![0x13, 0x00]).await,
        Err(BridgeError::ReplyBusy)
    ));

    assert!(wait_until(|| h.reply.sent_payloads().len() == 1).await);
    // the permit comes back once the transfer finished
    let mut accepted = false;
    for _ in 0..100 {
        if handle
            .send_large_reply(Channel::Query, vec![0x13, 0x00])
            .await
            .is_ok()
        {
            accepted = true;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(accepted);
}

#[tokio::test]
async fn can_bus_failure_does_not_stop_egress() {
    let h = Harness::with_timing(|t| t.heartbeat_interval_ms = 20);
    h.bus.set_failing(true);
    sleep(Duration::from_millis(60)).await;
    assert!(h.frames_with_id(0x734).is_empty());

    h.bus.set_failing(false);
    assert!(wait_until(|| !h.frames_with_id(0x734).is_empty()).await);
}
