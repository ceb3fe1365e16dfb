//! Camera device state shared by the bridge workers

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

/// Connection state of the camera as seen by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Connectivity {
    #[default]
    Unknown,
    Offline,
    Online,
    Connected,
    Pairing,
    NeedPairing,
}

impl Connectivity {
    /// Code sent in the first heartbeat byte
    pub fn wire(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Offline => 1,
            Self::Online => 2,
            Self::Connected => 3,
            Self::Pairing => 4,
            Self::NeedPairing => 5,
        }
    }

    /// Transition on a connection lifecycle event
    pub fn next(self, event: &ConnectionEvent) -> Self {
        match event {
            // a connected camera stops advertising; late reports are stale
            ConnectionEvent::Advertised(_) if self == Self::Connected => self,
            ConnectionEvent::Advertised(status) => (*status).into(),
            ConnectionEvent::Connected => Self::Connected,
            ConnectionEvent::AuthFailed => Self::NeedPairing,
            ConnectionEvent::IdleTimeout | ConnectionEvent::Disconnected => Self::Unknown,
        }
    }
}

/// Camera status carried in its advertisement data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisedStatus {
    Offline,
    Online,
    Pairing,
}

impl From<AdvertisedStatus> for Connectivity {
    fn from(status: AdvertisedStatus) -> Self {
        match status {
            AdvertisedStatus::Offline => Self::Offline,
            AdvertisedStatus::Online => Self::Online,
            AdvertisedStatus::Pairing => Self::Pairing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Advertised(AdvertisedStatus),
    /// Security established and discovery finished
    Connected,
    AuthFailed,
    /// No BLE activity within the idle window
    IdleTimeout,
    Disconnected,
}

/// Hardware info reported by the camera
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelInfo {
    pub model_number: u32,
    pub model_name: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub ap_ssid: String,
    pub ap_mac: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub connectivity: Connectivity,
    /// Battery percentage
    pub battery: u8,
    pub video_count: u32,
    pub recording: bool,
    pub name: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_pass: Option<String>,
    pub model_info: Option<ModelInfo>,
}

impl DeviceState {
    /// `{connectivity, recording, battery, video_count}` for the 0x734 frame
    pub fn heartbeat_bytes(&self) -> [u8; 4] {
        [
            self.connectivity.wire(),
            self.recording as u8,
            self.battery,
            self.video_count.min(u8::MAX as u32) as u8,
        ]
    }

    fn apply(&mut self, event: &ConnectionEvent) {
        self.connectivity = self.connectivity.next(event);
        if matches!(
            event,
            ConnectionEvent::IdleTimeout | ConnectionEvent::Disconnected
        ) {
            self.name = None;
        }
    }
}

/// Shared handle to the process-wide device state
///
/// Writers go through [`update`](Self::update) or [`apply`](Self::apply);
/// readers take snapshots. Connectivity changes are also published on a
/// watch channel.
#[derive(Clone)]
pub struct DeviceStateHandle {
    inner: Arc<RwLock<DeviceState>>,
    connectivity_tx: Arc<watch::Sender<Connectivity>>,
}

impl DeviceStateHandle {
    pub fn new() -> Self {
        Self::with_state(DeviceState::default())
    }

    pub fn with_state(state: DeviceState) -> Self {
        let (tx, _rx) = watch::channel(state.connectivity);
        Self {
            inner: Arc::new(RwLock::new(state)),
            connectivity_tx: Arc::new(tx),
        }
    }

    pub fn snapshot(&self) -> DeviceState {
        self.inner.read().clone()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.inner.read().connectivity
    }

    pub fn heartbeat_bytes(&self) -> [u8; 4] {
        self.inner.read().heartbeat_bytes()
    }

    /// Mutate the state under the write lock
    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let (result, connectivity) = {
            let mut state = self.inner.write();
            let result = f(&mut state);
            (result, state.connectivity)
        };
        self.notify(connectivity);
        result
    }

    /// Drive the connectivity state machine, returning the new state
    pub fn apply(&self, event: ConnectionEvent) -> Connectivity {
        let (before, after) = {
            let mut state = self.inner.write();
            let before = state.connectivity;
            state.apply(&event);
            (before, state.connectivity)
        };
        if before != after {
            info!(from = ?before, to = ?after, ?event, "Connectivity changed");
        } else {
            debug!(state = ?after, ?event, "Connection event");
        }
        self.notify(after);
        after
    }

    /// Watch connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.connectivity_tx.subscribe()
    }

    fn notify(&self, connectivity: Connectivity) {
        self.connectivity_tx.send_if_modified(|current| {
            if *current != connectivity {
                *current = connectivity;
                true
            } else {
                false
            }
        });
    }
}

impl Default for DeviceStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_cycles_through_states() {
        let state = DeviceStateHandle::new();
        assert_eq!(state.connectivity(), Connectivity::Unknown);

        state.apply(ConnectionEvent::Advertised(AdvertisedStatus::Pairing));
        assert_eq!(state.connectivity(), Connectivity::Pairing);

        state.apply(ConnectionEvent::Connected);
        state.apply(ConnectionEvent::Advertised(AdvertisedStatus::Offline));
        assert_eq!(state.connectivity(), Connectivity::Connected);

        state.apply(ConnectionEvent::AuthFailed);
        assert_eq!(state.connectivity(), Connectivity::NeedPairing);

        state.apply(ConnectionEvent::IdleTimeout);
        assert_eq!(state.connectivity(), Connectivity::Unknown);
    }

    #[test]
    fn disconnect_clears_name() {
        let state = DeviceStateHandle::new();
        state.update(|s| {
            s.name = Some("GoPro 1234".into());
            s.battery = 80;
        });
        state.apply(ConnectionEvent::Connected);
        state.apply(ConnectionEvent::Disconnected);

        let snap = state.snapshot();
        assert_eq!(snap.name, None);
        assert_eq!(snap.battery, 80);
        assert_eq!(snap.connectivity, Connectivity::Unknown);
    }

    #[test]
    fn heartbeat_layout() {
        let state = DeviceState {
            connectivity: Connectivity::Connected,
            recording: true,
            battery: 57,
            video_count: 1000,
            ..Default::default()
        };
        assert_eq!(state.heartbeat_bytes(), [3, 1, 57, 255]);
        assert_eq!(DeviceState::default().heartbeat_bytes(), [0, 0, 0, 0]);
    }

    #[test]
    fn watch_sees_connectivity_changes() {
        let state = DeviceStateHandle::new();
        let rx = state.subscribe();
        state.apply(ConnectionEvent::Advertised(AdvertisedStatus::Online));
        assert_eq!(*rx.borrow(), Connectivity::Online);
        state.update(|s| s.connectivity = Connectivity::Connected);
        assert_eq!(*rx.borrow(), Connectivity::Connected);
    }
}
