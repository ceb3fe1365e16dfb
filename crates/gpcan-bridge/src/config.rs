//! Bridge configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) gives a mock-transport bridge with the stock timings.

use std::path::Path;
use std::time::Duration;

use gpcan_core::can_id;
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub can: CanTransportConfig,
    #[serde(default)]
    pub isotp: IsoTpConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Capacity of each topic subscriber queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            can: CanTransportConfig::default(),
            isotp: IsoTpConfig::default(),
            timing: TimingConfig::default(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_queue_depth() -> usize {
    16
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl BridgeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

// =============================================================================
// CAN transport
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CanTransportConfig {
    /// Raw CAN and ISO-TP sockets (Linux only)
    SocketCan(SocketCanConfig),
    /// In-process mock bus
    Mock(MockConfig),
}

impl Default for CanTransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

impl CanTransportConfig {
    /// Point a SocketCAN transport at another interface; mock stays mock
    pub fn set_interface(&mut self, interface: &str) {
        if let Self::SocketCan(cfg) = self {
            cfg.interface = interface.to_string();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
        }
    }
}

fn default_interface() -> String {
    "can0".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated ISO-TP send latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// ISO-TP addressing
// =============================================================================

/// ISO-TP identifiers as hex strings (e.g. "0x753")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoTpConfig {
    /// Host-initiated transfers arrive here
    #[serde(default = "default_rx_id")]
    pub rx_id: String,
    /// Flow control for host-initiated transfers
    #[serde(default = "default_rx_fc_id")]
    pub rx_fc_id: String,
    /// Large replies leave on this id
    #[serde(default = "default_reply_tx_id")]
    pub reply_tx_id: String,
    /// Flow control for large replies
    #[serde(default = "default_reply_rx_id")]
    pub reply_rx_id: String,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            rx_id: default_rx_id(),
            rx_fc_id: default_rx_fc_id(),
            reply_tx_id: default_reply_tx_id(),
            reply_rx_id: default_reply_rx_id(),
        }
    }
}

fn default_rx_id() -> String {
    format!("0x{:03X}", can_id::ISOTP_RX)
}

fn default_rx_fc_id() -> String {
    format!("0x{:03X}", can_id::ISOTP_RX_FC)
}

fn default_reply_tx_id() -> String {
    format!("0x{:03X}", can_id::ISOTP_REPLY_TX)
}

fn default_reply_rx_id() -> String {
    format!("0x{:03X}", can_id::ISOTP_REPLY_RX)
}

/// Parsed ISO-TP identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTpIds {
    pub rx_id: u16,
    pub rx_fc_id: u16,
    pub reply_tx_id: u16,
    pub reply_rx_id: u16,
}

impl IsoTpConfig {
    pub fn ids(&self) -> Result<IsoTpIds, TransportError> {
        Ok(IsoTpIds {
            rx_id: parse_can_id(&self.rx_id)?,
            rx_fc_id: parse_can_id(&self.rx_fc_id)?,
            reply_tx_id: parse_can_id(&self.reply_tx_id)?,
            reply_rx_id: parse_can_id(&self.reply_rx_id)?,
        })
    }
}

/// Parse an 11-bit CAN ID from string (supports hex with 0x prefix)
pub fn parse_can_id(s: &str) -> Result<u16, TransportError> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };

    let id = u16::from_str_radix(digits, radix)
        .map_err(|e| TransportError::InvalidConfig(format!("Invalid CAN ID '{}': {}", s, e)))?;
    if id > can_id::MAX_STANDARD {
        return Err(TransportError::InvalidConfig(format!(
            "CAN ID '{}' is not an 11-bit identifier",
            s
        )));
    }
    Ok(id)
}

// =============================================================================
// Timing
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait for a BLE write acknowledgement
    #[serde(default = "default_ble_ack_timeout")]
    pub ble_ack_timeout_ms: u64,
    /// Wait for one CAN frame to leave
    #[serde(default = "default_can_send_timeout")]
    pub can_send_timeout_ms: u64,
    /// Bounded wait when a topic subscriber queue is full
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Wait for the previous inbound ISO-TP payload to be consumed
    #[serde(default = "default_isotp_permit_timeout")]
    pub isotp_permit_timeout_ms: u64,
    #[serde(default = "default_isotp_send_timeout")]
    pub isotp_send_timeout_ms: u64,
    /// BLE silence before an unconnected camera is forgotten
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Delay between connection and the startup status queries
    #[serde(default = "default_startup_query_delay")]
    pub startup_query_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ble_ack_timeout_ms: default_ble_ack_timeout(),
            can_send_timeout_ms: default_can_send_timeout(),
            publish_timeout_ms: default_publish_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            isotp_permit_timeout_ms: default_isotp_permit_timeout(),
            isotp_send_timeout_ms: default_isotp_send_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            startup_query_delay_ms: default_startup_query_delay(),
        }
    }
}

fn default_ble_ack_timeout() -> u64 {
    1200
}

fn default_can_send_timeout() -> u64 {
    10
}

fn default_publish_timeout() -> u64 {
    100
}

fn default_heartbeat_interval() -> u64 {
    100
}

fn default_isotp_permit_timeout() -> u64 {
    2000
}

fn default_isotp_send_timeout() -> u64 {
    5000
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_startup_query_delay() -> u64 {
    1000
}

impl TimingConfig {
    pub fn ble_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ble_ack_timeout_ms)
    }

    pub fn can_send_timeout(&self) -> Duration {
        Duration::from_millis(self.can_send_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn isotp_permit_timeout(&self) -> Duration {
        Duration::from_millis(self.isotp_permit_timeout_ms)
    }

    pub fn isotp_send_timeout(&self) -> Duration {
        Duration::from_millis(self.isotp_send_timeout_ms)
    }

    /// `None` disables the idle timeout
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn startup_query_delay(&self) -> Duration {
        Duration::from_millis(self.startup_query_delay_ms)
    }
}
