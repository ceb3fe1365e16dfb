//! Transport layer for the bridge
//!
//! This module provides the three links the router moves messages between:
//! - BLE link to the camera (external stack, trait only plus a mock)
//! - Raw CAN bus for single frames
//! - ISO-TP address pairs for large payloads
//!
//! SocketCAN adapters are available on Linux with the `socketcan` feature.
//!
//! # Example
//!
//! ```ignore
//! use gpcan_bridge::transport::{create_can_transport, create_isotp_links};
//! use gpcan_bridge::config::BridgeConfig;
//!
//! let config = BridgeConfig::default();
//! let can = create_can_transport(&config.can).await?;
//! let isotp = create_isotp_links(&config).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{BleEvent, BleLink, CanBus, IsoTpLink, IsoTpSegment, ATT_SUCCESS};
pub use error::{BleError, TransportError};

use std::sync::Arc;

use crate::config::{BridgeConfig, CanTransportConfig};

/// The two ISO-TP address pairs used by the bridge
#[derive(Clone)]
pub struct IsoTpLinks {
    /// Host-initiated transfers (0x753 / 0x763)
    pub inbound: Arc<dyn IsoTpLink>,
    /// Large replies to the host (0x783 / 0x784)
    pub reply: Arc<dyn IsoTpLink>,
}

/// Create the raw CAN transport based on configuration
pub async fn create_can_transport(
    config: &CanTransportConfig,
) -> Result<Arc<dyn CanBus>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        CanTransportConfig::SocketCan(cfg) => {
            let bus = socketcan::SocketCanBus::new(&cfg.interface)?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        CanTransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        CanTransportConfig::Mock(_) => Ok(Arc::new(mock::MockCanBus::new())),
    }
}

/// Create both ISO-TP links based on configuration
pub async fn create_isotp_links(config: &BridgeConfig) -> Result<IsoTpLinks, TransportError> {
    let ids = config.isotp.ids()?;
    match &config.can {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        CanTransportConfig::SocketCan(cfg) => {
            // IsoTpSocket::open takes (rx, tx) from our side of the pair
            let inbound = socketcan::SocketIsoTpLink::new(&cfg.interface, ids.rx_id, ids.rx_fc_id)?;
            let reply =
                socketcan::SocketIsoTpLink::new(&cfg.interface, ids.reply_rx_id, ids.reply_tx_id)?;
            Ok(IsoTpLinks {
                inbound: Arc::new(inbound),
                reply: Arc::new(reply),
            })
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        CanTransportConfig::SocketCan(_) => {
            let _ = ids;
            Err(TransportError::Unsupported(
                "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
            ))
        }
        CanTransportConfig::Mock(cfg) => {
            let _ = ids;
            Ok(IsoTpLinks {
                inbound: Arc::new(mock::MockIsoTpLink::new(cfg)),
                reply: Arc::new(mock::MockIsoTpLink::new(cfg)),
            })
        }
    }
}
