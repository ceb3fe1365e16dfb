//! gpcan-bridge - Camera BLE to CAN/ISO-TP router
//!
//! Moves traffic between an action camera's BLE characteristics and a CAN
//! host: short commands and replies as single frames, large payloads over
//! ISO-TP, plus a periodic heartbeat carrying the camera status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Router                               │
//! │                                                              │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │ Topics      │  │ WriteGates  │  │ DeviceStateHandle    │  │
//! │  │ (pub/sub)   │  │ (1 write/ch)│  │ (connectivity, info) │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────────┘  │
//! │                          │                                   │
//! │          ┌───────────────┼────────────────┐                  │
//! │     ┌────┴────┐    ┌─────┴─────┐    ┌─────┴─────┐            │
//! │     │ BleLink │    │  CanBus   │    │ IsoTpLink │            │
//! │     └─────────┘    └───────────┘    └───────────┘            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod isotp;
pub mod router;
pub mod topic;
pub mod transport;
mod workers;

pub use config::BridgeConfig;
pub use error::{BridgeError, PublishError};
pub use router::{BridgeHandle, Router, Transports};
pub use topic::Topic;
