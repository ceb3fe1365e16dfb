//! gpcan-core - Camera protocol primitives for the BLE to CAN bridge
//!
//! Packet framing for the camera's BLE link, reassembly of multi-frame
//! notifications, the CAN identifier map and the shared device state.

pub mod channel;
pub mod control;
pub mod device;
pub mod envelope;
pub mod message;
pub mod packet;
pub mod reassembly;
pub mod status;

pub use channel::{can_id, Channel};
pub use control::ControlCommand;
pub use device::{
    AdvertisedStatus, ConnectionEvent, Connectivity, DeviceState, DeviceStateHandle, ModelInfo,
};
pub use envelope::{Envelope, EnvelopeError, EnvelopeTarget, WifiCredentials};
pub use message::{CanFrame, LogicalMessage, MessageError, MAX_BLE_PAYLOAD, MAX_CAN_DLC};
pub use packet::{PacketClass, PacketError, PacketHeader};
pub use reassembly::{AssembledMessage, AssemblyState, Reassembler, ReassemblyError};
pub use status::{StatusError, StatusValue};
