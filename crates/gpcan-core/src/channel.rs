//! Camera control channels and the CAN identifiers bound to them
//!
//! The camera exposes four BLE characteristic pairs (Cmd, Settings, Query,
//! Net). A fifth, local-only `Control` channel carries bridge commands that
//! never reach the camera.

/// Bit-exact 11-bit CAN identifiers used by the bridge
pub mod can_id {
    /// Heartbeat: connectivity, recording, battery, video count
    pub const HEARTBEAT: u16 = 0x734;

    pub const CMD_IN: u16 = 0x772;
    pub const CMD_REPLY: u16 = 0x773;
    pub const SETTINGS_IN: u16 = 0x774;
    pub const SETTINGS_REPLY: u16 = 0x775;
    pub const QUERY_IN: u16 = 0x776;
    pub const QUERY_REPLY: u16 = 0x777;
    pub const NET_IN: u16 = 0x778;
    pub const NET_REPLY: u16 = 0x779;

    /// Local control commands (no dedicated reply id)
    pub const CONTROL_IN: u16 = 0x77A;

    /// Fixed error frame (oversize reply / invalid state)
    pub const ERROR_REPLY: u16 = 0x740;

    /// ISO-TP pair for transfers initiated by the host
    pub const ISOTP_RX: u16 = 0x753;
    pub const ISOTP_RX_FC: u16 = 0x763;

    /// ISO-TP pair for large replies sent by the bridge
    pub const ISOTP_REPLY_TX: u16 = 0x783;
    pub const ISOTP_REPLY_RX: u16 = 0x784;

    /// Largest standard (11-bit) identifier
    pub const MAX_STANDARD: u16 = 0x7FF;
}

/// Wire value of the local control channel
pub const CONTROL_CHANNEL_WIRE: u8 = 0xFF;

/// Number of BLE characteristic pairs on the camera
pub const BLE_CHANNEL_COUNT: usize = 4;

/// Logical channel a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Cmd,
    Settings,
    Query,
    Net,
    /// Local bridge commands (forget pairing, force connect, name query)
    Control,
}

impl Channel {
    /// The four channels backed by a BLE characteristic pair
    pub const BLE: [Channel; BLE_CHANNEL_COUNT] =
        [Channel::Cmd, Channel::Settings, Channel::Query, Channel::Net];

    /// Parse a wire tag (`0..=3` for BLE channels, `0xFF` for control)
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Cmd),
            1 => Some(Self::Settings),
            2 => Some(Self::Query),
            3 => Some(Self::Net),
            CONTROL_CHANNEL_WIRE => Some(Self::Control),
            _ => None,
        }
    }

    pub fn wire(self) -> u8 {
        match self {
            Self::Cmd => 0,
            Self::Settings => 1,
            Self::Query => 2,
            Self::Net => 3,
            Self::Control => CONTROL_CHANNEL_WIRE,
        }
    }

    /// Index into per-characteristic tables, `None` for the control channel
    pub fn ble_index(self) -> Option<usize> {
        match self {
            Self::Control => None,
            other => Some(other.wire() as usize),
        }
    }

    pub fn is_ble(self) -> bool {
        self.ble_index().is_some()
    }

    /// Map a host→bridge CAN identifier to its channel
    pub fn from_input_can_id(id: u16) -> Option<Self> {
        match id {
            can_id::CMD_IN => Some(Self::Cmd),
            can_id::SETTINGS_IN => Some(Self::Settings),
            can_id::QUERY_IN => Some(Self::Query),
            can_id::NET_IN => Some(Self::Net),
            can_id::CONTROL_IN => Some(Self::Control),
            _ => None,
        }
    }

    /// CAN identifier carrying replies for this channel
    pub fn reply_can_id(self) -> Option<u16> {
        match self {
            Self::Cmd => Some(can_id::CMD_REPLY),
            Self::Settings => Some(can_id::SETTINGS_REPLY),
            Self::Query => Some(can_id::QUERY_REPLY),
            Self::Net => Some(can_id::NET_REPLY),
            Self::Control => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cmd => "cmd",
            Self::Settings => "settings",
            Self::Query => "query",
            Self::Net => "net",
            Self::Control => "control",
        };
        f.write_str(name)
    }
}
