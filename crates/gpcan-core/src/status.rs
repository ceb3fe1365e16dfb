//! Camera status and hardware-info replies
//!
//! Only the handful of replies the bridge itself needs (heartbeat telemetry,
//! model identification) are interpreted here; everything else is forwarded
//! untouched.

use bytes::Buf;
use thiserror::Error;

use crate::device::{DeviceState, ModelInfo};

/// Query ids (first body byte on the Query channel)
pub mod query_id {
    pub const GET_STATUS: u8 = 0x13;
    pub const REGISTER_STATUS: u8 = 0x53;
    /// Unsolicited push for registered status ids
    pub const STATUS_NOTIFY: u8 = 0x93;
}

/// Status ids carried in the TLV list
pub mod status_id {
    pub const ENCODING: u8 = 10;
    pub const VIDEO_COUNT: u8 = 39;
    pub const BATTERY_PERCENT: u8 = 70;
}

/// Cmd feature answering a hardware-info request
pub const HARDWARE_INFO_FEATURE: u8 = 0x3C;

/// Reserved trailer after the hardware-info fields
const HARDWARE_INFO_RESERVED: usize = 11;

/// Messages sent to the camera once a connection is up
pub const STARTUP_QUERIES: &[(crate::channel::Channel, &[u8])] = &[
    (
        crate::channel::Channel::Query,
        &[0x04, query_id::REGISTER_STATUS, status_id::ENCODING, status_id::VIDEO_COUNT, status_id::BATTERY_PERCENT],
    ),
    (crate::channel::Channel::Query, &[0x02, query_id::GET_STATUS, status_id::VIDEO_COUNT]),
    (crate::channel::Channel::Query, &[0x02, query_id::GET_STATUS, status_id::BATTERY_PERCENT]),
    (crate::channel::Channel::Query, &[0x02, query_id::GET_STATUS, status_id::ENCODING]),
    (crate::channel::Channel::Cmd, &[0x01, HARDWARE_INFO_FEATURE]),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("Reply truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Field {field} has invalid length {len}")]
    InvalidLength { field: &'static str, len: usize },
}

/// One decoded status value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusValue {
    Encoding(bool),
    VideoCount(u32),
    Battery(u8),
    Other { id: u8, value: Vec<u8> },
}

impl StatusValue {
    /// Write the value into device state; returns false for unknown ids
    pub fn apply(&self, state: &mut DeviceState) -> bool {
        match self {
            Self::Encoding(recording) => state.recording = *recording,
            Self::VideoCount(count) => state.video_count = *count,
            Self::Battery(percent) => state.battery = *percent,
            Self::Other { .. } => return false,
        }
        true
    }
}

/// Parse a status TLV list (`id, len, value[len]` repeated)
pub fn parse_status_list(mut buf: &[u8]) -> Result<Vec<StatusValue>, StatusError> {
    let mut values = Vec::new();

    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(StatusError::Truncated("status header"));
        }
        let id = buf.get_u8();
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(StatusError::Truncated("status value"));
        }
        let (value, rest) = buf.split_at(len);
        buf = rest;

        let parsed = match id {
            status_id::ENCODING | status_id::BATTERY_PERCENT if len == 0 => {
                return Err(StatusError::InvalidLength { field: "status", len })
            }
            status_id::ENCODING => StatusValue::Encoding(value[0] > 0),
            status_id::BATTERY_PERCENT => StatusValue::Battery(value[0]),
            status_id::VIDEO_COUNT => {
                if len > 4 {
                    return Err(StatusError::InvalidLength {
                        field: "video count",
                        len,
                    });
                }
                StatusValue::VideoCount(value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
            }
            _ => StatusValue::Other {
                id,
                value: value.to_vec(),
            },
        };
        values.push(parsed);
    }

    Ok(values)
}

fn take_field<'a>(buf: &mut &'a [u8], field: &'static str) -> Result<&'a [u8], StatusError> {
    if !buf.has_remaining() {
        return Err(StatusError::Truncated(field));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(StatusError::Truncated(field));
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Ok(value)
}

fn take_string(buf: &mut &[u8], field: &'static str) -> Result<String, StatusError> {
    let raw = take_field(buf, field)?;
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// Parse the payload of a hardware-info reply (after feature and status)
///
/// Returns the model info and whether the trailing length matched exactly.
pub fn parse_hardware_info(mut buf: &[u8]) -> Result<(ModelInfo, bool), StatusError> {
    let number = take_field(&mut buf, "model number")?;
    if number.len() > 4 {
        return Err(StatusError::InvalidLength {
            field: "model number",
            len: number.len(),
        });
    }
    let model_number = number.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);

    let model_name = take_string(&mut buf, "model name")?;
    take_field(&mut buf, "deprecated")?;
    let firmware_version = take_string(&mut buf, "firmware version")?;
    let serial_number = take_string(&mut buf, "serial number")?;
    let ap_ssid = take_string(&mut buf, "ap ssid")?;
    let ap_mac = take_string(&mut buf, "ap mac")?;

    Ok((
        ModelInfo {
            model_number,
            model_name,
            firmware_version,
            serial_number,
            ap_ssid,
            ap_mac,
        },
        buf.remaining() == HARDWARE_INFO_RESERVED,
    ))
}
