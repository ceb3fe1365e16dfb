//! Reply handling: feature/action demultiplexing and CAN reply frames

use gpcan_core::status::{self, query_id, HARDWARE_INFO_FEATURE};
use gpcan_core::{can_id, AssembledMessage, CanFrame, Channel, DeviceStateHandle, MAX_CAN_DLC};
use tracing::{debug, warn};

/// What the demultiplexer did with a reassembled message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demuxed {
    /// Status values written to the device state
    Status { applied: usize },
    HardwareInfo,
    /// The camera reported a failure result
    ErrorResult(u8),
    Malformed,
    /// Not interpreted locally
    Ignored,
}

/// Route a reassembled reply to the handler for its channel and feature
pub fn demux(msg: &AssembledMessage, state: &DeviceStateHandle) -> Demuxed {
    let (Some(feature), Some(action)) = (msg.feature(), msg.action()) else {
        return Demuxed::Ignored;
    };

    match (msg.channel, feature) {
        (
            Channel::Query,
            query_id::GET_STATUS | query_id::REGISTER_STATUS | query_id::STATUS_NOTIFY,
        ) => {
            if action != 0 {
                warn!(query = format!("0x{:02X}", feature), result = action, "Status query failed");
                return Demuxed::ErrorResult(action);
            }
            match status::parse_status_list(msg.payload()) {
                Ok(values) => {
                    let applied = state.update(|s| values.iter().filter(|v| v.apply(s)).count());
                    debug!(?values, "Camera status updated");
                    Demuxed::Status { applied }
                }
                Err(e) => {
                    warn!(error = %e, "Malformed status reply");
                    Demuxed::Malformed
                }
            }
        }
        (Channel::Cmd, HARDWARE_INFO_FEATURE) => {
            if action != 0 {
                warn!(status = action, "Hardware info request failed");
                return Demuxed::ErrorResult(action);
            }
            match status::parse_hardware_info(msg.payload()) {
                Ok((info, exact)) => {
                    if !exact {
                        warn!("Hardware info length mismatch");
                    }
                    debug!(model = %info.model_name, firmware = %info.firmware_version, "Camera identified");
                    state.update(|s| s.model_info = Some(info));
                    Demuxed::HardwareInfo
                }
                Err(e) => {
                    warn!(error = %e, "Malformed hardware info reply");
                    Demuxed::Malformed
                }
            }
        }
        _ => Demuxed::Ignored,
    }
}

/// Why a reply frame did not map cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyWarning {
    /// First byte did not describe the frame length; raw length used
    LengthMismatch { declared: u8, len: usize },
    /// Reply longer than one CAN frame; error frame sent instead
    Oversize { len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyFrame {
    pub frame: CanFrame,
    pub warning: Option<ReplyWarning>,
}

/// Map a single-frame BLE reply onto its CAN reply identifier
///
/// Returns `None` for channels without a reply id.
pub fn reply_frame(channel: Channel, payload: &[u8]) -> Option<ReplyFrame> {
    let id = channel.reply_can_id()?;
    let len = payload.len();

    let (dlc, mut warning) = match payload.first() {
        Some(&declared) if declared as usize + 1 == len => (len, None),
        Some(&declared) => (len, Some(ReplyWarning::LengthMismatch { declared, len })),
        None => (0, None),
    };

    if dlc > MAX_CAN_DLC {
        return Some(ReplyFrame {
            frame: CanFrame::error_frame(),
            warning: Some(ReplyWarning::Oversize { len }),
        });
    }

    let frame = match CanFrame::new(id, &payload[..dlc]) {
        Ok(frame) => frame,
        Err(_) => {
            warning = Some(ReplyWarning::Oversize { len });
            CanFrame::error_frame()
        }
    };
    Some(ReplyFrame { frame, warning })
}

/// Heartbeat frame from the current device state
pub fn heartbeat_frame(state: &DeviceStateHandle) -> CanFrame {
    let bytes = state.heartbeat_bytes();
    CanFrame {
        id: can_id::HEARTBEAT,
        dlc: bytes.len() as u8,
        data: [bytes[0], bytes[1], bytes[2], bytes[3], 0, 0, 0, 0],
    }
}
