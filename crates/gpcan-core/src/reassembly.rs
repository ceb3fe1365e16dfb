//! Reassembly of multi-frame BLE notifications
//!
//! One assembly is in flight at a time; the camera never interleaves two
//! multi-frame replies. A new start frame supersedes any partial assembly.

use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::packet::{self, PacketError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Malformed frame: {0}")]
    Packet(#[from] PacketError),

    #[error("Assembly overflow: {saved} bytes held, {incoming} more exceed declared {total}")]
    Overflow {
        total: usize,
        saved: usize,
        incoming: usize,
    },

    #[error("Cannot allocate {0} bytes for reassembly")]
    Allocation(usize),
}

/// Reassembler state as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Idle,
    Accumulating,
    /// Last frame broke an assembly; the next start frame recovers
    Error,
}

/// A complete logical message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub channel: Channel,
    /// Whole body: feature, action, payload
    pub body: Vec<u8>,
    /// Number of frames that made up the message
    pub frames: usize,
}

impl AssembledMessage {
    pub fn feature(&self) -> Option<u8> {
        self.body.first().copied()
    }

    pub fn action(&self) -> Option<u8> {
        self.body.get(1).copied()
    }

    pub fn payload(&self) -> &[u8] {
        self.body.get(2..).unwrap_or(&[])
    }
}

#[derive(Debug)]
struct FrameAssembly {
    channel: Channel,
    total_len: usize,
    buffer: Vec<u8>,
    frames: usize,
}

#[derive(Debug, Default)]
pub struct Reassembler {
    current: Option<FrameAssembly>,
    errored: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AssemblyState {
        if self.current.is_some() {
            AssemblyState::Accumulating
        } else if self.errored {
            AssemblyState::Error
        } else {
            AssemblyState::Idle
        }
    }

    /// Drop any partial assembly
    pub fn reset(&mut self) {
        self.current = None;
        self.errored = false;
    }

    /// Feed one notification; returns the message once its last frame arrived
    pub fn push(
        &mut self,
        channel: Channel,
        frame: &[u8],
    ) -> Result<Option<AssembledMessage>, ReassemblyError> {
        let header = match packet::decode(frame) {
            Ok(header) => header,
            Err(e) => {
                self.fail();
                return Err(e.into());
            }
        };

        let body = &frame[header.header_len..];

        if header.is_continuation() {
            let Some(assembly) = self.current.as_mut() else {
                debug!(%channel, seq = ?header.seq, "Continuation without start frame dropped");
                return Ok(None);
            };

            let saved = assembly.buffer.len();
            if saved + body.len() > assembly.total_len {
                let err = ReassemblyError::Overflow {
                    total: assembly.total_len,
                    saved,
                    incoming: body.len(),
                };
                self.fail();
                return Err(err);
            }

            assembly.buffer.extend_from_slice(body);
            assembly.frames += 1;
            return Ok(self.take_if_complete());
        }

        if let Some(stale) = self.current.take() {
            warn!(
                channel = %stale.channel,
                saved = stale.buffer.len(),
                total = stale.total_len,
                "Partial assembly superseded by a new start frame"
            );
        }
        self.errored = false;

        if header.declared_len == 0 {
            debug!(%channel, "Zero-length frame dropped");
            return Ok(None);
        }

        if body.len() > header.declared_len {
            self.fail();
            return Err(ReassemblyError::Overflow {
                total: header.declared_len,
                saved: 0,
                incoming: body.len(),
            });
        }

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(header.declared_len).is_err() {
            self.fail();
            return Err(ReassemblyError::Allocation(header.declared_len));
        }
        buffer.extend_from_slice(body);

        self.current = Some(FrameAssembly {
            channel,
            total_len: header.declared_len,
            buffer,
            frames: 1,
        });

        Ok(self.take_if_complete())
    }

    fn take_if_complete(&mut self) -> Option<AssembledMessage> {
        match &self.current {
            Some(a) if a.buffer.len() == a.total_len => {}
            _ => return None,
        }
        self.current.take().map(|a| {
            debug!(
                channel = %a.channel,
                frames = a.frames,
                body = %hex::encode(&a.buffer),
                "Message reassembled"
            );
            AssembledMessage {
                channel: a.channel,
                body: a.buffer,
                frames: a.frames,
            }
        })
    }

    fn fail(&mut self) {
        self.current = None;
        self.errored = true;
    }
}
