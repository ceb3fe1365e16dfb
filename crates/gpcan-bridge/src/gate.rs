//! Single-flight write gates, one per BLE channel
//!
//! The BLE link accepts one outstanding write per characteristic. A write
//! marks its channel pending; the write-completion event clears the flag and
//! wakes the writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use gpcan_core::channel::BLE_CHANNEL_COUNT;
use gpcan_core::Channel;
use tokio::sync::Notify;

#[derive(Default)]
struct ChannelGate {
    pending: AtomicBool,
    subscribed: AtomicBool,
    ack: Notify,
}

/// Outcome of waiting for a write acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    TimedOut,
    /// The control channel has no characteristic to wait on
    NotApplicable,
}

#[derive(Default)]
pub struct WriteGates {
    gates: [ChannelGate; BLE_CHANNEL_COUNT],
}

impl WriteGates {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, channel: Channel) -> Option<&ChannelGate> {
        channel.ble_index().map(|i| &self.gates[i])
    }

    /// Mark a write as outstanding; false if one already was
    pub fn begin(&self, channel: Channel) -> bool {
        self.gate(channel)
            .map_or(false, |g| !g.pending.swap(true, Ordering::AcqRel))
    }

    /// Drop the pending mark after a write that never went out
    pub fn cancel(&self, channel: Channel) {
        if let Some(g) = self.gate(channel) {
            g.pending.store(false, Ordering::Release);
        }
    }

    /// Signal write completion; false if no write was pending
    pub fn complete(&self, channel: Channel) -> bool {
        match self.gate(channel) {
            Some(g) if g.pending.swap(false, Ordering::AcqRel) => {
                g.ack.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Wait for the outstanding write on `channel` to complete
    pub async fn wait_ack(&self, channel: Channel, timeout: Duration) -> AckOutcome {
        let Some(g) = self.gate(channel) else {
            return AckOutcome::NotApplicable;
        };

        if tokio::time::timeout(timeout, g.ack.notified()).await.is_ok() {
            return AckOutcome::Acked;
        }

        if g.pending.swap(false, Ordering::AcqRel) {
            AckOutcome::TimedOut
        } else {
            // completion raced the timeout; take its wake-up so the next write
            // does not see a stale one
            g.ack.notified().await;
            AckOutcome::Acked
        }
    }

    pub fn is_pending(&self, channel: Channel) -> bool {
        self.gate(channel)
            .map_or(false, |g| g.pending.load(Ordering::Acquire))
    }

    pub fn set_subscribed(&self, channel: Channel, subscribed: bool) {
        if let Some(g) = self.gate(channel) {
            g.subscribed.store(subscribed, Ordering::Release);
        }
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.gate(channel)
            .map_or(false, |g| g.subscribed.load(Ordering::Acquire))
    }

    /// Forget every pending write and subscription (link dropped)
    pub fn reset(&self) {
        for ch in Channel::BLE {
            self.complete(ch);
            self.set_subscribed(ch, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn ack_wakes_writer() {
        let gates = Arc::new(WriteGates::new());
        assert!(gates.begin(Channel::Cmd));
        assert!(!gates.begin(Channel::Cmd));
        assert!(gates.is_pending(Channel::Cmd));

        let waiter = {
            let gates = gates.clone();
            tokio::spawn(async move { gates.wait_ack(Channel::Cmd, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(gates.complete(Channel::Cmd));
        assert_eq!(waiter.await.unwrap(), AckOutcome::Acked);
        assert!(!gates.is_pending(Channel::Cmd));
    }

    #[tokio::test]
    async fn ack_before_wait_is_not_lost() {
        let gates = WriteGates::new();
        gates.begin(Channel::Query);
        gates.complete(Channel::Query);
        assert_eq!(
            gates.wait_ack(Channel::Query, Duration::from_millis(10)).await,
            AckOutcome::Acked
        );
    }

    #[tokio::test]
    async fn timeout_clears_pending_and_late_ack_is_ignored() {
        let gates = WriteGates::new();
        gates.begin(Channel::Net);
        assert_eq!(
            gates.wait_ack(Channel::Net, Duration::from_millis(10)).await,
            AckOutcome::TimedOut
        );
        assert!(!gates.is_pending(Channel::Net));
        assert!(!gates.complete(Channel::Net));

        // the late ack left nothing behind for the next write
        gates.begin(Channel::Net);
        assert_eq!(
            gates.wait_ack(Channel::Net, Duration::from_millis(10)).await,
            AckOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let gates = WriteGates::new();
        assert!(gates.begin(Channel::Cmd));
        assert!(gates.begin(Channel::Settings));
        assert!(!gates.complete(Channel::Query));
        assert!(!gates.begin(Channel::Control));
        assert_eq!(
            gates.wait_ack(Channel::Control, Duration::from_millis(1)).await,
            AckOutcome::NotApplicable
        );

        gates.set_subscribed(Channel::Settings, true);
        gates.reset();
        assert!(!gates.is_pending(Channel::Cmd));
        assert!(!gates.is_subscribed(Channel::Settings));
    }
}
