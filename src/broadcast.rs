//! Single-slot latest-value relay from the domain service to every client.
//!
//! [`BroadcastSlot::publish`] never blocks beyond a short lock and always
//! overwrites whatever is still unsent. The periodic driver calls
//! [`BroadcastSlot::take_due`] every tick; the slot allows one delivery per
//! interval, so a burst of publishes right after a send collapses into a
//! single delivery of the last value. A value published after a quiet period
//! goes out on the next tick.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

/// Default minimum spacing between deliveries.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<Value>,
    last_sent: Option<Instant>,
    published: u64,
    delivered: u64,
}

/// Latest-value mailbox shared between the service core and the network core.
#[derive(Debug)]
pub struct BroadcastSlot {
    state: Mutex<SlotState>,
    interval: Duration,
}

impl Default for BroadcastSlot {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_INTERVAL)
    }
}

impl BroadcastSlot {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            interval,
        }
    }

    /// Store `payload` for the next delivery. Returns `true` if an unsent
    /// value was overwritten.
    pub fn publish(&self, payload: Value) -> bool {
        let mut state = self.state.lock();
        state.published += 1;
        let replaced = state.pending.replace(payload).is_some();
        if replaced {
            tracing::trace!("Broadcast slot overwritten before delivery");
        }
        replaced
    }

    /// Take the pending value if the interval since the last delivery has
    /// passed.
    ///
    /// Returns `None` without touching the slot while nothing is pending or
    /// while rate-limited.
    pub fn take_due(&self, now: Instant) -> Option<Value> {
        let mut state = self.state.lock();
        if state.pending.is_none() {
            return None;
        }
        if let Some(last) = state.last_sent {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }

        let payload = state.pending.take()?;
        state.last_sent = Some(now);
        state.delivered += 1;
        Some(payload)
    }

    /// Whether a value is waiting for delivery.
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// `(published, delivered)` counters.
    pub fn stats(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.published, state.delivered)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
