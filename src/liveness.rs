//! Keep-alive bookkeeping shared by listener sessions and tunnels.
//!
//! A monitor is owned by the task driving the session it watches, so it is
//! dropped, and can never fire, once that session has ended.

use tokio::time::{Duration, Instant};

/// Tracks traffic on one side of a session.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    timeout: Duration,
    last_inbound: Instant,
    last_outbound: Instant,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            timeout,
            last_inbound: now,
            last_outbound: now,
        }
    }

    /// Any message from the peer, keep-alive or not.
    pub fn record_inbound(&mut self) {
        self.last_inbound = Instant::now();
    }

    /// Any message the relay sent to the peer.
    pub fn record_outbound(&mut self) {
        self.last_outbound = Instant::now();
    }

    /// True once the peer has been silent for the whole timeout.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_inbound) >= self.timeout
    }

    /// True once the relay has been silent for half the timeout.
    pub fn keepalive_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_outbound) >= self.timeout / 2
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
