//! Last-seen tracking for heartbeat timeouts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic last-seen timestamp, shared between a connection's read loop
/// (which touches it) and its writer/monitor loop (which checks it).
#[derive(Debug)]
pub struct Liveness {
    origin: Instant,
    last_seen_micros: AtomicU64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_seen_micros: AtomicU64::new(0),
        }
    }

    /// Record that the peer was heard from just now.
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_micros() as u64;
        self.last_seen_micros.fetch_max(now, Ordering::AcqRel);
    }

    /// Time since the peer was last heard from.
    pub fn silent_for(&self) -> Duration {
        let last = Duration::from_micros(self.last_seen_micros.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }

    /// True when the peer has been silent for longer than `limit`.
    pub fn expired(&self, limit: Duration) -> bool {
        self.silent_for() > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_liveness_is_not_expired() {
        let liveness = Liveness::new();
        assert!(!liveness.expired(Duration::from_secs(1)));
    }

    #[test]
    fn test_silence_expires_and_touch_revives() {
        let liveness = Liveness::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(liveness.expired(Duration::from_millis(10)));

        liveness.touch();
        assert!(!liveness.expired(Duration::from_millis(10)));
        assert!(liveness.silent_for() < Duration::from_millis(10));
    }
}
