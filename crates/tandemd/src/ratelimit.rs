use std::collections::HashMap;
use std::time::{Duration, Instant};
use tandem_common::ParticipantId;

/// Default minimum spacing between relayed messages from one participant.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1300);

/// Per-participant cooldown gate on relay.
///
/// Keeps only the instant of the last accepted action per participant. A
/// call inside the cooldown window is rejected and does not move the window,
/// so a flooding sender gets through once per cooldown.
#[derive(Debug)]
pub struct RateLimiter {
    cooldown: Duration,
    last_accepted: HashMap<ParticipantId, Instant>,
}

impl RateLimiter {
    /// Creates a limiter with the given cooldown.
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_accepted: HashMap::new(),
        }
    }

    /// Returns `true` and records `now` if `id` is outside its cooldown window.
    /// Returns `false` without touching state otherwise.
    pub fn allow(&mut self, id: ParticipantId, now: Instant) -> bool {
        if let Some(last) = self.last_accepted.get(&id) {
            // saturating: an `Instant` from before `last` counts as zero elapsed
            if now.saturating_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        self.last_accepted.insert(id, now);
        true
    }

    /// Drop the clock entry for `id`.
    pub fn forget(&mut self, id: ParticipantId) {
        self.last_accepted.remove(&id);
    }

    /// Drop every clock entry.
    pub fn clear(&mut self) {
        self.last_accepted.clear();
    }

    /// Number of tracked participants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    /// Returns `true` if no participant is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
