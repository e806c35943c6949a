//! Session-id rotation: periodically replaces the observable
//! demultiplexing identifier without touching keys, sequence numbers, or
//! the replay window.
//!
//! Ported from the original `SessionRotator`: an exponentially-distributed
//! jitter around the configured interval, split 33%/67% between
//! shortening and lengthening the next rotation, floored at 25% of the
//! base interval.

use std::time::{Duration, Instant};

use crate::core::{DEFAULT_SESSION_ROTATION_INTERVAL, DEFAULT_SESSION_ROTATION_PACKETS};
use crate::crypto::random_u64;

const SHORTEN_PROBABILITY: f64 = 0.33;
const LENGTHEN_CLAMP_FACTOR: f64 = 2.0;
const FLOOR_FACTOR: f64 = 0.25;

fn random_unit_f64() -> f64 {
    // 53 bits of randomness mapped into [0, 1).
    (random_u64() >> 11) as f64 / (1u64 << 53) as f64
}

/// Decides when a [`super::session::TransportSession`] should rotate its
/// `session_id`.
pub struct SessionRotator {
    base_interval: Duration,
    max_packets: u64,
    session_id: u64,
    packets_since_rotation: u64,
    last_rotation: Instant,
    next_interval: Duration,
}

impl SessionRotator {
    /// Create a rotator seeded with a fresh random session id and a
    /// jittered first interval, starting the packet/time counters now.
    pub fn new(now: Instant) -> Self {
        let mut rotator = Self {
            base_interval: DEFAULT_SESSION_ROTATION_INTERVAL,
            max_packets: DEFAULT_SESSION_ROTATION_PACKETS,
            session_id: random_u64(),
            packets_since_rotation: 0,
            last_rotation: now,
            next_interval: DEFAULT_SESSION_ROTATION_INTERVAL,
        };
        rotator.next_interval = rotator.compute_jittered_interval();
        rotator
    }

    /// Create a rotator with an explicit base interval and packet trigger
    /// (used by tests; production call sites use [`Self::new`]).
    pub fn with_params(base_interval: Duration, max_packets: u64, now: Instant) -> Self {
        let mut rotator = Self {
            base_interval,
            max_packets,
            session_id: random_u64(),
            packets_since_rotation: 0,
            last_rotation: now,
            next_interval: base_interval,
        };
        rotator.next_interval = rotator.compute_jittered_interval();
        rotator
    }

    /// Exponential(λ = 3/base) sample, then a 33%/67% shorten/lengthen
    /// split (lengthening clamped to `2x` the raw jitter range), floored
    /// at 25% of the base interval.
    fn compute_jittered_interval(&self) -> Duration {
        let base_secs = self.base_interval.as_secs_f64();
        let scale = base_secs / 3.0;

        let u = random_unit_f64().max(f64::MIN_POSITIVE);
        let exp_sample = -scale * u.ln();

        let candidate = if random_unit_f64() < SHORTEN_PROBABILITY {
            base_secs - exp_sample
        } else {
            base_secs + exp_sample.min(scale * LENGTHEN_CLAMP_FACTOR)
        };

        let floor = base_secs * FLOOR_FACTOR;
        Duration::from_secs_f64(candidate.max(floor))
    }

    /// Record that a packet was sent or received under the current
    /// session id.
    pub fn on_packet(&mut self) {
        self.packets_since_rotation += 1;
    }

    /// Whether rotation is due: packet count or elapsed jittered interval
    /// exceeded.
    pub fn should_rotate(&self, now: Instant) -> bool {
        self.packets_since_rotation >= self.max_packets || now.duration_since(self.last_rotation) >= self.next_interval
    }

    /// Pick a new session id (retrying once on collision with the
    /// current one) and recompute the jittered interval. Does not touch
    /// any other session state - see the invariant documented on
    /// [`super::session::TransportSession::rotate_session`].
    pub fn rotate(&mut self, now: Instant) -> u64 {
        let mut new_id = random_u64();
        if new_id == self.session_id {
            new_id = random_u64();
        }
        self.session_id = new_id;
        self.packets_since_rotation = 0;
        self.last_rotation = now;
        self.next_interval = self.compute_jittered_interval();
        self.session_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_rotate_before_threshold() {
        let now = Instant::now();
        let mut r = SessionRotator::with_params(Duration::from_secs(30), 1_000_000, now);
        r.on_packet();
        assert!(!r.should_rotate(now));
    }

    #[test]
    fn rotates_on_packet_count_trigger() {
        let now = Instant::now();
        let mut r = SessionRotator::with_params(Duration::from_secs(3600), 5, now);
        for _ in 0..5 {
            r.on_packet();
        }
        assert!(r.should_rotate(now));
    }

    #[test]
    fn rotate_changes_session_id() {
        let now = Instant::now();
        let mut r = SessionRotator::with_params(Duration::from_secs(30), 1_000_000, now);
        let old_id = r.session_id();
        let new_id = r.rotate(now);
        assert_ne!(old_id, new_id);
        assert_eq!(r.session_id(), new_id);
    }

    #[test]
    fn rotate_resets_packet_counter() {
        let now = Instant::now();
        let mut r = SessionRotator::with_params(Duration::from_secs(30), 10, now);
        for _ in 0..10 {
            r.on_packet();
        }
        r.rotate(now);
        assert_eq!(r.packets_since_rotation, 0);
    }

    #[test]
    fn jittered_interval_respects_floor() {
        let now = Instant::now();
        let base = Duration::from_secs(30);
        for _ in 0..50 {
            let r = SessionRotator::with_params(base, 1_000_000, now);
            assert!(r.next_interval.as_secs_f64() >= base.as_secs_f64() * FLOOR_FACTOR - 0.001);
        }
    }
}
