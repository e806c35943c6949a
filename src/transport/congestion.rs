//! AIMD congestion control with slow start, congestion avoidance, fast
//! recovery, and optional pacing.
//!
//! Ported from the original `CongestionController` (slow start /
//! congestion avoidance / fast recovery state machine over `cwnd` and
//! `ssthresh`, with a token-bucket pacer).

use std::time::{Duration, Instant};

use crate::core::{
    DEFAULT_FAST_RETRANSMIT_THRESHOLD, DEFAULT_INITIAL_CWND, DEFAULT_INITIAL_SSTHRESH, DEFAULT_MIN_PACING_INTERVAL,
    DEFAULT_MSS, DEFAULT_PACING_BURST, DEFAULT_PACING_GAIN,
};

/// Congestion controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

/// Tunables for a [`CongestionController`].
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    pub initial_cwnd: usize,
    pub min_cwnd: usize,
    pub max_cwnd: usize,
    pub initial_ssthresh: usize,
    pub mss: usize,
    pub fast_retransmit_threshold: u32,
    pub enable_pacing: bool,
    pub pacing_gain: f64,
    pub min_pacing_interval: Duration,
    pub max_pacing_burst: usize,
    pub aimd_alpha: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_cwnd: DEFAULT_INITIAL_CWND,
            min_cwnd: DEFAULT_MSS,
            max_cwnd: 64 * 1024 * 1024,
            initial_ssthresh: DEFAULT_INITIAL_SSTHRESH,
            mss: DEFAULT_MSS,
            fast_retransmit_threshold: DEFAULT_FAST_RETRANSMIT_THRESHOLD,
            enable_pacing: true,
            pacing_gain: DEFAULT_PACING_GAIN,
            min_pacing_interval: DEFAULT_MIN_PACING_INTERVAL,
            max_pacing_burst: DEFAULT_PACING_BURST,
            aimd_alpha: 0.5,
        }
    }
}

/// Cumulative counters for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct CongestionStats {
    pub cwnd_increases: u64,
    pub cwnd_decreases: u64,
    pub slow_start_exits: u64,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    pub duplicate_acks: u64,
    pub state_transitions: u64,
    pub pacing_delays: u64,
    pub pacing_tokens_granted: u64,
    pub peak_cwnd: usize,
    pub peak_bytes_in_flight: usize,
}

/// AIMD congestion window controller.
pub struct CongestionController {
    config: CongestionConfig,
    cwnd: f64,
    ssthresh: usize,
    state: CongestionState,
    bytes_in_flight: usize,
    duplicate_acks: u32,
    srtt: Duration,
    pacing_tokens: f64,
    last_pacing_update: Instant,
    stats: CongestionStats,
}

impl CongestionController {
    pub fn new(config: CongestionConfig) -> Self {
        let cwnd = config.initial_cwnd as f64;
        Self {
            ssthresh: config.initial_ssthresh,
            state: CongestionState::SlowStart,
            bytes_in_flight: 0,
            duplicate_acks: 0,
            srtt: Duration::from_millis(100),
            pacing_tokens: config.max_pacing_burst as f64,
            last_pacing_update: Instant::now(),
            stats: CongestionStats {
                peak_cwnd: cwnd as usize,
                ..Default::default()
            },
            cwnd,
            config,
        }
    }

    /// Whether `bytes` more may be sent without exceeding `cwnd`.
    pub fn can_send(&self, bytes: usize) -> bool {
        self.bytes_in_flight + bytes <= self.cwnd as usize
    }

    /// Bytes currently sendable before `cwnd` is exhausted.
    pub fn sendable_bytes(&self) -> usize {
        (self.cwnd as usize).saturating_sub(self.bytes_in_flight)
    }

    /// Record newly in-flight bytes (called when a packet is sent).
    pub fn on_send(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
        self.stats.peak_bytes_in_flight = self.stats.peak_bytes_in_flight.max(self.bytes_in_flight);
    }

    /// A fresh (non-duplicate) ACK arrived covering `acked_bytes`.
    pub fn on_ack(&mut self, acked_bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(acked_bytes);
        self.duplicate_acks = 0;

        match self.state {
            CongestionState::SlowStart => {
                self.cwnd += acked_bytes as f64;
                self.stats.cwnd_increases += 1;
                if self.cwnd as usize >= self.ssthresh {
                    self.state = CongestionState::CongestionAvoidance;
                    self.stats.slow_start_exits += 1;
                    self.stats.state_transitions += 1;
                }
            }
            CongestionState::CongestionAvoidance => {
                let mss = self.config.mss as f64;
                self.cwnd += mss * mss / self.cwnd.max(mss) * (acked_bytes as f64 / mss).max(1.0) / mss;
                self.stats.cwnd_increases += 1;
            }
            CongestionState::FastRecovery => {
                self.cwnd = self.ssthresh as f64;
                self.state = CongestionState::CongestionAvoidance;
                self.stats.state_transitions += 1;
            }
        }

        self.clamp_cwnd();
    }

    /// A duplicate ACK arrived; triggers fast retransmit at the configured
    /// threshold.
    pub fn on_duplicate_ack(&mut self) -> bool {
        self.duplicate_acks += 1;
        self.stats.duplicate_acks += 1;
        if self.duplicate_acks == self.config.fast_retransmit_threshold && self.state != CongestionState::FastRecovery {
            self.on_fast_retransmit_loss();
            return true;
        }
        false
    }

    /// Loss detected via retransmission timeout: halve ssthresh, reset cwnd
    /// to one MSS, return to slow start.
    pub fn on_timeout_loss(&mut self) {
        self.ssthresh = ((self.cwnd * self.config.aimd_alpha) as usize).max(2 * self.config.mss);
        self.cwnd = self.config.mss as f64;
        self.state = CongestionState::SlowStart;
        self.duplicate_acks = 0;
        self.stats.cwnd_decreases += 1;
        self.stats.timeout_retransmits += 1;
        self.stats.state_transitions += 1;
        self.clamp_cwnd();
    }

    /// Loss detected via fast retransmit: halve ssthresh and cwnd, enter
    /// fast recovery.
    pub fn on_fast_retransmit_loss(&mut self) {
        self.ssthresh = ((self.cwnd * self.config.aimd_alpha) as usize).max(2 * self.config.mss);
        self.cwnd = self.ssthresh as f64;
        self.state = CongestionState::FastRecovery;
        self.stats.cwnd_decreases += 1;
        self.stats.fast_retransmits += 1;
        self.stats.state_transitions += 1;
        self.clamp_cwnd();
    }

    /// Fast recovery completed (new non-duplicate ACK acknowledging the
    /// retransmitted segment).
    pub fn on_recovery_complete(&mut self) {
        if self.state == CongestionState::FastRecovery {
            self.cwnd = self.ssthresh as f64;
            self.state = CongestionState::CongestionAvoidance;
            self.stats.state_transitions += 1;
        }
    }

    fn clamp_cwnd(&mut self) {
        self.cwnd = self.cwnd.clamp(self.config.min_cwnd as f64, self.config.max_cwnd as f64);
        self.stats.peak_cwnd = self.stats.peak_cwnd.max(self.cwnd as usize);
    }

    /// Refill the pacing token bucket and report whether a packet may be
    /// sent now under pacing, or the delay until it may.
    pub fn check_pacing(&mut self, now: Instant) -> Option<Duration> {
        if !self.config.enable_pacing {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_pacing_update);
        self.last_pacing_update = now;

        let rate = self.pacing_rate();
        let tokens_per_sec = rate / self.config.mss as f64;
        self.pacing_tokens = (self.pacing_tokens + tokens_per_sec * elapsed.as_secs_f64()).min(self.config.max_pacing_burst as f64);
        self.stats.pacing_tokens_granted += 1;

        if self.pacing_tokens >= 1.0 {
            self.pacing_tokens -= 1.0;
            None
        } else {
            self.stats.pacing_delays += 1;
            Some(self.config.min_pacing_interval)
        }
    }

    /// Pacing send rate in bytes/sec: `pacing_gain * cwnd / srtt`.
    pub fn pacing_rate(&self) -> f64 {
        let srtt_secs = self.srtt.as_secs_f64().max(0.001);
        self.config.pacing_gain * self.cwnd / srtt_secs
    }

    /// Update the SRTT sample used for pacing-rate computation.
    pub fn set_srtt(&mut self, srtt: Duration) {
        self.srtt = srtt;
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd as usize
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    pub fn stats(&self) -> &CongestionStats {
        &self.stats
    }

    /// Reset to the initial slow-start state, preserving configuration.
    pub fn reset(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_slow_start_with_configured_cwnd() {
        let cc = CongestionController::new(CongestionConfig::default());
        assert_eq!(cc.state(), CongestionState::SlowStart);
        assert_eq!(cc.cwnd(), DEFAULT_INITIAL_CWND);
    }

    #[test]
    fn ack_grows_cwnd_in_slow_start() {
        let mut cc = CongestionController::new(CongestionConfig::default());
        let before = cc.cwnd();
        cc.on_ack(1400);
        assert!(cc.cwnd() > before);
    }

    #[test]
    fn three_duplicate_acks_trigger_fast_retransmit() {
        let mut cc = CongestionController::new(CongestionConfig::default());
        assert!(!cc.on_duplicate_ack());
        assert!(!cc.on_duplicate_ack());
        assert!(cc.on_duplicate_ack());
        assert_eq!(cc.state(), CongestionState::FastRecovery);
    }

    #[test]
    fn timeout_loss_resets_to_slow_start_with_min_cwnd() {
        let mut cc = CongestionController::new(CongestionConfig::default());
        cc.on_ack(50_000);
        cc.on_timeout_loss();
        assert_eq!(cc.state(), CongestionState::SlowStart);
        assert_eq!(cc.cwnd(), cc.config.mss);
    }

    #[test]
    fn cwnd_never_exceeds_max() {
        let mut cc = CongestionController::new(CongestionConfig::default());
        for _ in 0..10_000 {
            cc.on_ack(1_000_000);
        }
        assert!(cc.cwnd() <= cc.config.max_cwnd);
    }
}
