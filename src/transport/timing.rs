//! RFC 6298 RTT/RTO estimation.

use std::time::Duration;

use crate::core::{DEFAULT_INITIAL_RTT, DEFAULT_MAX_RTO, DEFAULT_MIN_RTO, RTO_ALPHA, RTO_BETA, RTO_K};

/// RTT estimator implementing RFC 6298: SRTT, RTTVAR, and the derived RTO.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    rto: Duration,
    initialized: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create a new estimator; `rto()` returns `DEFAULT_INITIAL_RTT` until
    /// the first sample arrives.
    pub fn new() -> Self {
        Self {
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            rto: DEFAULT_INITIAL_RTT,
            initialized: false,
        }
    }

    /// Feed a new RTT sample. MUST NOT be called with a sample from a
    /// retransmitted packet (Karn's algorithm) - the caller enforces this
    /// by only sampling on first-transmission acknowledgment.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if !self.initialized {
            self.srtt_ms = sample_ms;
            self.rttvar_ms = sample_ms / 2.0;
            self.initialized = true;
        } else {
            self.rttvar_ms = (1.0 - RTO_BETA) * self.rttvar_ms + RTO_BETA * (self.srtt_ms - sample_ms).abs();
            self.srtt_ms = (1.0 - RTO_ALPHA) * self.srtt_ms + RTO_ALPHA * sample_ms;
        }

        self.recompute_rto();
    }

    fn recompute_rto(&mut self) {
        let rto_ms = self.srtt_ms + RTO_K * self.rttvar_ms;
        let rto_ms = rto_ms.clamp(DEFAULT_MIN_RTO.as_millis() as f64, DEFAULT_MAX_RTO.as_millis() as f64);
        self.rto = Duration::from_millis(rto_ms as u64);
    }

    /// Current smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt_ms / 1000.0)
    }

    /// Current RTO.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Whether at least one sample has been taken.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Exponential backoff after a retransmit timeout: doubles the current
    /// RTO (capped at `DEFAULT_MAX_RTO`) and returns the new value.
    pub fn backoff(&mut self, current: Duration) -> Duration {
        let doubled = current.saturating_mul(2);
        doubled.min(DEFAULT_MAX_RTO)
    }
}
