//! The recognized configuration surface, consumed by the core as plain
//! values - parsing any file format is left to an external loader.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::core::constants::{
    DEFAULT_FAST_RETRANSMIT_THRESHOLD, DEFAULT_HANDSHAKE_SKEW, DEFAULT_INITIAL_CWND, DEFAULT_INITIAL_RTT,
    DEFAULT_INITIAL_SSTHRESH, DEFAULT_MAX_ACK_DELAY, DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RTO,
    DEFAULT_MIN_RTO, DEFAULT_MSS, DEFAULT_MTU, DEFAULT_PACING_GAIN, DEFAULT_REPLAY_WINDOW_SIZE,
    DEFAULT_SESSION_ROTATION_INTERVAL, DEFAULT_SESSION_ROTATION_PACKETS, DEFAULT_SESSION_TIMEOUT,
    FRAGMENT_HEADER_OVERHEAD, MAX_CLIENTS_CAP,
};
use crate::core::error::ConfigError;
use crate::transport::DropPolicy;

/// Retransmit-buffer knobs, see §4.3.
#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    pub initial_rtt: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub max_retries: u32,
    pub max_buffer_bytes: usize,
    pub drop_policy: DropPolicy,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_rtt: DEFAULT_INITIAL_RTT,
            min_rto: DEFAULT_MIN_RTO,
            max_rto: DEFAULT_MAX_RTO,
            max_retries: DEFAULT_MAX_RETRIES,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            drop_policy: DropPolicy::LowPriority,
        }
    }
}

/// Congestion-controller knobs, see §4.4.
#[derive(Debug, Clone)]
pub struct CongestionConfigOptions {
    pub initial_cwnd: usize,
    pub initial_ssthresh: usize,
    pub mss: usize,
    pub fast_retransmit_threshold: u32,
    pub enable_pacing: bool,
    pub pacing_gain: f64,
}

impl Default for CongestionConfigOptions {
    fn default() -> Self {
        Self {
            initial_cwnd: DEFAULT_INITIAL_CWND,
            initial_ssthresh: DEFAULT_INITIAL_SSTHRESH,
            mss: DEFAULT_MSS,
            fast_retransmit_threshold: DEFAULT_FAST_RETRANSMIT_THRESHOLD,
            enable_pacing: true,
            pacing_gain: DEFAULT_PACING_GAIN,
        }
    }
}

/// ACK-scheduler knobs, see §4.5.
#[derive(Debug, Clone)]
pub struct AckConfigOptions {
    pub max_ack_delay: Duration,
    pub ack_every_n_packets: u32,
}

impl Default for AckConfigOptions {
    fn default() -> Self {
        Self {
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            ack_every_n_packets: 2,
        }
    }
}

/// The full recognized configuration surface (§6).
#[derive(Debug, Clone)]
pub struct VeilConfig {
    /// Server bind address; unused by client configurations.
    pub listen_address: Option<SocketAddr>,
    /// Client target address; unused by server configurations.
    pub server_address: Option<SocketAddr>,
    /// Raw 32-byte (or up to 64-byte) pre-shared key.
    pub psk: Vec<u8>,
    pub max_clients: usize,
    pub session_timeout: Duration,
    pub ip_pool_start: Ipv4Addr,
    pub ip_pool_end: Ipv4Addr,
    pub mtu: usize,
    pub replay_window_size: usize,
    pub session_rotation_interval: Duration,
    pub session_rotation_packets: u64,
    pub handshake_skew_tolerance: Duration,
    pub retransmit: RetransmitConfig,
    pub congestion: CongestionConfigOptions,
    pub ack: AckConfigOptions,
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            server_address: None,
            psk: Vec::new(),
            max_clients: MAX_CLIENTS_CAP,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            ip_pool_start: Ipv4Addr::new(10, 8, 0, 1),
            ip_pool_end: Ipv4Addr::new(10, 8, 255, 254),
            mtu: DEFAULT_MTU,
            replay_window_size: DEFAULT_REPLAY_WINDOW_SIZE,
            session_rotation_interval: DEFAULT_SESSION_ROTATION_INTERVAL,
            session_rotation_packets: DEFAULT_SESSION_ROTATION_PACKETS,
            handshake_skew_tolerance: DEFAULT_HANDSHAKE_SKEW,
            retransmit: RetransmitConfig::default(),
            congestion: CongestionConfigOptions::default(),
            ack: AckConfigOptions::default(),
        }
    }
}

impl VeilConfig {
    /// Inner fragment size derived from `mtu`, per §6: `mtu − headers`.
    /// Saturates at 1 byte so a pathological `mtu` never underflows.
    pub fn max_fragment_size(&self) -> usize {
        self.mtu.saturating_sub(FRAGMENT_HEADER_OVERHEAD).max(1)
    }

    /// Fail-fast validation, run once at startup before any socket opens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(crate::core::constants::MIN_PSK_SIZE..=crate::core::constants::MAX_PSK_SIZE).contains(&self.psk.len()) {
            return Err(ConfigError::InvalidPskSize(self.psk.len()));
        }

        if self.max_clients > MAX_CLIENTS_CAP {
            return Err(ConfigError::MaxClientsExceeded(self.max_clients, MAX_CLIENTS_CAP));
        }

        let start = u32::from(self.ip_pool_start);
        let end = u32::from(self.ip_pool_end);
        if end < start || (end - start + 1) < self.max_clients as u32 {
            return Err(ConfigError::InvalidIpPool(format!("{}-{}", self.ip_pool_start, self.ip_pool_end)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_valid_psk_passes() {
        let mut config = VeilConfig::default();
        config.psk = vec![0xAA; 32];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_undersized_psk() {
        let mut config = VeilConfig::default();
        config.psk = vec![0xAA; 8];
        assert_eq!(config.validate(), Err(ConfigError::InvalidPskSize(8)));
    }

    #[test]
    fn rejects_max_clients_over_cap() {
        let mut config = VeilConfig::default();
        config.psk = vec![0xAA; 32];
        config.max_clients = MAX_CLIENTS_CAP + 1;
        assert!(matches!(config.validate(), Err(ConfigError::MaxClientsExceeded(_, _))));
    }

    #[test]
    fn rejects_pool_smaller_than_max_clients() {
        let mut config = VeilConfig::default();
        config.psk = vec![0xAA; 32];
        config.max_clients = 10;
        config.ip_pool_start = Ipv4Addr::new(10, 8, 0, 1);
        config.ip_pool_end = Ipv4Addr::new(10, 8, 0, 2);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidIpPool(_))));
    }
}
