//! Protocol-wide constants.
//!
//! Grouped by concern; values match the defaults listed in the VEIL
//! configuration surface.

use std::time::Duration;

// ============================================================================
// Cryptography
// ============================================================================

/// X25519 key size (secret and public).
pub const X25519_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 AEAD key size.
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 (IETF, non-extended) nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Size of the per-sequence obfuscation prefix transmitted with every data packet.
pub const OBFUSCATED_SEQ_SIZE: usize = 8;

/// Minimum accepted PSK size in bytes.
pub const MIN_PSK_SIZE: usize = 32;

/// Maximum accepted PSK size in bytes.
pub const MAX_PSK_SIZE: usize = 64;

/// Maximum `client_id` length in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 64;

// ============================================================================
// Handshake
// ============================================================================

/// Handshake wire magic.
pub const HANDSHAKE_MAGIC: [u8; 2] = *b"HS";

/// Handshake wire version.
pub const HANDSHAKE_VERSION: u8 = 1;

/// HKDF label used to derive the handshake-obfuscation AEAD key from the PSK.
pub const HANDSHAKE_OBFUSCATE_LABEL: &[u8] = b"VEIL-HANDSHAKE-OBFUSCATE";

/// HKDF info prefix used to derive session keys.
pub const SESSION_KEY_INFO_PREFIX: &[u8] = b"VEILHS1\0";

/// Minimum handshake padding length, in bytes.
pub const HANDSHAKE_PADDING_MIN: usize = 32;

/// Maximum handshake padding length, in bytes.
pub const HANDSHAKE_PADDING_MAX: usize = 400;

/// Default allowed clock skew for handshake timestamps.
pub const DEFAULT_HANDSHAKE_SKEW: Duration = Duration::from_secs(30);

/// Default handshake rate-limit bucket capacity (tokens).
pub const DEFAULT_HANDSHAKE_RATE_CAPACITY: u32 = 100;

/// Default handshake rate-limit refill period.
pub const DEFAULT_HANDSHAKE_RATE_REFILL: Duration = Duration::from_millis(10);

/// Default replay-cache capacity (INIT dedup, LRU eviction).
pub const DEFAULT_HANDSHAKE_REPLAY_CACHE_CAPACITY: usize = 4096;

// ============================================================================
// Replay window
// ============================================================================

/// Default replay-window size, in bits.
pub const DEFAULT_REPLAY_WINDOW_SIZE: usize = 1024;

/// Default cap on successive mark/unmark cycles per sequence before it is
/// permanently blacklisted (DoS mitigation, spec scenario G).
pub const DEFAULT_REPLAY_UNMARK_CYCLE_CAP: u32 = 3;

// ============================================================================
// Retransmission (RFC 6298)
// ============================================================================

/// Initial RTT estimate before any sample is taken.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

/// Minimum RTO.
pub const DEFAULT_MIN_RTO: Duration = Duration::from_millis(50);

/// Maximum RTO.
pub const DEFAULT_MAX_RTO: Duration = Duration::from_secs(10);

/// RFC 6298 SRTT smoothing factor.
pub const RTO_ALPHA: f64 = 0.125;

/// RFC 6298 RTTVAR smoothing factor.
pub const RTO_BETA: f64 = 0.25;

/// RFC 6298 RTO = SRTT + K * RTTVAR.
pub const RTO_K: f64 = 4.0;

/// Default maximum retransmit attempts before an entry is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retransmit buffer capacity, in bytes.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Default maximum number of pending (unacknowledged) packets.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Default high watermark, in bytes, above which `make_room` is invoked.
pub const DEFAULT_HIGH_WATER_BYTES: usize = 800 * 1024;

/// Default low watermark, in bytes, `make_room` drains down to.
pub const DEFAULT_LOW_WATER_BYTES: usize = 500 * 1024;

/// Default insert rate limit, packets per second.
pub const DEFAULT_INSERT_RATE_LIMIT: u32 = 5_000;

// ============================================================================
// Congestion control (RFC 5681-style AIMD)
// ============================================================================

/// Maximum segment size used by the congestion controller's arithmetic.
pub const DEFAULT_MSS: usize = 1400;

/// Default initial congestion window.
pub const DEFAULT_INITIAL_CWND: usize = 10 * DEFAULT_MSS;

/// Default initial slow-start threshold (large: start in slow start).
pub const DEFAULT_INITIAL_SSTHRESH: usize = 64 * 1024 * 1024;

/// Duplicate-ACK count that triggers fast retransmit.
pub const DEFAULT_FAST_RETRANSMIT_THRESHOLD: u32 = 3;

/// Default pacing gain applied to `cwnd / SRTT`.
pub const DEFAULT_PACING_GAIN: f64 = 1.25;

/// Default pacing burst allowance, in packets.
pub const DEFAULT_PACING_BURST: usize = 10;

/// Default minimum inter-packet pacing interval.
pub const DEFAULT_MIN_PACING_INTERVAL: Duration = Duration::from_micros(100);

// ============================================================================
// ACK scheduling
// ============================================================================

/// Default maximum delay before a delayed ACK is sent.
pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(20);

/// Default number of received packets before an immediate ACK is sent.
pub const DEFAULT_ACK_EVERY_N_PACKETS: u32 = 2;

/// Width of the selective-ack bitmap, in bits.
pub const ACK_BITMAP_BITS: u32 = 32;

// ============================================================================
// Fragmentation
// ============================================================================

/// Default per-message fragment reassembly timeout.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Session rotation
// ============================================================================

/// Default session-id rotation interval (before jitter).
pub const DEFAULT_SESSION_ROTATION_INTERVAL: Duration = Duration::from_secs(30);

/// Default session-id rotation packet-count trigger.
pub const DEFAULT_SESSION_ROTATION_PACKETS: u64 = 1_000_000;

/// `send_sequence` threshold past which a warning is logged (2^64 - 2^32).
pub const SEND_SEQUENCE_WARN_THRESHOLD: u64 = u64::MAX - (1u64 << 32) + 1;

// ============================================================================
// Server session table
// ============================================================================

/// Hard cap on `max_clients`.
pub const MAX_CLIENTS_CAP: usize = 10_000;

/// Default idle-session reap threshold.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// UDP / framing
// ============================================================================

/// Default UDP receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Default outer MTU assumed absent explicit configuration.
pub const DEFAULT_MTU: usize = 1400;

/// Overhead subtracted from `mtu` to get the inner fragment size: obfuscated
/// sequence + AEAD tag + worst-case DATA frame header (kind + stream_id +
/// sequence + fin + payload length).
pub const FRAGMENT_HEADER_OVERHEAD: usize = OBFUSCATED_SEQ_SIZE + AEAD_TAG_SIZE + 22;

/// Default inner fragment size, derived from [`DEFAULT_MTU`].
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = DEFAULT_MTU - FRAGMENT_HEADER_OVERHEAD;

/// Minimum valid data-packet size: obfuscated sequence + AEAD tag + 1 plaintext byte.
pub const MIN_DATA_PACKET_SIZE: usize = OBFUSCATED_SEQ_SIZE + AEAD_TAG_SIZE + 1;

/// Event loop's bounded UDP read timeout.
pub const EVENT_LOOP_RECV_TIMEOUT: Duration = Duration::from_millis(10);
