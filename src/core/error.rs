//! Error types for the VEIL core.
//!
//! Follows the taxonomy in the design's error-handling section: protocol
//! violations and resource exhaustion are never constructed as a
//! `VeilError` — they are silent drops with a stats-counter increment, and
//! stay as `None` returns at the call site. `VeilError` exists for the two
//! kinds that DO cross a boundary: configuration errors (fail fast at
//! startup) and I/O errors (logged, retried by the caller).

use thiserror::Error;

/// Errors in the crypto layer.
///
/// Variants here back internal `Result`s used for control flow within a
/// single function; at the handshake/transport session boundary, a
/// `CryptoError` never escapes as a visible failure — callers observe
/// `None` plus a stats increment at the call site instead.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD decryption failed (invalid tag, wrong key, or corrupted ciphertext).
    #[error("AEAD decryption failed")]
    DecryptionFailed,

    /// The supplied peer public key is a low-order point; the shared
    /// secret would not provide the expected security.
    #[error("low-order or otherwise invalid peer public key")]
    InvalidPeerKey,

    /// HKDF expand requested more output than the algorithm can produce.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// `send_sequence` has reached `u64::MAX`; the session must terminate.
    #[error("nonce counter exhausted - session must terminate")]
    CounterExhaustion,
}

/// Errors decoding a wire frame from AEAD plaintext.
///
/// Like [`CryptoError`], these are protocol violations: the caller
/// increments a drop counter and discards the packet, never propagating
/// the error further.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes remained to decode the next field.
    #[error("truncated frame")]
    Truncated,

    /// The frame type byte did not match any known kind.
    #[error("unknown frame type: {0}")]
    UnknownType(u8),

    /// Payload length field does not match remaining buffer length.
    #[error("payload length mismatch")]
    LengthMismatch,
}

/// Configuration errors, detected at startup before any socket is opened.
///
/// Per the error taxonomy, these fail fast with a descriptive message;
/// they are never recovered from at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// PSK length outside `[MIN_PSK_SIZE, MAX_PSK_SIZE]`.
    #[error("invalid PSK size: {0} bytes (must be 32-64)")]
    InvalidPskSize(usize),

    /// `client_id` empty, too long, or containing characters outside
    /// alphanumeric / `-` / `_`.
    #[error("invalid client_id: {0:?}")]
    InvalidClientId(String),

    /// `ip_pool_end < ip_pool_start`, or pool smaller than `max_clients`.
    #[error("invalid IP pool: {0}")]
    InvalidIpPool(String),

    /// `max_clients` exceeds the hard cap.
    #[error("max_clients {0} exceeds cap of {1}")]
    MaxClientsExceeded(usize, usize),
}

/// Top-level VEIL core error.
///
/// Only configuration and I/O errors are represented here; see the module
/// doc comment for why protocol/resource failures are intentionally
/// excluded from this enum.
#[derive(Debug, Error)]
pub enum VeilError {
    /// Configuration failed validation at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Underlying socket or interface I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A fatal internal condition was hit (nonce exhaustion, bug assertion).
    /// The owning session must be aborted; the process keeps running.
    #[error("fatal session error: {0}")]
    Fatal(String),
}
