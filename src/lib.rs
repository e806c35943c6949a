//! # VEIL
//!
//! VEIL is a user-space VPN core: an obfuscated, encrypted UDP transport
//! between a client and a server. It provides:
//!
//! - **Security**: a PSK-authenticated X25519 handshake with forward
//!   secrecy, ChaCha20-Poly1305 AEAD data framing
//! - **Obfuscation**: sequence numbers are XORed with a per-session key
//!   derived from the handshake, so the wire format carries no fixed
//!   plaintext counters
//! - **Reliability over UDP**: replay protection, RFC 6298 RTT/RTO
//!   estimation, AIMD congestion control, delayed ACKs, fragmentation
//!   and reassembly, and periodic session-id rotation
//!
//! ## Feature flags
//!
//! - `transport` (default): frame codec, sockets, congestion/ACK/retransmit
//! - `crypto` (default): handshake and AEAD primitives
//! - `auth` (default): server-side client PSK registry
//! - `client` (default): the client event loop
//! - `server` (default): the server event loop and session table
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, and configuration (always included)
//! - [`crypto`]: handshake and AEAD primitives (requires `crypto`)
//! - [`auth`]: server-side client PSK registry (requires `auth`)
//! - [`transport`]: frame codec, sockets, congestion/retransmit/ACK (requires `transport`)
//! - [`client`]: client event loop (requires `client`)
//! - [`server`]: server event loop and session table (requires `server`)
//!
//! TUN/tap device I/O and platform routing/NAT are explicitly out of
//! scope for this crate: packets cross the client/server event loop
//! boundary as opaque IP byte blobs over the `tun_inbound`/`tun_outbound`
//! channels passed to [`client::VeilClient::run`] and
//! [`server::VeilServer::run`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;

#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

#[cfg(feature = "auth")]
#[cfg_attr(docsrs, doc(cfg(feature = "auth")))]
pub mod auth;

#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Convenient re-exports of the most commonly used types.
pub mod prelude {
    pub use crate::core::*;

    #[cfg(feature = "crypto")]
    pub use crate::crypto::*;

    #[cfg(feature = "auth")]
    pub use crate::auth::*;

    #[cfg(feature = "transport")]
    pub use crate::transport::*;

    #[cfg(feature = "client")]
    pub use crate::client::*;

    #[cfg(feature = "server")]
    pub use crate::server::*;
}
