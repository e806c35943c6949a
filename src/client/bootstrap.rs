//! Client identity and bootstrap configuration.
//!
//! VEIL authenticates with a pre-shared key rather than a static keypair,
//! so bootstrap only has to validate and hold that PSK (plus an optional
//! `client_id` used for the caller's own bookkeeping) - the ephemeral
//! X25519 keys for a given connection attempt are generated fresh by
//! [`crate::crypto::InitiatorState::create_init`].

use std::net::SocketAddr;

use thiserror::Error;

use crate::auth::is_valid_client_id;
use crate::crypto::validate_psk_size;

/// Errors during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    #[error("invalid psk: {0}")]
    InvalidPsk(#[from] crate::core::ConfigError),
}

/// A client's authentication material: the pre-shared key it holds, and
/// an optional id it identifies itself by to a multi-client responder.
#[derive(Clone)]
pub struct ClientIdentity {
    client_id: Option<String>,
    psk: Vec<u8>,
}

impl ClientIdentity {
    /// Build an identity from a caller-supplied PSK, validating its size
    /// and (if present) the client id's charset and length.
    pub fn new(client_id: Option<String>, psk: Vec<u8>) -> Result<Self, BootstrapError> {
        if let Some(ref id) = client_id {
            if !is_valid_client_id(id) {
                return Err(BootstrapError::InvalidClientId(id.clone()));
            }
        }
        validate_psk_size(&psk)?;
        Ok(Self { client_id, psk })
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn psk(&self) -> &[u8] {
        &self.psk
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .field("psk", &"[REDACTED]")
            .finish()
    }
}

/// Bootstrap configuration: what a client needs before dialing a server.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub identity: ClientIdentity,
    pub server_addr: SocketAddr,
    pub connect_timeout: std::time::Duration,
}
