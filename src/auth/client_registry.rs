//! Server-side mapping of `client_id -> PSK`, plus an optional fallback
//! PSK for clients that don't send an id.
//!
//! Ported from the original `ClientRegistry` (shared-mutex-guarded map,
//! zeroize-on-remove and zeroize-on-drop of every entry).

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::core::{ConfigError, MAX_CLIENT_ID_LEN, MAX_PSK_SIZE, MIN_PSK_SIZE};
use crate::crypto::SecretVec;

/// `client_id` must be non-empty, at most [`MAX_CLIENT_ID_LEN`] bytes, and
/// contain only alphanumerics, `-`, or `_`.
pub fn is_valid_client_id(client_id: &str) -> bool {
    !client_id.is_empty()
        && client_id.len() <= MAX_CLIENT_ID_LEN
        && client_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// PSK size must fall within `[MIN_PSK_SIZE, MAX_PSK_SIZE]`.
pub fn is_valid_psk_size(size: usize) -> bool {
    (MIN_PSK_SIZE..=MAX_PSK_SIZE).contains(&size)
}

struct ClientEntry {
    psk: SecretVec,
    enabled: bool,
}

struct Inner {
    clients: HashMap<String, ClientEntry>,
    fallback_psk: Option<SecretVec>,
}

/// Registry of per-client PSKs used by a multi-client responder.
///
/// Every PSK - per-client and fallback - is zeroized the moment it is
/// replaced or removed, and again when the registry itself is dropped.
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                fallback_psk: None,
            }),
        }
    }

    /// Set (replacing any existing) fallback PSK.
    pub async fn set_fallback_psk(&self, psk: Vec<u8>) -> Result<(), ConfigError> {
        if !is_valid_psk_size(psk.len()) {
            return Err(ConfigError::InvalidPskSize(psk.len()));
        }
        let mut inner = self.inner.write().await;
        inner.fallback_psk = Some(SecretVec::new(psk));
        Ok(())
    }

    pub async fn clear_fallback_psk(&self) {
        let mut inner = self.inner.write().await;
        inner.fallback_psk = None;
    }

    pub async fn has_fallback_psk(&self) -> bool {
        self.inner.read().await.fallback_psk.is_some()
    }

    /// Add a new client. Fails (without mutating state) if `client_id` or
    /// `psk` is invalid, or if `client_id` is already registered.
    pub async fn add_client(&self, client_id: &str, psk: Vec<u8>) -> Result<(), ConfigError> {
        if !is_valid_client_id(client_id) {
            return Err(ConfigError::InvalidClientId(client_id.to_string()));
        }
        if !is_valid_psk_size(psk.len()) {
            return Err(ConfigError::InvalidPskSize(psk.len()));
        }

        let mut inner = self.inner.write().await;
        if inner.clients.contains_key(client_id) {
            return Err(ConfigError::InvalidClientId(client_id.to_string()));
        }
        inner.clients.insert(client_id.to_string(), ClientEntry { psk: SecretVec::new(psk), enabled: true });
        Ok(())
    }

    /// Remove a client, zeroizing its PSK immediately (not merely on next
    /// garbage collection).
    pub async fn remove_client(&self, client_id: &str) -> bool {
        self.inner.write().await.clients.remove(client_id).is_some()
    }

    /// Snapshot of an enabled client's PSK, or `None` if absent/disabled.
    pub async fn get_psk(&self, client_id: &str) -> Option<SecretVec> {
        let inner = self.inner.read().await;
        inner.clients.get(client_id).filter(|e| e.enabled).map(|e| e.psk.clone())
    }

    /// As [`Self::get_psk`], falling back to the registry's fallback PSK
    /// when `client_id` is empty or unknown/disabled.
    pub async fn get_psk_or_fallback(&self, client_id: &str) -> Option<SecretVec> {
        let inner = self.inner.read().await;
        if !client_id.is_empty() {
            if let Some(entry) = inner.clients.get(client_id).filter(|e| e.enabled) {
                return Some(entry.psk.clone());
            }
        }
        inner.fallback_psk.clone()
    }

    pub async fn get_fallback_psk(&self) -> Option<SecretVec> {
        self.inner.read().await.fallback_psk.clone()
    }

    pub async fn enable_client(&self, client_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.clients.get_mut(client_id) {
            Some(entry) => {
                entry.enabled = true;
                true
            }
            None => false,
        }
    }

    pub async fn disable_client(&self, client_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.clients.get_mut(client_id) {
            Some(entry) => {
                entry.enabled = false;
                true
            }
            None => false,
        }
    }

    pub async fn has_client(&self, client_id: &str) -> bool {
        self.inner.read().await.clients.contains_key(client_id)
    }

    pub async fn is_client_enabled(&self, client_id: &str) -> bool {
        self.inner.read().await.clients.get(client_id).is_some_and(|e| e.enabled)
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn get_client_ids(&self) -> Vec<String> {
        self.inner.read().await.clients.keys().cloned().collect()
    }

    /// Snapshot of every enabled client's `(id, psk)`, used by the
    /// handshake responder's trial-decrypt loop.
    pub async fn get_all_enabled_psks(&self) -> Vec<(String, SecretVec)> {
        self.inner
            .read()
            .await
            .clients
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(id, e)| (id.clone(), e.psk.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_fetch_psk() {
        let registry = ClientRegistry::new();
        registry.add_client("alice", vec![1u8; 32]).await.unwrap();
        let psk = registry.get_psk("alice").await.unwrap();
        assert_eq!(psk.expose(), &vec![1u8; 32][..]);
    }

    #[tokio::test]
    async fn rejects_duplicate_client_id() {
        let registry = ClientRegistry::new();
        registry.add_client("alice", vec![1u8; 32]).await.unwrap();
        assert!(registry.add_client("alice", vec![2u8; 32]).await.is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_client_id() {
        let registry = ClientRegistry::new();
        assert!(registry.add_client("has a space", vec![1u8; 32]).await.is_err());
        assert!(registry.add_client("", vec![1u8; 32]).await.is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_psk_size() {
        let registry = ClientRegistry::new();
        assert!(registry.add_client("alice", vec![1u8; 4]).await.is_err());
    }

    #[tokio::test]
    async fn disabled_client_not_returned_by_get_psk() {
        let registry = ClientRegistry::new();
        registry.add_client("alice", vec![1u8; 32]).await.unwrap();
        registry.disable_client("alice").await;
        assert!(registry.get_psk("alice").await.is_none());
    }

    #[tokio::test]
    async fn fallback_used_when_client_id_empty() {
        let registry = ClientRegistry::new();
        registry.set_fallback_psk(vec![9u8; 32]).await.unwrap();
        let psk = registry.get_psk_or_fallback("").await.unwrap();
        assert_eq!(psk.expose(), &vec![9u8; 32][..]);
    }

    #[tokio::test]
    async fn remove_client_clears_entry() {
        let registry = ClientRegistry::new();
        registry.add_client("alice", vec![1u8; 32]).await.unwrap();
        assert!(registry.remove_client("alice").await);
        assert!(!registry.has_client("alice").await);
    }

    #[tokio::test]
    async fn get_all_enabled_psks_excludes_disabled() {
        let registry = ClientRegistry::new();
        registry.add_client("alice", vec![1u8; 32]).await.unwrap();
        registry.add_client("bob", vec![2u8; 32]).await.unwrap();
        registry.disable_client("bob").await;
        let all = registry.get_all_enabled_psks().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "alice");
    }
}
