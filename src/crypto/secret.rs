//! Zeroizing wrapper for sensitive byte buffers.
//!
//! PSKs, session keys, ephemeral secrets, and obfuscation keys all flow
//! through `Secret<N>` so that their memory is zeroed on drop and they
//! are never accidentally `Clone`d or printed.

use zeroize::Zeroize;

/// A fixed-size secret byte buffer, zeroized on drop.
///
/// Deliberately does not implement `Clone` or `Debug`: callers that need
/// to pass a copy of the bytes (e.g. a registry snapshot taken under a
/// read lock before running crypto without the lock held) must do so
/// explicitly via [`Secret::expose`] and re-wrap, making the duplication
/// visible at the call site.
pub struct Secret<const N: usize>([u8; N]);

impl<const N: usize> Secret<N> {
    /// Wrap existing bytes.
    pub fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Borrow the underlying bytes.
    pub fn expose(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> Drop for Secret<N> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// A variable-length secret byte buffer (PSKs may be 32-64 bytes), zeroized
/// on drop.
pub struct SecretVec(Vec<u8>);

impl SecretVec {
    /// Wrap existing bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the underlying bytes.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SecretVec {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Clone for SecretVec {
    /// Explicit, not derived: a registry entry is cloned only to snapshot
    /// PSK bytes out from under a shared lock before running crypto.
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
