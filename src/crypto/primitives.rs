//! Low-level cryptographic primitives: X25519, HKDF, HMAC-SHA256, and
//! ChaCha20-Poly1305 AEAD.
//!
//! Every operation here is a thin, direct wrapper over a RustCrypto crate;
//! the point of this module is to give the rest of the codebase a single
//! place that names the primitive, not to add behavior.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::core::{AEAD_KEY_SIZE, AEAD_NONCE_SIZE, X25519_KEY_SIZE};
use crate::crypto::secret::Secret;

/// Generate a new random X25519 keypair.
pub fn x25519_keypair() -> (Secret<X25519_KEY_SIZE>, [u8; X25519_KEY_SIZE]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (Secret::new(secret.to_bytes()), public.to_bytes())
}

/// Compute the X25519 shared secret `DH(sk, peer_pk)`.
///
/// Returns `None` if `peer_pk` is a low-order point, in which case the
/// resulting shared secret is all-zero and MUST NOT be used.
pub fn x25519_shared(
    sk: &Secret<X25519_KEY_SIZE>,
    peer_pk: &[u8; X25519_KEY_SIZE],
) -> Option<Secret<X25519_KEY_SIZE>> {
    let secret = StaticSecret::from(*sk.expose());
    let public = PublicKey::from(*peer_pk);
    let shared = secret.diffie_hellman(&public);
    if shared.was_contributory() {
        Some(Secret::new(*shared.as_bytes()))
    } else {
        None
    }
}

/// HKDF-Extract (HMAC-SHA256 based): `salt, ikm -> prk`.
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> Secret<32> {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    Secret::new(prk.into())
}

/// HKDF-Expand: `prk, info -> L` bytes.
///
/// Panics only if `len` exceeds HKDF-SHA256's 255*32-byte output limit,
/// which none of this crate's call sites can reach.
pub fn hkdf_expand(prk: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::from_prk(prk).expect("PRK length matches SHA-256 output");
    let mut out = vec![0u8; len];
    hk.expand(info, &mut out).expect("output length within HKDF limit");
    out
}

/// HMAC-SHA256 over `msg` keyed by `key`.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_sha256_verify(key: &[u8], msg: &[u8], tag: &[u8; 32]) -> bool {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.verify_slice(tag).is_ok()
}

/// ChaCha20-Poly1305 AEAD encrypt. Returns `plaintext.len() + 16` bytes.
pub fn aead_encrypt(key: &[u8; AEAD_KEY_SIZE], nonce: &[u8; AEAD_NONCE_SIZE], aad: &[u8], pt: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: pt, aad })
        .expect("encryption over bounded plaintext cannot fail")
}

/// ChaCha20-Poly1305 AEAD decrypt.
///
/// Returns `None` on tag mismatch or any other failure; the underlying
/// crate is constant-time on tag comparison, so no early return is taken
/// based on ciphertext content before the full tag check completes.
pub fn aead_decrypt(key: &[u8; AEAD_KEY_SIZE], nonce: &[u8; AEAD_NONCE_SIZE], aad: &[u8], ct: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad }).ok()
}

/// Fill `buf` with cryptographically strong random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// A cryptographically strong random `u64`.
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}
