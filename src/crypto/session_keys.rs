//! Session key derivation, nonce construction, and sequence obfuscation.

use crate::core::{AEAD_KEY_SIZE, AEAD_NONCE_SIZE};
use crate::crypto::primitives::{hkdf_expand, hkdf_extract};
use crate::crypto::secret::Secret;

/// Role of a peer in a handshake, used to swap send/recv key assignment so
/// that `client.send_key == server.recv_key` and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The peer that sent the INIT message.
    Initiator,
    /// The peer that sent the RESPONSE message.
    Responder,
}

/// Derived per-session key material.
pub struct SessionKeys {
    /// Key used to encrypt packets sent by this peer.
    pub send_key: Secret<AEAD_KEY_SIZE>,
    /// Key used to decrypt packets received from the peer.
    pub recv_key: Secret<AEAD_KEY_SIZE>,
    /// Nonce base (XOR'd with sequence) for `send_key`.
    pub send_nonce_base: [u8; AEAD_NONCE_SIZE],
    /// Nonce base (XOR'd with sequence) for `recv_key`.
    pub recv_nonce_base: [u8; AEAD_NONCE_SIZE],
}

/// Derive session keys from a completed X25519 exchange.
///
/// `shared` is the ECDH output, `psk` binds the pre-shared secret into the
/// transcript, and `info` is the handshake-transcript binding
/// (`SESSION_KEY_INFO_PREFIX || initiator_pub || responder_pub`). `role`
/// decides which of the two derived 32-byte keys becomes `send_key` vs
/// `recv_key`, and likewise for the two nonce bases, so both peers agree
/// on the same pair of keys under opposite labels.
pub fn derive_session_keys(shared: &[u8], psk: &[u8], info: &[u8], role: Role) -> SessionKeys {
    let mut ikm = Vec::with_capacity(shared.len() + psk.len());
    ikm.extend_from_slice(shared);
    ikm.extend_from_slice(psk);
    let prk = hkdf_extract(b"VEIL-SESSION-SALT", &ikm);

    // Derive 2*(key+nonce_base) bytes in one expand, split into the
    // initiator-to-responder and responder-to-initiator halves.
    const HALF: usize = AEAD_KEY_SIZE + AEAD_NONCE_SIZE;
    let material = hkdf_expand(prk.expose(), info, HALF * 2);
    let (i2r, r2i) = material.split_at(HALF);

    let (send, recv) = match role {
        Role::Initiator => (i2r, r2i),
        Role::Responder => (r2i, i2r),
    };

    let mut send_key = [0u8; AEAD_KEY_SIZE];
    let mut send_nonce_base = [0u8; AEAD_NONCE_SIZE];
    send_key.copy_from_slice(&send[..AEAD_KEY_SIZE]);
    send_nonce_base.copy_from_slice(&send[AEAD_KEY_SIZE..]);

    let mut recv_key = [0u8; AEAD_KEY_SIZE];
    let mut recv_nonce_base = [0u8; AEAD_NONCE_SIZE];
    recv_key.copy_from_slice(&recv[..AEAD_KEY_SIZE]);
    recv_nonce_base.copy_from_slice(&recv[AEAD_KEY_SIZE..]);

    SessionKeys {
        send_key: Secret::new(send_key),
        recv_key: Secret::new(recv_key),
        send_nonce_base,
        recv_nonce_base,
    }
}

/// Derive the AEAD nonce for `seq`: the last 8 bytes of `base` XOR'd with
/// `seq` in big-endian.
pub fn derive_nonce(base: &[u8; AEAD_NONCE_SIZE], seq: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = *base;
    let seq_be = seq.to_be_bytes();
    for i in 0..8 {
        nonce[4 + i] ^= seq_be[i];
    }
    nonce
}

/// Derive the sequence-obfuscation key, independent of the AEAD key.
pub fn derive_sequence_obfuscation_key(send_key: &[u8; AEAD_KEY_SIZE], send_nonce_base: &[u8; AEAD_NONCE_SIZE]) -> Secret<32> {
    let prk = hkdf_extract(b"VEIL-SEQ-OBFUSCATE", send_key);
    let material = hkdf_expand(prk.expose(), send_nonce_base, 32);
    let mut out = [0u8; 32];
    out.copy_from_slice(&material);
    Secret::new(out)
}

/// Obfuscate (or, symmetrically, de-obfuscate) a 64-bit sequence number
/// with a keystream derived from `obf_key`, so the monotonic sequence is
/// not visible to a passive on-path observer.
///
/// Deterministic and self-inverse: the keystream depends only on
/// `obf_key`, so `obfuscate_sequence(obfuscate_sequence(seq, k), k) == seq`.
pub fn obfuscate_sequence(seq: u64, obf_key: &[u8; 32]) -> u64 {
    let keystream = hkdf_expand_keystream(obf_key);
    seq ^ keystream
}

fn hkdf_expand_keystream(obf_key: &[u8; 32]) -> u64 {
    // A single fixed-info HKDF expand over the obfuscation key gives an
    // 8-byte keystream block; the obfuscation key itself already commits
    // to (send_key, send_nonce_base), so no further per-packet input is
    // needed here - see derive_sequence_obfuscation_key.
    let prk = hkdf_extract(b"VEIL-SEQ-KEYSTREAM", obf_key);
    let bytes = hkdf_expand(prk.expose(), b"", 8);
    u64::from_be_bytes(bytes.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_swap_between_roles() {
        let shared = [1u8; 32];
        let psk = [2u8; 32];
        let info = b"info";
        let init = derive_session_keys(&shared, &psk, info, Role::Initiator);
        let resp = derive_session_keys(&shared, &psk, info, Role::Responder);
        assert_eq!(init.send_key.expose(), resp.recv_key.expose());
        assert_eq!(init.recv_key.expose(), resp.send_key.expose());
    }

    #[test]
    fn nonce_varies_by_sequence() {
        let base = [0u8; 12];
        assert_ne!(derive_nonce(&base, 1), derive_nonce(&base, 2));
        assert_eq!(&derive_nonce(&base, 0)[..4], &base[..4]);
    }

    #[test]
    fn obfuscation_is_deterministic_and_self_inverse() {
        let key = [9u8; 32];
        let obf = obfuscate_sequence(42, &key);
        assert_eq!(obfuscate_sequence(42, &key), obf);
        assert_eq!(obfuscate_sequence(obf, &key), 42);
    }

    #[test]
    fn obfuscation_differs_across_keys() {
        let a = obfuscate_sequence(1, &[1u8; 32]);
        let b = obfuscate_sequence(1, &[2u8; 32]);
        assert_ne!(a, b);
    }
}
