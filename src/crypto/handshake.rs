//! The VEIL handshake: two AEAD-wrapped messages authenticated by a
//! pre-shared key, establishing an X25519-derived session.
//!
//! Unlike a Noise pattern, the wire envelope here carries no plaintext
//! magic, version, or type byte — see the module-level doc on
//! [`encode_envelope`] for the DPI-resistance rationale.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::{
    ConfigError, HANDSHAKE_MAGIC, HANDSHAKE_OBFUSCATE_LABEL, HANDSHAKE_PADDING_MAX,
    HANDSHAKE_PADDING_MIN, HANDSHAKE_VERSION, SESSION_KEY_INFO_PREFIX,
};
use crate::crypto::primitives::{
    aead_decrypt, aead_encrypt, hkdf_expand, hkdf_extract, hmac_sha256, hmac_sha256_verify,
    random_bytes, random_u64, x25519_keypair, x25519_shared,
};
use crate::crypto::secret::Secret;
use crate::crypto::session_keys::{derive_session_keys, Role, SessionKeys};

const TYPE_INIT: u8 = 0;
const TYPE_RESPONSE: u8 = 1;

/// A completed handshake: session keys plus the transcript-binding public
/// keys and, for multi-client responders, the matching `client_id`.
pub struct HandshakeSession {
    /// Derived session keys, role-assigned.
    pub keys: SessionKeys,
    /// Server-assigned session id (present after the RESPONSE is processed).
    pub session_id: u64,
    /// Initiator's ephemeral public key (transcript binding).
    pub initiator_pub: [u8; 32],
    /// Responder's ephemeral public key (transcript binding).
    pub responder_pub: [u8; 32],
    /// `client_id` of the registry entry whose PSK matched, if any.
    pub client_id: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn derive_handshake_key(psk: &[u8]) -> Secret<32> {
    let prk = hkdf_extract(b"VEIL-HANDSHAKE-SALT", psk);
    let material = hkdf_expand(prk.expose(), HANDSHAKE_OBFUSCATE_LABEL, 32);
    let mut key = [0u8; 32];
    key.copy_from_slice(&material);
    Secret::new(key)
}

fn random_padding_len() -> u16 {
    let mut buf = [0u8; 2];
    random_bytes(&mut buf);
    let span = (HANDSHAKE_PADDING_MAX - HANDSHAKE_PADDING_MIN) as u16 + 1;
    HANDSHAKE_PADDING_MIN as u16 + (u16::from_be_bytes(buf) % span)
}

/// Wrap a plaintext handshake message: `[12 random nonce][AEAD ct][16 tag]`.
///
/// Because the only bytes on the wire ahead of the ciphertext are a
/// uniformly random nonce, an observer without the PSK cannot distinguish
/// this datagram from random noise, let alone recover a magic/version/type
/// byte — that structure only exists inside the AEAD plaintext.
pub fn encode_envelope(key: &Secret<32>, plaintext: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; 12];
    random_bytes(&mut nonce);
    let ct = aead_encrypt(key.expose(), &nonce, &[], plaintext);
    let mut out = Vec::with_capacity(12 + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    out
}

/// Unwrap a handshake envelope with a candidate key. `None` on any
/// decryption failure - the caller tries the next PSK candidate, if any.
pub fn decode_envelope(key: &Secret<32>, packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < 12 + 16 {
        return None;
    }
    let (nonce, ct) = packet.split_at(12);
    aead_decrypt(key.expose(), nonce.try_into().ok()?, &[], ct)
}

struct InitPlaintext {
    timestamp_ms: u64,
    initiator_pub: [u8; 32],
}

fn encode_init_plaintext(timestamp_ms: u64, initiator_pub: &[u8; 32], psk: &[u8]) -> Vec<u8> {
    let padding_len = random_padding_len();
    let mut hmac_payload = Vec::new();
    hmac_payload.extend_from_slice(&HANDSHAKE_MAGIC);
    hmac_payload.push(HANDSHAKE_VERSION);
    hmac_payload.push(TYPE_INIT);
    hmac_payload.extend_from_slice(&timestamp_ms.to_be_bytes());
    hmac_payload.extend_from_slice(initiator_pub);
    let tag = hmac_sha256(psk, &hmac_payload);

    let mut padding = vec![0u8; padding_len as usize];
    random_bytes(&mut padding);

    let mut out = hmac_payload;
    out.extend_from_slice(&tag);
    out.extend_from_slice(&padding_len.to_be_bytes());
    out.extend_from_slice(&padding);
    out
}

fn decode_init_plaintext(pt: &[u8], psk: &[u8]) -> Option<InitPlaintext> {
    // magic(2) version(1) type(1) timestamp(8) pub(32) tag(32) padding_len(2) padding(..)
    const FIXED_LEN: usize = 2 + 1 + 1 + 8 + 32 + 32 + 2;
    if pt.len() < FIXED_LEN {
        return None;
    }
    if pt[0..2] != HANDSHAKE_MAGIC || pt[2] != HANDSHAKE_VERSION || pt[3] != TYPE_INIT {
        return None;
    }
    let timestamp_ms = u64::from_be_bytes(pt[4..12].try_into().ok()?);
    let mut initiator_pub = [0u8; 32];
    initiator_pub.copy_from_slice(&pt[12..44]);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&pt[44..76]);
    let padding_len = u16::from_be_bytes(pt[76..78].try_into().ok()?);

    if !(HANDSHAKE_PADDING_MIN..=HANDSHAKE_PADDING_MAX).contains(&(padding_len as usize)) {
        return None;
    }
    if pt.len() != FIXED_LEN + padding_len as usize {
        return None;
    }

    let hmac_payload = &pt[0..44];
    if !hmac_sha256_verify(psk, hmac_payload, &tag) {
        return None;
    }

    Some(InitPlaintext { timestamp_ms, initiator_pub })
}

struct ResponsePlaintext {
    init_ts: u64,
    session_id: u64,
    responder_pub: [u8; 32],
}

fn encode_response_plaintext(
    init_ts: u64,
    resp_ts: u64,
    session_id: u64,
    initiator_pub: &[u8; 32],
    responder_pub: &[u8; 32],
    psk: &[u8],
) -> Vec<u8> {
    let padding_len = random_padding_len();
    let mut hmac_payload = Vec::new();
    hmac_payload.extend_from_slice(&HANDSHAKE_MAGIC);
    hmac_payload.push(HANDSHAKE_VERSION);
    hmac_payload.push(TYPE_RESPONSE);
    hmac_payload.extend_from_slice(&init_ts.to_be_bytes());
    hmac_payload.extend_from_slice(&resp_ts.to_be_bytes());
    hmac_payload.extend_from_slice(&session_id.to_be_bytes());
    hmac_payload.extend_from_slice(initiator_pub);
    hmac_payload.extend_from_slice(responder_pub);
    let tag = hmac_sha256(psk, &hmac_payload);

    let mut padding = vec![0u8; padding_len as usize];
    random_bytes(&mut padding);

    // Wire layout omits initiator_pub (the initiator already knows it);
    // it is included only in the HMAC transcript above.
    let mut out = Vec::new();
    out.extend_from_slice(&HANDSHAKE_MAGIC);
    out.push(HANDSHAKE_VERSION);
    out.push(TYPE_RESPONSE);
    out.extend_from_slice(&init_ts.to_be_bytes());
    out.extend_from_slice(&resp_ts.to_be_bytes());
    out.extend_from_slice(&session_id.to_be_bytes());
    out.extend_from_slice(responder_pub);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&padding_len.to_be_bytes());
    out.extend_from_slice(&padding);
    out
}

fn decode_response_plaintext(pt: &[u8], initiator_pub: &[u8; 32], psk: &[u8]) -> Option<ResponsePlaintext> {
    // magic(2) version(1) type(1) init_ts(8) resp_ts(8) session_id(8) resp_pub(32) tag(32) padding_len(2)
    const FIXED_LEN: usize = 2 + 1 + 1 + 8 + 8 + 8 + 32 + 32 + 2;
    if pt.len() < FIXED_LEN {
        return None;
    }
    if pt[0..2] != HANDSHAKE_MAGIC || pt[2] != HANDSHAKE_VERSION || pt[3] != TYPE_RESPONSE {
        return None;
    }
    let init_ts = u64::from_be_bytes(pt[4..12].try_into().ok()?);
    let resp_ts = u64::from_be_bytes(pt[12..20].try_into().ok()?);
    let session_id = u64::from_be_bytes(pt[20..28].try_into().ok()?);
    let mut responder_pub = [0u8; 32];
    responder_pub.copy_from_slice(&pt[28..60]);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&pt[60..92]);
    let padding_len = u16::from_be_bytes(pt[92..94].try_into().ok()?);

    if !(HANDSHAKE_PADDING_MIN..=HANDSHAKE_PADDING_MAX).contains(&(padding_len as usize)) {
        return None;
    }
    if pt.len() != FIXED_LEN + padding_len as usize {
        return None;
    }

    let mut hmac_payload = Vec::with_capacity(44 + 8 + 32);
    hmac_payload.extend_from_slice(&pt[0..28]);
    hmac_payload.extend_from_slice(initiator_pub);
    hmac_payload.extend_from_slice(&responder_pub);
    if !hmac_sha256_verify(psk, &hmac_payload, &tag) {
        return None;
    }

    Some(ResponsePlaintext { init_ts, session_id, responder_pub })
}

/// Token-bucket rate limiter guarding the responder's trial-decrypt path
/// against INIT floods.
pub struct HandshakeRateLimiter {
    capacity: u32,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: std::time::Instant,
}

impl HandshakeRateLimiter {
    /// Create a limiter with the given bucket capacity and refill period
    /// (one token granted per `refill` elapsed, up to `capacity`).
    pub fn new(capacity: u32, refill: Duration) -> Self {
        let refill_per_ms = 1.0 / refill.as_millis().max(1) as f64;
        Self {
            capacity,
            tokens: capacity as f64,
            refill_per_ms,
            last_refill: std::time::Instant::now(),
        }
    }

    /// Attempt to consume one token. Returns `false` if the bucket is
    /// exhausted, in which case the caller MUST silently drop the datagram.
    pub fn try_acquire(&mut self) -> bool {
        let elapsed_ms = self.last_refill.elapsed().as_millis() as f64;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity as f64);
        self.last_refill = std::time::Instant::now();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Fixed-capacity, LRU-evicting cache of `(init_ts, initiator_pub)` pairs,
/// rejecting a byte-for-byte replayed INIT even within the HMAC-valid
/// skew window. Checked before HMAC verification (see
/// [`ResponderState::process_init`]) to avoid an HMAC-based probing oracle.
pub struct ReplayCache {
    capacity: usize,
    entries: VecDeque<(u64, [u8; 32])>,
}

impl ReplayCache {
    /// Create a cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    /// Returns `true` if `(ts, pub_key)` was already seen, inserting it
    /// (and evicting the oldest entry if full) if not.
    pub fn check_and_insert(&mut self, ts: u64, pub_key: &[u8; 32]) -> bool {
        if self.entries.iter().any(|(t, p)| *t == ts && p == pub_key) {
            return true;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((ts, *pub_key));
        false
    }
}

/// A PSK candidate supplied to [`ResponderState::process_init`]; either a
/// single fixed PSK or an iterator over the client registry plus fallback.
pub struct PskCandidate<'a> {
    /// `client_id` this PSK belongs to, or `None` for the fallback PSK.
    pub client_id: Option<&'a str>,
    /// The PSK bytes.
    pub psk: &'a [u8],
}

/// Server-side handshake state: rate limiter and replay cache. Shared
/// across all INIT attempts on a listening socket.
pub struct ResponderState {
    rate_limiter: HandshakeRateLimiter,
    replay_cache: ReplayCache,
    skew_tolerance: Duration,
}

/// Outcome of a successfully processed INIT.
pub struct ResponderOutcome {
    /// RESPONSE packet bytes to send back to the initiator.
    pub response_packet: Vec<u8>,
    /// The newly established session.
    pub session: HandshakeSession,
}

impl ResponderState {
    /// Construct responder state with the given rate-limit and
    /// replay-cache parameters.
    pub fn new(rate_capacity: u32, rate_refill: Duration, replay_cache_capacity: usize, skew_tolerance: Duration) -> Self {
        Self {
            rate_limiter: HandshakeRateLimiter::new(rate_capacity, rate_refill),
            replay_cache: ReplayCache::new(replay_cache_capacity),
            skew_tolerance,
        }
    }

    /// Process an incoming datagram, trying each `candidate` PSK in turn.
    ///
    /// Returns `None` for any failure (rate limited, no PSK matched, bad
    /// format, stale timestamp, replayed INIT, bad HMAC) - all of which are
    /// protocol-violation or resource-exhaustion outcomes the caller must
    /// treat as a silent drop plus a stats increment, never logging detail.
    pub fn process_init(&mut self, packet: &[u8], candidates: &[PskCandidate<'_>]) -> Option<ResponderOutcome> {
        if !self.rate_limiter.try_acquire() {
            return None;
        }

        let now = now_ms();
        for candidate in candidates {
            let key = derive_handshake_key(candidate.psk);
            let Some(plaintext) = decode_envelope(&key, packet) else { continue };

            // Peek the fields needed for the replay check without yet
            // verifying HMAC, so a replay is rejected before any
            // HMAC-based oracle could be probed.
            const FIXED_LEN: usize = 2 + 1 + 1 + 8 + 32;
            if plaintext.len() < FIXED_LEN + 32 + 2 {
                continue;
            }
            if plaintext[0..2] != HANDSHAKE_MAGIC || plaintext[2] != HANDSHAKE_VERSION || plaintext[3] != TYPE_INIT {
                continue;
            }
            let Ok(ts_bytes) = plaintext[4..12].try_into() else { continue };
            let timestamp_ms = u64::from_be_bytes(ts_bytes);
            let mut initiator_pub = [0u8; 32];
            initiator_pub.copy_from_slice(&plaintext[12..44]);

            let skew_ms = self.skew_tolerance.as_millis() as u64;
            if now.abs_diff(timestamp_ms) > skew_ms {
                continue;
            }
            if self.replay_cache.check_and_insert(timestamp_ms, &initiator_pub) {
                return None;
            }

            let init = decode_init_plaintext(&plaintext, candidate.psk)?;
            debug_assert_eq!(init.timestamp_ms, timestamp_ms);
            debug_assert_eq!(init.initiator_pub, initiator_pub);

            let (responder_sk, responder_pub) = x25519_keypair();
            let shared = x25519_shared(&responder_sk, &init.initiator_pub)?;
            let info = {
                let mut v = Vec::with_capacity(SESSION_KEY_INFO_PREFIX.len() + 64);
                v.extend_from_slice(SESSION_KEY_INFO_PREFIX);
                v.extend_from_slice(&init.initiator_pub);
                v.extend_from_slice(&responder_pub);
                v
            };
            let keys = derive_session_keys(shared.expose(), candidate.psk, &info, Role::Responder);
            drop(shared);
            drop(responder_sk);

            let session_id = random_u64();
            let resp_ts = now_ms();
            let response_plaintext = encode_response_plaintext(
                init.timestamp_ms,
                resp_ts,
                session_id,
                &init.initiator_pub,
                &responder_pub,
                candidate.psk,
            );
            let response_packet = encode_envelope(&key, &response_plaintext);

            return Some(ResponderOutcome {
                response_packet,
                session: HandshakeSession {
                    keys,
                    session_id,
                    initiator_pub: init.initiator_pub,
                    responder_pub,
                    client_id: candidate.client_id.map(str::to_owned),
                },
            });
        }
        None
    }
}

/// Client-side handshake state: the ephemeral keypair and sent timestamp
/// needed to validate the RESPONSE.
pub struct InitiatorState {
    ephemeral_sk: Secret<32>,
    ephemeral_pub: [u8; 32],
    sent_ts: u64,
    psk: Vec<u8>,
}

impl InitiatorState {
    /// Generate an ephemeral keypair and build the INIT packet.
    pub fn create_init(psk: &[u8]) -> (Vec<u8>, Self) {
        let (ephemeral_sk, ephemeral_pub) = x25519_keypair();
        let sent_ts = now_ms();
        let key = derive_handshake_key(psk);
        let plaintext = encode_init_plaintext(sent_ts, &ephemeral_pub, psk);
        let packet = encode_envelope(&key, &plaintext);
        (packet, Self { ephemeral_sk, ephemeral_pub, sent_ts, psk: psk.to_vec() })
    }

    /// Process the RESPONSE datagram, completing the handshake.
    ///
    /// Returns `None` on any failure, including a RESPONSE whose echoed
    /// `init_ts` does not match what this initiator sent.
    pub fn process_response(self, packet: &[u8]) -> Option<HandshakeSession> {
        let key = derive_handshake_key(&self.psk);
        let plaintext = decode_envelope(&key, packet)?;
        let resp = decode_response_plaintext(&plaintext, &self.ephemeral_pub, &self.psk)?;
        if resp.init_ts != self.sent_ts {
            return None;
        }

        let shared = x25519_shared(&self.ephemeral_sk, &resp.responder_pub)?;
        let info = {
            let mut v = Vec::with_capacity(SESSION_KEY_INFO_PREFIX.len() + 64);
            v.extend_from_slice(SESSION_KEY_INFO_PREFIX);
            v.extend_from_slice(&self.ephemeral_pub);
            v.extend_from_slice(&resp.responder_pub);
            v
        };
        let keys = derive_session_keys(shared.expose(), &self.psk, &info, Role::Initiator);

        Some(HandshakeSession {
            keys,
            session_id: resp.session_id,
            initiator_pub: self.ephemeral_pub,
            responder_pub: resp.responder_pub,
            client_id: None,
        })
    }
}

/// Validate a PSK's length per the [32, 64]-byte contract.
pub fn validate_psk_size(psk: &[u8]) -> Result<(), ConfigError> {
    if (crate::core::MIN_PSK_SIZE..=crate::core::MAX_PSK_SIZE).contains(&psk.len()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPskSize(psk.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psk() -> Vec<u8> {
        vec![0xAAu8; 32]
    }

    #[test]
    fn handshake_round_trip() {
        let psk = psk();
        let (init_packet, initiator) = InitiatorState::create_init(&psk);

        let mut responder = ResponderState::new(100, Duration::from_millis(10), 4096, Duration::from_secs(30));
        let candidates = [PskCandidate { client_id: None, psk: &psk }];
        let outcome = responder.process_init(&init_packet, &candidates).expect("handshake succeeds");

        let client_session = initiator
            .process_response(&outcome.response_packet)
            .expect("response accepted");

        assert_eq!(client_session.session_id, outcome.session.session_id);
        assert_eq!(client_session.keys.send_key.expose(), outcome.session.keys.recv_key.expose());
        assert_eq!(client_session.keys.recv_key.expose(), outcome.session.keys.send_key.expose());
    }

    #[test]
    fn wrong_psk_fails() {
        let (init_packet, _initiator) = InitiatorState::create_init(&psk());
        let mut responder = ResponderState::new(100, Duration::from_millis(10), 4096, Duration::from_secs(30));
        let wrong_psk = vec![0xBBu8; 32];
        let candidates = [PskCandidate { client_id: None, psk: &wrong_psk }];
        assert!(responder.process_init(&init_packet, &candidates).is_none());
    }

    #[test]
    fn byte_for_byte_replay_rejected() {
        // Scenario: testable property #10.
        let psk = psk();
        let (init_packet, _initiator) = InitiatorState::create_init(&psk);
        let mut responder = ResponderState::new(100, Duration::from_millis(10), 4096, Duration::from_secs(30));
        let candidates = [PskCandidate { client_id: None, psk: &psk }];

        let first = responder.process_init(&init_packet, &candidates);
        assert!(first.is_some());
        let second = responder.process_init(&init_packet, &candidates);
        assert!(second.is_none());
    }

    #[test]
    fn rate_limit_bucket_of_one() {
        // Scenario F: capacity 1, refill 1/s.
        let psk = psk();
        let mut responder = ResponderState::new(1, Duration::from_secs(1), 4096, Duration::from_secs(30));
        let candidates = [PskCandidate { client_id: None, psk: &psk }];

        let (p1, _i1) = InitiatorState::create_init(&psk);
        let (p2, _i2) = InitiatorState::create_init(&psk);

        assert!(responder.process_init(&p1, &candidates).is_some());
        assert!(responder.process_init(&p2, &candidates).is_none());
    }

    #[test]
    fn multi_client_registry_picks_matching_psk() {
        let alice_psk = vec![1u8; 32];
        let bob_psk = vec![2u8; 32];
        let (init_packet, _initiator) = InitiatorState::create_init(&bob_psk);

        let mut responder = ResponderState::new(100, Duration::from_millis(10), 4096, Duration::from_secs(30));
        let candidates = [
            PskCandidate { client_id: Some("alice"), psk: &alice_psk },
            PskCandidate { client_id: Some("bob"), psk: &bob_psk },
        ];
        let outcome = responder.process_init(&init_packet, &candidates).expect("bob's psk matches");
        assert_eq!(outcome.session.client_id.as_deref(), Some("bob"));
    }

    #[test]
    fn init_first_bytes_differ_across_packets() {
        // Testable property #1.
        let psk = psk();
        let (p1, _) = InitiatorState::create_init(&psk);
        let (p2, _) = InitiatorState::create_init(&psk);
        assert_ne!(&p1[..12], &p2[..12]);
    }
}
