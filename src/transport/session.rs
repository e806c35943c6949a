//! The mutable per-peer transport session: sequencing, AEAD framing,
//! retransmission, congestion control, ACK tracking, and session-id
//! rotation, built on top of a completed [`HandshakeSession`].

use std::time::Instant;

use crate::core::{DEFAULT_MAX_FRAGMENT_SIZE, MIN_DATA_PACKET_SIZE, OBFUSCATED_SEQ_SIZE};
use crate::crypto::{aead_decrypt, aead_encrypt, derive_nonce, derive_sequence_obfuscation_key, obfuscate_sequence, HandshakeSession};
use crate::transport::ack_scheduler::PendingAck;
use crate::transport::congestion::CongestionController;
use crate::transport::fragment::FragmentReassembler;
use crate::transport::frame::Frame;
use crate::transport::replay_window::ReplayWindow;
use crate::transport::retransmit::{Priority, RetransmitBuffer};
use crate::transport::rotator::SessionRotator;

const ACK_BITMAP_WINDOW: u64 = 32;

/// Per-session drop counters, distinguishing a replayed sequence from a
/// packet that failed AEAD decryption - the two outcomes [`TransportSession::decrypt_packet`]
/// callers must be able to tell apart.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub packets_dropped_replay: u64,
    pub packets_dropped_decrypt: u64,
}

/// A frame decoded from an incoming packet, owning its plaintext (unlike
/// [`Frame`], which borrows from a caller-held buffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    Data { stream_id: u64, sequence: u64, fin: bool, payload: Vec<u8> },
    Ack { stream_id: u64, ack: u64, bitmap: u32 },
    Control { kind: u8, payload: Vec<u8> },
    Heartbeat { timestamp_ms: u64, sequence: u64, payload: Vec<u8> },
}

/// The live, mutable state of an established VEIL tunnel to one peer.
pub struct TransportSession {
    keys: crate::crypto::SessionKeys,
    obf_send_key: [u8; 32],
    obf_recv_key: [u8; 32],
    session_id: u64,
    send_sequence: u64,
    recv_sequence_max: u64,
    recv_initialized: bool,
    recv_ack_bitmap: u32,
    message_id_counter: u32,
    replay_window: ReplayWindow,
    retransmit: RetransmitBuffer,
    congestion: CongestionController,
    rotator: SessionRotator,
    fragments: FragmentReassembler,
    stats: SessionStats,
    max_fragment_size: usize,
}

impl TransportSession {
    /// Construct a session from a completed handshake. Derives the two
    /// sequence-obfuscation keys once and starts all counters at zero.
    /// `max_fragment_size` is the inner fragment size `encrypt_data` chunks
    /// to - see [`crate::core::VeilConfig::max_fragment_size`], derived
    /// from the configured `mtu`.
    pub fn new(handshake: HandshakeSession, now: Instant, max_fragment_size: usize) -> Self {
        let obf_send_key = *derive_sequence_obfuscation_key(handshake.keys.send_key.expose(), &handshake.keys.send_nonce_base).expose();
        let obf_recv_key = *derive_sequence_obfuscation_key(handshake.keys.recv_key.expose(), &handshake.keys.recv_nonce_base).expose();

        Self {
            keys: handshake.keys,
            obf_send_key,
            obf_recv_key,
            session_id: handshake.session_id,
            send_sequence: 0,
            recv_sequence_max: 0,
            recv_initialized: false,
            recv_ack_bitmap: 0,
            message_id_counter: 0,
            replay_window: ReplayWindow::with_defaults(),
            retransmit: RetransmitBuffer::new(crate::transport::retransmit::DropPolicy::LowPriority),
            congestion: CongestionController::new(Default::default()),
            rotator: SessionRotator::new(now),
            fragments: FragmentReassembler::new(64 * 1024, 4 * 1024 * 1024),
            stats: SessionStats::default(),
            max_fragment_size,
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// Adjust the inner fragment size, e.g. after a path-MTU change.
    pub fn set_max_fragment_size(&mut self, max_fragment_size: usize) {
        self.max_fragment_size = max_fragment_size;
    }

    /// Override the session-id rotator's interval/packet-count trigger.
    /// Production call sites always use the defaults baked into
    /// [`Self::new`]; this exists for tests that need rotation on a
    /// shorter, deterministic schedule.
    #[cfg(test)]
    pub fn set_rotation_params(&mut self, now: Instant, interval: std::time::Duration, max_packets: u64) {
        self.rotator = SessionRotator::with_params(interval, max_packets, now);
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Encrypt `plaintext` as one or more DATA frames, fragmenting if it
    /// exceeds the maximum fragment size. Returns the wire packets to send,
    /// in order.
    pub fn encrypt_data(&mut self, plaintext: &[u8], stream_id: u64, fin: bool, now: Instant) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = if plaintext.len() > self.max_fragment_size {
            plaintext.chunks(self.max_fragment_size).collect()
        } else {
            vec![plaintext]
        };

        let message_id = self.message_id_counter;
        self.message_id_counter = self.message_id_counter.wrapping_add(1);
        let last_index = chunks.len() as u32 - 1;

        let mut packets = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            // Every DATA frame's sequence carries (message_id, fragment_index),
            // even when the message fits in a single fragment - that keeps
            // the receive-side fragment reassembler's keying unambiguous.
            let sequence = Frame::fragment_sequence(message_id, index as u32);
            let frame_fin = fin && index as u32 == last_index;

            let frame = Frame::Data { stream_id, sequence, fin: frame_fin, payload: chunk };
            let encoded = frame.encode();

            let packet = self.seal(&encoded, now);
            packets.push(packet);
        }
        packets
    }

    /// AEAD-seal `plaintext` as the next outgoing packet, inserting a copy
    /// into the retransmit buffer keyed by the pre-increment send sequence.
    fn seal(&mut self, plaintext: &[u8], now: Instant) -> Vec<u8> {
        let seq = self.send_sequence;
        self.send_sequence += 1;

        let nonce = derive_nonce(&self.keys.send_nonce_base, seq);
        let ciphertext = aead_encrypt(self.keys.send_key.expose(), &nonce, &[], plaintext);

        let obfuscated_seq = obfuscate_sequence(seq, &self.obf_send_key);
        let mut packet = Vec::with_capacity(OBFUSCATED_SEQ_SIZE + ciphertext.len());
        packet.extend_from_slice(&obfuscated_seq.to_be_bytes());
        packet.extend_from_slice(&ciphertext);

        let _ = self.retransmit.insert(seq, packet.clone(), Priority::Normal, now);
        self.congestion.on_send(packet.len());
        self.rotator.on_packet();

        packet
    }

    /// Decrypt an incoming wire packet into zero or more owned frames (zero
    /// frames on any rejection: too short, replayed, or AEAD failure).
    pub fn decrypt_packet(&mut self, bytes: &[u8]) -> Vec<DecodedFrame> {
        if bytes.len() < MIN_DATA_PACKET_SIZE {
            return Vec::new();
        }

        let mut seq_bytes = [0u8; OBFUSCATED_SEQ_SIZE];
        seq_bytes.copy_from_slice(&bytes[..OBFUSCATED_SEQ_SIZE]);
        let obfuscated_seq = u64::from_be_bytes(seq_bytes);
        let seq = obfuscate_sequence(obfuscated_seq, &self.obf_recv_key);

        if !self.replay_window.mark_and_check(seq) {
            self.stats.packets_dropped_replay += 1;
            return Vec::new();
        }

        let ciphertext = &bytes[OBFUSCATED_SEQ_SIZE..];
        let nonce = derive_nonce(&self.keys.recv_nonce_base, seq);
        let plaintext = match aead_decrypt(self.keys.recv_key.expose(), &nonce, &[], ciphertext) {
            Some(pt) => pt,
            None => {
                self.replay_window.unmark(seq);
                self.stats.packets_dropped_decrypt += 1;
                return Vec::new();
            }
        };

        if seq > self.recv_sequence_max || !self.recv_initialized {
            let delta = seq.saturating_sub(self.recv_sequence_max);
            if self.recv_initialized && delta < ACK_BITMAP_WINDOW {
                self.recv_ack_bitmap <<= delta;
            } else if self.recv_initialized {
                self.recv_ack_bitmap = 0;
            }
            self.recv_ack_bitmap |= 1;
            self.recv_sequence_max = seq;
            self.recv_initialized = true;
        } else {
            let back = self.recv_sequence_max - seq;
            if back >= 1 && back <= ACK_BITMAP_WINDOW {
                self.recv_ack_bitmap |= 1 << (back - 1);
            }
        }

        self.rotator.on_packet();

        match Frame::decode(&plaintext) {
            Ok((frame, _)) => vec![Self::own_frame(frame)],
            Err(_) => Vec::new(),
        }
    }

    fn own_frame(frame: Frame<'_>) -> DecodedFrame {
        match frame {
            Frame::Data { stream_id, sequence, fin, payload } => DecodedFrame::Data {
                stream_id,
                sequence,
                fin,
                payload: payload.to_vec(),
            },
            Frame::Ack { stream_id, ack, bitmap } => DecodedFrame::Ack { stream_id, ack, bitmap },
            Frame::Control { kind, payload } => DecodedFrame::Control { kind, payload: payload.to_vec() },
            Frame::Heartbeat { timestamp_ms, sequence, payload } => DecodedFrame::Heartbeat {
                timestamp_ms,
                sequence,
                payload: payload.to_vec(),
            },
        }
    }

    /// Apply an incoming cumulative+selective ACK to the retransmit buffer
    /// and congestion controller.
    pub fn process_ack(&mut self, ack: u64, bitmap: u32, now: Instant) {
        let cumulative = ack.saturating_sub(1);
        self.retransmit.acknowledge_cumulative(cumulative, now);
        self.congestion.on_ack(1);

        for i in 0..32 {
            if bitmap & (1 << i) != 0 {
                if let Some(seq) = ack.checked_sub(1).and_then(|c| c.checked_sub(1 + i)) {
                    self.retransmit.acknowledge(seq, now);
                }
            }
        }
    }

    /// Build the ACK frame describing everything received so far.
    pub fn generate_ack(&self, stream_id: u64) -> Frame<'static> {
        Frame::Ack {
            stream_id,
            ack: self.recv_sequence_max + 1,
            bitmap: self.recv_ack_bitmap,
        }
    }

    /// Build the pending-ack payload for external ack-scheduler use.
    pub fn pending_ack(&self) -> PendingAck {
        PendingAck {
            highest_received: self.recv_sequence_max,
            bitmap: self.recv_ack_bitmap,
        }
    }

    pub fn should_rotate_session(&self, now: Instant) -> bool {
        self.rotator.should_rotate(now)
    }

    /// Rotate the session id. Changes ONLY `session_id` - never rederives
    /// keys, never resets `send_sequence`, never resets the replay window.
    pub fn rotate_session(&mut self, now: Instant) -> u64 {
        let prior_send_sequence = self.send_sequence;
        let prior_recv_max = self.recv_sequence_max;

        self.session_id = self.rotator.rotate(now);

        debug_assert_eq!(self.send_sequence, prior_send_sequence);
        debug_assert_eq!(self.recv_sequence_max, prior_recv_max);

        self.session_id
    }

    /// Consult the retransmit buffer for due entries and return the wire
    /// bytes to resend.
    pub fn get_retransmit_packets(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let (to_send, abandoned) = self.retransmit.get_packets_to_retransmit(now);
        if !abandoned.is_empty() {
            self.congestion.on_timeout_loss();
        }
        to_send.into_iter().map(|(_, bytes)| bytes).collect()
    }

    pub fn fragments_mut(&mut self) -> &mut FragmentReassembler {
        &mut self.fragments
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.congestion
    }

    pub fn send_sequence(&self) -> u64 {
        self.send_sequence
    }

    pub fn recv_sequence_max(&self) -> u64 {
        self.recv_sequence_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{InitiatorState, PskCandidate, ResponderState};

    fn paired_sessions() -> (TransportSession, TransportSession) {
        let psk = vec![5u8; 32];
        let now = Instant::now();

        let (init_packet, initiator) = InitiatorState::create_init(&psk);
        let mut responder_state = ResponderState::new(100, std::time::Duration::from_millis(10), 4096, std::time::Duration::from_secs(30));
        let outcome = responder_state
            .process_init(&init_packet, &[PskCandidate { client_id: None, psk: &psk }])
            .expect("handshake should succeed");
        let initiator_session = initiator.process_response(&outcome.response_packet).expect("response should validate");

        (
            TransportSession::new(initiator_session, now, DEFAULT_MAX_FRAGMENT_SIZE),
            TransportSession::new(outcome.session, now, DEFAULT_MAX_FRAGMENT_SIZE),
        )
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let (mut client, mut server) = paired_sessions();
        let packets = client.encrypt_data(b"hello veil", 1, true, Instant::now());
        assert_eq!(packets.len(), 1);

        let frames = server.decrypt_packet(&packets[0]);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DecodedFrame::Data { payload, fin, .. } => {
                assert_eq!(payload, b"hello veil");
                assert!(*fin);
            }
            _ => panic!("expected data frame"),
        }
    }

    #[test]
    fn replayed_packet_rejected() {
        let (mut client, mut server) = paired_sessions();
        let packets = client.encrypt_data(b"hi", 1, false, Instant::now());
        assert_eq!(server.decrypt_packet(&packets[0]).len(), 1);
        assert_eq!(server.decrypt_packet(&packets[0]).len(), 0);
    }

    #[test]
    fn fragments_large_payload() {
        let (mut client, _server) = paired_sessions();
        let payload = vec![7u8; DEFAULT_MAX_FRAGMENT_SIZE * 3 + 10];
        let packets = client.encrypt_data(&payload, 1, true, Instant::now());
        assert_eq!(packets.len(), 4);
    }

    #[test]
    fn rotation_preserves_sequence_and_keys() {
        let (mut client, _server) = paired_sessions();
        client.encrypt_data(b"a", 1, false, Instant::now());
        client.encrypt_data(b"b", 1, false, Instant::now());
        let seq_before = client.send_sequence();
        let id_before = client.session_id();

        let new_id = client.rotate_session(Instant::now());

        assert_ne!(new_id, id_before);
        assert_eq!(client.send_sequence(), seq_before);
    }

    #[test]
    fn send_sequence_never_decreases() {
        let (mut client, _server) = paired_sessions();
        let mut last = client.send_sequence();
        for _ in 0..5 {
            client.encrypt_data(b"x", 1, false, Instant::now());
            assert!(client.send_sequence() > last);
            last = client.send_sequence();
        }
    }

    fn paired_sessions_with_psk(psk: Vec<u8>, max_fragment_size: usize) -> (TransportSession, TransportSession) {
        let now = Instant::now();
        let (init_packet, initiator) = InitiatorState::create_init(&psk);
        let mut responder_state = ResponderState::new(100, std::time::Duration::from_millis(10), 4096, std::time::Duration::from_secs(30));
        let outcome = responder_state
            .process_init(&init_packet, &[PskCandidate { client_id: None, psk: &psk }])
            .expect("handshake should succeed");
        let initiator_session = initiator.process_response(&outcome.response_packet).expect("response should validate");
        (
            TransportSession::new(initiator_session, now, max_fragment_size),
            TransportSession::new(outcome.session, now, max_fragment_size),
        )
    }

    #[test]
    fn scenario_a_basic_round_trip() {
        let (mut client, mut server) = paired_sessions_with_psk(vec![0xAAu8; 32], DEFAULT_MAX_FRAGMENT_SIZE);
        let packets = client.encrypt_data(&[0x01, 0x02, 0x03, 0x04, 0x05], 0, false, Instant::now());
        assert_eq!(packets.len(), 1);

        let frames = server.decrypt_packet(&packets[0]);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DecodedFrame::Data { payload, fin, .. } => {
                assert_eq!(payload.as_slice(), &[0x01, 0x02, 0x03, 0x04, 0x05]);
                assert!(!*fin);
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn scenario_b_replay_protection() {
        let (mut client, mut server) = paired_sessions_with_psk(vec![0xAAu8; 32], DEFAULT_MAX_FRAGMENT_SIZE);
        let packets = client.encrypt_data(&[0x01, 0x02, 0x03, 0x04, 0x05], 0, false, Instant::now());

        assert_eq!(server.decrypt_packet(&packets[0]).len(), 1);
        assert_eq!(server.decrypt_packet(&packets[0]).len(), 0);
        assert_eq!(server.stats().packets_dropped_replay, 1);
    }

    #[test]
    fn scenario_c_tampered_ciphertext() {
        let (mut client, mut server) = paired_sessions_with_psk(vec![0xAAu8; 32], DEFAULT_MAX_FRAGMENT_SIZE);
        let mut packets = client.encrypt_data(&[0x01, 0x02, 0x03], 0, false, Instant::now());
        let packet = &mut packets[0];
        assert!(packet.len() >= 29);
        packet[10] ^= 0xFF;

        assert_eq!(server.decrypt_packet(packet).len(), 0);
        assert_eq!(server.stats().packets_dropped_decrypt, 1);
    }

    #[test]
    fn scenario_d_fragmentation_reassembles_to_original() {
        let (mut client, mut server) = paired_sessions_with_psk(vec![0xAAu8; 32], 10);
        let plaintext: Vec<u8> = (0u8..25).collect();

        let packets = client.encrypt_data(&plaintext, 0, true, Instant::now());
        assert!(packets.len() >= 2);

        let now = Instant::now();
        let mut reassembled: Option<Vec<u8>> = None;
        for packet in &packets {
            for frame in server.decrypt_packet(packet) {
                if let DecodedFrame::Data { sequence, fin, payload, .. } = frame {
                    let (message_id, fragment_index) = Frame::split_fragment_sequence(sequence);
                    if fragment_index == 0 && fin {
                        reassembled = Some(payload);
                    } else {
                        server.fragments_mut().push(message_id, fragment_index, payload, fin, now);
                        if let Some(full) = server.fragments_mut().try_reassemble(message_id) {
                            reassembled = Some(full);
                        }
                    }
                }
            }
        }

        assert_eq!(reassembled.expect("fragments reassembled"), plaintext);
    }

    #[test]
    fn scenario_e_rotation_preserves_sequence_across_peers() {
        let (mut client, mut server) = paired_sessions_with_psk(vec![0xAAu8; 32], DEFAULT_MAX_FRAGMENT_SIZE);
        let mut now = Instant::now();
        client.set_rotation_params(now, std::time::Duration::from_secs(1), 1_000_000);

        for _ in 0..10 {
            let packets = client.encrypt_data(b"x", 0, false, now);
            for packet in &packets {
                server.decrypt_packet(packet);
            }
        }

        now += std::time::Duration::from_secs(2);
        assert!(client.should_rotate_session(now));

        let id_before = client.session_id();
        let new_id = client.rotate_session(now);
        assert_ne!(new_id, id_before);
        assert_eq!(client.send_sequence(), 10);

        let packets = client.encrypt_data(b"y", 0, true, now);
        let frames = server.decrypt_packet(&packets[0]);
        assert_eq!(frames.len(), 1);
    }
}
