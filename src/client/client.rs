//! The client event loop: dials the server, completes the initiator side
//! of the handshake, then owns the resulting [`TransportSession`] for the
//! life of the tunnel.
//!
//! As on the server, TUN I/O crosses this boundary as opaque IP byte
//! blobs over `tun_inbound`/`tun_outbound` channels - this core never
//! touches the TUN device itself.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::client::bootstrap::ClientIdentity;
use crate::core::EVENT_LOOP_RECV_TIMEOUT;
use crate::crypto::InitiatorState;
use crate::transport::{DecodedFrame, Frame, TransportSession, VeilSocket};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("server rejected the handshake")]
    HandshakeRejected,
}

#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_dropped_decrypt: u64,
}

pub struct TunPacket {
    pub payload: Vec<u8>,
}

/// An established VEIL tunnel to one server, ready to carry TUN traffic.
pub struct VeilClient {
    socket: VeilSocket,
    server_addr: SocketAddr,
    transport: TransportSession,
    stats: ClientStats,
}

/// How many times to resend the INIT packet before giving up, and how
/// long to wait for a RESPONSE after each send.
const HANDSHAKE_RETRIES: u32 = 4;
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

impl VeilClient {
    /// Bind a fresh socket, connect it to `server_addr`, and run the
    /// initiator side of the handshake, retrying the INIT packet on a
    /// fixed interval until a valid RESPONSE arrives or the retry budget
    /// is exhausted.
    pub async fn connect(server_addr: SocketAddr, identity: &ClientIdentity, max_fragment_size: usize) -> Result<Self, ClientError> {
        let mut socket = VeilSocket::bind("0.0.0.0:0".parse().unwrap()).await?;
        socket.connect(server_addr).await?;

        for attempt in 0..HANDSHAKE_RETRIES {
            let (init_packet, initiator) = InitiatorState::create_init(identity.psk());
            socket.send(&init_packet).await?;

            match tokio::time::timeout(HANDSHAKE_RETRY_INTERVAL, socket.recv_from()).await {
                Ok(Ok((bytes, from))) if from == server_addr => {
                    let response = bytes.to_vec();
                    if let Some(session) = initiator.process_response(&response) {
                        let session_id = session.session_id;
                        let transport = TransportSession::new(session, Instant::now(), max_fragment_size);
                        info!(%server_addr, session_id, "handshake complete");
                        return Ok(Self { socket, server_addr, transport, stats: ClientStats::default() });
                    }
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!(attempt, "handshake attempt timed out, retrying");
                }
            }
        }

        Err(ClientError::HandshakeTimeout(HANDSHAKE_RETRY_INTERVAL * HANDSHAKE_RETRIES))
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Drive the tunnel until `tun_inbound` closes or a fatal I/O error
    /// occurs. Every send into `tun_outbound` is a fully reassembled IP
    /// packet; every item read from `tun_inbound` is treated as one
    /// complete packet to encrypt and send.
    pub async fn run(&mut self, mut tun_inbound: mpsc::Receiver<TunPacket>, tun_outbound: mpsc::Sender<TunPacket>) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                biased;

                recv = tokio::time::timeout(EVENT_LOOP_RECV_TIMEOUT, self.socket.recv_from()) => {
                    match recv {
                        Ok(Ok((bytes, from))) if from == self.server_addr => {
                            let datagram = bytes.to_vec();
                            self.stats.bytes_in += datagram.len() as u64;
                            self.handle_datagram(&datagram, &tun_outbound).await;
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => {}
                    }
                }

                packet = tun_inbound.recv() => {
                    match packet {
                        Some(packet) => self.handle_tun_packet(packet).await,
                        None => return Ok(()),
                    }
                }
            }

            self.run_timers(Instant::now()).await;
        }
    }

    async fn handle_datagram(&mut self, bytes: &[u8], tun_outbound: &mpsc::Sender<TunPacket>) {
        let frames = self.transport.decrypt_packet(bytes);
        if frames.is_empty() {
            self.stats.packets_dropped_decrypt += 1;
            return;
        }

        let now = Instant::now();
        for frame in frames {
            match frame {
                DecodedFrame::Data { sequence, fin, payload, .. } => {
                    let (message_id, fragment_index) = Frame::split_fragment_sequence(sequence);
                    if fragment_index == 0 && fin {
                        let _ = tun_outbound.send(TunPacket { payload }).await;
                    } else {
                        self.transport.fragments_mut().push(message_id, fragment_index, payload, fin, now);
                        if let Some(assembled) = self.transport.fragments_mut().try_reassemble(message_id) {
                            let _ = tun_outbound.send(TunPacket { payload: assembled }).await;
                        }
                    }
                }
                DecodedFrame::Ack { ack, bitmap, .. } => {
                    self.transport.process_ack(ack, bitmap, now);
                }
                DecodedFrame::Heartbeat { .. } | DecodedFrame::Control { .. } => {}
            }
        }

        let ack_frame = self.transport.generate_ack(0);
        let ack_packet = ack_frame.encode();
        if let Err(e) = self.socket.send(&ack_packet).await {
            warn!(error = %e, "failed to send ack");
        } else {
            self.stats.bytes_out += ack_packet.len() as u64;
        }
    }

    async fn handle_tun_packet(&mut self, packet: TunPacket) {
        let wire_packets = self.transport.encrypt_data(&packet.payload, 0, true, Instant::now());
        for wire_packet in &wire_packets {
            self.stats.bytes_out += wire_packet.len() as u64;
            if let Err(e) = self.socket.send(wire_packet).await {
                warn!(error = %e, "failed to send data packet");
            }
        }
    }

    async fn run_timers(&mut self, now: Instant) {
        for packet in self.transport.get_retransmit_packets(now) {
            self.stats.bytes_out += packet.len() as u64;
            let _ = self.socket.send(&packet).await;
        }

        if self.transport.should_rotate_session(now) {
            let new_id = self.transport.rotate_session(now);
            trace!(new_id, "session rotated");
        }

        self.transport.fragments_mut().cleanup_expired(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientRegistry;
    use crate::crypto::{PskCandidate, ResponderState};

    #[tokio::test]
    async fn connect_completes_handshake_against_a_bare_responder() {
        let server_socket = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let psk = vec![7u8; 32];

        let registry = ClientRegistry::new();
        registry.set_fallback_psk(psk.clone()).await.unwrap();

        let server_task = tokio::spawn(async move {
            let mut server_socket = server_socket;
            let mut responder = ResponderState::new(100, Duration::from_millis(10), 4096, Duration::from_secs(30));
            let (bytes, from) = server_socket.recv_from().await.unwrap();
            let bytes = bytes.to_vec();
            let fallback = registry.get_fallback_psk().await.unwrap();
            let candidates = [PskCandidate { client_id: None, psk: fallback.expose() }];
            let outcome = responder.process_init(&bytes, &candidates).unwrap();
            server_socket.send_to(&outcome.response_packet, from).await.unwrap();
        });

        let identity = ClientIdentity::new(None, psk).unwrap();
        let client = VeilClient::connect(server_addr, &identity, crate::core::DEFAULT_MAX_FRAGMENT_SIZE).await.unwrap();
        assert_eq!(client.server_addr(), server_addr);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_times_out_when_nothing_answers() {
        let dead_socket = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let unreachable = dead_socket.local_addr().unwrap();
        drop(dead_socket);

        let identity = ClientIdentity::new(None, vec![3u8; 32]).unwrap();
        let result = VeilClient::connect(unreachable, &identity, crate::core::DEFAULT_MAX_FRAGMENT_SIZE).await;
        assert!(matches!(result, Err(ClientError::HandshakeTimeout(_))));
    }
}
