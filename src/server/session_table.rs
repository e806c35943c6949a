//! Server-side session table: active client sessions indexed by id,
//! endpoint, and tunnel IP, plus tunnel-IP pool allocation.
//!
//! Ported from the original `SessionTable` (unordered_map + endpoint/IP
//! indices + a stack of available pool addresses, guarded by one mutex).

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::core::{ConfigError, MAX_CLIENTS_CAP};
use crate::transport::{AckScheduler, AckSchedulerConfig, TransportSession};

/// A single connected client's session state.
pub struct ClientSession {
    pub session_id: u64,
    pub endpoint: SocketAddr,
    pub tunnel_ip: Ipv4Addr,
    pub transport: TransportSession,
    pub ack_scheduler: AckScheduler,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
}

/// Cumulative table-level counters.
#[derive(Debug, Clone, Default)]
pub struct SessionTableStats {
    pub active_sessions: usize,
    pub total_sessions_created: u64,
    pub sessions_timed_out: u64,
    pub sessions_rejected_full: u64,
}

/// A point-in-time copy of session metadata, safe to hold after the
/// originating session has been removed from the table.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: u64,
    pub endpoint: SocketAddr,
    pub tunnel_ip: Ipv4Addr,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
}

struct Inner {
    sessions: HashMap<u64, ClientSession>,
    endpoint_index: HashMap<SocketAddr, u64>,
    ip_index: HashMap<Ipv4Addr, u64>,
    available_ips: VecDeque<Ipv4Addr>,
    next_session_id: u64,
    stats: SessionTableStats,
}

/// Table of active client sessions, with IP pool allocation and idle
/// expiry.
pub struct SessionTable {
    max_clients: usize,
    session_timeout: Duration,
    inner: Mutex<Inner>,
}

impl SessionTable {
    /// Create a table over the closed IP range `[pool_start, pool_end]`.
    /// `max_clients` is clamped to [`MAX_CLIENTS_CAP`]; the pool MUST be at
    /// least as large as `max_clients`.
    pub fn new(max_clients: usize, session_timeout: Duration, pool_start: Ipv4Addr, pool_end: Ipv4Addr) -> Result<Self, ConfigError> {
        let max_clients = max_clients.min(MAX_CLIENTS_CAP);
        let start = u32::from(pool_start);
        let end = u32::from(pool_end);
        if end < start {
            return Err(ConfigError::InvalidIpPool(format!("{pool_start}-{pool_end}")));
        }
        let pool_size = (end - start + 1) as usize;
        if pool_size < max_clients {
            return Err(ConfigError::InvalidIpPool(format!("{pool_start}-{pool_end}")));
        }

        let available_ips = (start..=end).map(Ipv4Addr::from).collect();

        Ok(Self {
            max_clients,
            session_timeout,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                endpoint_index: HashMap::new(),
                ip_index: HashMap::new(),
                available_ips,
                next_session_id: 1,
                stats: SessionTableStats::default(),
            }),
        })
    }

    /// Create a session for a newly-handshaked client. Returns the new
    /// session id, or `None` if the table is full or the IP pool is
    /// exhausted.
    pub async fn create_session(&self, endpoint: SocketAddr, transport: TransportSession, now: Instant) -> Option<u64> {
        let mut inner = self.inner.lock().await;

        if inner.sessions.len() >= self.max_clients {
            inner.stats.sessions_rejected_full += 1;
            return None;
        }

        let tunnel_ip = inner.available_ips.pop_front()?;
        let session_id = inner.next_session_id;
        inner.next_session_id += 1;

        let session = ClientSession {
            session_id,
            endpoint,
            tunnel_ip,
            transport,
            ack_scheduler: AckScheduler::new(AckSchedulerConfig::default()),
            connected_at: now,
            last_activity: now,
            bytes_received: 0,
            bytes_sent: 0,
            packets_received: 0,
            packets_sent: 0,
        };

        inner.endpoint_index.insert(endpoint, session_id);
        inner.ip_index.insert(tunnel_ip, session_id);
        inner.sessions.insert(session_id, session);
        inner.stats.total_sessions_created += 1;
        inner.stats.active_sessions = inner.sessions.len();

        Some(session_id)
    }

    pub async fn update_activity(&self, session_id: u64, now: Instant) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.last_activity = now;
        }
    }

    /// Move `session_id`'s tunnel-ip mapping from its current address to
    /// `new_ip` (used when a client presents its own configured tunnel
    /// IP rather than the server-assigned one).
    pub async fn update_tunnel_ip(&self, session_id: u64, new_ip: Ipv4Addr) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get(&session_id) else {
            return false;
        };
        let old_ip = session.tunnel_ip;

        inner.ip_index.remove(&old_ip);
        inner.ip_index.insert(new_ip, session_id);
        inner.sessions.get_mut(&session_id).unwrap().tunnel_ip = new_ip;
        true
    }

    /// Remove a session explicitly, returning its tunnel IP to the pool.
    pub async fn remove_session(&self, session_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.remove(&session_id) else {
            return false;
        };
        inner.endpoint_index.remove(&session.endpoint);
        inner.ip_index.remove(&session.tunnel_ip);
        inner.available_ips.push_back(session.tunnel_ip);
        inner.stats.active_sessions = inner.sessions.len();
        true
    }

    /// Remove every session idle for at least `session_timeout`, returning
    /// their tunnel IPs to the pool. Returns the number removed.
    pub async fn cleanup_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().await;
        let expired: Vec<u64> = inner
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) >= self.session_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(session) = inner.sessions.remove(id) {
                inner.endpoint_index.remove(&session.endpoint);
                inner.ip_index.remove(&session.tunnel_ip);
                inner.available_ips.push_back(session.tunnel_ip);
            }
        }

        inner.stats.sessions_timed_out += expired.len() as u64;
        inner.stats.active_sessions = inner.sessions.len();
        expired.len()
    }

    /// Point-in-time snapshots of every active session.
    pub async fn get_all_sessions(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .values()
            .map(|s| SessionSnapshot {
                session_id: s.session_id,
                endpoint: s.endpoint,
                tunnel_ip: s.tunnel_ip,
                connected_at: s.connected_at,
                last_activity: s.last_activity,
                bytes_received: s.bytes_received,
                bytes_sent: s.bytes_sent,
                packets_received: s.packets_received,
                packets_sent: s.packets_sent,
            })
            .collect()
    }

    /// Execute `func` once per active session while holding the table
    /// lock. `func` receives a mutable, non-owning reference valid only
    /// within the call.
    pub async fn for_each_session<F: FnMut(&mut ClientSession)>(&self, mut func: F) {
        let mut inner = self.inner.lock().await;
        for session in inner.sessions.values_mut() {
            func(session);
        }
    }

    pub async fn find_by_id_mut<R>(&self, session_id: u64, func: impl FnOnce(&mut ClientSession) -> R) -> Option<R> {
        let mut inner = self.inner.lock().await;
        inner.sessions.get_mut(&session_id).map(func)
    }

    pub async fn find_by_endpoint_mut<R>(&self, endpoint: SocketAddr, func: impl FnOnce(&mut ClientSession) -> R) -> Option<R> {
        let mut inner = self.inner.lock().await;
        let id = *inner.endpoint_index.get(&endpoint)?;
        inner.sessions.get_mut(&id).map(func)
    }

    pub async fn find_by_tunnel_ip_mut<R>(&self, ip: Ipv4Addr, func: impl FnOnce(&mut ClientSession) -> R) -> Option<R> {
        let mut inner = self.inner.lock().await;
        let id = *inner.ip_index.get(&ip)?;
        inner.sessions.get_mut(&id).map(func)
    }

    pub async fn stats(&self) -> SessionTableStats {
        self.inner.lock().await.stats.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_full(&self) -> bool {
        self.inner.lock().await.sessions.len() >= self.max_clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{InitiatorState, PskCandidate, ResponderState};

    fn test_transport_session(now: Instant) -> TransportSession {
        let psk = vec![5u8; 32];
        let (init_packet, _initiator) = InitiatorState::create_init(&psk);
        let mut responder = ResponderState::new(100, Duration::from_millis(10), 4096, Duration::from_secs(30));
        let outcome = responder
            .process_init(&init_packet, &[PskCandidate { client_id: None, psk: &psk }])
            .unwrap();
        TransportSession::new(outcome.session, now, crate::core::DEFAULT_MAX_FRAGMENT_SIZE)
    }

    fn pool() -> (Ipv4Addr, Ipv4Addr) {
        ("10.8.0.1".parse().unwrap(), "10.8.0.4".parse().unwrap())
    }

    #[tokio::test]
    async fn create_session_assigns_ip_and_id() {
        let (start, end) = pool();
        let table = SessionTable::new(4, Duration::from_secs(120), start, end).unwrap();
        let now = Instant::now();
        let endpoint: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let id = table.create_session(endpoint, test_transport_session(now), now).await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(table.session_count().await, 1);
    }

    #[tokio::test]
    async fn table_rejects_when_full() {
        let (start, end) = ("10.8.0.1".parse().unwrap(), "10.8.0.1".parse().unwrap());
        let table = SessionTable::new(1, Duration::from_secs(120), start, end).unwrap();
        let now = Instant::now();
        table
            .create_session("127.0.0.1:1".parse().unwrap(), test_transport_session(now), now)
            .await
            .unwrap();
        let rejected = table
            .create_session("127.0.0.1:2".parse().unwrap(), test_transport_session(now), now)
            .await;
        assert!(rejected.is_none());
        assert_eq!(table.stats().await.sessions_rejected_full, 1);
    }

    #[tokio::test]
    async fn cleanup_expired_releases_ip_and_removes_session() {
        let (start, end) = pool();
        let table = SessionTable::new(4, Duration::from_millis(10), start, end).unwrap();
        let now = Instant::now();
        table
            .create_session("127.0.0.1:1".parse().unwrap(), test_transport_session(now), now)
            .await
            .unwrap();

        let later = now + Duration::from_secs(1);
        assert_eq!(table.cleanup_expired(later).await, 1);
        assert_eq!(table.session_count().await, 0);
    }

    #[tokio::test]
    async fn update_tunnel_ip_moves_index() {
        let (start, end) = pool();
        let table = SessionTable::new(4, Duration::from_secs(120), start, end).unwrap();
        let now = Instant::now();
        let endpoint: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let id = table.create_session(endpoint, test_transport_session(now), now).await.unwrap();

        let new_ip: Ipv4Addr = "10.9.0.5".parse().unwrap();
        assert!(table.update_tunnel_ip(id, new_ip).await);
        let found = table.find_by_tunnel_ip_mut(new_ip, |s| s.session_id).await;
        assert_eq!(found, Some(id));
    }

    #[tokio::test]
    async fn ip_pool_smaller_than_max_clients_rejected() {
        let start: Ipv4Addr = "10.8.0.1".parse().unwrap();
        let end: Ipv4Addr = "10.8.0.1".parse().unwrap();
        assert!(SessionTable::new(4, Duration::from_secs(1), start, end).is_err());
    }
}
