//! Delayed-ACK scheduling with coalescing, gap/fin immediate triggers, and
//! a 32-bit selective-ack bitmap per stream.
//!
//! Ported from the original `AckScheduler` (per-endpoint `StreamAckState`,
//! delayed-ack timer, and coalescing policy).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::core::{ACK_BITMAP_BITS, DEFAULT_ACK_EVERY_N_PACKETS, DEFAULT_MAX_ACK_DELAY};

/// Tunables for an [`AckScheduler`].
#[derive(Debug, Clone)]
pub struct AckSchedulerConfig {
    pub max_ack_delay: Duration,
    pub ack_every_n_packets: u32,
    pub enable_coalescing: bool,
    pub max_pending_acks: usize,
    pub immediate_ack_on_gap: bool,
    pub immediate_ack_on_fin: bool,
}

impl Default for AckSchedulerConfig {
    fn default() -> Self {
        Self {
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            ack_every_n_packets: DEFAULT_ACK_EVERY_N_PACKETS,
            enable_coalescing: true,
            max_pending_acks: 8,
            immediate_ack_on_gap: true,
            immediate_ack_on_fin: true,
        }
    }
}

/// Cumulative counters for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct AckSchedulerStats {
    pub acks_sent: u64,
    pub acks_coalesced: u64,
    pub acks_delayed: u64,
    pub acks_immediate: u64,
    pub gaps_detected: u64,
}

/// A pending ACK to send: cumulative ack plus a bitmap of the
/// `ACK_BITMAP_BITS` sequences immediately following it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub highest_received: u64,
    pub bitmap: u32,
}

struct StreamAckState {
    highest_received: u64,
    received_bitmap: u32,
    packets_since_ack: u32,
    first_unacked_time: Option<Instant>,
    needs_ack: bool,
    gap_detected: bool,
}

impl StreamAckState {
    fn new() -> Self {
        Self {
            highest_received: 0,
            received_bitmap: 0,
            packets_since_ack: 0,
            first_unacked_time: None,
            needs_ack: false,
            gap_detected: false,
        }
    }
}

/// Per-endpoint delayed-ACK scheduler.
pub struct AckScheduler {
    config: AckSchedulerConfig,
    streams: HashMap<SocketAddr, StreamAckState>,
    stats: AckSchedulerStats,
}

impl AckScheduler {
    pub fn new(config: AckSchedulerConfig) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            stats: AckSchedulerStats::default(),
        }
    }

    /// Record receipt of `sequence` from `peer`. Returns `true` if an ACK
    /// should be sent immediately (gap detected, fin, or the per-N
    /// threshold reached).
    pub fn on_packet_received(&mut self, peer: SocketAddr, sequence: u64, is_fin: bool, now: Instant) -> bool {
        let state = self.streams.entry(peer).or_insert_with(StreamAckState::new);

        if state.first_unacked_time.is_none() {
            state.first_unacked_time = Some(now);
        }

        if sequence > state.highest_received || (state.highest_received == 0 && state.received_bitmap == 0 && sequence == 0) {
            let delta = sequence.saturating_sub(state.highest_received);
            if delta > 1 && state.highest_received > 0 {
                state.gap_detected = true;
                self.stats.gaps_detected += 1;
            }
            if delta >= ACK_BITMAP_BITS as u64 {
                state.received_bitmap = 0;
            } else {
                state.received_bitmap <<= delta;
            }
            state.received_bitmap |= 1;
            state.highest_received = sequence;
        } else {
            let back = state.highest_received - sequence;
            if back < ACK_BITMAP_BITS as u64 {
                state.received_bitmap |= 1 << back;
            }
        }

        state.needs_ack = true;
        state.packets_since_ack += 1;

        let immediate = (self.config.immediate_ack_on_gap && state.gap_detected)
            || (self.config.immediate_ack_on_fin && is_fin)
            || state.packets_since_ack >= self.config.ack_every_n_packets;

        if immediate {
            self.stats.acks_immediate += 1;
        }
        immediate
    }

    /// Whether the delayed-ack timer for `peer` has elapsed.
    pub fn check_ack_timer(&mut self, peer: SocketAddr, now: Instant) -> bool {
        match self.streams.get(&peer) {
            Some(state) if state.needs_ack => match state.first_unacked_time {
                Some(t) => now.duration_since(t) >= self.config.max_ack_delay,
                None => false,
            },
            _ => false,
        }
    }

    /// Build the pending ACK for `peer`, if one is due.
    pub fn get_pending_ack(&self, peer: SocketAddr) -> Option<PendingAck> {
        let state = self.streams.get(&peer)?;
        if !state.needs_ack {
            return None;
        }
        Some(PendingAck {
            highest_received: state.highest_received,
            bitmap: state.received_bitmap,
        })
    }

    /// Mark the pending ACK for `peer` as sent, resetting its timer state.
    pub fn ack_sent(&mut self, peer: SocketAddr) {
        if let Some(state) = self.streams.get_mut(&peer) {
            if self.config.enable_coalescing && state.packets_since_ack > 1 {
                self.stats.acks_coalesced += 1;
            } else if state.gap_detected {
                // immediate, counted at detection time
            } else {
                self.stats.acks_delayed += 1;
            }
            self.stats.acks_sent += 1;
            state.needs_ack = false;
            state.gap_detected = false;
            state.packets_since_ack = 0;
            state.first_unacked_time = None;
        }
    }

    /// Time remaining until the delayed-ack timer for `peer` fires, or
    /// `None` if no ACK is pending.
    pub fn time_until_next_ack(&self, peer: SocketAddr, now: Instant) -> Option<Duration> {
        let state = self.streams.get(&peer)?;
        if !state.needs_ack {
            return None;
        }
        let started = state.first_unacked_time?;
        Some(self.config.max_ack_delay.saturating_sub(now.duration_since(started)))
    }

    pub fn stats(&self) -> &AckSchedulerStats {
        &self.stats
    }

    /// Forget all state for `peer` (session closed or rotated away).
    pub fn reset_stream(&mut self, peer: SocketAddr) {
        self.streams.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn every_n_packets_triggers_immediate_ack() {
        let mut s = AckScheduler::new(AckSchedulerConfig::default());
        let now = Instant::now();
        assert!(!s.on_packet_received(addr(), 1, false, now));
        assert!(s.on_packet_received(addr(), 2, false, now));
    }

    #[test]
    fn gap_triggers_immediate_ack() {
        let mut s = AckScheduler::new(AckSchedulerConfig {
            ack_every_n_packets: 100,
            ..Default::default()
        });
        let now = Instant::now();
        assert!(!s.on_packet_received(addr(), 1, false, now));
        assert!(s.on_packet_received(addr(), 5, false, now));
        assert_eq!(s.stats().gaps_detected, 1);
    }

    #[test]
    fn delayed_ack_timer_elapses() {
        let mut s = AckScheduler::new(AckSchedulerConfig {
            ack_every_n_packets: 100,
            ..Default::default()
        });
        let now = Instant::now();
        s.on_packet_received(addr(), 1, false, now);
        assert!(!s.check_ack_timer(addr(), now));
        assert!(s.check_ack_timer(addr(), now + DEFAULT_MAX_ACK_DELAY + Duration::from_millis(1)));
    }

    #[test]
    fn ack_sent_resets_pending_state() {
        let mut s = AckScheduler::new(AckSchedulerConfig::default());
        let now = Instant::now();
        s.on_packet_received(addr(), 1, false, now);
        assert!(s.get_pending_ack(addr()).is_some());
        s.ack_sent(addr());
        assert!(s.get_pending_ack(addr()).is_none());
    }

    #[test]
    fn bitmap_records_out_of_order_arrival() {
        let mut s = AckScheduler::new(AckSchedulerConfig::default());
        let now = Instant::now();
        s.on_packet_received(addr(), 2, false, now);
        s.on_packet_received(addr(), 1, false, now);
        let ack = s.get_pending_ack(addr()).unwrap();
        assert_eq!(ack.highest_received, 2);
        assert_eq!(ack.bitmap & 0b11, 0b11);
    }
}
