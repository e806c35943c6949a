//! Retransmit buffer: tracks unacknowledged packets, drives RTO-based
//! retransmission via [`super::timing::RttEstimator`], and enforces buffer
//! size / pending-count limits under a configurable drop policy.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::core::{
    DEFAULT_HIGH_WATER_BYTES, DEFAULT_INSERT_RATE_LIMIT, DEFAULT_LOW_WATER_BYTES, DEFAULT_MAX_BUFFER_BYTES,
    DEFAULT_MAX_PENDING, DEFAULT_MAX_RETRIES,
};
use crate::transport::timing::RttEstimator;

/// Drop priority of a buffered packet. `Critical` packets are never
/// dropped to make room for others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Policy applied when the buffer exceeds its high watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Drop the oldest non-critical entries first.
    Oldest,
    /// Drop the newest non-critical entries first.
    Newest,
    /// Drop the lowest-priority entries first, oldest-first within a tier.
    LowPriority,
}

struct PendingPacket {
    sequence: u64,
    payload: Vec<u8>,
    priority: Priority,
    sent_at: Instant,
    first_sent_at: Instant,
    retries: u32,
    /// True once this entry has been retransmitted - disqualifies it from
    /// producing an RTT sample (Karn's algorithm).
    retransmitted: bool,
}

/// Error returned by [`RetransmitBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RetransmitError {
    #[error("retransmit buffer full")]
    BufferFull,
    #[error("insert rate limit exceeded")]
    RateLimited,
}

/// Tracks unacknowledged packets awaiting retransmission.
pub struct RetransmitBuffer {
    entries: VecDeque<PendingPacket>,
    bytes_buffered: usize,
    max_buffer_bytes: usize,
    max_pending: usize,
    high_water_bytes: usize,
    low_water_bytes: usize,
    drop_policy: DropPolicy,
    max_retries: u32,
    rtt: RttEstimator,
    insert_rate_limit: u32,
    insert_window_start: Instant,
    inserts_this_window: u32,
}

impl RetransmitBuffer {
    /// Create a buffer with VEIL's documented defaults.
    pub fn new(drop_policy: DropPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes_buffered: 0,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            max_pending: DEFAULT_MAX_PENDING,
            high_water_bytes: DEFAULT_HIGH_WATER_BYTES,
            low_water_bytes: DEFAULT_LOW_WATER_BYTES,
            drop_policy,
            max_retries: DEFAULT_MAX_RETRIES,
            rtt: RttEstimator::new(),
            insert_rate_limit: DEFAULT_INSERT_RATE_LIMIT,
            insert_window_start: Instant::now(),
            inserts_this_window: 0,
        }
    }

    fn check_insert_rate(&mut self, now: Instant) -> bool {
        if now.duration_since(self.insert_window_start) >= Duration::from_secs(1) {
            self.insert_window_start = now;
            self.inserts_this_window = 0;
        }
        if self.inserts_this_window >= self.insert_rate_limit {
            return false;
        }
        self.inserts_this_window += 1;
        true
    }

    /// Record a freshly-sent packet as pending acknowledgment.
    pub fn insert(&mut self, sequence: u64, payload: Vec<u8>, priority: Priority, now: Instant) -> Result<(), RetransmitError> {
        if !self.check_insert_rate(now) {
            return Err(RetransmitError::RateLimited);
        }

        if self.entries.len() >= self.max_pending || self.bytes_buffered + payload.len() > self.max_buffer_bytes {
            self.make_room();
            if self.entries.len() >= self.max_pending || self.bytes_buffered + payload.len() > self.max_buffer_bytes {
                return Err(RetransmitError::BufferFull);
            }
        }

        self.bytes_buffered += payload.len();
        self.entries.push_back(PendingPacket {
            sequence,
            payload,
            priority,
            sent_at: now,
            first_sent_at: now,
            retries: 0,
            retransmitted: false,
        });

        if self.bytes_buffered > self.high_water_bytes {
            self.make_room();
        }

        Ok(())
    }

    /// Drain entries down to the low watermark according to the configured
    /// drop policy. `Critical`-priority entries are never evicted.
    fn make_room(&mut self) {
        if self.bytes_buffered <= self.low_water_bytes && self.entries.len() < self.max_pending {
            return;
        }

        match self.drop_policy {
            DropPolicy::Oldest => {
                let mut i = 0;
                while i < self.entries.len() && self.bytes_buffered > self.low_water_bytes {
                    if self.entries[i].priority == Priority::Critical {
                        i += 1;
                        continue;
                    }
                    let removed = self.entries.remove(i).unwrap();
                    self.bytes_buffered -= removed.payload.len();
                }
            }
            DropPolicy::Newest => {
                let mut i = self.entries.len();
                while i > 0 && self.bytes_buffered > self.low_water_bytes {
                    i -= 1;
                    if self.entries[i].priority == Priority::Critical {
                        continue;
                    }
                    let removed = self.entries.remove(i).unwrap();
                    self.bytes_buffered -= removed.payload.len();
                }
            }
            DropPolicy::LowPriority => {
                for tier in [Priority::Low, Priority::Normal, Priority::High] {
                    let mut i = 0;
                    while i < self.entries.len() && self.bytes_buffered > self.low_water_bytes {
                        if self.entries[i].priority != tier {
                            i += 1;
                            continue;
                        }
                        let removed = self.entries.remove(i).unwrap();
                        self.bytes_buffered -= removed.payload.len();
                    }
                    if self.bytes_buffered <= self.low_water_bytes {
                        break;
                    }
                }
            }
        }
    }

    /// Acknowledge a single sequence, removing it from the buffer. Feeds an
    /// RTT sample to the estimator unless the packet was ever retransmitted
    /// (Karn's algorithm).
    pub fn acknowledge(&mut self, sequence: u64, now: Instant) {
        if let Some(pos) = self.entries.iter().position(|p| p.sequence == sequence) {
            let entry = self.entries.remove(pos).unwrap();
            self.bytes_buffered -= entry.payload.len();
            if !entry.retransmitted {
                self.rtt.update(now.saturating_duration_since(entry.first_sent_at));
            }
        }
    }

    /// Acknowledge every sequence `<= cumulative` (cumulative ACK).
    pub fn acknowledge_cumulative(&mut self, cumulative: u64, now: Instant) {
        while let Some(front) = self.entries.front() {
            if front.sequence > cumulative {
                break;
            }
            let entry = self.entries.pop_front().unwrap();
            self.bytes_buffered -= entry.payload.len();
            if !entry.retransmitted {
                self.rtt.update(now.saturating_duration_since(entry.first_sent_at));
            }
        }
    }

    /// Collect packets whose RTO has elapsed, marking them retransmitted
    /// and bumping their retry count. Entries exceeding `max_retries` are
    /// dropped from the buffer and reported separately.
    pub fn get_packets_to_retransmit(&mut self, now: Instant) -> (Vec<(u64, Vec<u8>)>, Vec<u64>) {
        let rto = self.rtt.rto();
        let mut to_send = Vec::new();
        let mut abandoned = Vec::new();
        let mut i = 0;

        while i < self.entries.len() {
            let elapsed = now.duration_since(self.entries[i].sent_at);
            if elapsed < rto {
                i += 1;
                continue;
            }

            if self.entries[i].retries >= self.max_retries {
                let entry = self.entries.remove(i).unwrap();
                self.bytes_buffered -= entry.payload.len();
                abandoned.push(entry.sequence);
                continue;
            }

            let entry = &mut self.entries[i];
            entry.retries += 1;
            entry.retransmitted = true;
            entry.sent_at = now;
            to_send.push((entry.sequence, entry.payload.clone()));
            i += 1;
        }

        (to_send, abandoned)
    }

    /// Number of unacknowledged packets currently buffered.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes currently buffered across all pending packets.
    pub fn bytes_buffered(&self) -> usize {
        self.bytes_buffered
    }

    /// Access the RTT estimator driving retransmit timing.
    pub fn rtt_estimator(&self) -> &RttEstimator {
        &self.rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_ack_single() {
        let mut buf = RetransmitBuffer::new(DropPolicy::Oldest);
        let now = Instant::now();
        buf.insert(1, vec![0u8; 10], Priority::Normal, now).unwrap();
        assert_eq!(buf.pending_count(), 1);
        buf.acknowledge(1, now + Duration::from_millis(5));
        assert_eq!(buf.pending_count(), 0);
    }

    #[test]
    fn cumulative_ack_clears_prefix() {
        let mut buf = RetransmitBuffer::new(DropPolicy::Oldest);
        let now = Instant::now();
        for seq in 1..=5 {
            buf.insert(seq, vec![0u8; 4], Priority::Normal, now).unwrap();
        }
        buf.acknowledge_cumulative(3, now);
        assert_eq!(buf.pending_count(), 2);
    }

    #[test]
    fn retransmit_after_rto_elapses() {
        let mut buf = RetransmitBuffer::new(DropPolicy::Oldest);
        let now = Instant::now();
        buf.insert(1, vec![1, 2, 3], Priority::Normal, now).unwrap();
        let later = now + Duration::from_secs(1);
        let (to_send, abandoned) = buf.get_packets_to_retransmit(later);
        assert_eq!(to_send.len(), 1);
        assert!(abandoned.is_empty());
    }

    #[test]
    fn abandons_after_max_retries() {
        let mut buf = RetransmitBuffer::new(DropPolicy::Oldest);
        let mut now = Instant::now();
        buf.insert(1, vec![1], Priority::Normal, now).unwrap();

        for _ in 0..DEFAULT_MAX_RETRIES {
            now += Duration::from_secs(1);
            let (to_send, _) = buf.get_packets_to_retransmit(now);
            assert_eq!(to_send.len(), 1);
        }

        now += Duration::from_secs(1);
        let (to_send, abandoned) = buf.get_packets_to_retransmit(now);
        assert!(to_send.is_empty());
        assert_eq!(abandoned, vec![1]);
    }

    #[test]
    fn critical_priority_survives_make_room() {
        let mut buf = RetransmitBuffer::new(DropPolicy::LowPriority);
        buf.high_water_bytes = 10;
        buf.low_water_bytes = 0;
        let now = Instant::now();
        buf.insert(1, vec![0u8; 8], Priority::Critical, now).unwrap();
        buf.insert(2, vec![0u8; 8], Priority::Low, now).unwrap();
        assert!(buf.entries.iter().any(|e| e.sequence == 1));
    }

    #[test]
    fn retransmitted_packet_does_not_sample_rtt() {
        let mut buf = RetransmitBuffer::new(DropPolicy::Oldest);
        let now = Instant::now();
        buf.insert(1, vec![1], Priority::Normal, now).unwrap();
        let later = now + Duration::from_secs(1);
        buf.get_packets_to_retransmit(later);
        assert!(!buf.rtt.is_initialized());
        buf.acknowledge(1, later + Duration::from_millis(10));
        assert!(!buf.rtt.is_initialized());
    }
}
