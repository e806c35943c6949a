//! Fragment reassembly for DATA frames that exceed the path MTU.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::DEFAULT_FRAGMENT_TIMEOUT;

struct PendingFragment {
    offset: u32,
    data: Vec<u8>,
    last: bool,
}

struct PendingMessage {
    fragments: Vec<PendingFragment>,
    total_bytes: usize,
    has_last: bool,
    first_time: Instant,
}

/// Reassembles fragmented messages from out-of-order DATA frames.
pub struct FragmentReassembler {
    pending: HashMap<u32, PendingMessage>,
    max_bytes_per_message: usize,
    max_total_bytes: usize,
    total_bytes: usize,
    fragment_timeout: Duration,
}

impl FragmentReassembler {
    pub fn new(max_bytes_per_message: usize, max_total_bytes: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_bytes_per_message,
            max_total_bytes,
            total_bytes: 0,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
        }
    }

    /// Push a fragment belonging to `message_id`. Returns `false` if the
    /// fragment was rejected because it would exceed the per-message or
    /// global byte caps.
    pub fn push(&mut self, message_id: u32, fragment_index: u32, data: Vec<u8>, last: bool, now: Instant) -> bool {
        let incoming_len = data.len();

        if self.total_bytes + incoming_len > self.max_total_bytes {
            return false;
        }

        let entry = self.pending.entry(message_id).or_insert_with(|| PendingMessage {
            fragments: Vec::new(),
            total_bytes: 0,
            has_last: false,
            first_time: now,
        });

        if entry.total_bytes + incoming_len > self.max_bytes_per_message {
            return false;
        }

        entry.fragments.push(PendingFragment { offset: fragment_index, data, last });
        entry.total_bytes += incoming_len;
        entry.has_last = entry.has_last || last;
        self.total_bytes += incoming_len;
        true
    }

    /// Attempt to reassemble `message_id`: succeeds iff the last fragment
    /// has arrived and all fragment indices `[0, last]` are present with no
    /// gaps or overlaps. On success, the message is removed from pending
    /// state.
    pub fn try_reassemble(&mut self, message_id: u32) -> Option<Vec<u8>> {
        let entry = self.pending.get(&message_id)?;
        if !entry.has_last {
            return None;
        }

        let mut sorted: Vec<&PendingFragment> = entry.fragments.iter().collect();
        sorted.sort_by_key(|f| f.offset);

        let final_index = sorted.iter().find(|f| f.last)?.offset;
        if sorted.len() as u32 != final_index + 1 {
            return None;
        }
        for (expected, fragment) in sorted.iter().enumerate() {
            if fragment.offset != expected as u32 {
                return None;
            }
        }

        let mut assembled = Vec::with_capacity(entry.total_bytes);
        for fragment in &sorted {
            assembled.extend_from_slice(&fragment.data);
        }

        let removed = self.pending.remove(&message_id).unwrap();
        self.total_bytes -= removed.total_bytes;
        Some(assembled)
    }

    /// Drop messages whose first fragment arrived longer than
    /// `fragment_timeout` ago. Returns the number of messages dropped.
    pub fn cleanup_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, msg)| now.duration_since(msg.first_time) >= self.fragment_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(msg) = self.pending.remove(id) {
                self.total_bytes -= msg.total_bytes;
            }
        }
        expired.len()
    }

    /// Number of messages currently awaiting reassembly.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
