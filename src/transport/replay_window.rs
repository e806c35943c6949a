//! Sliding-bitmap replay window.
//!
//! Ported from the original `ReplayWindow` (bit-per-sequence sliding
//! bitmap, shift-on-new-highest) with the `unmark` + mark/unmark-cycle cap
//! from the same source added for the DoS mitigation in scenario G.

use crate::core::{DEFAULT_REPLAY_UNMARK_CYCLE_CAP, DEFAULT_REPLAY_WINDOW_SIZE};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Sliding-bitmap replay window over a fixed number of recent sequences.
pub struct ReplayWindow {
    window_size: usize,
    highest: u64,
    initialized: bool,
    bits: Vec<u64>,
    /// Successive mark/unmark cycle count per currently-tracked sequence,
    /// indexed by bit position. Reset whenever the bit falls out of the
    /// window (shifted away).
    cycle_counts: Vec<u32>,
    /// Sequences permanently rejected after exceeding the cycle cap, until
    /// they shift out of the window.
    blacklist_cap: u32,
}

impl ReplayWindow {
    /// Create a window tracking `window_size` bits (default 1024).
    pub fn new(window_size: usize) -> Self {
        let words = window_size.div_ceil(BITS_PER_WORD);
        Self {
            window_size,
            highest: 0,
            initialized: false,
            bits: vec![0u64; words],
            cycle_counts: vec![0u32; window_size],
            blacklist_cap: DEFAULT_REPLAY_UNMARK_CYCLE_CAP,
        }
    }

    /// Create a window with the default size (1024 bits).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW_SIZE)
    }

    fn get_bit(&self, index: usize) -> bool {
        let word = index / BITS_PER_WORD;
        let bit = index % BITS_PER_WORD;
        (self.bits[word] >> bit) & 1 != 0
    }

    fn set_bit(&mut self, index: usize) {
        let word = index / BITS_PER_WORD;
        let bit = index % BITS_PER_WORD;
        self.bits[word] |= 1u64 << bit;
    }

    fn clear_bit(&mut self, index: usize) {
        let word = index / BITS_PER_WORD;
        let bit = index % BITS_PER_WORD;
        self.bits[word] &= !(1u64 << bit);
    }

    fn shift(&mut self, delta: usize) {
        if delta >= self.window_size {
            self.bits.iter_mut().for_each(|w| *w = 0);
            self.cycle_counts.iter_mut().for_each(|c| *c = 0);
            return;
        }

        let word_shift = delta / BITS_PER_WORD;
        let bit_shift = delta % BITS_PER_WORD;
        let len = self.bits.len();

        for i in (0..len).rev() {
            let mut value = 0u64;
            if i >= word_shift {
                value = self.bits[i - word_shift];
                if bit_shift != 0 {
                    value <<= bit_shift;
                    if i > word_shift {
                        value |= self.bits[i - word_shift - 1] >> (BITS_PER_WORD - bit_shift);
                    }
                }
            }
            self.bits[i] = value;
        }
        self.mask_tail();

        // Shift the per-bit cycle-count tracking in lockstep: index i now
        // holds what used to be at index i - delta (new entries at the
        // front start fresh).
        let old = self.cycle_counts.clone();
        for i in (0..self.window_size).rev() {
            self.cycle_counts[i] = if i >= delta { old[i - delta] } else { 0 };
        }
    }

    fn mask_tail(&mut self) {
        let remainder = self.window_size % BITS_PER_WORD;
        if remainder == 0 {
            return;
        }
        let mask = (1u64 << remainder) - 1;
        if let Some(last) = self.bits.last_mut() {
            *last &= mask;
        }
    }

    /// Check and mark `sequence` as accepted.
    ///
    /// Returns `false` for: an already-initialized window receiving a
    /// duplicate, a sequence too old to fit the window, or a sequence
    /// blacklisted by the mark/unmark cycle cap (see [`Self::unmark`]).
    pub fn mark_and_check(&mut self, sequence: u64) -> bool {
        if !self.initialized {
            self.highest = sequence;
            self.initialized = true;
            self.set_bit(0);
            return true;
        }

        if sequence > self.highest {
            let delta = (sequence - self.highest) as usize;
            self.shift(delta);
            self.highest = sequence;
            self.set_bit(0);
            return true;
        }

        let diff = self.highest - sequence;
        if diff >= self.window_size as u64 {
            return false;
        }

        let index = diff as usize;
        if self.cycle_counts[index] >= self.blacklist_cap {
            return false;
        }
        if self.get_bit(index) {
            return false;
        }
        self.set_bit(index);
        true
    }

    /// Clear the mark for `sequence`, permitting a subsequent
    /// `mark_and_check` to accept it again - used when downstream
    /// processing (AEAD decrypt, frame decode) fails after the replay
    /// check accepted the sequence, so a legitimate retransmission of the
    /// same sequence is not permanently rejected.
    ///
    /// After [`DEFAULT_REPLAY_UNMARK_CYCLE_CAP`] mark/unmark cycles on the
    /// same sequence, this becomes a no-op and the sequence is
    /// blacklisted until it shifts out of the window, closing the
    /// CPU-exhaustion loop of scenario G.
    pub fn unmark(&mut self, sequence: u64) {
        if !self.initialized || sequence > self.highest {
            return;
        }
        let diff = self.highest - sequence;
        if diff >= self.window_size as u64 {
            return;
        }
        let index = diff as usize;
        if self.cycle_counts[index] >= self.blacklist_cap {
            return;
        }
        self.cycle_counts[index] += 1;
        if self.cycle_counts[index] >= self.blacklist_cap {
            // Leave the bit set: mark_and_check already rejects via the
            // cycle-count check above regardless of bit state.
            return;
        }
        self.clear_bit(index);
    }

    /// Highest sequence ever accepted.
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Whether any sequence has been accepted yet.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sequence_always_accepted() {
        let mut w = ReplayWindow::with_defaults();
        assert!(w.mark_and_check(100));
        assert_eq!(w.highest(), 100);
    }

    #[test]
    fn monotonic_sequences_accepted() {
        let mut w = ReplayWindow::with_defaults();
        assert!(w.mark_and_check(1));
        assert!(w.mark_and_check(2));
        assert!(w.mark_and_check(3));
    }

    #[test]
    fn duplicate_rejected() {
        let mut w = ReplayWindow::with_defaults();
        assert!(w.mark_and_check(5));
        assert!(!w.mark_and_check(5));
    }

    #[test]
    fn too_old_rejected() {
        let mut w = ReplayWindow::new(64);
        assert!(w.mark_and_check(1000));
        assert!(!w.mark_and_check(1000 - 64));
    }

    #[test]
    fn out_of_order_within_window_accepted_once() {
        let mut w = ReplayWindow::with_defaults();
        assert!(w.mark_and_check(10));
        assert!(w.mark_and_check(8));
        assert!(!w.mark_and_check(8));
        assert!(w.mark_and_check(9));
    }

    #[test]
    fn large_gap_resets_effectively() {
        let mut w = ReplayWindow::new(64);
        assert!(w.mark_and_check(10));
        assert!(w.mark_and_check(10_000));
        assert_eq!(w.highest(), 10_000);
        assert!(!w.mark_and_check(10));
    }

    #[test]
    fn unmark_allows_retry() {
        let mut w = ReplayWindow::with_defaults();
        assert!(w.mark_and_check(7));
        w.unmark(7);
        assert!(w.mark_and_check(7));
    }

    #[test]
    fn unmark_cycle_cap_blacklists_after_default_cap() {
        // Scenario G: same sequence sent 10 times; cap must trigger by
        // the 4th attempt (after 3 successful mark/unmark cycles).
        let mut w = ReplayWindow::with_defaults();
        let n = 42u64;

        for _ in 0..3 {
            assert!(w.mark_and_check(n));
            w.unmark(n);
        }

        // 4th attempt: cap reached, must be rejected.
        assert!(!w.mark_and_check(n));
    }
}
