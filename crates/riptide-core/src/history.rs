//! Fixed-capacity replay buffer for encoded patch frames.
//!
//! Every patch a session sends is recorded here before transmission so a
//! reconnecting client can be caught up without re-rendering. The buffer is
//! a ring keyed by sequence number: capacity C keeps the most recent C
//! frames and silently drops older ones. Range queries fail closed — if any
//! requested frame has aged out the whole query reports unavailable and the
//! caller falls back to a full resync.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::frame::Seq;
use crate::now_ms;

struct Entry {
    seq: Seq,
    frame: Bytes,
    sent_at: u64,
}

struct Ring {
    slots: Vec<Option<Entry>>,
    min: Seq,
    max: Seq,
    bytes: usize,
}

/// Internally synchronized; sessions share it between their writer loop and
/// diagnostic readers without extra locking.
pub struct PatchHistory {
    capacity: usize,
    inner: Mutex<Ring>,
}

impl PatchHistory {
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            capacity,
            inner: Mutex::new(Ring { slots, min: 0, max: 0, bytes: 0 }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records the encoded frame for `seq`, evicting the frame `capacity`
    /// steps behind it. Sequences must be handed in strictly increasing,
    /// which the single-writer session loop guarantees.
    pub fn add(&self, seq: Seq, frame: &[u8]) {
        debug_assert!(seq > 0, "patch sequences start at 1");
        let mut ring = self.inner.lock();
        debug_assert!(seq > ring.max, "patch sequences must be strictly increasing");
        let idx = (seq % self.capacity as u64) as usize;
        if let Some(evicted) = ring.slots[idx].take() {
            ring.bytes -= evicted.frame.len();
        }
        ring.bytes += frame.len();
        ring.slots[idx] = Some(Entry { seq, frame: Bytes::copy_from_slice(frame), sent_at: now_ms() });
        if ring.max == 0 {
            ring.min = seq;
        }
        ring.max = seq;
        if ring.max - ring.min >= self.capacity as u64 {
            ring.min = ring.max - self.capacity as u64 + 1;
        }
    }

    /// Frames in `(after, to]`, oldest first. `None` means the range cannot
    /// be served — part of it aged out or was never produced — and the
    /// caller must resync instead. An empty range is trivially served.
    pub fn frames_between(&self, after: Seq, to: Seq) -> Option<Vec<Bytes>> {
        if to <= after {
            return Some(Vec::new());
        }
        let ring = self.inner.lock();
        if ring.max == 0 || after + 1 < ring.min || to > ring.max {
            return None;
        }
        let mut frames = Vec::with_capacity((to - after) as usize);
        for seq in (after + 1)..=to {
            match &ring.slots[(seq % self.capacity as u64) as usize] {
                Some(entry) if entry.seq == seq => frames.push(entry.frame.clone()),
                _ => return None,
            }
        }
        Some(frames)
    }

    /// Whether a client that acknowledged `last_ack` can be caught up by
    /// replay alone. False when there is nothing newer, when the gap has
    /// aged out, or when the history is empty.
    pub fn can_recover(&self, last_ack: Seq) -> bool {
        let ring = self.inner.lock();
        ring.max != 0 && last_ack < ring.max && last_ack + 1 >= ring.min
    }

    /// Drops every entry. Used when a session resyncs: buffered deltas
    /// predate the new baseline and must never be replayed across it.
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.min = 0;
        ring.max = 0;
        ring.bytes = 0;
    }

    /// Oldest retained sequence, 0 when empty.
    pub fn min_seq(&self) -> Seq {
        self.inner.lock().min
    }

    /// Newest retained sequence, 0 when empty.
    pub fn max_seq(&self) -> Seq {
        self.inner.lock().max
    }

    pub fn len(&self) -> usize {
        let ring = self.inner.lock();
        if ring.max == 0 {
            0
        } else {
            (ring.max - ring.min + 1) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes currently retained. Feeds the session's memory
    /// estimate.
    pub fn byte_size(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Send timestamp (epoch millis) of the newest retained frame.
    pub fn last_sent_at(&self) -> Option<u64> {
        let ring = self.inner.lock();
        if ring.max == 0 {
            return None;
        }
        ring.slots[(ring.max % self.capacity as u64) as usize]
            .as_ref()
            .map(|entry| entry.sent_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, len: usize) -> Vec<u8> {
        vec![tag; len]
    }

    #[test_timeout::timeout]
    fn keeps_only_the_newest_capacity_frames() {
        let history = PatchHistory::new(5);
        for seq in 1..=12u64 {
            history.add(seq, &frame(seq as u8, 4));
        }
        assert_eq!(history.min_seq(), 8);
        assert_eq!(history.max_seq(), 12);
        assert_eq!(history.len(), 5);

        let frames = history.frames_between(7, 12).expect("full window should replay");
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].as_ref(), frame(8, 4).as_slice());
        assert_eq!(frames[4].as_ref(), frame(12, 4).as_slice());

        assert_eq!(history.frames_between(6, 12), None);
    }

    #[test_timeout::timeout]
    fn replays_in_order_without_gaps() {
        let history = PatchHistory::new(16);
        for seq in 1..=10u64 {
            history.add(seq, &frame(seq as u8, 2));
        }
        let frames = history.frames_between(3, 10).unwrap();
        assert_eq!(frames.len(), 7);
        for (offset, bytes) in frames.iter().enumerate() {
            assert_eq!(bytes[0], 4 + offset as u8);
        }
    }

    #[test_timeout::timeout]
    fn replayed_frames_survive_caller_buffer_reuse() {
        let history = PatchHistory::new(4);
        let mut buffer = vec![1u8, 2, 3, 4];
        history.add(1, &buffer);
        // Writers reuse their encode buffer between patches.
        buffer.fill(0xee);
        history.add(2, &buffer);
        let frames = history.frames_between(0, 2).expect("window should replay");
        assert_eq!(frames[0].as_ref(), [1u8, 2, 3, 4].as_slice());
        assert_eq!(frames[1].as_ref(), [0xee_u8; 4].as_slice());
    }

    #[test_timeout::timeout]
    fn empty_history_serves_nothing() {
        let history = PatchHistory::new(4);
        assert_eq!(history.min_seq(), 0);
        assert_eq!(history.max_seq(), 0);
        assert_eq!(history.len(), 0);
        assert!(!history.can_recover(0));
        assert_eq!(history.frames_between(0, 3), None);
        // An empty range is trivially served even on an empty history.
        assert_eq!(history.frames_between(3, 3), Some(Vec::new()));
    }

    #[test_timeout::timeout]
    fn recoverability_tracks_the_retained_window() {
        let history = PatchHistory::new(4);
        for seq in 1..=10u64 {
            history.add(seq, &frame(seq as u8, 1));
        }
        // Window is [7, 10].
        assert!(!history.can_recover(5)); // gap aged out
        assert!(history.can_recover(6)); // exactly the edge: needs 7..=10
        assert!(history.can_recover(9));
        assert!(!history.can_recover(10)); // caught up
        assert!(!history.can_recover(12)); // ahead of the server
    }

    #[test_timeout::timeout]
    fn byte_size_accounts_for_evictions() {
        let history = PatchHistory::new(2);
        history.add(1, &frame(1, 100));
        history.add(2, &frame(2, 50));
        assert_eq!(history.byte_size(), 150);
        history.add(3, &frame(3, 7)); // evicts seq 1
        assert_eq!(history.byte_size(), 57);
        history.clear();
        assert_eq!(history.byte_size(), 0);
        assert!(history.is_empty());
    }

    #[test_timeout::timeout]
    fn clear_forces_resync_path() {
        let history = PatchHistory::new(8);
        for seq in 1..=5u64 {
            history.add(seq, &frame(seq as u8, 3));
        }
        assert!(history.can_recover(2));
        history.clear();
        assert!(!history.can_recover(2));
        assert_eq!(history.frames_between(2, 5), None);
        // Sequences continue where they left off after a resync.
        history.add(6, &frame(6, 3));
        assert_eq!(history.min_seq(), 6);
        assert_eq!(history.max_seq(), 6);
    }

    #[test_timeout::timeout]
    fn concurrent_readers_see_consistent_windows() {
        use std::sync::Arc;

        let history = Arc::new(PatchHistory::new(32));
        let writer = {
            let history = history.clone();
            std::thread::spawn(move || {
                for seq in 1..=2000u64 {
                    history.add(seq, &frame((seq % 251) as u8, 8));
                }
            })
        };
        let reader = {
            let history = history.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let min = history.min_seq();
                    let max = history.max_seq();
                    // min is sampled first, so it can only lag behind max.
                    assert!(min <= max);
                    if max > 0 {
                        if let Some(frames) = history.frames_between(min.saturating_sub(1), max) {
                            assert!(!frames.is_empty());
                        }
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(history.max_seq(), 2000);
    }
}
