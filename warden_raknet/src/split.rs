//! Split-packet (fragment) reassembly with hard resource caps.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::frame::SplitInfo;

/// Maximum concurrently reassembling splits per connection.
pub const MAX_SPLIT_BUFFERS: usize = 16;
/// Maximum fragments a single split may declare.
pub const MAX_SPLIT_FRAGMENTS: u32 = 128;
/// Maximum reassembled size of a single split.
pub const MAX_SPLIT_BYTES: usize = 1024 * 1024;
/// A split that hasn't completed within this window is dropped.
pub const SPLIT_TIMEOUT: Duration = Duration::from_secs(30);

struct SplitBuffer {
    split_count: u32,
    fragments: HashMap<u32, Bytes>,
    total_bytes: usize,
    created_at: Instant,
}

/// Per-connection reassembly state, keyed by the 16-bit split id.
#[derive(Default)]
pub struct SplitBuffers {
    buffers: HashMap<u16, SplitBuffer>,
}

impl SplitBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one fragment. Returns the reassembled payload once every
    /// fragment of the split has arrived, and drops the buffer.
    ///
    /// Fragments violating the declared count, the fragment cap or the
    /// byte cap are discarded. When at buffer capacity, the oldest buffer
    /// is evicted to make room; a late fragment of an evicted split simply
    /// starts a new buffer.
    pub fn insert(&mut self, split: &SplitInfo, payload: Bytes) -> Option<Bytes> {
        if split.count == 0 || split.count > MAX_SPLIT_FRAGMENTS || split.index >= split.count {
            return None;
        }
        // same id reused with a different count: treat as a new split
        let stale = self
            .buffers
            .get(&split.id)
            .is_some_and(|buffer| buffer.split_count != split.count);
        if stale {
            self.buffers.remove(&split.id);
        }
        if !self.buffers.contains_key(&split.id) {
            self.make_room();
            self.buffers.insert(
                split.id,
                SplitBuffer {
                    split_count: split.count,
                    fragments: HashMap::new(),
                    total_bytes: 0,
                    created_at: Instant::now(),
                },
            );
        }
        let buffer = self.buffers.get_mut(&split.id)?;
        if buffer.fragments.contains_key(&split.index) {
            return None;
        }
        if buffer.total_bytes + payload.len() > MAX_SPLIT_BYTES {
            log::debug!(
                "Dropping split {} over the byte cap ({} fragments so far)",
                split.id,
                buffer.fragments.len()
            );
            self.buffers.remove(&split.id);
            return None;
        }
        buffer.total_bytes += payload.len();
        buffer.fragments.insert(split.index, payload);
        if buffer.fragments.len() < buffer.split_count as usize {
            return None;
        }
        let buffer = self.buffers.remove(&split.id)?;
        let mut assembled = BytesMut::with_capacity(buffer.total_bytes);
        for index in 0..buffer.split_count {
            assembled.extend_from_slice(buffer.fragments.get(&index)?);
        }
        Some(assembled.freeze())
    }

    /// Drops buffers older than [`SPLIT_TIMEOUT`].
    pub fn sweep(&mut self, now: Instant) {
        self.buffers
            .retain(|_, buffer| now.duration_since(buffer.created_at) < SPLIT_TIMEOUT);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn make_room(&mut self) {
        if self.buffers.len() < MAX_SPLIT_BUFFERS {
            return;
        }
        // O(K) scan, K is small
        if let Some(oldest) = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.created_at)
            .map(|(id, _)| *id)
        {
            self.buffers.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u16, count: u32, index: u32) -> SplitInfo {
        SplitInfo { count, id, index }
    }

    #[test]
    fn reassembles_out_of_order() {
        let mut splits = SplitBuffers::new();
        assert!(splits
            .insert(&info(7, 2, 1), Bytes::from_static(b"WORLD"))
            .is_none());
        let assembled = splits
            .insert(&info(7, 2, 0), Bytes::from_static(b"HELLO"))
            .unwrap();
        assert_eq!(&assembled[..], b"HELLOWORLD");
        assert!(splits.is_empty());
    }

    #[test]
    fn reassembles_any_permutation() {
        let parts: [&[u8]; 4] = [b"AA", b"BB", b"CC", b"DD"];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
        for order in orders {
            let mut splits = SplitBuffers::new();
            let mut assembled = None;
            for index in order {
                assembled =
                    splits.insert(&info(1, 4, index), Bytes::copy_from_slice(parts[index as usize]));
            }
            assert_eq!(&assembled.unwrap()[..], b"AABBCCDD");
        }
    }

    #[test]
    fn oversized_split_count_dropped() {
        let mut splits = SplitBuffers::new();
        assert!(splits
            .insert(
                &info(1, MAX_SPLIT_FRAGMENTS + 1, 0),
                Bytes::from_static(b"x")
            )
            .is_none());
        assert!(splits.is_empty());
    }

    #[test]
    fn byte_cap_enforced() {
        let mut splits = SplitBuffers::new();
        let big = Bytes::from(vec![0u8; MAX_SPLIT_BYTES]);
        assert!(splits.insert(&info(1, 2, 0), big).is_none());
        // second fragment pushes past the cap and the buffer is dropped
        assert!(splits.insert(&info(1, 2, 1), Bytes::from_static(b"y")).is_none());
        assert!(splits.is_empty());
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut splits = SplitBuffers::new();
        for id in 0..MAX_SPLIT_BUFFERS as u16 {
            splits.insert(&info(id, 2, 0), Bytes::from_static(b"a"));
        }
        assert_eq!(splits.len(), MAX_SPLIT_BUFFERS);
        splits.insert(&info(999, 2, 0), Bytes::from_static(b"a"));
        assert_eq!(splits.len(), MAX_SPLIT_BUFFERS);
        // id 0 was the oldest; completing it now starts a fresh buffer
        assert!(splits
            .insert(&info(0, 2, 1), Bytes::from_static(b"b"))
            .is_none());
    }

    #[test]
    fn sweep_times_out_stale_buffers() {
        let mut splits = SplitBuffers::new();
        splits.insert(&info(3, 2, 0), Bytes::from_static(b"a"));
        splits.sweep(Instant::now() + SPLIT_TIMEOUT);
        assert!(splits.is_empty());
    }

    #[test]
    fn duplicate_fragment_ignored() {
        let mut splits = SplitBuffers::new();
        assert!(splits
            .insert(&info(5, 2, 0), Bytes::from_static(b"HE"))
            .is_none());
        assert!(splits
            .insert(&info(5, 2, 0), Bytes::from_static(b"XX"))
            .is_none());
        let assembled = splits
            .insert(&info(5, 2, 1), Bytes::from_static(b"LLO"))
            .unwrap();
        assert_eq!(&assembled[..], b"HELLO");
    }
}
