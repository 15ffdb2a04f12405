//! Pre-roll ring buffer
//!
//! Holds the most recent N calibrated blocks so that audio preceding a
//! trigger is never lost. Blocks are stored as `Arc` handles: a snapshot is a
//! cheap copy of handles and stays valid no matter how many blocks are pushed
//! afterwards.

use crate::audio::block::AudioBlock;
use ringbuf::traits::{Consumer, Observer, RingBuffer as _};
use ringbuf::HeapRb;
use std::sync::Arc;

/// Fixed-capacity store of the most recent blocks
///
/// Single owner (the ingestion loop). `push` is O(1) and overwrites the
/// oldest block once full.
pub struct RingBuffer {
    rb: HeapRb<Arc<AudioBlock>>,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` blocks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            rb: HeapRb::new(capacity.max(1)),
        }
    }

    /// Append a block, evicting the oldest one when full
    pub fn push(&mut self, block: Arc<AudioBlock>) {
        let _evicted = self.rb.push_overwrite(block);
    }

    /// Held blocks, oldest first, without mutating the ring
    pub fn snapshot_preroll(&self) -> Vec<Arc<AudioBlock>> {
        self.rb.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rb.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.rb.capacity().get()
    }

    pub fn is_empty(&self) -> bool {
        self.rb.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rb.is_full()
    }

    /// Occupancy in `[0, 1]`
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    /// Total samples currently held
    pub fn held_frames(&self) -> usize {
        self.rb.iter().map(|b| b.len()).sum()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
