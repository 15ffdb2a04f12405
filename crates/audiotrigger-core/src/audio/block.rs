//! Fixed-length audio blocks
//!
//! Audio sources deliver buffers of arbitrary length. [`BlockAssembler`]
//! re-chunks them into [`AudioBlock`]s of a fixed length, each tagged with a
//! monotonically increasing sequence number and its arrival time.

use chrono::{DateTime, Utc};

/// Immutable block of mono samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    seq: u64,
    received_at: DateTime<Utc>,
    samples: Vec<f32>,
}

impl AudioBlock {
    pub fn new(seq: u64, received_at: DateTime<Utc>, samples: Vec<f32>) -> Self {
        Self {
            seq,
            received_at,
            samples,
        }
    }

    /// Sequence number (0 for the first block of a stream)
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wall-clock arrival time
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// New block with the same sequence number and timestamp
    pub fn with_samples(&self, samples: Vec<f32>) -> Self {
        Self {
            seq: self.seq,
            received_at: self.received_at,
            samples,
        }
    }

    /// Block duration at the given sample rate
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }
}

/// Re-chunks arbitrary sample buffers into fixed-length blocks
#[derive(Debug)]
pub struct BlockAssembler {
    block_len: usize,
    pending: Vec<f32>,
    next_seq: u64,
}

impl BlockAssembler {
    pub fn new(block_len: usize) -> Self {
        let block_len = block_len.max(1);
        Self {
            block_len,
            pending: Vec::with_capacity(block_len),
            next_seq: 0,
        }
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Append mono samples, emitting every completed block
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioBlock)) {
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.block_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.block_len {
                emit(self.take_block());
            }
        }
    }

    /// Append interleaved frames, keeping only the first channel
    pub fn push_interleaved(
        &mut self,
        data: &[f32],
        channels: usize,
        mut emit: impl FnMut(AudioBlock),
    ) {
        let channels = channels.max(1);
        for frame in data.chunks(channels) {
            self.pending.push(frame[0]);
            if self.pending.len() == self.block_len {
                emit(self.take_block());
            }
        }
    }

    /// Emit a trailing partial block, zero-padded to the block length
    pub fn flush(&mut self) -> Option<AudioBlock> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.resize(self.block_len, 0.0);
        Some(self.take_block())
    }

    fn take_block(&mut self) -> AudioBlock {
        let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_len));
        let block = AudioBlock::new(self.next_seq, Utc::now(), samples);
        self.next_seq += 1;
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_rechunks() {
        let mut assembler = BlockAssembler::new(4);
        let mut blocks = Vec::new();

        assembler.push(&[1.0, 2.0, 3.0], |b| blocks.push(b));
        assert!(blocks.is_empty());

        assembler.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |b| blocks.push(b));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].samples(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(blocks[1].samples(), &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(blocks[0].seq(), 0);
        assert_eq!(blocks[1].seq(), 1);

        let tail = assembler.flush().unwrap();
        assert_eq!(tail.samples(), &[9.0, 0.0, 0.0, 0.0]);
        assert_eq!(tail.seq(), 2);
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn test_interleaved_takes_first_channel() {
        let mut assembler = BlockAssembler::new(2);
        let mut blocks = Vec::new();
        assembler.push_interleaved(&[0.1, -1.0, 0.2, -1.0, 0.3, -1.0], 2, |b| blocks.push(b));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].samples(), &[0.1, 0.2]);
    }

    #[test]
    fn test_block_duration() {
        let block = AudioBlock::new(0, Utc::now(), vec![0.0; 4410]);
        assert!((block.duration_secs(44100) - 0.1).abs() < 1e-12);
        assert_eq!(block.len(), 4410);
        assert!(!block.is_empty());
    }

    #[test]
    fn test_with_samples_keeps_identity() {
        let block = AudioBlock::new(7, Utc::now(), vec![1.0, 2.0]);
        let copy = block.with_samples(vec![3.0, 4.0]);
        assert_eq!(copy.seq(), 7);
        assert_eq!(copy.received_at(), block.received_at());
        assert_eq!(copy.samples(), &[3.0, 4.0]);
    }
}
