//! Fast/slow sound level estimation
//!
//! Two sliding-window mean-square accumulators run over the calibrated
//! signal: a short "fast" window and a longer "slow" window. Each block
//! yields one [`LevelSample`] holding the loudest reading of each window
//! across the block, in dB SPL. Readings are taken at the block's last
//! sample and at every sample where a full window fits inside the block, so
//! a transient anywhere in a block longer than the window is seen.
//!
//! The windows are preallocated circular buffers of squared samples with a
//! running sum. To keep rounding error from accumulating over days of
//! uptime, each running sum is recomputed from scratch once per full wrap.

use crate::audio::block::AudioBlock;
use crate::error::ConfigError;
use crate::REFERENCE_PRESSURE;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Levels below this are reported as 0 dB SPL
const MIN_LEVEL_DB: f64 = 0.0;

/// Fast and slow levels at the end of one block
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelSample {
    /// Fast-window level (dB SPL)
    pub fast: f64,
    /// Slow-window level (dB SPL)
    pub slow: f64,
    /// First stream frame covered by the block
    pub frame_start: u64,
    /// One past the last stream frame covered by the block
    pub frame_end: u64,
    /// Arrival time of the block
    pub timestamp: DateTime<Utc>,
}

impl LevelSample {
    /// Sample for silence at stream start
    pub fn silent() -> Self {
        Self {
            fast: MIN_LEVEL_DB,
            slow: MIN_LEVEL_DB,
            frame_start: 0,
            frame_end: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Convert a mean-square pressure (Pa²) to dB SPL, clamped at 0 dB
pub fn mean_square_to_db(mean_square: f64) -> f64 {
    let p_ref_sq = REFERENCE_PRESSURE * REFERENCE_PRESSURE;
    if mean_square <= p_ref_sq || !mean_square.is_finite() {
        return MIN_LEVEL_DB;
    }
    10.0 * (mean_square / p_ref_sq).log10()
}

/// Convert an RMS pressure (Pa) to dB SPL
pub fn rms_to_db(rms: f64) -> f64 {
    mean_square_to_db(rms * rms)
}

/// RMS pressure (Pa) producing the given dB SPL
pub fn db_to_rms(db: f64) -> f64 {
    REFERENCE_PRESSURE * 10f64.powf(db / 20.0)
}

/// Mean of the last `len` squared samples
#[derive(Debug)]
struct SlidingMeanSquare {
    squares: Box<[f64]>,
    pos: usize,
    sum: f64,
}

impl SlidingMeanSquare {
    fn new(len: usize) -> Self {
        Self {
            squares: vec![0.0; len.max(1)].into_boxed_slice(),
            pos: 0,
            sum: 0.0,
        }
    }

    #[inline]
    fn push(&mut self, sample: f32) {
        let sq = f64::from(sample) * f64::from(sample);
        self.sum += sq - self.squares[self.pos];
        self.squares[self.pos] = sq;
        self.pos += 1;
        if self.pos == self.squares.len() {
            self.pos = 0;
            self.sum = self.squares.iter().sum();
        }
    }

    fn mean(&self) -> f64 {
        (self.sum / self.squares.len() as f64).max(0.0)
    }

    fn len(&self) -> usize {
        self.squares.len()
    }
}

/// Dual-window level estimator
///
/// Both windows start filled with silence, so a sustained loud signal
/// raises the fast level first and the slow level shortly after.
#[derive(Debug)]
pub struct LevelEstimator {
    fast: SlidingMeanSquare,
    slow: SlidingMeanSquare,
    frames_processed: u64,
    last: LevelSample,
}

impl LevelEstimator {
    /// Create an estimator
    ///
    /// # Arguments
    /// * `sample_rate` - Stream sample rate in Hz
    /// * `fast_ms` - Fast window length in milliseconds
    /// * `slow_ms` - Slow window length in milliseconds (must exceed `fast_ms`)
    pub fn new(sample_rate: u32, fast_ms: f64, slow_ms: f64) -> Result<Self, ConfigError> {
        if !(fast_ms.is_finite() && fast_ms > 0.0) {
            return Err(ConfigError::invalid("fast_window_ms", "must be positive"));
        }
        let fast_len = ((fast_ms / 1000.0) * sample_rate as f64).round() as usize;
        let slow_len = ((slow_ms / 1000.0) * sample_rate as f64).round() as usize;
        if fast_len == 0 || !slow_ms.is_finite() || fast_len >= slow_len {
            return Err(ConfigError::invalid(
                "fast_window_ms",
                format!(
                    "fast window ({} ms) must be non-empty and shorter than slow window ({} ms)",
                    fast_ms, slow_ms
                ),
            ));
        }
        tracing::debug!(fast_len, slow_len, sample_rate, "Level estimator windows");
        Ok(Self {
            fast: SlidingMeanSquare::new(fast_len),
            slow: SlidingMeanSquare::new(slow_len),
            frames_processed: 0,
            last: LevelSample::silent(),
        })
    }

    /// Feed one calibrated block and return its peak fast and slow levels
    pub fn update(&mut self, block: &AudioBlock) -> LevelSample {
        let (fast_len, slow_len) = self.window_lengths();
        let mut fast_peak = 0.0f64;
        let mut slow_peak = 0.0f64;
        for (i, &sample) in block.samples().iter().enumerate() {
            self.fast.push(sample);
            self.slow.push(sample);
            if i + 1 >= fast_len {
                fast_peak = fast_peak.max(self.fast.mean());
            }
            if i + 1 >= slow_len {
                slow_peak = slow_peak.max(self.slow.mean());
            }
        }
        fast_peak = fast_peak.max(self.fast.mean());
        slow_peak = slow_peak.max(self.slow.mean());

        let frame_start = self.frames_processed;
        self.frames_processed += block.len() as u64;
        self.last = LevelSample {
            fast: mean_square_to_db(fast_peak),
            slow: mean_square_to_db(slow_peak),
            frame_start,
            frame_end: self.frames_processed,
            timestamp: block.received_at(),
        };
        self.last
    }

    /// Most recent levels
    pub fn last(&self) -> LevelSample {
        self.last
    }

    /// Total frames consumed since construction
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Window lengths in samples (fast, slow)
    pub fn window_lengths(&self) -> (usize, usize) {
        (self.fast.len(), self.slow.len())
    }
}
