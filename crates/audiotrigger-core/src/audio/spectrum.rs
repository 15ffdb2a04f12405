//! Third-octave spectrum analysis
//!
//! [`BandAnalyzer`] turns a frame of calibrated samples into third-octave
//! band levels using a Hann-windowed FFT power spectrum. [`SpectrumReporter`]
//! keeps the most recent `fft_size` samples and emits a weighted
//! [`SpectrumReport`] every `interval` seconds of stream time, regardless of
//! trigger state.

use crate::audio::block::AudioBlock;
use crate::audio::calibration::Calibrator;
use crate::audio::level::mean_square_to_db;
use crate::config::SpectrumConfig;
use chrono::{DateTime, Utc};
use ringbuf::traits::{Consumer, RingBuffer as _};
use ringbuf::HeapRb;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Nominal third-octave centre frequencies (Hz) reported in spectra
pub const THIRD_OCTAVE_CENTERS: [f64; 29] = [
    31.5, 40.0, 50.0, 63.0, 80.0, 100.0, 125.0, 160.0, 200.0, 250.0, 315.0, 400.0, 500.0, 630.0,
    800.0, 1000.0, 1250.0, 1600.0, 2000.0, 2500.0, 3150.0, 4000.0, 5000.0, 6300.0, 8000.0,
    10000.0, 12500.0, 16000.0, 20000.0,
];

/// Low-frequency bands recorded per block in event band CSVs
pub const TRIGGER_BANDS: [f64; 10] = [
    40.0, 50.0, 63.0, 80.0, 100.0, 125.0, 160.0, 200.0, 250.0, 315.0,
];

/// Half-band factor, 2^(1/6)
const BAND_EDGE: f64 = 1.122_462_048_309_373;

/// Text label for a band centre ("31.5", "80", "1000")
pub fn band_label(fc: f64) -> String {
    format!("{}", fc)
}

/// Frequency weighting applied to reported band levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Weighting {
    /// A-weighting (IEC 61672)
    A,
    /// C-weighting (IEC 61672)
    C,
    /// Unweighted
    #[default]
    Z,
}

impl Weighting {
    /// Level correction in dB at frequency `f`
    pub fn correction_db(self, f: f64) -> f64 {
        let f2 = f * f;
        match self {
            Weighting::Z => 0.0,
            Weighting::A => {
                let num = 12194.0f64.powi(2) * f2 * f2;
                let den = (f2 + 20.6f64.powi(2))
                    * ((f2 + 107.7f64.powi(2)) * (f2 + 737.9f64.powi(2))).sqrt()
                    * (f2 + 12194.0f64.powi(2));
                20.0 * (num / den).log10() + 2.0
            }
            Weighting::C => {
                let num = 12194.0f64.powi(2) * f2;
                let den = (f2 + 20.6f64.powi(2)) * (f2 + 12194.0f64.powi(2));
                20.0 * (num / den).log10() + 0.06
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Weighting::A => "A",
            Weighting::C => "C",
            Weighting::Z => "Z",
        }
    }
}

impl fmt::Display for Weighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weighting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Weighting::A),
            "C" => Ok(Weighting::C),
            "Z" => Ok(Weighting::Z),
            other => Err(format!("unknown weighting {:?} (expected A, C or Z)", other)),
        }
    }
}

/// FFT bin range feeding one band
#[derive(Debug, Clone, Copy)]
struct BandBins {
    fc: f64,
    lo: usize,
    hi: usize,
}

/// Third-octave band power from a fixed-length frame
///
/// All buffers are allocated and the FFT planned at construction; analysing
/// a frame allocates nothing.
pub struct BandAnalyzer {
    frame_len: usize,
    window: Vec<f32>,
    /// Scale turning summed |X|² into a one-sided mean square
    power_scale: f64,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    bands: Vec<BandBins>,
    mean_squares: Vec<f64>,
}

impl BandAnalyzer {
    /// Create an analyzer
    ///
    /// # Arguments
    /// * `sample_rate` - Sample rate in Hz
    /// * `frame_len` - FFT length in samples
    /// * `centers` - Band centre frequencies; bands above Nyquist are omitted
    pub fn new(sample_rate: u32, frame_len: usize, centers: &[f64]) -> Self {
        let frame_len = frame_len.max(2);
        let window: Vec<f32> = (0..frame_len)
            .map(|n| {
                let phase = 2.0 * std::f64::consts::PI * n as f64 / frame_len as f64;
                (0.5 - 0.5 * phase.cos()) as f32
            })
            .collect();
        let window_power: f64 = window.iter().map(|&w| f64::from(w) * f64::from(w)).sum();

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(frame_len);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        let bin_hz = sample_rate as f64 / frame_len as f64;
        let nyquist = sample_rate as f64 / 2.0;
        let last_bin = frame_len / 2;
        let bands: Vec<BandBins> = centers
            .iter()
            .filter(|&&fc| fc * BAND_EDGE <= nyquist)
            .map(|&fc| {
                let lo = ((fc / BAND_EDGE) / bin_hz).ceil() as usize;
                let hi = ((fc * BAND_EDGE) / bin_hz).ceil() as usize;
                let (lo, hi) = if hi > lo {
                    (lo.max(1), hi.min(last_bin + 1))
                } else {
                    // Band narrower than one bin: use the nearest bin
                    let nearest = ((fc / bin_hz).round() as usize).clamp(1, last_bin);
                    (nearest, nearest + 1)
                };
                BandBins { fc, lo, hi }
            })
            .collect();

        Self {
            frame_len,
            window,
            power_scale: 2.0 / (frame_len as f64 * window_power),
            fft,
            buffer: vec![Complex::new(0.0, 0.0); frame_len],
            scratch,
            mean_squares: vec![0.0; bands.len()],
            bands,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Centre frequencies of the bands this analyzer reports
    pub fn centers(&self) -> impl Iterator<Item = f64> + '_ {
        self.bands.iter().map(|b| b.fc)
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Mean-square pressure (Pa²) per band
    ///
    /// Frames shorter than the FFT length are zero-padded; longer frames are
    /// truncated to their most recent samples.
    pub fn analyze(&mut self, samples: &[f32]) -> &[f64] {
        let samples = &samples[samples.len().saturating_sub(self.frame_len)..];
        let pad = self.frame_len - samples.len();
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let x = if i < pad { 0.0 } else { samples[i - pad] };
            *slot = Complex::new(x * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (band, out) in self.bands.iter().zip(self.mean_squares.iter_mut()) {
            let power: f64 = self.buffer[band.lo..band.hi]
                .iter()
                .map(|c| f64::from(c.norm_sqr()))
                .sum();
            *out = power * self.power_scale;
        }
        &self.mean_squares
    }

    /// Band levels in dB SPL with calibration band corrections and weighting
    pub fn levels_db(
        &mut self,
        samples: &[f32],
        calibrator: &Calibrator,
        weighting: Weighting,
        out: &mut Vec<f64>,
    ) {
        self.analyze(samples);
        out.clear();
        out.extend(self.bands.iter().zip(&self.mean_squares).map(|(band, &ms)| {
            mean_square_to_db(ms)
                + calibrator.band_correction_db(band.fc)
                + weighting.correction_db(band.fc)
        }));
    }
}

/// Weighted third-octave spectrum, as published on the spectrum topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumReport {
    pub bands: Vec<String>,
    pub values: Vec<f64>,
    pub weighting: Weighting,
    pub ts: DateTime<Utc>,
}

impl SpectrumReport {
    /// Level of the band labelled `label`
    pub fn value(&self, label: &str) -> Option<f64> {
        self.bands
            .iter()
            .position(|b| b == label)
            .map(|i| self.values[i])
    }
}

/// Periodic spectrum reporter
///
/// Only constructed when spectrum publishing is enabled.
pub struct SpectrumReporter {
    analyzer: BandAnalyzer,
    history: HeapRb<f32>,
    frame: Vec<f32>,
    labels: Vec<String>,
    calibrator: Calibrator,
    weighting: Weighting,
    interval_frames: u64,
    frames_since: u64,
}

impl SpectrumReporter {
    pub fn new(config: &SpectrumConfig, sample_rate: u32, calibrator: &Calibrator) -> Self {
        let analyzer = BandAnalyzer::new(sample_rate, config.fft_size, &THIRD_OCTAVE_CENTERS);
        let labels = analyzer.centers().map(band_label).collect();
        let interval_frames = ((config.interval * sample_rate as f64).round() as u64).max(1);
        tracing::debug!(
            fft_size = config.fft_size,
            bands = analyzer.band_count(),
            interval_frames,
            weighting = %config.weighting,
            "Spectrum reporter ready"
        );
        Self {
            history: HeapRb::new(analyzer.frame_len()),
            frame: Vec::with_capacity(analyzer.frame_len()),
            analyzer,
            labels,
            calibrator: calibrator.clone(),
            weighting: config.weighting,
            interval_frames,
            frames_since: 0,
        }
    }

    /// Feed one calibrated block; returns a report when an interval elapses
    pub fn push(&mut self, block: &AudioBlock) -> Option<SpectrumReport> {
        self.history.push_slice_overwrite(block.samples());
        self.frames_since += block.len() as u64;
        if self.frames_since < self.interval_frames {
            return None;
        }
        self.frames_since %= self.interval_frames;

        let (head, tail) = self.history.as_slices();
        self.frame.clear();
        self.frame.extend_from_slice(head);
        self.frame.extend_from_slice(tail);

        let mut values = Vec::with_capacity(self.labels.len());
        self.analyzer
            .levels_db(&self.frame, &self.calibrator, self.weighting, &mut values);
        Some(SpectrumReport {
            bands: self.labels.clone(),
            values,
            weighting: self.weighting,
            ts: block.received_at(),
        })
    }

    pub fn weighting(&self) -> Weighting {
        self.weighting
    }
}
