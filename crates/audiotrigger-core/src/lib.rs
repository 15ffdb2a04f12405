//! Audiotrigger Core - trigger engine, level detection, and event capture
//!
//! This library monitors a single audio input stream, computes calibrated
//! fast/slow sound levels, and captures discrete events (pre-roll plus
//! post-trigger audio) when the levels cross configured thresholds.
//! Captured events are persisted to disk and announced over a message bus;
//! third-octave spectra and engine status are published periodically.

pub mod audio;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod status;
pub mod trigger;

pub use audio::{
    block::AudioBlock,
    calibration::Calibrator,
    level::{LevelEstimator, LevelSample},
    ring::RingBuffer,
    spectrum::{SpectrumReporter, Weighting},
};
pub use bus::{BroadcastBus, BusMessage, MessageBus};
pub use config::TriggerConfig;
pub use engine::{Engine, EngineContext};
pub use error::{CaptureSourceError, ConfigError, EngineError, PersistenceError, PublishError};
pub use status::{EngineSnapshot, StatusHandle};
pub use trigger::state::{TriggerState, TriggerStateMachine};
pub use trigger::writer::{DiskEventWriter, EventRecord, EventSink};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (UTC) stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate for audio capture
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Reference sound pressure for dB SPL (20 µPa)
pub const REFERENCE_PRESSURE: f64 = 20e-6;
