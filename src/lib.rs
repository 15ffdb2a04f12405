//! Audiotrigger - acoustic event detector
//!
//! This library re-exports the trigger engine, level detection, spectrum
//! reporting and event capture from `audiotrigger-core`.
//!
//! The status API lives in `audiotrigger-server`.

pub use audiotrigger_core::audio;
pub use audiotrigger_core::bus;
pub use audiotrigger_core::config;
pub use audiotrigger_core::engine;
pub use audiotrigger_core::error;
pub use audiotrigger_core::status;
pub use audiotrigger_core::trigger;

pub use audiotrigger_core::{
    AudioBlock, BroadcastBus, BusMessage, Calibrator, Engine, EngineContext, EngineSnapshot,
    EventRecord, LevelEstimator, LevelSample, MessageBus, RingBuffer, SpectrumReporter,
    TriggerConfig, TriggerState, TriggerStateMachine, Weighting,
};
pub use audiotrigger_core::{DEFAULT_SAMPLE_RATE, REFERENCE_PRESSURE, VERSION};
