//! Shared helpers for the end-to-end tests

#![allow(dead_code)]

use audiotrigger::audio::level::db_to_rms;
use audiotrigger::error::PersistenceError;
use audiotrigger::trigger::writer::{CaptureBundle, EventRecord, EventSink};
use audiotrigger::{AudioBlock, Calibrator, Engine, EngineContext, MessageBus, TriggerConfig};
use std::sync::{Arc, Mutex};

/// Sink that keeps records in memory and fails on selected event ids
#[derive(Clone, Default)]
pub struct CollectSink {
    pub records: Arc<Mutex<Vec<EventRecord>>>,
    /// Largest absolute pre-roll sample per persisted event
    pub preroll_peaks: Arc<Mutex<Vec<f32>>>,
    pub fail_ids: Vec<u64>,
}

impl CollectSink {
    pub fn failing(ids: &[u64]) -> Self {
        Self {
            fail_ids: ids.to_vec(),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl EventSink for CollectSink {
    fn persist(&mut self, bundle: &CaptureBundle) -> Result<EventRecord, PersistenceError> {
        if self.fail_ids.contains(&bundle.event.event_id) {
            return Err(PersistenceError::Io {
                path: "/injected".into(),
                source: std::io::Error::other("injected failure"),
            });
        }
        let record = EventRecord::summarize(bundle);
        let peak = bundle
            .preroll
            .iter()
            .flat_map(|b| b.samples().iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        self.preroll_peaks.lock().unwrap().push(peak);
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }
}

/// Generates consecutive constant-level blocks
pub struct BlockFeeder {
    block_len: usize,
    seq: u64,
}

impl BlockFeeder {
    pub fn new(block_len: usize) -> Self {
        Self { block_len, seq: 0 }
    }

    /// Next block at `db` SPL (`None` = digital silence)
    pub fn next(&mut self, db: Option<f64>) -> AudioBlock {
        let value = db.map(|db| db_to_rms(db) as f32).unwrap_or(0.0);
        let block = AudioBlock::new(self.seq, chrono::Utc::now(), vec![value; self.block_len]);
        self.seq += 1;
        block
    }

    pub fn blocks_sent(&self) -> u64 {
        self.seq
    }
}

/// Engine with an identity calibration and the given sink
pub fn engine_with(
    config: TriggerConfig,
    sample_rate: u32,
    sink: Box<dyn EventSink>,
    bus: Arc<dyn MessageBus>,
) -> Engine {
    let ctx = EngineContext::init(config, sample_rate, Calibrator::identity()).unwrap();
    Engine::init(ctx, sink, bus).unwrap()
}

/// Feed `count` blocks at one level
pub fn feed(engine: &mut Engine, feeder: &mut BlockFeeder, count: usize, db: Option<f64>) {
    for _ in 0..count {
        engine.process(feeder.next(db));
    }
}
