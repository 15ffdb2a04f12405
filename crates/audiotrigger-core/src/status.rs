//! Engine counters and the read-only status snapshot
//!
//! The ingestion loop is the single writer: once per block it builds a fresh
//! [`EngineSnapshot`] and replaces the previous one in a `tokio::sync::watch`
//! channel. Readers (status API, status topic) hold a [`StatusHandle`] and
//! clone the current `Arc` without ever blocking the writer.

use crate::audio::level::LevelSample;
use crate::audio::spectrum::SpectrumReport;
use crate::trigger::state::TriggerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Recoverable-failure and throughput counters shared across threads
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Events closed by the state machine (including shutdown truncation)
    pub events_finalized: AtomicU64,
    /// Events written to disk
    pub events_persisted: AtomicU64,
    /// Events dropped because they could not be written
    pub persistence_failures: AtomicU64,
    /// Exceedances ignored during cooldown
    pub suppressed_exceedances: AtomicU64,
    /// Blocks evicted from the full source queue
    pub dropped_blocks: AtomicU64,
    /// Bus messages dropped because the publish queue was full
    pub publish_dropped: AtomicU64,
    /// Bus messages the bus rejected
    pub publish_failures: AtomicU64,
    /// Blocks processed by the ingestion loop
    pub blocks_processed: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            events_finalized: self.events_finalized.load(Ordering::Relaxed),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            suppressed_exceedances: self.suppressed_exceedances.load(Ordering::Relaxed),
            dropped_blocks: self.dropped_blocks.load(Ordering::Relaxed),
            publish_dropped: self.publish_dropped.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub events_finalized: u64,
    pub events_persisted: u64,
    pub persistence_failures: u64,
    pub suppressed_exceedances: u64,
    pub dropped_blocks: u64,
    pub publish_dropped: u64,
    pub publish_failures: u64,
    pub blocks_processed: u64,
}

/// Immutable view of the engine, regenerated once per block
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: TriggerState,
    pub last_levels: Option<LevelSample>,
    /// Stream seconds since the last event closed (`None` before the first)
    pub seconds_since_last_event: Option<f64>,
    /// Pre-roll ring occupancy in `[0, 1]`
    pub buffer_fill_ratio: f64,
    pub open_event_id: Option<u64>,
    /// Stream time covered so far
    pub stream_seconds: f64,
    pub sample_rate: u32,
    pub counters: CounterSnapshot,
    pub spectrum: Option<SpectrumReport>,
    pub generated_at: DateTime<Utc>,
}

impl EngineSnapshot {
    /// Snapshot of an engine that has not processed any audio
    pub fn initial(sample_rate: u32) -> Self {
        Self {
            state: TriggerState::Idle,
            last_levels: None,
            seconds_since_last_event: None,
            buffer_fill_ratio: 0.0,
            open_event_id: None,
            stream_seconds: 0.0,
            sample_rate,
            counters: CounterSnapshot::default(),
            spectrum: None,
            generated_at: Utc::now(),
        }
    }
}

/// Single-writer side of the status channel
pub struct StatusSink {
    tx: watch::Sender<Arc<EngineSnapshot>>,
}

impl StatusSink {
    pub fn new(initial: EngineSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Replace the current snapshot; never blocks, works without readers
    pub fn commit(&self, snapshot: EngineSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn current_snapshot(&self) -> Arc<EngineSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// New reader handle
    pub fn handle(&self) -> StatusHandle {
        StatusHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only status handle, cheap to clone across threads and tasks
#[derive(Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<Arc<EngineSnapshot>>,
}

impl StatusHandle {
    /// Latest snapshot
    pub fn current_snapshot(&self) -> Arc<EngineSnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait until a newer snapshot is committed
    ///
    /// Returns `false` once the engine has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_snapshot() {
        let counters = EngineCounters::default();
        counters.dropped_blocks.fetch_add(3, Ordering::Relaxed);
        counters.events_persisted.fetch_add(1, Ordering::Relaxed);
        let snap = counters.snapshot();
        assert_eq!(snap.dropped_blocks, 3);
        assert_eq!(snap.events_persisted, 1);
        assert_eq!(snap.persistence_failures, 0);
    }

    #[test]
    fn test_commit_replaces_snapshot() {
        let sink = StatusSink::new(EngineSnapshot::initial(48000));
        let handle = sink.handle();
        let before = handle.current_snapshot();
        assert_eq!(before.state, TriggerState::Idle);

        let mut next = EngineSnapshot::initial(48000);
        next.state = TriggerState::Capturing;
        next.open_event_id = Some(1);
        sink.commit(next);

        let after = handle.current_snapshot();
        assert_eq!(after.state, TriggerState::Capturing);
        assert_eq!(after.open_event_id, Some(1));
        // Earlier snapshots are never mutated
        assert_eq!(before.state, TriggerState::Idle);
        assert_eq!(sink.current_snapshot().open_event_id, Some(1));
    }

    #[test]
    fn test_commit_without_readers() {
        let sink = StatusSink::new(EngineSnapshot::initial(44100));
        sink.commit(EngineSnapshot::initial(44100));
        assert_eq!(sink.current_snapshot().sample_rate, 44100);
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = EngineSnapshot::initial(48000);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "IDLE");
        assert_eq!(json["sample_rate"], 48000);
        assert!(json["last_levels"].is_null());
        assert_eq!(json["counters"]["dropped_blocks"], 0);
    }
}
