//! Trigger engine
//!
//! [`EngineContext`] gathers everything constructed once at startup
//! (validated config, calibration, counters, status sink, topics).
//! [`Engine`] owns the single ingestion path: for every block, in arrival
//! order,
//!
//! 1. calibrate,
//! 2. update fast/slow levels,
//! 3. advance the trigger state machine and feed any open capture,
//! 4. push the block into the pre-roll ring,
//! 5. feed the spectrum reporter,
//! 6. commit a fresh status snapshot.
//!
//! Disk writes and bus publishing happen on worker threads behind bounded
//! queues; the ingestion path only ever uses non-blocking sends.

use crate::audio::block::AudioBlock;
use crate::audio::calibration::Calibrator;
use crate::audio::level::{LevelEstimator, LevelSample};
use crate::audio::ring::RingBuffer;
use crate::audio::source::BlockConsumer;
use crate::audio::spectrum::{SpectrumReport, SpectrumReporter};
use crate::bus::{spawn_publisher, MessageBus, Publisher, PublisherHandle, Topics};
use crate::config::TriggerConfig;
use crate::error::{CaptureSourceError, ConfigError, EngineError};
use crate::status::{CounterSnapshot, EngineCounters, EngineSnapshot, StatusHandle, StatusSink};
use crate::trigger::state::{TriggerState, TriggerStateMachine, TriggerTiming, Transition};
use crate::trigger::writer::{CaptureBundle, EventSink, WriterHandle};
use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bus messages that may wait for the publisher thread
const PUBLISH_QUEUE: usize = 256;

/// Finalized events that may wait for the writer thread
const WRITER_QUEUE: usize = 8;

/// How long `run` waits for a block before re-checking the stop flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Startup state shared by the engine components
pub struct EngineContext {
    pub config: Arc<TriggerConfig>,
    /// Actual stream sample rate (may differ from the configured one)
    pub sample_rate: u32,
    pub block_len: usize,
    pub calibrator: Calibrator,
    pub counters: Arc<EngineCounters>,
    pub status: StatusSink,
    pub topics: Topics,
}

impl EngineContext {
    /// Validate the configuration and build the context
    ///
    /// # Arguments
    /// * `config` - Engine configuration
    /// * `sample_rate` - Rate reported by the opened audio source
    /// * `calibrator` - Calibration loaded for the input device
    pub fn init(
        config: TriggerConfig,
        sample_rate: u32,
        calibrator: Calibrator,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if sample_rate == 0 {
            return Err(ConfigError::invalid("samplerate", "source reported 0 Hz"));
        }
        if sample_rate != config.samplerate {
            tracing::warn!(
                configured = config.samplerate,
                actual = sample_rate,
                "Running at the source's sample rate"
            );
        }
        let block_len = config.block_len(sample_rate);
        tracing::info!(
            sample_rate,
            block_len,
            thresh_a80 = config.thresh_a80,
            thresh_a160 = config.thresh_a160,
            pre_trigger = config.pre_trigger,
            post_trigger = config.post_trigger,
            hold_sec = config.hold_sec,
            confirm_sec = config.confirm_sec,
            "Engine context initialized"
        );
        Ok(Self {
            topics: Topics::new(&config.topic_base),
            config: Arc::new(config),
            sample_rate,
            block_len,
            calibrator,
            counters: Arc::new(EngineCounters::default()),
            status: StatusSink::new(EngineSnapshot::initial(sample_rate)),
        })
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.handle()
    }
}

/// Capture in progress: pre-roll taken at open time plus live blocks
struct OpenCapture {
    preroll: Vec<Arc<AudioBlock>>,
    live: Vec<Arc<AudioBlock>>,
}

/// The ingestion loop and its exclusively owned state
pub struct Engine {
    ctx: EngineContext,
    ring: RingBuffer,
    estimator: LevelEstimator,
    machine: TriggerStateMachine,
    spectrum: Option<SpectrumReporter>,
    latest_spectrum: Option<SpectrumReport>,
    capture: Option<OpenCapture>,
    last_levels: Option<LevelSample>,
    last_timestamp: DateTime<Utc>,
    stream_frames: u64,
    preroll_target_frames: u64,
    status_interval_frames: u64,
    frames_since_status: u64,
    // Dropped in declaration order: publisher, then writer (joins), then handle
    publisher: Publisher,
    writer: WriterHandle,
    publisher_handle: PublisherHandle,
}

impl Engine {
    /// Build the engine and start its worker threads
    ///
    /// # Arguments
    /// * `ctx` - Startup context
    /// * `sink` - Destination for finalized events
    /// * `bus` - Message bus for notifications, spectra, levels and status
    pub fn init(
        ctx: EngineContext,
        sink: Box<dyn EventSink>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, EngineError> {
        let config = Arc::clone(&ctx.config);
        let sr = ctx.sample_rate;

        let estimator = LevelEstimator::new(sr, config.fast_window_ms, config.slow_window_ms)?;
        let ring = RingBuffer::new(config.preroll_blocks(sr));
        let machine = TriggerStateMachine::new(TriggerTiming::from_config(&config, sr));
        // Not constructed at all when disabled
        let spectrum = config
            .spectrum
            .enabled
            .then(|| SpectrumReporter::new(&config.spectrum, sr, &ctx.calibrator));

        let (publisher, publisher_handle) =
            spawn_publisher(bus, PUBLISH_QUEUE, Arc::clone(&ctx.counters)).map_err(|source| {
                EngineError::Spawn {
                    name: "bus-publisher",
                    source,
                }
            })?;
        let writer = WriterHandle::spawn(
            sink,
            WRITER_QUEUE,
            publisher.clone(),
            ctx.topics.event(),
            Arc::clone(&ctx.counters),
        )
        .map_err(|source| EngineError::Spawn {
            name: "event-writer",
            source,
        })?;

        let _ = publisher.publish_text(ctx.topics.availability(), "online".into(), true);
        tracing::info!(
            ring_blocks = ring.capacity(),
            spectrum = spectrum.is_some(),
            topic_base = %ctx.topics.base(),
            "Engine started"
        );

        Ok(Self {
            preroll_target_frames: TriggerConfig::frames(config.pre_trigger, sr),
            status_interval_frames: TriggerConfig::frames(config.status_interval, sr).max(1),
            ctx,
            ring,
            estimator,
            machine,
            spectrum,
            latest_spectrum: None,
            capture: None,
            last_levels: None,
            last_timestamp: Utc::now(),
            stream_frames: 0,
            frames_since_status: 0,
            publisher,
            writer,
            publisher_handle,
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn state(&self) -> TriggerState {
        self.machine.state()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.ctx.status.handle()
    }

    /// Latest committed snapshot
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.ctx.status.current_snapshot()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.ctx.counters.snapshot()
    }

    /// Stream time processed so far
    pub fn stream_seconds(&self) -> f64 {
        self.stream_frames as f64 / self.ctx.sample_rate as f64
    }

    /// Process one raw block; returns the state machine's transition, if any
    pub fn process(&mut self, raw: AudioBlock) -> Option<Transition> {
        let block = Arc::new(self.ctx.calibrator.calibrate(&raw));
        let levels = self.estimator.update(&block);
        self.stream_frames = levels.frame_end;
        self.last_timestamp = block.received_at();
        self.last_levels = Some(levels);
        self.publish_levels(&levels);

        let transition = self.machine.update(&levels);
        match &transition {
            Some(Transition::Armed { .. }) => self.open_capture(),
            Some(Transition::Opened { .. }) if self.capture.is_none() => self.open_capture(),
            Some(Transition::Aborted) => self.capture = None,
            _ => {}
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.live.push(Arc::clone(&block));
        }
        if let Some(Transition::Finalized(event)) = &transition {
            self.finish_capture(event.clone());
        }

        self.ring.push(Arc::clone(&block));

        if let Some(reporter) = self.spectrum.as_mut() {
            if let Some(report) = reporter.push(&block) {
                let _ = self
                    .publisher
                    .publish_json(self.ctx.topics.spectrum(), &report);
                self.latest_spectrum = Some(report);
            }
        }

        let counters = &self.ctx.counters;
        counters.blocks_processed.fetch_add(1, Ordering::Relaxed);
        counters
            .suppressed_exceedances
            .store(self.machine.suppressed_count(), Ordering::Relaxed);

        self.commit_status();
        self.frames_since_status += block.len() as u64;
        if self.frames_since_status >= self.status_interval_frames {
            self.frames_since_status %= self.status_interval_frames;
            let snapshot = self.ctx.status.current_snapshot();
            let _ = self
                .publisher
                .publish_json(self.ctx.topics.status(), &*snapshot);
        }

        transition
    }

    /// Process blocks until `stop` is raised or the source ends
    ///
    /// A failure reported by the source is fatal and returned.
    pub fn run(&mut self, blocks: &BlockConsumer, stop: &AtomicBool) -> Result<(), CaptureSourceError> {
        while !stop.load(Ordering::Acquire) {
            if let Some(err) = blocks.take_fault() {
                return Err(err);
            }
            match blocks.recv_timeout(POLL_INTERVAL) {
                Ok(block) => {
                    self.process(block);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if let Some(err) = blocks.take_fault() {
                        return Err(err);
                    }
                    tracing::info!(
                        stream_secs = self.stream_seconds(),
                        "Audio source ended"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Finalize any open capture, flush workers and stop
    ///
    /// Queued events are written before this returns.
    pub fn shutdown(mut self) -> CounterSnapshot {
        let now = Utc::now().max(self.last_timestamp);
        if let Some(event) = self.machine.force_finalize(self.stream_frames, now) {
            tracing::warn!(event_id = event.event_id, "Shutdown during capture, writing truncated event");
            self.finish_capture(event);
        }
        self.capture = None;
        self.commit_status();

        let _ = self
            .publisher
            .publish_text(self.ctx.topics.availability(), "offline".into(), true);

        self.writer.stop();
        let Engine {
            ctx,
            publisher,
            publisher_handle,
            ..
        } = self;
        drop(publisher);
        publisher_handle.join();

        let counters = ctx.counters.snapshot();
        tracing::info!(
            events_finalized = counters.events_finalized,
            events_persisted = counters.events_persisted,
            persistence_failures = counters.persistence_failures,
            dropped_blocks = counters.dropped_blocks,
            suppressed = counters.suppressed_exceedances,
            "Engine stopped"
        );
        counters
    }

    fn open_capture(&mut self) {
        let (preroll, held) = if self.preroll_target_frames == 0 {
            (Vec::new(), 0)
        } else {
            (self.ring.snapshot_preroll(), self.ring.held_frames())
        };
        if (held as u64) < self.preroll_target_frames {
            tracing::debug!(
                held_frames = held,
                target_frames = self.preroll_target_frames,
                "Pre-roll incomplete"
            );
        }
        self.capture = Some(OpenCapture {
            preroll,
            live: Vec::new(),
        });
    }

    fn finish_capture(&mut self, event: crate::trigger::state::TriggerEvent) {
        let capture = self.capture.take().unwrap_or(OpenCapture {
            preroll: Vec::new(),
            live: Vec::new(),
        });
        self.ctx
            .counters
            .events_finalized
            .fetch_add(1, Ordering::Relaxed);
        let bundle = CaptureBundle {
            event,
            preroll: capture.preroll,
            live: capture.live,
            sample_rate: self.ctx.sample_rate,
            preroll_target_frames: self.preroll_target_frames,
        };
        if let Err(e) = self.writer.submit(bundle) {
            self.ctx
                .counters
                .persistence_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Event dropped before persistence");
        }
    }

    fn publish_levels(&self, levels: &LevelSample) {
        let topics = &self.ctx.topics;
        let _ = self
            .publisher
            .publish_text(topics.level_fast(), format!("{:.2}", levels.fast), false);
        let _ = self
            .publisher
            .publish_text(topics.level_slow(), format!("{:.2}", levels.slow), false);
    }

    fn commit_status(&self) {
        let sr = self.ctx.sample_rate as f64;
        let snapshot = EngineSnapshot {
            state: self.machine.state(),
            last_levels: self.last_levels,
            seconds_since_last_event: self
                .machine
                .last_event_end()
                .map(|end| self.stream_frames.saturating_sub(end) as f64 / sr),
            buffer_fill_ratio: self.ring.fill_ratio(),
            open_event_id: self.machine.open_event_id(),
            stream_seconds: self.stream_frames as f64 / sr,
            sample_rate: self.ctx.sample_rate,
            counters: self.ctx.counters.snapshot(),
            spectrum: self.latest_spectrum.clone(),
            generated_at: Utc::now(),
        };
        self.ctx.status.commit(snapshot);
    }
}
