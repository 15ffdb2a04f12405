//! Event capture writer
//!
//! A finalized event is handed over as a [`CaptureBundle`]: the event
//! record, the pre-roll blocks taken from the ring buffer when it opened,
//! and the live blocks captured until it closed. The bundle is persisted on
//! the `event-writer` thread so disk latency never reaches ingestion.
//!
//! ## Layout
//!
//! ```text
//! <event_dir>/<YYYY-MM-DDTHH-MM-SSZ>_<event_id:06>/
//!     audio.wav    32-bit float mono, calibrated pascals (pre-roll + live)
//!     bands.csv    per live block: ts, LZ_<fc>..., LA_<fc>... (40-315 Hz)
//!     event.json   EventRecord
//! ```

use crate::audio::block::AudioBlock;
use crate::audio::calibration::Calibrator;
use crate::audio::spectrum::{band_label, BandAnalyzer, Weighting, TRIGGER_BANDS};
use crate::bus::Publisher;
use crate::error::PersistenceError;
use crate::status::EngineCounters;
use crate::trigger::state::{TriggerCause, TriggerEvent};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Everything needed to persist one finalized event
#[derive(Debug, Clone)]
pub struct CaptureBundle {
    pub event: TriggerEvent,
    /// Ring buffer contents when the event opened, oldest first
    pub preroll: Vec<Arc<AudioBlock>>,
    /// Blocks from the triggering block through the closing block
    pub live: Vec<Arc<AudioBlock>>,
    pub sample_rate: u32,
    /// Configured pre-roll length in frames
    pub preroll_target_frames: u64,
}

impl CaptureBundle {
    pub fn preroll_frames(&self) -> u64 {
        self.preroll.iter().map(|b| b.len() as u64).sum()
    }

    pub fn live_frames(&self) -> u64 {
        self.live.iter().map(|b| b.len() as u64).sum()
    }

    /// Whether the ring buffer supplied the full configured pre-roll
    pub fn preroll_complete(&self) -> bool {
        self.preroll_frames() >= self.preroll_target_frames
    }

    /// Pre-roll followed by live audio
    pub fn samples(&self) -> impl Iterator<Item = f32> + '_ {
        self.preroll
            .iter()
            .chain(self.live.iter())
            .flat_map(|b| b.samples().iter().copied())
    }
}

/// Files written for one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFiles {
    pub dir: PathBuf,
    pub audio: PathBuf,
    pub bands_csv: PathBuf,
    pub metadata: PathBuf,
}

/// Persisted summary of one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: u64,
    pub cause: TriggerCause,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Event start in stream seconds
    pub start_stream_secs: f64,
    /// Event end in stream seconds
    pub end_stream_secs: f64,
    pub peak_fast: f64,
    pub peak_slow: f64,
    pub preroll_secs: f64,
    /// Live audio from trigger to close
    pub capture_duration_secs: f64,
    /// Length of the audio file (pre-roll + live)
    pub total_duration_secs: f64,
    pub sample_rate: u32,
    pub sample_count: u64,
    pub preroll_complete: bool,
    pub truncated: bool,
    pub files: Option<EventFiles>,
}

impl EventRecord {
    /// Summary fields for a bundle, without files
    pub fn summarize(bundle: &CaptureBundle) -> Self {
        let event = &bundle.event;
        let rate = bundle.sample_rate as f64;
        let preroll = bundle.preroll_frames();
        let live = bundle.live_frames();
        let end_frame = event.end_frame.unwrap_or(event.start_frame + live);
        Self {
            event_id: event.event_id,
            cause: event.cause,
            start: event.started_at,
            end: event.ended_at.unwrap_or_else(Utc::now),
            start_stream_secs: event.start_frame as f64 / rate,
            end_stream_secs: end_frame as f64 / rate,
            peak_fast: event.peak_fast,
            peak_slow: event.peak_slow,
            preroll_secs: preroll as f64 / rate,
            capture_duration_secs: live as f64 / rate,
            total_duration_secs: (preroll + live) as f64 / rate,
            sample_rate: bundle.sample_rate,
            sample_count: preroll + live,
            preroll_complete: bundle.preroll_complete(),
            truncated: event.truncated,
            files: None,
        }
    }
}

/// Destination for finalized events
pub trait EventSink: Send {
    fn persist(&mut self, bundle: &CaptureBundle) -> Result<EventRecord, PersistenceError>;
}

/// Directory name for an event: start time (UTC) plus zero-padded id
pub fn event_dir_name(started_at: DateTime<Utc>, event_id: u64) -> String {
    format!("{}_{:06}", started_at.format("%Y-%m-%dT%H-%M-%SZ"), event_id)
}

/// Writes events under a base directory
pub struct DiskEventWriter {
    event_dir: PathBuf,
    sample_rate: u32,
    preroll_target_frames: u64,
    calibrator: Calibrator,
    analyzer: Option<BandAnalyzer>,
    levels: Vec<f64>,
}

impl DiskEventWriter {
    /// # Arguments
    /// * `event_dir` - Base directory (created on first event)
    /// * `sample_rate` - Stream sample rate
    /// * `preroll_target_frames` - Configured pre-roll, for the completeness flag
    /// * `calibrator` - Supplies per-band corrections for the band CSV
    pub fn new(
        event_dir: impl Into<PathBuf>,
        sample_rate: u32,
        preroll_target_frames: u64,
        calibrator: Calibrator,
    ) -> Self {
        Self {
            event_dir: event_dir.into(),
            sample_rate,
            preroll_target_frames,
            calibrator,
            analyzer: None,
            levels: Vec::with_capacity(TRIGGER_BANDS.len()),
        }
    }

    pub fn event_dir(&self) -> &Path {
        &self.event_dir
    }

    /// Concatenate pre-roll and live audio and persist the event
    pub fn finalize(
        &mut self,
        event: TriggerEvent,
        preroll: Vec<Arc<AudioBlock>>,
        live: Vec<Arc<AudioBlock>>,
    ) -> Result<EventRecord, PersistenceError> {
        let bundle = CaptureBundle {
            event,
            preroll,
            live,
            sample_rate: self.sample_rate,
            preroll_target_frames: self.preroll_target_frames,
        };
        self.persist(&bundle)
    }

    fn write_audio(path: &Path, bundle: &CaptureBundle) -> Result<(), PersistenceError> {
        let audio_err = |source| PersistenceError::Audio {
            path: path.to_path_buf(),
            source,
        };
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: bundle.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).map_err(audio_err)?;
        for sample in bundle.samples() {
            writer.write_sample(sample).map_err(audio_err)?;
        }
        writer.finalize().map_err(audio_err)
    }

    fn write_bands(&mut self, path: &Path, bundle: &CaptureBundle) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut out = BufWriter::new(File::create(path).map_err(io_err)?);

        let block_len = bundle.live.first().map(|b| b.len()).unwrap_or(0);
        if self.analyzer.as_ref().map(|a| a.frame_len()) != Some(block_len) && block_len > 0 {
            self.analyzer = Some(BandAnalyzer::new(bundle.sample_rate, block_len, &TRIGGER_BANDS));
        }

        let centers: Vec<f64> = match self.analyzer.as_ref() {
            Some(analyzer) => analyzer.centers().collect(),
            None => TRIGGER_BANDS.to_vec(),
        };
        let mut header = String::from("ts");
        for prefix in ["LZ", "LA"] {
            for &fc in &centers {
                header.push_str(&format!(",{}_{}", prefix, band_label(fc)));
            }
        }
        writeln!(out, "{}", header).map_err(io_err)?;

        if let Some(analyzer) = self.analyzer.as_mut() {
            for block in &bundle.live {
                analyzer.levels_db(block.samples(), &self.calibrator, Weighting::Z, &mut self.levels);
                let mut row = block
                    .received_at()
                    .to_rfc3339_opts(SecondsFormat::Millis, true);
                for &lz in &self.levels {
                    row.push_str(&format!(",{:.2}", lz));
                }
                for (&lz, &fc) in self.levels.iter().zip(&centers) {
                    row.push_str(&format!(",{:.2}", lz + Weighting::A.correction_db(fc)));
                }
                writeln!(out, "{}", row).map_err(io_err)?;
            }
        }
        out.flush().map_err(io_err)
    }

    fn write_files(
        &mut self,
        files: &EventFiles,
        bundle: &CaptureBundle,
    ) -> Result<EventRecord, PersistenceError> {
        Self::write_audio(&files.audio, bundle)?;
        self.write_bands(&files.bands_csv, bundle)?;

        let mut record = EventRecord::summarize(bundle);
        record.files = Some(files.clone());
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(&files.metadata, json).map_err(|source| PersistenceError::Io {
            path: files.metadata.clone(),
            source,
        })?;
        Ok(record)
    }
}

impl EventSink for DiskEventWriter {
    fn persist(&mut self, bundle: &CaptureBundle) -> Result<EventRecord, PersistenceError> {
        let event = &bundle.event;
        let dir = self
            .event_dir
            .join(event_dir_name(event.started_at, event.event_id));
        std::fs::create_dir_all(&dir).map_err(|source| PersistenceError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let files = EventFiles {
            audio: dir.join("audio.wav"),
            bands_csv: dir.join("bands.csv"),
            metadata: dir.join("event.json"),
            dir,
        };

        let record = match self.write_files(&files, bundle) {
            Ok(record) => record,
            Err(e) => {
                // Partial events are not left behind
                if let Err(cleanup) = std::fs::remove_dir_all(&files.dir) {
                    tracing::warn!(
                        dir = %files.dir.display(),
                        error = %cleanup,
                        "Failed to remove partial event directory"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            event_id = record.event_id,
            dir = %files.dir.display(),
            duration_secs = record.total_duration_secs,
            preroll_complete = record.preroll_complete,
            "Event persisted"
        );
        Ok(record)
    }
}

/// Owns the `event-writer` thread
pub struct WriterHandle {
    tx: Option<Sender<CaptureBundle>>,
    thread: Option<JoinHandle<()>>,
}

impl WriterHandle {
    /// Start the writer thread
    ///
    /// # Arguments
    /// * `sink` - Where events are persisted
    /// * `capacity` - Maximum bundles waiting to be written
    /// * `publisher` - Receives one notification per persisted event
    /// * `event_topic` - Topic for those notifications
    /// * `counters` - Persisted / failed event counters
    pub fn spawn(
        mut sink: Box<dyn EventSink>,
        capacity: usize,
        publisher: Publisher,
        event_topic: String,
        counters: Arc<EngineCounters>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<CaptureBundle>(capacity.max(1));
        let thread = std::thread::Builder::new()
            .name("event-writer".into())
            .spawn(move || {
                for bundle in rx.iter() {
                    let event_id = bundle.event.event_id;
                    match sink.persist(&bundle) {
                        Ok(record) => {
                            counters.events_persisted.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = publisher.publish_json(event_topic.clone(), &record) {
                                tracing::warn!(event_id, error = %e, "Event notification not published");
                            }
                        }
                        Err(e) => {
                            counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(event_id, error = %e, "Failed to persist event, dropped");
                        }
                    }
                }
                tracing::debug!("Event writer thread exited");
            })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Queue a bundle without blocking
    pub fn submit(&self, bundle: CaptureBundle) -> Result<(), PersistenceError> {
        let event_id = bundle.event.event_id;
        let tx = self
            .tx
            .as_ref()
            .ok_or(PersistenceError::WriterStopped { event_id })?;
        tx.try_send(bundle).map_err(|e| match e {
            TrySendError::Full(_) => PersistenceError::QueueFull { event_id },
            TrySendError::Disconnected(_) => PersistenceError::WriterStopped { event_id },
        })
    }

    /// Write everything queued, then stop the thread
    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{spawn_publisher, BroadcastBus};
    use crate::trigger::state::TriggerCause;
    use chrono::TimeZone;

    const SR: u32 = 1000;

    fn blocks(first_seq: u64, count: usize, len: usize, value: f32) -> Vec<Arc<AudioBlock>> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        (0..count)
            .map(|i| Arc::new(AudioBlock::new(first_seq + i as u64, at, vec![value; len])))
            .collect()
    }

    fn event(event_id: u64) -> TriggerEvent {
        TriggerEvent {
            event_id,
            cause: TriggerCause::Fast,
            start_frame: 2000,
            end_frame: Some(2500),
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 2).unwrap(),
            ended_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 3).unwrap()),
            peak_fast: 91.5,
            peak_slow: 88.0,
            captured_sample_count: 500,
            truncated: false,
        }
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn persist(&mut self, bundle: &CaptureBundle) -> Result<EventRecord, PersistenceError> {
            Err(PersistenceError::Io {
                path: PathBuf::from("/full"),
                source: std::io::Error::other(format!("disk full at {}", bundle.event.event_id)),
            })
        }
    }

    #[test]
    fn test_dir_name() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 2).unwrap();
        assert_eq!(event_dir_name(at, 7), "2024-05-01T12-00-02Z_000007");
    }

    #[test]
    fn test_summarize() {
        let bundle = CaptureBundle {
            event: event(1),
            preroll: blocks(0, 3, 100, 0.0),
            live: blocks(3, 5, 100, 0.5),
            sample_rate: SR,
            preroll_target_frames: 400,
        };
        let record = EventRecord::summarize(&bundle);
        assert_eq!(record.sample_count, 800);
        assert!((record.preroll_secs - 0.3).abs() < 1e-12);
        assert!((record.capture_duration_secs - 0.5).abs() < 1e-12);
        assert!((record.total_duration_secs - 0.8).abs() < 1e-12);
        assert!((record.start_stream_secs - 2.0).abs() < 1e-12);
        assert!((record.end_stream_secs - 2.5).abs() < 1e-12);
        assert!(!record.preroll_complete);
        assert!(record.files.is_none());
    }

    #[test]
    fn test_finalize_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DiskEventWriter::new(dir.path(), SR, 300, Calibrator::identity());
        let record = writer
            .finalize(event(3), blocks(0, 3, 100, 0.0), blocks(3, 5, 100, 0.5))
            .unwrap();

        let files = record.files.clone().unwrap();
        assert_eq!(
            files.dir,
            dir.path().join("2024-05-01T12-00-02Z_000003")
        );
        assert!(record.preroll_complete);

        let mut reader = hound::WavReader::open(&files.audio).unwrap();
        assert_eq!(reader.spec().sample_rate, SR);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 800);
        assert!(samples[..300].iter().all(|&s| s == 0.0));
        assert!(samples[300..].iter().all(|&s| s == 0.5));

        let metadata: EventRecord =
            serde_json::from_str(&std::fs::read_to_string(&files.metadata).unwrap()).unwrap();
        assert_eq!(metadata, record);
        assert_eq!(metadata.peak_fast, 91.5);

        let csv = std::fs::read_to_string(&files.bands_csv).unwrap();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("ts,LZ_40,LZ_50"));
        assert!(header.ends_with("LA_250,LA_315"));
        assert_eq!(lines.count(), 5);
    }

    #[test]
    fn test_finalize_without_preroll() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DiskEventWriter::new(dir.path(), SR, 300, Calibrator::identity());
        let record = writer
            .finalize(event(1), Vec::new(), blocks(0, 2, 100, 0.1))
            .unwrap();
        assert!(!record.preroll_complete);
        assert_eq!(record.preroll_secs, 0.0);
        assert_eq!(record.sample_count, 200);
    }

    #[test]
    fn test_failed_event_leaves_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let event_dir = dir.path().join("2024-05-01T12-00-02Z_000004");
        // A directory where bands.csv should go makes the second file fail
        std::fs::create_dir_all(event_dir.join("bands.csv")).unwrap();

        let mut writer = DiskEventWriter::new(dir.path(), SR, 0, Calibrator::identity());
        let err = writer
            .finalize(event(4), Vec::new(), blocks(0, 2, 100, 0.1))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
        assert!(!event_dir.exists());

        // Later events still persist
        let record = writer
            .finalize(event(5), Vec::new(), blocks(0, 2, 100, 0.1))
            .unwrap();
        assert!(record.files.unwrap().metadata.exists());
    }

    #[test]
    fn test_unwritable_dir_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("events");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut writer = DiskEventWriter::new(&blocker, SR, 0, Calibrator::identity());
        let err = writer
            .finalize(event(1), Vec::new(), blocks(0, 1, 100, 0.1))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::CreateDir { .. }));
    }

    #[test]
    fn test_writer_thread_publishes_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let bus = BroadcastBus::new(16);
        let mut rx = bus.subscribe();
        let counters = Arc::new(EngineCounters::default());
        let (publisher, publisher_handle) =
            spawn_publisher(Arc::new(bus.clone()), 16, Arc::clone(&counters)).unwrap();

        let sink = DiskEventWriter::new(dir.path(), SR, 0, Calibrator::identity());
        let mut handle = WriterHandle::spawn(
            Box::new(sink),
            4,
            publisher.clone(),
            "t/event".into(),
            Arc::clone(&counters),
        )
        .unwrap();
        handle
            .submit(CaptureBundle {
                event: event(1),
                preroll: Vec::new(),
                live: blocks(0, 2, 100, 0.2),
                sample_rate: SR,
                preroll_target_frames: 0,
            })
            .unwrap();
        handle.stop();
        drop(publisher);
        publisher_handle.join();

        assert_eq!(counters.snapshot().events_persisted, 1);
        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic, "t/event");
        let record: EventRecord = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(record.event_id, 1);

        let err = handle
            .submit(CaptureBundle {
                event: event(2),
                preroll: Vec::new(),
                live: Vec::new(),
                sample_rate: SR,
                preroll_target_frames: 0,
            })
            .unwrap_err();
        assert!(matches!(err, PersistenceError::WriterStopped { event_id: 2 }));
    }

    #[test]
    fn test_writer_thread_counts_failures() {
        let counters = Arc::new(EngineCounters::default());
        let (publisher, publisher_handle) =
            spawn_publisher(Arc::new(crate::bus::LogBus), 4, Arc::clone(&counters)).unwrap();
        let mut handle =
            WriterHandle::spawn(Box::new(FailingSink), 4, publisher, "t/event".into(), Arc::clone(&counters))
                .unwrap();
        for id in 1..=2 {
            handle
                .submit(CaptureBundle {
                    event: event(id),
                    preroll: Vec::new(),
                    live: Vec::new(),
                    sample_rate: SR,
                    preroll_target_frames: 0,
                })
                .unwrap();
        }
        handle.stop();
        publisher_handle.join();
        let snap = counters.snapshot();
        assert_eq!(snap.persistence_failures, 2);
        assert_eq!(snap.events_persisted, 0);
    }
}
