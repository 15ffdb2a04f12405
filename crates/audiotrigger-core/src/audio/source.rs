//! Audio sources and the bounded block queue
//!
//! An [`AudioSource`] delivers raw mono [`AudioBlock`]s into a
//! [`BlockProducer`]. The queue between source and ingestion is bounded:
//! when it is full the oldest queued block is evicted and counted, so a live
//! capture callback never blocks. The offline WAV replay source is not
//! real-time and may instead wait for room ([`BlockProducer::push_blocking`]).
//!
//! Sources:
//! - [`WavFileSource`] replays a WAV file (always available)
//! - `CpalSource` captures from an input device (`capture` feature)

use crate::audio::block::{AudioBlock, BlockAssembler};
use crate::error::CaptureSourceError;
use crate::status::EngineCounters;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Shared slot where a source reports a fatal stream failure
type FaultSlot = Arc<Mutex<Option<String>>>;

/// Create the bounded queue between an audio source and ingestion
pub fn block_queue(capacity: usize, counters: Arc<EngineCounters>) -> (BlockProducer, BlockConsumer) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let fault: FaultSlot = Arc::new(Mutex::new(None));
    let producer = BlockProducer {
        tx,
        evict: rx.clone(),
        counters,
        fault: Arc::clone(&fault),
    };
    (producer, BlockConsumer { rx, fault })
}

/// Sending half of the block queue (owned by the audio source)
#[derive(Clone)]
pub struct BlockProducer {
    tx: Sender<AudioBlock>,
    evict: Receiver<AudioBlock>,
    counters: Arc<EngineCounters>,
    fault: FaultSlot,
}

impl BlockProducer {
    /// Enqueue a block without blocking, evicting the oldest queued block
    /// when the queue is full
    ///
    /// Returns `false` once the consumer is gone.
    pub fn push(&self, block: AudioBlock) -> bool {
        let mut block = block;
        loop {
            match self.tx.try_send(block) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(rejected)) => {
                    block = rejected;
                    if self.evict.try_recv().is_ok() {
                        self.counters.dropped_blocks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Enqueue a block, waiting for room until `stop` is raised
    ///
    /// Only for sources that are not real-time. Returns `false` when the
    /// consumer is gone or `stop` was raised.
    pub fn push_blocking(&self, block: AudioBlock, stop: &AtomicBool) -> bool {
        let mut block = block;
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            match self.tx.send_timeout(block, Duration::from_millis(50)) {
                Ok(()) => return true,
                Err(SendTimeoutError::Disconnected(_)) => return false,
                Err(SendTimeoutError::Timeout(rejected)) => block = rejected,
            }
        }
    }

    /// Report a fatal stream failure to the ingestion loop
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "Audio source failed");
        if let Ok(mut slot) = self.fault.lock() {
            slot.get_or_insert(reason);
        }
    }
}

/// Receiving half of the block queue (owned by the ingestion loop)
pub struct BlockConsumer {
    rx: Receiver<AudioBlock>,
    fault: FaultSlot,
}

impl BlockConsumer {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<AudioBlock, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<AudioBlock> {
        self.rx.try_recv().ok()
    }

    /// Blocks currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Fatal failure reported by the source, if any
    pub fn take_fault(&self) -> Option<CaptureSourceError> {
        self.fault
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .map(CaptureSourceError::StreamError)
    }
}

/// A producer of raw audio blocks
///
/// `open` resolves the device (or file) and returns the actual sample rate;
/// `start` begins delivering blocks of `block_len` samples; `stop` ends
/// delivery and releases the device. Dropping the producer (end of a replay)
/// ends the stream.
pub trait AudioSource {
    fn open(&mut self) -> Result<u32, CaptureSourceError>;

    fn start(&mut self, block_len: usize, producer: BlockProducer) -> Result<(), CaptureSourceError>;

    fn stop(&mut self);

    /// Human-readable description for logs and status
    fn describe(&self) -> String;
}

/// Replays a WAV file as if it were a live input
///
/// Multi-channel files use their first channel. Integer samples are scaled
/// to `[-1, 1)`.
pub struct WavFileSource {
    path: PathBuf,
    realtime: bool,
    spec: Option<hound::WavSpec>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WavFileSource {
    /// # Arguments
    /// * `path` - WAV file to replay
    /// * `realtime` - Pace delivery at the file's sample rate instead of as
    ///   fast as ingestion allows
    pub fn new(path: impl Into<PathBuf>, realtime: bool) -> Self {
        Self {
            path: path.into(),
            realtime,
            spec: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_error(&self, reason: impl ToString) -> CaptureSourceError {
        CaptureSourceError::File {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn replay_loop(
        path: PathBuf,
        block_len: usize,
        realtime: bool,
        producer: BlockProducer,
        stop: Arc<AtomicBool>,
    ) {
        let reader = match hound::WavReader::open(&path) {
            Ok(reader) => reader,
            Err(e) => {
                producer.fail(format!("{}: {}", path.display(), e));
                return;
            }
        };
        let spec = reader.spec();
        let channels = spec.channels as usize;
        let block_duration = Duration::from_secs_f64(block_len as f64 / spec.sample_rate as f64);
        let mut assembler = BlockAssembler::new(block_len);
        let chunk_len = block_len * channels;
        let mut chunk: Vec<f32> = Vec::with_capacity(chunk_len);
        let mut delivered = 0u64;

        let mut deliver = |block: AudioBlock| -> bool {
            delivered += 1;
            if realtime {
                std::thread::sleep(block_duration);
                producer.push(block)
            } else {
                producer.push_blocking(block, &stop)
            }
        };

        let samples: Box<dyn Iterator<Item = Result<f32, hound::Error>>> = match spec.sample_format {
            hound::SampleFormat::Float => Box::new(reader.into_samples::<f32>()),
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                Box::new(
                    reader
                        .into_samples::<i32>()
                        .map(move |s| s.map(|v| v as f32 * scale)),
                )
            }
        };

        let mut running = true;
        for sample in samples {
            match sample {
                Ok(value) => chunk.push(value),
                Err(e) => {
                    producer.fail(format!("{}: {}", path.display(), e));
                    return;
                }
            }
            if chunk.len() == chunk_len {
                let mut ready = Vec::new();
                assembler.push_interleaved(&chunk, channels, |b| ready.push(b));
                chunk.clear();
                for block in ready {
                    if !deliver(block) {
                        running = false;
                        break;
                    }
                }
                if !running || stop.load(Ordering::Acquire) {
                    break;
                }
            }
        }

        if running && !stop.load(Ordering::Acquire) {
            let mut ready = Vec::new();
            assembler.push_interleaved(&chunk, channels, |b| ready.push(b));
            ready.extend(assembler.flush());
            for block in ready {
                if !deliver(block) {
                    break;
                }
            }
        }
        tracing::info!(path = %path.display(), blocks = delivered, "WAV replay finished");
    }
}

impl AudioSource for WavFileSource {
    fn open(&mut self) -> Result<u32, CaptureSourceError> {
        let reader = hound::WavReader::open(&self.path).map_err(|e| self.file_error(e))?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(self.file_error("file has no channels"));
        }
        tracing::info!(
            path = %self.path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            duration_secs = reader.duration() as f64 / spec.sample_rate as f64,
            "Opened WAV replay source"
        );
        self.spec = Some(spec);
        Ok(spec.sample_rate)
    }

    fn start(&mut self, block_len: usize, producer: BlockProducer) -> Result<(), CaptureSourceError> {
        if self.thread.is_some() {
            return Err(CaptureSourceError::AlreadyStarted);
        }
        if self.spec.is_none() {
            self.open()?;
        }
        self.stop_flag.store(false, Ordering::Release);
        let path = self.path.clone();
        let realtime = self.realtime;
        let stop = Arc::clone(&self.stop_flag);
        let thread = std::thread::Builder::new()
            .name("wav-replay".into())
            .spawn(move || Self::replay_loop(path, block_len, realtime, producer, stop))
            .map_err(|e| self.file_error(format!("failed to spawn replay thread: {}", e)))?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn describe(&self) -> String {
        format!("wav:{}", self.path.display())
    }
}

impl Drop for WavFileSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "capture")]
pub use live::CpalSource;

#[cfg(feature = "capture")]
mod live {
    use super::{AudioSource, BlockProducer};
    use crate::audio::block::BlockAssembler;
    use crate::error::CaptureSourceError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};

    /// Live capture from a `cpal` input device
    pub struct CpalSource {
        device_name: String,
        requested_rate: u32,
        device: Option<Device>,
        config: Option<StreamConfig>,
        format: SampleFormat,
        stream: Option<Stream>,
    }

    impl CpalSource {
        /// # Arguments
        /// * `device_name` - Input device name (empty = host default)
        /// * `sample_rate` - Requested sample rate; the device default is used
        ///   when the device does not support it
        pub fn new(device_name: &str, sample_rate: u32) -> Self {
            Self {
                device_name: device_name.to_string(),
                requested_rate: sample_rate,
                device: None,
                config: None,
                format: SampleFormat::F32,
                stream: None,
            }
        }

        /// Names of all input devices on the default host
        pub fn list_devices() -> Result<Vec<String>, CaptureSourceError> {
            let host = cpal::default_host();
            let devices = host
                .input_devices()
                .map_err(|e| CaptureSourceError::StreamError(e.to_string()))?;
            Ok(devices.filter_map(|d| d.name().ok()).collect())
        }

        fn supports_rate(device: &Device, rate: u32) -> bool {
            device
                .supported_input_configs()
                .map(|mut configs| {
                    configs.any(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
                })
                .unwrap_or(false)
        }
    }

    impl AudioSource for CpalSource {
        fn open(&mut self) -> Result<u32, CaptureSourceError> {
            let host = cpal::default_host();
            let device = if self.device_name.is_empty() {
                host.default_input_device()
                    .ok_or(CaptureSourceError::NoDefaultDevice)?
            } else {
                host.input_devices()
                    .map_err(|e| CaptureSourceError::StreamError(e.to_string()))?
                    .find(|d| d.name().map(|n| n == self.device_name).unwrap_or(false))
                    .ok_or_else(|| CaptureSourceError::DeviceNotFound(self.device_name.clone()))?
            };

            let default = device
                .default_input_config()
                .map_err(|e| CaptureSourceError::StreamError(e.to_string()))?;
            let rate = if Self::supports_rate(&device, self.requested_rate) {
                self.requested_rate
            } else {
                tracing::warn!(
                    requested = self.requested_rate,
                    fallback = default.sample_rate().0,
                    "Requested sample rate not supported, using device default"
                );
                default.sample_rate().0
            };

            let name = device.name().unwrap_or_else(|_| "(unknown)".into());
            tracing::info!(
                device = %name,
                sample_rate = rate,
                channels = default.channels(),
                format = ?default.sample_format(),
                "Opened input device"
            );

            self.format = default.sample_format();
            self.config = Some(StreamConfig {
                channels: default.channels(),
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
            self.device = Some(device);
            Ok(rate)
        }

        fn start(
            &mut self,
            block_len: usize,
            producer: BlockProducer,
        ) -> Result<(), CaptureSourceError> {
            if self.stream.is_some() {
                return Err(CaptureSourceError::AlreadyStarted);
            }
            if self.device.is_none() {
                self.open()?;
            }
            let (Some(device), Some(config)) = (self.device.as_ref(), self.config.clone()) else {
                return Err(CaptureSourceError::NoDefaultDevice);
            };
            let channels = config.channels as usize;
            let error_producer = producer.clone();
            let err_fn = move |e: cpal::StreamError| error_producer.fail(e.to_string());

            let stream = match self.format {
                SampleFormat::I16 => {
                    let mut assembler = BlockAssembler::new(block_len);
                    let mut converted = Vec::new();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            converted.clear();
                            converted.extend(data.iter().map(|&s| s as f32 / 32768.0));
                            assembler.push_interleaved(&converted, channels, |b| {
                                producer.push(b);
                            });
                        },
                        err_fn,
                        None,
                    )
                }
                _ => {
                    let mut assembler = BlockAssembler::new(block_len);
                    device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            assembler.push_interleaved(data, channels, |b| {
                                producer.push(b);
                            });
                        },
                        err_fn,
                        None,
                    )
                }
            }
            .map_err(|e| CaptureSourceError::StreamError(e.to_string()))?;

            stream
                .play()
                .map_err(|e| CaptureSourceError::StreamError(e.to_string()))?;
            self.stream = Some(stream);
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.pause();
                tracing::info!("Input stream stopped");
            }
        }

        fn describe(&self) -> String {
            if self.device_name.is_empty() {
                "cpal:(default)".to_string()
            } else {
                format!("cpal:{}", self.device_name)
            }
        }
    }
}

/// Placeholder used when live capture is not compiled in
#[cfg(not(feature = "capture"))]
pub struct CpalSource {
    device_name: String,
}

#[cfg(not(feature = "capture"))]
impl CpalSource {
    pub fn new(device_name: &str, _sample_rate: u32) -> Self {
        Self {
            device_name: device_name.to_string(),
        }
    }

    pub fn list_devices() -> Result<Vec<String>, CaptureSourceError> {
        Err(CaptureSourceError::Unsupported)
    }
}

#[cfg(not(feature = "capture"))]
impl AudioSource for CpalSource {
    fn open(&mut self) -> Result<u32, CaptureSourceError> {
        Err(CaptureSourceError::Unsupported)
    }

    fn start(&mut self, _block_len: usize, _producer: BlockProducer) -> Result<(), CaptureSourceError> {
        Err(CaptureSourceError::Unsupported)
    }

    fn stop(&mut self) {}

    fn describe(&self) -> String {
        format!("cpal:{} (unavailable)", self.device_name)
    }
}
