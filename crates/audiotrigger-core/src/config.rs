//! Engine configuration
//!
//! Loaded once at startup from a JSON file (every field optional, with the
//! defaults below) and/or command-line flags, then validated. Immutable for
//! the lifetime of the process.

use crate::audio::spectrum::Weighting;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_topic_base() -> String {
    "audiotrigger".to_string()
}

fn default_threshold() -> f64 {
    50.0
}

fn default_hold_sec() -> f64 {
    2.0
}

fn default_pre_trigger() -> f64 {
    20.0
}

fn default_post_trigger() -> f64 {
    30.0
}

fn default_max_event_sec() -> f64 {
    600.0
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_event_dir() -> PathBuf {
    PathBuf::from("/media/audiotrigger/events")
}

fn default_cal_file() -> PathBuf {
    PathBuf::from("/data/calibration.json")
}

fn default_ui_port() -> u16 {
    8099
}

fn default_fast_window_ms() -> f64 {
    80.0
}

fn default_slow_window_ms() -> f64 {
    160.0
}

fn default_status_interval() -> f64 {
    1.0
}

fn default_queue_blocks() -> usize {
    64
}

fn default_bus_host() -> String {
    "core-mosquitto".to_string()
}

fn default_bus_port() -> u16 {
    1883
}

fn default_true() -> bool {
    true
}

fn default_spectrum_interval() -> f64 {
    1.0
}

fn default_fft_size() -> usize {
    16384
}

/// Connection settings handed to the external message-bus client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_host")]
    pub host: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Periodic spectrum publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub weighting: Weighting,
    /// Publish interval in seconds
    #[serde(default = "default_spectrum_interval")]
    pub interval: f64,
    /// FFT length in samples (power of two)
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weighting: Weighting::default(),
            interval: default_spectrum_interval(),
            fft_size: default_fft_size(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub bus: BusConfig,
    /// Prefix for every published topic
    #[serde(default = "default_topic_base")]
    pub topic_base: String,
    /// Fast-window trigger threshold (dB)
    #[serde(default = "default_threshold")]
    pub thresh_a80: f64,
    /// Slow-window trigger threshold (dB)
    #[serde(default = "default_threshold")]
    pub thresh_a160: f64,
    /// Hold-off after an event ends, in seconds
    #[serde(default = "default_hold_sec")]
    pub hold_sec: f64,
    /// Pre-roll retained before the trigger, in seconds
    #[serde(default = "default_pre_trigger")]
    pub pre_trigger: f64,
    /// Capture continues this long after the last exceedance, in seconds
    #[serde(default = "default_post_trigger")]
    pub post_trigger: f64,
    /// Sustained exceedance required before an event opens (0 = immediate)
    #[serde(default)]
    pub confirm_sec: f64,
    /// Longest single event in seconds; a capture reaching it is closed as truncated
    #[serde(default = "default_max_event_sec")]
    pub max_event_sec: f64,
    /// Requested sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub samplerate: u32,
    /// Input device name (empty = default device)
    #[serde(default)]
    pub device: String,
    #[serde(default = "default_event_dir")]
    pub event_dir: PathBuf,
    #[serde(default = "default_cal_file")]
    pub cal_file: PathBuf,
    #[serde(default)]
    pub spectrum: SpectrumConfig,
    /// Status HTTP port (0 disables the server)
    #[serde(default = "default_ui_port")]
    pub ui_port: u16,
    /// Block length in seconds; derived from the spectrum interval when unset
    #[serde(default)]
    pub block_sec: Option<f64>,
    #[serde(default = "default_fast_window_ms")]
    pub fast_window_ms: f64,
    #[serde(default = "default_slow_window_ms")]
    pub slow_window_ms: f64,
    /// Status publish interval in seconds
    #[serde(default = "default_status_interval")]
    pub status_interval: f64,
    /// Bounded queue between the audio source and ingestion, in blocks
    #[serde(default = "default_queue_blocks")]
    pub queue_blocks: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            topic_base: default_topic_base(),
            thresh_a80: default_threshold(),
            thresh_a160: default_threshold(),
            hold_sec: default_hold_sec(),
            pre_trigger: default_pre_trigger(),
            post_trigger: default_post_trigger(),
            confirm_sec: 0.0,
            max_event_sec: default_max_event_sec(),
            samplerate: default_sample_rate(),
            device: String::new(),
            event_dir: default_event_dir(),
            cal_file: default_cal_file(),
            spectrum: SpectrumConfig::default(),
            ui_port: default_ui_port(),
            block_sec: None,
            fast_window_ms: default_fast_window_ms(),
            slow_window_ms: default_slow_window_ms(),
            status_interval: default_status_interval(),
            queue_blocks: default_queue_blocks(),
        }
    }
}

impl TriggerConfig {
    /// Load config from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "Loaded config from disk");
        Ok(config)
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Check every value the engine depends on
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("thresh_a80", self.thresh_a80), ("thresh_a160", self.thresh_a160)] {
            if !value.is_finite() {
                return Err(ConfigError::invalid(field, "must be a finite number"));
            }
        }

        for (field, value) in [
            ("hold_sec", self.hold_sec),
            ("pre_trigger", self.pre_trigger),
            ("post_trigger", self.post_trigger),
            ("confirm_sec", self.confirm_sec),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(field, "must be zero or a positive number of seconds"));
            }
        }

        if !self.max_event_sec.is_finite() || self.max_event_sec <= 0.0 {
            return Err(ConfigError::invalid("max_event_sec", "must be a positive number of seconds"));
        }

        if !(8000..=384000).contains(&self.samplerate) {
            return Err(ConfigError::invalid(
                "samplerate",
                format!("{} Hz is outside 8000..=384000", self.samplerate),
            ));
        }

        if let Some(block_sec) = self.block_sec {
            if !block_sec.is_finite() || block_sec <= 0.0 || block_sec > 10.0 {
                return Err(ConfigError::invalid("block_sec", "must be in (0, 10] seconds"));
            }
        }

        if !(self.fast_window_ms > 0.0 && self.slow_window_ms.is_finite()) {
            return Err(ConfigError::invalid("fast_window_ms", "must be positive"));
        }
        if self.fast_window_ms >= self.slow_window_ms {
            return Err(ConfigError::invalid(
                "fast_window_ms",
                format!(
                    "fast window ({} ms) must be shorter than slow window ({} ms)",
                    self.fast_window_ms, self.slow_window_ms
                ),
            ));
        }

        if !self.spectrum.interval.is_finite() || self.spectrum.interval <= 0.0 {
            return Err(ConfigError::invalid("spectrum.interval", "must be positive"));
        }
        if !self.spectrum.fft_size.is_power_of_two() || self.spectrum.fft_size < 256 {
            return Err(ConfigError::invalid(
                "spectrum.fft_size",
                "must be a power of two of at least 256",
            ));
        }

        if !self.status_interval.is_finite() || self.status_interval <= 0.0 {
            return Err(ConfigError::invalid("status_interval", "must be positive"));
        }
        if self.queue_blocks == 0 {
            return Err(ConfigError::invalid("queue_blocks", "must be at least 1"));
        }
        if self.topic_base.trim().is_empty() {
            return Err(ConfigError::invalid("topic_base", "must not be empty"));
        }
        if self.event_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("event_dir", "must not be empty"));
        }

        Ok(())
    }

    /// Effective block length in seconds
    ///
    /// Unless set explicitly, blocks follow the spectrum interval, kept
    /// between 100 ms and 250 ms.
    pub fn block_sec(&self) -> f64 {
        self.block_sec
            .unwrap_or_else(|| self.spectrum.interval.clamp(0.10, 0.25))
    }

    /// Block length in samples at the given rate
    pub fn block_len(&self, sample_rate: u32) -> usize {
        ((self.block_sec() * sample_rate as f64).round() as usize).max(1)
    }

    /// Convert a duration in seconds to a frame count at the given rate
    pub fn frames(seconds: f64, sample_rate: u32) -> u64 {
        (seconds * sample_rate as f64).round() as u64
    }

    /// Ring buffer capacity in blocks: `ceil(pre_trigger * rate / block_len)`
    pub fn preroll_blocks(&self, sample_rate: u32) -> usize {
        let pre_frames = Self::frames(self.pre_trigger, sample_rate);
        let block_len = self.block_len(sample_rate) as u64;
        (pre_frames.div_ceil(block_len) as usize).max(1)
    }

    /// Copy safe to expose over the status API
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.bus.password.is_empty() {
            copy.bus.password = "***".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TriggerConfig::default();
        assert_eq!(config.samplerate, 48000);
        assert_eq!(config.thresh_a80, 50.0);
        assert_eq!(config.hold_sec, 2.0);
        assert_eq!(config.ui_port, 8099);
        assert!(config.spectrum.enabled);
        assert_eq!(config.spectrum.weighting, Weighting::Z);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: TriggerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TriggerConfig::default());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{"thresh_a80": 80.0, "spectrum": {"weighting": "A"}, "bus": {"port": 1884}}"#;
        let config: TriggerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.thresh_a80, 80.0);
        assert_eq!(config.thresh_a160, 50.0);
        assert_eq!(config.spectrum.weighting, Weighting::A);
        assert_eq!(config.spectrum.interval, 1.0);
        assert_eq!(config.bus.port, 1884);
        assert_eq!(config.bus.host, "core-mosquitto");
    }

    #[test]
    fn test_block_sec_follows_spectrum_interval() {
        let mut config = TriggerConfig::default();
        config.spectrum.interval = 1.0;
        assert_eq!(config.block_sec(), 0.25);
        config.spectrum.interval = 0.05;
        assert_eq!(config.block_sec(), 0.10);
        config.block_sec = Some(0.1);
        config.spectrum.interval = 1.0;
        assert_eq!(config.block_sec(), 0.1);
        assert_eq!(config.block_len(44100), 4410);
    }

    #[test]
    fn test_preroll_blocks() {
        let config = TriggerConfig {
            pre_trigger: 2.0,
            block_sec: Some(0.1),
            ..Default::default()
        };
        assert_eq!(config.preroll_blocks(44100), 20);

        let config = TriggerConfig {
            pre_trigger: 0.25,
            block_sec: Some(0.1),
            ..Default::default()
        };
        assert_eq!(config.preroll_blocks(48000), 3);

        let config = TriggerConfig {
            pre_trigger: 0.0,
            ..Default::default()
        };
        assert_eq!(config.preroll_blocks(48000), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            TriggerConfig {
                thresh_a80: f64::NAN,
                ..Default::default()
            },
            TriggerConfig {
                post_trigger: -1.0,
                ..Default::default()
            },
            TriggerConfig {
                samplerate: 1000,
                ..Default::default()
            },
            TriggerConfig {
                fast_window_ms: 200.0,
                ..Default::default()
            },
            TriggerConfig {
                queue_blocks: 0,
                ..Default::default()
            },
            TriggerConfig {
                max_event_sec: 0.0,
                ..Default::default()
            },
            TriggerConfig {
                topic_base: " ".into(),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }

        let mut config = TriggerConfig::default();
        config.spectrum.fft_size = 1000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "spectrum.fft_size",
                ..
            })
        ));
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut config = TriggerConfig::default();
        config.bus.password = "secret".into();
        assert_eq!(config.redacted().bus.password, "***");
        assert_eq!(TriggerConfig::default().redacted().bus.password, "");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = TriggerConfig {
            thresh_a80: 72.5,
            device: "hw:1".into(),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = TriggerConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = TriggerConfig::load(Path::new("/nonexistent/audiotrigger.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
