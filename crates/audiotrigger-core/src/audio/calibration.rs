//! Per-installation calibration
//!
//! A calibration profile maps raw device samples to sound pressure in
//! pascals: `corrected = raw * gain + offset`. Profiles are loaded once at
//! startup from a JSON file, either a single profile or a map of profiles
//! keyed by input device name:
//!
//! ```json
//! { "gain": 1.0, "offset": 0.0, "offset_db": 3.5, "band_corr_db": { "80": 0.4 } }
//! { "devices": { "hw:1": { "offset_db": 3.5 }, "default": { "gain": 1.0 } } }
//! ```
//!
//! `offset_db` is a level correction folded into the gain. `band_corr_db`
//! holds per-third-octave-band corrections applied by spectrum analysis.

use crate::audio::block::AudioBlock;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Device key used when no explicit device is configured
pub const DEFAULT_PROFILE_KEY: &str = "default";

fn default_gain() -> f64 {
    1.0
}

/// Stored calibration for one input device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationProfile {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub offset_db: f64,
    /// Band centre frequency (Hz, as text) to correction in dB
    #[serde(default)]
    pub band_corr_db: BTreeMap<String, f64>,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            device_id: None,
            gain: default_gain(),
            offset: 0.0,
            offset_db: 0.0,
            band_corr_db: BTreeMap::new(),
        }
    }
}

impl CalibrationProfile {
    /// Gain including the `offset_db` level correction
    pub fn effective_gain(&self) -> f64 {
        self.gain * 10f64.powf(self.offset_db / 20.0)
    }

    fn check(&self) -> Result<Vec<(f64, f64)>, String> {
        if !self.gain.is_finite() || self.gain <= 0.0 {
            return Err(format!("gain must be a positive number, got {}", self.gain));
        }
        if !self.offset.is_finite() {
            return Err("offset must be finite".to_string());
        }
        if !self.offset_db.is_finite() {
            return Err("offset_db must be finite".to_string());
        }
        let mut bands = Vec::with_capacity(self.band_corr_db.len());
        for (key, &corr) in &self.band_corr_db {
            let fc: f64 = key
                .trim()
                .parse()
                .map_err(|_| format!("band key {:?} is not a frequency", key))?;
            if !fc.is_finite() || fc <= 0.0 || !corr.is_finite() {
                return Err(format!("band correction {:?} = {} is invalid", key, corr));
            }
            bands.push((fc, corr));
        }
        Ok(bands)
    }
}

/// Pure sample correction derived from a [`CalibrationProfile`]
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrator {
    gain: f32,
    offset: f32,
    band_corr: Vec<(f64, f64)>,
    identity: bool,
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::identity()
    }
}

impl Calibrator {
    /// Pass-through calibrator (gain 1, offset 0, no band corrections)
    pub fn identity() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
            band_corr: Vec::new(),
            identity: true,
        }
    }

    /// Build from a profile, rejecting non-finite values
    pub fn from_profile(profile: &CalibrationProfile) -> Result<Self, String> {
        let band_corr = profile.check()?;
        let gain = profile.effective_gain();
        Ok(Self {
            gain: gain as f32,
            offset: profile.offset as f32,
            identity: gain == 1.0 && profile.offset == 0.0 && band_corr.is_empty(),
            band_corr,
        })
    }

    /// Load the calibration for `device` from a JSON file
    ///
    /// A missing file yields the identity calibration (with a warning). A file
    /// that exists but cannot be read or parsed is a fatal [`ConfigError`].
    pub fn load(path: &Path, device: &str) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "No calibration file found, using identity calibration (0 dB)"
            );
            return Ok(Self::identity());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let invalid = |reason: String| ConfigError::Calibration {
            path: path.to_path_buf(),
            reason,
        };

        let profile = match value.get("devices") {
            Some(devices) => {
                let mut profiles: BTreeMap<String, CalibrationProfile> =
                    serde_json::from_value(devices.clone())
                        .map_err(|e| invalid(format!("devices: {}", e)))?;
                // Validate every entry so a typo in an unused profile still fails fast
                for (id, profile) in &profiles {
                    profile.check().map_err(|r| invalid(format!("{}: {}", id, r)))?;
                }
                let key = if device.is_empty() {
                    DEFAULT_PROFILE_KEY
                } else {
                    device
                };
                match profiles
                    .remove(key)
                    .or_else(|| profiles.remove(DEFAULT_PROFILE_KEY))
                {
                    Some(profile) => profile,
                    None => {
                        tracing::warn!(
                            path = %path.display(),
                            device = key,
                            "No calibration profile for device, using identity calibration"
                        );
                        return Ok(Self::identity());
                    }
                }
            }
            None => {
                let profile: CalibrationProfile =
                    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
                if let Some(id) = profile.device_id.as_deref() {
                    if !device.is_empty() && id != device {
                        tracing::warn!(
                            profile_device = id,
                            device,
                            "Calibration profile was recorded for a different device"
                        );
                    }
                }
                profile
            }
        };

        let calibrator = Self::from_profile(&profile).map_err(invalid)?;
        tracing::info!(
            path = %path.display(),
            gain = calibrator.gain,
            offset = calibrator.offset,
            offset_db = profile.offset_db,
            bands = calibrator.band_corr.len(),
            "Calibration loaded"
        );
        Ok(calibrator)
    }

    /// Correct a single sample
    #[inline]
    pub fn apply(&self, sample: f32) -> f32 {
        sample * self.gain + self.offset
    }

    /// Correct a whole block (pure; same input always yields the same output)
    pub fn calibrate(&self, raw: &AudioBlock) -> AudioBlock {
        if self.identity {
            return raw.clone();
        }
        raw.with_samples(raw.samples().iter().map(|&s| self.apply(s)).collect())
    }

    /// Correction in dB for the third-octave band centred at `fc`
    pub fn band_correction_db(&self, fc: f64) -> f64 {
        self.band_corr
            .iter()
            .find(|(band, _)| ((band - fc) / fc).abs() < 0.02)
            .map(|&(_, corr)| corr)
            .unwrap_or(0.0)
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn write(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("calibration.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_identity() {
        let cal = Calibrator::identity();
        let block = AudioBlock::new(0, Utc::now(), vec![0.5, -0.25]);
        assert_eq!(cal.calibrate(&block), block);
        assert!(cal.is_identity());
        assert_eq!(cal.band_correction_db(80.0), 0.0);
    }

    #[test]
    fn test_gain_and_offset() {
        let profile = CalibrationProfile {
            gain: 2.0,
            offset: 0.1,
            ..Default::default()
        };
        let cal = Calibrator::from_profile(&profile).unwrap();
        let block = AudioBlock::new(3, Utc::now(), vec![0.5, -0.25, 0.0]);
        let corrected = cal.calibrate(&block);
        assert_eq!(corrected.seq(), 3);
        approx::assert_relative_eq!(corrected.samples()[0], 1.1, epsilon = 1e-6);
        approx::assert_relative_eq!(corrected.samples()[1], -0.4, epsilon = 1e-6);
        approx::assert_relative_eq!(corrected.samples()[2], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_calibrate_is_pure() {
        let profile = CalibrationProfile {
            gain: 1.7,
            offset: -0.01,
            offset_db: 1.5,
            ..Default::default()
        };
        let cal = Calibrator::from_profile(&profile).unwrap();
        let block = AudioBlock::new(1, Utc::now(), (0..256).map(|i| (i as f32 * 0.1).sin()).collect());
        let first = cal.calibrate(&block);
        for _ in 0..10 {
            assert_eq!(cal.calibrate(&block), first);
        }
    }

    #[test]
    fn test_offset_db_folds_into_gain() {
        let profile = CalibrationProfile {
            offset_db: 20.0,
            ..Default::default()
        };
        approx::assert_relative_eq!(profile.effective_gain(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_load_missing_file_is_identity() {
        let cal = Calibrator::load(Path::new("/nonexistent/calibration.json"), "").unwrap();
        assert!(cal.is_identity());
    }

    #[test]
    fn test_load_single_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{"offset_db": 6.0, "band_corr_db": {"80": 1.5, "31.5": -0.5}}"#,
        );
        let cal = Calibrator::load(&path, "").unwrap();
        approx::assert_relative_eq!(cal.gain(), 1.9953, epsilon = 1e-3);
        assert_eq!(cal.band_correction_db(80.0), 1.5);
        assert_eq!(cal.band_correction_db(31.5), -0.5);
        assert_eq!(cal.band_correction_db(160.0), 0.0);
    }

    #[test]
    fn test_load_device_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{"devices": {"hw:1": {"gain": 4.0}, "default": {"gain": 2.0}}}"#,
        );
        assert_eq!(Calibrator::load(&path, "hw:1").unwrap().gain(), 4.0);
        assert_eq!(Calibrator::load(&path, "hw:2").unwrap().gain(), 2.0);
        assert_eq!(Calibrator::load(&path, "").unwrap().gain(), 2.0);
    }

    #[test]
    fn test_load_device_map_without_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"{"devices": {"hw:1": {"gain": 4.0}}}"#);
        assert!(Calibrator::load(&path, "hw:2").unwrap().is_identity());
    }

    #[test]
    fn test_malformed_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        for contents in [
            "not json",
            r#"{"gain": "loud"}"#,
            r#"{"gain": -1.0}"#,
            r#"{"gian": 1.0}"#,
            r#"{"band_corr_db": {"eighty": 1.0}}"#,
            r#"{"devices": {"hw:1": {"gain": 0.0}}}"#,
        ] {
            let path = write(dir.path(), contents);
            assert!(
                Calibrator::load(&path, "hw:1").is_err(),
                "{} should be rejected",
                contents
            );
        }
    }
}
