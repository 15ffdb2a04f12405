//! Audio processing module
//!
//! This module contains the signal path of the trigger engine:
//! - Fixed-length sample blocks and re-chunking ([`block`])
//! - Per-installation calibration ([`calibration`])
//! - Pre-roll ring buffer ([`ring`])
//! - Fast/slow sliding-window level estimation ([`level`])
//! - Third-octave spectrum analysis and reporting ([`spectrum`])
//! - Audio sources and the bounded block queue ([`source`])

pub mod block;
pub mod calibration;
pub mod level;
pub mod ring;
pub mod source;
pub mod spectrum;
