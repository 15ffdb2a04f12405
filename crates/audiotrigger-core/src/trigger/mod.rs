//! Trigger decisions and event capture
//!
//! - [`state`]: IDLE / ARMED / CAPTURING / COOLDOWN state machine over
//!   per-block level samples
//! - [`writer`]: persistence of finalized captures (audio + metadata) on a
//!   dedicated writer thread

pub mod state;
pub mod writer;
