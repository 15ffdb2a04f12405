//! Trigger state machine
//!
//! Consumes one [`LevelSample`] per block and decides when an event starts
//! and ends:
//!
//! - `IDLE -> CAPTURING` on the first block where `fast >= thresh_a80` or
//!   `slow >= thresh_a160` (or `IDLE -> ARMED` when a confirm delay is set)
//! - `ARMED -> CAPTURING` once the exceedance has lasted `confirm_sec`;
//!   `ARMED -> IDLE` as soon as a block is below both thresholds
//! - `CAPTURING` continues while over threshold and until `post_trigger`
//!   has elapsed since the last exceeding block
//! - `CAPTURING -> COOLDOWN` finalizes the event; an event reaching
//!   `max_event_sec` is closed there too, marked truncated
//! - `COOLDOWN -> IDLE` after `hold_sec`, regardless of levels; exceedances
//!   in between are counted as suppressed
//!
//! All timing is in stream frames. A block covering frames `[s, e)` opens
//! an event at `s`; exceedance times and event ends use `e`.

use crate::audio::level::LevelSample;
use crate::config::TriggerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine trigger state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    #[default]
    Idle,
    /// Threshold exceeded, waiting for the confirm delay
    Armed,
    Capturing,
    Cooldown,
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TriggerState::Idle => "IDLE",
            TriggerState::Armed => "ARMED",
            TriggerState::Capturing => "CAPTURING",
            TriggerState::Cooldown => "COOLDOWN",
        };
        f.write_str(name)
    }
}

/// Band that opened an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerCause {
    /// Fast window (`thresh_a80`)
    Fast,
    /// Slow window (`thresh_a160`); wins exact ties
    Slow,
}

/// One detected event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: u64,
    pub cause: TriggerCause,
    /// First stream frame of the event
    pub start_frame: u64,
    /// One past the last frame (`None` while open)
    pub end_frame: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub peak_fast: f64,
    pub peak_slow: f64,
    /// Live frames observed since the event started
    pub captured_sample_count: u64,
    /// Closed by shutdown or the length cap rather than by the post-trigger window
    pub truncated: bool,
}

impl TriggerEvent {
    pub fn is_open(&self) -> bool {
        self.end_frame.is_none()
    }

    /// Event duration in seconds (up to now for an open event)
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        let end = self
            .end_frame
            .unwrap_or(self.start_frame + self.captured_sample_count);
        end.saturating_sub(self.start_frame) as f64 / sample_rate as f64
    }
}

/// Thresholds and durations converted to frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerTiming {
    pub thresh_fast: f64,
    pub thresh_slow: f64,
    pub post_frames: u64,
    pub hold_frames: u64,
    pub confirm_frames: u64,
    /// Longest event; reaching it closes the event as truncated
    pub max_frames: u64,
}

impl TriggerTiming {
    pub fn from_config(config: &TriggerConfig, sample_rate: u32) -> Self {
        Self {
            thresh_fast: config.thresh_a80,
            thresh_slow: config.thresh_a160,
            post_frames: TriggerConfig::frames(config.post_trigger, sample_rate),
            hold_frames: TriggerConfig::frames(config.hold_sec, sample_rate),
            confirm_frames: TriggerConfig::frames(config.confirm_sec, sample_rate),
            max_frames: TriggerConfig::frames(config.max_event_sec, sample_rate).max(1),
        }
    }
}

/// Most significant state change caused by one block
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `IDLE -> ARMED`: provisional capture should start
    Armed { cause: TriggerCause },
    /// Event confirmed and capturing (from IDLE or ARMED)
    Opened { event_id: u64, cause: TriggerCause },
    /// `ARMED -> IDLE`: provisional capture discarded
    Aborted,
    /// `CAPTURING -> COOLDOWN`: event closed
    Finalized(TriggerEvent),
    /// `COOLDOWN -> IDLE`
    Released,
    /// Exceedance ignored during cooldown
    Suppressed,
}

/// Provisional event while ARMED
#[derive(Debug, Clone)]
struct Pending {
    cause: TriggerCause,
    start_frame: u64,
    started_at: DateTime<Utc>,
    peak_fast: f64,
    peak_slow: f64,
    captured: u64,
}

/// Debounced trigger decisions
#[derive(Debug)]
pub struct TriggerStateMachine {
    timing: TriggerTiming,
    state: TriggerState,
    next_event_id: u64,
    pending: Option<Pending>,
    open: Option<TriggerEvent>,
    last_exceed_frame: u64,
    cooldown_since: u64,
    last_event_end: Option<u64>,
    suppressed: u64,
}

impl TriggerStateMachine {
    pub fn new(timing: TriggerTiming) -> Self {
        Self {
            timing,
            state: TriggerState::Idle,
            next_event_id: 1,
            pending: None,
            open: None,
            last_exceed_frame: 0,
            cooldown_since: 0,
            last_event_end: None,
            suppressed: 0,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn timing(&self) -> &TriggerTiming {
        &self.timing
    }

    /// Currently open (confirmed) event
    pub fn open_event(&self) -> Option<&TriggerEvent> {
        self.open.as_ref()
    }

    pub fn open_event_id(&self) -> Option<u64> {
        self.open.as_ref().map(|e| e.event_id)
    }

    /// End frame of the most recently finalized event
    pub fn last_event_end(&self) -> Option<u64> {
        self.last_event_end
    }

    /// Exceedances ignored during cooldown so far
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    fn exceedance(&self, levels: &LevelSample) -> Option<TriggerCause> {
        let fast = levels.fast >= self.timing.thresh_fast;
        let slow = levels.slow >= self.timing.thresh_slow;
        match (fast, slow) {
            (_, true) => Some(TriggerCause::Slow),
            (true, false) => Some(TriggerCause::Fast),
            (false, false) => None,
        }
    }

    /// Advance by one block
    pub fn update(&mut self, levels: &LevelSample) -> Option<Transition> {
        let block_frames = levels.frame_end.saturating_sub(levels.frame_start);
        let over = self.exceedance(levels);

        match self.state {
            TriggerState::Idle => {
                let cause = over?;
                let pending = Pending {
                    cause,
                    start_frame: levels.frame_start,
                    started_at: levels.timestamp,
                    peak_fast: levels.fast,
                    peak_slow: levels.slow,
                    captured: block_frames,
                };
                if self.timing.confirm_frames == 0 {
                    return Some(self.start_event(pending, levels));
                }
                self.pending = Some(pending);
                self.state = TriggerState::Armed;
                tracing::debug!(?cause, frame = levels.frame_start, "Trigger armed");
                match self.try_confirm(levels) {
                    Some(opened) => Some(opened),
                    None => Some(Transition::Armed { cause }),
                }
            }

            TriggerState::Armed => {
                if over.is_none() {
                    self.pending = None;
                    self.state = TriggerState::Idle;
                    tracing::debug!(frame = levels.frame_end, "Trigger disarmed before confirm");
                    return Some(Transition::Aborted);
                }
                if let Some(pending) = self.pending.as_mut() {
                    pending.peak_fast = pending.peak_fast.max(levels.fast);
                    pending.peak_slow = pending.peak_slow.max(levels.slow);
                    pending.captured += block_frames;
                }
                self.try_confirm(levels)
            }

            TriggerState::Capturing => {
                let mut start_frame = levels.frame_start;
                if let Some(event) = self.open.as_mut() {
                    event.peak_fast = event.peak_fast.max(levels.fast);
                    event.peak_slow = event.peak_slow.max(levels.slow);
                    event.captured_sample_count += block_frames;
                    start_frame = event.start_frame;
                }
                if levels.frame_end.saturating_sub(start_frame) >= self.timing.max_frames {
                    tracing::warn!(
                        frame = levels.frame_end,
                        max_frames = self.timing.max_frames,
                        "Event reached its length cap"
                    );
                    return self
                        .finalize(levels.frame_end, levels.timestamp, true)
                        .map(Transition::Finalized);
                }
                if over.is_some() {
                    self.last_exceed_frame = levels.frame_end;
                    return None;
                }
                if levels.frame_end.saturating_sub(self.last_exceed_frame) < self.timing.post_frames {
                    return None;
                }
                self.finalize(levels.frame_end, levels.timestamp, false)
                    .map(Transition::Finalized)
            }

            TriggerState::Cooldown => {
                let suppressed = over.is_some();
                if suppressed {
                    self.suppressed += 1;
                    tracing::debug!(
                        frame = levels.frame_start,
                        fast = levels.fast,
                        slow = levels.slow,
                        "Exceedance suppressed during cooldown"
                    );
                }
                if self.release_if_due(levels.frame_end) {
                    Some(Transition::Released)
                } else if suppressed {
                    Some(Transition::Suppressed)
                } else {
                    None
                }
            }
        }
    }

    /// Close the open event at shutdown
    ///
    /// A capturing event is finalized with `truncated = true`; an unconfirmed
    /// ARMED capture is discarded.
    pub fn force_finalize(&mut self, frame: u64, at: DateTime<Utc>) -> Option<TriggerEvent> {
        match self.state {
            TriggerState::Capturing => {
                let event = self.finalize(frame, at, true);
                self.state = TriggerState::Idle;
                event
            }
            TriggerState::Armed => {
                self.pending = None;
                self.state = TriggerState::Idle;
                None
            }
            _ => None,
        }
    }

    fn try_confirm(&mut self, levels: &LevelSample) -> Option<Transition> {
        let pending = self.pending.as_ref()?;
        if levels.frame_end.saturating_sub(pending.start_frame) < self.timing.confirm_frames {
            return None;
        }
        let pending = self.pending.take()?;
        Some(self.start_event(pending, levels))
    }

    fn start_event(&mut self, pending: Pending, levels: &LevelSample) -> Transition {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        let cause = pending.cause;
        tracing::info!(
            event_id,
            cause = ?cause,
            start_frame = pending.start_frame,
            fast = levels.fast,
            slow = levels.slow,
            "Event started"
        );
        self.open = Some(TriggerEvent {
            event_id,
            cause,
            start_frame: pending.start_frame,
            end_frame: None,
            started_at: pending.started_at,
            ended_at: None,
            peak_fast: pending.peak_fast,
            peak_slow: pending.peak_slow,
            captured_sample_count: pending.captured,
            truncated: false,
        });
        self.last_exceed_frame = levels.frame_end;
        self.state = TriggerState::Capturing;
        Transition::Opened { event_id, cause }
    }

    fn finalize(&mut self, frame: u64, at: DateTime<Utc>, truncated: bool) -> Option<TriggerEvent> {
        let mut event = self.open.take()?;
        event.end_frame = Some(frame);
        event.ended_at = Some(at);
        event.truncated = truncated;
        self.last_event_end = Some(frame);
        self.cooldown_since = frame;
        self.state = TriggerState::Cooldown;
        tracing::info!(
            event_id = event.event_id,
            end_frame = frame,
            peak_fast = event.peak_fast,
            peak_slow = event.peak_slow,
            truncated,
            "Event finalized"
        );
        self.release_if_due(frame);
        Some(event)
    }

    fn release_if_due(&mut self, frame: u64) -> bool {
        if self.state == TriggerState::Cooldown
            && frame.saturating_sub(self.cooldown_since) >= self.timing.hold_frames
        {
            self.state = TriggerState::Idle;
            tracing::debug!(frame, "Cooldown elapsed");
            return true;
        }
        false
    }
}
