//! Position state machine for song, line, word and auto-scroll.
//!
//! DESIGN
//! ======
//! The same machine runs on the leader and on every follower. The leader
//! drives it with navigation commands and auto-scroll ticks; each call
//! returns the events that must reach followers. Followers feed it accepted
//! inbound events through `apply`.
//!
//! Indexes from the wire are never trusted: an out-of-range line is dropped
//! as stale, an out-of-range word is clamped into the active line.
//!
//! Selecting a song resets the position and turns auto-scroll off; the
//! speed setting survives.

pub mod follower;
pub mod leader;
pub mod reconcile;

use std::time::Duration;

use serde::Serialize;

use crate::catalog::Song;
use crate::event::PositionEvent;

pub const MIN_SPEED_SECONDS: f64 = 1.0;
pub const MAX_SPEED_SECONDS: f64 = 10.0;
pub const DEFAULT_SPEED_SECONDS: f64 = 3.0;
/// Auto-scroll never advances faster than this.
pub const MIN_TICK: Duration = Duration::from_millis(800);

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    #[error("no song loaded")]
    NoSong,
    #[error("line {line} is outside the song ({lines} lines)")]
    StaleIndex { line: i64, lines: usize },
    #[error("song {loaded} does not match the selected song {selected}")]
    SongMismatch { selected: String, loaded: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionState {
    pub selected_song_id: Option<String>,
    pub active_line_index: Option<usize>,
    pub active_word_index: usize,
    pub auto_scroll_enabled: bool,
    pub auto_scroll_speed_seconds: f64,
}

impl Default for PositionState {
    fn default() -> Self {
        Self {
            selected_song_id: None,
            active_line_index: None,
            active_word_index: 0,
            auto_scroll_enabled: false,
            auto_scroll_speed_seconds: DEFAULT_SPEED_SECONDS,
        }
    }
}

/// What an applied inbound event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Updated,
    /// A different song was selected; its bounds must be loaded.
    SongChanged(String),
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Auto-scroll is off or no song is loaded.
    Idle,
    Advanced(Vec<PositionEvent>),
    /// End of song reached; auto-scroll is now off.
    Finished(Vec<PositionEvent>),
}

// =============================================================================
// MACHINE
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct PositionMachine {
    state: PositionState,
    song: Option<Song>,
}

impl PositionMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> &PositionState {
        &self.state
    }

    #[must_use]
    pub fn song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    /// Install the bounds of the selected song.
    ///
    /// # Errors
    ///
    /// Returns `SongMismatch` if another song was selected since the lookup
    /// started; the late result is discarded.
    pub fn load_song(&mut self, song: Song) -> Result<(), PositionError> {
        match &self.state.selected_song_id {
            Some(selected) if *selected != song.id => {
                return Err(PositionError::SongMismatch { selected: selected.clone(), loaded: song.id });
            }
            Some(_) => {}
            None => self.state.selected_song_id = Some(song.id.clone()),
        }
        self.song = Some(song);
        Ok(())
    }

    /// Delay until the next auto-scroll advance from the current position.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        let words = self.active_line_words().max(1);
        #[allow(clippy::cast_precision_loss)]
        let per_word = self.state.auto_scroll_speed_seconds / words as f64;
        Duration::try_from_secs_f64(per_word)
            .unwrap_or(Duration::from_secs_f64(MAX_SPEED_SECONDS))
            .max(MIN_TICK)
    }

    // -------------------------------------------------------------------------
    // Leader
    // -------------------------------------------------------------------------

    pub fn select_song(&mut self, song_id: impl Into<String>) -> Vec<PositionEvent> {
        let song_id = song_id.into();
        self.reset_for_song(song_id.clone());
        vec![PositionEvent::SongSelect { song_id }]
    }

    /// Jump to the start of `line`, clamped into the song.
    ///
    /// # Errors
    ///
    /// Returns `NoSong` until a song is loaded, `StaleIndex` if it has no lines.
    pub fn select_line(&mut self, line: i64) -> Result<Vec<PositionEvent>, PositionError> {
        let line = self.clamp_line(line)?;
        self.state.active_line_index = Some(line);
        self.state.active_word_index = 0;
        Ok(vec![PositionEvent::LineSync { line_index: to_wire(line) }])
    }

    /// Jump to `word` of `line`, both clamped into the song.
    ///
    /// # Errors
    ///
    /// Returns `NoSong` until a song is loaded, `StaleIndex` if it has no lines.
    pub fn select_word(&mut self, line: i64, word: i64) -> Result<Vec<PositionEvent>, PositionError> {
        let line = self.clamp_line(line)?;
        let word = clamp_word(word, self.word_count(line));
        self.state.active_line_index = Some(line);
        self.state.active_word_index = word;
        Ok(vec![PositionEvent::WordSync { line_index: to_wire(line), word_index: to_wire(word) }])
    }

    /// Turning auto-scroll on restarts from the top of the loaded song.
    pub fn set_auto_scroll(&mut self, enabled: bool) -> Vec<PositionEvent> {
        self.state.auto_scroll_enabled = enabled;
        if !enabled || self.song.is_none() {
            return vec![PositionEvent::ScrollToggle { enabled }];
        }
        self.state.active_line_index = Some(0);
        self.state.active_word_index = 0;
        vec![
            PositionEvent::ScrollToggle { enabled: true },
            PositionEvent::LineSync { line_index: 0 },
            PositionEvent::WordSync { line_index: 0, word_index: 0 },
        ]
    }

    /// Set the per-line scroll time, clamped to the supported range.
    pub fn set_speed(&mut self, speed_seconds: f64) -> Vec<PositionEvent> {
        let speed_seconds = clamp_speed(speed_seconds);
        self.state.auto_scroll_speed_seconds = speed_seconds;
        vec![PositionEvent::SpeedUpdate { speed_seconds }]
    }

    /// Advance one auto-scroll step.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.state.auto_scroll_enabled {
            return TickOutcome::Idle;
        }
        let Some(song) = &self.song else {
            return TickOutcome::Idle;
        };

        let line = self.state.active_line_index.unwrap_or(0);
        let words = song.word_count(line);
        let word = self.state.active_word_index;

        if word + 1 < words {
            self.state.active_line_index = Some(line);
            self.state.active_word_index = word + 1;
            return TickOutcome::Advanced(vec![PositionEvent::WordSync {
                line_index: to_wire(line),
                word_index: to_wire(word + 1),
            }]);
        }

        if line + 1 < song.line_count() {
            let next = line + 1;
            self.state.active_line_index = Some(next);
            self.state.active_word_index = 0;
            return TickOutcome::Advanced(vec![
                PositionEvent::LineSync { line_index: to_wire(next) },
                PositionEvent::WordSync { line_index: to_wire(next), word_index: 0 },
            ]);
        }

        self.state.auto_scroll_enabled = false;
        TickOutcome::Finished(vec![PositionEvent::ScrollToggle { enabled: false }])
    }

    // -------------------------------------------------------------------------
    // Follower
    // -------------------------------------------------------------------------

    /// Apply an accepted inbound event.
    ///
    /// # Errors
    ///
    /// Returns `StaleIndex` (or `NoSong`) for line/word events that do not fit
    /// the loaded song. State is left untouched in that case.
    pub fn apply(&mut self, event: &PositionEvent) -> Result<Applied, PositionError> {
        match event {
            PositionEvent::LineSync { line_index } => {
                let line = self.checked_line(*line_index)?;
                self.state.active_line_index = Some(line);
                self.state.active_word_index = 0;
                Ok(Applied::Updated)
            }
            PositionEvent::WordSync { line_index, word_index } => {
                let line = self.checked_line(*line_index)?;
                self.state.active_line_index = Some(line);
                self.state.active_word_index = clamp_word(*word_index, self.word_count(line));
                Ok(Applied::Updated)
            }
            PositionEvent::ScrollToggle { enabled } => {
                self.state.auto_scroll_enabled = *enabled;
                if *enabled && self.song.is_some() {
                    self.state.active_line_index = Some(0);
                    self.state.active_word_index = 0;
                }
                Ok(Applied::Updated)
            }
            PositionEvent::SpeedUpdate { speed_seconds } => {
                self.state.auto_scroll_speed_seconds = clamp_speed(*speed_seconds);
                Ok(Applied::Updated)
            }
            PositionEvent::SongSelect { song_id } => {
                if self.state.selected_song_id.as_deref() == Some(song_id.as_str()) && self.song.is_some() {
                    return Ok(Applied::Updated);
                }
                self.reset_for_song(song_id.clone());
                Ok(Applied::SongChanged(song_id.clone()))
            }
            PositionEvent::SessionEnd => {
                self.state.auto_scroll_enabled = false;
                Ok(Applied::Ended)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn reset_for_song(&mut self, song_id: String) {
        let speed = self.state.auto_scroll_speed_seconds;
        self.state = PositionState {
            selected_song_id: Some(song_id),
            auto_scroll_speed_seconds: speed,
            ..PositionState::default()
        };
        self.song = None;
    }

    fn word_count(&self, line: usize) -> usize {
        self.song.as_ref().map_or(0, |s| s.word_count(line))
    }

    fn active_line_words(&self) -> usize {
        self.word_count(self.state.active_line_index.unwrap_or(0))
    }

    fn clamp_line(&self, line: i64) -> Result<usize, PositionError> {
        let song = self.song.as_ref().ok_or(PositionError::NoSong)?;
        let Some(last) = song.line_count().checked_sub(1) else {
            return Err(PositionError::StaleIndex { line, lines: 0 });
        };
        Ok(usize::try_from(line.max(0)).map_or(last, |l| l.min(last)))
    }

    fn checked_line(&self, line: i64) -> Result<usize, PositionError> {
        let song = self.song.as_ref().ok_or(PositionError::NoSong)?;
        let lines = song.line_count();
        usize::try_from(line)
            .ok()
            .filter(|l| *l < lines)
            .ok_or(PositionError::StaleIndex { line, lines })
    }
}

fn clamp_speed(speed_seconds: f64) -> f64 {
    if speed_seconds.is_finite() {
        speed_seconds.clamp(MIN_SPEED_SECONDS, MAX_SPEED_SECONDS)
    } else {
        DEFAULT_SPEED_SECONDS
    }
}

fn clamp_word(word: i64, words: usize) -> usize {
    let last = words.saturating_sub(1);
    usize::try_from(word.max(0)).map_or(last, |w| w.min(last))
}

fn to_wire(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
