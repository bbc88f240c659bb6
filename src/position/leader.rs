//! The leader side turns navigation commands and auto-scroll ticks into hedged
//! sync commands.
//!
//! The run loop re-derives the tick deadline after every command, so manual
//! navigation while auto-scroll is on cancels the pending tick and restarts
//! the countdown from the new position.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, SongCatalog};
use crate::event::PositionEvent;
use crate::net::reliable::ReliableEmitter;
use crate::position::reconcile::SongStore;
use crate::position::{PositionError, PositionMachine, PositionState, TickOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum LeaderCommand {
    SelectSong(String),
    SelectLine(i64),
    SelectWord { line: i64, word: i64 },
    AutoScroll(bool),
    Speed(f64),
    EndSession,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized command `{0}` (song <id> | line <n> | word <line> <word> | scroll on|off | speed <secs> | end)")]
pub struct ParseCommandError(pub String);

/// Console syntax: `song hey_jude`, `line 3`, `word 3 1`, `scroll on`,
/// `speed 5`, `end`.
impl FromStr for LeaderCommand {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseCommandError(s.trim().to_owned());
        let mut parts = s.split_whitespace();
        let command = match (parts.next(), parts.next(), parts.next()) {
            (Some("song"), Some(id), None) => Self::SelectSong(id.to_owned()),
            (Some("line"), Some(line), None) => Self::SelectLine(line.parse().map_err(|_| bad())?),
            (Some("word"), Some(line), Some(word)) => Self::SelectWord {
                line: line.parse().map_err(|_| bad())?,
                word: word.parse().map_err(|_| bad())?,
            },
            (Some("scroll"), Some("on"), None) => Self::AutoScroll(true),
            (Some("scroll"), Some("off"), None) => Self::AutoScroll(false),
            (Some("speed"), Some(speed), None) => Self::Speed(speed.parse().map_err(|_| bad())?),
            (Some("end"), None, None) => Self::EndSession,
            _ => return Err(bad()),
        };
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(command)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Position(#[from] PositionError),
}

pub struct Leader {
    machine: PositionMachine,
    emitter: ReliableEmitter,
    catalog: Arc<dyn SongCatalog>,
    store: Option<Arc<dyn SongStore>>,
    state_tx: watch::Sender<PositionState>,
}

impl Leader {
    pub fn new(emitter: ReliableEmitter, catalog: Arc<dyn SongCatalog>) -> Self {
        let (state_tx, _) = watch::channel(PositionState::default());
        Self { machine: PositionMachine::new(), emitter, catalog, store: None, state_tx }
    }

    /// Record every song selection in `store` for reconciling followers.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SongStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn state(&self) -> &PositionState {
        self.machine.state()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PositionState> {
        self.state_tx.subscribe()
    }

    /// Apply one command and emit the resulting events.
    ///
    /// # Errors
    ///
    /// Returns `Catalog` if a selected song cannot be loaded (the selection
    /// still goes out), or `Position` for navigation before a song is loaded.
    pub async fn handle(&mut self, command: LeaderCommand) -> Result<(), LeaderError> {
        let result = match command {
            LeaderCommand::SelectSong(song_id) => self.select_song(song_id).await,
            LeaderCommand::SelectLine(line) => match self.machine.select_line(line) {
                Ok(events) => {
                    self.emit_all(&events);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            LeaderCommand::SelectWord { line, word } => match self.machine.select_word(line, word) {
                Ok(events) => {
                    self.emit_all(&events);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            LeaderCommand::AutoScroll(enabled) => {
                let events = self.machine.set_auto_scroll(enabled);
                self.emit_all(&events);
                Ok(())
            }
            LeaderCommand::Speed(speed) => {
                let events = self.machine.set_speed(speed);
                self.emit_all(&events);
                Ok(())
            }
            LeaderCommand::EndSession => {
                self.machine.set_auto_scroll(false);
                self.emit_all(&[PositionEvent::SessionEnd]);
                Ok(())
            }
        };
        self.publish();
        result
    }

    /// Advance auto-scroll one step and emit what changed.
    pub fn tick(&mut self) -> TickOutcome {
        let outcome = self.machine.tick();
        if let TickOutcome::Advanced(events) | TickOutcome::Finished(events) = &outcome {
            if matches!(outcome, TickOutcome::Finished(_)) {
                info!("auto-scroll reached end of song");
            }
            self.emit_all(events);
            self.publish();
        }
        outcome
    }

    /// Run until `EndSession` or the command channel closes. Returns the
    /// final state.
    pub async fn run(mut self, mut commands: mpsc::Receiver<LeaderCommand>) -> PositionState {
        loop {
            let deadline = self
                .machine
                .state()
                .auto_scroll_enabled
                .then(|| Instant::now() + self.machine.tick_interval());

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("leader command channel closed");
                        break;
                    };
                    let ending = command == LeaderCommand::EndSession;
                    if let Err(e) = self.handle(command).await {
                        warn!(error = %e, "leader command failed");
                    }
                    if ending {
                        break;
                    }
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tick();
                }
            }
        }
        self.machine.state().clone()
    }

    async fn select_song(&mut self, song_id: String) -> Result<(), LeaderError> {
        let events = self.machine.select_song(song_id.clone());
        self.emit_all(&events);

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&song_id).await {
                warn!(%song_id, error = %e, "song store write failed");
            }
        }

        let song = self.catalog.song(&song_id).await?;
        self.machine.load_song(song)?;
        info!(%song_id, "song selected");
        Ok(())
    }

    fn emit_all(&mut self, events: &[PositionEvent]) {
        for event in events {
            self.emitter.emit(event);
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.machine.state().clone());
    }
}

#[cfg(test)]
#[path = "leader_test.rs"]
mod tests;
