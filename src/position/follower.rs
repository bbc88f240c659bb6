//! Mirrors the leader's position from hub broadcasts.
//!
//! Each broadcast passes a local dedup window first (hedge copies and
//! replays are dropped), then the position machine. A `songSelected` loads
//! the song's bounds from the catalog before the next event is looked at, so
//! line and word updates that follow it are clamped against the right song.
//!
//! With a song store configured, a follower that hears nothing for
//! `reconcile_interval` polls the store and adopts a fresh selection it
//! missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::catalog::SongCatalog;
use crate::config::DEFAULT_RECONCILE_SECS;
use crate::dedup::{self, DedupEntry, Deduplicator};
use crate::event::{PositionEvent, ReceivedEvent};
use crate::frame::Data;
use crate::position::reconcile::SongStore;
use crate::position::{Applied, PositionError, PositionMachine, PositionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Applied(Applied),
    Duplicate,
    /// Did not fit the loaded song; state unchanged.
    Stale(PositionError),
}

pub struct Follower {
    machine: PositionMachine,
    dedup: Deduplicator,
    catalog: Arc<dyn SongCatalog>,
    store: Option<Arc<dyn SongStore>>,
    reconcile_interval: Duration,
    last_update: Instant,
    state_tx: watch::Sender<PositionState>,
}

impl Follower {
    pub fn new(catalog: Arc<dyn SongCatalog>) -> Self {
        let (state_tx, _) = watch::channel(PositionState::default());
        Self {
            machine: PositionMachine::new(),
            dedup: Deduplicator::new(dedup::FOLLOWER_CAPACITY),
            catalog,
            store: None,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_SECS),
            last_update: Instant::now(),
            state_tx,
        }
    }

    #[must_use]
    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup = Deduplicator::new(capacity);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SongStore>, interval: Duration) -> Self {
        self.store = Some(store);
        self.reconcile_interval = interval;
        self
    }

    #[must_use]
    pub fn state(&self) -> &PositionState {
        self.machine.state()
    }

    /// Pace a local auto-scroll display would use at the current position.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.machine.tick_interval()
    }

    /// Every state change is published here.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PositionState> {
        self.state_tx.subscribe()
    }

    /// Dedup and apply one broadcast.
    pub async fn receive(&mut self, received: ReceivedEvent) -> Received {
        if let Some(meta) = &received.meta {
            let is_hedge = meta.is_backup || meta.id.original().is_some();
            let mut payload = Data::new();
            received.event.write_into(&mut payload);
            let verdict = self
                .dedup
                .check(&meta.id, is_hedge, DedupEntry::new(Some(received.event.kind()), payload));
            if !verdict.is_accepted() {
                debug!(sync_id = %meta.id, ?verdict, "duplicate broadcast dropped");
                return Received::Duplicate;
            }
        }
        self.last_update = Instant::now();

        let outcome = match self.machine.apply(&received.event) {
            Ok(Applied::SongChanged(song_id)) => {
                self.load_song(&song_id).await;
                Received::Applied(Applied::SongChanged(song_id))
            }
            Ok(applied) => Received::Applied(applied),
            Err(e) => {
                debug!(event = received.event.kind().broadcast(), error = %e, "stale position update dropped");
                return Received::Stale(e);
            }
        };
        self.publish();
        outcome
    }

    /// Adopt the stored selection if nothing has arrived for a full
    /// reconcile interval. Returns true when the song changed.
    pub async fn reconcile(&mut self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        if self.last_update.elapsed() < self.reconcile_interval {
            return false;
        }
        let record = match store.load().await {
            Ok(Some(record)) if record.is_fresh() => record,
            Ok(_) => return false,
            Err(e) => {
                warn!(error = %e, "song store read failed");
                return false;
            }
        };
        if self.machine.state().selected_song_id.as_deref() == Some(record.song_id.as_str()) {
            return false;
        }

        info!(song_id = %record.song_id, "adopting stored song selection");
        let select = PositionEvent::SongSelect { song_id: record.song_id.clone() };
        if let Ok(Applied::SongChanged(song_id)) = self.machine.apply(&select) {
            self.load_song(&song_id).await;
        }
        self.last_update = Instant::now();
        self.publish();
        true
    }

    /// Consume broadcasts until `sessionEnded` or the stream closes.
    /// Returns the final state.
    pub async fn run(mut self, mut positions: mpsc::Receiver<ReceivedEvent>) -> PositionState {
        let mut poll = tokio::time::interval(self.reconcile_interval.max(Duration::from_millis(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.reset();
        let reconciling = self.store.is_some();

        loop {
            tokio::select! {
                received = positions.recv() => {
                    let Some(received) = received else {
                        debug!("position stream closed");
                        break;
                    };
                    if self.receive(received).await == Received::Applied(Applied::Ended) {
                        info!("session ended");
                        break;
                    }
                }
                _ = poll.tick(), if reconciling => {
                    self.reconcile().await;
                }
            }
        }
        self.machine.state().clone()
    }

    async fn load_song(&mut self, song_id: &str) {
        match self.catalog.song(song_id).await {
            Ok(song) => {
                if let Err(e) = self.machine.load_song(song) {
                    debug!(error = %e, "discarding song load");
                }
            }
            Err(e) => warn!(%song_id, error = %e, "song lookup failed"),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.machine.state().clone());
    }
}

#[cfg(test)]
#[path = "follower_test.rs"]
mod tests;
