//! Shared "current song" record for followers that missed a selection.
//!
//! The leader writes the selected song id with a timestamp on every
//! selection. A follower that has heard nothing for a while reads it back
//! and adopts the song when the record is fresh and differs from its own.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::frame::now_ms;

/// Records older than this are ignored.
pub const FRESHNESS: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("song store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("song store record is malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSong {
    pub song_id: String,
    /// Milliseconds since the Unix epoch.
    pub saved_at: i64,
}

impl StoredSong {
    pub fn new(song_id: impl Into<String>) -> Self {
        Self { song_id: song_id.into(), saved_at: now_ms() }
    }

    #[must_use]
    pub fn is_fresh_at(&self, now_ms: i64) -> bool {
        let max_age = i64::try_from(FRESHNESS.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.saved_at) <= max_age
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(now_ms())
    }
}

#[async_trait::async_trait]
pub trait SongStore: Send + Sync {
    /// Record `song_id` as the current selection.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the record cannot be written.
    async fn save(&self, song_id: &str) -> Result<(), StoreError>;

    /// Read the last recorded selection, if any.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the record exists but cannot be read.
    async fn load(&self) -> Result<Option<StoredSong>, StoreError>;
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Debug, Default)]
pub struct MemorySongStore {
    record: Mutex<Option<StoredSong>>,
}

impl MemorySongStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_record(record: StoredSong) -> Self {
        Self { record: Mutex::new(Some(record)) }
    }
}

#[async_trait::async_trait]
impl SongStore for MemorySongStore {
    async fn save(&self, song_id: &str) -> Result<(), StoreError> {
        *self.record.lock().await = Some(StoredSong::new(song_id));
        Ok(())
    }

    async fn load(&self) -> Result<Option<StoredSong>, StoreError> {
        Ok(self.record.lock().await.clone())
    }
}

// =============================================================================
// FILE
// =============================================================================

/// One JSON record in a file shared by participants on the same machine.
#[derive(Debug, Clone)]
pub struct FileSongStore {
    path: PathBuf,
}

impl FileSongStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl SongStore for FileSongStore {
    async fn save(&self, song_id: &str) -> Result<(), StoreError> {
        let body = serde_json::to_vec(&StoredSong::new(song_id))?;
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<StoredSong>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
