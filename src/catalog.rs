//! Song catalog: lookup of song bounds by id.
//!
//! DESIGN
//! ======
//! The sync core only needs a song's shape (how many lines, how many words
//! per line) to clamp indexes and pace auto-scroll. Lyrics and chords are
//! carried through for the rendering layer but never interpreted here.
//!
//! `DirCatalog` reads one JSON file per song, `<dir>/<id>.json`, holding the
//! bare `[[{lyrics, chords?}]]` array. The title is derived from the id.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("song not found: {0}")]
    NotFound(String),
    #[error("invalid song id: {0:?}")]
    InvalidId(String),
    #[error("failed to read song {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse song {id}: {source}")]
    Parse {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl crate::frame::ErrorCode for CatalogError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_SONG_NOT_FOUND",
            Self::InvalidId(_) => "E_INVALID_SONG_ID",
            Self::Io { .. } => "E_CATALOG_IO",
            Self::Parse { .. } => "E_CATALOG_PARSE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// One word of a line: lyric text plus an optional chord above it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Word {
    #[serde(alias = "lyrics", default)]
    pub lyrics_text: String,
    #[serde(alias = "chords", default, skip_serializing_if = "Option::is_none")]
    pub chords_text: Option<String>,
}

impl Word {
    pub fn new(lyrics: impl Into<String>) -> Self {
        Self { lyrics_text: lyrics.into(), chords_text: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub title: String,
    pub lines: Vec<Vec<Word>>,
}

impl Song {
    /// Build a song whose title is derived from its id.
    pub fn new(id: impl Into<String>, lines: Vec<Vec<Word>>) -> Self {
        let id = id.into();
        let title = title_from_id(&id);
        Self { id, title, lines }
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Words in `line`, or zero when the line does not exist.
    #[must_use]
    pub fn word_count(&self, line: usize) -> usize {
        self.lines.get(line).map_or(0, Vec::len)
    }
}

/// `hey_jude` -> `Hey Jude`.
#[must_use]
pub fn title_from_id(id: &str) -> String {
    id.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// CATALOG TRAIT
// =============================================================================

/// Async song lookup. Enables swapping the file catalog for fixtures in tests.
#[async_trait::async_trait]
pub trait SongCatalog: Send + Sync {
    /// Look up a song by id.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] for unknown ids, or an I/O or parse
    /// error from the backing store.
    async fn song(&self, id: &str) -> Result<Song, CatalogError>;
}

// =============================================================================
// DIRECTORY CATALOG
// =============================================================================

#[derive(Debug, Clone)]
pub struct DirCatalog {
    root: PathBuf,
}

impl DirCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CatalogError> {
        let valid = !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\']) && !id.contains("..");
        if !valid {
            return Err(CatalogError::InvalidId(id.to_owned()));
        }
        Ok(self.root.join(format!("{id}.json")))
    }
}

#[async_trait::async_trait]
impl SongCatalog for DirCatalog {
    async fn song(&self, id: &str) -> Result<Song, CatalogError> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound(id.to_owned()));
            }
            Err(source) => return Err(CatalogError::Io { id: id.to_owned(), source }),
        };
        let lines: Vec<Vec<Word>> =
            serde_json::from_slice(&bytes).map_err(|source| CatalogError::Parse { id: id.to_owned(), source })?;
        Ok(Song::new(id, lines))
    }
}

// =============================================================================
// MEMORY CATALOG
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    songs: HashMap<String, Song>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_song(mut self, song: Song) -> Self {
        self.insert(song);
        self
    }

    pub fn insert(&mut self, song: Song) {
        self.songs.insert(song.id.clone(), song);
    }
}

#[async_trait::async_trait]
impl SongCatalog for MemoryCatalog {
    async fn song(&self, id: &str) -> Result<Song, CatalogError> {
        self.songs
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_owned()))
    }
}

#[cfg(test)]
#[path = "catalog_test.rs"]
mod tests;
