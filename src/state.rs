//! Shared hub state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the live sessions and the registry of connected participants.
//! Each session owns its member senders and its dedup record; both live and
//! die with the session entry.
//!
//! LOCK ORDER
//! ==========
//! Take `sessions` before `clients` when both are needed. Every session
//! mutation happens under the `sessions` write lock, which serializes hub
//! handlers against each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::dedup::Deduplicator;
use crate::frame::Frame;

// =============================================================================
// SESSION STATE
// =============================================================================

/// Per-session live state.
pub struct SessionState {
    /// Members: `client_id` -> sender for outgoing frames.
    pub members: HashMap<Uuid, mpsc::Sender<Frame>>,
    /// Recently processed event ids.
    pub dedup: Deduplicator,
}

impl SessionState {
    #[must_use]
    pub fn new(dedup_capacity: usize) -> Self {
        Self { members: HashMap::new(), dedup: Deduplicator::new(dedup_capacity) }
    }
}

// =============================================================================
// CONNECTED CLIENT
// =============================================================================

/// A participant connection known to the hub.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub tx: mpsc::Sender<Frame>,
    /// Session this connection currently belongs to, if any.
    pub session_id: Option<String>,
    pub connected_at: i64,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<RwLock<HashMap<String, SessionState>>>,
    pub clients: Arc<RwLock<HashMap<Uuid, ConnectedClient>>>,
    pub config: HubConfig,
}

impl AppState {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self { sessions: Arc::new(RwLock::new(HashMap::new())), clients: Arc::new(RwLock::new(HashMap::new())), config }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
