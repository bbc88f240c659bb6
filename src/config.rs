//! Runtime configuration parsed from environment variables.
//!
//! Both binaries call `dotenvy::dotenv()` first, so every key below may also
//! come from a `.env` file. Unparseable values fall back to the default.

use std::path::PathBuf;
use std::time::Duration;

use crate::dedup;
use crate::net::connection::{Backoff, ConnectionConfig};
use crate::net::reliable::HedgePolicy;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:5000/api/ws";
pub const DEFAULT_SESSION_ID: &str = "current-rehearsal";
pub const DEFAULT_MAX_RECONNECTS: u32 = 10;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 5000;
pub const DEFAULT_HEDGE_DELAY_MS: u64 = 100;
pub const DEFAULT_HEDGE_COUNT: u32 = 1;
pub const DEFAULT_RECONCILE_SECS: u64 = 5;
pub const DEFAULT_SONGS_DIR: &str = "songs";

// =============================================================================
// HUB
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub port: u16,
    /// Dedup record bound per session.
    pub dedup_capacity: usize,
    /// Outbound frame buffer per connection.
    pub client_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT, dedup_capacity: dedup::HUB_CAPACITY, client_buffer: DEFAULT_CLIENT_BUFFER }
    }
}

impl HubConfig {
    /// Read `PORT`, `HUB_DEDUP_CAPACITY`, `HUB_CLIENT_BUFFER`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_var)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            dedup_capacity: parse_or(&lookup, "HUB_DEDUP_CAPACITY", defaults.dedup_capacity),
            client_buffer: parse_or(&lookup, "HUB_CLIENT_BUFFER", defaults.client_buffer).max(1),
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub hub_url: String,
    pub token: Option<String>,
    pub session_id: String,
    pub max_reconnects: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub hedge_delay: Duration,
    pub hedge_count: u32,
    pub follower_dedup_capacity: usize,
    /// Follower silence window before polling the song store.
    pub reconcile_interval: Duration,
    pub songs_dir: PathBuf,
    pub song_store: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    pub hub_url: Option<String>,
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub songs_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_HUB_URL.to_string(),
            token: None,
            session_id: DEFAULT_SESSION_ID.to_string(),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            hedge_delay: Duration::from_millis(DEFAULT_HEDGE_DELAY_MS),
            hedge_count: DEFAULT_HEDGE_COUNT,
            follower_dedup_capacity: dedup::FOLLOWER_CAPACITY,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_SECS),
            songs_dir: PathBuf::from(DEFAULT_SONGS_DIR),
            song_store: None,
        }
    }
}

impl ClientConfig {
    /// Read the `REHEARSAL_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_var)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, key, u64::try_from(default.as_millis()).unwrap_or(u64::MAX)))
        };
        Self {
            hub_url: non_empty(&lookup, "REHEARSAL_HUB_URL").unwrap_or(d.hub_url),
            token: non_empty(&lookup, "REHEARSAL_TOKEN"),
            session_id: non_empty(&lookup, "REHEARSAL_SESSION").unwrap_or(d.session_id),
            max_reconnects: parse_or(&lookup, "REHEARSAL_MAX_RECONNECTS", d.max_reconnects),
            reconnect_base: millis("REHEARSAL_RECONNECT_BASE_MS", d.reconnect_base),
            reconnect_max: millis("REHEARSAL_RECONNECT_MAX_MS", d.reconnect_max),
            hedge_delay: millis("REHEARSAL_HEDGE_DELAY_MS", d.hedge_delay),
            hedge_count: parse_or(&lookup, "REHEARSAL_HEDGE_COUNT", d.hedge_count),
            follower_dedup_capacity: parse_or(&lookup, "REHEARSAL_FOLLOWER_DEDUP_CAPACITY", d.follower_dedup_capacity),
            reconcile_interval: Duration::from_secs(parse_or(&lookup, "REHEARSAL_RECONCILE_SECS", DEFAULT_RECONCILE_SECS)),
            songs_dir: non_empty(&lookup, "REHEARSAL_SONGS_DIR").map_or(d.songs_dir, PathBuf::from),
            song_store: non_empty(&lookup, "REHEARSAL_SONG_STORE").map(PathBuf::from),
        }
    }

    /// Apply command-line values; each one given replaces the environment's.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ClientOverrides) -> Self {
        if let Some(url) = overrides.hub_url {
            self.hub_url = url;
        }
        if overrides.token.is_some() {
            self.token = overrides.token;
        }
        if let Some(session_id) = overrides.session_id {
            self.session_id = session_id;
        }
        if let Some(dir) = overrides.songs_dir {
            self.songs_dir = dir;
        }
        self
    }

    /// Transport settings for this participant.
    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.hub_url.clone(),
            token: self.token.clone(),
            session_id: Some(self.session_id.clone()),
            backoff: Backoff { base: self.reconnect_base, max: self.reconnect_max, max_attempts: self.max_reconnects },
            ..ConnectionConfig::default()
        }
    }

    #[must_use]
    pub fn hedge_policy(&self) -> HedgePolicy {
        HedgePolicy { delay: self.hedge_delay, count: self.hedge_count }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
