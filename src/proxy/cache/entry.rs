use std::path::PathBuf;

use tokio::time::Instant;

/// Per-entry state machine. `Stale` covers both "never fetched" and
/// "expired"; `InFlight` marks the single worker refreshing the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Fresh,
    Stale,
    InFlight,
}

/// One record in the bucket table. All fields are read and written
/// under the cache-wide mutex.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub fingerprint_hex: String,
    pub path: PathBuf,
    pub status: EntryStatus,
    pub users: usize,
    pub materialized_at: Option<Instant>,
}

impl CacheEntry {
    pub fn new(key: String, fingerprint_hex: String, path: PathBuf) -> Self {
        Self {
            key,
            fingerprint_hex,
            path,
            status: EntryStatus::Stale,
            users: 0,
            materialized_at: None,
        }
    }

    /// Age of the freshest materialization, if any.
    pub fn age(&self, now: Instant) -> Option<std::time::Duration> {
        self.materialized_at
            .map(|at| now.saturating_duration_since(at))
    }
}
