use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

mod entry;
mod fingerprint;
mod store;

use entry::{CacheEntry, EntryStatus};
use fingerprint::Fingerprint;
pub use store::EntryWriter;

use super::error::ProxyError;

/// Fixed bucket count; power of two.
pub const BUCKET_COUNT: usize = 1024;

/// Upper bound on a coordination-loop wait; `Notify` usually wakes the
/// waiter sooner.
const COORDINATION_WAIT: Duration = Duration::from_millis(25);

const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Disk-backed response cache with single-flight coherence: for any
/// key, at most one worker resolves from origin while the rest wait,
/// and readers only ever observe fully materialized bodies.
///
/// All index and entry state lives behind one mutex; the state machine
/// (`Fresh` / `Stale` / `InFlight`) serializes file access, so the
/// files themselves need no locks.
#[derive(Debug)]
pub struct Cache {
    dir: PathBuf,
    ttl: Duration,
    state: Mutex<CacheState>,
    changed: Notify,
}

#[derive(Debug)]
struct CacheState {
    buckets: Vec<Vec<CacheEntry>>,
    users: usize,
}

impl CacheState {
    fn entry_mut(&mut self, bucket: usize, key: &str, hex: &str, path: &Path) -> &mut CacheEntry {
        let entries = &mut self.buckets[bucket];
        match entries.iter().position(|entry| entry.key == key) {
            Some(pos) => &mut entries[pos],
            None => {
                entries.push(CacheEntry::new(
                    key.to_string(),
                    hex.to_string(),
                    path.to_path_buf(),
                ));
                entries.last_mut().expect("entry just pushed")
            }
        }
    }
}

enum Step {
    Retry,
    Wait,
    Read,
    Resolve,
}

impl Cache {
    /// Open (creating if needed) the cache directory. Files from prior
    /// runs stay on disk but the index starts empty, so every key is
    /// re-resolved on first use.
    pub async fn new(dir: PathBuf, ttl: Duration) -> Result<Self, ProxyError> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| ProxyError::CacheIo(format!("create {}: {err}", dir.display())))?;
        Ok(Self {
            dir,
            ttl,
            state: Mutex::new(CacheState {
                buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
                users: 0,
            }),
            changed: Notify::new(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch the bytes for `key`, resolving from origin at most once
    /// across all concurrent callers. The resolver receives a write
    /// handle and must [`EntryWriter::fill`] it exactly once, then
    /// hand the writer back; an error (or a resolver that never
    /// writes) rolls the entry back to stale so a later caller can
    /// retry.
    pub async fn get<F, Fut>(&self, key: &str, resolve: F) -> Result<Vec<u8>, ProxyError>
    where
        F: FnOnce(EntryWriter) -> Fut,
        Fut: Future<Output = Result<EntryWriter, ProxyError>>,
    {
        if key.is_empty() {
            return Err(ProxyError::CacheIo("empty cache key".to_string()));
        }
        let fingerprint = Fingerprint::of(key);
        let bucket = fingerprint.bucket(BUCKET_COUNT);
        let hex = fingerprint.to_hex();
        let path = self.dir.join(&hex);

        let mut resolve = Some(resolve);
        loop {
            let step = self.coordinate(bucket, key, &hex, &path);
            match step {
                Step::Retry => {}
                Step::Wait => {
                    let notified = self.changed.notified();
                    let _ = tokio::time::timeout(COORDINATION_WAIT, notified).await;
                }
                Step::Read => return self.read_held_entry(bucket, key, &hex, &path).await,
                Step::Resolve => {
                    let resolve = resolve.take().expect("entry claimed twice by one caller");
                    trace!(key, "cache miss; resolving from origin");
                    let outcome = resolve(EntryWriter::new(path.clone())).await;
                    return self.settle_resolve(bucket, key, &hex, &path, outcome).await;
                }
            }
        }
    }

    /// One pass over the entry state machine, entirely under the
    /// mutex. `Read` and `Resolve` are returned with the entry's (and
    /// the cache's) user count already incremented.
    fn coordinate(&self, bucket: usize, key: &str, hex: &str, path: &Path) -> Step {
        let mut state = self.state.lock();
        let now = Instant::now();
        let (step, took_user) = {
            let entry = state.entry_mut(bucket, key, hex, path);
            match entry.status {
                EntryStatus::Fresh => {
                    let expired = entry.age(now).map(|age| age > self.ttl).unwrap_or(true);
                    if expired {
                        trace!(key, "cache entry expired");
                        entry.status = EntryStatus::Stale;
                        (Step::Retry, false)
                    } else {
                        entry.users += 1;
                        (Step::Read, true)
                    }
                }
                EntryStatus::InFlight => (Step::Wait, false),
                EntryStatus::Stale => {
                    if entry.users == 0 {
                        entry.status = EntryStatus::InFlight;
                        entry.users += 1;
                        (Step::Resolve, true)
                    } else {
                        (Step::Wait, false)
                    }
                }
            }
        };
        if took_user {
            state.users += 1;
        }
        step
    }

    /// Promote or roll back after the resolver ran, then serve the
    /// claimant from the materialized file.
    async fn settle_resolve(
        &self,
        bucket: usize,
        key: &str,
        hex: &str,
        path: &Path,
        outcome: Result<EntryWriter, ProxyError>,
    ) -> Result<Vec<u8>, ProxyError> {
        let failure = match outcome {
            Ok(writer) if writer.is_filled() => None,
            Ok(_) => Some(ProxyError::FetchFailed(
                "resolver completed without storing the entry".to_string(),
            )),
            Err(err) => Some(err),
        };

        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let entry = state.entry_mut(bucket, key, hex, path);
            if failure.is_none() {
                entry.status = EntryStatus::Fresh;
                entry.materialized_at = Some(now);
            } else {
                entry.status = EntryStatus::Stale;
                entry.users -= 1;
            }
            if failure.is_some() {
                state.users -= 1;
            }
        }
        self.changed.notify_waiters();

        match failure {
            None => {
                debug!(key, entry = hex, "cache entry materialized");
                self.read_held_entry(bucket, key, hex, path).await
            }
            Some(err) => {
                warn!(key, error = %err, "resolver failed; entry rolled back to stale");
                Err(err)
            }
        }
    }

    /// Read path: the caller already holds a user slot on the entry.
    async fn read_held_entry(
        &self,
        bucket: usize,
        key: &str,
        hex: &str,
        path: &Path,
    ) -> Result<Vec<u8>, ProxyError> {
        let result = store::read_entry(path).await;

        {
            let mut state = self.state.lock();
            let entry = state.entry_mut(bucket, key, hex, path);
            entry.users -= 1;
            if result.is_err() && entry.status == EntryStatus::Fresh {
                // The body vanished under us; force the next caller to
                // re-resolve instead of failing until the TTL runs out.
                entry.status = EntryStatus::Stale;
            }
            state.users -= 1;
        }
        self.changed.notify_waiters();
        result
    }

    /// Block until no worker is reading or resolving, then drop the
    /// index. On-disk files are left in place for the next run.
    pub async fn drain(&self) {
        loop {
            {
                let state = self.state.lock();
                if state.users == 0 {
                    break;
                }
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let mut state = self.state.lock();
        for bucket in &mut state.buckets {
            bucket.clear();
        }
        debug!("cache index drained");
    }

    #[cfg(test)]
    fn active_users(&self) -> usize {
        self.state.lock().users
    }
}
