//! Short-lived record of recently written commands.
//!
//! The sender consults the cache before queueing a command that may be
//! redundant: if an equivalent command went out within the TTL, the new
//! one is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use nikobus_core::{Command, RedundancyKey};

/// Default lifetime of a cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(2);

/// A command and the instant it was written.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub command: Arc<Command>,
    pub sent_at: Instant,
}

#[derive(Debug)]
pub struct CommandCache {
    ttl: Duration,
    entries: Mutex<HashMap<RedundancyKey, CacheEntry>>,
}

impl Default for CommandCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl CommandCache {
    pub fn new(ttl: Duration) -> Self {
        CommandCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RedundancyKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remember that `command` went out at `sent_at`.
    pub fn record(&self, key: RedundancyKey, command: Arc<Command>, sent_at: Instant) {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| now.duration_since(entry.sent_at) < self.ttl);
        entries.insert(key, CacheEntry { command, sent_at });
    }

    /// Whether an equivalent command was written within the TTL.
    pub fn contains(&self, key: &RedundancyKey) -> bool {
        self.lookup(key).is_some()
    }

    /// The live entry for `key`, evicting it if it has expired.
    pub fn lookup(&self, key: &RedundancyKey) -> Option<CacheEntry> {
        let mut entries = self.lock();
        let expired = match entries.get(key) {
            Some(entry) => entry.sent_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            trace!(address = %key.address, kind = ?key.kind, "cache entry expired");
            entries.remove(key);
            return None;
        }
        entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
