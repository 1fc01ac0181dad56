//! Resolution cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::dns::{Answer, RecordType};

struct CacheEntry {
    answer: Arc<Answer>,
    expires_at: Instant,
}

/// A cache hit: the stored answer and how long it stays valid.
#[derive(Debug, Clone)]
pub struct Cached {
    pub answer: Arc<Answer>,
    pub remaining: Duration,
}

/// TTL-based resolution cache keyed by (name, record type).
///
/// Uses a 2-level map (record type -> name -> entry) to avoid allocations on
/// lookup. Entries are never served at or past their expiry; an expired entry
/// found by a lookup is dropped, otherwise entries live until overwritten.
pub struct Cache {
    entries: RwLock<FxHashMap<RecordType, FxHashMap<String, CacheEntry>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Look up a live entry (no allocation on hit or miss).
    pub fn get(&self, name: &str, record_type: RecordType) -> Option<Cached> {
        let now = Instant::now();

        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            let entry = entries.get(&record_type)?.get(name)?;
            if now < entry.expires_at {
                return Some(Cached {
                    answer: Arc::clone(&entry.answer),
                    remaining: entry.expires_at - now,
                });
            }
        }

        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        if let Some(inner) = entries.get_mut(&record_type) {
            // Re-check: another task may have refreshed it meanwhile.
            if inner.get(name).is_some_and(|entry| now >= entry.expires_at) {
                inner.remove(name);
            }
        }
        None
    }

    /// Store an answer valid for `ttl` from now, replacing any existing entry.
    pub fn put(&self, name: &str, record_type: RecordType, answer: Arc<Answer>, ttl: Duration) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        entries.entry(record_type).or_default().insert(
            name.to_string(),
            CacheEntry {
                answer,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().map(|inner| inner.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
