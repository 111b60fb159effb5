use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use scc::{HashMap, hash_map::Entry};

use crate::ports::{CacheError, CacheResult, ResponseCache};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Process-local response cache with per-entry expiry and a size ceiling.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: HashMap<String, CacheEntry>,
    max_entries: usize,
}

impl InMemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain_async(|_, entry| !entry.is_expired(now))
            .await;
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl ResponseCache for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let now = Instant::now();
        match self.entries.get_async(key).await {
            Some(entry) if entry.get().is_expired(now) => {
                entry.remove();
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.get().value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        if self.entries.len() >= self.max_entries && !self.entries.contains_async(key).await {
            let pruned = self.prune_expired().await;
            tracing::debug!(pruned, "Pruned expired cache entries");
            if self.entries.len() >= self.max_entries {
                return Err(CacheError::Full(self.max_entries));
            }
        }

        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        match self.entries.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = entry;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
            }
        }
        Ok(())
    }
}
