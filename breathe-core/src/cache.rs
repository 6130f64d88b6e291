//! In-memory reading cache with per-entry expiry.
//!
//! Keys are (grid cell, source, pollutant); the grid cell comes from the
//! rounded [`Location`], so nearby requests share entries. Expired entries are
//! invisible to readers and get replaced on the next write.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

use crate::model::{Location, Pollutant, Reading, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    cell: (i64, i64),
    precision: u32,
    source: SourceId,
    pollutant: Pollutant,
}

impl CacheKey {
    pub fn new(location: &Location, source: SourceId, pollutant: Pollutant) -> Self {
        Self {
            cell: location.cell(),
            precision: location.precision(),
            source,
            pollutant,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn pollutant(&self) -> Pollutant {
        self.pollutant
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Reading,
    expires_at: DateTime<Utc>,
}

/// Shared between concurrent forecast requests. Each write replaces a whole
/// entry under the lock, so readers never see a partial one.
#[derive(Debug, Default)]
pub struct ReadingCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Reading> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Reading> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: CacheKey, value: Reading, ttl: Duration) {
        self.put_at(key, value, ttl, Utc::now());
    }

    pub fn put_at(&self, key: CacheKey, value: Reading, ttl: Duration, now: DateTime<Utc>) {
        let mut entries = self.entries.write();

        if ttl.is_zero() {
            entries.remove(&key);
            return;
        }

        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Number of stored entries, including expired ones not yet replaced.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }
}
