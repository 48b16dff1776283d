// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Registry of the named locks one cache attachment uses. The three core
// locks are opened eagerly; bucket and zone locks are opened on first use
// and cached for the lifetime of the attachment.

use std::cell::OnceCell;

use crate::error::{CacheError, Result};
use crate::layout::BUCKET_COUNT;
use crate::rwlock::NamedRwLock;

fn tag(prefix: &str, suffix: &str) -> String {
    format!("{prefix}_lock_{suffix}")
}

/// Per-attachment lock registry.
///
/// Tags are derived from the cache name, so independent caches never share
/// locks. Each tag is instantiated at most once per attachment — the
/// reentrancy counters of [`NamedRwLock`] depend on that.
pub struct LockManager {
    prefix: String,
    everything: NamedRwLock,
    stats: NamedRwLock,
    oldest_zone_index: NamedRwLock,
    buckets: Vec<OnceCell<NamedRwLock>>,
    zones: Vec<OnceCell<NamedRwLock>>,
}

impl LockManager {
    /// Open the core locks for `cache_name`. Zone locks become available
    /// after [`LockManager::with_zone_count`], once the region layout is
    /// known.
    pub fn open_core(cache_name: &str) -> Result<Self> {
        let everything = NamedRwLock::open(&tag(cache_name, "everything"))?;
        let stats = NamedRwLock::open(&tag(cache_name, "stats"))?;
        let oldest_zone_index = NamedRwLock::open(&tag(cache_name, "oldestzoneindex"))?;
        let buckets = (0..BUCKET_COUNT).map(|_| OnceCell::new()).collect();
        Ok(Self {
            prefix: cache_name.to_string(),
            everything,
            stats,
            oldest_zone_index,
            buckets,
            zones: Vec::new(),
        })
    }

    /// Size the zone-lock table once the zone count is known.
    pub fn with_zone_count(mut self, zone_count: usize) -> Self {
        self.zones = (0..zone_count).map(|_| OnceCell::new()).collect();
        self
    }

    /// The whole-region lock: read-held by every normal operation,
    /// write-held by flush/destroy.
    pub fn everything(&self) -> &NamedRwLock {
        &self.everything
    }

    /// The hit/miss counter lock.
    pub fn stats(&self) -> &NamedRwLock {
        &self.stats
    }

    /// The `oldest_zone_index` meta-field lock.
    pub fn oldest_zone_index(&self) -> &NamedRwLock {
        &self.oldest_zone_index
    }

    /// The lock for bucket `i`, opened on first use.
    pub fn bucket(&self, i: usize) -> Result<&NamedRwLock> {
        let cell = self
            .buckets
            .get(i)
            .ok_or(CacheError::RegionCorrupt("bucket index out of range"))?;
        if let Some(lock) = cell.get() {
            return Ok(lock);
        }
        let lock = NamedRwLock::open(&tag(&self.prefix, &format!("bucket{i}")))?;
        Ok(cell.get_or_init(|| lock))
    }

    /// The lock for zone `i`, opened on first use.
    pub fn zone(&self, i: u64) -> Result<&NamedRwLock> {
        let cell = self
            .zones
            .get(i as usize)
            .ok_or(CacheError::RegionCorrupt("zone index out of range"))?;
        if let Some(lock) = cell.get() {
            return Ok(lock);
        }
        let lock = NamedRwLock::open(&tag(&self.prefix, &format!("zone{i}")))?;
        Ok(cell.get_or_init(|| lock))
    }

    /// Unlink the shared memory behind every lock this cache can name.
    /// Used by `destroy` so a later attachment starts from clean state.
    pub fn clear_storage(&self) {
        NamedRwLock::clear_storage(&tag(&self.prefix, "everything"));
        NamedRwLock::clear_storage(&tag(&self.prefix, "stats"));
        NamedRwLock::clear_storage(&tag(&self.prefix, "oldestzoneindex"));
        for i in 0..self.buckets.len() {
            NamedRwLock::clear_storage(&tag(&self.prefix, &format!("bucket{i}")));
        }
        for i in 0..self.zones.len() {
            NamedRwLock::clear_storage(&tag(&self.prefix, &format!("zone{i}")));
        }
    }
}
