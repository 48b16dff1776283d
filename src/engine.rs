// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The cache engine: orchestrates region, index, zones and locks.
//
// Lock protocol (acquire order; releases may happen in any order):
//
//   everything → bucket → oldest_zone_index → zone
//
// `everything` is read-held by every normal operation and write-held only by
// flush/destroy (and region initialisation). At most one zone lock is held
// at a time. The eviction walk inverts zone → bucket, which is only legal
// via try-lock: on failure it backs out of the zone and oldest_zone_index
// locks entirely, sleeps briefly and retries, bounded by the try-lock
// timeout.

use std::cell::Cell;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::chunk::{self, FLAG_SERIALIZED};
use crate::error::{CacheError, Result};
use crate::index::{bucket_of, HashIndex};
use crate::layout::{
    RegionLayout, CHUNK_META_SIZE, MAX_KEY_LENGTH, MAX_VALUE_SIZE, MIN_VALUE_ALLOC_SIZE,
};
use crate::locks::LockManager;
use crate::region::SharedRegion;
use crate::stats::{CacheStats, StatsBuffer};
use crate::zones::Zones;

/// A value read back from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub bytes: Vec<u8>,
    pub serialized: bool,
}

/// Backoff between eviction retries after a bucket try-lock failure.
/// Short spin first, then millisecond sleeps (same shape the lock
/// primitives use for contended paths).
fn retry_yield(k: &mut u32) {
    if *k < 8 {
        std::hint::spin_loop();
    } else if *k < 16 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

pub(crate) struct CacheEngine {
    region: SharedRegion,
    layout: RegionLayout,
    locks: LockManager,
    stats: StatsBuffer,
    trylock_timeout: Duration,
    destroyed: Cell<bool>,
}

impl CacheEngine {
    /// Attach to (or create) the cache named `name`.
    ///
    /// The region is opened and, if this attachment created it, initialised
    /// — all under the `everything` write lock, so a concurrent attacher
    /// can never observe a half-initialised region.
    pub fn open(name: &str, desired_size: usize, trylock_timeout: Duration) -> Result<Self> {
        let locks = LockManager::open_core(name)?;

        let ev = locks.everything().write_guard()?;
        let region = SharedRegion::open(name, desired_size)?;
        let layout = RegionLayout::for_size(region.size())?;
        if region.created() {
            Zones::new(&region, &layout).init_all()?;
            debug!(
                "created cache '{}': {} bytes, {} zones",
                name,
                layout.region_size,
                layout.zone_count
            );
        } else {
            debug!(
                "attached to cache '{}': {} bytes, {} zones",
                name,
                layout.region_size,
                layout.zone_count
            );
        }
        drop(ev);

        let locks = locks.with_zone_count(layout.zone_count as usize);
        Ok(Self {
            region,
            layout,
            locks,
            stats: StatsBuffer::new(),
            trylock_timeout,
            destroyed: Cell::new(false),
        })
    }

    fn zones(&self) -> Zones<'_> {
        Zones::new(&self.region, &self.layout)
    }

    fn index(&self) -> HashIndex<'_> {
        HashIndex::new(&self.region, &self.layout)
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH || key.contains(&0) {
            return Err(CacheError::InvalidKey);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookup-side operations
    // -----------------------------------------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.read_guard()?;

        match self.index().find(&self.locks, bucket, key)? {
            Some((off, header)) => {
                let bytes = {
                    let zone = self.locks.zone(self.layout.zone_of(off))?;
                    let _zg = zone.read_guard()?;
                    chunk::read_payload(&self.region, &self.layout, off, header.val_size)?
                };
                self.stats.record_hit();
                Ok(Some(Value {
                    bytes,
                    serialized: header.is_serialized(),
                }))
            }
            None => {
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.read_guard()?;
        Ok(self.index().find(&self.locks, bucket, key)?.is_some())
    }

    /// Zones-area offset of `key`'s chunk. Diagnostics only — the offset is
    /// stale the moment the bucket lock is released.
    pub fn chunk_offset(&self, key: &[u8]) -> Result<Option<u64>> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.read_guard()?;
        Ok(self
            .index()
            .find(&self.locks, bucket, key)?
            .map(|(off, _)| off))
    }

    // -----------------------------------------------------------------------
    // Mutating operations
    // -----------------------------------------------------------------------

    pub fn set(&self, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.write_guard()?;
        self.set_locked(bucket, key, value, serialized)
    }

    pub fn add(&self, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.write_guard()?;
        if self.index().find(&self.locks, bucket, key)?.is_some() {
            return Err(CacheError::AlreadyExists);
        }
        if value.len() as u64 > MAX_VALUE_SIZE {
            return Err(CacheError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.insert_new(bucket, key, value, serialized)
    }

    pub fn replace(&self, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.write_guard()?;
        if self.index().find(&self.locks, bucket, key)?.is_none() {
            return Err(CacheError::NotFound);
        }
        self.set_locked(bucket, key, value, serialized)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.write_guard()?;
        match self.index().find(&self.locks, bucket, key)? {
            Some((off, _)) => self.remove_chunk(bucket, off),
            None => Err(CacheError::NotFound),
        }
    }

    /// Shared compound for increment/decrement. The whole read-modify-write
    /// runs under the bucket write lock. `seed_with_delta` controls what a
    /// missing key starts from: `initial + delta` (increment) or `initial`
    /// (decrement).
    pub fn incr_decr(
        &self,
        key: &[u8],
        delta: i64,
        initial: i64,
        seed_with_delta: bool,
    ) -> Result<i64> {
        Self::check_key(key)?;
        let _ev = self.locks.everything().read_guard()?;
        let bucket = bucket_of(key);
        let _bg = self.locks.bucket(bucket)?.write_guard()?;

        let new = match self.index().find(&self.locks, bucket, key)? {
            Some((off, header)) => {
                if header.is_serialized() {
                    return Err(CacheError::NotNumeric);
                }
                let bytes = {
                    let zone = self.locks.zone(self.layout.zone_of(off))?;
                    let _zg = zone.read_guard()?;
                    chunk::read_payload(&self.region, &self.layout, off, header.val_size)?
                };
                let current: i64 = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(CacheError::NotNumeric)?;
                current.saturating_add(delta).max(0)
            }
            None if seed_with_delta => initial.saturating_add(delta).max(0),
            None => initial.max(0),
        };

        self.set_locked(bucket, key, new.to_string().as_bytes(), false)?;
        Ok(new)
    }

    /// `set` body, entered with the bucket write lock held (directly or
    /// nested from incr_decr).
    fn set_locked(&self, bucket: usize, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        if let Some((off, header)) = self.index().find(&self.locks, bucket, key)? {
            if value.len() as u64 > MAX_VALUE_SIZE {
                // Failed sets drop the previous entry (Memcached semantics).
                self.remove_chunk(bucket, off)?;
                return Err(CacheError::ValueTooLarge {
                    len: value.len(),
                    max: MAX_VALUE_SIZE,
                });
            }
            if value.len() as u64 <= header.val_alloc_size {
                // Replace in place, keeping the chunk and its allocation.
                let zone = self.locks.zone(self.layout.zone_of(off))?;
                let _zg = zone.write_guard()?;
                chunk::write_payload(&self.region, &self.layout, off, value)?;
                chunk::write_val_size(&self.region, &self.layout, off, value.len() as u64)?;
                chunk::write_flags(
                    &self.region,
                    &self.layout,
                    off,
                    if serialized { FLAG_SERIALIZED } else { 0 },
                )?;
                return Ok(());
            }
            // Too big for the existing chunk: free it and reinsert.
            self.remove_chunk(bucket, off)?;
        } else if value.len() as u64 > MAX_VALUE_SIZE {
            return Err(CacheError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.insert_new(bucket, key, value, serialized)
    }

    /// Unlink the chunk at `off` from `bucket` and free it.
    /// Caller holds the bucket write lock.
    fn remove_chunk(&self, bucket: usize, off: u64) -> Result<()> {
        self.index().unlink(bucket, off)?;

        let zones = self.zones();
        let zone = self.layout.zone_of(off);
        let zone_lock = self.locks.zone(zone)?;
        let _zg = zone_lock.write_guard()?;

        chunk::write_val_size(&self.region, &self.layout, off, 0)?;
        chunk::write_key(&self.region, &self.layout, off, &[])?;
        chunk::write_flags(&self.region, &self.layout, off, 0)?;
        let alloc = zones.merge_chunk_with_next_free(off)?;

        // If the freed chunk now reaches the zone boundary it has absorbed
        // everything above the old stack pointer; pull the stack pointer
        // back so the zone's free space is bump-allocatable again.
        if off + CHUNK_META_SIZE + alloc == self.layout.zone_end(zone) {
            zones.set_used_space(zone, off - self.layout.zone_chunks_start(zone))?;
        }
        Ok(())
    }

    /// Allocate a fresh chunk for `value` in the newest zone, evicting the
    /// oldest zone as needed, and link it into `bucket`.
    /// Caller holds the bucket write lock.
    fn insert_new(&self, bucket: usize, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        let needed = (value.len() as u64).max(MIN_VALUE_ALLOC_SIZE);
        let deadline = Instant::now() + self.trylock_timeout;
        let mut k = 0u32;

        loop {
            let og = self.locks.oldest_zone_index().write_guard()?;
            let zones = self.zones();
            let oldest = zones.oldest_index()?;
            let newest = self.layout.newest_zone(oldest);

            {
                let zone_lock = self.locks.zone(newest)?;
                let zg = zone_lock.write_guard()?;
                if let Some(top) = self.try_bump(newest, needed)? {
                    self.write_new_chunk(newest, top, key, value, serialized, needed)?;
                    drop(zg);
                    drop(og);
                    return self.index().link(bucket, top);
                }
            }

            // The newest zone is out of room: wipe the oldest zone and make
            // it the new newest. The wipe may hit a bucket it cannot
            // try-lock; back out completely and retry.
            let zone_lock = self.locks.zone(oldest)?;
            let zg = zone_lock.write_guard()?;
            if self.wipe_zone(oldest)? {
                let zones = self.zones();
                zones.set_oldest_index((oldest + 1) % self.layout.zone_count)?;
                let top = zones.free_chunk_offset(oldest, 0);
                self.write_new_chunk(oldest, top, key, value, serialized, needed)?;
                drop(zg);
                drop(og);
                return self.index().link(bucket, top);
            }
            drop(zg);
            drop(og);

            if Instant::now() >= deadline {
                warn!(
                    "eviction of zone {} kept losing bucket try-locks for {:?}",
                    oldest, self.trylock_timeout
                );
                return Err(CacheError::LockTimeout(self.trylock_timeout));
            }
            retry_yield(&mut k);
        }
    }

    /// If the newest zone can hold a `needed`-byte allocation, return the
    /// offset of its top free chunk (merged as far as necessary).
    /// Caller holds the zone write lock.
    fn try_bump(&self, zone: u64, needed: u64) -> Result<Option<u64>> {
        let zones = self.zones();
        let used = zones.used_space(zone)?;
        if used + CHUNK_META_SIZE + needed > crate::layout::MAX_CHUNK_SIZE {
            return Ok(None);
        }
        let top = zones.free_chunk_offset(zone, used);
        if chunk::read_val_size(&self.region, &self.layout, top)? != 0 {
            return Err(CacheError::RegionCorrupt("stack pointer not at a free chunk"));
        }
        let mut alloc = chunk::read_val_alloc_size(&self.region, &self.layout, top)?;
        if alloc < needed {
            alloc = zones.merge_chunk_with_next_free(top)?;
        }
        Ok(if alloc >= needed { Some(top) } else { None })
    }

    /// Fill the free chunk at `top` with a live entry and bump the stack
    /// pointer past it. Caller holds the zone write lock; the chunk becomes
    /// reachable only when the caller links it.
    fn write_new_chunk(
        &self,
        zone: u64,
        top: u64,
        key: &[u8],
        value: &[u8],
        serialized: bool,
        needed: u64,
    ) -> Result<()> {
        let zones = self.zones();
        chunk::write_key(&self.region, &self.layout, top, key)?;
        chunk::write_hash_next(&self.region, &self.layout, top, 0)?;
        chunk::write_payload(&self.region, &self.layout, top, value)?;
        chunk::write_val_size(&self.region, &self.layout, top, value.len() as u64)?;
        chunk::write_flags(
            &self.region,
            &self.layout,
            top,
            if serialized { FLAG_SERIALIZED } else { 0 },
        )?;
        let final_alloc = zones.split_chunk(top, needed)?;
        let used = zones.used_space(zone)?;
        zones.set_used_space(zone, used + CHUNK_META_SIZE + final_alloc)
    }

    /// Unlink and free every live chunk in `zone`, then reset it to one
    /// full-zone free chunk. Returns `false` if a bucket try-lock failed —
    /// the caller must back out and retry. Chunks already freed by an
    /// earlier partial walk are skipped, so retries make progress.
    ///
    /// Caller holds the zone write lock and the oldest_zone_index write
    /// lock; bucket locks are taken per chunk via try-lock because this walk
    /// inverts the normal bucket → zone order.
    fn wipe_zone(&self, zone: u64) -> Result<bool> {
        let zones = self.zones();
        let index = self.index();

        let mut victims: Vec<(u64, usize)> = Vec::new();
        zones.walk_zone(zone, |off, header| {
            if header.is_live() {
                victims.push((off, bucket_of(header.key_bytes())));
            }
            Ok(())
        })?;

        let mut dropped = 0u64;
        for (off, bucket) in victims {
            let bucket_lock = self.locks.bucket(bucket)?;
            match bucket_lock.try_write_guard()? {
                Some(_bg) => {
                    index.unlink(bucket, off)?;
                    chunk::write_val_size(&self.region, &self.layout, off, 0)?;
                    chunk::write_key(&self.region, &self.layout, off, &[])?;
                    chunk::write_flags(&self.region, &self.layout, off, 0)?;
                    dropped += 1;
                }
                None => return Ok(false),
            }
        }

        zones.reset_zone(zone)?;
        debug!("evicted zone {zone} ({dropped} entries dropped)");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Whole-region operations
    // -----------------------------------------------------------------------

    /// Drop every entry and reset the zones and buckets to their
    /// post-creation state. Stops the world via the `everything` write lock.
    pub fn flush(&self) -> Result<()> {
        let _ev = self.locks.everything().write_guard()?;
        self.region.zero(
            self.layout.buckets_offset,
            crate::layout::BUCKET_COUNT * crate::layout::LONG_SIZE as usize,
        )?;
        self.zones().init_all()?;
        debug!("cache flushed");
        Ok(())
    }

    /// Remove the region and all lock segments. The engine is unusable
    /// afterwards; other attachments keep their mappings until they drop.
    pub fn destroy(&self) -> Result<()> {
        {
            let _ev = self.locks.everything().write_guard()?;
            self.region.unlink();
        }
        self.destroyed.set(true);
        self.locks.clear_storage();
        debug!("cache destroyed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statistics & validation
    // -----------------------------------------------------------------------

    /// Fold the buffered hit/miss deltas into the shared counters and return
    /// the totals.
    fn flush_and_read_counters(&self) -> Result<(u64, u64)> {
        let _sg = self.locks.stats().write_guard()?;
        let mut hits = self.region.read_u64(self.layout.hits_offset())?;
        let mut misses = self.region.read_u64(self.layout.misses_offset())?;
        let (dh, dm) = self.stats.take();
        if dh > 0 {
            hits += dh;
            self.region.write_u64(self.layout.hits_offset(), hits)?;
        }
        if dm > 0 {
            misses += dm;
            self.region.write_u64(self.layout.misses_offset(), misses)?;
        }
        Ok((hits, misses))
    }

    /// Write back buffered counters without reading anything else.
    pub fn flush_stats(&self) -> Result<()> {
        if !self.stats.is_dirty() {
            return Ok(());
        }
        let _ev = self.locks.everything().read_guard()?;
        self.flush_and_read_counters()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let _ev = self.locks.everything().read_guard()?;

        let mut items = 0u64;
        let mut used_value_bytes = 0u64;
        let mut used_alloc_bytes = 0u64;
        let zones = self.zones();
        for zone in 0..self.layout.zone_count {
            let zone_lock = self.locks.zone(zone)?;
            let _zg = zone_lock.read_guard()?;
            zones.walk_zone(zone, |_, header| {
                if header.is_live() {
                    items += 1;
                    used_value_bytes += header.val_size;
                    used_alloc_bytes += header.val_alloc_size;
                }
                Ok(())
            })?;
        }

        let oldest_zone_index = {
            let _og = self.locks.oldest_zone_index().read_guard()?;
            zones.oldest_index()?
        };
        let (hits, misses) = self.flush_and_read_counters()?;

        Ok(CacheStats {
            items,
            used_value_bytes,
            used_alloc_bytes,
            hits,
            misses,
            oldest_zone_index,
            zone_count: self.layout.zone_count,
            region_size: self.layout.region_size,
        })
    }

    /// Walk the whole region and check every structural invariant.
    /// Intended for tests and corruption triage, not hot paths.
    pub fn validate(&self) -> Result<()> {
        let _ev = self.locks.everything().read_guard()?;
        let zones = self.zones();

        {
            let _og = self.locks.oldest_zone_index().read_guard()?;
            zones.oldest_index()?; // range-checked on read
        }

        // Pass 1: per-zone tiling and chunk-local invariants.
        let mut live: std::collections::HashMap<u64, Vec<u8>> = std::collections::HashMap::new();
        for zone in 0..self.layout.zone_count {
            let zone_lock = self.locks.zone(zone)?;
            let _zg = zone_lock.read_guard()?;

            let used = zones.used_space(zone)?;
            let top = zones.free_chunk_offset(zone, used);
            let mut covered = 0u64;
            let mut top_seen = used >= crate::layout::MAX_CHUNK_SIZE;
            zones.walk_zone(zone, |off, header| {
                covered += header.total_size();
                if header.is_live() {
                    if header.key_bytes().is_empty() {
                        return Err(CacheError::RegionCorrupt("live chunk with empty key"));
                    }
                    live.insert(off, header.key_bytes().to_vec());
                } else if header.hash_next != 0 {
                    return Err(CacheError::RegionCorrupt("free chunk still linked"));
                }
                if off == top {
                    // The chunk at the stack pointer must be free and reach
                    // the zone boundary.
                    if header.is_live()
                        || off + header.total_size() != self.layout.zone_end(zone)
                    {
                        return Err(CacheError::RegionCorrupt(
                            "stack pointer does not sit on a zone-tail free chunk",
                        ));
                    }
                    top_seen = true;
                }
                Ok(())
            })?;
            if covered != crate::layout::MAX_CHUNK_SIZE {
                return Err(CacheError::RegionCorrupt("zone tiling does not cover the zone"));
            }
            if !top_seen {
                return Err(CacheError::RegionCorrupt("stack pointer not on a chunk boundary"));
            }
        }

        // Pass 2: every live chunk is reachable from exactly one chain, in
        // the bucket its key hashes to, and chains contain nothing else.
        let index = self.index();
        let mut reached: std::collections::HashSet<u64> = std::collections::HashSet::new();
        for bucket in 0..crate::layout::BUCKET_COUNT {
            let bucket_lock = self.locks.bucket(bucket)?;
            let _bg = bucket_lock.read_guard()?;
            let mut off = index.bucket_head(bucket)?;
            let mut steps = 0u64;
            while off != 0 {
                let key = live
                    .get(&off)
                    .ok_or(CacheError::RegionCorrupt("chain links to a non-live chunk"))?;
                if bucket_of(key) != bucket {
                    return Err(CacheError::RegionCorrupt("chunk chained in the wrong bucket"));
                }
                if !reached.insert(off) {
                    return Err(CacheError::RegionCorrupt("chunk reachable more than once"));
                }
                off = chunk::read_hash_next(&self.region, &self.layout, off)?;
                steps += 1;
                if steps > self.layout.max_chunk_count() {
                    return Err(CacheError::RegionCorrupt("hash chain does not terminate"));
                }
            }
        }
        if reached.len() != live.len() {
            return Err(CacheError::RegionCorrupt("live chunk not reachable from its bucket"));
        }
        Ok(())
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if !self.destroyed.get() {
            let _ = self.flush_stats();
        }
    }
}
