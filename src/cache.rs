// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Public cache handle. Thin wrappers over the engine; the engine owns the
// lock protocol.

use std::time::Duration;

use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::layout::{MIN_REGION_SIZE, TRYLOCK_TIMEOUT};
use crate::region::SharedRegion;
use crate::stats::CacheStats;

pub use crate::engine::Value;

/// Attachment options beyond the defaults of [`Cache::open`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    size: usize,
    trylock_timeout: Duration,
}

impl CacheOptions {
    /// Options for a cache of `size` bytes (16 MiB minimum).
    pub fn new(size: usize) -> Self {
        Self {
            size,
            trylock_timeout: TRYLOCK_TIMEOUT,
        }
    }

    /// Override how long eviction keeps retrying contended bucket
    /// try-locks before the operation fails with `LockTimeout`.
    pub fn trylock_timeout(mut self, timeout: Duration) -> Self {
        self.trylock_timeout = timeout;
        self
    }
}

/// One attachment to a named shared-memory cache.
///
/// Every process (or thread) that names the same cache shares the same
/// region and the same named locks; each opens its own `Cache` handle.
/// The handle is deliberately `!Sync` — its lock handles carry per-handle
/// reentrancy counters — so it cannot be shared between threads. Opening a
/// second handle to the same name is cheap and is the supported way to use
/// one cache from several threads.
///
/// Items never expire. When the region fills up, the oldest *zone* (1 MiB
/// of storage) is reclaimed wholesale, FIFO.
pub struct Cache {
    engine: CacheEngine,
    name: String,
}

impl Cache {
    /// Attach to (or create) the cache named `name` with a region of
    /// `size` bytes. The creator's size wins for existing caches.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::open_with(name, CacheOptions::new(size))
    }

    /// Attach with explicit [`CacheOptions`].
    pub fn open_with(name: &str, options: CacheOptions) -> Result<Self> {
        if options.size < MIN_REGION_SIZE {
            return Err(CacheError::RegionTooSmall(options.size));
        }
        let engine = CacheEngine::open(name, options.size, options.trylock_timeout)?;
        Ok(Self {
            engine,
            name: name.to_string(),
        })
    }

    /// The cache name this handle was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `value` under `key`, overwriting any existing entry.
    ///
    /// `serialized` is opaque metadata returned verbatim by [`Cache::get`];
    /// callers that serialize non-byte values use it to mark the encoding.
    pub fn set(&self, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        self.engine.set(key, value, serialized)
    }

    /// Fetch the entry under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.engine.get(key)
    }

    /// Like [`Cache::set`], but fails with `AlreadyExists` if the key is
    /// present.
    pub fn add(&self, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        self.engine.add(key, value, serialized)
    }

    /// Like [`Cache::set`], but fails with `NotFound` if the key is absent.
    pub fn replace(&self, key: &[u8], value: &[u8], serialized: bool) -> Result<()> {
        self.engine.replace(key, value, serialized)
    }

    /// Remove the entry under `key`. Fails with `NotFound` if absent.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.engine.delete(key)
    }

    /// Whether `key` has an entry. Does not touch the hit/miss counters.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.engine.exists(key)
    }

    /// Add `delta` to the decimal value under `key`, flooring at 0, and
    /// return the new value. A missing key starts from `initial + delta`;
    /// a non-decimal value fails with `NotNumeric`.
    pub fn increment(&self, key: &[u8], delta: i64, initial: i64) -> Result<i64> {
        self.engine.incr_decr(key, delta, initial, true)
    }

    /// Subtract `delta` from the decimal value under `key`, flooring at 0,
    /// and return the new value. A missing key starts from `initial`.
    pub fn decrement(&self, key: &[u8], delta: i64, initial: i64) -> Result<i64> {
        self.engine.incr_decr(key, delta.wrapping_neg(), initial, false)
    }

    /// Fetch several keys in one call. Returns one entry per found key,
    /// in input order; missing keys are skipped.
    pub fn get_multi<'k, I>(&self, keys: I) -> Result<Vec<(&'k [u8], Value)>>
    where
        I: IntoIterator<Item = &'k [u8]>,
    {
        let mut found = Vec::new();
        for key in keys {
            if let Some(value) = self.engine.get(key)? {
                found.push((key, value));
            }
        }
        Ok(found)
    }

    /// Store several entries in one call. Stops at the first failure;
    /// earlier entries stay stored.
    pub fn set_multi<'k, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'k [u8], &'k [u8])>,
    {
        for (key, value) in entries {
            self.engine.set(key, value, false)?;
        }
        Ok(())
    }

    /// Drop every entry, resetting zones and buckets to their freshly
    /// created state. Hit/miss counters are monotonic and survive.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    /// Remove the cache's region and lock objects from the OS. Peer
    /// attachments keep working on their private mappings until they drop;
    /// new attachments will create a fresh cache.
    pub fn destroy(self) -> Result<()> {
        self.engine.destroy()
    }

    /// Aggregate statistics: live items, byte usage, hit/miss counters and
    /// the eviction ring position.
    pub fn stats(&self) -> Result<CacheStats> {
        self.engine.stats()
    }

    /// Write the buffered hit/miss deltas back to the shared counters now
    /// instead of waiting for drop.
    pub fn flush_stats(&self) -> Result<()> {
        self.engine.flush_stats()
    }

    /// Diagnostics: the region-internal offset of `key`'s chunk, if any.
    /// Observable equality of offsets across operations shows whether an
    /// entry was replaced in place.
    pub fn chunk_offset(&self, key: &[u8]) -> Result<Option<u64>> {
        self.engine.chunk_offset(key)
    }

    /// Walk the whole region and verify its structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()
    }

    /// Number of zones in this cache's region.
    pub fn zone_count(&self) -> u64 {
        self.engine.layout().zone_count
    }

    /// Remove a cache's region segment without attaching to it. Lock
    /// segments recycle themselves when their last user detaches; stale
    /// ones are re-initialised on the next attach.
    pub fn clear_storage(name: &str) {
        SharedRegion::clear_storage(name);
    }
}
