// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-bucket separate-chaining hash index. Bucket heads live in the bucket
// table; chains thread through the chunks' hash_next fields, which belong to
// the bucket lock. Key and size fields belong to the chunk's zone lock, so
// chain walks that inspect them take a short zone read lock per chunk.

use crate::chunk::{self, ChunkHeader};
use crate::error::{CacheError, Result};
use crate::layout::{RegionLayout, BUCKET_COUNT};
use crate::locks::LockManager;
use crate::region::SharedRegion;

/// Bucket assignment: CRC32 (IEEE) of the key, modulo the bucket count.
/// Fixed by the on-region format — all attachments must agree on it.
pub fn bucket_of(key: &[u8]) -> usize {
    crc32fast::hash(key) as usize % BUCKET_COUNT
}

/// Index operations over the region. Callers hold the relevant bucket lock;
/// zone locks are taken internally where chunk fields are read.
pub struct HashIndex<'a> {
    pub region: &'a SharedRegion,
    pub layout: &'a RegionLayout,
}

impl<'a> HashIndex<'a> {
    pub fn new(region: &'a SharedRegion, layout: &'a RegionLayout) -> Self {
        Self { region, layout }
    }

    /// Head offset of `bucket`'s chain, 0 when empty.
    pub fn bucket_head(&self, bucket: usize) -> Result<u64> {
        self.region.read_u64(self.layout.bucket_offset(bucket))
    }

    pub fn set_bucket_head(&self, bucket: usize, off: u64) -> Result<()> {
        self.region.write_u64(self.layout.bucket_offset(bucket), off)
    }

    /// Find the chunk holding `key` in `bucket`.
    ///
    /// Caller holds the bucket lock (read or write). Keys are compared in
    /// full, under a short per-chunk zone read lock.
    pub fn find(
        &self,
        locks: &LockManager,
        bucket: usize,
        key: &[u8],
    ) -> Result<Option<(u64, ChunkHeader)>> {
        let mut off = self.bucket_head(bucket)?;
        let mut steps = 0u64;
        while off != 0 {
            let header = {
                let zone = locks.zone(self.layout.zone_of(off))?;
                let _zg = zone.read_guard()?;
                chunk::read_header(self.region, self.layout, off)?
            };
            if header.is_live() && header.key_bytes() == key {
                return Ok(Some((off, header)));
            }
            off = header.hash_next;
            steps += 1;
            if steps > self.layout.max_chunk_count() {
                return Err(CacheError::RegionCorrupt("hash chain does not terminate"));
            }
        }
        Ok(None)
    }

    /// Append the chunk at `off` to `bucket`'s chain.
    ///
    /// Caller holds the bucket write lock; the chunk's `hash_next` must
    /// already be 0 and the chunk must not be reachable from any bucket.
    pub fn link(&self, bucket: usize, off: u64) -> Result<()> {
        let head = self.bucket_head(bucket)?;
        if head == 0 {
            return self.set_bucket_head(bucket, off);
        }
        let mut tail = head;
        let mut steps = 0u64;
        loop {
            debug_assert_ne!(tail, off, "chunk already linked");
            let next = chunk::read_hash_next(self.region, self.layout, tail)?;
            if next == 0 {
                break;
            }
            tail = next;
            steps += 1;
            if steps > self.layout.max_chunk_count() {
                return Err(CacheError::RegionCorrupt("hash chain does not terminate"));
            }
        }
        chunk::write_hash_next(self.region, self.layout, tail, off)
    }

    /// Remove the chunk at `off` from `bucket`'s chain and clear its link
    /// field. The chunk's current link is re-read here — a caller-side
    /// snapshot may predate earlier unlinks in the same chain.
    ///
    /// Caller holds the bucket write lock.
    pub fn unlink(&self, bucket: usize, off: u64) -> Result<()> {
        let next = chunk::read_hash_next(self.region, self.layout, off)?;
        let head = self.bucket_head(bucket)?;
        if head == off {
            self.set_bucket_head(bucket, next)?;
        } else {
            let mut prev = head;
            let mut steps = 0u64;
            loop {
                if prev == 0 {
                    return Err(CacheError::RegionCorrupt("unlinked chunk not in its bucket"));
                }
                let prev_next = chunk::read_hash_next(self.region, self.layout, prev)?;
                if prev_next == off {
                    break;
                }
                prev = prev_next;
                steps += 1;
                if steps > self.layout.max_chunk_count() {
                    return Err(CacheError::RegionCorrupt("hash chain does not terminate"));
                }
            }
            chunk::write_hash_next(self.region, self.layout, prev, next)?;
        }
        chunk::write_hash_next(self.region, self.layout, off, 0)
    }
}
