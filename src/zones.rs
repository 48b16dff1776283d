// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The zones area: a ring of fixed-size allocation arenas. Each zone is a
// bump allocator whose `used_space` header is the stack pointer; everything
// below it is allocated (live or fragmented-free), everything above it is
// one or more free chunks ending exactly at the zone boundary.

use crate::chunk;
use crate::error::{CacheError, Result};
use crate::layout::{RegionLayout, CHUNK_META_SIZE, MAX_CHUNK_SIZE, MAX_VALUE_SIZE, MIN_CHUNK_SIZE};
use crate::region::SharedRegion;

/// Zone-level view over the region. Callers hold the zone (and, where
/// required, `oldest_zone_index`) locks; nothing here locks.
pub struct Zones<'a> {
    pub region: &'a SharedRegion,
    pub layout: &'a RegionLayout,
}

impl<'a> Zones<'a> {
    pub fn new(region: &'a SharedRegion, layout: &'a RegionLayout) -> Self {
        Self { region, layout }
    }

    /// The `oldest_zone_index` meta field. Caller holds its lock.
    pub fn oldest_index(&self) -> Result<u64> {
        let idx = self
            .region
            .read_u64(self.layout.oldest_zone_index_offset())?;
        if idx >= self.layout.zone_count {
            return Err(CacheError::RegionCorrupt("oldest zone index out of range"));
        }
        Ok(idx)
    }

    pub fn set_oldest_index(&self, idx: u64) -> Result<()> {
        debug_assert!(idx < self.layout.zone_count);
        self.region
            .write_u64(self.layout.oldest_zone_index_offset(), idx)
    }

    /// Zone `zone`'s stack pointer. Caller holds the zone lock.
    pub fn used_space(&self, zone: u64) -> Result<u64> {
        let used = self
            .region
            .read_u64(self.layout.zones_region_offset(self.layout.zone_start(zone)))?;
        if used > MAX_CHUNK_SIZE {
            return Err(CacheError::RegionCorrupt("zone used_space out of range"));
        }
        Ok(used)
    }

    pub fn set_used_space(&self, zone: u64, used: u64) -> Result<()> {
        debug_assert!(used <= MAX_CHUNK_SIZE);
        self.region
            .write_u64(self.layout.zones_region_offset(self.layout.zone_start(zone)), used)
    }

    /// Zones-area offset of the first free byte — the chunk at the top of
    /// the stack. Only meaningful while `used_space < MAX_CHUNK_SIZE`.
    pub fn free_chunk_offset(&self, zone: u64, used: u64) -> u64 {
        self.layout.zone_chunks_start(zone) + used
    }

    /// Reset `zone` to its post-creation state: empty stack, one free chunk
    /// spanning the whole zone. Caller holds the zone's write lock.
    pub fn reset_zone(&self, zone: u64) -> Result<()> {
        self.set_used_space(zone, 0)?;
        chunk::write_free_header(
            self.region,
            self.layout,
            self.layout.zone_chunks_start(zone),
            MAX_VALUE_SIZE,
        )
    }

    /// Initialise every zone and the ring pointer. Runs once, on the
    /// attachment that created the region, under the `everything` write lock.
    pub fn init_all(&self) -> Result<()> {
        for zone in 0..self.layout.zone_count {
            self.reset_zone(zone)?;
        }
        self.set_oldest_index(0)
    }

    /// Grow the free chunk at `off` by absorbing every directly following
    /// free chunk within the same zone. Returns the resulting
    /// `val_alloc_size`. Caller holds the zone's write lock.
    pub fn merge_chunk_with_next_free(&self, off: u64) -> Result<u64> {
        let zone_end = self.layout.zone_end(self.layout.zone_of(off));
        let mut alloc = chunk::read_val_alloc_size(self.region, self.layout, off)?;
        loop {
            let next = off + CHUNK_META_SIZE + alloc;
            if next == zone_end {
                break;
            }
            if next + CHUNK_META_SIZE > zone_end {
                return Err(CacheError::RegionCorrupt("chunk tiling overruns its zone"));
            }
            if chunk::read_val_size(self.region, self.layout, next)? != 0 {
                break;
            }
            let next_alloc = chunk::read_val_alloc_size(self.region, self.layout, next)?;
            alloc += CHUNK_META_SIZE + next_alloc;
        }
        chunk::write_val_alloc_size(self.region, self.layout, off, alloc)?;
        Ok(alloc)
    }

    /// Shrink the chunk at `off` to `keep_alloc` payload bytes, turning the
    /// slack into a trailing free chunk — but only when the slack can hold a
    /// whole minimum chunk; otherwise the chunk keeps its allocation.
    /// Returns the chunk's final `val_alloc_size`.
    /// Caller holds the zone's write lock.
    pub fn split_chunk(&self, off: u64, keep_alloc: u64) -> Result<u64> {
        let alloc = chunk::read_val_alloc_size(self.region, self.layout, off)?;
        debug_assert!(keep_alloc <= alloc);
        let slack = alloc - keep_alloc;
        if slack < MIN_CHUNK_SIZE {
            return Ok(alloc);
        }
        let tail = off + CHUNK_META_SIZE + keep_alloc;
        chunk::write_free_header(self.region, self.layout, tail, slack - CHUNK_META_SIZE)?;
        chunk::write_val_alloc_size(self.region, self.layout, off, keep_alloc)?;
        // The tail may sit directly before older free chunks.
        self.merge_chunk_with_next_free(tail)?;
        Ok(keep_alloc)
    }

    /// Walk every chunk of `zone`, calling `f(offset, header)` for each.
    /// Verifies the tiling covers the zone exactly. Caller holds at least
    /// the zone's read lock.
    pub fn walk_zone<F>(&self, zone: u64, mut f: F) -> Result<()>
    where
        F: FnMut(u64, &chunk::ChunkHeader) -> Result<()>,
    {
        let mut off = self.layout.zone_chunks_start(zone);
        let zone_end = self.layout.zone_end(zone);
        while off < zone_end {
            let header = chunk::read_header(self.region, self.layout, off)?;
            f(off, &header)?;
            let next = off + header.total_size();
            if next > zone_end {
                return Err(CacheError::RegionCorrupt("chunk tiling overruns its zone"));
            }
            off = next;
        }
        Ok(())
    }
}
