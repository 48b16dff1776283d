// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// On-region layout: fixed constants plus the offsets derived from the region
// size. All multi-byte fields in the region are little-endian u64 ("long").

use std::time::Duration;

use crate::error::{CacheError, Result};

/// Width of a "long" region field in bytes.
pub const LONG_SIZE: u64 = 8;

/// Number of hash buckets. Fixed by the on-region format.
pub const BUCKET_COUNT: usize = 512;

/// Size of one zone — the unit of FIFO eviction.
pub const ZONE_SIZE: u64 = 1024 * 1024;

/// Maximum key length in bytes. Keys are stored NUL-padded to this width.
pub const MAX_KEY_LENGTH: usize = 200;

/// Smallest payload reservation a chunk may carry.
pub const MIN_VALUE_ALLOC_SIZE: u64 = 128;

/// Bytes of chunk metadata preceding the payload:
/// key, hash_next, val_alloc_size, val_size, flags.
pub const CHUNK_META_SIZE: u64 = MAX_KEY_LENGTH as u64 + 3 * LONG_SIZE + 1;

/// Smallest chunk that may exist after a split.
pub const MIN_CHUNK_SIZE: u64 = CHUNK_META_SIZE + MIN_VALUE_ALLOC_SIZE;

/// Largest chunk: a whole zone minus its `used_space` header.
pub const MAX_CHUNK_SIZE: u64 = ZONE_SIZE - LONG_SIZE;

/// Largest storable value.
pub const MAX_VALUE_SIZE: u64 = MAX_CHUNK_SIZE - CHUNK_META_SIZE;

/// Smallest supported region.
pub const MIN_REGION_SIZE: usize = 16 * 1024 * 1024;

/// How long the eviction walk keeps retrying bucket try-locks before the
/// enclosing operation fails with `LockTimeout`.
pub const TRYLOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Padded width of the meta and stats areas, and of each safe gap.
const PADDED_AREA: u64 = 1024;

/// Byte offsets of the region's areas, derived once per attachment.
///
/// ```text
/// 0                meta      (oldest_zone_index)        1024 padded
/// 1024             safe gap                             1024
/// 2048             stats     (get_hits, get_misses)     1024 padded
/// 3072             safe gap                             1024
/// 4096             bucket table                         512 × 8
/// 8192             safe gap                             1024
/// 9216             zones                                zone_count × 1 MiB
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub region_size: u64,
    pub meta_offset: u64,
    pub stats_offset: u64,
    pub buckets_offset: u64,
    pub zones_offset: u64,
    pub zone_count: u64,
}

impl RegionLayout {
    /// Compute the layout for a region of `region_size` bytes.
    /// Rejects regions below 16 MiB.
    pub fn for_size(region_size: u64) -> Result<Self> {
        if region_size < MIN_REGION_SIZE as u64 {
            return Err(CacheError::RegionTooSmall(region_size as usize));
        }
        let meta_offset = 0;
        let stats_offset = meta_offset + PADDED_AREA + PADDED_AREA;
        let buckets_offset = stats_offset + PADDED_AREA + PADDED_AREA;
        let zones_offset = buckets_offset + BUCKET_COUNT as u64 * LONG_SIZE + PADDED_AREA;
        let zone_count = (region_size - zones_offset) / ZONE_SIZE;
        if zone_count < 2 {
            // Unreachable behind the 16 MiB floor; kept as a layout sanity net.
            return Err(CacheError::RegionTooSmall(region_size as usize));
        }
        Ok(Self {
            region_size,
            meta_offset,
            stats_offset,
            buckets_offset,
            zones_offset,
            zone_count,
        })
    }

    /// Region offset of the `oldest_zone_index` meta field.
    pub fn oldest_zone_index_offset(&self) -> u64 {
        self.meta_offset
    }

    /// Region offset of the `get_hits` counter.
    pub fn hits_offset(&self) -> u64 {
        self.stats_offset
    }

    /// Region offset of the `get_misses` counter.
    pub fn misses_offset(&self) -> u64 {
        self.stats_offset + LONG_SIZE
    }

    /// Region offset of bucket `i`'s head field.
    pub fn bucket_offset(&self, bucket: usize) -> u64 {
        self.buckets_offset + bucket as u64 * LONG_SIZE
    }

    /// Total size of the zones area.
    pub fn zones_area_size(&self) -> u64 {
        self.zone_count * ZONE_SIZE
    }

    /// Convert a zones-area offset into a region offset.
    pub fn zones_region_offset(&self, zones_offset: u64) -> u64 {
        self.zones_offset + zones_offset
    }

    /// The zone a zones-area offset falls into.
    pub fn zone_of(&self, zones_offset: u64) -> u64 {
        zones_offset / ZONE_SIZE
    }

    /// Zones-area offset of zone `zone`'s `used_space` header.
    pub fn zone_start(&self, zone: u64) -> u64 {
        zone * ZONE_SIZE
    }

    /// Zones-area offset of zone `zone`'s first chunk.
    pub fn zone_chunks_start(&self, zone: u64) -> u64 {
        zone * ZONE_SIZE + LONG_SIZE
    }

    /// Zones-area offset one past zone `zone`'s last byte.
    pub fn zone_end(&self, zone: u64) -> u64 {
        (zone + 1) * ZONE_SIZE
    }

    /// The zone index preceding `oldest` on the ring — the newest zone.
    pub fn newest_zone(&self, oldest: u64) -> u64 {
        (oldest + self.zone_count - 1) % self.zone_count
    }

    /// Upper bound on chunks the region can hold; used as a cycle guard
    /// when walking hash chains.
    pub fn max_chunk_count(&self) -> u64 {
        self.zone_count * (MAX_CHUNK_SIZE / MIN_CHUNK_SIZE + 1)
    }
}
