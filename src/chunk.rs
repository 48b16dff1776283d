// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Chunk header codec. A chunk is addressed by its zones-area offset:
//
//   key            : [u8; 200]   NUL-padded
//   hash_next      : u64         zones-area offset of the next chunk in the
//                                same hash bucket, 0 = end of chain
//   val_alloc_size : u64         reserved payload bytes
//   val_size       : u64         actual payload bytes, 0 = chunk is free
//   flags          : u8          bit 0 = value is serialized
//   payload        : [u8; val_alloc_size]

use crate::error::{CacheError, Result};
use crate::layout::{
    RegionLayout, CHUNK_META_SIZE, LONG_SIZE, MAX_KEY_LENGTH, MAX_VALUE_SIZE,
    MIN_VALUE_ALLOC_SIZE,
};
use crate::region::SharedRegion;

const KEY_OFFSET: u64 = 0;
const HASH_NEXT_OFFSET: u64 = MAX_KEY_LENGTH as u64;
const VAL_ALLOC_OFFSET: u64 = HASH_NEXT_OFFSET + LONG_SIZE;
const VAL_SIZE_OFFSET: u64 = VAL_ALLOC_OFFSET + LONG_SIZE;
const FLAGS_OFFSET: u64 = VAL_SIZE_OFFSET + LONG_SIZE;
const PAYLOAD_OFFSET: u64 = CHUNK_META_SIZE;

/// Flag bit: the payload is a serialized value, not a raw byte string.
pub const FLAG_SERIALIZED: u8 = 0b0000_0001;

/// A decoded chunk header.
#[derive(Clone)]
pub struct ChunkHeader {
    pub key: [u8; MAX_KEY_LENGTH],
    pub hash_next: u64,
    pub val_alloc_size: u64,
    pub val_size: u64,
    pub flags: u8,
}

impl ChunkHeader {
    /// The key without its NUL padding.
    pub fn key_bytes(&self) -> &[u8] {
        let len = self
            .key
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_KEY_LENGTH);
        &self.key[..len]
    }

    /// Whether the chunk holds a live entry.
    pub fn is_live(&self) -> bool {
        self.val_size > 0
    }

    pub fn is_serialized(&self) -> bool {
        self.flags & FLAG_SERIALIZED != 0
    }

    /// Total footprint of the chunk within its zone.
    pub fn total_size(&self) -> u64 {
        CHUNK_META_SIZE + self.val_alloc_size
    }
}

fn check_chunk(layout: &RegionLayout, off: u64) -> Result<()> {
    if off
        .checked_add(CHUNK_META_SIZE)
        .map_or(true, |end| end > layout.zones_area_size())
    {
        return Err(CacheError::RegionCorrupt("chunk offset beyond zones area"));
    }
    Ok(())
}

/// Read the full header of the chunk at `off`.
pub fn read_header(region: &SharedRegion, layout: &RegionLayout, off: u64) -> Result<ChunkHeader> {
    check_chunk(layout, off)?;
    let base = layout.zones_region_offset(off);
    let mut raw = [0u8; CHUNK_META_SIZE as usize];
    region.read_into(base, &mut raw)?;

    let mut key = [0u8; MAX_KEY_LENGTH];
    key.copy_from_slice(&raw[..MAX_KEY_LENGTH]);
    let word = |at: u64| {
        let at = at as usize;
        let mut b = [0u8; 8];
        b.copy_from_slice(&raw[at..at + 8]);
        u64::from_le_bytes(b)
    };

    let header = ChunkHeader {
        key,
        hash_next: word(HASH_NEXT_OFFSET),
        val_alloc_size: word(VAL_ALLOC_OFFSET),
        val_size: word(VAL_SIZE_OFFSET),
        flags: raw[FLAGS_OFFSET as usize],
    };
    if header.val_alloc_size > MAX_VALUE_SIZE || header.val_alloc_size < MIN_VALUE_ALLOC_SIZE {
        return Err(CacheError::RegionCorrupt("chunk allocation size out of range"));
    }
    if header.val_size > header.val_alloc_size {
        return Err(CacheError::RegionCorrupt("chunk value larger than its allocation"));
    }
    if header.hash_next == off {
        return Err(CacheError::RegionCorrupt("chunk links to itself"));
    }
    Ok(header)
}

/// Overwrite the chunk at `off` with a free chunk of `val_alloc_size`.
/// Clears the key, the chain link and the flags in one write.
pub fn write_free_header(
    region: &SharedRegion,
    layout: &RegionLayout,
    off: u64,
    val_alloc_size: u64,
) -> Result<()> {
    check_chunk(layout, off)?;
    let mut raw = [0u8; CHUNK_META_SIZE as usize];
    raw[VAL_ALLOC_OFFSET as usize..VAL_ALLOC_OFFSET as usize + 8]
        .copy_from_slice(&val_alloc_size.to_le_bytes());
    region.write(layout.zones_region_offset(off), &raw)
}

/// Write the key field, NUL-padded. `key` must already be validated.
pub fn write_key(region: &SharedRegion, layout: &RegionLayout, off: u64, key: &[u8]) -> Result<()> {
    let mut padded = [0u8; MAX_KEY_LENGTH];
    padded[..key.len()].copy_from_slice(key);
    region.write(layout.zones_region_offset(off) + KEY_OFFSET, &padded)
}

pub fn read_hash_next(region: &SharedRegion, layout: &RegionLayout, off: u64) -> Result<u64> {
    check_chunk(layout, off)?;
    region.read_u64(layout.zones_region_offset(off) + HASH_NEXT_OFFSET)
}

pub fn write_hash_next(
    region: &SharedRegion,
    layout: &RegionLayout,
    off: u64,
    next: u64,
) -> Result<()> {
    check_chunk(layout, off)?;
    region.write_u64(layout.zones_region_offset(off) + HASH_NEXT_OFFSET, next)
}

pub fn read_val_alloc_size(region: &SharedRegion, layout: &RegionLayout, off: u64) -> Result<u64> {
    check_chunk(layout, off)?;
    region.read_u64(layout.zones_region_offset(off) + VAL_ALLOC_OFFSET)
}

pub fn write_val_alloc_size(
    region: &SharedRegion,
    layout: &RegionLayout,
    off: u64,
    alloc: u64,
) -> Result<()> {
    check_chunk(layout, off)?;
    region.write_u64(layout.zones_region_offset(off) + VAL_ALLOC_OFFSET, alloc)
}

pub fn read_val_size(region: &SharedRegion, layout: &RegionLayout, off: u64) -> Result<u64> {
    check_chunk(layout, off)?;
    region.read_u64(layout.zones_region_offset(off) + VAL_SIZE_OFFSET)
}

pub fn write_val_size(
    region: &SharedRegion,
    layout: &RegionLayout,
    off: u64,
    val_size: u64,
) -> Result<()> {
    check_chunk(layout, off)?;
    region.write_u64(layout.zones_region_offset(off) + VAL_SIZE_OFFSET, val_size)
}

pub fn write_flags(region: &SharedRegion, layout: &RegionLayout, off: u64, flags: u8) -> Result<()> {
    check_chunk(layout, off)?;
    region.write_u8(layout.zones_region_offset(off) + FLAGS_OFFSET, flags)
}

/// Read `len` payload bytes of the chunk at `off`.
pub fn read_payload(
    region: &SharedRegion,
    layout: &RegionLayout,
    off: u64,
    len: u64,
) -> Result<Vec<u8>> {
    region.read(layout.zones_region_offset(off) + PAYLOAD_OFFSET, len as usize)
}

/// Write the payload bytes of the chunk at `off`.
pub fn write_payload(
    region: &SharedRegion,
    layout: &RegionLayout,
    off: u64,
    value: &[u8],
) -> Result<()> {
    region.write(layout.zones_region_offset(off) + PAYLOAD_OFFSET, value)
}
