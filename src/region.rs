// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The shared cache region: bounds-checked byte and little-endian integer
// access over one named shm mapping. Performs no locking — callers hold the
// appropriate named locks.

use std::io;

use crate::error::{CacheError, Result};
use crate::platform::PlatformShm;

/// Suffix appended to the cache name to form the region segment's name.
const REGION_SUFFIX: &str = "_region";

/// A named, multi-process shared byte region.
///
/// All persistent cache state lives inside this region; the engine addresses
/// it with byte offsets and fixed-width little-endian integers. The region
/// outlives its attachments — it is only removed by [`SharedRegion::unlink`]
/// (reached through the cache's `destroy`).
pub struct SharedRegion {
    shm: PlatformShm,
    size: u64,
}

impl SharedRegion {
    /// Attach to (or create) the region for `cache_name`.
    ///
    /// A brand-new region is sized to `desired_size` (rounded up to 8 bytes)
    /// and comes back zero-filled from the kernel; an existing region keeps
    /// the size its creator chose. `created()` tells the caller whether the
    /// zone structures still need to be initialised.
    pub fn open(cache_name: &str, desired_size: usize) -> Result<Self> {
        let size = desired_size.checked_add(7).ok_or(CacheError::Os(io::Error::new(
            io::ErrorKind::InvalidInput,
            "region size overflow",
        )))? & !7;
        let name = format!("{cache_name}{REGION_SUFFIX}");
        let shm = PlatformShm::acquire(&name, size, true).map_err(CacheError::Os)?;
        let size = shm.user_size() as u64;
        Ok(Self { shm, size })
    }

    /// Whether this attachment created the region (and must initialise it).
    pub fn created(&self) -> bool {
        self.shm.is_creator()
    }

    /// Total region size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(CacheError::RegionCorrupt("access beyond region bounds")),
        }
    }

    /// Read `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.shm.as_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                len,
            );
        }
        Ok(buf)
    }

    /// Read exactly `buf.len()` bytes at `offset` into `buf`.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.shm.as_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Write `bytes` at `offset`.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.shm.as_mut_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Read a little-endian `u64` at `offset`.
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian `u64` at `offset`.
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Read a single byte at `offset`.
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_into(offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Write a single byte at `offset`.
    pub fn write_u8(&self, offset: u64, value: u8) -> Result<()> {
        self.write(offset, &[value])
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: u64, len: usize) -> Result<()> {
        self.check(offset, len)?;
        unsafe {
            std::ptr::write_bytes(self.shm.as_mut_ptr().add(offset as usize), 0, len);
        }
        Ok(())
    }

    /// Remove the backing OS object. Existing mappings stay valid until the
    /// last attachment drops; new attachments will create a fresh region.
    pub fn unlink(&self) {
        self.shm.unlink();
    }

    /// Remove the region segment for `cache_name` without an open handle.
    pub fn clear_storage(cache_name: &str) {
        PlatformShm::unlink_by_name(&format!("{cache_name}{REGION_SUFFIX}"));
    }
}
