// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process read-write lock with reentrant nesting.
// The OS lock is touched only on the 0↔1 transitions of the per-handle
// counters; nested acquires and releases are pure counter arithmetic.

use std::cell::Cell;
use std::io;

use crate::error::{CacheError, Result};
use crate::platform::PlatformRwLock;

/// A tag-keyed read-write lock shared by every process that names the tag.
///
/// A handle supports *reentrant nesting*: a second `lock_write` from a handle
/// that already holds the write lock increments a counter and returns
/// immediately, and `lock_read` under a held write lock is granted the same
/// way (exclusive access subsumes shared). Upgrades (write while only read
/// is held) are refused.
///
/// The nesting counters live in the handle, so a handle must not be shared
/// between threads — `Cell` makes the type `!Sync`, which enforces exactly
/// that. Use one handle (one cache attachment) per thread.
pub struct NamedRwLock {
    inner: PlatformRwLock,
    tag: String,
    read_depth: Cell<u32>,
    write_depth: Cell<u32>,
}

impl NamedRwLock {
    /// Open (or create) the lock for `tag`.
    pub fn open(tag: &str) -> Result<Self> {
        let inner = PlatformRwLock::open(tag).map_err(CacheError::LockFailed)?;
        Ok(Self {
            inner,
            tag: tag.to_string(),
            read_depth: Cell::new(0),
            write_depth: Cell::new(0),
        })
    }

    /// The tag this lock was opened with.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn misuse(&self, what: &str) -> CacheError {
        CacheError::LockFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{what} on lock '{}'", self.tag),
        ))
    }

    /// Acquire shared access (blocking). Nested under an already-held read
    /// or write this only bumps the counter.
    pub fn lock_read(&self) -> Result<()> {
        if self.read_depth.get() > 0 || self.write_depth.get() > 0 {
            self.read_depth.set(self.read_depth.get() + 1);
            return Ok(());
        }
        self.inner.lock_read().map_err(CacheError::LockFailed)?;
        self.read_depth.set(1);
        Ok(())
    }

    /// Try to acquire shared access without blocking.
    pub fn try_lock_read(&self) -> Result<bool> {
        if self.read_depth.get() > 0 || self.write_depth.get() > 0 {
            self.read_depth.set(self.read_depth.get() + 1);
            return Ok(true);
        }
        if self.inner.try_lock_read().map_err(CacheError::LockFailed)? {
            self.read_depth.set(1);
            return Ok(true);
        }
        Ok(false)
    }

    /// Release one level of shared access.
    pub fn release_read(&self) -> Result<()> {
        let depth = self.read_depth.get();
        if depth == 0 {
            return Err(self.misuse("release_read without matching lock_read"));
        }
        self.read_depth.set(depth - 1);
        if depth == 1 && self.write_depth.get() == 0 {
            self.inner.unlock().map_err(CacheError::LockFailed)?;
        }
        Ok(())
    }

    /// Acquire exclusive access (blocking). Nested under an already-held
    /// write this only bumps the counter; under a read-only hold it fails.
    pub fn lock_write(&self) -> Result<()> {
        if self.write_depth.get() > 0 {
            self.write_depth.set(self.write_depth.get() + 1);
            return Ok(());
        }
        if self.read_depth.get() > 0 {
            return Err(self.misuse("read-to-write upgrade"));
        }
        self.inner.lock_write().map_err(CacheError::LockFailed)?;
        self.write_depth.set(1);
        Ok(())
    }

    /// Try to acquire exclusive access without blocking.
    pub fn try_lock_write(&self) -> Result<bool> {
        if self.write_depth.get() > 0 {
            self.write_depth.set(self.write_depth.get() + 1);
            return Ok(true);
        }
        if self.read_depth.get() > 0 {
            return Ok(false);
        }
        if self.inner.try_lock_write().map_err(CacheError::LockFailed)? {
            self.write_depth.set(1);
            return Ok(true);
        }
        Ok(false)
    }

    /// Release one level of exclusive access.
    pub fn release_write(&self) -> Result<()> {
        let depth = self.write_depth.get();
        if depth == 0 {
            return Err(self.misuse("release_write without matching lock_write"));
        }
        if depth == 1 && self.read_depth.get() > 0 {
            return Err(self.misuse("release_write with reads still nested"));
        }
        self.write_depth.set(depth - 1);
        if depth == 1 {
            self.inner.unlock().map_err(CacheError::LockFailed)?;
        }
        Ok(())
    }

    /// Whether this handle currently holds the lock in any mode.
    pub fn held(&self) -> bool {
        self.read_depth.get() > 0 || self.write_depth.get() > 0
    }

    /// Acquire shared access and return a guard that releases on drop.
    pub fn read_guard(&self) -> Result<ReadGuard<'_>> {
        self.lock_read()?;
        Ok(ReadGuard { lock: self })
    }

    /// Acquire exclusive access and return a guard that releases on drop.
    pub fn write_guard(&self) -> Result<WriteGuard<'_>> {
        self.lock_write()?;
        Ok(WriteGuard { lock: self })
    }

    /// Non-blocking variant of [`NamedRwLock::write_guard`].
    pub fn try_write_guard(&self) -> Result<Option<WriteGuard<'_>>> {
        if self.try_lock_write()? {
            Ok(Some(WriteGuard { lock: self }))
        } else {
            Ok(None)
        }
    }

    /// Remove the shared memory backing the lock for `tag`.
    pub fn clear_storage(tag: &str) {
        PlatformRwLock::clear_storage(tag);
    }
}

/// RAII shared-access guard. Dropping releases one nesting level.
pub struct ReadGuard<'a> {
    lock: &'a NamedRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release_read();
    }
}

/// RAII exclusive-access guard. Dropping releases one nesting level.
pub struct WriteGuard<'a> {
    lock: &'a NamedRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release_write();
    }
}
