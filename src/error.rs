// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type shared by every layer of the cache.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Lock-primitive failures and corruption are reported to the caller as-is;
/// the only internal retry loop is the bucket try-lock loop during zone
/// eviction, which is bounded by the try-lock timeout.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A shared-memory segment could not be created, opened or mapped.
    #[error("shared memory operation failed: {0}")]
    Os(#[source] io::Error),

    /// The underlying OS lock primitive failed.
    #[error("lock operation failed: {0}")]
    LockFailed(#[source] io::Error),

    /// A bucket try-lock kept failing during zone eviction.
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    /// The value does not fit in a single chunk.
    ///
    /// Any existing entry under the same key has been removed before this
    /// error was returned (Memcached set-failure semantics).
    #[error("value of {len} bytes exceeds the {max}-byte limit")]
    ValueTooLarge { len: usize, max: u64 },

    /// `replace` or `delete` on a key with no entry.
    #[error("key not found")]
    NotFound,

    /// `add` on a key that already has an entry.
    #[error("key already exists")]
    AlreadyExists,

    /// `increment`/`decrement` on a value that is not a decimal integer.
    #[error("value is not a decimal integer")]
    NotNumeric,

    /// A key is empty, longer than the key limit, or contains a NUL byte.
    #[error("key must be 1..=200 bytes and must not contain NUL")]
    InvalidKey,

    /// A region invariant check failed; the operation was aborted.
    #[error("shared region corrupt: {0}")]
    RegionCorrupt(&'static str),

    /// The requested region size is below the supported minimum.
    #[error("region size {0} is below the 16 MiB minimum")]
    RegionTooSmall(usize),
}

pub type Result<T> = std::result::Result<T, CacheError>;
