// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory segments and process-shared read-write locks.
// The cache region and every named lock live in their own shm_open segment;
// locks are pthread_rwlock_t objects initialised with PTHREAD_PROCESS_SHARED.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Process-local shm cache for lock segments.
// All threads within the same process that open the same named lock MUST use
// the same mmap. macOS's pthread implementation stores internal pointers
// relative to the virtual address used for pthread_rwlock_init, so a second
// mmap of the same physical page at a different address causes EINVAL on
// pthread_rwlock_rdlock/wrlock.
// ---------------------------------------------------------------------------

pub(crate) struct CachedShm {
    pub(crate) shm: PlatformShm,
    pub(crate) local_ref: AtomicUsize,
}

pub(crate) struct ShmCache {
    map: HashMap<String, Arc<CachedShm>>,
}

impl ShmCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

fn rwlock_cache() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ShmCache::new()))
}

/// Acquire or reuse a cached shm handle.
///
/// If this is the first local open for `name` and the segment's shared ref
/// count was zero, `init_fn` is called with the shm pointer **while the cache
/// lock is still held**, ensuring that no other thread in this process can
/// use the handle before initialisation completes.
pub(crate) fn cached_shm_acquire<F>(
    cache: &Mutex<ShmCache>,
    name: &str,
    size: usize,
    init_fn: F,
) -> io::Result<Arc<CachedShm>>
where
    F: FnOnce(*mut u8) -> io::Result<()>,
{
    let mut c = cache.lock().unwrap();
    if let Some(entry) = c.map.get(name) {
        entry.local_ref.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::clone(entry));
    }
    let shm = PlatformShm::acquire(name, size, false)?;
    // A prior shared ref count of zero means either a brand-new segment or
    // one whose last user has detached; both want a fresh lock object.
    if shm.prev_ref_count() == 0 {
        init_fn(shm.as_mut_ptr())?;
    }
    let entry = Arc::new(CachedShm {
        shm,
        local_ref: AtomicUsize::new(1),
    });
    c.map.insert(name.to_string(), Arc::clone(&entry));
    Ok(entry)
}

/// Release one local reference. When the last local ref drops, remove from cache.
pub(crate) fn cached_shm_release(cache: &Mutex<ShmCache>, name: &str) {
    let mut c = cache.lock().unwrap();
    if let Some(entry) = c.map.get(name) {
        let prev = entry.local_ref.fetch_sub(1, Ordering::AcqRel);
        if prev <= 1 {
            c.map.remove(name);
        }
    }
}

/// Forcibly remove a cache entry (used by `clear_storage` to avoid stale
/// entries after the underlying shm has been unlinked).
pub(crate) fn cached_shm_purge(cache: &Mutex<ShmCache>, name: &str) {
    let mut c = cache.lock().unwrap();
    c.map.remove(name);
}

// ---------------------------------------------------------------------------
// Layout helpers for the trailing ref counter.
// ---------------------------------------------------------------------------

/// Rounds the user size up to `alignof(AtomicI32)` then appends an
/// `atomic<int32_t>` reference counter at the end of the mapping.
const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Returns a reference to the trailing `AtomicI32` ref-counter inside a mapped
/// region of `total_size` bytes starting at `mem`.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm — POSIX shared memory
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including ref counter)
    user_size: usize, // user-visible size
    name: String,     // POSIX name (with leading '/')
    prev_ref: i32,    // ref count *before* our fetch_add (0 means no other user)
    created: bool,    // we won the exclusive create
    persist: bool,    // never unlink on drop (explicit destroy only)
}

// Safety: the shared memory region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Acquire a named shared memory region of `user_size` bytes, creating
    /// it if no peer has yet.
    ///
    /// The mapping is slightly larger to hold the trailing ref counter.
    /// When an existing segment is opened, its actual size wins over
    /// `user_size` (a later attacher may ask for a different size than the
    /// creator used). `user_size` must be a multiple of 4 so the ref-counter
    /// padding is unambiguous in that inversion.
    ///
    /// `persist` segments survive the last detach and are only removed by an
    /// explicit `unlink`; non-persist segments are unlinked when the last
    /// mapper drops.
    pub fn acquire(name: &str, user_size: usize, persist: bool) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 || user_size % ALIGN != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be a positive multiple of 4",
            ));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;
        let total_size = calc_size(user_size);

        // Try exclusive create first so we only call ftruncate when we
        // actually own the new object. On macOS, calling ftruncate on an
        // already-sized shm object can zero its contents before returning
        // EINVAL.
        let (fd, created) = {
            let f = unsafe {
                libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    perms as libc::c_uint,
                )
            };
            if f != -1 {
                (f, true)
            } else {
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EEXIST) {
                    return Err(e);
                }
                // Already exists — open without truncation.
                let f2 = unsafe {
                    libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                };
                if f2 == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f2, false)
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        let (total_size, user_size) = if created {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            (total_size, user_size)
        } else {
            // The creator's size is authoritative for an existing segment.
            // We may have opened it between the creator's shm_open and its
            // ftruncate, in which case the size is still 0 — wait it out.
            let mut actual_total = 0usize;
            for _ in 0..200 {
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                if unsafe { libc::fstat(fd, &mut st) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                actual_total = st.st_size as usize;
                if actual_total >= calc_size(ALIGN) {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            if actual_total < calc_size(ALIGN) {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "existing shm segment never received its size",
                ));
            }
            (actual_total, actual_total - std::mem::size_of::<AtomicI32>())
        };

        Self::mmap_and_finish(fd, total_size, user_size, posix_name, created, persist)
    }

    fn mmap_and_finish(
        fd: i32,
        total_size: usize,
        user_size: usize,
        posix_name: String,
        created: bool,
        persist: bool,
    ) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let prev = unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name,
            prev_ref: prev,
            created,
            persist,
        })
    }

    /// Pointer to the user-visible region (excluding the trailing ref counter).
    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// Mutable pointer to the user-visible region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// User-visible size.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// The ref count value *before* our own increment during acquire.
    /// Returns 0 if no other handle was mapping the segment at that moment.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    /// Whether this handle won the exclusive create of the segment.
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Force-remove the backing object (shm_unlink). Does NOT release the mapping.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Unlink a named shm segment by name (static helper).
    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 && !self.persist {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformRwLock — pthread_rwlock_t in shared memory
// ---------------------------------------------------------------------------

pub struct PlatformRwLock {
    cached: Arc<CachedShm>,
    name: String,
}

impl PlatformRwLock {
    /// Open (or create) a named inter-process read-write lock.
    ///
    /// The lock lives inside a shared memory segment named after the tag.
    /// Whichever attacher observes a zero shared ref count initialises the
    /// lock with `PTHREAD_PROCESS_SHARED`. All threads within the same
    /// process that open the same tag share a single mmap (via
    /// `rwlock_cache`).
    pub fn open(name: &str) -> io::Result<Self> {
        let raw = std::mem::size_of::<libc::pthread_rwlock_t>();
        let shm_size = ((raw + ALIGN - 1) / ALIGN) * ALIGN;
        let cached = cached_shm_acquire(rwlock_cache(), name, shm_size, |base| {
            let lock_ptr = base as *mut libc::pthread_rwlock_t;
            unsafe {
                ptr::write_bytes(lock_ptr, 0, 1);

                let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
                let mut eno = libc::pthread_rwlockattr_init(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }

                eno = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
                if eno != 0 {
                    libc::pthread_rwlockattr_destroy(&mut attr);
                    return Err(io::Error::from_raw_os_error(eno));
                }

                eno = libc::pthread_rwlock_init(lock_ptr, &attr);
                libc::pthread_rwlockattr_destroy(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }
            Ok(())
        })?;

        Ok(Self {
            cached,
            name: name.to_string(),
        })
    }

    fn lock_ptr(&self) -> *mut libc::pthread_rwlock_t {
        self.cached.shm.as_mut_ptr() as *mut libc::pthread_rwlock_t
    }

    /// Acquire the lock shared (blocking).
    pub fn lock_read(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_rwlock_rdlock(self.lock_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Try to acquire the lock shared without blocking.
    pub fn try_lock_read(&self) -> io::Result<bool> {
        let eno = unsafe { libc::pthread_rwlock_tryrdlock(self.lock_ptr()) };
        match eno {
            0 => Ok(true),
            // EAGAIN: the implementation's reader count is saturated.
            libc::EBUSY | libc::EAGAIN => Ok(false),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    /// Acquire the lock exclusive (blocking).
    pub fn lock_write(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_rwlock_wrlock(self.lock_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Try to acquire the lock exclusive without blocking.
    pub fn try_lock_write(&self) -> io::Result<bool> {
        let eno = unsafe { libc::pthread_rwlock_trywrlock(self.lock_ptr()) };
        match eno {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    /// Release the lock (shared or exclusive — POSIX uses one unlock call).
    pub fn unlock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_rwlock_unlock(self.lock_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Remove the shared memory backing this lock (static helper).
    /// Also purges any cached entry so a subsequent `open` creates fresh state.
    pub fn clear_storage(name: &str) {
        cached_shm_purge(rwlock_cache(), name);
        PlatformShm::unlink_by_name(name);
    }
}

impl Drop for PlatformRwLock {
    fn drop(&mut self) {
        // Don't call pthread_rwlock_destroy here. On macOS, the virtual
        // address may be recycled to a different shm segment after munmap,
        // and destroy would scribble over whatever lock now lives at that
        // address. The shm munmap + unlink in PlatformShm::drop is
        // sufficient to reclaim the memory.
        cached_shm_release(rwlock_cache(), &self.name);
    }
}
