//! Anonymous shared mappings and a slab pool living in one.
//!
//! A [`SharedRegion`] created before `fork` is visible at the same address
//! in every child, which is how worker processes share a [`SlabPool`].

use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::{debug, error};

use crate::shmtx::{HybridMutex, HybridMutexGuard};
use crate::slab::{sizes_init, SlabPool};
use crate::{errno, AllocError, AllocResult, Context};

/// An anonymous `MAP_SHARED` mapping, unmapped on drop.
pub struct SharedRegion {
    addr: NonNull<u8>,
    size: usize,
}

impl SharedRegion {
    /// Map `size` zeroed bytes shared with future children of this process.
    pub fn new(size: usize) -> AllocResult<Self> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            error!("shm: mmap(MAP_ANON|MAP_SHARED, {}) failed: errno {}", size, errno());
            return Err(AllocError::NoMemory);
        }

        debug!("shm: mapped {:p}:{}", addr, size);

        Ok(Self {
            // SAFETY: mmap never returns null on success without MAP_FIXED.
            addr: unsafe { NonNull::new_unchecked(addr.cast()) },
            size,
        })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.addr.as_ptr().cast(), self.size) } == -1 {
            error!("shm: munmap({:p}, {}) failed: errno {}", self.addr, self.size, errno());
        }
    }
}

/// A slab pool in its own shared region, guarded by a [`HybridMutex`]
/// whose state is the pool header.
///
/// Create it in the parent, then `fork`; every process allocates and frees
/// through its inherited copy. Only the creating process should drop it,
/// children leave with `_exit`.
pub struct SharedSlabPool {
    pool: SlabPool,
    mutex: HybridMutex,
    region: SharedRegion,
}

impl SharedSlabPool {
    /// Map `size` bytes and lay out a slab pool named `name` in them.
    pub fn new(size: usize, name: &'static str, ctx: &Context) -> AllocResult<Self> {
        let region = SharedRegion::new(size)?;
        let sizes = sizes_init(ctx);

        let mut pool = unsafe { SlabPool::init(region.as_ptr(), region.len(), &sizes)? };
        pool.set_log_context(name);

        let mutex = unsafe { HybridMutex::create(pool.mutex_state(), name, ctx) };

        debug!(
            "shm: zone \"{}\" with {} page(s) at {:p}",
            name,
            pool.total_pages(),
            region.as_ptr()
        );

        Ok(Self {
            pool,
            mutex,
            region,
        })
    }

    /// Allocate `size` bytes under the pool lock.
    pub fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let _guard = self.mutex.lock_guard();
        self.pool.alloc_locked(size)
    }

    /// Allocate `size` zero-filled bytes under the pool lock.
    pub fn calloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let _guard = self.mutex.lock_guard();
        self.pool.calloc_locked(size)
    }

    /// Free `ptr` under the pool lock.
    pub fn free(&mut self, ptr: NonNull<u8>) -> AllocResult {
        let _guard = self.mutex.lock_guard();
        self.pool.free_locked(ptr)
    }

    /// Take the pool lock, e.g. to read the statistics of several classes
    /// consistently.
    pub fn lock(&self) -> HybridMutexGuard<'_> {
        self.mutex.lock_guard()
    }

    pub fn pool(&self) -> &SlabPool {
        &self.pool
    }

    pub fn mutex(&self) -> &HybridMutex {
        &self.mutex
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

impl Drop for SharedSlabPool {
    fn drop(&mut self) {
        self.mutex.destroy();
    }
}
