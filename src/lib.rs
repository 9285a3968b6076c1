//! Arena and shared slab memory management for multi-process servers
//!
//! This crate implements the memory core of a worker-process server,
//! featuring:
//! - Arena allocator for per-request / per-connection private allocations
//! - Slab pool serving power-of-two size classes out of one shared region
//! - Hybrid spin/semaphore mutex usable across processes
//! - Anonymous shared mappings and a lock-taking shared pool wrapper

#![no_std]

extern crate alloc;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size, used when the platform cannot be queried
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Machine word size in bytes; aligned arena allocations use this alignment.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// The error type used for allocation and synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size`, alignment or configuration.
    InvalidParam,
    /// The backing allocator or the shared pool is exhausted.
    NoMemory,
    /// The pointer was not produced by this allocator (out of range or
    /// not on a chunk boundary).
    InvalidPointer,
    /// Deallocate an unallocated memory region (double free).
    NotAllocated,
    /// An OS synchronization primitive failed with the given errno.
    SyncPrimitive(i32),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidParam => f.write_str("invalid allocation parameter"),
            AllocError::NoMemory => f.write_str("out of memory"),
            AllocError::InvalidPointer => f.write_str("pointer does not belong to this allocator"),
            AllocError::NotAllocated => f.write_str("memory is already free"),
            AllocError::SyncPrimitive(errno) => {
                write!(f, "synchronization primitive failed (errno {})", errno)
            }
        }
    }
}

impl core::error::Error for AllocError {}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

/// Last OS error number of the calling thread.
#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub mod context;
pub use context::Context;

pub mod arena;
#[cfg(feature = "tracking")]
pub use arena::ArenaStats;
pub use arena::{Arena, BackingAllocator, CleanupHandler, Heap};

pub mod shmtx;
pub use shmtx::{HybridMutex, HybridMutexGuard, ShmtxShared};

pub mod slab;
pub use slab::{sizes_init, SlabPool, SlabSizes, SlabStat};

pub mod shm;
pub use shm::{SharedRegion, SharedSlabPool};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert!(is_aligned(64, 16));
        assert!(!is_aligned(72, 16));
    }

    #[cfg(not(feature = "log"))]
    #[test]
    fn test_log_stubs_expand_to_statements() {
        let res: AllocResult = Err(AllocError::NoMemory);
        let failed = match res {
            Ok(()) => {
                debug!("never");
                false
            }
            Err(err) => {
                error!("{}", err);
                true
            }
        };
        assert!(failed);
    }

    #[test]
    fn test_error_display() {
        extern crate std;
        use std::string::ToString;

        assert_eq!(AllocError::NoMemory.to_string(), "out of memory");
        assert_eq!(
            AllocError::SyncPrimitive(22).to_string(),
            "synchronization primitive failed (errno 22)"
        );
    }
}
