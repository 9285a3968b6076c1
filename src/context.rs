//! Process context shared by every allocator component.
//!
//! Page size and CPU count are read once, by whoever builds the [`Context`],
//! and then handed to each arena, slab pool and mutex at creation time.

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::{AllocError, AllocResult, DEFAULT_PAGE_SIZE};

/// Smallest page size accepted by [`Context::new`].
const MIN_PAGE_SIZE: usize = 256;

/// Platform facts needed by the allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    page_size: usize,
    page_shift: u32,
    ncpu: usize,
}

impl Context {
    /// Build a context from explicit values.
    ///
    /// `page_size` must be a power of two no smaller than 256 bytes and
    /// `ncpu` must be non-zero.
    pub fn new(page_size: usize, ncpu: usize) -> AllocResult<Self> {
        if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE || ncpu == 0 {
            return Err(AllocError::InvalidParam);
        }
        Ok(Self {
            page_size,
            page_shift: page_size.trailing_zeros(),
            ncpu,
        })
    }

    /// Query the running system for its page size and online CPU count.
    ///
    /// Falls back to [`DEFAULT_PAGE_SIZE`] and a single CPU when `sysconf`
    /// reports nothing usable.
    pub fn detect() -> Self {
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 && (n as usize).is_power_of_two() => n as usize,
            _ => {
                warn!("context: sysconf(_SC_PAGESIZE) failed, using {}", DEFAULT_PAGE_SIZE);
                DEFAULT_PAGE_SIZE
            }
        };
        let ncpu = match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
            n if n > 0 => n as usize,
            _ => 1,
        };

        debug!("context: page size {}, {} cpu(s)", page_size, ncpu);

        Self {
            page_size,
            page_shift: page_size.trailing_zeros(),
            ncpu,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    pub fn ncpu(&self) -> usize {
        self.ncpu
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::detect()
    }
}
