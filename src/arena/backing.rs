//! Backing allocator used by arenas for blocks and large allocations.

use core::alloc::Layout;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{error, trace};

use crate::{AllocError, AllocResult};

/// Source of the raw memory an [`Arena`](super::Arena) grows from.
///
/// Implementations never see zero-sized layouts.
pub trait BackingAllocator {
    /// Allocate a region described by `layout`.
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Return a region previously produced by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this allocator with the same `layout`
    /// and must not be used afterwards.
    unsafe fn dealloc(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// The process heap, through the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Heap;

impl BackingAllocator for Heap {
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => {
                trace!("heap: alloc {:p}:{} @{}", ptr, layout.size(), layout.align());
                Ok(ptr)
            }
            None => {
                error!(
                    "heap: alloc({}, align {}) failed",
                    layout.size(),
                    layout.align()
                );
                Err(AllocError::NoMemory)
            }
        }
    }

    unsafe fn dealloc(&mut self, ptr: NonNull<u8>, layout: Layout) {
        trace!("heap: free {:p}", ptr);
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
