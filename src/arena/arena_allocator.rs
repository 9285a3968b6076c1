//! Arena allocator implementation.
//!
//! An arena serves many short-lived allocations for a single owner (a request,
//! a connection, a configuration cycle) and gives everything back at once.
//! Small requests are bump-allocated from a chain of fixed-size blocks; requests
//! larger than `max_small` go to the backing allocator and are tracked so they
//! can be released early or in bulk.

use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::debug;

use super::arena_block::{Block, ARENA_HEADER_SIZE, BLOCK_ALIGNMENT, BLOCK_HEADER_SIZE, MAX_FAILED};
use super::backing::{BackingAllocator, Heap};
use crate::{AllocError, AllocResult, Context};

/// Number of most recent large records searched for a released slot before a
/// new record is appended.
const LARGE_REUSE_SCAN: usize = 4;

/// Callback run against its registered data pointer when the arena is
/// destroyed.
pub type CleanupHandler = fn(data: *mut u8);

struct LargeAlloc {
    /// `None` once released through [`Arena::release`].
    ptr: Option<NonNull<u8>>,
    layout: Layout,
}

struct CleanupEntry {
    handler: CleanupHandler,
    data: *mut u8,
}

/// Arena usage statistics
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub blocks: usize,
    pub large_live: usize,
    pub cleanups: usize,
    pub small_bytes: usize,
}

/// Single-owner bump allocator with large-allocation tracking and cleanups.
///
/// The arena is neither `Send` nor `Sync`: it belongs to exactly one
/// execution context and performs no locking.
pub struct Arena<B: BackingAllocator = Heap> {
    blocks: Vec<Block>,
    block_size: usize,
    max_small: usize,
    /// Index of the first block tried by small allocations.
    current: usize,
    large: Vec<LargeAlloc>,
    cleanups: Vec<CleanupEntry>,
    backing: B,
    ctx: Context,
}

impl Arena<Heap> {
    /// Create an arena whose blocks come from the process heap.
    pub fn create(block_size: usize, ctx: &Context) -> AllocResult<Self> {
        Self::with_backing(block_size, ctx, Heap)
    }
}

impl<B: BackingAllocator> Arena<B> {
    /// Create an arena drawing its memory from `backing`.
    ///
    /// The first block is allocated immediately; `block_size` must leave room
    /// for the arena header.
    pub fn with_backing(block_size: usize, ctx: &Context, mut backing: B) -> AllocResult<Self> {
        if block_size <= ARENA_HEADER_SIZE {
            return Err(AllocError::InvalidParam);
        }

        let layout = Self::block_layout(block_size)?;
        let mut blocks = Vec::new();
        blocks
            .try_reserve(1)
            .map_err(|_| AllocError::NoMemory)?;

        let base = backing.alloc(layout)?;
        blocks.push(Block::new(base, block_size, ARENA_HEADER_SIZE));

        let max_small = (block_size - ARENA_HEADER_SIZE).min(ctx.page_size() - 1);

        debug!(
            "arena: create {:p}, block size {}, max small {}",
            base, block_size, max_small
        );

        Ok(Self {
            blocks,
            block_size,
            max_small,
            current: 0,
            large: Vec::new(),
            cleanups: Vec::new(),
            backing,
            ctx: *ctx,
        })
    }

    fn block_layout(block_size: usize) -> AllocResult<Layout> {
        Layout::from_size_align(block_size, BLOCK_ALIGNMENT).map_err(|_| AllocError::InvalidParam)
    }

    /// Largest request served by bump allocation.
    pub fn max_small(&self) -> usize {
        self.max_small
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Allocate `size` bytes, word-aligned when bump-allocated.
    pub fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if size <= self.max_small {
            return self.alloc_small(size, true);
        }
        self.alloc_large(size)
    }

    /// Allocate `size` bytes without aligning the cursor first.
    pub fn alloc_unaligned(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if size <= self.max_small {
            return self.alloc_small(size, false);
        }
        self.alloc_large(size)
    }

    /// Allocate `size` zero-filled, word-aligned bytes.
    pub fn alloc_zeroed(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Allocate `size` bytes aligned to `alignment` directly from the backing
    /// allocator. The result is always tracked as a new large allocation.
    pub fn alloc_aligned_large(&mut self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        let layout = Layout::from_size_align(size, alignment).map_err(|_| AllocError::InvalidParam)?;
        self.large.try_reserve(1).map_err(|_| AllocError::NoMemory)?;

        let ptr = self.backing.alloc(layout)?;
        self.large.push(LargeAlloc {
            ptr: Some(ptr),
            layout,
        });

        debug!("arena: memalign {:p}:{} @{}", ptr, size, alignment);
        Ok(ptr)
    }

    fn alloc_small(&mut self, size: usize, align: bool) -> AllocResult<NonNull<u8>> {
        for block in &mut self.blocks[self.current..] {
            if let Some(ptr) = block.try_bump(size, align) {
                return Ok(ptr);
            }
        }
        self.alloc_block(size)
    }

    /// Append a fresh block and serve `size` bytes from it.
    fn alloc_block(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        self.blocks
            .try_reserve(1)
            .map_err(|_| AllocError::NoMemory)?;

        let layout = Self::block_layout(self.block_size)?;
        let base = self.backing.alloc(layout)?;

        let mut block = Block::new(base, self.block_size, BLOCK_HEADER_SIZE);
        let Some(ptr) = block.try_bump(size, true) else {
            unsafe { self.backing.dealloc(base, layout) };
            return Err(AllocError::InvalidParam);
        };

        // Every block passed over on the way to the tail has failed once
        // more; stop visiting the ones that keep failing.
        let tail = self.blocks.len() - 1;
        for idx in self.current..tail {
            let block = &mut self.blocks[idx];
            if block.failed > MAX_FAILED {
                self.current = idx + 1;
            }
            block.failed += 1;
        }

        self.blocks.push(block);
        debug!(
            "arena: new block {:p}, {} block(s), current {}",
            base,
            self.blocks.len(),
            self.current
        );
        Ok(ptr)
    }

    fn alloc_large(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let layout = Layout::from_size_align(size, BLOCK_ALIGNMENT).map_err(|_| AllocError::InvalidParam)?;
        let ptr = self.backing.alloc(layout)?;

        for entry in self.large.iter_mut().rev().take(LARGE_REUSE_SCAN) {
            if entry.ptr.is_none() {
                entry.ptr = Some(ptr);
                entry.layout = layout;
                debug!("arena: large {:p}:{} (reused record)", ptr, size);
                return Ok(ptr);
            }
        }

        if self.large.try_reserve(1).is_err() {
            unsafe { self.backing.dealloc(ptr, layout) };
            return Err(AllocError::NoMemory);
        }
        self.large.push(LargeAlloc {
            ptr: Some(ptr),
            layout,
        });

        debug!("arena: large {:p}:{}", ptr, size);
        Ok(ptr)
    }

    /// Free a large allocation ahead of arena destruction.
    ///
    /// Returns `false` for pointers that are not live large allocations;
    /// bump-allocated memory is never reclaimed individually.
    pub fn release(&mut self, ptr: NonNull<u8>) -> bool {
        for entry in &mut self.large {
            if entry.ptr == Some(ptr) {
                debug!("arena: free: {:p}", ptr);
                unsafe { self.backing.dealloc(ptr, entry.layout) };
                entry.ptr = None;
                return true;
            }
        }

        let addr = ptr.as_ptr() as usize;
        if self.blocks.iter().any(|block| block.contains(addr)) {
            debug!("arena: {:p} is bump memory, declined", ptr);
        }
        false
    }

    /// Register `handler` to run with `data` when the arena is destroyed.
    ///
    /// Handlers run in registration order.
    pub fn register_cleanup(&mut self, handler: CleanupHandler, data: *mut u8) -> AllocResult {
        self.cleanups
            .try_reserve(1)
            .map_err(|_| AllocError::NoMemory)?;
        self.cleanups.push(CleanupEntry { handler, data });
        debug!("arena: add cleanup: {:p}", data);
        Ok(())
    }

    /// Allocate `size` bytes of cleanup payload from the arena and register
    /// `handler` to run with it. The caller fills the returned payload.
    ///
    /// A zero `size` registers and returns a null payload.
    pub fn register_cleanup_with_data(
        &mut self,
        handler: CleanupHandler,
        size: usize,
    ) -> AllocResult<*mut u8> {
        let data = if size == 0 {
            ptr::null_mut()
        } else {
            self.alloc(size)?.as_ptr()
        };
        self.register_cleanup(handler, data)?;
        Ok(data)
    }

    /// Recycle the arena for a new cycle.
    ///
    /// Large allocations are freed, pending cleanups are dropped without
    /// running, and every block is rewound; blocks themselves are kept.
    pub fn reset(&mut self) {
        for entry in self.large.drain(..) {
            if let Some(ptr) = entry.ptr {
                unsafe { self.backing.dealloc(ptr, entry.layout) };
            }
        }

        for block in &mut self.blocks {
            block.rewind();
        }

        self.current = 0;
        self.cleanups.clear();
        debug!("arena: reset, {} block(s) kept", self.blocks.len());
    }

    /// Run the cleanups and free everything the arena owns.
    pub fn destroy(self) {
        drop(self);
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            blocks: self.blocks.len(),
            large_live: self.large.iter().filter(|entry| entry.ptr.is_some()).count(),
            cleanups: self.cleanups.len(),
            small_bytes: self.blocks.iter().map(Block::used).sum(),
        }
    }
}

impl<B: BackingAllocator> Drop for Arena<B> {
    fn drop(&mut self) {
        for entry in self.cleanups.drain(..) {
            debug!("arena: run cleanup: {:p}", entry.data);
            (entry.handler)(entry.data);
        }

        for entry in self.large.drain(..) {
            if let Some(ptr) = entry.ptr {
                debug!("arena: free: {:p}", ptr);
                unsafe { self.backing.dealloc(ptr, entry.layout) };
            }
        }

        let layout = match Self::block_layout(self.block_size) {
            Ok(layout) => layout,
            Err(_) => return,
        };
        for block in self.blocks.drain(..) {
            debug!(
                "arena: free: {:p}, used: {}, unused: {}",
                block.base(),
                block.used(),
                block.unused()
            );
            unsafe { self.backing.dealloc(block.base(), layout) };
        }
    }
}
