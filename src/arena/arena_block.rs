//! Arena block implementation.
//!
//! A block is one contiguous region obtained from the backing allocator and
//! served front to back by bump allocation.

use core::ptr::NonNull;

use crate::{align_up, WORD_SIZE};

/// Alignment of every block region.
pub(crate) const BLOCK_ALIGNMENT: usize = 16;

/// Bytes reserved at the head of an appended block: cursor, limit, next
/// link and failure count.
pub(crate) const BLOCK_HEADER_SIZE: usize = 4 * WORD_SIZE;

/// Bytes reserved at the head of the first block, which additionally holds
/// the arena header (small limit, current hint, large list, cleanup list,
/// chain and log handle).
pub(crate) const ARENA_HEADER_SIZE: usize = BLOCK_HEADER_SIZE + 6 * WORD_SIZE;

/// A block is skipped by later small allocations once it has failed to
/// serve a request more than this many times.
pub(crate) const MAX_FAILED: usize = 4;

pub(crate) struct Block {
    base: NonNull<u8>,
    /// Offset of the first usable byte; the cursor rewinds here on reset.
    start: usize,
    cursor: usize,
    limit: usize,
    pub(crate) failed: usize,
}

impl Block {
    pub(crate) fn new(base: NonNull<u8>, size: usize, reserved: usize) -> Self {
        debug_assert!(reserved <= size);
        Self {
            base,
            start: reserved,
            cursor: reserved,
            limit: size,
            failed: 0,
        }
    }

    /// Carve `size` bytes off the cursor, word-aligning it first when
    /// `align` is set. Returns `None` when the tail is too short.
    pub(crate) fn try_bump(&mut self, size: usize, align: bool) -> Option<NonNull<u8>> {
        let offset = if align {
            align_up(self.cursor, WORD_SIZE)
        } else {
            self.cursor
        };

        if offset > self.limit || self.limit - offset < size {
            return None;
        }

        self.cursor = offset + size;
        // SAFETY: offset <= limit, which is the size of the region.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    pub(crate) fn rewind(&mut self) {
        self.cursor = self.start;
        self.failed = 0;
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn used(&self) -> usize {
        self.cursor - self.start
    }

    pub(crate) fn unused(&self) -> usize {
        self.limit - self.cursor
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base + self.start && addr < base + self.limit
    }
}
