//! Size classes of the slab pool.

use crate::Context;

/// Default smallest chunk shift (8-byte chunks).
pub const DEFAULT_MIN_SHIFT: u32 = 3;

/// Page-size dependent thresholds shared by every slab pool of a process.
///
/// Computed once by [`sizes_init`] and passed to
/// [`SlabPool::init`](super::SlabPool::init).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabSizes {
    page_size: usize,
    page_shift: u32,
    max_size: usize,
    exact_size: usize,
    exact_shift: u32,
}

/// Derive the slab thresholds from the platform page size.
///
/// Requests above `max_size` (half a page) are served as whole pages. A page
/// of `exact_size` chunks holds exactly one machine word of chunks, so its
/// occupancy fits the descriptor word.
pub fn sizes_init(ctx: &Context) -> SlabSizes {
    let page_size = ctx.page_size();
    let exact_size = page_size / usize::BITS as usize;

    SlabSizes {
        page_size,
        page_shift: ctx.page_shift(),
        max_size: page_size / 2,
        exact_size,
        exact_shift: exact_size.trailing_zeros(),
    }
}

impl SlabSizes {
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Largest request served from a size class.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn exact_size(&self) -> usize {
        self.exact_size
    }

    pub fn exact_shift(&self) -> u32 {
        self.exact_shift
    }
}

/// Shift of the size class serving `size` bytes: the smallest power of two
/// not below `size`, and never below `min_shift`.
pub(crate) fn class_shift(size: usize, min_shift: u32) -> u32 {
    if size <= 1 << min_shift {
        return min_shift;
    }
    usize::BITS - (size - 1).leading_zeros()
}
