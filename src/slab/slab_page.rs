//! Page descriptors of the slab pool.
//!
//! Each data page owns one descriptor in the shared descriptor table. The
//! `slab` word and two low bits of `prev` form a packed page state that is
//! decoded into [`PageState`] on read and encoded again on write; nothing
//! outside this module looks at the raw bits.

/// Bit width of the packed `slab` word.
const BITS: u32 = usize::BITS;
const HALF_BITS: u32 = BITS / 2;

const TAG_PAGE: usize = 0;
const TAG_BIG: usize = 1;
const TAG_EXACT: usize = 2;
const TAG_SMALL: usize = 3;
const TAG_MASK: usize = 3;
const TAG_SHIFT: u32 = 2;

/// Marks the first page of a busy run; the low bits hold the run length.
const PAGE_START: usize = 1 << (BITS - 1);
/// `slab` word of every page of a busy run except the first.
const PAGE_BUSY: usize = usize::MAX;
/// `slab` word of every page of a free run except the first.
const PAGE_FREE: usize = 0;

const SHIFT_MASK: usize = (1 << HALF_BITS) - 1;

/// Null descriptor index.
pub(crate) const NIL: usize = usize::MAX >> TAG_SHIFT;

/// Decoded state of one data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageState {
    /// First page of a run of `pages` free pages, linked on the free list.
    FreeRun { pages: usize },
    /// Any other page of a free run. The last page of a run longer than one
    /// page links back to the run head through `prev`.
    FreeInner,
    /// First page of a whole-page allocation of `pages` pages.
    BusyRun { pages: usize },
    /// Any other page of a whole-page allocation.
    BusyInner,
    /// Chunks of `1 << shift` bytes, smaller than the exact size. The
    /// occupancy bitmap lives in the first chunks of the page itself.
    Small { shift: u32 },
    /// Chunks of exactly the exact size; one bit per chunk in the whole word.
    Exact { bitmap: usize },
    /// Chunks larger than the exact size; fewer than half a word of chunks.
    Big { shift: u32, bitmap: usize },
}

impl PageState {
    fn decode(slab: usize, tag: usize) -> Self {
        match tag {
            TAG_SMALL => PageState::Small {
                shift: slab as u32,
            },
            TAG_EXACT => PageState::Exact { bitmap: slab },
            TAG_BIG => PageState::Big {
                shift: (slab & SHIFT_MASK) as u32,
                bitmap: slab >> HALF_BITS,
            },
            _ => match slab {
                PAGE_FREE => PageState::FreeInner,
                PAGE_BUSY => PageState::BusyInner,
                s if s & PAGE_START != 0 => PageState::BusyRun {
                    pages: s & !PAGE_START,
                },
                s => PageState::FreeRun { pages: s },
            },
        }
    }

    fn encode(self) -> (usize, usize) {
        match self {
            PageState::FreeRun { pages } => {
                debug_assert!(pages > 0 && pages & PAGE_START == 0);
                (pages, TAG_PAGE)
            }
            PageState::FreeInner => (PAGE_FREE, TAG_PAGE),
            PageState::BusyRun { pages } => (PAGE_START | pages, TAG_PAGE),
            PageState::BusyInner => (PAGE_BUSY, TAG_PAGE),
            PageState::Small { shift } => (shift as usize, TAG_SMALL),
            PageState::Exact { bitmap } => (bitmap, TAG_EXACT),
            PageState::Big { shift, bitmap } => {
                debug_assert!(bitmap <= SHIFT_MASK);
                ((bitmap << HALF_BITS) | shift as usize, TAG_BIG)
            }
        }
    }

    /// Whether the page is attached to a size-class slot.
    pub(crate) fn is_class_page(self) -> bool {
        matches!(
            self,
            PageState::Small { .. } | PageState::Exact { .. } | PageState::Big { .. }
        )
    }
}

/// One entry of the descriptor table.
///
/// `next` and the index part of `prev` are descriptor indices forming
/// circular lists through sentinel entries; `NIL` when unlinked.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageDescriptor {
    slab: usize,
    pub(crate) next: usize,
    prev: usize,
}

impl PageDescriptor {
    /// An unlinked descriptor of a free inner page.
    pub(crate) const fn unlinked() -> Self {
        Self {
            slab: PAGE_FREE,
            next: NIL,
            prev: NIL << TAG_SHIFT,
        }
    }

    /// A list sentinel linked to itself.
    pub(crate) const fn sentinel(index: usize) -> Self {
        Self {
            slab: 0,
            next: index,
            prev: index << TAG_SHIFT,
        }
    }

    pub(crate) fn prev(&self) -> usize {
        self.prev >> TAG_SHIFT
    }

    /// Set the previous index, keeping the state tag.
    pub(crate) fn set_prev(&mut self, index: usize) {
        debug_assert!(index <= NIL);
        self.prev = (index << TAG_SHIFT) | (self.prev & TAG_MASK);
    }

    pub(crate) fn state(&self) -> PageState {
        PageState::decode(self.slab, self.prev & TAG_MASK)
    }

    /// Set the page state, keeping the links.
    pub(crate) fn set_state(&mut self, state: PageState) {
        let (slab, tag) = state.encode();
        self.slab = slab;
        self.prev = (self.prev & !TAG_MASK) | tag;
    }
}
