//! Slab pool over one shared region.
//!
//! Region layout, all offsets relative to the region base:
//!
//! ```text
//! +--------+-------+-------------+---------+------------+
//! | header | stats | descriptors | padding | data pages |
//! +--------+-------+-------------+---------+------------+
//! ```
//!
//! Descriptor 0 heads the free-run list, descriptors `1..=slots` head the
//! per-class page lists, and data page `i` is described by descriptor
//! `1 + slots + i`. Only offsets are stored, so the region may be mapped at
//! different addresses by different processes as long as its page offset is
//! the same.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::{debug, error};

use super::size_class::{class_shift, SlabSizes, DEFAULT_MIN_SHIFT};
use super::slab_page::{PageDescriptor, PageState, NIL};
use super::stats::SlabStat;
use crate::shmtx::ShmtxShared;
use crate::{align_up, is_aligned, AllocError, AllocResult, WORD_SIZE};

/// Maximum length of the log context.
pub const LOG_CTX_MAX: usize = 32;

/// Descriptor index of the free-run list sentinel.
const FREE_LIST: usize = 0;

const BITS: usize = usize::BITS as usize;

/// Pool header at the start of the shared region.
#[repr(C)]
pub(crate) struct SlabPoolHeader {
    shmtx: ShmtxShared,
    min_shift: u32,
    page_shift: u32,
    exact_shift: u32,
    min_size: usize,
    max_size: usize,
    slots: usize,
    stats_off: usize,
    descs_off: usize,
    start_off: usize,
    pages: usize,
    pfree: usize,
    log_nomem: bool,
    log_ctx_len: usize,
    log_ctx: [u8; LOG_CTX_MAX],
}

/// Size-classed allocator over a shared region.
///
/// A `SlabPool` is a handle; the pool itself lives in the region. Each
/// process keeps its own handle (for instance inherited through `fork`).
/// The `*_locked` operations assume the caller holds the pool's mutex
/// whenever other processes may use the pool concurrently.
pub struct SlabPool {
    base: NonNull<u8>,
}

impl SlabPool {
    /// Lay out a pool in `size` bytes at `region` with the default minimum
    /// chunk shift.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes of `size` bytes for as
    /// long as any handle to the pool is used, and aligned to a machine word.
    pub unsafe fn init(region: NonNull<u8>, size: usize, sizes: &SlabSizes) -> AllocResult<Self> {
        unsafe { Self::init_with_min_shift(region, size, sizes, DEFAULT_MIN_SHIFT) }
    }

    /// Lay out a pool whose smallest chunk is `1 << min_shift` bytes.
    ///
    /// # Safety
    ///
    /// Same as [`init`](Self::init).
    pub unsafe fn init_with_min_shift(
        region: NonNull<u8>,
        size: usize,
        sizes: &SlabSizes,
        min_shift: u32,
    ) -> AllocResult<Self> {
        let base = region.as_ptr() as usize;
        let page_size = sizes.page_size();
        let page_shift = sizes.page_shift();

        if !is_aligned(base, align_of::<SlabPoolHeader>()) || min_shift == 0 || min_shift >= page_shift {
            return Err(AllocError::InvalidParam);
        }

        let slots = (page_shift - min_shift) as usize;
        let desc_size = size_of::<PageDescriptor>();
        let stats_off = align_up(size_of::<SlabPoolHeader>(), align_of::<SlabStat>());
        let descs_off = align_up(stats_off + slots * size_of::<SlabStat>(), align_of::<PageDescriptor>());
        let fixed = descs_off + (1 + slots) * desc_size;

        if size <= fixed {
            return Err(AllocError::InvalidParam);
        }

        let start_off = |pages: usize| align_up(base + fixed + pages * desc_size, page_size) - base;

        let mut pages = (size - fixed) / (page_size + desc_size);
        while pages > 0 && start_off(pages) + (pages << page_shift) > size {
            pages -= 1;
        }
        if pages == 0 {
            return Err(AllocError::InvalidParam);
        }

        let header = SlabPoolHeader {
            shmtx: ShmtxShared::zeroed(),
            min_shift,
            page_shift,
            exact_shift: sizes.exact_shift(),
            min_size: 1 << min_shift,
            max_size: sizes.max_size(),
            slots,
            stats_off,
            descs_off,
            start_off: start_off(pages),
            pages,
            pfree: pages,
            log_nomem: true,
            log_ctx_len: 0,
            log_ctx: [0; LOG_CTX_MAX],
        };
        unsafe { ptr::write(region.as_ptr().cast::<SlabPoolHeader>(), header) };

        let mut pool = Self { base: region };

        for slot in 0..slots {
            *pool.stat_mut(slot) = SlabStat::default();
        }

        for idx in 0..=slots {
            *pool.desc_mut(idx) = PageDescriptor::sentinel(idx);
        }

        let first = pool.first_page();
        for idx in first..first + pages {
            *pool.desc_mut(idx) = PageDescriptor::unlinked();
        }

        pool.desc_mut(first).set_state(PageState::FreeRun { pages });
        if pages > 1 {
            pool.desc_mut(first + pages - 1).set_prev(first);
        }
        pool.push_front(FREE_LIST, first);

        debug!(
            "slab: init {:p}, {} page(s) of {} from +{:#x}, {} slot(s)",
            region,
            pages,
            page_size,
            pool.header().start_off,
            slots
        );

        Ok(pool)
    }

    fn header(&self) -> &SlabPoolHeader {
        unsafe { &*self.base.as_ptr().cast::<SlabPoolHeader>() }
    }

    fn header_ptr(&mut self) -> *mut SlabPoolHeader {
        self.base.as_ptr().cast()
    }

    fn first_page(&self) -> usize {
        1 + self.header().slots
    }

    fn desc(&self, idx: usize) -> &PageDescriptor {
        debug_assert!(idx < self.first_page() + self.header().pages);
        unsafe {
            &*self
                .base
                .as_ptr()
                .add(self.header().descs_off)
                .cast::<PageDescriptor>()
                .add(idx)
        }
    }

    fn desc_mut(&mut self, idx: usize) -> &mut PageDescriptor {
        debug_assert!(idx < self.first_page() + self.header().pages);
        let off = self.header().descs_off;
        unsafe { &mut *self.base.as_ptr().add(off).cast::<PageDescriptor>().add(idx) }
    }

    fn stat_mut(&mut self, slot: usize) -> &mut SlabStat {
        debug_assert!(slot < self.header().slots);
        let off = self.header().stats_off;
        unsafe { &mut *self.base.as_ptr().add(off).cast::<SlabStat>().add(slot) }
    }

    fn state(&self, idx: usize) -> PageState {
        self.desc(idx).state()
    }

    fn set_state(&mut self, idx: usize, state: PageState) {
        self.desc_mut(idx).set_state(state);
    }

    fn set_free_pages(&mut self, pfree: usize) {
        unsafe { (*self.header_ptr()).pfree = pfree };
    }

    /// Link `idx` right after the sentinel `head`.
    fn push_front(&mut self, head: usize, idx: usize) {
        let first = self.desc(head).next;
        {
            let desc = self.desc_mut(idx);
            desc.next = first;
            desc.set_prev(head);
        }
        self.desc_mut(first).set_prev(idx);
        self.desc_mut(head).next = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let desc = *self.desc(idx);
        let (prev, next) = (desc.prev(), desc.next);
        self.desc_mut(prev).next = next;
        self.desc_mut(next).set_prev(prev);

        let desc = self.desc_mut(idx);
        desc.next = NIL;
        desc.set_prev(NIL);
    }

    /// Put `new` in the list position of `old`.
    fn replace(&mut self, old: usize, new: usize) {
        let desc = *self.desc(old);
        let (prev, next) = (desc.prev(), desc.next);
        {
            let desc = self.desc_mut(new);
            desc.next = next;
            desc.set_prev(prev);
        }
        self.desc_mut(prev).next = new;
        self.desc_mut(next).set_prev(new);

        let desc = self.desc_mut(old);
        desc.next = NIL;
        desc.set_prev(NIL);
    }

    fn start(&self) -> usize {
        self.base.as_ptr() as usize + self.header().start_off
    }

    fn page_addr(&self, idx: usize) -> usize {
        self.start() + ((idx - self.first_page()) << self.header().page_shift)
    }

    /// Number of data pages.
    pub fn total_pages(&self) -> usize {
        self.header().pages
    }

    /// Number of data pages on the free list.
    pub fn free_pages(&self) -> usize {
        self.header().pfree
    }

    pub fn page_size(&self) -> usize {
        1 << self.header().page_shift
    }

    /// Smallest chunk size.
    pub fn min_size(&self) -> usize {
        self.header().min_size
    }

    /// Largest request served from a size class.
    pub fn max_size(&self) -> usize {
        self.header().max_size
    }

    /// Number of size classes.
    pub fn slot_count(&self) -> usize {
        self.header().slots
    }

    /// Chunk size of size class `slot`.
    pub fn slot_size(&self, slot: usize) -> usize {
        1 << (self.header().min_shift as usize + slot)
    }

    /// Counters of size class `slot`.
    pub fn stat(&self, slot: usize) -> Option<SlabStat> {
        if slot >= self.header().slots {
            return None;
        }
        let off = self.header().stats_off;
        Some(unsafe { *self.base.as_ptr().add(off).cast::<SlabStat>().add(slot) })
    }

    /// Address range `[start, end)` of the data pages.
    pub fn data_range(&self) -> (usize, usize) {
        let start = self.start();
        (start, start + (self.header().pages << self.header().page_shift))
    }

    /// Shared state for the mutex guarding this pool.
    pub fn mutex_state(&self) -> NonNull<ShmtxShared> {
        self.base.cast()
    }

    /// Whether exhaustion is logged.
    pub fn set_log_nomem(&mut self, log_nomem: bool) {
        unsafe { (*self.header_ptr()).log_nomem = log_nomem };
    }

    /// Set the text prefixed to the pool's log messages, usually the zone
    /// name. Truncated to [`LOG_CTX_MAX`] bytes on a character boundary.
    pub fn set_log_context(&mut self, ctx: &str) {
        let mut len = ctx.len().min(LOG_CTX_MAX);
        while !ctx.is_char_boundary(len) {
            len -= 1;
        }

        let header = self.header_ptr();
        unsafe {
            (&mut (*header).log_ctx)[..len].copy_from_slice(&ctx.as_bytes()[..len]);
            (*header).log_ctx_len = len;
        }
    }

    pub fn log_context(&self) -> &str {
        let header = self.header();
        let len = header.log_ctx_len.min(LOG_CTX_MAX);
        core::str::from_utf8(&header.log_ctx[..len]).unwrap_or("")
    }

    fn no_memory(&self, size: usize) -> AllocError {
        if self.header().log_nomem {
            error!("{}: slab alloc({}) failed: no memory", self.log_context(), size);
        }
        AllocError::NoMemory
    }

    /// Allocate `size` bytes. The caller holds the pool's mutex.
    pub fn alloc_locked(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let (min_shift, page_shift) = (self.header().min_shift, self.header().page_shift);

        if size > self.header().max_size {
            debug!("slab: alloc {} as pages", size);

            let pages = size.div_ceil(1 << page_shift);
            let Some(idx) = self.alloc_pages(pages) else {
                return Err(self.no_memory(size));
            };
            return Ok(self.chunk_ptr(self.page_addr(idx)));
        }

        let shift = class_shift(size, min_shift);
        let slot = (shift - min_shift) as usize;
        let head = 1 + slot;
        self.stat_mut(slot).reqs += 1;

        debug!("slab: alloc {} slot {}", size, slot);

        let mut idx = self.desc(head).next;
        while idx != head {
            if let Some(chunk) = self.claim_chunk(idx, shift) {
                self.stat_mut(slot).used += 1;
                let addr = self.page_addr(idx) + (chunk << shift);
                debug!("slab: alloc {:#x}", addr);
                return Ok(self.chunk_ptr(addr));
            }
            idx = self.desc(idx).next;
        }

        let Some(idx) = self.alloc_pages(1) else {
            self.stat_mut(slot).fails += 1;
            return Err(self.no_memory(size));
        };

        let (capacity, chunk) = self.init_class_page(idx, shift);
        self.push_front(head, idx);

        let stat = self.stat_mut(slot);
        stat.total += capacity;
        stat.used += 1;

        let addr = self.page_addr(idx) + (chunk << shift);
        debug!("slab: alloc {:#x} from new page", addr);
        Ok(self.chunk_ptr(addr))
    }

    /// Allocate `size` zero-filled bytes. The caller holds the pool's mutex.
    pub fn calloc_locked(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let ptr = self.alloc_locked(size)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    fn chunk_ptr(&self, addr: usize) -> NonNull<u8> {
        // SAFETY: addresses inside the data pages are never null.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Occupancy bitmap of a small-class page, stored in its first chunks.
    fn small_bitmap(&mut self, idx: usize, shift: u32) -> &mut [usize] {
        let words = (self.page_size() >> shift) / BITS;
        unsafe { core::slice::from_raw_parts_mut(self.page_addr(idx) as *mut usize, words) }
    }

    /// Chunks at the start of a small-class page holding its bitmap.
    fn small_reserved(&self, shift: u32) -> usize {
        let bitmap_bytes = (self.page_size() >> shift) / BITS * WORD_SIZE;
        (bitmap_bytes >> shift).max(1)
    }

    fn big_mask(&self, shift: u32) -> usize {
        (1 << (self.page_size() >> shift)) - 1
    }

    /// Claim the lowest free chunk of class page `idx`.
    fn claim_chunk(&mut self, idx: usize, shift: u32) -> Option<usize> {
        match self.state(idx) {
            PageState::Small { .. } => {
                let bitmap = self.small_bitmap(idx, shift);
                for (i, word) in bitmap.iter_mut().enumerate() {
                    if *word != usize::MAX {
                        let bit = word.trailing_ones() as usize;
                        *word |= 1 << bit;
                        return Some(i * BITS + bit);
                    }
                }
                None
            }
            PageState::Exact { bitmap } => {
                if bitmap == usize::MAX {
                    return None;
                }
                let bit = bitmap.trailing_ones() as usize;
                self.set_state(idx, PageState::Exact { bitmap: bitmap | (1 << bit) });
                Some(bit)
            }
            PageState::Big { shift, bitmap } => {
                if bitmap == self.big_mask(shift) {
                    return None;
                }
                let bit = bitmap.trailing_ones() as usize;
                self.set_state(idx, PageState::Big { shift, bitmap: bitmap | (1 << bit) });
                Some(bit)
            }
            _ => None,
        }
    }

    /// Turn a freshly allocated page into a class page with its first usable
    /// chunk claimed. Returns the page's chunk capacity and that chunk.
    fn init_class_page(&mut self, idx: usize, shift: u32) -> (usize, usize) {
        let chunks = self.page_size() >> shift;
        let exact_shift = self.header().exact_shift;

        if shift < exact_shift {
            let reserved = self.small_reserved(shift);
            let bitmap = self.small_bitmap(idx, shift);
            bitmap.fill(0);
            // reserved chunks plus the one handed out
            for bit in 0..=reserved {
                bitmap[bit / BITS] |= 1 << (bit % BITS);
            }
            self.set_state(idx, PageState::Small { shift });
            (chunks - reserved, reserved)
        } else if shift == exact_shift {
            self.set_state(idx, PageState::Exact { bitmap: 1 });
            (chunks, 0)
        } else {
            self.set_state(idx, PageState::Big { shift, bitmap: 1 });
            (chunks, 0)
        }
    }

    /// Free a pointer returned by this pool. The caller holds the pool's
    /// mutex.
    pub fn free_locked(&mut self, ptr: NonNull<u8>) -> AllocResult {
        let addr = ptr.as_ptr() as usize;
        let (start, end) = self.data_range();

        debug!("slab: free {:#x}", addr);

        if addr < start || addr >= end {
            error!("{}: slab free({:#x}): outside of pool", self.log_context(), addr);
            return Err(AllocError::InvalidPointer);
        }

        let page_shift = self.header().page_shift;
        let idx = self.first_page() + ((addr - start) >> page_shift);
        let offset = (addr - start) & ((1 << page_shift) - 1);

        match self.state(idx) {
            PageState::Small { shift } => {
                let chunk = self.class_chunk(offset, shift, addr)?;
                if chunk < self.small_reserved(shift) {
                    return Err(self.wrong_chunk(addr));
                }
                let bitmap = self.small_bitmap(idx, shift);
                let (word, bit) = (chunk / BITS, 1usize << (chunk % BITS));
                if bitmap[word] & bit == 0 {
                    return Err(self.chunk_already_free(addr));
                }
                bitmap[word] &= !bit;

                let reserved = self.small_reserved(shift);
                let empty = self
                    .small_bitmap(idx, shift)
                    .iter()
                    .enumerate()
                    .all(|(i, &word)| word == reserved_mask(i, reserved));
                self.chunk_freed(idx, shift, empty);
            }
            PageState::Exact { bitmap } => {
                let shift = self.header().exact_shift;
                let chunk = self.class_chunk(offset, shift, addr)?;
                let bit = 1usize << chunk;
                if bitmap & bit == 0 {
                    return Err(self.chunk_already_free(addr));
                }
                self.set_state(idx, PageState::Exact { bitmap: bitmap & !bit });
                self.chunk_freed(idx, shift, bitmap & !bit == 0);
            }
            PageState::Big { shift, bitmap } => {
                let chunk = self.class_chunk(offset, shift, addr)?;
                let bit = 1usize << chunk;
                if bitmap & bit == 0 {
                    return Err(self.chunk_already_free(addr));
                }
                self.set_state(idx, PageState::Big { shift, bitmap: bitmap & !bit });
                self.chunk_freed(idx, shift, bitmap & !bit == 0);
            }
            PageState::BusyRun { pages } => {
                if offset != 0 {
                    return Err(self.wrong_chunk(addr));
                }
                self.free_run(idx, pages);
            }
            PageState::BusyInner => return Err(self.wrong_chunk(addr)),
            PageState::FreeRun { .. } | PageState::FreeInner => {
                error!("{}: slab free({:#x}): page is already free", self.log_context(), addr);
                return Err(AllocError::NotAllocated);
            }
        }

        Ok(())
    }

    fn class_chunk(&self, offset: usize, shift: u32, addr: usize) -> AllocResult<usize> {
        if offset & ((1 << shift) - 1) != 0 {
            return Err(self.wrong_chunk(addr));
        }
        Ok(offset >> shift)
    }

    fn wrong_chunk(&self, addr: usize) -> AllocError {
        error!("{}: slab free({:#x}): pointer to wrong chunk", self.log_context(), addr);
        AllocError::InvalidPointer
    }

    fn chunk_already_free(&self, addr: usize) -> AllocError {
        error!("{}: slab free({:#x}): chunk is already free", self.log_context(), addr);
        AllocError::NotAllocated
    }

    /// Account for a freed chunk and give the page back once it is empty.
    fn chunk_freed(&mut self, idx: usize, shift: u32, empty: bool) {
        debug_assert!(self.state(idx).is_class_page());
        let slot = (shift - self.header().min_shift) as usize;
        self.stat_mut(slot).used -= 1;

        if empty {
            debug!("slab: page {} of slot {} is empty", idx - self.first_page(), slot);
            self.unlink(idx);
            self.free_run(idx, 1);
        }
    }

    /// First-fit `n` pages from the free-run list.
    fn alloc_pages(&mut self, n: usize) -> Option<usize> {
        let mut idx = self.desc(FREE_LIST).next;

        while idx != FREE_LIST {
            let PageState::FreeRun { pages } = self.state(idx) else {
                idx = self.desc(idx).next;
                continue;
            };

            if pages < n {
                idx = self.desc(idx).next;
                continue;
            }

            if pages > n {
                let rest = idx + n;
                self.set_state(rest, PageState::FreeRun { pages: pages - n });
                self.replace(idx, rest);
                if pages - n > 1 {
                    self.desc_mut(idx + pages - 1).set_prev(rest);
                }
            } else {
                self.unlink(idx);
            }

            self.set_state(idx, PageState::BusyRun { pages: n });
            for inner in idx + 1..idx + n {
                self.set_state(inner, PageState::BusyInner);
            }

            let pfree = self.free_pages() - n;
            self.set_free_pages(pfree);
            return Some(idx);
        }

        None
    }

    /// Return the run of `n` pages at `idx` to the free list, merging it with
    /// free runs on either side.
    fn free_run(&mut self, idx: usize, n: usize) {
        let first = self.first_page();
        let end = first + self.header().pages;

        let pfree = self.free_pages() + n;
        self.set_free_pages(pfree);

        for inner in idx..idx + n {
            self.set_state(inner, PageState::FreeInner);
        }

        let mut head = idx;
        let mut pages = n;

        let next = idx + n;
        if next < end {
            if let PageState::FreeRun { pages: next_pages } = self.state(next) {
                self.unlink(next);
                self.set_state(next, PageState::FreeInner);
                pages += next_pages;
            }
        }

        if idx > first {
            let prev_head = match self.state(idx - 1) {
                PageState::FreeRun { .. } => Some(idx - 1),
                PageState::FreeInner => Some(self.desc(idx - 1).prev()),
                _ => None,
            };

            if let Some(prev_head) = prev_head.filter(|&h| h >= first && h < idx) {
                if let PageState::FreeRun { pages: prev_pages } = self.state(prev_head) {
                    self.unlink(prev_head);
                    pages += prev_pages;
                    head = prev_head;
                }
            }
        }

        self.set_state(head, PageState::FreeRun { pages });
        if pages > 1 {
            self.desc_mut(head + pages - 1).set_prev(head);
        }
        self.push_front(FREE_LIST, head);

        debug!(
            "slab: free run of {} page(s) at page {}, {} free",
            pages,
            head - first,
            pfree
        );
    }
}

/// Bitmap word `i` of an empty small-class page with `reserved` chunks.
fn reserved_mask(i: usize, reserved: usize) -> usize {
    let lo = i * BITS;
    if reserved <= lo {
        0
    } else if reserved >= lo + BITS {
        usize::MAX
    } else {
        (1 << (reserved - lo)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::sizes_init;
    use crate::Context;
    use alloc::alloc::{alloc, dealloc};
    use alloc::vec::Vec;
    use core::alloc::Layout;

    const PAGE: usize = 4096;

    fn with_pool(pages: usize, min_shift: u32, f: impl FnOnce(&mut SlabPool)) {
        let size = (pages + 1) * PAGE;
        let layout = Layout::from_size_align(size, PAGE).unwrap();
        let region = NonNull::new(unsafe { alloc(layout) }).unwrap();
        let sizes = sizes_init(&Context::new(PAGE, 1).unwrap());
        let mut pool = unsafe { SlabPool::init_with_min_shift(region, size, &sizes, min_shift) }.unwrap();
        f(&mut pool);
        unsafe { dealloc(region.as_ptr(), layout) };
    }

    #[test]
    fn test_layout() {
        with_pool(16, 3, |pool| {
            assert_eq!(pool.total_pages(), 16);
            assert_eq!(pool.free_pages(), 16);
            assert_eq!(pool.slot_count(), 9);
            assert_eq!(pool.slot_size(0), 8);
            assert_eq!(pool.slot_size(8), 2048);
            let (start, end) = pool.data_range();
            assert_eq!(start % PAGE, 0);
            assert_eq!(end - start, 16 * PAGE);
            assert_eq!(pool.mutex_state().as_ptr() as usize, pool.base.as_ptr() as usize);
        });
    }

    #[test]
    fn test_init_rejects_tiny_region() {
        let sizes = sizes_init(&Context::new(PAGE, 1).unwrap());
        let layout = Layout::from_size_align(PAGE, PAGE).unwrap();
        let region = NonNull::new(unsafe { alloc(layout) }).unwrap();

        let res = unsafe { SlabPool::init(region, PAGE, &sizes) };
        assert_eq!(res.err(), Some(AllocError::InvalidParam));

        let res = unsafe { SlabPool::init_with_min_shift(region, PAGE, &sizes, 12) };
        assert_eq!(res.err(), Some(AllocError::InvalidParam));

        unsafe { dealloc(region.as_ptr(), layout) };
    }

    #[test]
    fn test_split_and_coalesce() {
        with_pool(8, 3, |pool| {
            let a = pool.alloc_locked(3 * PAGE).unwrap();
            let b = pool.alloc_locked(2 * PAGE).unwrap();
            let c = pool.alloc_locked(PAGE).unwrap();
            assert_eq!(pool.free_pages(), 2);
            assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 3 * PAGE);

            // free the middle run first, then its neighbours
            pool.free_locked(b).unwrap();
            pool.free_locked(a).unwrap();
            pool.free_locked(c).unwrap();
            assert_eq!(pool.free_pages(), 8);

            // everything merged back into one run
            let all = pool.alloc_locked(8 * PAGE).unwrap();
            assert_eq!(all, a);
            assert_eq!(pool.free_pages(), 0);
            assert_eq!(pool.alloc_locked(1).err(), Some(AllocError::NoMemory));
            pool.free_locked(all).unwrap();
        });
    }

    #[test]
    fn test_mixed_workload_reclaims_every_page() {
        with_pool(32, 3, |pool| {
            pool.set_log_nomem(false);
            let (start, end) = pool.data_range();
            let mut live: Vec<(usize, usize)> = Vec::new();
            let mut seed = 0x2545_f491_4f6c_dd1du64;
            let mut next = move || {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed as usize
            };

            for _ in 0..3000 {
                let r = next();
                if live.is_empty() || r % 3 != 0 {
                    let size = match r % 4 {
                        0 => (r >> 8) % (3 * PAGE) + 1,
                        _ => (r >> 8) % 2048 + 1,
                    };
                    if let Ok(p) = pool.alloc_locked(size) {
                        let addr = p.as_ptr() as usize;
                        assert!(addr >= start && addr + size <= end);
                        assert!(live.iter().all(|&(a, s)| addr + size <= a || a + s <= addr));
                        live.push((addr, size));
                    }
                } else {
                    let (addr, _) = live.swap_remove((r >> 8) % live.len());
                    pool.free_locked(NonNull::new(addr as *mut u8).unwrap()).unwrap();
                }
            }

            for (addr, _) in live {
                pool.free_locked(NonNull::new(addr as *mut u8).unwrap()).unwrap();
            }
            assert_eq!(pool.free_pages(), pool.total_pages());

            let all = pool.alloc_locked(32 * PAGE).unwrap();
            assert_eq!(all.as_ptr() as usize, start);
            pool.free_locked(all).unwrap();
        });
    }

    #[test]
    fn test_small_class_reserves_bitmap_chunks() {
        with_pool(4, 3, |pool| {
            let reserved = pool.small_reserved(3);
            assert_eq!(reserved, (PAGE / 8 / 8) / 8);

            let first = pool.alloc_locked(8).unwrap();
            let (start, _) = pool.data_range();
            assert_eq!(first.as_ptr() as usize, start + reserved * 8);

            let stat = pool.stat(0).unwrap();
            assert_eq!(stat.total, PAGE / 8 - reserved);
            assert_eq!(stat.used, 1);

            // bitmap chunks are not allocations
            let bitmap_chunk = NonNull::new(start as *mut u8).unwrap();
            assert_eq!(pool.free_locked(bitmap_chunk), Err(AllocError::InvalidPointer));

            pool.free_locked(first).unwrap();
            assert_eq!(pool.free_pages(), 4);
            assert_eq!(pool.stat(0).unwrap().used, 0);
        });
    }

    #[test]
    fn test_fill_small_page() {
        with_pool(4, 3, |pool| {
            let capacity = PAGE / 16 - pool.small_reserved(4);
            let mut ptrs = Vec::new();
            for _ in 0..capacity {
                ptrs.push(pool.alloc_locked(16).unwrap());
            }
            assert_eq!(pool.free_pages(), 3);

            // the next one needs a second page
            ptrs.push(pool.alloc_locked(16).unwrap());
            assert_eq!(pool.free_pages(), 2);

            for ptr in ptrs {
                pool.free_locked(ptr).unwrap();
            }
            assert_eq!(pool.free_pages(), 4);
        });
    }

    #[test]
    fn test_exact_class() {
        with_pool(2, 3, |pool| {
            let exact = 1 << sizes_init(&Context::new(PAGE, 1).unwrap()).exact_shift();
            let mut ptrs = Vec::new();
            for _ in 0..BITS {
                ptrs.push(pool.alloc_locked(exact).unwrap());
            }
            assert_eq!(pool.free_pages(), 1);
            let (start, _) = pool.data_range();
            assert_eq!(ptrs[0].as_ptr() as usize, start);
            assert_eq!(ptrs[BITS - 1].as_ptr() as usize, start + (BITS - 1) * exact);

            pool.free_locked(ptrs[5]).unwrap();
            assert_eq!(pool.free_locked(ptrs[5]), Err(AllocError::NotAllocated));
            assert_eq!(pool.alloc_locked(exact).unwrap(), ptrs[5]);
        });
    }

    #[test]
    fn test_free_rejects_bad_pointers() {
        with_pool(4, 3, |pool| {
            let (start, end) = pool.data_range();
            let outside = NonNull::new(end as *mut u8).unwrap();
            assert_eq!(pool.free_locked(outside), Err(AllocError::InvalidPointer));

            let never = NonNull::new(start as *mut u8).unwrap();
            assert_eq!(pool.free_locked(never), Err(AllocError::NotAllocated));

            let p = pool.alloc_locked(1024).unwrap();
            let inside = NonNull::new(unsafe { p.as_ptr().add(8) }).unwrap();
            assert_eq!(pool.free_locked(inside), Err(AllocError::InvalidPointer));

            let run = pool.alloc_locked(2 * PAGE).unwrap();
            let inner = NonNull::new(unsafe { run.as_ptr().add(PAGE) }).unwrap();
            assert_eq!(pool.free_locked(inner), Err(AllocError::InvalidPointer));

            pool.free_locked(run).unwrap();
            assert_eq!(pool.free_locked(run), Err(AllocError::NotAllocated));
            pool.free_locked(p).unwrap();
        });
    }

    #[test]
    fn test_exhaustion_counts_failures() {
        with_pool(1, 3, |pool| {
            pool.set_log_nomem(false);
            let page = pool.alloc_locked(PAGE).unwrap();
            assert_eq!(pool.alloc_locked(100).err(), Some(AllocError::NoMemory));

            let slot = (class_shift(100, 3) - 3) as usize;
            let stat = pool.stat(slot).unwrap();
            assert_eq!(stat.reqs, 1);
            assert_eq!(stat.fails, 1);
            assert_eq!(stat.used, 0);
            pool.free_locked(page).unwrap();
        });
    }

    #[test]
    fn test_log_context() {
        with_pool(1, 3, |pool| {
            assert_eq!(pool.log_context(), "");
            pool.set_log_context("zone one");
            assert_eq!(pool.log_context(), "zone one");

            pool.set_log_context("ééééééééééééééééééééé");
            assert!(pool.log_context().len() <= LOG_CTX_MAX);
            assert!(pool.log_context().starts_with('é'));
        });
    }

    #[test]
    fn test_reserved_mask() {
        assert_eq!(reserved_mask(0, 8), 0xff);
        assert_eq!(reserved_mask(1, 8), 0);
        assert_eq!(reserved_mask(0, BITS + 2), usize::MAX);
        assert_eq!(reserved_mask(1, BITS + 2), 0b11);
    }
}
