//! Integration tests for the slab pool
//!
//! Pools are laid out in anonymous shared mappings, as worker processes
//! would use them.

#![no_std]

extern crate alloc;
extern crate arena_slab_allocator;

use alloc::vec::Vec;
use arena_slab_allocator::{sizes_init, AllocError, Context, SharedRegion, SlabPool};
use core::ptr::NonNull;

const PAGE_SIZE: usize = 0x1000;

/// Map a region that leaves exactly `pages` data pages after the header.
fn with_pool(pages: usize, f: impl FnOnce(&mut SlabPool)) {
    let ctx = Context::new(PAGE_SIZE, 1).unwrap();
    let region = SharedRegion::new((pages + 1) * PAGE_SIZE).unwrap();
    let mut pool = unsafe { SlabPool::init(region.as_ptr(), region.len(), &sizes_init(&ctx)) }.unwrap();
    assert_eq!(pool.total_pages(), pages);
    f(&mut pool);
}

fn slot_of(pool: &SlabPool, size: usize) -> usize {
    (0..pool.slot_count())
        .find(|&slot| pool.slot_size(slot) >= size)
        .unwrap()
}

#[test]
fn test_1k_chunks_fill_one_page() {
    with_pool(16, |pool| {
        let ptrs: Vec<usize> = (0..4)
            .map(|_| pool.alloc_locked(1024).unwrap().as_ptr() as usize)
            .collect();

        let page = ptrs[0] & !(PAGE_SIZE - 1);
        let offsets: Vec<usize> = ptrs.iter().map(|p| p - page).collect();
        assert_eq!(offsets, [0, 1024, 2048, 3072]);

        let fifth = pool.alloc_locked(1024).unwrap().as_ptr() as usize;
        assert_ne!(fifth & !(PAGE_SIZE - 1), page);
        assert_eq!(fifth % PAGE_SIZE, 0);
        assert_eq!(pool.free_pages(), 14);

        let stat = pool.stat(slot_of(pool, 1024)).unwrap();
        assert_eq!(stat.total, 8);
        assert_eq!(stat.used, 5);
        assert_eq!(stat.reqs, 5);
        assert_eq!(stat.fails, 0);
    });
}

#[test]
fn test_every_class_round_trip() {
    with_pool(32, |pool| {
        let (start, end) = pool.data_range();
        let mut size = 1;
        while size <= pool.max_size() {
            let p = pool.alloc_locked(size).unwrap();
            let addr = p.as_ptr() as usize;
            let chunk = pool.slot_size(slot_of(pool, size));

            assert!(addr >= start && addr + size <= end);
            assert_eq!(addr % chunk, 0);

            unsafe { core::ptr::write_bytes(p.as_ptr(), 0xa5, size) };
            pool.free_locked(p).unwrap();

            let q = pool.alloc_locked(size).unwrap();
            assert_eq!(q.as_ptr() as usize % chunk, 0);
            pool.free_locked(q).unwrap();

            size = size * 2 + 1;
        }
        assert_eq!(pool.free_pages(), 32);
    });
}

#[test]
fn test_calloc_clears_reused_chunk() {
    with_pool(4, |pool| {
        let p = pool.alloc_locked(200).unwrap();
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0xff, 200) };
        pool.free_locked(p).unwrap();

        let q = pool.calloc_locked(200).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 200) };
        assert!(bytes.iter().all(|&b| b == 0));
    });
}

#[test]
fn test_page_runs_coalesce() {
    with_pool(10, |pool| {
        let runs: Vec<NonNull<u8>> = [1, 2, 3, 4]
            .iter()
            .map(|&n| pool.alloc_locked(n * PAGE_SIZE).unwrap())
            .collect();
        assert_eq!(pool.free_pages(), 0);
        assert_eq!(pool.alloc_locked(PAGE_SIZE).err(), Some(AllocError::NoMemory));

        // free 1 and 3 first: two separate holes, none large enough for 5 pages
        pool.free_locked(runs[0]).unwrap();
        pool.free_locked(runs[2]).unwrap();
        assert_eq!(pool.free_pages(), 4);
        assert_eq!(pool.alloc_locked(5 * PAGE_SIZE).err(), Some(AllocError::NoMemory));

        // freeing the run between them joins all three
        pool.free_locked(runs[1]).unwrap();
        let joined = pool.alloc_locked(6 * PAGE_SIZE).unwrap();
        assert_eq!(joined, runs[0]);

        pool.free_locked(joined).unwrap();
        pool.free_locked(runs[3]).unwrap();
        assert_eq!(pool.free_pages(), 10);
        assert!(pool.alloc_locked(10 * PAGE_SIZE).is_ok());
    });
}

#[test]
fn test_mixed_classes_return_all_pages() {
    with_pool(32, |pool| {
        let mut live = Vec::new();
        for i in 0..70 {
            let size = [8, 24, 64, 100, 512, 2048, 3000][i % 7];
            live.push(pool.alloc_locked(size).unwrap());
        }

        // free every other pointer, then the rest
        let (even, odd): (Vec<_>, Vec<_>) = live.iter().enumerate().partition(|(i, _)| i % 2 == 0);
        for (_, p) in even.into_iter().chain(odd) {
            pool.free_locked(*p).unwrap();
        }

        assert_eq!(pool.free_pages(), 32);
        for slot in 0..pool.slot_count() {
            let stat = pool.stat(slot).unwrap();
            assert_eq!(stat.used, 0);
            assert!(stat.total >= stat.used);
        }
    });
}

#[test]
fn test_exhaustion_then_recovery() {
    with_pool(2, |pool| {
        pool.set_log_nomem(false);

        let mut ptrs = Vec::new();
        while let Ok(p) = pool.alloc_locked(2048) {
            ptrs.push(p);
        }
        assert_eq!(ptrs.len(), 4);
        assert_eq!(pool.free_pages(), 0);

        let stat = pool.stat(slot_of(pool, 2048)).unwrap();
        assert_eq!(stat.fails, 1);

        pool.free_locked(ptrs.pop().unwrap()).unwrap();
        assert!(pool.alloc_locked(2048).is_ok());
    });
}
