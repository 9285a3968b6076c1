//! Private-memory arena.

mod arena_allocator;
mod arena_block;
mod backing;

#[cfg(feature = "tracking")]
pub use arena_allocator::ArenaStats;
pub use arena_allocator::{Arena, CleanupHandler};
pub use backing::{BackingAllocator, Heap};
