//! Slab pool: power-of-two size classes and whole-page runs carved out of one
//! shared region.

mod size_class;
mod slab_page;
mod slab_pool;
mod stats;

pub use size_class::{sizes_init, SlabSizes, DEFAULT_MIN_SHIFT};
pub use slab_pool::{SlabPool, LOG_CTX_MAX};
pub use stats::SlabStat;
