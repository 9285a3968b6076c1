//! Hybrid spin/semaphore mutex for memory shared between processes.

mod hybrid_mutex;
mod semaphore;

pub use hybrid_mutex::{
    HybridMutex, HybridMutexGuard, ShmtxShared, DEFAULT_SPIN, SPIN_ONLY,
};
