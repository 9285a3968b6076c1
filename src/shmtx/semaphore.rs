//! Thin wrapper over a process-shared POSIX semaphore.

use core::ptr::NonNull;

use crate::{errno, AllocError, AllocResult};

/// A `sem_t` living in shared memory, addressed by pointer.
#[derive(Clone, Copy)]
pub(crate) struct Semaphore {
    sem: NonNull<libc::sem_t>,
}

impl Semaphore {
    pub(crate) fn new(sem: NonNull<libc::sem_t>) -> Self {
        Self { sem }
    }

    /// Initialize the semaphore as shared between processes, count 0.
    ///
    /// # Safety
    ///
    /// The semaphore must not be in use by any process.
    pub(crate) unsafe fn init(&self) -> AllocResult {
        if unsafe { libc::sem_init(self.sem.as_ptr(), 1, 0) } == -1 {
            return Err(AllocError::SyncPrimitive(errno()));
        }
        Ok(())
    }

    /// Block until the count is positive and decrement it. Interrupted
    /// waits are restarted.
    pub(crate) fn wait(&self) -> AllocResult {
        loop {
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                err => return Err(AllocError::SyncPrimitive(err)),
            }
        }
    }

    pub(crate) fn post(&self) -> AllocResult {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == -1 {
            return Err(AllocError::SyncPrimitive(errno()));
        }
        Ok(())
    }

    /// # Safety
    ///
    /// No process may be blocked on, or later use, the semaphore.
    pub(crate) unsafe fn destroy(&self) -> AllocResult {
        if unsafe { libc::sem_destroy(self.sem.as_ptr()) } == -1 {
            return Err(AllocError::SyncPrimitive(errno()));
        }
        Ok(())
    }
}
