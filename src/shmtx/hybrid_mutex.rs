//! Cross-process mutex: spin first, then sleep on a semaphore.
//!
//! The lock word holds the pid of the owning process, so a lock left behind
//! by a crashed worker can be identified and cleared with
//! [`HybridMutex::force_unlock`]. The waiter count tells `unlock` whether a
//! `sem_post` is needed at all.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "log")]
use log::{debug, error};

use super::semaphore::Semaphore;
use crate::{AllocError, Context};

/// Default spin ceiling.
pub const DEFAULT_SPIN: usize = 2048;

/// Spin ceiling that disables the semaphore: waiters spin (or yield on a
/// single CPU) until the lock is free.
pub const SPIN_ONLY: usize = usize::MAX;

/// State of a [`HybridMutex`] that must live in memory shared by every
/// process using the lock.
///
/// The first two words are the lock word and the waiter count.
#[repr(C)]
pub struct ShmtxShared {
    lock: AtomicUsize,
    wait: AtomicUsize,
    sem: UnsafeCell<libc::sem_t>,
}

// The semaphore is only reached through the sem_* calls.
unsafe impl Sync for ShmtxShared {}

impl ShmtxShared {
    /// Unlocked state with no waiters.
    pub fn zeroed() -> Self {
        Self {
            lock: AtomicUsize::new(0),
            wait: AtomicUsize::new(0),
            // SAFETY: sem_t is plain data; it is set up by sem_init before use.
            sem: UnsafeCell::new(unsafe { core::mem::zeroed() }),
        }
    }
}

#[inline]
fn current_pid() -> usize {
    // Read on every call: a forked child must not inherit its parent's pid.
    unsafe { libc::getpid() as usize }
}

/// Process-level lock over a [`ShmtxShared`].
///
/// Every process holds its own `HybridMutex` pointing at the same shared
/// state. The owner is the process, not the thread.
pub struct HybridMutex {
    shared: NonNull<ShmtxShared>,
    name: &'static str,
    spin: usize,
    /// `sem_init` succeeded; `destroy` and wake-ups still need it after
    /// this handle stops sleeping.
    sem_ready: bool,
    /// Waiters of this handle sleep on the semaphore.
    semaphore: Cell<bool>,
    ncpu: usize,
}

impl HybridMutex {
    /// Create a mutex with the default spin ceiling.
    ///
    /// # Safety
    ///
    /// `shared` must point to a zeroed or previously created
    /// [`ShmtxShared`] that outlives the mutex. The semaphore is
    /// (re)initialized, so no other process may be using the lock yet.
    pub unsafe fn create(shared: NonNull<ShmtxShared>, name: &'static str, ctx: &Context) -> Self {
        unsafe { Self::with_spin(shared, name, ctx, DEFAULT_SPIN) }
    }

    /// Create a mutex with an explicit spin ceiling; [`SPIN_ONLY`] skips the
    /// semaphore entirely.
    ///
    /// A failing `sem_init` is logged and leaves the mutex in spin/yield
    /// mode.
    ///
    /// # Safety
    ///
    /// Same as [`create`](Self::create).
    pub unsafe fn with_spin(
        shared: NonNull<ShmtxShared>,
        name: &'static str,
        ctx: &Context,
        spin: usize,
    ) -> Self {
        let mut mtx = Self {
            shared,
            name,
            spin,
            sem_ready: false,
            semaphore: Cell::new(false),
            ncpu: ctx.ncpu(),
        };

        if spin == SPIN_ONLY {
            return mtx;
        }

        match unsafe { mtx.sem().init() } {
            Ok(()) => {
                mtx.sem_ready = true;
                mtx.semaphore.set(true);
            }
            Err(err) => {
                error!("shmtx: sem_init() failed for \"{}\": {}", name, err);
            }
        }
        mtx
    }

    fn shared(&self) -> &ShmtxShared {
        unsafe { self.shared.as_ref() }
    }

    fn sem(&self) -> Semaphore {
        // SAFETY: UnsafeCell::get never returns null.
        Semaphore::new(unsafe { NonNull::new_unchecked(self.shared().sem.get()) })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether waiters sleep on the semaphore.
    pub fn has_semaphore(&self) -> bool {
        self.semaphore.get()
    }

    /// Take the lock if it is free. Never blocks.
    pub fn try_lock(&self) -> bool {
        let lock = &self.shared().lock;
        lock.load(Ordering::Relaxed) == 0
            && lock
                .compare_exchange(0, current_pid(), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Take the lock, spinning and then sleeping until it is free.
    pub fn lock(&self) {
        debug!("shmtx: lock \"{}\"", self.name);

        loop {
            if self.try_lock() {
                return;
            }

            if self.ncpu > 1 {
                let mut n = 1usize;
                while n < self.spin {
                    for _ in 0..n {
                        core::hint::spin_loop();
                    }
                    if self.try_lock() {
                        return;
                    }
                    // wraps back to 1 when spinning without a ceiling
                    n = n.rotate_left(1);
                }
            }

            if self.semaphore.get() {
                let shared = self.shared();
                shared.wait.fetch_add(1, Ordering::AcqRel);

                if self.try_lock() {
                    shared.wait.fetch_sub(1, Ordering::AcqRel);
                    return;
                }

                debug!(
                    "shmtx: \"{}\" waiting, {} waiter(s)",
                    self.name,
                    shared.wait.load(Ordering::Relaxed)
                );

                match self.sem().wait() {
                    Ok(()) => {
                        debug!("shmtx: \"{}\" awoke", self.name);
                    }
                    Err(err) => self.wait_failed(err),
                }
                continue;
            }

            unsafe { libc::sched_yield() };
        }
    }

    /// Take the lock and release it when the guard drops.
    pub fn lock_guard(&self) -> HybridMutexGuard<'_> {
        self.lock();
        HybridMutexGuard { mutex: self }
    }

    /// Release the lock held by this process and wake one waiter. A lock
    /// held by another process is left alone.
    pub fn unlock(&self) {
        if self.spin != SPIN_ONLY {
            debug!("shmtx: unlock \"{}\"", self.name);
        }

        if self
            .shared()
            .lock
            .compare_exchange(current_pid(), 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            self.wakeup();
        }
    }

    /// Release the lock if `pid` holds it, e.g. after that process died.
    /// Returns whether the lock was released.
    pub fn force_unlock(&self, pid: libc::pid_t) -> bool {
        debug!("shmtx: forced unlock \"{}\" held by {}", self.name, pid);

        if self
            .shared()
            .lock
            .compare_exchange(pid as usize, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            self.wakeup();
            return true;
        }
        false
    }

    /// Leave the waiter count and fall back to spin/yield for this handle.
    fn wait_failed(&self, err: AllocError) {
        error!(
            "shmtx: sem_wait() failed on \"{}\": {}, spinning from now on",
            self.name, err
        );
        self.take_waiter();
        self.semaphore.set(false);
    }

    /// Decrement the waiter count unless it is already zero. Returns the
    /// count before the decrement.
    fn take_waiter(&self) -> Option<usize> {
        let wait = &self.shared().wait;
        let mut n = wait.load(Ordering::Acquire);
        loop {
            if n == 0 {
                return None;
            }
            match wait.compare_exchange(n, n - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(n),
                Err(current) => n = current,
            }
        }
    }

    fn wakeup(&self) {
        if !self.sem_ready {
            return;
        }

        let Some(n) = self.take_waiter() else {
            return;
        };

        debug!("shmtx: wake up \"{}\", {} waiter(s) left", self.name, n - 1);

        if let Err(err) = self.sem().post() {
            error!("shmtx: sem_post() failed on \"{}\": {}", self.name, err);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.shared().lock.load(Ordering::Acquire) != 0
    }

    /// Pid of the process holding the lock.
    pub fn owner(&self) -> Option<libc::pid_t> {
        match self.shared().lock.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid as libc::pid_t),
        }
    }

    /// Number of processes sleeping (or about to sleep) on the semaphore.
    pub fn waiters(&self) -> usize {
        self.shared().wait.load(Ordering::Relaxed)
    }

    /// Destroy the semaphore. Only one process, with no other users of the
    /// lock left, may call this.
    pub fn destroy(&mut self) {
        if !self.sem_ready {
            return;
        }
        self.sem_ready = false;
        self.semaphore.set(false);

        if let Err(err) = unsafe { self.sem().destroy() } {
            error!("shmtx: sem_destroy() failed on \"{}\": {}", self.name, err);
        }
    }
}

/// Holds a [`HybridMutex`] until dropped.
pub struct HybridMutexGuard<'a> {
    mutex: &'a HybridMutex,
}

impl Drop for HybridMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
