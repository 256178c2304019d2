//! Crash-recoverable cross-process mutex.
//!
//! A process-shared, robust pthread mutex placed inside the registry region.
//! When a holder dies (process or thread exit) the kernel marks the futex, and
//! the next `pthread_mutex_lock` returns `EOWNERDEAD` instead of blocking
//! forever. The new holder decides how to repair the protected data and marks
//! the mutex consistent.

use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// How a lock acquisition went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Normal acquisition.
    Acquired,
    /// The previous holder died while holding the lock. The protected data
    /// may be mid-update.
    OwnerDied,
}

/// Robust process-shared mutex living in shared memory.
///
/// Never constructed by value: [`RobustMutex::init`] initializes one in place
/// and other processes reach it through their own mapping.
#[repr(transparent)]
pub struct RobustMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed for concurrent use; this one is
// PTHREAD_PROCESS_SHARED so any thread of any process may lock it.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

impl RobustMutex {
    /// Initialize a mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory valid for a `RobustMutex` that no
    /// other thread or process is using yet.
    pub unsafe fn init(this: *mut RobustMutex) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: the attribute object is initialized before use and destroyed
        // on every path; `this` is valid per the caller's contract.
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let result = check(libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|()| {
                check(libc::pthread_mutexattr_setrobust(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_MUTEX_ROBUST,
                ))
            })
            .and_then(|()| check(libc::pthread_mutex_init((*this).raw.get(), attr.as_ptr())));
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result
        }
    }

    /// Block until the mutex is held by the calling thread.
    ///
    /// On [`LockOutcome::OwnerDied`] the mutex has already been marked
    /// consistent; the caller still owns the repair of the protected data.
    pub fn lock(&self) -> Result<LockOutcome> {
        // SAFETY: the mutex was initialized by `init` before the region's
        // magic was published.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        match rc {
            0 => Ok(LockOutcome::Acquired),
            libc::EOWNERDEAD => {
                // SAFETY: we hold the mutex in the owner-died state.
                unsafe { self.make_consistent()? };
                Ok(LockOutcome::OwnerDied)
            }
            rc => Err(errno(rc)),
        }
    }

    /// Clear the owner-died mark. On failure the mutex is released.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the mutex.
    unsafe fn make_consistent(&self) -> Result<()> {
        // SAFETY: held per the caller's contract.
        let result = check(unsafe { libc::pthread_mutex_consistent(self.raw.get()) });
        if result.is_err() {
            // SAFETY: still held.
            unsafe { self.unlock() };
        }
        result
    }

    /// Acquire and return a guard that unlocks on drop.
    pub fn lock_guard(&self) -> Result<(RobustMutexGuard<'_>, LockOutcome)> {
        let outcome = self.lock()?;
        Ok((RobustMutexGuard { mutex: self }, outcome))
    }

    /// Release the mutex.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the mutex.
    pub unsafe fn unlock(&self) {
        // SAFETY: forwarded from the caller's contract.
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        if rc != 0 {
            tracing::error!(rc, "pthread_mutex_unlock failed on registry mutex");
        }
    }
}

/// Held lock on a [`RobustMutex`]. Dropping it unlocks.
///
/// Forgetting the guard leaves the mutex held until the thread exits, at which
/// point the next locker observes [`LockOutcome::OwnerDied`].
#[must_use = "the mutex unlocks as soon as the guard is dropped"]
pub struct RobustMutexGuard<'a> {
    mutex: &'a RobustMutex,
}

impl Drop for RobustMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread holds the mutex.
        unsafe { self.mutex.unlock() }
    }
}

fn check(rc: libc::c_int) -> Result<()> {
    if rc == 0 { Ok(()) } else { Err(errno(rc)) }
}

fn errno(rc: libc::c_int) -> Error {
    Error::System(rustix::io::Errno::from_raw_os_error(rc))
}
