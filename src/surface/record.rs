//! Process-local buffer record behind every surface handle.

use crate::backend::{Allocation, BufferDescriptor};
use crate::error::{Error, Result};
use crate::format::SurfaceLayout;
use crate::id::{BufferId, RegionHandle};
use bitflags::bitflags;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

bitflags! {
    /// Options for [`SurfaceHandle::lock`](super::SurfaceHandle::lock) and
    /// [`SurfaceHandle::unlock`](super::SurfaceHandle::unlock).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LockOptions: u32 {
        /// Shared read lock. Without it the lock is exclusive.
        const READ_ONLY = 1 << 0;
        /// Block on contention instead of failing with `Busy`.
        const WAIT = 1 << 1;
    }
}

/// Reclaim state of a buffer's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PurgeableState {
    /// Contents must be kept.
    #[default]
    NonVolatile,
    /// Contents may be discarded.
    Volatile,
    /// Contents have been discarded.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    Unlocked,
    /// Shared lock with its nesting depth across all readers.
    Shared { readers: u32 },
    Exclusive { owner: ThreadId },
}

/// Result of a successful acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquired {
    /// The record went from unlocked to locked; the backend must map it.
    First,
    /// Another shared reader joined.
    Nested,
}

/// Mutable part of a record, guarded by the record mutex.
pub(crate) struct RecordState {
    pub allocation: Option<Allocation>,
    pub lock: LockState,
    pub seed: u32,
    pub local_use: u32,
    pub purgeable: PurgeableState,
    pub contents_discarded: bool,
    pub attachments: BTreeMap<String, Bytes>,
}

impl RecordState {
    fn new(allocation: Allocation) -> Self {
        Self {
            allocation: Some(allocation),
            lock: LockState::Unlocked,
            seed: 0,
            local_use: 1,
            purgeable: PurgeableState::NonVolatile,
            contents_discarded: false,
            attachments: BTreeMap::new(),
        }
    }

    /// Try to take the lock without blocking.
    ///
    /// `Ok(None)` means contention: the caller either waits or reports `Busy`.
    pub fn try_acquire(&mut self, read_only: bool, thread: ThreadId) -> Result<Option<Acquired>> {
        match (self.lock, read_only) {
            (LockState::Unlocked, true) => {
                self.lock = LockState::Shared { readers: 1 };
                Ok(Some(Acquired::First))
            }
            (LockState::Unlocked, false) => {
                self.lock = LockState::Exclusive { owner: thread };
                Ok(Some(Acquired::First))
            }
            (LockState::Shared { readers }, true) => {
                self.lock = LockState::Shared {
                    readers: readers + 1,
                };
                Ok(Some(Acquired::Nested))
            }
            (LockState::Exclusive { owner }, _) if owner == thread => Err(Error::AlreadyLocked),
            _ => Ok(None),
        }
    }

    /// Release one hold. Returns `true` when the record became unlocked.
    pub fn release(&mut self, read_only: bool, thread: ThreadId) -> Result<bool> {
        match (self.lock, read_only) {
            (LockState::Shared { readers }, true) => {
                if readers > 1 {
                    self.lock = LockState::Shared {
                        readers: readers - 1,
                    };
                    Ok(false)
                } else {
                    self.lock = LockState::Unlocked;
                    Ok(true)
                }
            }
            (LockState::Exclusive { owner }, false) => {
                if owner != thread {
                    return Err(Error::NotAllowed(
                        "exclusive lock is held by another thread".into(),
                    ));
                }
                self.lock = LockState::Unlocked;
                self.seed = self.seed.wrapping_add(1);
                Ok(true)
            }
            _ => Err(Error::NotLocked),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock != LockState::Unlocked
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Entering [`PurgeableState::Empty`] zero-fills the memory.
    pub fn set_purgeable(&mut self, next: PurgeableState) -> Result<PurgeableState> {
        let previous = self.purgeable;
        if previous == next {
            return Ok(previous);
        }

        match (previous, next) {
            (PurgeableState::NonVolatile, PurgeableState::Empty) => Err(Error::NotAllowed(
                "a non-volatile buffer must become volatile before it can be emptied".into(),
            )),
            (_, PurgeableState::Empty) => {
                if self.is_locked() {
                    return Err(Error::Busy);
                }
                if let Some(allocation) = &self.allocation {
                    // SAFETY: the record is unlocked, so no local mapping is in use.
                    unsafe { allocation.segment().zero() };
                }
                self.purgeable = next;
                self.contents_discarded = true;
                Ok(previous)
            }
            (_, PurgeableState::NonVolatile) => {
                self.purgeable = next;
                if std::mem::take(&mut self.contents_discarded) {
                    return Err(Error::Purged);
                }
                Ok(previous)
            }
            (_, PurgeableState::Volatile) => {
                self.purgeable = next;
                Ok(previous)
            }
        }
    }
}

/// Everything a process knows about one buffer it holds.
pub(crate) struct BufferRecord {
    pub id: BufferId,
    pub descriptor: BufferDescriptor,
    pub layout: SurfaceLayout,
    pub alloc_size: usize,
    pub region: RegionHandle,
    pub owns_region: bool,
    freed: AtomicBool,
    state: Mutex<RecordState>,
    /// Signalled whenever the record becomes unlocked or is freed.
    pub unlocked: Condvar,
}

impl BufferRecord {
    /// Wrap an allocation with one local use.
    pub fn new(id: BufferId, descriptor: BufferDescriptor, allocation: Allocation) -> Self {
        Self {
            id,
            descriptor,
            layout: allocation.layout().clone(),
            alloc_size: allocation.size(),
            region: allocation.region(),
            owns_region: allocation.owns_region(),
            freed: AtomicBool::new(false),
            state: Mutex::new(RecordState::new(allocation)),
            unlocked: Condvar::new(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until notified, returning the re-acquired state.
    pub fn wait<'a>(&self, guard: MutexGuard<'a, RecordState>) -> MutexGuard<'a, RecordState> {
        self.unlocked
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Take the allocation out of a record for release. The record stays freed.
    pub fn retire(&self, state: &mut RecordState) -> Option<Allocation> {
        self.freed.store(true, Ordering::Release);
        state.local_use = 0;
        state.attachments.clear();
        state.allocation.take()
    }

    pub fn freed_error(&self) -> Error {
        Error::NotFound(format!("surface {} has been freed", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AllocationBackend, HeapBackend};
    use crate::format::PixelFormat;
    use crate::memory::MemorySegment;

    fn state() -> RecordState {
        let backend = HeapBackend::default();
        let descriptor = BufferDescriptor::new(8, 8, PixelFormat::L8);
        RecordState::new(backend.allocate(&descriptor).unwrap())
    }

    fn this_thread() -> ThreadId {
        std::thread::current().id()
    }

    fn other_thread() -> ThreadId {
        std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap()
    }

    #[test]
    fn test_shared_locks_nest() {
        let mut state = state();
        let me = this_thread();
        assert_eq!(state.try_acquire(true, me).unwrap(), Some(Acquired::First));
        assert_eq!(state.try_acquire(true, me).unwrap(), Some(Acquired::Nested));
        assert_eq!(state.try_acquire(false, me).unwrap(), None);

        assert!(!state.release(true, me).unwrap());
        assert!(state.release(true, me).unwrap());
        assert_eq!(state.seed, 0);
    }

    #[test]
    fn test_exclusive_lock_rules() {
        let mut state = state();
        let me = this_thread();
        let other = other_thread();

        state.try_acquire(false, me).unwrap();
        assert!(matches!(state.try_acquire(false, me), Err(Error::AlreadyLocked)));
        assert_eq!(state.try_acquire(false, other).unwrap(), None);
        assert_eq!(state.try_acquire(true, other).unwrap(), None);

        assert!(matches!(state.release(true, me), Err(Error::NotLocked)));
        assert!(matches!(state.release(false, other), Err(Error::NotAllowed(_))));
        assert!(state.release(false, me).unwrap());
        assert_eq!(state.seed, 1);
        assert!(matches!(state.release(false, me), Err(Error::NotLocked)));
    }

    #[test]
    fn test_purgeable_transitions() {
        let mut state = state();
        unsafe { *state.allocation.as_ref().unwrap().segment().as_mut_ptr() = 9 };

        assert!(matches!(
            state.set_purgeable(PurgeableState::Empty),
            Err(Error::NotAllowed(_))
        ));
        assert_eq!(
            state.set_purgeable(PurgeableState::Volatile).unwrap(),
            PurgeableState::NonVolatile
        );
        assert_eq!(
            state.set_purgeable(PurgeableState::NonVolatile).unwrap(),
            PurgeableState::Volatile
        );

        state.set_purgeable(PurgeableState::Volatile).unwrap();
        assert_eq!(
            state.set_purgeable(PurgeableState::Empty).unwrap(),
            PurgeableState::Volatile
        );
        assert!(state.contents_discarded);
        unsafe {
            assert_eq!(*state.allocation.as_ref().unwrap().segment().as_ptr(), 0);
        }

        assert_eq!(
            state.set_purgeable(PurgeableState::Volatile).unwrap(),
            PurgeableState::Empty
        );
        assert!(matches!(
            state.set_purgeable(PurgeableState::NonVolatile),
            Err(Error::Purged)
        ));
        assert_eq!(state.purgeable, PurgeableState::NonVolatile);
        assert!(!state.contents_discarded);
    }

    #[test]
    fn test_empty_requires_unlocked() {
        let mut state = state();
        state.set_purgeable(PurgeableState::Volatile).unwrap();
        state.try_acquire(true, this_thread()).unwrap();
        assert!(matches!(
            state.set_purgeable(PurgeableState::Empty),
            Err(Error::Busy)
        ));
        assert_eq!(state.purgeable, PurgeableState::Volatile);
    }
}
