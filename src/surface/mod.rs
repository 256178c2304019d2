//! Surface handles: the objects applications hold.
//!
//! A [`SurfaceHandle`] is a cheap, clonable reference to a process-local
//! buffer record. Clones of a handle share the record (lock state, seed,
//! use count, attachments); handles obtained in different processes for the
//! same buffer id share only the pixels.
//!
//! # Locking
//!
//! CPU access goes through [`SurfaceHandle::lock`]. Shared locks
//! ([`LockOptions::READ_ONLY`]) nest; an exclusive lock excludes everything
//! else. Each exclusive unlock bumps the seed, so a reader can tell whether
//! the contents changed since it last looked.
//!
//! ```rust,ignore
//! let seed = surface.lock(LockOptions::empty())?;
//! let base = surface.base_address().unwrap();
//! // ... write pixels ...
//! assert_eq!(surface.unlock(LockOptions::empty())?, seed + 1);
//! ```

mod record;

pub use record::{LockOptions, PurgeableState};
pub(crate) use record::BufferRecord;

use crate::allocator::AllocatorInner;
use crate::backend::UsageFlags;
use crate::error::{Error, Result};
use crate::format::{PixelFormat, PlaneInfo};
use crate::id::{BufferId, RegionHandle};
use crate::registry::AccessToken;
use bytes::Bytes;
use record::Acquired;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// Handle to a buffer held by this process.
#[derive(Clone)]
pub struct SurfaceHandle {
    record: Arc<BufferRecord>,
    allocator: Arc<AllocatorInner>,
}

impl SurfaceHandle {
    pub(crate) fn new(record: Arc<BufferRecord>, allocator: Arc<AllocatorInner>) -> Self {
        Self { record, allocator }
    }

    pub(crate) fn record(&self) -> &Arc<BufferRecord> {
        &self.record
    }

    pub(crate) fn allocator(&self) -> &Arc<AllocatorInner> {
        &self.allocator
    }

    /// The record, or `None` once freed.
    fn live(&self) -> Option<&BufferRecord> {
        (!self.record.is_freed()).then_some(&*self.record)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Buffer id.
    #[inline]
    pub fn id(&self) -> BufferId {
        self.record.id
    }

    /// Whether the handle still refers to live memory.
    pub fn is_valid(&self) -> bool {
        self.live().is_some()
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.live().map_or(0, |r| r.descriptor.width)
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.live().map_or(0, |r| r.descriptor.height)
    }

    /// Pixel format.
    pub fn pixel_format(&self) -> PixelFormat {
        self.live().map_or_else(PixelFormat::default, |r| r.descriptor.format)
    }

    /// Usage flags given at allocation.
    pub fn usage(&self) -> UsageFlags {
        self.live().map_or_else(UsageFlags::empty, |r| r.descriptor.usage)
    }

    /// Bytes per element of plane 0.
    pub fn bytes_per_element(&self) -> u32 {
        self.plane_bytes_per_element(0)
    }

    /// Row stride of plane 0.
    pub fn bytes_per_row(&self) -> usize {
        self.plane_bytes_per_row(0)
    }

    /// Page-rounded size of the backing region.
    pub fn alloc_size(&self) -> usize {
        self.live().map_or(0, |r| r.alloc_size)
    }

    /// Backing region handle.
    pub fn region(&self) -> RegionHandle {
        self.record.region
    }

    /// Whether this process created the backing region.
    pub fn owns_region(&self) -> bool {
        self.record.owns_region
    }

    /// Number of planes.
    pub fn plane_count(&self) -> usize {
        self.live().map_or(0, |r| r.layout.plane_count())
    }

    /// Geometry of plane `index`; zeroed when out of range or freed.
    pub fn plane_info(&self, index: usize) -> PlaneInfo {
        self.live()
            .map_or_else(PlaneInfo::default, |r| r.layout.plane(index))
    }

    /// Width of plane `index`.
    pub fn plane_width(&self, index: usize) -> u32 {
        self.plane_info(index).width
    }

    /// Height of plane `index`.
    pub fn plane_height(&self, index: usize) -> u32 {
        self.plane_info(index).height
    }

    /// Row stride of plane `index`.
    pub fn plane_bytes_per_row(&self, index: usize) -> usize {
        self.plane_info(index).bytes_per_row
    }

    /// Bytes per element of plane `index`.
    pub fn plane_bytes_per_element(&self, index: usize) -> u32 {
        self.plane_info(index).bytes_per_element
    }

    /// Byte offset of plane `index` from the base address.
    pub fn plane_offset(&self, index: usize) -> usize {
        self.plane_info(index).offset
    }

    /// Current seed, 0 once freed.
    pub fn seed(&self) -> u32 {
        self.live().map_or(0, |r| r.state().seed)
    }

    /// Number of local pins.
    pub fn local_use_count(&self) -> u32 {
        self.record.state().local_use
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Lock for CPU access and return the seed.
    ///
    /// Fails with [`Error::Busy`] on contention unless [`LockOptions::WAIT`]
    /// is set.
    pub fn lock(&self, options: LockOptions) -> Result<u32> {
        let read_only = options.contains(LockOptions::READ_ONLY);
        let thread = std::thread::current().id();
        let mut state = self.record.state();

        loop {
            if state.allocation.is_none() {
                return Err(self.record.freed_error());
            }
            match state.try_acquire(read_only, thread)? {
                Some(Acquired::First) => {
                    let mapped = match &state.allocation {
                        Some(allocation) => self.allocator.backend().map(allocation),
                        None => Ok(()),
                    };
                    if let Err(e) = mapped {
                        state.lock = record::LockState::Unlocked;
                        self.record.unlocked.notify_all();
                        return Err(e);
                    }
                    return Ok(state.seed);
                }
                Some(Acquired::Nested) => return Ok(state.seed),
                None if options.contains(LockOptions::WAIT) => {
                    state = self.record.wait(state);
                }
                None => return Err(Error::Busy),
            }
        }
    }

    /// Release a lock taken with the same `READ_ONLY` choice and return the
    /// seed, bumped if this was an exclusive unlock.
    pub fn unlock(&self, options: LockOptions) -> Result<u32> {
        let read_only = options.contains(LockOptions::READ_ONLY);
        let mut state = self.record.state();
        if state.allocation.is_none() {
            return Err(self.record.freed_error());
        }

        if state.release(read_only, std::thread::current().id())? {
            if let Some(allocation) = &state.allocation {
                if let Err(e) = self.allocator.backend().unmap(allocation) {
                    tracing::warn!(id = %self.record.id, error = %e, "backend unmap failed");
                }
            }
            self.record.unlocked.notify_all();
        }
        Ok(state.seed)
    }

    /// Base address of plane 0 while locked.
    pub fn base_address(&self) -> Option<NonNull<u8>> {
        self.plane_base_address(0)
    }

    /// Base address of plane `index` while locked.
    pub fn plane_base_address(&self, index: usize) -> Option<NonNull<u8>> {
        let state = self.record.state();
        if !state.is_locked() || index >= self.record.layout.plane_count() {
            return None;
        }
        let allocation = state.allocation.as_ref()?;
        let offset = self.record.layout.plane(index).offset;
        // SAFETY: plane offsets lie inside the allocation (layout invariant).
        NonNull::new(unsafe { allocation.segment().as_mut_ptr().add(offset) })
    }

    // =========================================================================
    // Use counts
    // =========================================================================

    /// Pin the buffer. The first pin adds this process's vote to the
    /// registry. Returns the new local count.
    pub fn increment_use_count(&self) -> Result<u32> {
        let mut state = self.record.state();
        if state.allocation.is_none() {
            return Err(self.record.freed_error());
        }
        if state.local_use == 0 {
            self.allocator
                .registry()
                .increment_global_use_count(self.record.id)?;
        }
        state.local_use += 1;
        Ok(state.local_use)
    }

    /// Unpin the buffer. The last unpin withdraws this process's vote.
    /// Returns the new local count.
    pub fn decrement_use_count(&self) -> Result<u32> {
        let mut state = self.record.state();
        if state.allocation.is_none() {
            return Err(self.record.freed_error());
        }
        match state.local_use {
            0 => {
                return Err(Error::BadArgument(format!(
                    "use count of surface {} is already zero",
                    self.record.id
                )));
            }
            1 => {
                self.allocator
                    .registry()
                    .decrement_global_use_count(self.record.id)?;
            }
            _ => {}
        }
        state.local_use -= 1;
        Ok(state.local_use)
    }

    /// Number of processes currently pinning the buffer.
    pub fn global_use_count(&self) -> Result<u32> {
        if !self.is_valid() {
            return Err(self.record.freed_error());
        }
        self.allocator.registry().global_use_count(self.record.id)
    }

    /// Whether any process pins the buffer.
    pub fn is_in_use(&self) -> bool {
        self.global_use_count().is_ok_and(|count| count > 0)
    }

    // =========================================================================
    // Purgeability
    // =========================================================================

    /// Change the purgeable state and return the previous one.
    ///
    /// Returns [`Error::Purged`] when a buffer whose contents were discarded
    /// is made non-volatile again; the state still changes and the caller
    /// must repopulate the pixels.
    pub fn set_purgeable(&self, state: PurgeableState) -> Result<PurgeableState> {
        let mut record_state = self.record.state();
        if record_state.allocation.is_none() {
            return Err(self.record.freed_error());
        }
        let previous = record_state.set_purgeable(state);
        if state == PurgeableState::Empty && previous.is_ok() {
            tracing::debug!(id = %self.record.id, "discarded surface contents");
        }
        previous
    }

    /// Current purgeable state; the default once freed.
    pub fn purgeable_state(&self) -> PurgeableState {
        self.live()
            .map_or_else(PurgeableState::default, |r| r.state().purgeable)
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    /// Store a named blob, replacing any previous value.
    pub fn set_attachment(&self, key: impl Into<String>, value: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::BadArgument("attachment key must not be empty".into()));
        }
        let mut state = self.record.state();
        if state.allocation.is_none() {
            return Err(self.record.freed_error());
        }
        state.attachments.insert(key, value.into());
        Ok(())
    }

    /// Named blob, if present.
    pub fn attachment(&self, key: &str) -> Option<Bytes> {
        self.record.state().attachments.get(key).cloned()
    }

    /// Remove and return a named blob.
    pub fn remove_attachment(&self, key: &str) -> Option<Bytes> {
        self.record.state().attachments.remove(key)
    }

    /// Snapshot of every attachment.
    pub fn copy_all_attachments(&self) -> BTreeMap<String, Bytes> {
        self.record.state().attachments.clone()
    }

    /// Store every entry of `attachments`, replacing values with equal keys.
    pub fn set_attachments(&self, attachments: BTreeMap<String, Bytes>) -> Result<()> {
        if attachments.keys().any(String::is_empty) {
            return Err(Error::BadArgument("attachment key must not be empty".into()));
        }
        let mut state = self.record.state();
        if state.allocation.is_none() {
            return Err(self.record.freed_error());
        }
        state.attachments.extend(attachments);
        Ok(())
    }

    /// Drop every attachment.
    pub fn remove_all_attachments(&self) {
        self.record.state().attachments.clear();
    }

    // =========================================================================
    // Sharing and lifetime
    // =========================================================================

    /// Mint a token another process can use to look this buffer up.
    pub fn create_access_token(&self) -> Result<AccessToken> {
        if !self.is_valid() {
            return Err(self.record.freed_error());
        }
        self.allocator
            .registry()
            .create_access_token(self.record.id, self.allocator.process())
    }

    /// Invalidate every token minted for this buffer so far.
    pub fn revoke_all_access(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(self.record.freed_error());
        }
        self.allocator
            .registry()
            .revoke_all_access(self.record.id, self.allocator.process())
    }

    /// Drop one local pin; see [`BufferAllocator::free`](crate::BufferAllocator::free).
    pub fn free(&self) -> Result<()> {
        self.allocator.free(self)
    }
}

impl PartialEq for SurfaceHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl Eq for SurfaceHandle {}

impl std::fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("id", &self.record.id)
            .field("format", &self.record.descriptor.format)
            .field("width", &self.record.descriptor.width)
            .field("height", &self.record.descriptor.height)
            .field("owns_region", &self.record.owns_region)
            .field("valid", &self.is_valid())
            .finish()
    }
}
