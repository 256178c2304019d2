//! Process-spanning buffer registry.
//!
//! One named shared-memory region holds an open-addressing hash table from
//! [`BufferId`] to flat buffer metadata. Every process that uses surfacekit
//! attaches the same region; all mutations run under a robust process-shared
//! mutex ([`mutex::RobustMutex`]), so a process dying mid-update never wedges
//! the others.
//!
//! # Slot states
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `0` | empty, never used; ends a probe chain |
//! | `u32::MAX` | tombstone; skipped by lookups, reused by inserts |
//! | anything else | live entry for that id |
//!
//! Deletions leave tombstones. Once they exceed the configured limit the table
//! is compacted through a scratch area in the same region, in two recorded
//! phases so a crash at any point can be finished or discarded by the next
//! holder of the mutex.
//!
//! # Example
//!
//! ```rust,ignore
//! use surfacekit::registry::{BufferRegistry, RegistryConfig};
//!
//! let registry = BufferRegistry::attach(&RegistryConfig::default())?;
//! println!("{:?}", registry.stats()?);
//! ```

pub mod mutex;
mod table;
mod token;

pub use token::{AccessToken, TOKEN_WIRE_SIZE};

use crate::backend::{Allocation, BufferDescriptor};
use crate::defaults;
use crate::error::{Error, Result};
use crate::format::SurfaceLayout;
use crate::id::{BufferId, ProcessId, RegionHandle};
use crate::memory::{MemorySegment, SharedMemorySegment};
use crate::observability::{self, RegistryMetrics};
use bytemuck::Zeroable;
use mutex::{LockOutcome, RobustMutex, RobustMutexGuard};
use std::sync::atomic::{Ordering, compiler_fence};
use std::time::{Duration, Instant};
use table::{
    CompactionPhase, REGISTRY_MAGIC, REGISTRY_VERSION, RegistryEntry, RegistryHeader,
    TableLayout, TableState, find_free_slot, find_slot,
};

const HEADER_SIZE: usize = std::mem::size_of::<RegistryHeader>();
const ENTRY_SIZE: usize = std::mem::size_of::<RegistryEntry>();

/// Poll interval while waiting for a creator to publish the header.
const ATTACH_POLL: Duration = Duration::from_millis(1);

/// Bytes needed for a registry of `capacity` entries.
fn region_size(capacity: u32) -> usize {
    HEADER_SIZE + 2 * capacity as usize * ENTRY_SIZE
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Shared-memory object name (must start with `/`).
    pub name: String,
    /// Number of table slots. Only used by the process that creates the region.
    pub capacity: u32,
    /// Compaction runs once tombstones exceed `capacity / tombstone_divisor`.
    pub tombstone_divisor: u32,
    /// How long to wait for another process to finish creating the region.
    pub attach_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: defaults::REGISTRY_NAME.to_string(),
            capacity: defaults::REGISTRY_CAPACITY,
            tombstone_divisor: defaults::TOMBSTONE_DIVISOR,
            attach_timeout: defaults::ATTACH_TIMEOUT,
        }
    }
}

impl RegistryConfig {
    /// Use a different region name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Use a different table size.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Use a different compaction threshold divisor.
    pub fn with_tombstone_divisor(mut self, divisor: u32) -> Self {
        self.tombstone_divisor = divisor;
        self
    }

    /// Use a different attach timeout.
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.name.starts_with('/') || self.name.len() < 2 || self.name[1..].contains('/') {
            return Err(Error::BadArgument(format!(
                "registry name {:?} must be a single '/'-prefixed component",
                self.name
            )));
        }
        if self.capacity == 0 || self.capacity >= BufferId::TOMBSTONE {
            return Err(Error::BadArgument(format!(
                "registry capacity {} out of range",
                self.capacity
            )));
        }
        if self.tombstone_divisor == 0 {
            return Err(Error::BadArgument("tombstone divisor must be non-zero".into()));
        }
        Ok(())
    }

    fn tombstone_limit(&self) -> u32 {
        self.capacity / self.tombstone_divisor
    }
}

/// Metadata of a registered buffer, as seen by any process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// Buffer id.
    pub id: BufferId,
    /// Process that registered the buffer.
    pub owner: ProcessId,
    /// Backing region.
    pub region: RegionHandle,
    /// Descriptor used at allocation time.
    pub descriptor: BufferDescriptor,
    /// Plane table.
    pub layout: SurfaceLayout,
    /// Page-rounded allocation size.
    pub alloc_size: usize,
    /// Global use count at the time of the lookup.
    pub global_use: u32,
}

impl BufferInfo {
    fn from_entry(entry: &RegistryEntry) -> Result<Self> {
        let corrupt = || {
            Error::InvalidRegion(format!(
                "registry entry {:#x} has unknown format {:#x}",
                entry.id, entry.format
            ))
        };
        Ok(Self {
            id: BufferId::new(entry.id).ok_or_else(corrupt)?,
            owner: entry.owner(),
            region: entry.region(),
            descriptor: entry.descriptor().ok_or_else(corrupt)?,
            layout: entry.layout().ok_or_else(corrupt)?,
            alloc_size: entry.alloc_size as usize,
            global_use: entry.global_use,
        })
    }
}

/// Snapshot of table occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of slots.
    pub capacity: u32,
    /// Live entries.
    pub live: u32,
    /// Tombstoned slots.
    pub tombstones: u32,
    /// Tombstone count above which compaction runs.
    pub tombstone_limit: u32,
}

/// Handle to the attached registry region.
pub struct BufferRegistry {
    segment: SharedMemorySegment,
    layout: TableLayout,
    created: bool,
    metrics: RegistryMetrics,
}

impl BufferRegistry {
    /// Create the registry region or attach to an existing one.
    ///
    /// The first process creates and initializes the region; later ones open it
    /// and wait up to `attach_timeout` for the creator to publish the header.
    /// An existing region keeps its own capacity.
    pub fn attach(config: &RegistryConfig) -> Result<Self> {
        config.validate()?;
        let _span = observability::span_registry("attach", &config.name).entered();
        let deadline = Instant::now() + config.attach_timeout;

        loop {
            match SharedMemorySegment::create(&config.name, region_size(config.capacity)) {
                Ok(segment) => return Self::initialize(segment, config),
                Err(Error::System(errno)) if errno == rustix::io::Errno::EXIST => {}
                Err(e) => return Err(e),
            }

            match Self::open_existing(config, deadline) {
                // The creator unlinked the name between our create and open.
                Err(Error::System(errno))
                    if errno == rustix::io::Errno::NOENT && Instant::now() < deadline =>
                {
                    continue;
                }
                result => return result,
            }
        }
    }

    fn initialize(segment: SharedMemorySegment, config: &RegistryConfig) -> Result<Self> {
        let layout = TableLayout {
            version: REGISTRY_VERSION,
            entry_size: ENTRY_SIZE as u32,
            capacity: config.capacity,
            tombstone_limit: config.tombstone_limit(),
        };

        let header = segment.as_mut_ptr().cast::<RegistryHeader>();
        // SAFETY: the region was just created with O_EXCL and is zero-filled;
        // nobody else reads it until the magic is published below.
        let init = unsafe {
            (*header).layout.get().write(layout);
            (*header).state.get().write(TableState::zeroed());
            RobustMutex::init(std::ptr::addr_of_mut!((*header).mutex))
        };
        if let Err(e) = init {
            let _ = SharedMemorySegment::unlink(&config.name);
            return Err(e);
        }
        // SAFETY: header points into the live mapping.
        unsafe { (*header).magic.store(REGISTRY_MAGIC, Ordering::Release) };

        tracing::debug!(
            registry = %config.name,
            capacity = config.capacity,
            bytes = segment.len(),
            "created buffer registry"
        );
        Ok(Self {
            metrics: RegistryMetrics::new(&config.name),
            segment,
            layout,
            created: true,
        })
    }

    fn open_existing(config: &RegistryConfig, deadline: Instant) -> Result<Self> {
        // The creator may not have sized the object yet.
        let segment = loop {
            match SharedMemorySegment::open(&config.name) {
                Ok(segment) if segment.len() >= HEADER_SIZE => break segment,
                Ok(_) | Err(Error::InvalidRegion(_)) if Instant::now() < deadline => {
                    std::thread::sleep(ATTACH_POLL);
                }
                Ok(segment) => {
                    return Err(Error::InvalidRegion(format!(
                        "registry {} is only {} bytes",
                        config.name,
                        segment.len()
                    )));
                }
                Err(e) => return Err(e),
            }
        };

        let header = segment.as_ptr().cast::<RegistryHeader>();
        loop {
            // SAFETY: the mapping covers at least the header.
            let magic = unsafe { (*header).magic.load(Ordering::Acquire) };
            match magic {
                REGISTRY_MAGIC => break,
                0 if Instant::now() < deadline => std::thread::sleep(ATTACH_POLL),
                0 => {
                    return Err(Error::InvalidRegion(format!(
                        "timed out waiting for registry {} to be initialized",
                        config.name
                    )));
                }
                other => {
                    return Err(Error::InvalidRegion(format!(
                        "registry {} has bad magic {other:#x}",
                        config.name
                    )));
                }
            }
        }

        // SAFETY: the layout is written before the magic and never changes.
        let layout = unsafe { *(*header).layout.get() };
        if layout.version != REGISTRY_VERSION || layout.entry_size as usize != ENTRY_SIZE {
            return Err(Error::InvalidRegion(format!(
                "registry {} has version {} entry size {}, expected {REGISTRY_VERSION} and {ENTRY_SIZE}",
                config.name, layout.version, layout.entry_size
            )));
        }
        if layout.capacity == 0 || segment.len() < region_size(layout.capacity) {
            return Err(Error::InvalidRegion(format!(
                "registry {} maps {} bytes, too small for capacity {}",
                config.name,
                segment.len(),
                layout.capacity
            )));
        }
        if layout.capacity != config.capacity {
            tracing::debug!(
                registry = %config.name,
                existing = layout.capacity,
                requested = config.capacity,
                "attached registry keeps its existing capacity"
            );
        }

        tracing::debug!(registry = %config.name, capacity = layout.capacity, "attached buffer registry");
        Ok(Self {
            metrics: RegistryMetrics::new(&config.name),
            segment,
            layout,
            created: false,
        })
    }

    /// Remove the registry name. Attached processes keep working; the next
    /// `attach` creates a fresh region.
    pub fn unlink(name: &str) -> Result<()> {
        SharedMemorySegment::unlink(name)
    }

    /// Region name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Number of table slots.
    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    /// Whether this handle created the region.
    pub fn created(&self) -> bool {
        self.created
    }

    // =========================================================================
    // Locking
    // =========================================================================

    fn header(&self) -> &RegistryHeader {
        // SAFETY: the mapping starts with an initialized header (checked at attach).
        unsafe { &*self.segment.as_ptr().cast::<RegistryHeader>() }
    }

    fn lock(&self) -> Result<TableGuard<'_>> {
        let (lock, outcome) = self.header().mutex.lock_guard()?;
        let mut table = TableGuard {
            registry: self,
            _lock: lock,
        };
        if outcome == LockOutcome::OwnerDied {
            table.recover();
        }
        Ok(table)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Publish a buffer.
    ///
    /// Registering the same id again from the same owner and region rewrites
    /// the metadata in place and keeps the use count and token. Any other live
    /// entry with the id fails with [`Error::AlreadyRegistered`].
    pub fn register(
        &self,
        id: BufferId,
        owner: ProcessId,
        descriptor: &BufferDescriptor,
        allocation: &Allocation,
    ) -> Result<()> {
        let mut entry = RegistryEntry::new(
            id,
            owner,
            allocation.region(),
            descriptor,
            allocation.layout(),
            allocation.size(),
        );
        entry.secret = token::fresh_secret()?;

        let mut table = self.lock()?;
        let (state, entries, _) = table.parts();
        let slot = find_free_slot(entries, id).ok_or_else(|| {
            Error::OutOfMemory(format!("registry {} is full", self.name()))
        })?;

        let existing = entries[slot];
        if existing.id == id.as_raw() {
            if existing.owner_pid != entry.owner_pid || existing.region != entry.region {
                return Err(Error::AlreadyRegistered(id));
            }
            entry.global_use = existing.global_use;
            entry.secret = existing.secret;
            entry.generation = existing.generation;
            entries[slot] = entry;
            tracing::debug!(%id, pid = %owner, "re-registered buffer in place");
            return Ok(());
        }

        let reused_tombstone = existing.is_tombstone();
        publish(&mut entries[slot], entry);
        state.live += 1;
        if reused_tombstone {
            state.tombstones = state.tombstones.saturating_sub(1);
        }
        self.metrics.record_occupancy(state.live, state.tombstones);

        tracing::debug!(%id, pid = %owner, region = %allocation.region(), slot, "registered buffer");
        Ok(())
    }

    /// Remove a buffer whose global use count is zero.
    ///
    /// Only the owning process may unregister.
    pub fn unregister(&self, id: BufferId, caller: ProcessId) -> Result<()> {
        let mut table = self.lock()?;
        let slot = table.owned_slot(id, caller)?;
        let global_use = table.entries()[slot].global_use;
        if global_use != 0 {
            return Err(Error::InUse { id, global_use });
        }
        table.remove(slot);
        tracing::debug!(%id, pid = %caller, "unregistered buffer");
        table.maybe_compact();
        Ok(())
    }

    /// Drop the owner's own vote and unregister in one step.
    ///
    /// Succeeds only when no other process holds a vote; otherwise fails with
    /// [`Error::InUse`] and leaves the entry untouched.
    pub fn release_and_unregister(&self, id: BufferId, caller: ProcessId) -> Result<()> {
        let mut table = self.lock()?;
        let slot = table.owned_slot(id, caller)?;
        let global_use = table.entries()[slot].global_use;
        if global_use > 1 {
            return Err(Error::InUse { id, global_use });
        }
        if global_use == 0 {
            tracing::warn!(%id, "owner vote missing at release, unregistering anyway");
        }
        table.remove(slot);
        tracing::debug!(%id, pid = %caller, "released and unregistered buffer");
        table.maybe_compact();
        Ok(())
    }

    // =========================================================================
    // Global use count
    // =========================================================================

    /// Add one process vote. Returns the new count.
    pub fn increment_global_use_count(&self, id: BufferId) -> Result<u32> {
        let mut table = self.lock()?;
        let slot = table.slot(id)?;
        table.add_vote(slot)
    }

    /// Remove one process vote. Returns the new count.
    pub fn decrement_global_use_count(&self, id: BufferId) -> Result<u32> {
        let mut table = self.lock()?;
        let slot = table.slot(id)?;
        let entry = &mut table.entries()[slot];
        if entry.global_use == 0 {
            return Err(Error::BadArgument(format!(
                "global use count of {id} is already zero"
            )));
        }
        entry.global_use -= 1;
        Ok(entry.global_use)
    }

    /// Current global use count.
    pub fn global_use_count(&self, id: BufferId) -> Result<u32> {
        let mut table = self.lock()?;
        let slot = table.slot(id)?;
        Ok(table.entries()[slot].global_use)
    }

    // =========================================================================
    // Access control
    // =========================================================================

    /// Mint a token for `id`. Only the owning process may do this.
    pub fn create_access_token(&self, id: BufferId, caller: ProcessId) -> Result<AccessToken> {
        let mut table = self.lock()?;
        let slot = table.owned_slot(id, caller)?;
        let entry = &table.entries()[slot];
        Ok(AccessToken::new(id, entry.secret, entry.generation))
    }

    /// Check that `token` is current.
    pub fn validate_token(&self, token: &AccessToken) -> Result<()> {
        let mut table = self.lock()?;
        table.token_slot(token).map(|_| ())
    }

    /// Invalidate every token minted so far. Only the owning process may do this.
    pub fn revoke_all_access(&self, id: BufferId, caller: ProcessId) -> Result<()> {
        // Drawn before locking: getrandom may block on a cold entropy pool.
        let secret = token::fresh_secret()?;

        let mut table = self.lock()?;
        let slot = table.owned_slot(id, caller)?;
        let entry = &mut table.entries()[slot];
        entry.secret = secret;
        entry.generation = entry.generation.wrapping_add(1);
        tracing::debug!(%id, generation = entry.generation, "revoked access tokens");
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Metadata of `id`. Only the owning process may use this path.
    pub fn lookup_info(&self, id: BufferId, caller: ProcessId) -> Result<BufferInfo> {
        let mut table = self.lock()?;
        let slot = table.owned_slot(id, caller)?;
        BufferInfo::from_entry(&table.entries()[slot])
    }

    /// Metadata of the buffer `token` grants access to.
    pub fn lookup_info_with_token(&self, token: &AccessToken) -> Result<BufferInfo> {
        let mut table = self.lock()?;
        let slot = table.token_slot(token)?;
        BufferInfo::from_entry(&table.entries()[slot])
    }

    /// [`lookup_info`](Self::lookup_info) and a vote on the same entry,
    /// under one lock.
    pub fn lookup_info_and_pin(&self, id: BufferId, caller: ProcessId) -> Result<BufferInfo> {
        let mut table = self.lock()?;
        let slot = table.owned_slot(id, caller)?;
        table.pin(slot)
    }

    /// [`lookup_info_with_token`](Self::lookup_info_with_token) and a vote
    /// on the same entry, under one lock.
    pub fn lookup_info_with_token_and_pin(&self, token: &AccessToken) -> Result<BufferInfo> {
        let mut table = self.lock()?;
        let slot = table.token_slot(token)?;
        table.pin(slot)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact the table now. Returns the number of tombstones cleared.
    pub fn compact(&self) -> Result<u32> {
        let _span = observability::span_registry("compact", self.name()).entered();
        let mut table = self.lock()?;
        Ok(table.compact())
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> Result<RegistryStats> {
        let mut table = self.lock()?;
        let state = *table.state();
        Ok(RegistryStats {
            capacity: self.layout.capacity,
            live: state.live,
            tombstones: state.tombstones,
            tombstone_limit: self.layout.tombstone_limit,
        })
    }
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("name", &self.name())
            .field("capacity", &self.layout.capacity)
            .field("created", &self.created)
            .finish()
    }
}

/// Write `entry` into `slot` with the id tag stored last, so a holder dying
/// mid-write leaves the slot in its previous empty or tombstone state.
fn publish(slot: &mut RegistryEntry, entry: RegistryEntry) {
    *slot = RegistryEntry {
        id: slot.id,
        ..entry
    };
    compiler_fence(Ordering::Release);
    slot.id = entry.id;
}

/// Exclusive access to the table while the registry mutex is held.
struct TableGuard<'a> {
    registry: &'a BufferRegistry,
    _lock: RobustMutexGuard<'a>,
}

impl TableGuard<'_> {
    fn parts(&mut self) -> (&mut TableState, &mut [RegistryEntry], &mut [RegistryEntry]) {
        let capacity = self.registry.layout.capacity as usize;
        let base = self.registry.segment.as_mut_ptr();
        // SAFETY: the mutex is held for the guard's lifetime, the region spans
        // header + 2 * capacity entries (checked at attach), and the three
        // borrows are disjoint.
        unsafe {
            let header = base.cast::<RegistryHeader>();
            let entries = base.add(HEADER_SIZE).cast::<RegistryEntry>();
            (
                &mut *(*header).state.get(),
                std::slice::from_raw_parts_mut(entries, capacity),
                std::slice::from_raw_parts_mut(entries.add(capacity), capacity),
            )
        }
    }

    fn state(&mut self) -> &mut TableState {
        self.parts().0
    }

    fn entries(&mut self) -> &mut [RegistryEntry] {
        self.parts().1
    }

    fn slot(&mut self, id: BufferId) -> Result<usize> {
        find_slot(self.entries(), id)
            .ok_or_else(|| Error::NotFound(format!("buffer {id} is not registered")))
    }

    fn owned_slot(&mut self, id: BufferId, caller: ProcessId) -> Result<usize> {
        let slot = self.slot(id)?;
        let owner = self.entries()[slot].owner();
        if owner != caller {
            return Err(Error::NotAllowed(format!(
                "buffer {id} belongs to process {owner}, not {caller}"
            )));
        }
        Ok(slot)
    }

    fn token_slot(&mut self, token: &AccessToken) -> Result<usize> {
        let slot = self.slot(token.buffer_id())?;
        let entry = &self.entries()[slot];
        let mismatch =
            (entry.secret ^ token.secret()) | u64::from(entry.generation ^ token.generation());
        if mismatch != 0 {
            return Err(Error::NotAllowed(format!(
                "access token for {} is invalid or revoked",
                token.buffer_id()
            )));
        }
        Ok(slot)
    }

    fn add_vote(&mut self, slot: usize) -> Result<u32> {
        let entry = &mut self.entries()[slot];
        let id = entry.id;
        entry.global_use = entry.global_use.checked_add(1).ok_or_else(|| {
            Error::OutOfMemory(format!("global use count of {id:#010x} overflowed"))
        })?;
        Ok(entry.global_use)
    }

    fn pin(&mut self, slot: usize) -> Result<BufferInfo> {
        let mut info = BufferInfo::from_entry(&self.entries()[slot])?;
        info.global_use = self.add_vote(slot)?;
        Ok(info)
    }

    fn remove(&mut self, slot: usize) {
        let (state, entries, _) = self.parts();
        let entry = &mut entries[slot];
        entry.id = BufferId::TOMBSTONE;
        entry.secret = 0;
        entry.global_use = 0;
        state.live = state.live.saturating_sub(1);
        state.tombstones += 1;
        let (live, tombstones) = (state.live, state.tombstones);
        self.registry.metrics.record_occupancy(live, tombstones);
    }

    fn maybe_compact(&mut self) {
        if self.state().tombstones > self.registry.layout.tombstone_limit {
            self.compact();
        }
    }

    /// Two-phase compaction through the scratch area.
    fn compact(&mut self) -> u32 {
        let (state, entries, scratch) = self.parts();
        state.phase = CompactionPhase::Collecting as u32;
        compiler_fence(Ordering::SeqCst);

        let mut collected = 0;
        for entry in entries.iter().filter(|e| e.is_live()) {
            scratch[collected] = *entry;
            collected += 1;
        }
        state.scratch_len = collected as u32;
        compiler_fence(Ordering::SeqCst);
        state.phase = CompactionPhase::Rebuilding as u32;
        compiler_fence(Ordering::SeqCst);

        self.rebuild()
    }

    /// Refill the table from scratch. Safe to repeat after a crash.
    fn rebuild(&mut self) -> u32 {
        let (state, entries, scratch) = self.parts();
        let collected = (state.scratch_len as usize).min(scratch.len());

        entries.fill(RegistryEntry::zeroed());
        let mut live = 0;
        for entry in &scratch[..collected] {
            let Some(id) = BufferId::new(entry.id) else {
                continue;
            };
            if let Some(slot) = find_free_slot(entries, id) {
                entries[slot] = *entry;
                live += 1;
            }
        }

        let cleared = state.tombstones;
        state.live = live;
        state.tombstones = 0;
        state.scratch_len = 0;
        compiler_fence(Ordering::SeqCst);
        state.phase = CompactionPhase::Idle as u32;

        tracing::debug!(
            registry = %self.registry.name(),
            live,
            cleared,
            "compacted buffer registry"
        );
        self.registry.metrics.record_compaction();
        self.registry.metrics.record_occupancy(live, 0);
        cleared
    }

    /// Repair after the previous holder died with the mutex held.
    fn recover(&mut self) {
        let phase = self.state().phase;
        tracing::error!(
            registry = %self.registry.name(),
            phase,
            "previous registry lock holder died; recovering"
        );
        self.registry.metrics.record_owner_died();

        match CompactionPhase::from_raw(phase) {
            Some(CompactionPhase::Idle) => {}
            Some(CompactionPhase::Rebuilding) => {
                self.rebuild();
            }
            Some(CompactionPhase::Collecting) | None => {
                let state = self.state();
                state.scratch_len = 0;
                state.phase = CompactionPhase::Idle as u32;
            }
        }

        let (state, entries, _) = self.parts();
        state.live = entries.iter().filter(|e| e.is_live()).count() as u32;
        state.tombstones = entries.iter().filter(|e| e.is_tombstone()).count() as u32;
        let (live, tombstones) = (state.live, state.tombstones);
        self.registry.metrics.record_occupancy(live, tombstones);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AllocationBackend, HeapBackend};
    use crate::format::PixelFormat;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    struct TestRegistry {
        registry: Arc<BufferRegistry>,
        name: String,
    }

    impl Drop for TestRegistry {
        fn drop(&mut self) {
            let _ = BufferRegistry::unlink(&self.name);
        }
    }

    impl std::ops::Deref for TestRegistry {
        type Target = BufferRegistry;
        fn deref(&self) -> &BufferRegistry {
            &self.registry
        }
    }

    fn test_config(tag: &str, capacity: u32) -> RegistryConfig {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        RegistryConfig::default()
            .with_name(format!(
                "/surfacekit-registry-{tag}-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            ))
            .with_capacity(capacity)
    }

    fn test_registry(tag: &str, capacity: u32) -> TestRegistry {
        let config = test_config(tag, capacity);
        TestRegistry {
            registry: Arc::new(BufferRegistry::attach(&config).unwrap()),
            name: config.name,
        }
    }

    fn id(raw: u32) -> BufferId {
        BufferId::new(raw).unwrap()
    }

    fn owner() -> ProcessId {
        ProcessId::from_raw(100)
    }

    fn allocation(backend: &HeapBackend) -> (BufferDescriptor, Allocation) {
        let descriptor = BufferDescriptor::new(16, 16, PixelFormat::Bgra8888);
        let allocation = backend.allocate(&descriptor).unwrap();
        (descriptor, allocation)
    }

    #[test]
    fn test_attach_twice_shares_table() {
        let config = test_config("attach", 64);
        let first = BufferRegistry::attach(&config).unwrap();
        let second = BufferRegistry::attach(&config.clone().with_capacity(8)).unwrap();
        assert!(first.created());
        assert!(!second.created());
        assert_eq!(second.capacity(), 64);

        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        first.register(id(5), owner(), &descriptor, &alloc).unwrap();
        let info = second.lookup_info(id(5), owner()).unwrap();
        assert_eq!(info.region, alloc.region());
        assert_eq!(info.layout, *alloc.layout());

        BufferRegistry::unlink(&config.name).unwrap();
    }

    #[test]
    fn test_bad_config_rejected() {
        let bad_name = RegistryConfig::default().with_name("no-slash");
        assert!(matches!(
            BufferRegistry::attach(&bad_name),
            Err(Error::BadArgument(_))
        ));
        let zero = test_config("zero", 0);
        assert!(matches!(
            BufferRegistry::attach(&zero),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_register_rules() {
        let registry = test_registry("register", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        let (_, other_alloc) = allocation(&backend);

        registry.register(id(1), owner(), &descriptor, &alloc).unwrap();
        registry.increment_global_use_count(id(1)).unwrap();
        let token = registry.create_access_token(id(1), owner()).unwrap();

        // Same owner and region: idempotent, keeps votes and token.
        registry.register(id(1), owner(), &descriptor, &alloc).unwrap();
        assert_eq!(registry.global_use_count(id(1)).unwrap(), 1);
        registry.validate_token(&token).unwrap();
        assert_eq!(registry.stats().unwrap().live, 1);

        // Different region or owner: collision.
        assert!(matches!(
            registry.register(id(1), owner(), &descriptor, &other_alloc),
            Err(Error::AlreadyRegistered(_))
        ));
        assert!(matches!(
            registry.register(id(1), ProcessId::from_raw(200), &descriptor, &alloc),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_register_full_table() {
        let registry = test_registry("full", 4);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        for raw in 1..=4 {
            registry.register(id(raw), owner(), &descriptor, &alloc).unwrap();
        }
        assert!(matches!(
            registry.register(id(5), owner(), &descriptor, &alloc),
            Err(Error::OutOfMemory(_))
        ));
    }

    #[test]
    fn test_unregister_requires_owner_and_zero_use() {
        let registry = test_registry("unregister", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        registry.register(id(3), owner(), &descriptor, &alloc).unwrap();
        registry.increment_global_use_count(id(3)).unwrap();

        assert!(matches!(
            registry.unregister(id(3), ProcessId::from_raw(999)),
            Err(Error::NotAllowed(_))
        ));
        assert!(matches!(
            registry.unregister(id(3), owner()),
            Err(Error::InUse { global_use: 1, .. })
        ));

        registry.decrement_global_use_count(id(3)).unwrap();
        registry.unregister(id(3), owner()).unwrap();
        assert!(matches!(
            registry.global_use_count(id(3)),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            registry.unregister(id(3), owner()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_release_and_unregister_is_atomic() {
        let registry = test_registry("release", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        registry.register(id(9), owner(), &descriptor, &alloc).unwrap();
        registry.increment_global_use_count(id(9)).unwrap();
        registry.increment_global_use_count(id(9)).unwrap();

        let err = registry.release_and_unregister(id(9), owner()).unwrap_err();
        assert!(matches!(err, Error::InUse { global_use: 2, .. }));
        assert_eq!(registry.global_use_count(id(9)).unwrap(), 2);

        registry.decrement_global_use_count(id(9)).unwrap();
        registry.release_and_unregister(id(9), owner()).unwrap();
        assert_eq!(registry.stats().unwrap().live, 0);
    }

    #[test]
    fn test_decrement_below_zero_rejected() {
        let registry = test_registry("underflow", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        registry.register(id(2), owner(), &descriptor, &alloc).unwrap();
        assert!(matches!(
            registry.decrement_global_use_count(id(2)),
            Err(Error::BadArgument(_))
        ));
        assert_eq!(registry.global_use_count(id(2)).unwrap(), 0);
    }

    #[test]
    fn test_token_lifecycle() {
        let registry = test_registry("token", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        registry.register(id(4), owner(), &descriptor, &alloc).unwrap();

        assert!(matches!(
            registry.create_access_token(id(4), ProcessId::from_raw(7)),
            Err(Error::NotAllowed(_))
        ));

        let token = registry.create_access_token(id(4), owner()).unwrap();
        assert_eq!(token.generation(), 0);
        registry.validate_token(&token).unwrap();
        assert_eq!(registry.lookup_info_with_token(&token).unwrap().id, id(4));

        registry.revoke_all_access(id(4), owner()).unwrap();
        assert!(matches!(
            registry.validate_token(&token),
            Err(Error::NotAllowed(_))
        ));
        assert!(matches!(
            registry.lookup_info_with_token(&token),
            Err(Error::NotAllowed(_))
        ));

        let fresh = registry.create_access_token(id(4), owner()).unwrap();
        assert_eq!(fresh.generation(), 1);
        registry.validate_token(&fresh).unwrap();

        let forged = AccessToken::new(id(4), fresh.secret() ^ 1, fresh.generation());
        assert!(matches!(
            registry.validate_token(&forged),
            Err(Error::NotAllowed(_))
        ));
    }

    #[test]
    fn test_lookup_info_is_owner_only() {
        let registry = test_registry("lookup", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        registry.register(id(6), owner(), &descriptor, &alloc).unwrap();

        let info = registry.lookup_info(id(6), owner()).unwrap();
        assert_eq!(info.descriptor, descriptor);
        assert_eq!(info.alloc_size, alloc.size());
        assert!(matches!(
            registry.lookup_info(id(6), ProcessId::from_raw(1)),
            Err(Error::NotAllowed(_))
        ));
    }

    #[test]
    fn test_lookup_keeps_declared_strides() {
        let registry = test_registry("strides", 16);
        let backend = HeapBackend::default();
        let descriptor = BufferDescriptor::new(10, 4, PixelFormat::Bgra8888).with_bytes_per_row(64);
        let alloc = backend.allocate(&descriptor).unwrap();
        registry.register(id(8), owner(), &descriptor, &alloc).unwrap();

        let info = registry.lookup_info(id(8), owner()).unwrap();
        assert_eq!(info.descriptor, descriptor);
        assert_eq!(info.descriptor.bytes_per_element, 0);
        assert_eq!(info.layout.plane(0).bytes_per_element, 4);
        assert_eq!(info.layout, *alloc.layout());
    }

    #[test]
    fn test_pinning_lookups() {
        let registry = test_registry("pin", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        registry.register(id(12), owner(), &descriptor, &alloc).unwrap();

        let info = registry.lookup_info_and_pin(id(12), owner()).unwrap();
        assert_eq!(info.global_use, 1);
        assert!(matches!(
            registry.lookup_info_and_pin(id(12), ProcessId::from_raw(1)),
            Err(Error::NotAllowed(_))
        ));

        let token = registry.create_access_token(id(12), owner()).unwrap();
        let info = registry.lookup_info_with_token_and_pin(&token).unwrap();
        assert_eq!(info.global_use, 2);

        registry.revoke_all_access(id(12), owner()).unwrap();
        assert!(matches!(
            registry.lookup_info_with_token_and_pin(&token),
            Err(Error::NotAllowed(_))
        ));
        // Refused lookups cast no vote.
        assert_eq!(registry.global_use_count(id(12)).unwrap(), 2);
    }

    #[test]
    fn test_tombstones_trigger_compaction() {
        // Limit is 16 / 4 = 4 tombstones.
        let registry = test_registry("tombstones", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);

        for raw in 1..=10 {
            registry.register(id(raw), owner(), &descriptor, &alloc).unwrap();
        }
        for raw in 1..=4 {
            registry.unregister(id(raw), owner()).unwrap();
        }
        assert_eq!(registry.stats().unwrap().tombstones, 4);

        registry.unregister(id(5), owner()).unwrap();
        let stats = registry.stats().unwrap();
        assert_eq!(stats.tombstones, 0);
        assert_eq!(stats.live, 5);
        for raw in 6..=10 {
            assert_eq!(registry.lookup_info(id(raw), owner()).unwrap().id, id(raw));
        }
    }

    #[test]
    fn test_colliding_ids_survive_compaction() {
        let registry = test_registry("collide", 8);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);

        // 1, 9, 17 share a probe chain.
        for raw in [1, 9, 17] {
            registry.register(id(raw), owner(), &descriptor, &alloc).unwrap();
        }
        registry.unregister(id(1), owner()).unwrap();
        assert!(registry.lookup_info(id(17), owner()).is_ok());

        assert_eq!(registry.compact().unwrap(), 1);
        assert!(registry.lookup_info(id(9), owner()).is_ok());
        assert!(registry.lookup_info(id(17), owner()).is_ok());
        assert!(registry.lookup_info(id(1), owner()).is_err());
    }

    /// Lock the registry from a thread that exits without unlocking, after
    /// running `interrupt` on the table.
    fn die_holding_lock(registry: &Arc<BufferRegistry>, interrupt: fn(&mut TableGuard<'_>)) {
        let registry = Arc::clone(registry);
        std::thread::spawn(move || {
            let mut table = registry.lock().unwrap();
            interrupt(&mut table);
            std::mem::forget(table);
        })
        .join()
        .unwrap();
    }

    fn populated(tag: &str) -> TestRegistry {
        let registry = test_registry(tag, 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        for raw in 1..=8 {
            registry.register(id(raw), owner(), &descriptor, &alloc).unwrap();
        }
        for raw in 1..=3 {
            registry.unregister(id(raw), owner()).unwrap();
        }
        registry
    }

    #[test]
    fn test_owner_died_while_idle() {
        let registry = populated("died-idle");
        die_holding_lock(&registry.registry, |table| {
            // Counters drift; the tags stay authoritative.
            table.state().live = 99;
        });

        let stats = registry.stats().unwrap();
        assert_eq!(stats.live, 5);
        assert_eq!(stats.tombstones, 3);
    }

    #[test]
    fn test_owner_died_while_collecting() {
        let registry = populated("died-collect");
        die_holding_lock(&registry.registry, |table| {
            let (state, entries, scratch) = table.parts();
            state.phase = CompactionPhase::Collecting as u32;
            scratch[0] = entries[4];
        });

        let stats = registry.stats().unwrap();
        assert_eq!(stats.live, 5);
        assert_eq!(stats.tombstones, 3);
        for raw in 4..=8 {
            assert!(registry.lookup_info(id(raw), owner()).is_ok());
        }
    }

    #[test]
    fn test_owner_died_while_rebuilding() {
        let registry = populated("died-rebuild");
        die_holding_lock(&registry.registry, |table| {
            let (state, entries, scratch) = table.parts();
            let mut collected = 0;
            for entry in entries.iter().filter(|e| e.is_live()) {
                scratch[collected] = *entry;
                collected += 1;
            }
            state.scratch_len = collected as u32;
            state.phase = CompactionPhase::Rebuilding as u32;
            // Die halfway through clearing the table.
            for entry in entries.iter_mut().take(6) {
                *entry = RegistryEntry::zeroed();
            }
        });

        let stats = registry.stats().unwrap();
        assert_eq!(stats.live, 5);
        assert_eq!(stats.tombstones, 0);
        for raw in 4..=8 {
            assert!(registry.lookup_info(id(raw), owner()).is_ok());
        }
        assert!(registry.lookup_info(id(1), owner()).is_err());
    }

    #[test]
    fn test_concurrent_use_counts() {
        let registry = test_registry("concurrent", 16);
        let backend = HeapBackend::default();
        let (descriptor, alloc) = allocation(&backend);
        registry.register(id(11), owner(), &descriptor, &alloc).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry.registry);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        registry.increment_global_use_count(id(11)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.global_use_count(id(11)).unwrap(), 1000);
    }
}
