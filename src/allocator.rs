//! Per-process buffer allocator.
//!
//! The allocator ties a backend to the shared registry: it creates regions,
//! publishes them, and keeps the process-local map from id to record that
//! makes repeated lookups of the same buffer return the same record.
//!
//! # Lock order
//!
//! allocator map → record state → registry mutex. Every path that needs more
//! than one of them takes them in this order.
//!
//! # Example
//!
//! ```rust,ignore
//! use surfacekit::{BufferAllocator, BufferDescriptor, PixelFormat};
//!
//! let allocator = BufferAllocator::global()?;
//! let surface = allocator.allocate(&BufferDescriptor::new(1920, 1080, PixelFormat::Bgra8888))?;
//! let token = surface.create_access_token()?;
//! // send token.to_bytes() to a peer, which calls lookup_with_token
//! surface.free()?;
//! ```

use crate::backend::{
    Allocation, AllocationBackend, BackendConfig, BufferDescriptor, HeapBackend,
    SharedMemoryBackend,
};
use crate::defaults;
use crate::error::{Error, Result};
use crate::id::{BufferId, ProcessId};
use crate::observability;
use crate::registry::{AccessToken, BufferInfo, BufferRegistry, RegistryConfig};
use crate::surface::{BufferRecord, SurfaceHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

static GLOBAL: OnceLock<BufferAllocator> = OnceLock::new();

/// Which backend [`BufferAllocator::from_config`] builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Named POSIX shared memory.
    #[default]
    SharedMemory,
    /// Process heap; regions are only visible inside this process.
    Heap,
}

/// Allocator settings.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Registry to attach.
    pub registry: RegistryConfig,
    /// Backend settings.
    pub backend: BackendConfig,
    /// Backend implementation.
    pub backend_kind: BackendKind,
    /// Identity used for ownership checks. `None` means the calling process.
    pub process: Option<ProcessId>,
    /// Fresh ids tried before allocation gives up on id collisions.
    pub id_attempts: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            backend: BackendConfig::default(),
            backend_kind: BackendKind::default(),
            process: None,
            id_attempts: defaults::ID_ATTEMPTS,
        }
    }
}

impl AllocatorConfig {
    /// Use a different registry.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Use different backend settings.
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Choose the backend implementation.
    pub fn with_backend_kind(mut self, kind: BackendKind) -> Self {
        self.backend_kind = kind;
        self
    }

    /// Act as process `process` for ownership checks.
    pub fn with_process(mut self, process: ProcessId) -> Self {
        self.process = Some(process);
        self
    }

    /// Change the number of id attempts.
    pub fn with_id_attempts(mut self, attempts: u32) -> Self {
        self.id_attempts = attempts;
        self
    }
}

/// SplitMix64 finalizer.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Shared state behind [`BufferAllocator`] and every handle it produced.
pub(crate) struct AllocatorInner {
    backend: Arc<dyn AllocationBackend>,
    registry: Arc<BufferRegistry>,
    process: ProcessId,
    id_attempts: u32,
    id_counter: AtomicU64,
    records: Mutex<HashMap<BufferId, Arc<BufferRecord>>>,
}

impl AllocatorInner {
    pub(crate) fn backend(&self) -> &dyn AllocationBackend {
        &*self.backend
    }

    pub(crate) fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub(crate) fn process(&self) -> ProcessId {
        self.process
    }

    fn records(&self) -> MutexGuard<'_, HashMap<BufferId, Arc<BufferRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pseudo-unique id from time, process, and a counter.
    fn next_id(&self) -> BufferId {
        loop {
            let counter = self.id_counter.fetch_add(1, Ordering::Relaxed);
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64);
            let mixed = splitmix64(
                nanos ^ ((self.process.as_raw() as u32 as u64) << 32) ^ splitmix64(counter),
            );
            if let Some(id) = BufferId::new((mixed >> 32) as u32 ^ mixed as u32) {
                return id;
            }
        }
    }

    fn register_fresh_id(
        &self,
        descriptor: &BufferDescriptor,
        allocation: &Allocation,
    ) -> Result<BufferId> {
        for attempt in 1..=self.id_attempts {
            let id = self.next_id();
            match self
                .registry
                .register(id, self.process, descriptor, allocation)
            {
                Ok(()) => return Ok(id),
                Err(Error::AlreadyRegistered(_)) => {
                    tracing::debug!(%id, attempt, "buffer id collision, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::OutOfMemory(format!(
            "no unused buffer id after {} attempts",
            self.id_attempts
        )))
    }

    fn release_backend(&self, id: BufferId, allocation: Allocation) {
        if let Err(e) = self.backend.free(allocation) {
            observability::trace_rollback_failed(id, "backend free", &e);
        }
    }

    fn allocate(self: &Arc<Self>, descriptor: &BufferDescriptor) -> Result<SurfaceHandle> {
        self.backend.validate(descriptor)?;
        let allocation = self.backend.allocate(descriptor)?;

        let id = match self.register_fresh_id(descriptor, &allocation) {
            Ok(id) => id,
            Err(e) => {
                if let Err(free_err) = self.backend.free(allocation) {
                    tracing::warn!(error = %free_err, "failed to release region after registration error");
                }
                return Err(e);
            }
        };

        // The creator's initial local use is its vote.
        if let Err(e) = self.registry.increment_global_use_count(id) {
            if let Err(unregister_err) = self.registry.unregister(id, self.process) {
                observability::trace_rollback_failed(id, "unregister", &unregister_err);
            }
            self.release_backend(id, allocation);
            return Err(e);
        }

        let size = allocation.size();
        let record = Arc::new(BufferRecord::new(id, *descriptor, allocation));
        self.records().insert(id, Arc::clone(&record));

        observability::record_surface_allocated(self.backend.name(), size);
        tracing::debug!(
            %id,
            pid = %self.process,
            width = descriptor.width,
            height = descriptor.height,
            format = ?descriptor.format,
            size,
            "allocated surface"
        );
        Ok(SurfaceHandle::new(record, Arc::clone(self)))
    }

    /// Map a buffer whose vote `info` already carries.
    ///
    /// Called with the records map locked. The vote is withdrawn if the
    /// region cannot be mapped.
    fn clone_pinned(
        self: &Arc<Self>,
        records: &mut HashMap<BufferId, Arc<BufferRecord>>,
        info: &BufferInfo,
    ) -> Result<SurfaceHandle> {
        let allocation = match self.backend.clone_region(info) {
            Ok(allocation) => allocation,
            Err(e) => {
                if let Err(undo) = self.registry.decrement_global_use_count(info.id) {
                    observability::trace_rollback_failed(info.id, "withdraw vote", &undo);
                }
                return Err(e);
            }
        };

        let record = Arc::new(BufferRecord::new(info.id, info.descriptor, allocation));
        records.insert(info.id, Arc::clone(&record));

        observability::record_surface_cloned(self.backend.name());
        tracing::debug!(
            id = %info.id,
            pid = %self.process,
            owner = %info.owner,
            region = %info.region,
            global_use = info.global_use,
            "cloned surface"
        );
        Ok(SurfaceHandle::new(record, Arc::clone(self)))
    }

    fn lookup(self: &Arc<Self>, id: BufferId) -> Result<SurfaceHandle> {
        self.records()
            .get(&id)
            .map(|record| SurfaceHandle::new(Arc::clone(record), Arc::clone(self)))
            .ok_or_else(|| Error::NotFound(format!("surface {id} is not held by this process")))
    }

    fn lookup_or_clone(self: &Arc<Self>, id: BufferId) -> Result<SurfaceHandle> {
        let mut records = self.records();
        if let Some(record) = records.get(&id) {
            return Ok(SurfaceHandle::new(Arc::clone(record), Arc::clone(self)));
        }
        let info = self.registry.lookup_info_and_pin(id, self.process)?;
        self.clone_pinned(&mut records, &info)
    }

    fn lookup_with_token(self: &Arc<Self>, token: &AccessToken) -> Result<SurfaceHandle> {
        let mut records = self.records();
        if let Some(record) = records.get(&token.buffer_id()) {
            // Validated even when the buffer is already held here.
            self.registry.validate_token(token)?;
            return Ok(SurfaceHandle::new(Arc::clone(record), Arc::clone(self)));
        }
        let info = self.registry.lookup_info_with_token_and_pin(token)?;
        self.clone_pinned(&mut records, &info)
    }

    pub(crate) fn free(&self, surface: &SurfaceHandle) -> Result<()> {
        let record = surface.record();
        let id = record.id;
        let _span = observability::instrument_surface("free", id);

        if !std::ptr::eq(&**surface.allocator(), self) {
            return Err(Error::NotAllowed(format!(
                "surface {id} was not produced by this allocator"
            )));
        }

        let mut records = self.records();
        let mut state = record.state();
        if state.allocation.is_none() {
            return Err(record.freed_error());
        }
        if state.is_locked() {
            return Err(Error::Busy);
        }
        if state.local_use > 1 {
            state.local_use -= 1;
            tracing::trace!(%id, local_use = state.local_use, "dropped local pin");
            return Ok(());
        }

        let withdrawn = match (record.owns_region, state.local_use) {
            (true, 1) => self.registry.release_and_unregister(id, self.process),
            (true, _) => self.registry.unregister(id, self.process),
            (false, 1) => self.registry.decrement_global_use_count(id).map(|_| ()),
            (false, _) => Ok(()),
        };
        match withdrawn {
            Ok(()) => {}
            Err(Error::InUse { global_use, .. }) => {
                observability::trace_free_in_use(id, self.process, global_use);
                observability::record_free_in_use();
                return Err(Error::InUse { id, global_use });
            }
            Err(Error::NotFound(_)) => {
                tracing::warn!(%id, "surface was no longer registered at free");
            }
            Err(e) => return Err(e),
        }

        let allocation = record.retire(&mut state);
        drop(state);
        if records
            .get(&id)
            .is_some_and(|held| Arc::ptr_eq(held, record))
        {
            records.remove(&id);
        }
        drop(records);
        record.unlocked.notify_all();

        observability::record_surface_freed(self.backend.name(), record.owns_region);
        tracing::debug!(%id, pid = %self.process, owned = record.owns_region, "freed surface");
        match allocation {
            Some(allocation) => self.backend.free(allocation),
            None => Ok(()),
        }
    }
}

/// Per-process entry point for allocating and looking up surfaces.
///
/// Cloning is cheap; clones share the same local map.
#[derive(Clone)]
pub struct BufferAllocator {
    inner: Arc<AllocatorInner>,
}

impl BufferAllocator {
    /// Build an allocator over an explicit backend and registry.
    ///
    /// `process` is the identity used for ownership checks; pass
    /// [`ProcessId::current`] outside of tests.
    pub fn new(
        backend: Arc<dyn AllocationBackend>,
        registry: Arc<BufferRegistry>,
        process: ProcessId,
    ) -> Self {
        Self::with_id_attempts(backend, registry, process, defaults::ID_ATTEMPTS)
    }

    fn with_id_attempts(
        backend: Arc<dyn AllocationBackend>,
        registry: Arc<BufferRegistry>,
        process: ProcessId,
        id_attempts: u32,
    ) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                backend,
                registry,
                process,
                id_attempts: id_attempts.max(1),
                id_counter: AtomicU64::new(0),
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach the configured registry and build the configured backend.
    pub fn from_config(config: &AllocatorConfig) -> Result<Self> {
        let registry = Arc::new(BufferRegistry::attach(&config.registry)?);
        let backend: Arc<dyn AllocationBackend> = match config.backend_kind {
            BackendKind::SharedMemory => Arc::new(SharedMemoryBackend::new(config.backend.clone())),
            BackendKind::Heap => Arc::new(HeapBackend::new(config.backend.clone())),
        };
        let process = config.process.unwrap_or_else(ProcessId::current);
        Ok(Self::with_id_attempts(
            backend,
            registry,
            process,
            config.id_attempts,
        ))
    }

    /// The process-wide allocator, attached with default settings on first use.
    pub fn global() -> Result<Self> {
        if let Some(allocator) = GLOBAL.get() {
            return Ok(allocator.clone());
        }
        let allocator = Self::from_config(&AllocatorConfig::default())?;
        // A racing thread may have won; its allocator is the one kept.
        Ok(GLOBAL.get_or_init(|| allocator).clone())
    }

    /// Allocate, register, and pin a new surface.
    pub fn allocate(&self, descriptor: &BufferDescriptor) -> Result<SurfaceHandle> {
        self.inner.allocate(descriptor)
    }

    /// Drop one local pin on `surface`.
    ///
    /// When the last pin goes, the owning process unregisters the buffer and
    /// destroys the region; a clone withdraws its vote and unmaps. An owner
    /// free fails with [`Error::InUse`] while another process still pins the
    /// buffer, leaving the handle usable for a later retry.
    pub fn free(&self, surface: &SurfaceHandle) -> Result<()> {
        self.inner.free(surface)
    }

    /// Surface already held by this process.
    pub fn lookup(&self, id: BufferId) -> Result<SurfaceHandle> {
        self.inner.lookup(id)
    }

    /// Surface held by this process, or a fresh clone of one this process
    /// registered through another allocator.
    pub fn lookup_or_clone(&self, id: BufferId) -> Result<SurfaceHandle> {
        self.inner.lookup_or_clone(id)
    }

    /// Surface granted by `token`, cloned into this process if needed.
    pub fn lookup_with_token(&self, token: &AccessToken) -> Result<SurfaceHandle> {
        self.inner.lookup_with_token(token)
    }

    /// Identity used for ownership checks.
    pub fn process(&self) -> ProcessId {
        self.inner.process
    }

    /// Attached registry.
    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.inner.registry
    }

    /// Backend in use.
    pub fn backend(&self) -> &Arc<dyn AllocationBackend> {
        &self.inner.backend
    }

    /// Number of surfaces held by this allocator.
    pub fn live_surfaces(&self) -> usize {
        self.inner.records().len()
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("process", &self.inner.process)
            .field("backend", &self.inner.backend.name())
            .field("registry", &self.inner.registry.name())
            .finish()
    }
}

/// Unlinks a test registry when dropped.
#[cfg(test)]
pub(crate) struct UnlinkOnDrop(String);

#[cfg(test)]
impl Drop for UnlinkOnDrop {
    fn drop(&mut self) {
        let _ = BufferRegistry::unlink(&self.0);
    }
}

/// Heap-backed allocator over a private registry.
#[cfg(test)]
pub(crate) fn test_allocator(tag: &str) -> (BufferAllocator, UnlinkOnDrop) {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let name = format!(
        "/surfacekit-alloc-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let config = AllocatorConfig::default()
        .with_registry(RegistryConfig::default().with_name(&name).with_capacity(256))
        .with_backend_kind(BackendKind::Heap);
    (
        BufferAllocator::from_config(&config).unwrap(),
        UnlinkOnDrop(name),
    )
}
