//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const SURFACES_ALLOCATED: &str = "surfacekit_surfaces_allocated";
const SURFACES_FREED: &str = "surfacekit_surfaces_freed";
const SURFACES_CLONED: &str = "surfacekit_surfaces_cloned";
const SURFACE_BYTES_ALLOCATED: &str = "surfacekit_surface_bytes_allocated";
const FREE_IN_USE: &str = "surfacekit_free_in_use";
const REGISTRY_COMPACTIONS: &str = "surfacekit_registry_compactions";
const REGISTRY_OWNER_DIED: &str = "surfacekit_registry_owner_died";
const REGISTRY_LIVE_ENTRIES: &str = "surfacekit_registry_live_entries";
const REGISTRY_TOMBSTONES: &str = "surfacekit_registry_tombstones";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        SURFACES_ALLOCATED,
        Unit::Count,
        "Surfaces allocated by this process"
    );
    metrics::describe_counter!(
        SURFACES_FREED,
        Unit::Count,
        "Surfaces whose local record was released"
    );
    metrics::describe_counter!(
        SURFACES_CLONED,
        Unit::Count,
        "Surfaces mapped from a region created elsewhere"
    );
    metrics::describe_counter!(
        SURFACE_BYTES_ALLOCATED,
        Unit::Bytes,
        "Page-rounded bytes of newly allocated regions"
    );
    metrics::describe_counter!(
        FREE_IN_USE,
        Unit::Count,
        "Owner frees refused because another process still held the buffer"
    );
    metrics::describe_counter!(
        REGISTRY_COMPACTIONS,
        Unit::Count,
        "Registry tombstone compactions"
    );
    metrics::describe_counter!(
        REGISTRY_OWNER_DIED,
        Unit::Count,
        "Registry mutex acquisitions that recovered from a dead holder"
    );
    metrics::describe_gauge!(
        REGISTRY_LIVE_ENTRIES,
        Unit::Count,
        "Live entries in the registry table"
    );
    metrics::describe_gauge!(
        REGISTRY_TOMBSTONES,
        Unit::Count,
        "Tombstoned slots in the registry table"
    );
}

/// Record a new surface allocation.
#[inline]
pub fn record_surface_allocated(backend: &'static str, bytes: usize) {
    counter!(SURFACES_ALLOCATED, "backend" => backend).increment(1);
    counter!(SURFACE_BYTES_ALLOCATED, "backend" => backend).increment(bytes as u64);
}

/// Record a surface record being released.
#[inline]
pub fn record_surface_freed(backend: &'static str, owned: bool) {
    counter!(SURFACES_FREED, "backend" => backend, "owned" => if owned { "true" } else { "false" })
        .increment(1);
}

/// Record a region cloned into this process.
#[inline]
pub fn record_surface_cloned(backend: &'static str) {
    counter!(SURFACES_CLONED, "backend" => backend).increment(1);
}

/// Record an owner free refused with `InUse`.
#[inline]
pub fn record_free_in_use() {
    counter!(FREE_IN_USE).increment(1);
}

/// Per-registry handles with the registry name pre-bound as a label.
#[derive(Clone)]
pub struct RegistryMetrics {
    registry: String,
    compactions: Counter,
    owner_died: Counter,
    live_entries: Gauge,
    tombstones: Gauge,
}

impl RegistryMetrics {
    /// Create handles for the registry called `registry`.
    pub fn new(registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            compactions: counter!(REGISTRY_COMPACTIONS, "registry" => registry.to_string()),
            owner_died: counter!(REGISTRY_OWNER_DIED, "registry" => registry.to_string()),
            live_entries: gauge!(REGISTRY_LIVE_ENTRIES, "registry" => registry.to_string()),
            tombstones: gauge!(REGISTRY_TOMBSTONES, "registry" => registry.to_string()),
        }
    }

    /// Record a completed compaction.
    #[inline]
    pub fn record_compaction(&self) {
        self.compactions.increment(1);
    }

    /// Record a recovery from a dead mutex holder.
    #[inline]
    pub fn record_owner_died(&self) {
        self.owner_died.increment(1);
    }

    /// Publish the table occupancy.
    #[inline]
    pub fn record_occupancy(&self, live: u32, tombstones: u32) {
        self.live_entries.set(live as f64);
        self.tombstones.set(tombstones as f64);
    }

    /// Registry name used as the label.
    pub fn registry(&self) -> &str {
        &self.registry
    }
}

impl std::fmt::Debug for RegistryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryMetrics")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic
        init_metrics();
        // Should be idempotent
        init_metrics();
    }

    #[test]
    fn test_registry_metrics() {
        let metrics = RegistryMetrics::new("/test-registry");

        metrics.record_compaction();
        metrics.record_owner_died();
        metrics.record_occupancy(10, 2);

        assert_eq!(metrics.registry(), "/test-registry");
    }

    #[test]
    fn test_global_recording_functions() {
        // These should not panic even without a recorder installed
        record_surface_allocated("heap", 4096);
        record_surface_freed("heap", true);
        record_surface_cloned("shm");
        record_free_in_use();
    }
}
