//! Observability features: metrics and tracing.
//!
//! ## Metrics
//!
//! surfacekit exposes the following metrics:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `surfacekit_surfaces_allocated` | Counter | Surfaces allocated by this process |
//! | `surfacekit_surfaces_freed` | Counter | Surface records released |
//! | `surfacekit_surfaces_cloned` | Counter | Regions mapped from another process |
//! | `surfacekit_surface_bytes_allocated` | Counter | Bytes of newly created regions |
//! | `surfacekit_free_in_use` | Counter | Owner frees refused with `InUse` |
//! | `surfacekit_registry_compactions` | Counter | Tombstone compactions |
//! | `surfacekit_registry_owner_died` | Counter | Recoveries from a dead mutex holder |
//! | `surfacekit_registry_live_entries` | Gauge | Live registry entries |
//! | `surfacekit_registry_tombstones` | Gauge | Tombstoned registry slots |
//!
//! No recorder or subscriber is installed by the library.
//!
//! ## Example
//!
//! ```rust,ignore
//! use surfacekit::observability::init_metrics;
//!
//! // Describe metrics once at startup; install an exporter of your choice.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    RegistryMetrics, init_metrics, record_free_in_use, record_surface_allocated,
    record_surface_cloned, record_surface_freed,
};
pub use tracing_support::{
    instrument_surface, span_registry, span_surface, trace_free_in_use, trace_rollback_failed,
};
