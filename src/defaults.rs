//! Default sizes, limits, and names.
//!
//! These values back the `Default` impls of the configuration structs and can
//! be overridden through their `with_*` builders.
//!
//! # Usage
//!
//! ```rust
//! use surfacekit::defaults;
//! use surfacekit::registry::RegistryConfig;
//!
//! let config = RegistryConfig::default().with_capacity(defaults::REGISTRY_CAPACITY * 2);
//! assert_eq!(config.capacity, 8192);
//! ```

use std::time::Duration;

// =============================================================================
// Buffers
// =============================================================================

/// Largest width or height the shared-memory backend accepts.
pub const MAX_DIMENSION: u32 = 16384;

/// Default row alignment in bytes (one cache line, and what most blitters expect).
pub const STRIDE_ALIGNMENT: usize = 64;

/// Prefix of the shared-memory object names created for buffer regions.
pub const REGION_PREFIX: &str = "surfacekit-region";

/// How many fresh ids the allocator tries before giving up on registration.
pub const ID_ATTEMPTS: u32 = 8;

// =============================================================================
// Registry
// =============================================================================

/// Well-known name of the process-spanning buffer registry.
pub const REGISTRY_NAME: &str = "/surfacekit-registry";

/// Number of entries in the registry table.
/// 4096 entries cost 672 KiB of table plus the same again for compaction scratch.
pub const REGISTRY_CAPACITY: u32 = 4096;

/// Compaction runs once tombstones exceed `capacity / TOMBSTONE_DIVISOR`.
pub const TOMBSTONE_DIVISOR: u32 = 4;

/// How long a late attacher waits for the creating process to publish the
/// registry header.
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);

/// Page size used when the OS cannot be asked.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// OS page size.
pub fn page_size() -> usize {
    match rustix::param::page_size() {
        0 => FALLBACK_PAGE_SIZE,
        size => size,
    }
}
