//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use surfacekit::allocator::{AllocatorConfig, BackendKind, BufferAllocator};
use surfacekit::backend::BackendConfig;
use surfacekit::id::ProcessId;
use surfacekit::registry::{BufferRegistry, RegistryConfig};

/// Registry and region names unique to one test.
pub struct TestNames {
    pub registry: String,
    pub region_prefix: String,
}

impl TestNames {
    pub fn new(tag: &str) -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        Self {
            registry: format!("/surfacekit-it-{tag}-{pid}-{n}"),
            region_prefix: format!("surfacekit-it-{tag}-{pid}-{n}-region"),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .with_name(&self.registry)
            .with_capacity(512)
    }

    /// Allocator configuration acting as process `pid`.
    pub fn allocator_config(&self, pid: i32, kind: BackendKind) -> AllocatorConfig {
        AllocatorConfig::default()
            .with_registry(self.registry_config())
            .with_backend(BackendConfig::default().with_region_prefix(&self.region_prefix))
            .with_backend_kind(kind)
            .with_process(ProcessId::from_raw(pid))
    }

    /// An allocator over shared memory with its own registry attachment, as a
    /// separate process would have.
    pub fn shm_allocator(&self, pid: i32) -> BufferAllocator {
        BufferAllocator::from_config(&self.allocator_config(pid, BackendKind::SharedMemory))
            .expect("attach allocator")
    }
}

impl Drop for TestNames {
    fn drop(&mut self) {
        let _ = BufferRegistry::unlink(&self.registry);
    }
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
