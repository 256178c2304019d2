//! Stress tests for the shared buffer registry.
//!
//! These exercise tombstone reuse, compaction, and concurrent mutation from
//! several threads and several attachments of the same region.

mod common;

use common::TestNames;
use std::sync::Arc;
use std::thread;
use surfacekit::backend::{Allocation, AllocationBackend, BufferDescriptor, HeapBackend};
use surfacekit::error::Error;
use surfacekit::format::PixelFormat;
use surfacekit::id::{BufferId, ProcessId};
use surfacekit::registry::{BufferRegistry, RegistryConfig};

fn owner() -> ProcessId {
    ProcessId::from_raw(4242)
}

fn id(raw: u32) -> BufferId {
    BufferId::new(raw).unwrap()
}

fn fixture(names: &TestNames, capacity: u32) -> (Arc<BufferRegistry>, BufferDescriptor, Allocation) {
    let config: RegistryConfig = names.registry_config().with_capacity(capacity);
    let registry = Arc::new(BufferRegistry::attach(&config).unwrap());
    let descriptor = BufferDescriptor::new(4, 4, PixelFormat::Rgba8888);
    let allocation = HeapBackend::default().allocate(&descriptor).unwrap();
    (registry, descriptor, allocation)
}

// ============================================================================
// Tombstones and compaction
// ============================================================================

/// Register N, unregister half, register N/2 more; everything live resolves.
#[test]
fn test_tombstone_reuse_keeps_chains_intact() {
    let names = TestNames::new("tombstones");
    let (registry, descriptor, allocation) = fixture(&names, 256);
    let n = 128;

    for raw in 1..=n {
        registry.register(id(raw), owner(), &descriptor, &allocation).unwrap();
    }
    for raw in (1..=n).step_by(2) {
        registry.unregister(id(raw), owner()).unwrap();
    }
    // Colliding ids (same probe start modulo 256) land on tombstones.
    for raw in (1..=n).step_by(2).map(|raw| raw + 256) {
        registry.register(id(raw), owner(), &descriptor, &allocation).unwrap();
    }

    for raw in (2..=n).step_by(2) {
        assert_eq!(registry.lookup_info(id(raw), owner()).unwrap().id, id(raw));
    }
    for raw in (1..=n).step_by(2) {
        assert!(matches!(
            registry.lookup_info(id(raw), owner()),
            Err(Error::NotFound(_))
        ));
        assert!(registry.lookup_info(id(raw + 256), owner()).is_ok());
    }
    assert_eq!(registry.stats().unwrap().live, n);
}

/// Compaction preserves every live entry and clears tombstones.
#[test]
fn test_compaction_preserves_live_entries() {
    let names = TestNames::new("compaction");
    let (registry, descriptor, allocation) = fixture(&names, 64);

    for raw in 1..=48 {
        registry.register(id(raw), owner(), &descriptor, &allocation).unwrap();
    }
    for raw in 1..=16 {
        registry.increment_global_use_count(id(raw + 16)).unwrap();
        registry.unregister(id(raw), owner()).unwrap();
    }

    let stats = registry.stats().unwrap();
    assert_eq!(stats.live, 32);
    // 16 tombstones against a limit of 64 / 4 = 16: not yet compacted.
    assert_eq!(stats.tombstones, 16);

    registry.unregister(id(33), owner()).unwrap();
    let stats = registry.stats().unwrap();
    assert_eq!(stats.tombstones, 0);
    assert_eq!(stats.live, 31);

    for raw in 17..=32 {
        assert_eq!(registry.global_use_count(id(raw)).unwrap(), 1);
    }
    for raw in 34..=48 {
        assert_eq!(registry.global_use_count(id(raw)).unwrap(), 0);
    }
}

/// Churn far beyond capacity without running out of slots.
#[test]
fn test_churn_beyond_capacity() {
    let names = TestNames::new("churn");
    let (registry, descriptor, allocation) = fixture(&names, 32);

    for round in 0..200u32 {
        let raw = round * 7 + 1;
        registry.register(id(raw), owner(), &descriptor, &allocation).unwrap();
        if round >= 8 {
            registry.unregister(id((round - 8) * 7 + 1), owner()).unwrap();
        }
    }
    let stats = registry.stats().unwrap();
    assert_eq!(stats.live, 8);
    assert!(stats.tombstones <= stats.tombstone_limit);
}

// ============================================================================
// Concurrency
// ============================================================================

/// Threads on separate attachments register, count, and unregister disjoint ids.
#[test]
fn test_concurrent_attachments() {
    let names = TestNames::new("concurrent");
    let (first, descriptor, allocation) = fixture(&names, 1024);
    let allocation = Arc::new(allocation);
    let num_threads = 8u32;
    let per_thread = 64u32;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let config = names.registry_config();
            let allocation = Arc::clone(&allocation);
            thread::spawn(move || {
                let registry = BufferRegistry::attach(&config).unwrap();
                assert!(!registry.created());
                let process = ProcessId::from_raw(5000 + t as i32);
                for i in 0..per_thread {
                    let buffer = id(1 + t * per_thread + i);
                    registry
                        .register(buffer, process, &descriptor, &allocation)
                        .unwrap();
                    registry.increment_global_use_count(buffer).unwrap();
                    if i % 2 == 0 {
                        registry.decrement_global_use_count(buffer).unwrap();
                        registry.unregister(buffer, process).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = first.stats().unwrap();
    assert_eq!(stats.live, num_threads * per_thread / 2);
    for t in 0..num_threads {
        let process = ProcessId::from_raw(5000 + t as i32);
        for i in (1..per_thread).step_by(2) {
            let info = first.lookup_info(id(1 + t * per_thread + i), process).unwrap();
            assert_eq!(info.global_use, 1);
        }
    }
}

/// Tokens minted and revoked while other threads validate them never
/// validate a revoked generation.
#[test]
fn test_token_revocation_under_contention() {
    let names = TestNames::new("revocation");
    let (registry, descriptor, allocation) = fixture(&names, 16);
    registry.register(id(77), owner(), &descriptor, &allocation).unwrap();

    let stale = registry.create_access_token(id(77), owner()).unwrap();
    registry.revoke_all_access(id(77), owner()).unwrap();

    let validators: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..500 {
                    assert!(matches!(
                        registry.validate_token(&stale),
                        Err(Error::NotAllowed(_))
                    ));
                }
            })
        })
        .collect();
    for _ in 0..50 {
        registry.revoke_all_access(id(77), owner()).unwrap();
        let token = registry.create_access_token(id(77), owner()).unwrap();
        registry.validate_token(&token).unwrap();
    }
    for handle in validators {
        handle.join().unwrap();
    }
    assert_eq!(
        registry.create_access_token(id(77), owner()).unwrap().generation(),
        51
    );
}
