//! Sharing surfaces between two allocators that act as separate processes.
//!
//! Each allocator attaches the registry on its own and uses its own
//! shared-memory backend, so pixels and metadata only meet through named
//! shared memory, as they would across a process boundary.

mod common;

use common::{TestNames, init_tracing};
use surfacekit::prelude::*;
use surfacekit::registry::TOKEN_WIRE_SIZE;

const OWNER_PID: i32 = 0x1000;
const READER_PID: i32 = 0x2000;

#[test]
fn test_token_lookup_scenario() {
    init_tracing();
    let names = TestNames::new("scenario");
    let a = names.shm_allocator(OWNER_PID);
    let b = names.shm_allocator(READER_PID);

    let x = a
        .allocate(&BufferDescriptor::new(320, 240, PixelFormat::Bgra8888))
        .unwrap();

    // A forged token is refused.
    let real = x.create_access_token().unwrap();
    let mut forged = real.to_bytes();
    forged[4] ^= 0xFF;
    let forged = AccessToken::from_bytes(&forged).unwrap();
    assert!(matches!(b.lookup_with_token(&forged), Err(Error::NotAllowed(_))));

    // The real one, sent over the wire, works.
    let wire: [u8; TOKEN_WIRE_SIZE] = real.to_bytes();
    let y = b
        .lookup_with_token(&AccessToken::from_bytes(&wire).unwrap())
        .unwrap();
    assert_eq!(y.id(), x.id());
    assert!(!y.owns_region());
    assert_eq!(x.global_use_count().unwrap(), 2);

    // A cannot tear the buffer down while B holds it.
    assert!(matches!(x.free(), Err(Error::InUse { global_use: 2, .. })));
    assert!(x.is_valid());

    y.free().unwrap();
    assert_eq!(x.global_use_count().unwrap(), 1);
    x.free().unwrap();
    assert_eq!(a.registry().stats().unwrap().live, 0);
}

#[test]
fn test_pixels_are_shared() {
    let names = TestNames::new("pixels");
    let a = names.shm_allocator(OWNER_PID);
    let b = names.shm_allocator(READER_PID);

    let x = a
        .allocate(&BufferDescriptor::new(64, 64, PixelFormat::Nv12))
        .unwrap();
    let y = b
        .lookup_with_token(&x.create_access_token().unwrap())
        .unwrap();

    let seed = x.lock(LockOptions::empty()).unwrap();
    let chroma = x.plane_base_address(1).unwrap();
    unsafe { chroma.as_ptr().write_bytes(0x80, x.plane_bytes_per_row(1)) };
    assert_eq!(x.unlock(LockOptions::empty()).unwrap(), seed + 1);

    y.lock(LockOptions::READ_ONLY).unwrap();
    let row = unsafe {
        std::slice::from_raw_parts(y.plane_base_address(1).unwrap().as_ptr(), y.plane_bytes_per_row(1))
    };
    assert!(row.iter().all(|&byte| byte == 0x80));
    y.unlock(LockOptions::READ_ONLY).unwrap();

    // Seeds are per record, not shared across processes.
    assert_eq!(y.seed(), 0);

    y.free().unwrap();
    x.free().unwrap();
}

#[test]
fn test_reader_cannot_manage_owner_buffer() {
    let names = TestNames::new("privileges");
    let a = names.shm_allocator(OWNER_PID);
    let b = names.shm_allocator(READER_PID);

    let x = a
        .allocate(&BufferDescriptor::new(16, 16, PixelFormat::Rgb565))
        .unwrap();
    assert!(matches!(b.lookup_or_clone(x.id()), Err(Error::NotAllowed(_))));
    assert!(matches!(b.lookup(x.id()), Err(Error::NotFound(_))));

    let y = b
        .lookup_with_token(&x.create_access_token().unwrap())
        .unwrap();
    assert!(matches!(y.create_access_token(), Err(Error::NotAllowed(_))));
    assert!(matches!(y.revoke_all_access(), Err(Error::NotAllowed(_))));

    y.free().unwrap();
    x.free().unwrap();
}

#[test]
fn test_revoke_blocks_new_lookups_only() {
    let names = TestNames::new("revoke");
    let a = names.shm_allocator(OWNER_PID);
    let b = names.shm_allocator(READER_PID);
    let c = names.shm_allocator(READER_PID + 1);

    let x = a
        .allocate(&BufferDescriptor::new(32, 32, PixelFormat::L8))
        .unwrap();
    let token = x.create_access_token().unwrap();
    let y = b.lookup_with_token(&token).unwrap();

    x.revoke_all_access().unwrap();
    assert!(matches!(c.lookup_with_token(&token), Err(Error::NotAllowed(_))));
    // Existing clones keep working.
    assert!(y.lock(LockOptions::READ_ONLY).is_ok());
    y.unlock(LockOptions::READ_ONLY).unwrap();

    let fresh = x.create_access_token().unwrap();
    assert_eq!(fresh.generation(), token.generation() + 1);
    let z = c.lookup_with_token(&fresh).unwrap();
    assert_eq!(x.global_use_count().unwrap(), 3);

    z.free().unwrap();
    y.free().unwrap();
    x.free().unwrap();
}

#[test]
fn test_region_destroyed_after_owner_free() {
    let names = TestNames::new("destroy");
    let a = names.shm_allocator(OWNER_PID);
    let b = names.shm_allocator(READER_PID);

    let x = a
        .allocate(&BufferDescriptor::new(16, 16, PixelFormat::A8))
        .unwrap();
    let token = x.create_access_token().unwrap();
    x.free().unwrap();

    // The entry is gone; the token now names an unknown buffer.
    assert!(matches!(b.lookup_with_token(&token), Err(Error::NotFound(_))));
}

#[test]
fn test_clone_use_counts_are_independent() {
    let names = TestNames::new("use-counts");
    let a = names.shm_allocator(OWNER_PID);
    let b = names.shm_allocator(READER_PID);

    let x = a
        .allocate(&BufferDescriptor::new(16, 16, PixelFormat::Bgrx8888))
        .unwrap();
    let y = b
        .lookup_with_token(&x.create_access_token().unwrap())
        .unwrap();

    // Local pins on B never change the global count past its one vote.
    y.increment_use_count().unwrap();
    y.increment_use_count().unwrap();
    assert_eq!(x.global_use_count().unwrap(), 2);

    y.free().unwrap();
    y.free().unwrap();
    assert!(y.is_valid());
    assert_eq!(x.global_use_count().unwrap(), 2);
    y.free().unwrap();
    assert!(!y.is_valid());
    assert_eq!(x.global_use_count().unwrap(), 1);

    x.free().unwrap();
}
