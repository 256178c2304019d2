//! Shared-memory layout of the registry and its open-addressing probes.
//!
//! ```text
//! +-------------------+  offset 0
//! | RegistryHeader    |  magic, layout, counters, robust mutex
//! +-------------------+  size_of::<RegistryHeader>()
//! | entries[capacity] |  open-addressing table
//! +-------------------+
//! | scratch[capacity] |  compaction staging area
//! +-------------------+
//! ```
//!
//! Everything after the header is plain `Pod` data: no pointers, so every
//! process can map the region at any address.

use super::mutex::RobustMutex;
use crate::backend::{BufferDescriptor, UsageFlags};
use crate::format::{MAX_PLANES, PixelFormat, PlaneInfo, SurfaceLayout};
use crate::id::{BufferId, ProcessId, RegionHandle};
use bytemuck::{Pod, Zeroable};
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU64;

/// "SKREGTBL" as a little-endian word; published last by the creator.
pub(crate) const REGISTRY_MAGIC: u64 = u64::from_le_bytes(*b"SKREGTBL");

/// Bumped whenever the shared layout changes.
pub(crate) const REGISTRY_VERSION: u32 = 1;

/// Compaction phase stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum CompactionPhase {
    Idle = 0,
    /// Live entries are being copied to scratch; the table is untouched.
    Collecting = 1,
    /// The table is being cleared and refilled from scratch.
    Rebuilding = 2,
}

impl CompactionPhase {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Collecting),
            2 => Some(Self::Rebuilding),
            _ => None,
        }
    }
}

/// Fields fixed at creation time.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct TableLayout {
    pub version: u32,
    pub entry_size: u32,
    pub capacity: u32,
    pub tombstone_limit: u32,
}

/// Counters mutated under the mutex.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct TableState {
    pub live: u32,
    pub tombstones: u32,
    pub phase: u32,
    pub scratch_len: u32,
}

/// Region header.
#[repr(C, align(64))]
pub(crate) struct RegistryHeader {
    pub magic: AtomicU64,
    pub layout: UnsafeCell<TableLayout>,
    pub state: UnsafeCell<TableState>,
    pub mutex: RobustMutex,
}

/// Per-plane geometry, flattened for shared memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct FlatPlane {
    pub width: u32,
    pub height: u32,
    pub bytes_per_element: u32,
    pub bytes_per_row: u32,
    pub offset: u64,
}

/// One slot of the registry table.
///
/// `id` doubles as the slot tag: [`BufferId::EMPTY`] for never-used slots,
/// [`BufferId::TOMBSTONE`] for deleted ones.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct RegistryEntry {
    pub id: u32,
    pub owner_pid: i32,
    pub region: u64,
    pub alloc_size: u64,
    pub secret: u64,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub usage: u32,
    pub bytes_per_element: u32,
    pub bytes_per_row: u32,
    pub plane_count: u32,
    pub global_use: u32,
    pub generation: u32,
    pub reserved: u32,
    pub planes: [FlatPlane; MAX_PLANES],
}

const _: () = assert!(std::mem::size_of::<FlatPlane>() == 24);
const _: () = assert!(std::mem::size_of::<RegistryEntry>() == 168);
const _: () = assert!(std::mem::size_of::<RegistryHeader>() % 64 == 0);
const _: () = assert!(std::mem::align_of::<RegistryEntry>() <= 64);

impl RegistryEntry {
    /// Flatten registration data. Token fields and the use count start at zero.
    pub fn new(
        id: BufferId,
        owner: ProcessId,
        region: RegionHandle,
        descriptor: &BufferDescriptor,
        layout: &SurfaceLayout,
        alloc_size: usize,
    ) -> Self {
        let mut planes = [FlatPlane::default(); MAX_PLANES];
        for (flat, plane) in planes.iter_mut().zip(layout.planes()) {
            *flat = FlatPlane {
                width: plane.width,
                height: plane.height,
                bytes_per_element: plane.bytes_per_element,
                bytes_per_row: plane.bytes_per_row as u32,
                offset: plane.offset as u64,
            };
        }
        Self {
            id: id.as_raw(),
            owner_pid: owner.as_raw(),
            region: region.as_raw(),
            alloc_size: alloc_size as u64,
            secret: 0,
            width: descriptor.width,
            height: descriptor.height,
            format: descriptor.format.as_raw(),
            usage: descriptor.usage.bits(),
            bytes_per_element: descriptor.bytes_per_element,
            bytes_per_row: descriptor.bytes_per_row,
            plane_count: layout.plane_count() as u32,
            global_use: 0,
            generation: 0,
            reserved: 0,
            planes,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.id != BufferId::EMPTY && self.id != BufferId::TOMBSTONE
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.id == BufferId::TOMBSTONE
    }

    #[inline]
    pub fn owner(&self) -> ProcessId {
        ProcessId::from_raw(self.owner_pid)
    }

    #[inline]
    pub fn region(&self) -> RegionHandle {
        RegionHandle::from_raw(self.region)
    }

    /// Rebuild the descriptor. `None` if the stored format is unknown.
    pub fn descriptor(&self) -> Option<BufferDescriptor> {
        Some(BufferDescriptor {
            width: self.width,
            height: self.height,
            format: PixelFormat::from_raw(self.format)?,
            bytes_per_element: self.bytes_per_element,
            bytes_per_row: self.bytes_per_row,
            usage: UsageFlags::from_bits_truncate(self.usage),
        })
    }

    /// Rebuild the plane table. `None` if the stored format is unknown.
    pub fn layout(&self) -> Option<SurfaceLayout> {
        let format = PixelFormat::from_raw(self.format)?;
        let count = (self.plane_count as usize).min(MAX_PLANES);
        let planes: Vec<PlaneInfo> = self.planes[..count]
            .iter()
            .map(|flat| PlaneInfo {
                width: flat.width,
                height: flat.height,
                bytes_per_element: flat.bytes_per_element,
                bytes_per_row: flat.bytes_per_row as usize,
                offset: flat.offset as usize,
            })
            .collect();
        Some(SurfaceLayout::from_planes(format, &planes))
    }
}

/// First slot probed for `id`.
#[inline]
pub(crate) fn probe_start(id: BufferId, capacity: usize) -> usize {
    (id.as_raw() as usize - 1) % capacity
}

/// Slot holding `id`, if any.
///
/// Stops at the id, at an empty slot, or after a full wrap.
pub(crate) fn find_slot(entries: &[RegistryEntry], id: BufferId) -> Option<usize> {
    let capacity = entries.len();
    if capacity == 0 {
        return None;
    }
    let start = probe_start(id, capacity);
    for step in 0..capacity {
        let index = (start + step) % capacity;
        match entries[index].id {
            raw if raw == id.as_raw() => return Some(index),
            BufferId::EMPTY => return None,
            _ => {}
        }
    }
    None
}

/// Where to write `id`.
///
/// Returns the id's own slot when it is already present, otherwise the first
/// reusable (tombstone or empty) slot of the chain. The whole chain is walked
/// so a tombstone earlier in the chain never shadows a live copy further on.
pub(crate) fn find_free_slot(entries: &[RegistryEntry], id: BufferId) -> Option<usize> {
    let capacity = entries.len();
    if capacity == 0 {
        return None;
    }
    let start = probe_start(id, capacity);
    let mut reusable = None;
    for step in 0..capacity {
        let index = (start + step) % capacity;
        match entries[index].id {
            raw if raw == id.as_raw() => return Some(index),
            BufferId::EMPTY => return reusable.or(Some(index)),
            BufferId::TOMBSTONE => {
                reusable.get_or_insert(index);
            }
            _ => {}
        }
    }
    reusable
}
