//! # surfacekit
//!
//! Cross-process graphics-buffer sharing for Linux.
//!
//! surfacekit allocates pixel buffers in POSIX shared memory, tracks how many
//! processes hold each one, and lets the owning process hand out revocable
//! capability tokens so peers can map the same pixels.
//!
//! ## Features
//!
//! - **Layout calculation**: plane strides, offsets, and component bit layouts
//!   for packed RGB, semi-planar and planar YUV, and single-channel formats
//! - **Shared registry**: one open-addressing table in shared memory, guarded
//!   by a robust mutex that survives its holder dying
//! - **Split reference counting**: cheap local pins per process, one global
//!   vote per process in the registry
//! - **Access tokens**: owner-minted, revocable, 16-byte wire format
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use surfacekit::prelude::*;
//!
//! let allocator = BufferAllocator::global()?;
//! let surface = allocator.allocate(&BufferDescriptor::new(640, 480, PixelFormat::Nv12))?;
//!
//! surface.lock(LockOptions::empty())?;
//! let luma = surface.plane_base_address(0).unwrap();
//! // ... write pixels ...
//! surface.unlock(LockOptions::empty())?;
//!
//! let token = surface.create_access_token()?;
//! // In another process:
//! // let peer = BufferAllocator::global()?.lookup_with_token(&token)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod backend;
pub mod defaults;
pub mod error;
pub mod format;
pub mod id;
pub mod memory;
pub mod observability;
pub mod registry;
pub mod surface;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::allocator::{AllocatorConfig, BufferAllocator};
    pub use crate::backend::{AllocationBackend, BufferDescriptor, UsageFlags};
    pub use crate::error::{Error, Result};
    pub use crate::format::{PixelFormat, PlaneInfo};
    pub use crate::id::{BufferId, ProcessId};
    pub use crate::registry::AccessToken;
    pub use crate::surface::{LockOptions, PurgeableState, SurfaceHandle};
}

pub use allocator::BufferAllocator;
pub use backend::BufferDescriptor;
pub use error::{Error, Result};
pub use format::PixelFormat;
pub use surface::SurfaceHandle;
