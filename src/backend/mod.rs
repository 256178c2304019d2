//! Allocation backends: turning a buffer descriptor into mapped memory.
//!
//! The [`AllocationBackend`] trait is the seam between the allocator and the
//! OS. [`SharedMemoryBackend`] is the production implementation;
//! [`HeapBackend`] skips OS region creation so tests can run without
//! touching `/dev/shm`.
//!
//! # Example
//!
//! ```rust,ignore
//! use surfacekit::backend::{AllocationBackend, BufferDescriptor, SharedMemoryBackend};
//! use surfacekit::format::PixelFormat;
//!
//! let backend = SharedMemoryBackend::new(Default::default());
//! let allocation = backend.allocate(&BufferDescriptor::new(640, 480, PixelFormat::Nv12))?;
//! assert_eq!(allocation.layout().plane_count(), 2);
//! backend.free(allocation)?;
//! ```

mod heap;
mod shm;

pub use heap::HeapBackend;
pub use shm::SharedMemoryBackend;

use crate::defaults;
use crate::error::{Error, Result};
use crate::format::{self, PixelFormat, SurfaceLayout};
use crate::id::RegionHandle;
use crate::memory::MemorySegment;
use crate::registry::BufferInfo;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// How a buffer will be used.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsageFlags: u32 {
        /// The CPU reads pixels.
        const CPU_READ = 1 << 0;
        /// The CPU writes pixels.
        const CPU_WRITE = 1 << 1;
        /// The buffer is looked up from other processes.
        const SHARED = 1 << 2;
        /// Sampled by a GPU. Not supported by CPU-only backends.
        const GPU_SAMPLED = 1 << 8;
        /// Rendered to by a GPU. Not supported by CPU-only backends.
        const GPU_RENDER_TARGET = 1 << 9;
    }
}

impl Default for UsageFlags {
    fn default() -> Self {
        UsageFlags::CPU_READ | UsageFlags::CPU_WRITE | UsageFlags::SHARED
    }
}

/// What to allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Declared bytes per element of plane 0 (0 = derive from format).
    pub bytes_per_element: u32,
    /// Declared plane-0 row stride before alignment (0 = derive from format).
    pub bytes_per_row: u32,
    /// Intended usage.
    pub usage: UsageFlags,
}

impl BufferDescriptor {
    /// Describe a `width` x `height` buffer with derived strides and default usage.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            bytes_per_element: 0,
            bytes_per_row: 0,
            usage: UsageFlags::default(),
        }
    }

    /// Declare the plane-0 stride.
    pub fn with_bytes_per_row(mut self, bytes_per_row: u32) -> Self {
        self.bytes_per_row = bytes_per_row;
        self
    }

    /// Declare the plane-0 element size.
    pub fn with_bytes_per_element(mut self, bytes_per_element: u32) -> Self {
        self.bytes_per_element = bytes_per_element;
        self
    }

    /// Set the usage flags.
    pub fn with_usage(mut self, usage: UsageFlags) -> Self {
        self.usage = usage;
        self
    }
}

/// Settings shared by the built-in backends.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Prefix of region object names.
    pub region_prefix: String,
    /// Row alignment in bytes.
    pub stride_alignment: usize,
    /// Largest accepted width.
    pub max_width: u32,
    /// Largest accepted height.
    pub max_height: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            region_prefix: defaults::REGION_PREFIX.to_string(),
            stride_alignment: defaults::STRIDE_ALIGNMENT,
            max_width: defaults::MAX_DIMENSION,
            max_height: defaults::MAX_DIMENSION,
        }
    }
}

impl BackendConfig {
    /// Use a different region name prefix.
    pub fn with_region_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.region_prefix = prefix.into();
        self
    }

    /// Use a different row alignment.
    pub fn with_stride_alignment(mut self, alignment: usize) -> Self {
        self.stride_alignment = alignment;
        self
    }

    /// Cap the accepted dimensions.
    pub fn with_max_dimensions(mut self, width: u32, height: u32) -> Self {
        self.max_width = width;
        self.max_height = height;
        self
    }
}

/// Memory produced by a backend for one buffer.
pub struct Allocation {
    segment: Arc<dyn MemorySegment>,
    region: RegionHandle,
    layout: SurfaceLayout,
    size: usize,
    owns_region: bool,
}

impl Allocation {
    /// Bundle a mapped segment with its layout.
    pub fn new(
        segment: Arc<dyn MemorySegment>,
        region: RegionHandle,
        layout: SurfaceLayout,
        owns_region: bool,
    ) -> Self {
        let size = segment.len();
        Self {
            segment,
            region,
            layout,
            size,
            owns_region,
        }
    }

    /// The mapped memory.
    #[inline]
    pub fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.segment
    }

    /// Process-independent handle of the backing region.
    #[inline]
    pub fn region(&self) -> RegionHandle {
        self.region
    }

    /// Plane table.
    #[inline]
    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }

    /// Mapped size in bytes (page-rounded).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this allocation created the region (true) or maps a clone (false).
    #[inline]
    pub fn owns_region(&self) -> bool {
        self.owns_region
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("region", &self.region)
            .field("size", &self.size)
            .field("planes", &self.layout.plane_count())
            .field("owns_region", &self.owns_region)
            .finish()
    }
}

/// Trait for allocation backends.
///
/// Backends are used as `Arc<dyn AllocationBackend>` so a test double can
/// replace the shared-memory implementation.
pub trait AllocationBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Create and zero-fill a new region for `descriptor`.
    fn allocate(&self, descriptor: &BufferDescriptor) -> Result<Allocation>;

    /// Map the existing region described by registry metadata.
    ///
    /// The returned allocation does not own the region.
    fn clone_region(&self, info: &BufferInfo) -> Result<Allocation>;

    /// Release an allocation. Owned regions are destroyed; clones are unmapped.
    fn free(&self, allocation: Allocation) -> Result<()>;

    /// Make the allocation CPU-accessible. Always-mapped backends do nothing.
    fn map(&self, _allocation: &Allocation) -> Result<()> {
        Ok(())
    }

    /// Undo [`AllocationBackend::map`].
    fn unmap(&self, _allocation: &Allocation) -> Result<()> {
        Ok(())
    }

    /// Row alignment used for `format`.
    fn stride_alignment(&self, format: PixelFormat) -> usize;

    /// Largest accepted width.
    fn max_width(&self) -> u32;

    /// Largest accepted height.
    fn max_height(&self) -> u32;

    /// Whether `format` can be allocated.
    fn supports_format(&self, format: PixelFormat) -> bool;

    /// Whether every flag in `usage` is honoured.
    fn supports_usage(&self, usage: UsageFlags) -> bool;

    /// Check a descriptor against this backend's limits.
    fn validate(&self, descriptor: &BufferDescriptor) -> Result<()> {
        let BufferDescriptor {
            width,
            height,
            format,
            ..
        } = *descriptor;

        if width == 0 || height == 0 {
            return Err(Error::BadArgument(format!(
                "dimensions must be non-zero, got {width}x{height}"
            )));
        }
        if width > self.max_width() || height > self.max_height() {
            return Err(Error::BadArgument(format!(
                "{width}x{height} exceeds the {}x{} limit of the {} backend",
                self.max_width(),
                self.max_height(),
                self.name()
            )));
        }
        if !self.supports_format(format) {
            return Err(Error::BadArgument(format!(
                "{format:?} is not supported by the {} backend",
                self.name()
            )));
        }
        if !self.supports_usage(descriptor.usage) {
            return Err(Error::BadArgument(format!(
                "usage {:?} is not supported by the {} backend",
                descriptor.usage,
                self.name()
            )));
        }

        let bytes_per_element = format::bytes_per_pixel(format);
        if descriptor.bytes_per_element != 0
            && descriptor.bytes_per_element as usize != bytes_per_element
        {
            return Err(Error::BadArgument(format!(
                "{format:?} has {bytes_per_element} bytes per element, descriptor declares {}",
                descriptor.bytes_per_element
            )));
        }
        let min_row = width as usize * bytes_per_element;
        if descriptor.bytes_per_row != 0 && (descriptor.bytes_per_row as usize) < min_row {
            return Err(Error::BadArgument(format!(
                "bytes_per_row {} is below the {min_row} bytes one row needs",
                descriptor.bytes_per_row
            )));
        }
        Ok(())
    }

    /// Plane table for a validated descriptor.
    fn layout_for(&self, descriptor: &BufferDescriptor) -> SurfaceLayout {
        SurfaceLayout::compute(
            descriptor.format,
            descriptor.width,
            descriptor.height,
            self.stride_alignment(descriptor.format),
            descriptor.bytes_per_row as usize,
        )
    }
}

/// Bytes to reserve for `layout`: the plane total rounded up to whole pages.
pub(crate) fn allocation_size(layout: &SurfaceLayout) -> usize {
    format::align_up(layout.total_size(), defaults::page_size())
}

/// Common checks before mapping a region described by the registry.
pub(crate) fn check_clone_size(info: &BufferInfo, mapped: usize) -> Result<()> {
    if mapped < info.alloc_size {
        return Err(Error::InvalidRegion(format!(
            "region {} maps {mapped} bytes, registry expects {}",
            info.region, info.alloc_size
        )));
    }
    Ok(())
}
