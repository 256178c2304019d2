//! Pixel formats and the plane layout calculator.
//!
//! Everything here is a pure function over value types: no state, no I/O,
//! no error path. Unknown plane or component indices yield zeroed info so
//! callers can probe without checking first.
//!
//! # Layout rules
//!
//! - Plane 0 is always the full-resolution image at offset 0 with stride
//!   `align_up(width * bytes_per_element, alignment)`.
//! - Semi-planar 4:2:0 (`Nv12`, `Nv21`) adds one interleaved chroma plane of
//!   `((w + 1) / 2, (h + 1) / 2)` elements, 2 bytes each.
//! - Three-plane 4:2:0 (`I420`, `Yv12`) adds two chroma planes of
//!   `((w + 1) / 2, (h + 1) / 2)` elements, 1 byte each.
//! - Plane offsets are stacked in plane order.
//!
//! # Example
//!
//! ```rust
//! use surfacekit::format::{PixelFormat, SurfaceLayout};
//!
//! let layout = SurfaceLayout::compute(PixelFormat::Nv12, 256, 256, 64, 0);
//! assert_eq!(layout.plane(1).offset, 256 * 256);
//! assert_eq!(layout.plane(1).bytes_per_row, 256);
//! ```

use smallvec::SmallVec;

/// Maximum number of planes any format uses.
pub const MAX_PLANES: usize = 4;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Pixel formats (channel order and memory layout).
///
/// Discriminants are little-endian FourCC codes so the raw value can be stored
/// flat in shared memory and read back by any process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(u32)]
pub enum PixelFormat {
    // ========================================================================
    // Packed RGB
    // ========================================================================
    /// 32-bit B, G, R, A bytes in memory (0xAARRGGBB as a little-endian word).
    #[default]
    Bgra8888 = fourcc(b"BGRA"),
    /// 32-bit R, G, B, A bytes in memory.
    Rgba8888 = fourcc(b"RGBA"),
    /// 32-bit B, G, R bytes followed by an ignored byte.
    Bgrx8888 = fourcc(b"BGRX"),
    /// 32-bit R, G, B bytes followed by an ignored byte.
    Rgbx8888 = fourcc(b"RGBX"),
    /// 24-bit R, G, B bytes in memory.
    Rgb888 = fourcc(b"RGB3"),
    /// 16-bit little-endian word, red in the top five bits.
    Rgb565 = fourcc(b"RGBP"),

    // ========================================================================
    // YUV 4:2:0
    // ========================================================================
    /// Y plane, then interleaved Cb/Cr plane.
    Nv12 = fourcc(b"NV12"),
    /// Y plane, then interleaved Cr/Cb plane.
    Nv21 = fourcc(b"NV21"),
    /// Y plane, then Cb plane, then Cr plane.
    I420 = fourcc(b"I420"),
    /// Y plane, then Cr plane, then Cb plane.
    Yv12 = fourcc(b"YV12"),

    // ========================================================================
    // Single channel
    // ========================================================================
    /// 8-bit alpha only.
    A8 = fourcc(b"A8  "),
    /// 8-bit luminance only.
    L8 = fourcc(b"L8  "),
}

impl PixelFormat {
    /// Every supported format.
    pub const ALL: [PixelFormat; 12] = [
        PixelFormat::Bgra8888,
        PixelFormat::Rgba8888,
        PixelFormat::Bgrx8888,
        PixelFormat::Rgbx8888,
        PixelFormat::Rgb888,
        PixelFormat::Rgb565,
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::I420,
        PixelFormat::Yv12,
        PixelFormat::A8,
        PixelFormat::L8,
    ];

    /// The raw FourCC value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Map a raw FourCC value back to a format.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.as_raw() == raw)
    }
}

/// Geometry of one plane within an allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PlaneInfo {
    /// Width in elements.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
    /// Bytes per element.
    pub bytes_per_element: u32,
    /// Stride in bytes (alignment applied).
    pub bytes_per_row: usize,
    /// Byte offset from the allocation base.
    pub offset: usize,
}

impl PlaneInfo {
    /// Bytes covered by this plane.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes_per_row.saturating_mul(self.height as usize)
    }

    /// First byte past the end of this plane.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size())
    }
}

/// Round `value` up to a multiple of `alignment`. `0` and `1` mean no rounding.
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment).saturating_mul(alignment)
}

/// Number of planes the format uses.
pub fn plane_count(format: PixelFormat) -> usize {
    match format {
        PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
        PixelFormat::I420 | PixelFormat::Yv12 => 3,
        _ => 1,
    }
}

/// Whether the format stores its channels in more than one plane.
pub fn is_planar(format: PixelFormat) -> bool {
    plane_count(format) > 1
}

/// Bytes per element of plane 0.
pub fn bytes_per_pixel(format: PixelFormat) -> usize {
    plane_bytes_per_element(format, 0)
}

/// Bytes per element of the given plane; `0` for planes the format lacks.
pub fn plane_bytes_per_element(format: PixelFormat, plane: usize) -> usize {
    if plane >= plane_count(format) {
        return 0;
    }
    match (format, plane) {
        (
            PixelFormat::Bgra8888
            | PixelFormat::Rgba8888
            | PixelFormat::Bgrx8888
            | PixelFormat::Rgbx8888,
            _,
        ) => 4,
        (PixelFormat::Rgb888, _) => 3,
        (PixelFormat::Rgb565, _) => 2,
        (PixelFormat::Nv12 | PixelFormat::Nv21, 1) => 2,
        _ => 1,
    }
}

/// Dimensions in elements of the given plane; `(0, 0)` for planes the format lacks.
pub fn plane_dimensions(format: PixelFormat, plane: usize, width: u32, height: u32) -> (u32, u32) {
    if plane >= plane_count(format) {
        return (0, 0);
    }
    if plane == 0 {
        (width, height)
    } else {
        (width.div_ceil(2), height.div_ceil(2))
    }
}

/// Compute the geometry of one plane.
///
/// Returns `PlaneInfo::default()` when `plane` is out of range for `format`.
pub fn calculate_plane(
    format: PixelFormat,
    plane: usize,
    width: u32,
    height: u32,
    stride_alignment: usize,
) -> PlaneInfo {
    SurfaceLayout::compute(format, width, height, stride_alignment, 0).plane(plane)
}

/// Bytes needed to hold every plane (not rounded to a page).
pub fn total_size(format: PixelFormat, width: u32, height: u32, stride_alignment: usize) -> usize {
    SurfaceLayout::compute(format, width, height, stride_alignment, 0).total_size()
}

/// Complete plane table for one buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SurfaceLayout {
    format: PixelFormat,
    planes: SmallVec<[PlaneInfo; MAX_PLANES]>,
}

impl SurfaceLayout {
    /// Lay out every plane of a `width` x `height` buffer.
    ///
    /// `row_bytes` overrides the unaligned plane-0 stride when non-zero; the
    /// caller is responsible for it covering at least one row of elements.
    pub fn compute(
        format: PixelFormat,
        width: u32,
        height: u32,
        stride_alignment: usize,
        row_bytes: usize,
    ) -> Self {
        let mut planes = SmallVec::new();
        let mut offset = 0usize;

        for plane in 0..plane_count(format) {
            let (plane_width, plane_height) = plane_dimensions(format, plane, width, height);
            let bytes_per_element = plane_bytes_per_element(format, plane);
            let min_row = if plane == 0 && row_bytes != 0 {
                row_bytes
            } else {
                (plane_width as usize).saturating_mul(bytes_per_element)
            };
            let info = PlaneInfo {
                width: plane_width,
                height: plane_height,
                bytes_per_element: bytes_per_element as u32,
                bytes_per_row: align_up(min_row, stride_alignment),
                offset,
            };
            offset = info.end();
            planes.push(info);
        }

        Self { format, planes }
    }

    /// Rebuild a layout from an already computed plane table.
    pub fn from_planes(format: PixelFormat, planes: &[PlaneInfo]) -> Self {
        Self {
            format,
            planes: planes.iter().copied().take(MAX_PLANES).collect(),
        }
    }

    /// The format this layout was computed for.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// All planes in order.
    #[inline]
    pub fn planes(&self) -> &[PlaneInfo] {
        &self.planes
    }

    /// Number of planes.
    #[inline]
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// One plane, or zeroed info when out of range.
    pub fn plane(&self, index: usize) -> PlaneInfo {
        self.planes.get(index).copied().unwrap_or_default()
    }

    /// Bytes needed to hold every plane.
    pub fn total_size(&self) -> usize {
        self.planes.iter().map(PlaneInfo::end).max().unwrap_or(0)
    }
}

// ============================================================================
// Components
// ============================================================================

/// Meaning of one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// No such component.
    #[default]
    Unknown,
    /// Red.
    Red,
    /// Green.
    Green,
    /// Blue.
    Blue,
    /// Alpha.
    Alpha,
    /// Luminance (Y).
    Luma,
    /// Blue-difference chroma (Cb / U).
    Cb,
    /// Red-difference chroma (Cr / V).
    Cr,
    /// Padding bits that carry no data.
    Unused,
}

/// Bit position of one channel inside its plane's little-endian element word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComponentInfo {
    /// What the bits mean.
    pub kind: ComponentKind,
    /// Plane holding the component.
    pub plane: u8,
    /// Offset of the lowest bit within the element.
    pub bit_offset: u8,
    /// Number of bits.
    pub bit_depth: u8,
}

const fn comp(kind: ComponentKind, plane: u8, bit_offset: u8, bit_depth: u8) -> ComponentInfo {
    ComponentInfo {
        kind,
        plane,
        bit_offset,
        bit_depth,
    }
}

fn components(format: PixelFormat) -> &'static [ComponentInfo] {
    use ComponentKind::*;

    const BGRA: [ComponentInfo; 4] = [
        comp(Blue, 0, 0, 8),
        comp(Green, 0, 8, 8),
        comp(Red, 0, 16, 8),
        comp(Alpha, 0, 24, 8),
    ];
    const RGBA: [ComponentInfo; 4] = [
        comp(Red, 0, 0, 8),
        comp(Green, 0, 8, 8),
        comp(Blue, 0, 16, 8),
        comp(Alpha, 0, 24, 8),
    ];
    const BGRX: [ComponentInfo; 4] = [
        comp(Blue, 0, 0, 8),
        comp(Green, 0, 8, 8),
        comp(Red, 0, 16, 8),
        comp(Unused, 0, 24, 8),
    ];
    const RGBX: [ComponentInfo; 4] = [
        comp(Red, 0, 0, 8),
        comp(Green, 0, 8, 8),
        comp(Blue, 0, 16, 8),
        comp(Unused, 0, 24, 8),
    ];
    const RGB888: [ComponentInfo; 3] = [
        comp(Red, 0, 0, 8),
        comp(Green, 0, 8, 8),
        comp(Blue, 0, 16, 8),
    ];
    const RGB565: [ComponentInfo; 3] = [
        comp(Blue, 0, 0, 5),
        comp(Green, 0, 5, 6),
        comp(Red, 0, 11, 5),
    ];
    const NV12: [ComponentInfo; 3] = [comp(Luma, 0, 0, 8), comp(Cb, 1, 0, 8), comp(Cr, 1, 8, 8)];
    const NV21: [ComponentInfo; 3] = [comp(Luma, 0, 0, 8), comp(Cr, 1, 0, 8), comp(Cb, 1, 8, 8)];
    const I420: [ComponentInfo; 3] = [comp(Luma, 0, 0, 8), comp(Cb, 1, 0, 8), comp(Cr, 2, 0, 8)];
    const YV12: [ComponentInfo; 3] = [comp(Luma, 0, 0, 8), comp(Cr, 1, 0, 8), comp(Cb, 2, 0, 8)];
    const A8: [ComponentInfo; 1] = [comp(Alpha, 0, 0, 8)];
    const L8: [ComponentInfo; 1] = [comp(Luma, 0, 0, 8)];

    match format {
        PixelFormat::Bgra8888 => &BGRA,
        PixelFormat::Rgba8888 => &RGBA,
        PixelFormat::Bgrx8888 => &BGRX,
        PixelFormat::Rgbx8888 => &RGBX,
        PixelFormat::Rgb888 => &RGB888,
        PixelFormat::Rgb565 => &RGB565,
        PixelFormat::Nv12 => &NV12,
        PixelFormat::Nv21 => &NV21,
        PixelFormat::I420 => &I420,
        PixelFormat::Yv12 => &YV12,
        PixelFormat::A8 => &A8,
        PixelFormat::L8 => &L8,
    }
}

/// Number of components (including padding) the format describes.
pub fn component_count(format: PixelFormat) -> usize {
    components(format).len()
}

/// One component, or zeroed info when `index` is out of range.
pub fn component(format: PixelFormat, index: usize) -> ComponentInfo {
    components(format).get(index).copied().unwrap_or_default()
}

/// Bit offset of a component inside its element word.
pub fn component_bit_offset(format: PixelFormat, index: usize) -> u8 {
    component(format, index).bit_offset
}

/// Bit depth of a component.
pub fn component_bit_depth(format: PixelFormat, index: usize) -> u8 {
    component(format, index).bit_depth
}
