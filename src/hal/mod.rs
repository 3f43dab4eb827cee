//! Host compositor data model.
//!
//! The host runtime hands the composer one [`DisplayContents`] per display
//! and frame. Each [`Layer`] carries the source buffer and geometry chosen
//! by the host; the composer answers by tagging every layer's
//! [`CompositionType`] during `prepare` and filling in the release fences
//! during `set`. Field semantics (composition types, transform bits,
//! blending modes, the 0/negative-errno return convention) follow the host
//! contract and are not design choices of this crate.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::gralloc::GrallocBuffer;
use crate::sync::SyncFence;
use crate::utils::Rect;

mod device;
pub use device::{HwcDevice, SwapResult};

bitflags::bitflags! {
    /// Per-layer flags set by the host.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct LayerFlags: u32 {
        /// The host asks for this layer to be ignored by plane assignment
        const SKIP = 1;
    }
}

bitflags::bitflags! {
    /// Layer transform, host bit layout: flips compose with a 90° rotation.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Transform: u32 {
        /// Horizontal mirror
        const FLIP_H = 1;
        /// Vertical mirror
        const FLIP_V = 2;
        /// Rotate by 90° clockwise
        const ROT_90 = 4;
    }
}

impl Transform {
    /// Whether this transform swaps the axes of the destination frame.
    pub fn swaps_axes(&self) -> bool {
        self.contains(Transform::ROT_90)
    }

    /// The identity transform.
    pub fn is_identity(&self) -> bool {
        self.is_empty()
    }
}

/// Blending mode requested for a layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Blending {
    /// Source pixels replace destination pixels
    #[default]
    None,
    /// Source alpha is premultiplied into the color channels
    Premultiplied,
    /// Source alpha is applied at blend time
    Coverage,
}

/// Pixel formats understood by the composer.
///
/// The RGBA family is eligible for the simple overlay windows, the YUV
/// formats for the video overlay. Everything else a gralloc buffer may carry
/// is composited by the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit RGBA, 8 bits per channel
    Rgba8888,
    /// 32-bit RGBX, alpha ignored
    Rgbx8888,
    /// 32-bit BGRA, 8 bits per channel
    Bgra8888,
    /// 24-bit RGB
    Rgb888,
    /// 16-bit RGB 5:6:5
    Rgb565,
    /// Planar YCrCb 4:2:0 (three planes, 2×2 subsampled chroma)
    Yv12,
    /// Interleaved YCbCr 4:2:2 (YUYV)
    Ycbcr422I,
}

impl PixelFormat {
    /// Bits per pixel as stored in a gralloc descriptor.
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => 32,
            PixelFormat::Rgb888 => 24,
            PixelFormat::Rgb565 | PixelFormat::Ycbcr422I => 16,
            PixelFormat::Yv12 => 12,
        }
    }

    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => Some(4),
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Rgb565 | PixelFormat::Ycbcr422I => Some(2),
            PixelFormat::Yv12 => None,
        }
    }

    /// Size in bytes of a buffer with the given stride (in pixels) and
    /// height.
    pub fn buffer_size(&self, stride: i32, height: i32) -> usize {
        let (stride, height) = (stride as usize, height as usize);
        match self {
            PixelFormat::Yv12 => stride * height * 3 / 2,
            _ => stride * height * self.bytes_per_pixel().unwrap_or(0),
        }
    }
}

/// How one layer ends up on screen, decided during `prepare`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CompositionType {
    /// Composited by the GPU into the framebuffer target
    #[default]
    Framebuffer,
    /// Driven directly by a hardware overlay plane
    Overlay,
    /// Driven by the hardware cursor plane
    CursorOverlay,
    /// The GPU-rendered output of all framebuffer layers; owned by the host
    FramebufferTarget,
    /// A host-provided solid-color background layer
    Background,
}

/// One composition layer of a frame.
#[derive(Debug, Clone)]
pub struct Layer {
    /// The source buffer, produced by gralloc; `None` marks a layer that
    /// cannot be composited by hardware
    pub handle: Option<Arc<GrallocBuffer>>,
    /// Output field: how the composer decided to place this layer
    pub composition: CompositionType,
    /// Host flags
    pub flags: LayerFlags,
    /// Requested transform
    pub transform: Transform,
    /// Requested blending
    pub blending: Blending,
    /// Portion of the source buffer to present
    pub source_crop: Rect,
    /// Destination rectangle on screen
    pub display_frame: Rect,
    /// Visible portion of the destination, one or more rectangles
    pub visible_region: SmallVec<[Rect; 1]>,
    /// Fence to wait on before reading the source buffer
    pub acquire_fence: Option<SyncFence>,
    /// Output field: signaled when the source buffer may be reused
    pub release_fence: Option<SyncFence>,
}

impl Layer {
    /// A layer presenting the whole of `handle` at `frame`, visible in full.
    pub fn new(handle: Arc<GrallocBuffer>, frame: Rect) -> Self {
        let source_crop = Rect::new(0, 0, handle.width(), handle.height());
        Layer {
            handle: Some(handle),
            composition: CompositionType::Framebuffer,
            flags: LayerFlags::empty(),
            transform: Transform::empty(),
            blending: Blending::None,
            source_crop,
            display_frame: frame,
            visible_region: SmallVec::from_elem(frame, 1),
            acquire_fence: None,
            release_fence: None,
        }
    }

    /// Pixel format of the backing buffer, if any.
    pub fn format(&self) -> Option<PixelFormat> {
        self.handle.as_ref().map(|h| h.format())
    }

    /// The single visible rectangle, when the visible region is contiguous.
    pub fn visible_rect(&self) -> Option<Rect> {
        (self.visible_region.len() == 1).then(|| self.visible_region[0])
    }
}

/// The per-frame layer list for one display.
#[derive(Debug, Default)]
pub struct DisplayContents {
    /// Layers in stacking order, bottom first
    pub layers: Vec<Layer>,
    /// Output field: signaled when this frame has been retired from the
    /// screen (KMS variant)
    pub retire_fence: Option<SyncFence>,
}

impl DisplayContents {
    /// Build contents from a plain layer list.
    pub fn new(layers: Vec<Layer>) -> Self {
        DisplayContents {
            layers,
            retire_fence: None,
        }
    }

    /// Number of layers tagged for GPU composition.
    pub fn framebuffer_layers(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| l.composition == CompositionType::Framebuffer)
            .count()
    }
}

/// Events the host can toggle through `event_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwcEvent {
    /// Periodic vsync callbacks
    Vsync,
}

/// Host queries answered by `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// Whether a background layer is supported (it is not)
    BackgroundLayerSupported,
    /// Vsync period in nanoseconds
    VsyncPeriod,
    /// Bitmask of connected display types
    DisplayTypesSupported,
}

/// Static attributes of a display configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayAttributes {
    /// Panel width in pixels
    pub width: i32,
    /// Panel height in pixels
    pub height: i32,
    /// Vsync period in nanoseconds
    pub vsync_period_ns: i32,
    /// Horizontal density in dots per 1000 inches, 0 when unknown
    pub dpi_x: i32,
    /// Vertical density in dots per 1000 inches, 0 when unknown
    pub dpi_y: i32,
}

/// Callbacks registered by the host through `register_procs`.
pub trait HostProcs: Send + Sync {
    /// A vsync happened on `display` at `timestamp_ns`.
    fn vsync(&self, display: usize, timestamp_ns: i64);

    /// The composer asks the host to re-render the frame.
    fn invalidate(&self) {}
}
