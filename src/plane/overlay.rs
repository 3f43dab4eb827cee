//! The simple RGBA overlay window.
//!
//! Backed by a secondary framebuffer device of the display controller.
//! Geometry travels through put-var-screeninfo with the controller's packed
//! position bits, buffer flips through pan-display. The ring is two slots
//! inside the kernel-reserved window memory, mapped once at open time; there
//! is no per-frame allocation on this path.

use tracing::debug;

use super::{
    clipped_window, OverlayWindow, PlaneKind, PlaneStatus, RingMemory, WindowGeometry, WindowState,
};
use crate::hal::{Layer, PixelFormat};
use crate::sys::fb::{
    round_up_to_page_size, FbDevice, FixScreeninfo, VarScreeninfo, FB_ACTIVATE_FORCE, FB_ACTIVATE_MASK,
    FB_ACTIVATE_NOW,
};
use crate::utils::Size;
use crate::Error;

/// Ring slots of a window; the controller reserves memory for exactly two.
const NUM_WINDOW_BUFFERS: usize = 2;

/// Window position is packed into `nonstd`: x in bits 10.., y in bits 0..10,
/// bit 31 enables the window.
const WINDOW_ENABLE: u32 = 1 << 31;

/// Device access needed by the overlay window protocol.
pub trait WindowBackend: Send {
    /// Read the variable screen info.
    fn var_screeninfo(&self) -> Result<VarScreeninfo, Error>;
    /// Apply a variable screen info.
    fn put_var_screeninfo(&mut self, info: &VarScreeninfo) -> Result<(), Error>;
    /// Pan to the offsets in `info`.
    fn pan_display(&mut self, info: &VarScreeninfo) -> Result<(), Error>;
    /// Read the fixed screen info.
    fn fix_screeninfo(&self) -> Result<FixScreeninfo, Error>;
    /// Map `len` bytes of the window memory.
    fn map(&mut self, len: usize) -> Result<Box<dyn RingMemory>, Error>;
}

impl WindowBackend for FbDevice {
    fn var_screeninfo(&self) -> Result<VarScreeninfo, Error> {
        FbDevice::var_screeninfo(self)
    }

    fn put_var_screeninfo(&mut self, info: &VarScreeninfo) -> Result<(), Error> {
        FbDevice::put_var_screeninfo(self, info)
    }

    fn pan_display(&mut self, info: &VarScreeninfo) -> Result<(), Error> {
        FbDevice::pan_display(self, info)
    }

    fn fix_screeninfo(&self) -> Result<FixScreeninfo, Error> {
        FbDevice::fix_screeninfo(self)
    }

    fn map(&mut self, len: usize) -> Result<Box<dyn RingMemory>, Error> {
        Ok(Box::new(FbDevice::map(self, len)?))
    }
}

/// A simple RGBA overlay plane.
pub struct OverlayPlane<B: WindowBackend> {
    backend: B,
    state: WindowState,
    panel: Size,
    var_info: VarScreeninfo,
    ring: Box<dyn RingMemory>,
    slot_size: usize,
    line_length: usize,
    buf_index: usize,
    transp_offset: u32,
}

impl<B: WindowBackend> std::fmt::Debug for OverlayPlane<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayPlane")
            .field("geometry", &self.state.geometry)
            .field("status", &self.state.status)
            .field("buf_index", &self.buf_index)
            .finish()
    }
}

impl<B: WindowBackend> OverlayPlane<B> {
    /// Open an overlay plane over `backend` for a panel of the given size.
    ///
    /// Verifies the device grants the two-slot ring, maps the reserved
    /// window memory once, and hides the window.
    pub fn new(backend: B, panel: Size) -> Result<Self, Error> {
        let mut backend = backend;

        let mut var_info = backend.var_screeninfo()?;
        var_info.yres_virtual = var_info.yres * NUM_WINDOW_BUFFERS as u32;
        // MAX for RGBA8888
        var_info.bits_per_pixel = 32;
        var_info.activate = (var_info.activate & !FB_ACTIVATE_MASK) | FB_ACTIVATE_NOW | FB_ACTIVATE_FORCE;
        backend.put_var_screeninfo(&var_info)?;

        // The fixed info may change once the virtual resolution is applied.
        let fix_info = backend.fix_screeninfo()?;
        if fix_info.smem_start == 0 {
            return Err(Error::Access {
                errmsg: "Window has no reserved memory",
                dev: None,
                source: std::io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }

        let line_length = fix_info.line_length as usize;
        let slot_size = line_length * var_info.yres as usize;
        let ring = backend.map(round_up_to_page_size(slot_size * NUM_WINDOW_BUFFERS))?;

        let mut plane = OverlayPlane {
            backend,
            state: WindowState::default(),
            panel,
            var_info,
            ring,
            slot_size,
            line_length,
            buf_index: NUM_WINDOW_BUFFERS - 1,
            transp_offset: 24,
        };
        plane.hide()?;

        Ok(plane)
    }

    /// Program the window geometry into the device.
    fn program_geometry(&mut self, bits_per_pixel: u32) -> Result<(), Error> {
        let geometry = self.state.geometry;

        self.var_info.xres = geometry.w;
        self.var_info.yres = geometry.h;
        self.var_info.bits_per_pixel = bits_per_pixel;
        self.var_info.activate =
            (self.var_info.activate & !FB_ACTIVATE_MASK) | FB_ACTIVATE_NOW | FB_ACTIVATE_FORCE;
        self.var_info.nonstd = (geometry.x << 10 | geometry.y) | WINDOW_ENABLE;
        self.var_info.accel_flags = (self.transp_offset != 0) as u32;

        self.backend.put_var_screeninfo(&self.var_info)?;
        self.state.dirty = false;

        debug!(
            x = geometry.x,
            y = geometry.y,
            w = geometry.w,
            h = geometry.h,
            "programmed overlay window"
        );
        Ok(())
    }

    /// Copy the layer's visible content into the current ring slot.
    fn copy_source(&mut self, layer: &Layer) -> Result<(), Error> {
        let handle = layer.handle.as_ref().ok_or(Error::NoBuffer)?;
        let bpp = handle
            .format()
            .bytes_per_pixel()
            .ok_or(Error::UnsupportedFormat(handle.format(), PlaneKind::Rgba))?;
        let stride = handle.stride() as usize;
        let src = handle.bytes();

        let frame = layer.display_frame;
        let crop = layer.source_crop;
        let crop_offset = (crop.top.max(0) as usize * stride + crop.left.max(0) as usize) * bpp;

        let slot_base = self.buf_index * self.slot_size;
        let slot = &mut self.ring.bytes_mut()[slot_base..slot_base + self.slot_size];

        for rect in &layer.visible_region {
            let rect = rect.clamp_to_panel(self.panel);
            if rect.is_empty() {
                continue;
            }

            let w = rect.width() as usize;
            let h = rect.height() as usize;
            let rel = ((rect.top - frame.top).max(0) as usize * stride
                + (rect.left - frame.left).max(0) as usize)
                * bpp;
            let src_start = crop_offset + rel;

            let (copy_len, rows, src_step) = if w == stride {
                // Source rows are contiguous, one block covers the rect.
                (w * bpp * h, 1, 0)
            } else {
                (w * bpp, h, stride * bpp)
            };

            let mut src_pos = src_start;
            let mut dst_pos = 0usize;
            for _ in 0..rows {
                if src_pos + copy_len > src.len() || dst_pos + copy_len > slot.len() {
                    break;
                }
                slot[dst_pos..dst_pos + copy_len].copy_from_slice(&src[src_pos..src_pos + copy_len]);
                src_pos += src_step;
                dst_pos += copy_len;
            }
        }

        Ok(())
    }

    /// Pan the device to the current ring slot.
    fn pan_to_slot(&mut self) -> Result<(), Error> {
        self.var_info.yoffset = ((self.slot_size / self.line_length) * self.buf_index) as u32;
        self.backend.pan_display(&self.var_info)
    }

    /// Hide the window: the driver clears position and extent when `nonstd`
    /// is zero.
    fn hide(&mut self) -> Result<(), Error> {
        self.var_info.nonstd = 0;
        self.var_info.activate =
            (self.var_info.activate & !FB_ACTIVATE_MASK) | FB_ACTIVATE_NOW | FB_ACTIVATE_FORCE;
        self.backend.put_var_screeninfo(&self.var_info)
    }
}

impl<B: WindowBackend> OverlayWindow for OverlayPlane<B> {
    fn kind(&self) -> PlaneKind {
        PlaneKind::Rgba
    }

    fn status(&self) -> PlaneStatus {
        self.state.status
    }

    fn set_status(&mut self, status: PlaneStatus) {
        self.state.status = status;
    }

    fn layer_index(&self) -> Option<usize> {
        self.state.layer_index
    }

    fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    fn geometry(&self) -> WindowGeometry {
        self.state.geometry
    }

    fn prepare(&mut self, layer: &Layer, layer_index: usize) -> Result<(), Error> {
        let handle = layer.handle.as_ref().ok_or(Error::NoBuffer)?;
        let visible = layer.visible_rect().unwrap_or(layer.display_frame);
        let (x, y, w, h) = clipped_window(visible, self.panel);

        self.state.update_geometry(WindowGeometry {
            x,
            y,
            w,
            h,
            format: Some(handle.format()),
        });

        match handle.format() {
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888 | PixelFormat::Rgbx8888 => {
                // A[31:24]
                self.transp_offset = 24;
            }
            _ => {}
        }

        self.state.reserve(layer_index);
        Ok(())
    }

    fn display(&mut self, layer: &mut Layer) -> Result<(), Error> {
        let bits_per_pixel = layer
            .handle
            .as_ref()
            .ok_or(Error::NoBuffer)?
            .bits_per_pixel();

        // Geometry changes must reach the device before the pixel data so
        // the DMA engine reads from the new rectangle.
        if self.state.dirty {
            self.program_geometry(bits_per_pixel)?;
        }

        self.buf_index = (self.buf_index + 1) % NUM_WINDOW_BUFFERS;
        self.copy_source(layer)?;
        self.pan_to_slot()
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.state.clear();
        self.hide()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::gralloc::GrallocBuffer;
    use crate::utils::Rect;

    #[derive(Default)]
    pub(crate) struct CallLog {
        pub puts: Vec<VarScreeninfo>,
        pub pans: Vec<u32>,
    }

    #[derive(Default, Clone)]
    pub(crate) struct Calls(pub Arc<Mutex<CallLog>>);

    pub(crate) struct FakeWindow {
        calls: Calls,
        var: VarScreeninfo,
        fix: FixScreeninfo,
    }

    impl FakeWindow {
        pub(crate) fn new(calls: Calls) -> Self {
            let var = VarScreeninfo {
                xres: 320,
                yres: 240,
                xres_virtual: 320,
                yres_virtual: 240,
                bits_per_pixel: 32,
                ..Default::default()
            };
            let fix = FixScreeninfo {
                smem_start: 0x3000_0000,
                line_length: 320 * 4,
                ..Default::default()
            };
            FakeWindow { calls, var, fix }
        }
    }

    impl WindowBackend for FakeWindow {
        fn var_screeninfo(&self) -> Result<VarScreeninfo, Error> {
            Ok(self.var)
        }

        fn put_var_screeninfo(&mut self, info: &VarScreeninfo) -> Result<(), Error> {
            self.calls.0.lock().unwrap().puts.push(*info);
            self.var = *info;
            Ok(())
        }

        fn pan_display(&mut self, info: &VarScreeninfo) -> Result<(), Error> {
            self.calls.0.lock().unwrap().pans.push(info.yoffset);
            Ok(())
        }

        fn fix_screeninfo(&self) -> Result<FixScreeninfo, Error> {
            Ok(self.fix)
        }

        fn map(&mut self, len: usize) -> Result<Box<dyn RingMemory>, Error> {
            Ok(Box::new(vec![0u8; len]))
        }
    }

    fn rgba_layer(x: i32, y: i32, w: i32, h: i32) -> Layer {
        let handle = Arc::new(GrallocBuffer::zeroed(w, h, w, crate::hal::PixelFormat::Rgba8888));
        Layer::new(handle, Rect::from_extent(x, y, w, h))
    }

    fn plane_with_log() -> (OverlayPlane<FakeWindow>, Calls) {
        let calls = Calls::default();
        let plane = OverlayPlane::new(FakeWindow::new(calls.clone()), Size::new(320, 240)).unwrap();
        (plane, calls)
    }

    #[test]
    fn unchanged_geometry_is_not_reprogrammed() {
        let (mut plane, calls) = plane_with_log();
        let mut layer = rgba_layer(10, 10, 64, 64);

        plane.prepare(&layer, 0).unwrap();
        assert!(plane.is_dirty());
        plane.display(&mut layer).unwrap();

        let puts_after_first = calls.0.lock().unwrap().puts.len();

        plane.prepare(&layer, 0).unwrap();
        assert!(!plane.is_dirty());
        plane.display(&mut layer).unwrap();

        // Only the pan moved; no geometry ioctl was issued the second time.
        assert_eq!(calls.0.lock().unwrap().puts.len(), puts_after_first);
        assert_eq!(calls.0.lock().unwrap().pans.len(), 2);
    }

    #[test]
    fn pan_alternates_between_ring_slots() {
        let (mut plane, calls) = plane_with_log();
        let mut layer = rgba_layer(0, 0, 64, 64);

        plane.prepare(&layer, 0).unwrap();
        plane.display(&mut layer).unwrap();
        plane.display(&mut layer).unwrap();
        plane.display(&mut layer).unwrap();

        assert_eq!(calls.0.lock().unwrap().pans.as_slice(), &[0, 240, 0]);
    }

    #[test]
    fn geometry_is_clipped_and_packed() {
        let (mut plane, calls) = plane_with_log();
        let mut layer = rgba_layer(10, 10, 64, 64);

        plane.prepare(&layer, 3).unwrap();
        assert_eq!(
            plane.geometry(),
            WindowGeometry {
                x: 10,
                y: 10,
                w: 64,
                h: 64,
                format: Some(crate::hal::PixelFormat::Rgba8888),
            }
        );
        assert_eq!(plane.layer_index(), Some(3));
        assert_eq!(plane.status(), PlaneStatus::Reserved);

        plane.display(&mut layer).unwrap();
        let log = calls.0.lock().unwrap();
        let programmed = log.puts.last().unwrap();
        assert_eq!(programmed.nonstd, (10 << 10 | 10) | WINDOW_ENABLE);
        assert_eq!(programmed.xres, 64);
        assert_eq!(programmed.yres, 64);
    }

    #[test]
    fn copy_lands_in_the_current_slot() {
        let (mut plane, _calls) = plane_with_log();
        let handle = Arc::new(GrallocBuffer::from_bytes(
            4,
            2,
            4,
            crate::hal::PixelFormat::Rgba8888,
            vec![0xAB; 4 * 2 * 4],
        ));
        let mut layer = Layer::new(handle, Rect::from_extent(0, 0, 4, 2));

        plane.prepare(&layer, 0).unwrap();
        plane.display(&mut layer).unwrap();

        // First display lands in slot 0.
        assert_eq!(&plane.ring.bytes()[..4 * 2 * 4], &[0xAB; 4 * 2 * 4][..]);
    }
}
