//! The composer device: the host-facing callback surface.
//!
//! [`HwcDevice::open`] enumerates the display controller's overlay
//! resources once (secondary framebuffer devices for RGBA windows, V4L2
//! output devices for the video overlay), sizes them against the panel, and
//! starts the vsync monitor. The host then drives one
//! [`prepare`](HwcDevice::prepare)/[`set`](HwcDevice::set) pair per frame
//! until the device is dropped at HAL close.
//!
//! Only open-time errors propagate to the host (negative errno via
//! [`Error::errno`]); everything per-frame is absorbed by the composer's
//! framebuffer fallback.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustix::fs::{open, Mode, OFlags};
use tracing::{debug, info, info_span, warn};

use super::{DisplayAttributes, DisplayContents, HostProcs, HwcEvent, Query};
use crate::composer::Composer;
use crate::config::HwcConfig;
use crate::plane::{HeoPlane, OverlayPlane, OverlayWindow};
use crate::sys::fb::FbDevice;
use crate::sys::v4l2::VideoOutputDevice;
use crate::utils::Size;
use crate::vsync::{ProcsSlot, VsyncMonitor};
use crate::Error;

/// Base panel device; overlay windows are the higher-numbered nodes.
const BASE_FB_PATHS: &[&str] = &["/dev/graphics/fb0", "/dev/fb0"];
const VSYNC_ATTR_PATH: &str = "/sys/class/graphics/fb0/device/vsync";
const VIDEO_SYSFS_DIR: &str = "/sys/class/video4linux";

/// Identification string of the controller's overlay framebuffer nodes.
const OVERLAY_FB_ID: &str = "atmel_hlcdfb_ovl";
/// Card name of the video overlay V4L2 device.
const HEO_CARD_NAME: &str = "Atmel HEO Layer";

const VSYNC_PERIOD_NS: i32 = 1_000_000_000 / 60;

/// Outcome of the host's framebuffer swap hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapResult {
    /// The GPU-rendered framebuffer was presented
    Complete,
    /// The swap failed; the frame is reported as an error to the host
    Failed,
}

/// The hardware composer device.
pub struct HwcDevice {
    composer: Composer,
    base: Option<FbDevice>,
    vsync: Option<VsyncMonitor>,
    vsync_enabled: Arc<AtomicBool>,
    procs: ProcsSlot,
}

impl std::fmt::Debug for HwcDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwcDevice")
            .field("composer", &self.composer)
            .field("vsync", &self.vsync)
            .finish()
    }
}

impl HwcDevice {
    /// Open the composer device: probe the panel, enumerate overlay
    /// resources and start the vsync monitor.
    pub fn open(config: HwcConfig) -> Result<Self, Error> {
        let span = info_span!("hwc_open");
        let _guard = span.enter();

        let base = open_base_fb()?;
        let var = base.var_screeninfo()?;
        let panel = Size::new(var.xres as i32, var.yres as i32);
        info!(w = panel.w, h = panel.h, "panel probed");

        let planes = discover_planes(&config, panel);
        if planes.is_empty() {
            // Not fatal: the GPU framebuffer path composites everything.
            warn!("no overlay planes available, GPU composition only");
        }

        let procs: ProcsSlot = Arc::new(Mutex::new(None));
        let vsync_enabled = Arc::new(AtomicBool::new(false));
        let vsync_fd = open(VSYNC_ATTR_PATH, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
            .map_err(|err| Error::DeviceOpen {
                path: PathBuf::from(VSYNC_ATTR_PATH),
                source: err.into(),
            })?;
        let vsync = VsyncMonitor::start(vsync_fd, procs.clone(), vsync_enabled.clone())?;

        Ok(HwcDevice {
            composer: Composer::new(config, panel, planes),
            base: Some(base),
            vsync: Some(vsync),
            vsync_enabled,
            procs,
        })
    }

    /// Build a device over an externally assembled plane pool.
    ///
    /// No device nodes are touched and no vsync monitor runs; intended for
    /// driving the composer against fake backends.
    pub fn with_planes(config: HwcConfig, panel: Size, planes: Vec<Box<dyn OverlayWindow>>) -> Self {
        HwcDevice {
            composer: Composer::new(config, panel, planes),
            base: None,
            vsync: None,
            vsync_enabled: Arc::new(AtomicBool::new(false)),
            procs: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the host callbacks.
    pub fn register_procs(&self, procs: Arc<dyn HostProcs>) {
        *self.procs.lock().unwrap() = Some(procs);
    }

    /// Decide the composition strategy for one frame.
    pub fn prepare(&mut self, contents: &mut DisplayContents) -> Result<(), Error> {
        self.composer.prepare(contents);
        Ok(())
    }

    /// Commit one frame. `None` contents means the screen is turning off.
    ///
    /// `swap_buffers` is invoked when at least one layer was composited by
    /// the GPU and the framebuffer target must be presented.
    pub fn set<F>(&mut self, contents: Option<&mut DisplayContents>, swap_buffers: F) -> Result<(), Error>
    where
        F: FnOnce() -> SwapResult,
    {
        let Some(contents) = contents else {
            self.composer.reset_all();
            return Ok(());
        };

        let needs_swap = self.composer.set(contents);
        if needs_swap && swap_buffers() == SwapResult::Failed {
            return Err(Error::SwapFailed);
        }
        Ok(())
    }

    /// Enable or disable an event. Only vsync is toggleable.
    pub fn event_control(&mut self, event: HwcEvent, enabled: bool) -> Result<(), Error> {
        match event {
            HwcEvent::Vsync => {
                self.vsync_enabled.store(enabled, Ordering::Relaxed);
                if let Some(base) = &self.base {
                    base.set_vsync_interrupt(enabled)?;
                }
                debug!(enabled, "vsync delivery toggled");
                Ok(())
            }
        }
    }

    /// Blank or unblank the panel.
    pub fn blank(&mut self, blank: bool) -> Result<(), Error> {
        match &self.base {
            Some(base) => base.blank(blank),
            None => Ok(()),
        }
    }

    /// The available display configurations (a single fixed mode).
    pub fn display_configs(&self) -> Vec<u32> {
        vec![0]
    }

    /// Static attributes of a display configuration.
    pub fn display_attributes(&self, config: u32) -> Result<DisplayAttributes, Error> {
        if config != 0 {
            return Err(Error::Invalid("unknown display config"));
        }

        let panel = self.composer.panel();
        let (dpi_x, dpi_y) = match &self.base {
            Some(base) => {
                let var = base.var_screeninfo()?;
                (density(var.xres, var.width), density(var.yres, var.height))
            }
            None => (0, 0),
        };
        Ok(DisplayAttributes {
            width: panel.w,
            height: panel.h,
            vsync_period_ns: VSYNC_PERIOD_NS,
            dpi_x,
            dpi_y,
        })
    }

    /// Answer a host query.
    pub fn query(&self, what: Query) -> Result<i32, Error> {
        match what {
            Query::BackgroundLayerSupported => Ok(0),
            Query::VsyncPeriod => Ok(VSYNC_PERIOD_NS),
            // Primary display only on this path.
            Query::DisplayTypesSupported => Ok(1),
        }
    }

    /// Describe the plane pool for the host's dumpsys.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let panel = self.composer.panel();
        let _ = writeln!(out, "panel: {}x{}", panel.w, panel.h);
        for (i, plane) in self.composer.planes().iter().enumerate() {
            let g = plane.geometry();
            let _ = writeln!(
                out,
                "plane {i}: {:?} {:?} rect=({},{} {}x{})",
                plane.kind(),
                plane.status(),
                g.x,
                g.y,
                g.w,
                g.h
            );
        }
        out
    }

    /// The composer, for inspection.
    pub fn composer(&self) -> &Composer {
        &self.composer
    }
}

impl Drop for HwcDevice {
    fn drop(&mut self) {
        // Stop vsync delivery, then the monitor thread.
        self.vsync_enabled.store(false, Ordering::Relaxed);
        self.vsync.take();
        self.composer.reset_all();
    }
}

fn open_base_fb() -> Result<FbDevice, Error> {
    let mut last_err = Error::NoDisplay;
    for path in BASE_FB_PATHS {
        match FbDevice::open(path) {
            Ok(device) => return Ok(device),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// Enumerate the overlay resources: higher-numbered framebuffer nodes that
/// identify as controller overlay windows, then V4L2 nodes whose card name
/// marks the video overlay. Pool sizes are capped by configuration.
fn discover_planes(config: &HwcConfig, panel: Size) -> Vec<Box<dyn OverlayWindow>> {
    let mut planes: Vec<Box<dyn OverlayWindow>> = Vec::new();

    let fb_dir = Path::new(BASE_FB_PATHS[0]).parent().unwrap_or(Path::new("/dev"));
    let mut windows = 0usize;
    for index in 1.. {
        if windows >= config.max_overlay_windows {
            break;
        }
        let path = fb_dir.join(format!("fb{index}"));
        let device = match FbDevice::open(&path) {
            Ok(device) => device,
            Err(_) => break,
        };
        match device.fix_screeninfo() {
            Ok(fix) if fix.id_str() == OVERLAY_FB_ID => {}
            _ => {
                debug!(?path, "not an overlay window, skipping");
                continue;
            }
        }
        match OverlayPlane::new(device, panel) {
            Ok(plane) => {
                info!(?path, "overlay window attached");
                planes.push(Box::new(plane));
                windows += 1;
            }
            Err(err) => warn!(?path, "overlay window rejected: {err}"),
        }
    }

    let mut video_windows = 0usize;
    if let Ok(entries) = std::fs::read_dir(VIDEO_SYSFS_DIR) {
        for entry in entries.flatten() {
            if video_windows >= config.max_video_windows {
                break;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("video") {
                continue;
            }
            let path = PathBuf::from("/dev").join(name);
            let device = match VideoOutputDevice::open(&path) {
                Ok(device) => device,
                Err(_) => continue,
            };
            match device.querycap() {
                Ok(cap) if cap.card_str() == HEO_CARD_NAME => {}
                _ => {
                    debug!(?path, "not a video overlay, skipping");
                    continue;
                }
            }
            info!(?path, "video overlay attached");
            planes.push(Box::new(HeoPlane::new(device, panel)));
            video_windows += 1;
        }
    }

    planes
}

fn density(resolution: u32, millimeters: u32) -> i32 {
    if millimeters == 0 {
        return 0;
    }
    (resolution * 25400 / millimeters) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_math() {
        // 320 px over 50.8 mm is 160 dpi, reported in dots per 1000 inches.
        assert_eq!(density(320, 51), 159_372);
        assert_eq!(density(320, 0), 0);
    }
}
