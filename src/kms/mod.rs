//! The DRM/KMS display-commit variant.
//!
//! Instead of copying pixels into controller-owned windows, this variant
//! imports the gralloc dma-bufs as DRM framebuffers and hands them straight
//! to KMS planes: the framebuffer target drives the CRTC, eligible layers
//! are matched against the card's overlay planes by pixel format, and small
//! top-most layers ride the hardware cursor. Release and retire fences are
//! software timelines advanced by the vblank handler (see [`frame`]), so the
//! commit path never blocks on buffer reclamation.
//!
//! Connector selection follows the configured connector names; an unset
//! primary takes the card's first connector, an unset external display stays
//! off.

use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, Mode as TriggerMode, PostAction};
use drm::control::{connector, crtc, plane, Device as ControlDevice, Event, FbCmd2Flags, Mode};
use drm::buffer::{Buffer as DrmBuffer, PlanarBuffer};
use drm::{Device as BasicDevice, DriverCapability, VblankWaitFlags, VblankWaitTarget};
use drm_fourcc::DrmFourcc;
use rustix::fs::{open, Mode as FsMode, OFlags};
use tracing::{debug, error, info, trace, warn};

use crate::config::HwcConfig;
use crate::gralloc::GrallocBuffer;
use crate::hal::{
    CompositionType, DisplayAttributes, DisplayContents, HostProcs, HwcEvent, LayerFlags, PixelFormat,
    Query,
};
use crate::vsync::ProcsSlot;
use crate::Error;

pub mod frame;

use frame::{FbInfo, ScanoutState};

/// An open DRM card, cheaply cloneable for the event thread.
#[derive(Debug, Clone)]
pub struct KmsDeviceFd(Arc<OwnedFd>);

impl AsFd for KmsDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for KmsDeviceFd {}
impl ControlDevice for KmsDeviceFd {}

/// How long `set` waits for the previous frame's vblank before committing
/// over it anyway.
const PENDING_FRAME_WAIT: Duration = Duration::from_millis(20);

fn access(errmsg: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::Access {
        errmsg,
        dev: None,
        source,
    }
}

/// Map a gralloc pixel format onto the DRM format the display controller
/// scans out.
fn drm_fourcc(format: PixelFormat) -> Option<DrmFourcc> {
    match format {
        PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => Some(DrmFourcc::Argb8888),
        PixelFormat::Rgbx8888 => Some(DrmFourcc::Xrgb8888),
        PixelFormat::Rgb888 => Some(DrmFourcc::Rgb888),
        PixelFormat::Rgb565 => Some(DrmFourcc::Rgb565),
        // The controller consumes 4:2:0 video as NV12.
        PixelFormat::Yv12 => Some(DrmFourcc::Nv12),
        PixelFormat::Ycbcr422I => Some(DrmFourcc::Yuyv),
    }
}

fn interface_from_name(name: &str) -> Option<connector::Interface> {
    use connector::Interface;

    let known: &[(&str, Interface)] = &[
        ("Unknown", Interface::Unknown),
        ("VGA", Interface::VGA),
        ("DVII", Interface::DVII),
        ("DVID", Interface::DVID),
        ("DVIA", Interface::DVIA),
        ("Composite", Interface::Composite),
        ("SVIDEO", Interface::SVideo),
        ("LVDS", Interface::LVDS),
        ("Component", Interface::Component),
        ("9PinDIN", Interface::NinePinDIN),
        ("DisplayPort", Interface::DisplayPort),
        ("HDMIA", Interface::HDMIA),
        ("HDMIB", Interface::HDMIB),
        ("TV", Interface::TV),
        ("eDP", Interface::EmbeddedDisplayPort),
        ("DSI", Interface::DSI),
        ("DPI", Interface::DPI),
    ];

    for (n, interface) in known {
        if n.eq_ignore_ascii_case(name) {
            return Some(*interface);
        }
    }
    // Accept the bare "HDMI" shorthand.
    if name.eq_ignore_ascii_case("hdmi") {
        return Some(connector::Interface::HDMIA);
    }
    None
}

fn gem_handle(raw: u32) -> Option<drm::buffer::Handle> {
    NonZeroU32::new(raw).map(Into::into)
}

/// A prime-imported buffer carrying everything `addfb2` needs.
struct PrimeBuffer {
    size: (u32, u32),
    fourcc: DrmFourcc,
    pitches: [u32; 4],
    offsets: [u32; 4],
    handles: [Option<drm::buffer::Handle>; 4],
}

impl PlanarBuffer for PrimeBuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.fourcc
    }

    fn modifier(&self) -> Option<drm_fourcc::DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

/// A prime-imported cursor buffer.
struct PrimeCursor {
    size: (u32, u32),
    handle: drm::buffer::Handle,
}

impl DrmBuffer for PrimeCursor {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Argb8888
    }

    fn pitch(&self) -> u32 {
        self.size.0 * 4
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

/// One KMS plane usable by a display, with its supported formats.
#[derive(Debug)]
struct PlaneSlot {
    handle: plane::Handle,
    formats: Vec<u32>,
}

/// Everything per display: mode, scan-out state, plane pool.
#[derive(Debug)]
struct KmsDisplay {
    crtc: crtc::Handle,
    pipe: u32,
    connector: connector::Handle,
    connected: bool,
    mode: Mode,
    size_mm: (u32, u32),
    planes: Vec<PlaneSlot>,
    cursor_supported: bool,
    cursor_max: (u32, u32),
    state: ScanoutState,
    /// layer index → plane slot index, rebuilt every `prepare`
    assigned: Vec<(usize, usize)>,
    vsync_on: bool,
}

struct Shared {
    displays: Mutex<Vec<KmsDisplay>>,
    procs: ProcsSlot,
}

/// The DRM/KMS composer device.
pub struct KmsDevice {
    fd: KmsDeviceFd,
    config: HwcConfig,
    shared: Arc<Shared>,
    ping: calloop::ping::Ping,
    event_thread: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for KmsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsDevice").field("fd", &self.fd).finish()
    }
}

impl KmsDevice {
    /// Open the first usable DRM card and initialize the configured
    /// displays.
    pub fn open(config: HwcConfig) -> Result<Self, Error> {
        let fd = open_drm_node()?;

        let mut displays = Vec::new();

        let primary = init_display(&fd, 0, config.primary_connector.as_deref())?;
        info!(
            w = primary.mode.size().0,
            h = primary.mode.size().1,
            "primary display initialized"
        );
        displays.push(primary);

        if let Some(name) = config.external_connector.as_deref() {
            match init_display(&fd, 1, Some(name)) {
                Ok(display) => {
                    info!(connector = name, "external display initialized");
                    displays.push(display);
                }
                Err(err) => warn!(connector = name, "external display unavailable: {err}"),
            }
        }

        let shared = Arc::new(Shared {
            displays: Mutex::new(displays),
            procs: Arc::new(Mutex::new(None)),
        });

        let (ping, event_thread) = spawn_event_thread(fd.clone(), shared.clone())?;

        // Start the vblank request chain for every display.
        {
            let displays = shared.displays.lock().unwrap();
            for (index, display) in displays.iter().enumerate() {
                if let Err(err) = request_vblank(&fd, display.pipe, index) {
                    warn!(display = index, "failed to arm vblank: {err}");
                }
            }
        }

        Ok(KmsDevice {
            fd,
            config,
            shared,
            ping,
            event_thread: Some(event_thread),
        })
    }

    /// Register the host callbacks.
    pub fn register_procs(&self, procs: Arc<dyn HostProcs>) {
        *self.shared.procs.lock().unwrap() = Some(procs);
    }

    /// Number of initialized displays.
    pub fn num_displays(&self) -> usize {
        self.shared.displays.lock().unwrap().len()
    }

    /// Assign planes and cursor for one display's frame.
    pub fn prepare(&mut self, disp: usize, contents: &mut DisplayContents) -> Result<(), Error> {
        let mut displays = self.shared.displays.lock().unwrap();
        let Some(display) = displays.get_mut(disp) else {
            return Err(Error::Invalid("unknown display"));
        };
        if !display.connected {
            return Ok(());
        }

        display.assigned.clear();
        // Overlay planes stay with the primary display.
        let allow_planes = disp == 0;
        let mut used = vec![false; display.planes.len()];
        let mut target_framebuffer = false;
        let mut is_top = true;

        for index in (0..contents.layers.len()).rev() {
            let layer = &mut contents.layers[index];

            if layer.flags.contains(LayerFlags::SKIP) {
                continue;
            }
            if layer.composition == CompositionType::FramebufferTarget {
                continue;
            }

            if target_framebuffer {
                // Everything below a GPU-composited layer stays on the GPU
                // so the stacking order survives.
                layer.composition = CompositionType::Framebuffer;
                is_top = false;
                continue;
            }

            let frame = layer.display_frame;
            if display.cursor_supported
                && is_top
                && layer.handle.is_some()
                && (frame.width() as u32) < display.cursor_max.0.min(self.config.cursor_max as u32)
                && (frame.height() as u32) < display.cursor_max.1.min(self.config.cursor_max as u32)
            {
                layer.composition = CompositionType::CursorOverlay;
                is_top = false;
                continue;
            }

            let plane = layer
                .handle
                .as_ref()
                .filter(|_| allow_planes)
                .and_then(|handle| drm_fourcc(handle.format()))
                .and_then(|fourcc| {
                    display
                        .planes
                        .iter()
                        .enumerate()
                        .position(|(i, slot)| !used[i] && slot.formats.contains(&(fourcc as u32)))
                });

            match plane {
                Some(slot) => {
                    used[slot] = true;
                    display.assigned.push((index, slot));
                    layer.composition = CompositionType::Overlay;
                    is_top = false;
                }
                None => {
                    layer.composition = CompositionType::Framebuffer;
                    is_top = false;
                    target_framebuffer = true;
                }
            }
        }

        let overlays = display.assigned.len();
        trace!(
            display = disp,
            overlays = overlays,
            "prepared KMS frame"
        );
        Ok(())
    }

    /// Commit one display's frame to KMS.
    pub fn set(&mut self, disp: usize, contents: &mut DisplayContents) -> Result<(), Error> {
        // Give the previous frame a chance to hit its vblank first.
        {
            let displays = self.shared.displays.lock().unwrap();
            let Some(display) = displays.get(disp) else {
                return Err(Error::Invalid("unknown display"));
            };
            if display.state.frame_pending() {
                drop(displays);
                debug!("pending frame, waiting for completion");
                std::thread::sleep(PENDING_FRAME_WAIT);
                if self.shared.displays.lock().unwrap()[disp].state.frame_pending() {
                    warn!("frame still pending, committing anyway");
                }
            }
        }

        let mut displays = self.shared.displays.lock().unwrap();
        let display = &mut displays[disp];
        if !display.connected {
            return Ok(());
        }

        let timeout = Duration::from_millis(self.config.acquire_timeout_ms as u64);
        let mut used_planes = vec![false; display.planes.len()];
        let mut used_cursor = false;
        let mut zpos = 2u64;

        for index in 0..contents.layers.len() {
            let layer = &mut contents.layers[index];
            if !matches!(
                layer.composition,
                CompositionType::FramebufferTarget | CompositionType::Overlay | CompositionType::CursorOverlay
            ) {
                continue;
            }
            let Some(handle) = layer.handle.clone() else {
                continue;
            };

            if let Some(fence) = layer.acquire_fence.take() {
                if !fence.wait(timeout) {
                    warn!(index, "acquire fence timed out");
                }
            }

            match layer.composition {
                CompositionType::FramebufferTarget => {
                    let changed = !display.state.main().matches(handle.key());
                    let info = if changed {
                        match import_framebuffer(&self.fd, &handle) {
                            Ok(info) => info,
                            Err(err) => {
                                error!(index, "framebuffer import failed: {err}");
                                continue;
                            }
                        }
                    } else {
                        *display.state.main().current().unwrap_or(&FbInfo {
                            fb: None,
                            bo: 0,
                            key: handle.key(),
                        })
                    };

                    if let Err(err) = self.fd.set_crtc(
                        display.crtc,
                        info.fb,
                        (0, 0),
                        &[display.connector],
                        Some(display.mode),
                    ) {
                        error!("set_crtc failed: {err}");
                        release_import(&self.fd, changed.then_some(info));
                        continue;
                    }
                    trace!(changed, "crtc committed");

                    if changed {
                        display.state.main().record(Some(info));
                    }
                }
                CompositionType::Overlay => {
                    let Some(&(_, slot)) = display.assigned.iter().find(|(l, _)| *l == index) else {
                        warn!(index, "overlay layer without an assigned plane");
                        continue;
                    };
                    let plane = display.planes[slot].handle;

                    let changed = !display.state.plane_ref(slot).slot().matches(handle.key());
                    let info = if changed {
                        match import_framebuffer(&self.fd, &handle) {
                            Ok(info) => info,
                            Err(err) => {
                                error!(index, "overlay import failed: {err}");
                                continue;
                            }
                        }
                    } else {
                        match display.state.plane_ref(slot).slot().current() {
                            Some(current) => *current,
                            None => continue,
                        }
                    };

                    set_zpos(&self.fd, plane, zpos);
                    zpos += 1;

                    let frame = layer.display_frame;
                    let crop = layer.source_crop;
                    let dst = (
                        frame.left,
                        frame.top,
                        frame.width().max(0) as u32,
                        frame.height().max(0) as u32,
                    );
                    // Source coordinates are 16.16 fixed point.
                    let src = (
                        (crop.left as u32) << 16,
                        (crop.top as u32) << 16,
                        (crop.width().max(0) as u32) << 16,
                        (crop.height().max(0) as u32) << 16,
                    );

                    if let Err(err) = self.fd.set_plane(plane, display.crtc, info.fb, 0, dst, src) {
                        error!("set_plane failed: {err}");
                        release_import(&self.fd, changed.then_some(info));
                        continue;
                    }
                    used_planes[slot] = true;
                    trace!(slot, changed, "plane committed");

                    if layer.release_fence.is_none() {
                        layer.release_fence = Some(display.state.plane(slot).commit(info, changed));
                    }
                }
                CompositionType::CursorOverlay => {
                    let cursor_active = display
                        .state
                        .cursor()
                        .map(|c| c.slot().matches(handle.key()))
                        .unwrap_or(false);
                    let changed = !cursor_active;

                    let info = if changed {
                        let bo = match import_gem(&self.fd, &handle) {
                            Ok(bo) => bo,
                            Err(err) => {
                                error!(index, "cursor import failed: {err}");
                                continue;
                            }
                        };
                        let Some(gem) = gem_handle(bo) else { continue };
                        let cursor = PrimeCursor {
                            size: (handle.width() as u32, handle.height() as u32),
                            handle: gem,
                        };
                        if let Err(err) = self.fd.set_cursor(display.crtc, Some(&cursor)) {
                            error!("set_cursor failed: {err}");
                            let _ = drm_ffi::gem::close(self.fd.as_fd(), bo);
                            continue;
                        }
                        FbInfo {
                            fb: None,
                            bo,
                            key: handle.key(),
                        }
                    } else {
                        match display.state.cursor().and_then(|c| c.slot().current().copied()) {
                            Some(current) => current,
                            None => continue,
                        }
                    };

                    let frame = layer.display_frame;
                    if let Err(err) = self.fd.move_cursor(display.crtc, (frame.left, frame.top)) {
                        error!("move_cursor failed: {err}");
                        continue;
                    }
                    used_cursor = true;

                    if let Some(cursor) = display.state.cursor() {
                        if layer.release_fence.is_none() {
                            layer.release_fence = Some(cursor.commit(info, changed));
                        }
                    }
                }
                _ => {}
            }
        }

        // Freshly disabled planes: hide them and queue the buffer release.
        for (slot, used) in used_planes.iter().enumerate() {
            if *used {
                continue;
            }
            if display.state.plane_ref(slot).slot().current().is_some() {
                debug!(slot, "disabling plane");
                let plane = display.planes[slot].handle;
                if let Err(err) =
                    self.fd
                        .set_plane(plane, display.crtc, None, 0, (0, 0, 0, 0), (0, 0, 0, 0))
                {
                    error!("plane disable failed: {err}");
                    continue;
                }
                display.state.plane(slot).disable();
            }
        }

        if !used_cursor {
            let cursor_shown = display
                .state
                .cursor()
                .map(|c| c.slot().current().is_some())
                .unwrap_or(false);
            if cursor_shown {
                debug!("disabling cursor");
                if self.fd.set_cursor(display.crtc, None::<&PrimeCursor>).is_ok() {
                    if let Some(cursor) = display.state.cursor() {
                        cursor.disable();
                    }
                }
            }
        }

        if contents.retire_fence.is_none() {
            contents.retire_fence = Some(display.state.retire_fence());
        }

        Ok(())
    }

    /// Enable or disable vsync callbacks for a display.
    pub fn event_control(&mut self, disp: usize, event: HwcEvent, enabled: bool) -> Result<(), Error> {
        match event {
            HwcEvent::Vsync => {
                let mut displays = self.shared.displays.lock().unwrap();
                let Some(display) = displays.get_mut(disp) else {
                    return Err(Error::Invalid("unknown display"));
                };
                display.vsync_on = enabled;
                Ok(())
            }
        }
    }

    /// Turn a display's outputs off or on through the connector's DPMS
    /// property.
    pub fn blank(&mut self, disp: usize, blank: bool) -> Result<(), Error> {
        let displays = self.shared.displays.lock().unwrap();
        let Some(display) = displays.get(disp) else {
            return Err(Error::Invalid("unknown display"));
        };
        set_dpms(&self.fd, display.connector, blank)
    }

    /// The available configurations of a display.
    pub fn display_configs(&self, disp: usize) -> Result<Vec<u32>, Error> {
        let displays = self.shared.displays.lock().unwrap();
        match displays.get(disp) {
            Some(display) if display.connected => Ok(vec![0]),
            _ => Err(Error::Invalid("unknown display")),
        }
    }

    /// Static attributes of a display configuration.
    pub fn display_attributes(&self, disp: usize, config: u32) -> Result<DisplayAttributes, Error> {
        if config != 0 {
            return Err(Error::Invalid("unknown display config"));
        }
        let displays = self.shared.displays.lock().unwrap();
        let Some(display) = displays.get(disp) else {
            return Err(Error::Invalid("unknown display"));
        };

        let (w, h) = display.mode.size();
        let refresh = display.mode.vrefresh().max(1);
        let (mm_w, mm_h) = display.size_mm;
        Ok(DisplayAttributes {
            width: w as i32,
            height: h as i32,
            vsync_period_ns: (1_000_000_000 / refresh) as i32,
            dpi_x: density(w as u32, mm_w),
            dpi_y: density(h as u32, mm_h),
        })
    }

    /// Describe the displays and their scan-out state for the host's
    /// dumpsys.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let displays = self.shared.displays.lock().unwrap();
        for (index, display) in displays.iter().enumerate() {
            let (w, h) = display.mode.size();
            let _ = writeln!(
                out,
                "display {index}: {}x{} connected={} planes={} cursor={}",
                w,
                h,
                display.connected,
                display.planes.len(),
                display.cursor_supported
            );
        }
        out
    }

    /// Answer a host query.
    pub fn query(&self, what: Query) -> Result<i32, Error> {
        match what {
            Query::BackgroundLayerSupported => Ok(0),
            Query::VsyncPeriod => {
                let displays = self.shared.displays.lock().unwrap();
                let refresh = displays
                    .first()
                    .map(|d| d.mode.vrefresh().max(1))
                    .unwrap_or(60);
                Ok((1_000_000_000 / refresh) as i32)
            }
            Query::DisplayTypesSupported => {
                let displays = self.shared.displays.lock().unwrap();
                let mut mask = 0;
                for (index, display) in displays.iter().enumerate() {
                    if display.connected {
                        mask |= 1 << index;
                    }
                }
                Ok(mask)
            }
        }
    }
}

impl Drop for KmsDevice {
    fn drop(&mut self) {
        self.ping.ping();
        if let Some(thread) = self.event_thread.take() {
            let _ = thread.join();
        }
    }
}

fn density(resolution: u32, millimeters: u32) -> i32 {
    if millimeters == 0 {
        return 0;
    }
    (resolution * 25400 / millimeters) as i32
}

fn open_drm_node() -> Result<KmsDeviceFd, Error> {
    for index in 0..8 {
        let path = PathBuf::from(format!("/dev/dri/card{index}"));
        let Ok(fd) = open(&path, OFlags::RDWR | OFlags::CLOEXEC, FsMode::empty()) else {
            continue;
        };
        let device = KmsDeviceFd(Arc::new(fd));
        if device.resource_handles().is_ok() {
            info!(?path, "DRM device opened");
            return Ok(device);
        }
    }
    Err(Error::NoDisplay)
}

/// Pick a connector (preferred name, or the `index`-th one), its first mode
/// and a compatible CRTC, and enumerate the overlay planes usable on it.
fn init_display(fd: &KmsDeviceFd, index: usize, preference: Option<&str>) -> Result<KmsDisplay, Error> {
    let resources = fd
        .resource_handles()
        .map_err(access("Failed to load resource handles"))?;

    let wanted = preference.and_then(interface_from_name);
    let mut connector_info = None;
    match wanted {
        Some(interface) if interface != connector::Interface::Unknown => {
            for handle in resources.connectors() {
                let info = fd
                    .get_connector(*handle, false)
                    .map_err(access("Failed to get connector"))?;
                if info.interface() == interface {
                    connector_info = Some(info);
                    break;
                }
            }
        }
        _ => {
            if let Some(handle) = resources.connectors().get(index) {
                connector_info = Some(
                    fd.get_connector(*handle, false)
                        .map_err(access("Failed to get connector"))?,
                );
            }
        }
    }
    let connector_info = connector_info.ok_or(Error::NoDisplay)?;

    let mode = *connector_info.modes().first().ok_or(Error::NoDisplay)?;

    let crtc = *resources.crtcs().get(index).ok_or(Error::NoDisplay)?;
    let encoder_ok = connector_info
        .encoders()
        .iter()
        .filter_map(|handle| fd.get_encoder(*handle).ok())
        .any(|encoder| resources.filter_crtcs(encoder.possible_crtcs()).contains(&crtc));
    if !encoder_ok {
        return Err(Error::NoDisplay);
    }

    let mut planes = Vec::new();
    if let Ok(plane_res) = fd.plane_handles() {
        for handle in plane_res.iter() {
            let Ok(info) = fd.get_plane(*handle) else { continue };
            if !resources.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
                continue;
            }
            planes.push(PlaneSlot {
                handle: *handle,
                formats: info.formats().to_vec(),
            });
        }
    }

    let cursor_w = fd.get_driver_capability(DriverCapability::CursorWidth).unwrap_or(0);
    let cursor_h = fd.get_driver_capability(DriverCapability::CursorHeight).unwrap_or(0);
    let cursor_supported = cursor_w > 0 && cursor_h > 0;

    debug!(
        interface = ?connector_info.interface(),
        planes = planes.len(),
        cursor = cursor_supported,
        "display resources enumerated"
    );

    Ok(KmsDisplay {
        crtc,
        pipe: index as u32,
        connector: connector_info.handle(),
        connected: connector_info.state() == connector::State::Connected,
        mode,
        size_mm: connector_info.size().unwrap_or((0, 0)),
        state: ScanoutState::new(planes.len(), cursor_supported),
        planes,
        cursor_supported,
        cursor_max: (cursor_w as u32, cursor_h as u32),
        assigned: Vec::new(),
        vsync_on: false,
    })
}

fn request_vblank(fd: &KmsDeviceFd, pipe: u32, disp: usize) -> Result<(), Error> {
    fd.wait_vblank(
        VblankWaitTarget::Relative(1),
        VblankWaitFlags::EVENT,
        pipe,
        disp,
    )
    .map(|_| ())
    .map_err(access("Failed to request vblank"))
}

/// Import a gralloc buffer as a DRM framebuffer.
fn import_framebuffer(fd: &KmsDeviceFd, handle: &GrallocBuffer) -> Result<FbInfo, Error> {
    let bo = import_gem(fd, handle)?;
    let Some(gem) = gem_handle(bo) else {
        return Err(Error::Invalid("prime import returned a null handle"));
    };

    let fourcc = drm_fourcc(handle.format()).ok_or(Error::Invalid("no scan-out format for buffer"))?;
    let (w, h) = (handle.width() as u32, handle.height() as u32);

    let buffer = if fourcc == DrmFourcc::Nv12 {
        PrimeBuffer {
            size: (w, h),
            fourcc,
            pitches: [w, w, 0, 0],
            offsets: [0, w * h, 0, 0],
            handles: [Some(gem), Some(gem), None, None],
        }
    } else {
        let bpp = handle.format().bytes_per_pixel().unwrap_or(4) as u32;
        PrimeBuffer {
            size: (w, h),
            fourcc,
            pitches: [handle.stride() as u32 * bpp, 0, 0, 0],
            offsets: [0; 4],
            handles: [Some(gem), None, None, None],
        }
    };

    let fb = fd
        .add_planar_framebuffer(&buffer, FbCmd2Flags::empty())
        .map_err(|source| {
            let _ = drm_ffi::gem::close(fd.as_fd(), bo);
            Error::Access {
                errmsg: "Failed to create framebuffer",
                dev: None,
                source,
            }
        })?;

    trace!(?fb, "imported framebuffer");
    Ok(FbInfo {
        fb: Some(fb),
        bo,
        key: handle.key(),
    })
}

fn import_gem(fd: &KmsDeviceFd, handle: &GrallocBuffer) -> Result<u32, Error> {
    let prime = handle.share_fd().ok_or(Error::NoBuffer)?;
    let imported = drm_ffi::gem::fd_to_handle(fd.as_fd(), prime)
        .map_err(access("Failed to import dma-buf"))?;
    Ok(imported.handle)
}

/// Destroy a just-imported buffer after a failed commit.
fn release_import(fd: &KmsDeviceFd, info: Option<FbInfo>) {
    let Some(info) = info else { return };
    if let Some(fb) = info.fb {
        let _ = fd.destroy_framebuffer(fb);
    }
    let _ = drm_ffi::gem::close(fd.as_fd(), info.bo);
}

/// Stacking order is a plane property on this controller.
fn set_zpos(fd: &KmsDeviceFd, plane: plane::Handle, zpos: u64) {
    let Ok(props) = fd.get_properties(plane) else {
        return;
    };
    let (ids, _values) = props.as_props_and_values();
    for id in ids {
        let Ok(info) = fd.get_property(*id) else { continue };
        if info.name().to_str() == Ok("zpos") {
            if let Err(err) = fd.set_property(plane, *id, zpos) {
                warn!(?plane, "failed to set zpos: {err}");
            }
            return;
        }
    }
}

fn set_dpms(fd: &KmsDeviceFd, conn: connector::Handle, blank: bool) -> Result<(), Error> {
    let props = fd
        .get_properties(conn)
        .map_err(access("Failed to get connector properties"))?;
    let (ids, _values) = props.as_props_and_values();
    for id in ids {
        let Ok(info) = fd.get_property(*id) else { continue };
        if info.name().to_str() == Ok("DPMS") {
            // 0 = on, 3 = off
            let value = if blank { 3 } else { 0 };
            return fd
                .set_property(conn, *id, value)
                .map_err(access("Failed to set DPMS"));
        }
    }
    Err(Error::Invalid("connector has no DPMS property"))
}

fn spawn_event_thread(
    fd: KmsDeviceFd,
    shared: Arc<Shared>,
) -> Result<(calloop::ping::Ping, thread::JoinHandle<()>), Error> {
    let (ping, ping_source) =
        calloop::ping::make_ping().map_err(|err| Error::Access {
            errmsg: "Failed to create event-loop ping",
            dev: None,
            source: err.into(),
        })?;

    let thread = thread::Builder::new()
        .name("hwc-drm-events".into())
        .spawn(move || {
            let mut event_loop: EventLoop<'_, ()> = match EventLoop::try_new() {
                Ok(event_loop) => event_loop,
                Err(err) => {
                    error!("failed to create DRM event loop: {err}");
                    return;
                }
            };
            let signal = event_loop.get_signal();

            let dispatch_fd = fd.clone();
            let dispatch_shared = shared.clone();
            let source = Generic::new(fd, Interest::READ, TriggerMode::Level);
            if event_loop
                .handle()
                .insert_source(source, move |_, _, _| {
                    dispatch_events(&dispatch_fd, &dispatch_shared);
                    Ok(PostAction::Continue)
                })
                .is_err()
            {
                error!("failed to watch DRM fd");
                return;
            }

            if event_loop
                .handle()
                .insert_source(ping_source, move |_, _, _| signal.stop())
                .is_err()
            {
                error!("failed to watch shutdown ping");
                return;
            }

            debug!("DRM event loop running");
            if let Err(err) = event_loop.run(None::<Duration>, &mut (), |_| {}) {
                error!("DRM event loop failed: {err}");
            }
            debug!("DRM event loop exiting");
        })
        .map_err(|source| Error::Access {
            errmsg: "Failed to spawn DRM event thread",
            dev: None,
            source,
        })?;

    Ok((ping, thread))
}

fn dispatch_events(fd: &KmsDeviceFd, shared: &Shared) {
    let events = match fd.receive_events() {
        Ok(events) => events,
        Err(err) => {
            warn!("failed to receive DRM events: {err}");
            return;
        }
    };

    for event in events {
        match event {
            Event::Vblank(ev) => handle_vblank(fd, shared, ev.crtc, ev.time.as_nanos() as i64),
            Event::PageFlip(ev) => handle_vblank(fd, shared, ev.crtc, ev.duration.as_nanos() as i64),
            _ => {}
        }
    }
}

fn handle_vblank(fd: &KmsDeviceFd, shared: &Shared, crtc: crtc::Handle, timestamp_ns: i64) {
    let mut displays = shared.displays.lock().unwrap();
    let Some((index, display)) = displays
        .iter_mut()
        .enumerate()
        .find(|(_, d)| d.crtc == crtc)
    else {
        return;
    };

    trace!(display = index, "vblank");

    // Keep the vblank request chain alive.
    if let Err(err) = request_vblank(fd, display.pipe, index) {
        warn!(display = index, "failed to re-arm vblank: {err}");
    }

    if display.vsync_on {
        let procs = shared.procs.lock().unwrap().clone();
        if let Some(procs) = procs {
            procs.vsync(index, timestamp_ns);
        }
    }

    // Signal release fences and destroy superseded buffers.
    display.state.on_vblank(|old| {
        if let Some(fb) = old.fb {
            let _ = fd.destroy_framebuffer(fb);
        }
        let _ = drm_ffi::gem::close(fd.as_fd(), old.bo);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_matches_the_controller() {
        assert_eq!(drm_fourcc(PixelFormat::Rgba8888), Some(DrmFourcc::Argb8888));
        assert_eq!(drm_fourcc(PixelFormat::Rgbx8888), Some(DrmFourcc::Xrgb8888));
        assert_eq!(drm_fourcc(PixelFormat::Yv12), Some(DrmFourcc::Nv12));
    }

    #[test]
    fn connector_names_resolve() {
        assert_eq!(interface_from_name("HDMIA"), Some(connector::Interface::HDMIA));
        assert_eq!(interface_from_name("hdmi"), Some(connector::Interface::HDMIA));
        assert_eq!(interface_from_name("eDP"), Some(connector::Interface::EmbeddedDisplayPort));
        assert_eq!(interface_from_name("nonsense"), None);
    }

    #[test]
    fn density_math() {
        assert_eq!(density(800, 0), 0);
        assert_eq!(density(800, 127), 160_000);
    }
}
