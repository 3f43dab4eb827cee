//! Per-frame composition policy.
//!
//! [`Composer::prepare`] walks the frame's layer list and decides, per
//! layer, whether it can be offloaded to one of the hardware overlay planes
//! or must fall back to GPU composition into the framebuffer target.
//! [`Composer::set`] then drives the reserved planes to display the frame's
//! content and tears down planes whose release was deferred from the
//! previous frame.
//!
//! Layers are walked in reverse index order so the framebuffer — which
//! always composites everything beneath any overlay — ends up correctly
//! ordered underneath the overlay planes. A plane lost by a layer is not
//! hidden immediately: it stays release-pending for one frame so a plane
//! reused on the very next frame does not flicker through a hidden state.
//!
//! Failure policy: nothing in here ever fails a frame. A layer that cannot
//! get a plane (pool exhausted, rebuild failed, device error) is composited
//! by the GPU instead, and a plane that faults during commit is forced into
//! the release-pending state and retried only once its geometry changes.

use tracing::{debug, error, trace, warn};

use crate::config::HwcConfig;
use crate::hal::{CompositionType, DisplayContents, Layer, LayerFlags, PixelFormat};
use crate::plane::{OverlayWindow, PlaneKind, PlaneStatus};
use crate::utils::Size;
use crate::Error;

/// Why a layer was refused hardware composition.
///
/// Rejection is not an error: every reason simply routes the layer to the
/// GPU fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The host flagged the layer to be skipped
    Skipped,
    /// The layer carries no source buffer
    NoBuffer,
    /// The layer is the framebuffer target or a background layer
    NotAWindow,
    /// Source crop below the minimum the scan-out engine handles
    SourceTooSmall,
    /// Destination frame below the minimum for the requested transform
    FrameTooSmall,
    /// The visible region is split into more than one rectangle
    FragmentedRegion,
    /// No plane type handles this pixel format
    UnsupportedFormat,
    /// Scaling requested on the RGBA overlay, which has no scaler
    UnsupportedScale,
    /// A transform was requested on a plane type that does not support it
    UnsupportedTransform,
}

/// The classifier's verdict for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Eligible for a plane of the given kind, subject to availability
    Overlay(PlaneKind),
    /// Must be composited by the GPU
    Fallback(Rejection),
}

/// Decide whether hardware composition is even possible for `layer`,
/// independent of plane availability.
pub fn classify(layer: &Layer, config: &HwcConfig) -> Classification {
    use Classification::Fallback;

    if layer.flags.contains(LayerFlags::SKIP) {
        return Fallback(Rejection::Skipped);
    }
    if matches!(
        layer.composition,
        CompositionType::FramebufferTarget | CompositionType::Background
    ) {
        return Fallback(Rejection::NotAWindow);
    }
    let Some(handle) = layer.handle.as_ref() else {
        return Fallback(Rejection::NoBuffer);
    };

    let crop = layer.source_crop;
    if crop.width() < config.min_source.w || crop.height() < config.min_source.h {
        return Fallback(Rejection::SourceTooSmall);
    }

    let frame = layer.display_frame;
    let minimum = config.frame_minimum(layer.transform.swaps_axes());
    if frame.width() < minimum.w || frame.height() < minimum.h {
        return Fallback(Rejection::FrameTooSmall);
    }

    // Overlay hardware presents exactly one contiguous rectangle.
    if layer.visible_region.len() != 1 {
        return Fallback(Rejection::FragmentedRegion);
    }

    match handle.format() {
        PixelFormat::Rgba8888 | PixelFormat::Bgra8888 | PixelFormat::Rgbx8888 => {
            // The RGBA windows have no scaler.
            if crop.size() != frame.size() {
                return Fallback(Rejection::UnsupportedScale);
            }
            if !layer.transform.is_identity() {
                return Fallback(Rejection::UnsupportedTransform);
            }
            Classification::Overlay(PlaneKind::Rgba)
        }
        PixelFormat::Yv12 | PixelFormat::Ycbcr422I => {
            if !layer.transform.is_identity() && !config.allow_video_transform {
                return Fallback(Rejection::UnsupportedTransform);
            }
            Classification::Overlay(PlaneKind::Video)
        }
        _ => Fallback(Rejection::UnsupportedFormat),
    }
}

/// The plane pool and the per-frame assignment state.
pub struct Composer {
    config: HwcConfig,
    panel: Size,
    planes: Vec<Box<dyn OverlayWindow>>,
    framebuffer_layers: usize,
    overlay_layers: usize,
    overlay_layers_prev: usize,
}

impl std::fmt::Debug for Composer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("panel", &self.panel)
            .field("planes", &self.planes.len())
            .field("overlay_layers", &self.overlay_layers)
            .finish()
    }
}

impl Composer {
    /// Build a composer over an already-opened plane pool.
    pub fn new(config: HwcConfig, panel: Size, planes: Vec<Box<dyn OverlayWindow>>) -> Self {
        Composer {
            config,
            panel,
            planes,
            framebuffer_layers: 0,
            overlay_layers: 0,
            overlay_layers_prev: 0,
        }
    }

    /// Panel resolution this composer drives.
    pub fn panel(&self) -> Size {
        self.panel
    }

    /// The plane pool.
    pub fn planes(&self) -> &[Box<dyn OverlayWindow>] {
        &self.planes
    }

    /// Number of layers routed to the GPU in the current frame.
    pub fn framebuffer_layers(&self) -> usize {
        self.framebuffer_layers
    }

    /// Match eligible layers against the free planes and annotate every
    /// layer's composition type.
    pub fn prepare(&mut self, contents: &mut DisplayContents) {
        // Planes that were showing content keep it until `set`: losing the
        // assignment only makes them release-pending here.
        for plane in &mut self.planes {
            if plane.status() == PlaneStatus::Reserved {
                plane.set_status(PlaneStatus::ReleasePending);
            }
        }

        self.overlay_layers_prev = self.overlay_layers;
        self.overlay_layers = 0;
        self.framebuffer_layers = 0;

        // A lone layer goes to the GPU unless overlays were already active:
        // an all-overlay frame with an empty framebuffer confuses the boot
        // animation path.
        let use_planes = contents.layers.len() > 1 || self.overlay_layers_prev > 0;

        for index in (0..contents.layers.len()).rev() {
            let layer = &mut contents.layers[index];

            if layer.composition == CompositionType::FramebufferTarget {
                continue;
            }

            if !use_planes {
                layer.composition = CompositionType::Framebuffer;
                self.framebuffer_layers += 1;
                continue;
            }

            match classify(layer, &self.config) {
                Classification::Fallback(reason) => {
                    trace!(index, ?reason, "layer routed to GPU");
                    layer.composition = CompositionType::Framebuffer;
                    self.framebuffer_layers += 1;
                }
                Classification::Overlay(kind) => match Self::reserve(&mut self.planes, kind, layer, index) {
                    Ok(()) => {
                        layer.composition = CompositionType::Overlay;
                        self.overlay_layers += 1;
                    }
                    Err(err) => {
                        warn!(index, ?kind, "plane assignment failed: {err}");
                        layer.composition = CompositionType::Framebuffer;
                        self.framebuffer_layers += 1;
                    }
                },
            }
        }

        debug!(
            layers = contents.layers.len(),
            overlay = self.overlay_layers,
            framebuffer = self.framebuffer_layers,
            "prepared frame"
        );
    }

    fn reserve(
        planes: &mut [Box<dyn OverlayWindow>],
        kind: PlaneKind,
        layer: &Layer,
        index: usize,
    ) -> Result<(), Error> {
        // Prefer a release-pending plane of the right kind: it is likely the
        // one this layer used last frame, keeping its geometry clean.
        let candidate = planes
            .iter_mut()
            .filter(|p| p.kind() == kind)
            .filter(|p| p.status() != PlaneStatus::Reserved)
            .max_by_key(|p| (p.status() == PlaneStatus::ReleasePending) as u8)
            .ok_or(Error::NoFreePlane(kind))?;

        match candidate.prepare(layer, index) {
            Ok(()) => Ok(()),
            Err(err) => {
                // The plane may be half torn down; make sure it gets reset.
                candidate.set_status(PlaneStatus::ReleasePending);
                Err(err)
            }
        }
    }

    /// Commit the prepared frame: drive every reserved plane, tear down
    /// every release-pending one.
    ///
    /// Returns whether any layer used GPU composition, i.e. whether the
    /// caller must swap the GPU-rendered framebuffer.
    pub fn set(&mut self, contents: &mut DisplayContents) -> bool {
        let timeout = std::time::Duration::from_millis(self.config.acquire_timeout_ms as u64);

        for plane in &mut self.planes {
            if plane.status() != PlaneStatus::Reserved {
                continue;
            }

            let Some(index) = plane.layer_index().filter(|&i| i < contents.layers.len()) else {
                warn!("reserved plane without a layer");
                plane.set_status(PlaneStatus::ReleasePending);
                continue;
            };
            let layer = &mut contents.layers[index];
            if layer.composition != CompositionType::Overlay {
                warn!(index, "reserved plane's layer is not an overlay");
                plane.set_status(PlaneStatus::ReleasePending);
                continue;
            }

            if let Some(fence) = layer.acquire_fence.take() {
                if !fence.wait(timeout) {
                    warn!(index, "acquire fence timed out");
                }
            }

            if let Err(err) = plane.display(layer) {
                // The layer still shows through the GPU fallback of future
                // frames; this plane sits out until its geometry changes.
                error!(index, "plane commit failed: {err}");
                plane.set_status(PlaneStatus::ReleasePending);
            }
        }

        // Deferred exactly one frame so a plane disappearing and reappearing
        // within the same vsync period does not glitch.
        for plane in &mut self.planes {
            if plane.status() == PlaneStatus::ReleasePending {
                if let Err(err) = plane.reset() {
                    error!("plane reset failed: {err}");
                }
                plane.set_status(PlaneStatus::Free);
            }
        }

        self.framebuffer_layers > 0
    }

    /// The screen is turning off: hide every window and free the pool.
    pub fn reset_all(&mut self) {
        for plane in &mut self.planes {
            if let Err(err) = plane.reset() {
                error!("plane reset failed: {err}");
            }
            plane.set_status(PlaneStatus::Free);
        }
        self.overlay_layers = 0;
        self.overlay_layers_prev = 0;
        self.framebuffer_layers = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use smallvec::smallvec;

    use super::*;
    use crate::gralloc::GrallocBuffer;
    use crate::hal::Transform;
    use crate::plane::heo::{HeoPlane, VideoBackend};
    use crate::plane::overlay::{OverlayPlane, WindowBackend};
    use crate::plane::WindowGeometry;
    use crate::sync::SyncTimeline;
    use crate::sys::fb::{FixScreeninfo, VarScreeninfo};
    use crate::utils::Rect;

    // -- fakes ------------------------------------------------------------

    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct FbLog(Arc<Mutex<Vec<&'static str>>>);

    struct FakeWindow {
        log: FbLog,
        var: VarScreeninfo,
        fix: FixScreeninfo,
    }

    impl FakeWindow {
        fn new(log: FbLog, panel: Size) -> Self {
            let var = VarScreeninfo {
                xres: panel.w as u32,
                yres: panel.h as u32,
                bits_per_pixel: 32,
                ..Default::default()
            };
            let fix = FixScreeninfo {
                smem_start: 0x3000_0000,
                line_length: panel.w as u32 * 4,
                ..Default::default()
            };
            FakeWindow { log, var, fix }
        }
    }

    impl WindowBackend for FakeWindow {
        fn var_screeninfo(&self) -> Result<VarScreeninfo, Error> {
            Ok(self.var)
        }

        fn put_var_screeninfo(&mut self, info: &VarScreeninfo) -> Result<(), Error> {
            self.log.0.lock().unwrap().push("put");
            self.var = *info;
            Ok(())
        }

        fn pan_display(&mut self, _info: &VarScreeninfo) -> Result<(), Error> {
            self.log.0.lock().unwrap().push("pan");
            Ok(())
        }

        fn fix_screeninfo(&self) -> Result<FixScreeninfo, Error> {
            Ok(self.fix)
        }

        fn map(&mut self, len: usize) -> Result<Box<dyn crate::plane::RingMemory>, Error> {
            Ok(Box::new(vec![0u8; len]))
        }
    }

    #[derive(Default, Clone)]
    struct VideoLog(Arc<Mutex<Vec<String>>>);

    struct FakeVideo {
        log: VideoLog,
        recycle: SyncTimeline,
    }

    impl FakeVideo {
        fn new(log: VideoLog) -> Self {
            FakeVideo {
                log,
                recycle: SyncTimeline::new("fake-recycle"),
            }
        }

        fn record(&self, entry: impl Into<String>) {
            self.log.0.lock().unwrap().push(entry.into());
        }
    }

    impl VideoBackend for FakeVideo {
        fn set_output_format(&self, w: u32, h: u32, _format: PixelFormat) -> Result<(), Error> {
            self.record(format!("set_fmt:{w}x{h}"));
            Ok(())
        }

        fn set_window(&self, x: i32, y: i32, w: u32, h: u32) -> Result<(), Error> {
            self.record(format!("set_win:{x},{y},{w},{h}"));
            Ok(())
        }

        fn request_buffers(&self, count: u32) -> Result<u32, Error> {
            self.record(format!("reqbufs:{count}"));
            Ok(count)
        }

        fn map_buffer(&self, index: u32) -> Result<Box<dyn crate::plane::RingMemory>, Error> {
            self.record(format!("map:{index}"));
            Ok(Box::new(vec![0u8; 640 * 480 * 2]))
        }

        fn stream_on(&self) -> Result<(), Error> {
            self.record("stream_on");
            Ok(())
        }

        fn stream_off(&self) -> Result<(), Error> {
            self.record("stream_off");
            self.recycle.signal(1);
            Ok(())
        }

        fn queue_buffer(&self, index: u32, _bytes: u32) -> Result<(), Error> {
            self.record(format!("qbuf:{index}"));
            Ok(())
        }

        fn dequeue_buffer(&self) -> Result<u32, Error> {
            // Block until stream-off, like a real output queue with no
            // completed buffer.
            let fence = self.recycle.fence_relative(1);
            fence.wait(std::time::Duration::from_secs(10));
            Err(Error::NoBufferRing)
        }
    }

    // -- helpers ----------------------------------------------------------

    fn buffer(w: i32, h: i32, format: PixelFormat) -> Arc<GrallocBuffer> {
        Arc::new(GrallocBuffer::zeroed(w, h, w, format))
    }

    fn layer(format: PixelFormat, crop: Rect, frame: Rect) -> Layer {
        let mut layer = Layer::new(buffer(crop.width().max(1), crop.height().max(1), format), frame);
        layer.source_crop = crop;
        layer
    }

    fn framebuffer_target(panel: Size) -> Layer {
        let mut target = Layer::new(
            buffer(panel.w, panel.h, PixelFormat::Rgba8888),
            Rect::from_extent(0, 0, panel.w, panel.h),
        );
        target.composition = CompositionType::FramebufferTarget;
        target
    }

    fn composer(panel: Size) -> (Composer, FbLog, VideoLog) {
        let fb_log = FbLog::default();
        let video_log = VideoLog::default();
        let planes: Vec<Box<dyn OverlayWindow>> = vec![
            Box::new(OverlayPlane::new(FakeWindow::new(fb_log.clone(), panel), panel).unwrap()),
            Box::new(OverlayPlane::new(FakeWindow::new(fb_log.clone(), panel), panel).unwrap()),
            Box::new(HeoPlane::new(FakeVideo::new(video_log.clone()), panel)),
        ];
        (
            Composer::new(HwcConfig::default(), panel, planes),
            fb_log,
            video_log,
        )
    }

    fn reserved_planes(composer: &Composer) -> Vec<(PlaneKind, Option<usize>)> {
        composer
            .planes()
            .iter()
            .filter(|p| p.status() == PlaneStatus::Reserved)
            .map(|p| (p.kind(), p.layer_index()))
            .collect()
    }

    // -- classifier -------------------------------------------------------

    #[test]
    fn classifier_accepts_exact_fit_rgba() {
        let config = HwcConfig::default();
        let l = layer(
            PixelFormat::Rgba8888,
            Rect::from_extent(0, 0, 64, 64),
            Rect::from_extent(10, 10, 64, 64),
        );
        assert_eq!(classify(&l, &config), Classification::Overlay(PlaneKind::Rgba));
    }

    #[test]
    fn classifier_rejects_scaling_on_rgba() {
        let config = HwcConfig::default();
        let l = layer(
            PixelFormat::Rgba8888,
            Rect::from_extent(0, 0, 64, 64),
            Rect::from_extent(10, 10, 128, 128),
        );
        assert_eq!(
            classify(&l, &config),
            Classification::Fallback(Rejection::UnsupportedScale)
        );
    }

    #[test]
    fn classifier_rejects_tiny_sources() {
        let config = HwcConfig::default();
        let l = layer(
            PixelFormat::Rgba8888,
            Rect::from_extent(0, 0, 10, 5),
            Rect::from_extent(0, 0, 10, 5),
        );
        assert_eq!(
            classify(&l, &config),
            Classification::Fallback(Rejection::SourceTooSmall)
        );
    }

    #[test]
    fn classifier_applies_rotated_minimums_to_the_frame() {
        let config = HwcConfig::default();
        let mut l = layer(
            PixelFormat::Yv12,
            Rect::from_extent(0, 0, 64, 64),
            Rect::from_extent(0, 0, 3, 64),
        );
        l.transform = Transform::ROT_90;
        assert_eq!(
            classify(&l, &config),
            Classification::Fallback(Rejection::FrameTooSmall)
        );

        // Unrotated, 3×64 fails the 8-wide minimum too; 8×4 passes.
        l.transform = Transform::empty();
        l.display_frame = Rect::from_extent(0, 0, 64, 64);
        assert_eq!(classify(&l, &config), Classification::Overlay(PlaneKind::Video));
    }

    #[test]
    fn classifier_rejects_fragmented_regions() {
        let config = HwcConfig::default();
        let mut l = layer(
            PixelFormat::Rgba8888,
            Rect::from_extent(0, 0, 64, 64),
            Rect::from_extent(0, 0, 64, 64),
        );
        l.visible_region = smallvec![Rect::from_extent(0, 0, 32, 64), Rect::from_extent(32, 0, 32, 64)];
        assert_eq!(
            classify(&l, &config),
            Classification::Fallback(Rejection::FragmentedRegion)
        );
    }

    #[test]
    fn classifier_rejects_transforms_and_missing_buffers() {
        let config = HwcConfig::default();

        let mut l = layer(
            PixelFormat::Bgra8888,
            Rect::from_extent(0, 0, 64, 64),
            Rect::from_extent(0, 0, 64, 64),
        );
        l.transform = Transform::FLIP_H;
        assert_eq!(
            classify(&l, &config),
            Classification::Fallback(Rejection::UnsupportedTransform)
        );

        l.transform = Transform::empty();
        l.handle = None;
        assert_eq!(classify(&l, &config), Classification::Fallback(Rejection::NoBuffer));

        let mut skipped = layer(
            PixelFormat::Rgba8888,
            Rect::from_extent(0, 0, 64, 64),
            Rect::from_extent(0, 0, 64, 64),
        );
        skipped.flags = LayerFlags::SKIP;
        assert_eq!(classify(&skipped, &config), Classification::Fallback(Rejection::Skipped));
    }

    // -- allocator scenarios ----------------------------------------------

    #[test]
    fn rgba_exact_fit_gets_an_overlay_plane() {
        let panel = Size::new(320, 240);
        let (mut composer, _fb, _video) = composer(panel);
        let mut contents = DisplayContents::new(vec![
            layer(
                PixelFormat::Rgba8888,
                Rect::from_extent(0, 0, 64, 64),
                Rect::from_extent(10, 10, 64, 64),
            ),
            framebuffer_target(panel),
        ]);

        composer.prepare(&mut contents);

        assert_eq!(contents.layers[0].composition, CompositionType::Overlay);
        let reserved = reserved_planes(&composer);
        assert_eq!(reserved, vec![(PlaneKind::Rgba, Some(0))]);

        let plane = composer
            .planes()
            .iter()
            .find(|p| p.status() == PlaneStatus::Reserved)
            .unwrap();
        assert_eq!(
            plane.geometry(),
            WindowGeometry {
                x: 10,
                y: 10,
                w: 64,
                h: 64,
                format: Some(PixelFormat::Rgba8888),
            }
        );
    }

    #[test]
    fn scaled_rgba_layer_falls_back_to_the_framebuffer() {
        let panel = Size::new(320, 240);
        let (mut composer, _fb, _video) = composer(panel);
        let mut contents = DisplayContents::new(vec![
            layer(
                PixelFormat::Rgba8888,
                Rect::from_extent(0, 0, 64, 64),
                Rect::from_extent(10, 10, 128, 128),
            ),
            framebuffer_target(panel),
        ]);

        composer.prepare(&mut contents);

        assert_eq!(contents.layers[0].composition, CompositionType::Framebuffer);
        assert!(reserved_planes(&composer).is_empty());
    }

    #[test]
    fn tiny_layer_falls_back_regardless_of_format() {
        let panel = Size::new(320, 240);
        for format in [PixelFormat::Rgba8888, PixelFormat::Yv12] {
            let (mut composer, _fb, _video) = composer(panel);
            let mut contents = DisplayContents::new(vec![
                layer(format, Rect::from_extent(0, 0, 10, 5), Rect::from_extent(0, 0, 10, 5)),
                framebuffer_target(panel),
            ]);

            composer.prepare(&mut contents);
            assert_eq!(contents.layers[0].composition, CompositionType::Framebuffer);
        }
    }

    #[test]
    fn yv12_ring_is_built_once_and_reused() {
        let panel = Size::new(800, 600);
        let (mut composer, _fb, video_log) = composer(panel);

        for _ in 0..2 {
            let mut contents = DisplayContents::new(vec![
                layer(
                    PixelFormat::Yv12,
                    Rect::from_extent(0, 0, 640, 480),
                    Rect::from_extent(0, 0, 640, 480),
                ),
                framebuffer_target(panel),
            ]);
            composer.prepare(&mut contents);
            assert_eq!(contents.layers[0].composition, CompositionType::Overlay);
            composer.set(&mut contents);
        }

        let log = video_log.0.lock().unwrap();
        let allocations = log.iter().filter(|e| e.as_str() == "reqbufs:3").count();
        assert_eq!(allocations, 1);
    }

    #[test]
    fn reserved_planes_never_exceed_the_pool_and_never_alias() {
        let panel = Size::new(320, 240);
        let (mut composer, _fb, _video) = composer(panel);

        // Four eligible RGBA layers for two RGBA planes.
        let mut layers: Vec<Layer> = (0..4)
            .map(|i| {
                layer(
                    PixelFormat::Rgba8888,
                    Rect::from_extent(0, 0, 64, 64),
                    Rect::from_extent(i * 70, 0, 64, 64),
                )
            })
            .collect();
        layers.push(framebuffer_target(panel));
        let mut contents = DisplayContents::new(layers);

        composer.prepare(&mut contents);

        let reserved = reserved_planes(&composer);
        assert_eq!(reserved.len(), 2);
        let mut indices: Vec<_> = reserved.iter().map(|(_, i)| i.unwrap()).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 2);

        let overlays = contents
            .layers
            .iter()
            .filter(|l| l.composition == CompositionType::Overlay)
            .count();
        assert_eq!(overlays, 2);
        assert_eq!(composer.framebuffer_layers(), 2);
    }

    #[test]
    fn identical_frames_do_not_dirty_planes_again() {
        let panel = Size::new(320, 240);
        let (mut composer, fb_log, _video) = composer(panel);

        let make_contents = || {
            DisplayContents::new(vec![
                layer(
                    PixelFormat::Rgba8888,
                    Rect::from_extent(0, 0, 64, 64),
                    Rect::from_extent(10, 10, 64, 64),
                ),
                framebuffer_target(panel),
            ])
        };

        let mut first = make_contents();
        composer.prepare(&mut first);
        composer.set(&mut first);

        let puts_after_first = fb_log.0.lock().unwrap().iter().filter(|e| **e == "put").count();

        let mut second = make_contents();
        composer.prepare(&mut second);
        assert!(composer.planes().iter().all(|p| !p.is_dirty()));
        composer.set(&mut second);

        let puts_after_second = fb_log.0.lock().unwrap().iter().filter(|e| **e == "put").count();
        assert_eq!(puts_after_first, puts_after_second);
    }

    #[test]
    fn lost_plane_is_released_one_frame_later() {
        let panel = Size::new(320, 240);
        let (mut composer, _fb, _video) = composer(panel);

        let mut first = DisplayContents::new(vec![
            layer(
                PixelFormat::Rgba8888,
                Rect::from_extent(0, 0, 64, 64),
                Rect::from_extent(10, 10, 64, 64),
            ),
            framebuffer_target(panel),
        ]);
        composer.prepare(&mut first);
        composer.set(&mut first);
        assert_eq!(reserved_planes(&composer).len(), 1);

        // Same layer, now with a transform the window cannot do.
        let mut second = DisplayContents::new(vec![
            {
                let mut l = layer(
                    PixelFormat::Rgba8888,
                    Rect::from_extent(0, 0, 64, 64),
                    Rect::from_extent(10, 10, 64, 64),
                );
                l.transform = Transform::ROT_90;
                l
            },
            framebuffer_target(panel),
        ]);
        composer.prepare(&mut second);

        assert_eq!(second.layers[0].composition, CompositionType::Framebuffer);
        assert!(composer
            .planes()
            .iter()
            .any(|p| p.status() == PlaneStatus::ReleasePending));

        composer.set(&mut second);
        assert!(composer.planes().iter().all(|p| p.status() == PlaneStatus::Free));
    }

    #[test]
    fn lone_layer_stays_on_the_gpu() {
        let panel = Size::new(320, 240);
        let (mut composer, _fb, _video) = composer(panel);
        let mut contents = DisplayContents::new(vec![layer(
            PixelFormat::Rgba8888,
            Rect::from_extent(0, 0, 64, 64),
            Rect::from_extent(10, 10, 64, 64),
        )]);

        composer.prepare(&mut contents);

        assert_eq!(contents.layers[0].composition, CompositionType::Framebuffer);
        assert!(reserved_planes(&composer).is_empty());
    }

    #[test]
    fn set_reports_whether_the_gpu_must_swap() {
        let panel = Size::new(320, 240);
        let (mut composer, _fb, _video) = composer(panel);

        let mut mixed = DisplayContents::new(vec![
            layer(
                PixelFormat::Rgba8888,
                Rect::from_extent(0, 0, 64, 64),
                Rect::from_extent(0, 0, 64, 64),
            ),
            layer(
                PixelFormat::Rgb565,
                Rect::from_extent(0, 0, 64, 64),
                Rect::from_extent(100, 0, 64, 64),
            ),
            framebuffer_target(panel),
        ]);
        composer.prepare(&mut mixed);
        assert!(composer.set(&mut mixed));

        let mut overlay_only = DisplayContents::new(vec![
            layer(
                PixelFormat::Rgba8888,
                Rect::from_extent(0, 0, 64, 64),
                Rect::from_extent(0, 0, 64, 64),
            ),
            layer(
                PixelFormat::Rgba8888,
                Rect::from_extent(0, 0, 64, 64),
                Rect::from_extent(100, 0, 64, 64),
            ),
            framebuffer_target(panel),
        ]);
        composer.prepare(&mut overlay_only);
        assert!(!composer.set(&mut overlay_only));
    }
}
