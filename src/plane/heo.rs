//! The video/scaling overlay window ("HEO").
//!
//! Backed by a V4L2 video output device. Unlike the simple overlay window
//! this plane supports hardware scaling and YUV formats, but a format or
//! geometry change requires tearing down and rebuilding the whole buffer
//! queue: the driver rejects format changes while buffers are allocated or
//! streaming is active, so the rebuild must run in the exact order
//! stream-off → unmap → request 0 buffers → set output format → set overlay
//! window → request N buffers → map → stream-on.
//!
//! Buffer recycling is asynchronous: a dequeue thread owned by the plane
//! blocks in `VIDIOC_DQBUF` and advances the plane's release timeline per
//! completed buffer. The plane joins the thread whenever streaming stops, so
//! the thread never outlives its plane.

use std::sync::Arc;
use std::thread;

use tracing::{debug, trace, warn};

use super::{
    clipped_window, OverlayWindow, PlaneKind, PlaneStatus, RingMemory, WindowGeometry, WindowState,
};
use crate::hal::{Layer, PixelFormat};
use crate::sync::SyncTimeline;
use crate::sys::v4l2::{MemoryKind, VideoOutputDevice, PIX_FMT_YUV420, PIX_FMT_YUYV};
use crate::utils::Size;
use crate::Error;

/// Ring slots requested from the driver; the grant may differ.
const NUM_VIDEO_BUFFERS: u32 = 3;

/// Device access needed by the video overlay protocol.
pub trait VideoBackend: Send + Sync {
    /// Program the output pixel format (source frame geometry).
    fn set_output_format(&self, width: u32, height: u32, format: PixelFormat) -> Result<(), Error>;
    /// Program the overlay window rectangle on the panel.
    fn set_window(&self, x: i32, y: i32, width: u32, height: u32) -> Result<(), Error>;
    /// Request a buffer ring; returns the granted count. Zero frees the ring.
    fn request_buffers(&self, count: u32) -> Result<u32, Error>;
    /// Map ring slot `index`.
    fn map_buffer(&self, index: u32) -> Result<Box<dyn RingMemory>, Error>;
    /// Start streaming.
    fn stream_on(&self) -> Result<(), Error>;
    /// Stop streaming; pending dequeues return with an error.
    fn stream_off(&self) -> Result<(), Error>;
    /// Queue slot `index` for display.
    fn queue_buffer(&self, index: u32, bytes_used: u32) -> Result<(), Error>;
    /// Block until a queued slot completes, returning its index.
    fn dequeue_buffer(&self) -> Result<u32, Error>;
}

fn v4l2_pixelformat(format: PixelFormat) -> Result<u32, Error> {
    match format {
        PixelFormat::Yv12 => Ok(PIX_FMT_YUV420),
        PixelFormat::Ycbcr422I => Ok(PIX_FMT_YUYV),
        other => Err(Error::UnsupportedFormat(other, PlaneKind::Video)),
    }
}

impl VideoBackend for VideoOutputDevice {
    fn set_output_format(&self, width: u32, height: u32, format: PixelFormat) -> Result<(), Error> {
        VideoOutputDevice::set_output_format(self, width, height, v4l2_pixelformat(format)?)
    }

    fn set_window(&self, x: i32, y: i32, width: u32, height: u32) -> Result<(), Error> {
        VideoOutputDevice::set_overlay_window(self, x, y, width, height)
    }

    fn request_buffers(&self, count: u32) -> Result<u32, Error> {
        VideoOutputDevice::request_buffers(self, count, MemoryKind::Mmap)
    }

    fn map_buffer(&self, index: u32) -> Result<Box<dyn RingMemory>, Error> {
        Ok(Box::new(VideoOutputDevice::map_buffer(self, index)?))
    }

    fn stream_on(&self) -> Result<(), Error> {
        VideoOutputDevice::stream_on(self)
    }

    fn stream_off(&self) -> Result<(), Error> {
        VideoOutputDevice::stream_off(self)
    }

    fn queue_buffer(&self, index: u32, bytes_used: u32) -> Result<(), Error> {
        VideoOutputDevice::queue_buffer(self, index, bytes_used, MemoryKind::Mmap)
    }

    fn dequeue_buffer(&self) -> Result<u32, Error> {
        VideoOutputDevice::dequeue_buffer(self, MemoryKind::Mmap)
    }
}

/// The dequeue thread handle; joined when streaming stops.
struct DequeueThread {
    handle: Option<thread::JoinHandle<()>>,
}

impl DequeueThread {
    fn spawn<B: VideoBackend + 'static>(backend: Arc<B>, timeline: SyncTimeline) -> Result<Self, Error> {
        let handle = thread::Builder::new()
            .name("heo-dqbuf".into())
            .spawn(move || loop {
                match backend.dequeue_buffer() {
                    Ok(index) => {
                        trace!(index, "recycled video buffer");
                        timeline.signal(1);
                    }
                    // Stream-off (or teardown) unblocks the dequeue with an
                    // error; the thread's work is done.
                    Err(_) => break,
                }
            })
            .map_err(|source| Error::Access {
                errmsg: "Failed to spawn dequeue thread",
                dev: None,
                source,
            })?;

        Ok(DequeueThread {
            handle: Some(handle),
        })
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Letterbox fit: per axis, when the destination is larger than the source
/// the window keeps the source's native extent centered within the
/// destination instead of stretching; downscale uses the full destination.
fn video_window(src: Size, x: u32, y: u32, w: u32, h: u32) -> (u32, u32, u32, u32) {
    let src_w = src.w.max(0) as u32;
    let src_h = src.h.max(0) as u32;

    let (x, w) = if src_w > 0 && w > src_w {
        (x + (w - src_w) / 2, src_w)
    } else {
        (x, w)
    };
    let (y, h) = if src_h > 0 && h > src_h {
        (y + (h - src_h) / 2, src_h)
    } else {
        (y, h)
    };

    (x, y, w, h)
}

/// A video overlay plane.
pub struct HeoPlane<B: VideoBackend + 'static> {
    backend: Arc<B>,
    state: WindowState,
    panel: Size,
    src_size: Size,
    ring: Vec<Box<dyn RingMemory>>,
    ring_size: usize,
    buf_index: usize,
    queued: u32,
    streaming: bool,
    timeline: SyncTimeline,
    dqbuf: Option<DequeueThread>,
}

impl<B: VideoBackend> std::fmt::Debug for HeoPlane<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeoPlane")
            .field("geometry", &self.state.geometry)
            .field("status", &self.state.status)
            .field("ring_size", &self.ring_size)
            .field("streaming", &self.streaming)
            .finish()
    }
}

impl<B: VideoBackend + 'static> HeoPlane<B> {
    /// Open a video overlay plane over `backend` for a panel of the given
    /// size. The buffer ring is built lazily on the first assignment.
    pub fn new(backend: B, panel: Size) -> Self {
        HeoPlane {
            backend: Arc::new(backend),
            state: WindowState::default(),
            panel,
            src_size: Size::default(),
            ring: Vec::new(),
            ring_size: 0,
            buf_index: 0,
            queued: 0,
            streaming: false,
            timeline: SyncTimeline::new("heo"),
            dqbuf: None,
        }
    }

    /// The recorded ring size, as granted by the kernel.
    pub fn ring_size(&self) -> usize {
        self.ring_size
    }

    fn stream_on_internal(&mut self) -> Result<(), Error> {
        if self.streaming {
            return Ok(());
        }
        self.backend.stream_on()?;
        self.streaming = true;
        self.queued = 0;
        self.timeline = SyncTimeline::new("heo");
        self.dqbuf = Some(DequeueThread::spawn(self.backend.clone(), self.timeline.clone())?);
        Ok(())
    }

    fn stream_off_internal(&mut self) -> Result<(), Error> {
        if !self.streaming {
            return Ok(());
        }
        // Stopping the stream unblocks the dequeue thread, which then exits
        // and can be joined.
        self.backend.stream_off()?;
        if let Some(mut dqbuf) = self.dqbuf.take() {
            dqbuf.join();
        }
        self.streaming = false;
        self.queued = 0;
        Ok(())
    }

    /// Tear down and rebuild the buffer queue for the current source size,
    /// format and window rectangle.
    fn rebuild(&mut self, format: PixelFormat) -> Result<(), Error> {
        let geometry = self.state.geometry;

        self.stream_off_internal()?;
        self.ring.clear();
        self.ring_size = 0;
        self.backend.request_buffers(0)?;

        // The output format must be set before the window rectangle, the
        // driver requires this order.
        self.backend
            .set_output_format(self.src_size.w.max(0) as u32, self.src_size.h.max(0) as u32, format)?;
        self.backend
            .set_window(geometry.x as i32, geometry.y as i32, geometry.w, geometry.h)?;

        let granted = self.backend.request_buffers(NUM_VIDEO_BUFFERS)?;
        if granted == 0 {
            return Err(Error::EmptyBufferRing);
        }
        if granted != NUM_VIDEO_BUFFERS {
            warn!(requested = NUM_VIDEO_BUFFERS, granted, "video buffer ring resized by kernel");
        }

        let mut ring = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            ring.push(self.backend.map_buffer(index)?);
        }
        self.ring = ring;
        self.ring_size = granted as usize;
        self.buf_index = 0;
        self.state.dirty = false;

        self.stream_on_internal()?;

        debug!(
            w = self.src_size.w,
            h = self.src_size.h,
            ring = self.ring_size,
            "rebuilt video overlay queue"
        );
        Ok(())
    }
}

impl<B: VideoBackend + 'static> OverlayWindow for HeoPlane<B> {
    fn kind(&self) -> PlaneKind {
        PlaneKind::Video
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
        let src = layer.source_crop.size();

        let (x, y, w, h) = clipped_window(visible, self.panel);
        let (x, y, w, h) = video_window(src, x, y, w, h);

        let geometry_changed = self.state.update_geometry(WindowGeometry {
            x,
            y,
            w,
            h,
            format: Some(handle.format()),
        });
        let source_changed = self.src_size != src;

        if geometry_changed || source_changed || self.ring.is_empty() {
            self.src_size = src;
            self.rebuild(handle.format())?;
        }

        self.state.reserve(layer_index);
        Ok(())
    }

    fn display(&mut self, layer: &mut Layer) -> Result<(), Error> {
        let handle = layer.handle.as_ref().ok_or(Error::NoBuffer)?;
        if self.ring.is_empty() {
            return Err(Error::NoBufferRing);
        }

        let w = self.src_size.w.max(0) as usize;
        let h = self.src_size.h.max(0) as usize;
        let copy_size = match handle.format() {
            // 4:2:0: luma plane plus two quarter-size chroma planes
            PixelFormat::Yv12 => w * h * 3 / 2,
            PixelFormat::Ycbcr422I => w * h * 2,
            other => return Err(Error::UnsupportedFormat(other, PlaneKind::Video)),
        };

        let src = handle.bytes();
        let slot = self.ring[self.buf_index].bytes_mut();
        let len = copy_size.min(slot.len()).min(src.len());
        slot[..len].copy_from_slice(&src[..len]);

        self.backend.queue_buffer(self.buf_index as u32, len as u32)?;
        self.queued += 1;
        layer.release_fence = Some(self.timeline.fence_at(self.queued));

        self.buf_index = (self.buf_index + 1) % self.ring_size;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.stream_off_internal()?;
        self.ring.clear();
        if self.ring_size > 0 {
            self.backend.request_buffers(0)?;
            self.ring_size = 0;
        }
        self.src_size = Size::default();
        self.state.clear();
        Ok(())
    }
}

impl<B: VideoBackend + 'static> Drop for HeoPlane<B> {
    fn drop(&mut self) {
        let _ = self.stream_off_internal();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::gralloc::GrallocBuffer;
    use crate::utils::Rect;

    struct FakeVideo {
        log: Arc<Mutex<Vec<String>>>,
        grant: u32,
        sender: Mutex<Option<mpsc::Sender<u32>>>,
        receiver: Mutex<Option<mpsc::Receiver<u32>>>,
    }

    impl FakeVideo {
        fn new(grant: u32) -> (Self, Arc<Mutex<Vec<String>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                FakeVideo {
                    log: log.clone(),
                    grant,
                    sender: Mutex::new(None),
                    receiver: Mutex::new(None),
                },
                log,
            )
        }

        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }
    }

    impl VideoBackend for FakeVideo {
        fn set_output_format(&self, width: u32, height: u32, _format: PixelFormat) -> Result<(), Error> {
            self.record(format!("set_fmt:{width}x{height}"));
            Ok(())
        }

        fn set_window(&self, x: i32, y: i32, width: u32, height: u32) -> Result<(), Error> {
            self.record(format!("set_win:{x},{y},{width},{height}"));
            Ok(())
        }

        fn request_buffers(&self, count: u32) -> Result<u32, Error> {
            self.record(format!("reqbufs:{count}"));
            Ok(if count == 0 { 0 } else { self.grant.min(count) })
        }

        fn map_buffer(&self, index: u32) -> Result<Box<dyn RingMemory>, Error> {
            self.record(format!("map:{index}"));
            Ok(Box::new(vec![0u8; 640 * 480 * 2]))
        }

        fn stream_on(&self) -> Result<(), Error> {
            self.record("stream_on");
            let (tx, rx) = mpsc::channel();
            *self.sender.lock().unwrap() = Some(tx);
            *self.receiver.lock().unwrap() = Some(rx);
            Ok(())
        }

        fn stream_off(&self) -> Result<(), Error> {
            self.record("stream_off");
            // Dropping the sender unblocks a pending dequeue.
            *self.sender.lock().unwrap() = None;
            Ok(())
        }

        fn queue_buffer(&self, index: u32, _bytes_used: u32) -> Result<(), Error> {
            self.record(format!("qbuf:{index}"));
            if let Some(sender) = self.sender.lock().unwrap().as_ref() {
                let _ = sender.send(index);
            }
            Ok(())
        }

        fn dequeue_buffer(&self) -> Result<u32, Error> {
            let receiver = self.receiver.lock().unwrap();
            match receiver.as_ref() {
                Some(rx) => rx.recv().map_err(|_| Error::NoBufferRing),
                None => Err(Error::NoBufferRing),
            }
        }
    }

    fn yv12_layer(w: i32, h: i32) -> Layer {
        let handle = Arc::new(GrallocBuffer::zeroed(w, h, w, PixelFormat::Yv12));
        Layer::new(handle, Rect::from_extent(0, 0, w, h))
    }

    #[test]
    fn ring_size_records_the_kernel_grant() {
        let (backend, log) = FakeVideo::new(2);
        let mut plane = HeoPlane::new(backend, Size::new(800, 600));
        let mut layer = yv12_layer(640, 480);

        plane.prepare(&layer, 0).unwrap();
        assert_eq!(plane.ring_size(), 2);

        plane.display(&mut layer).unwrap();
        plane.display(&mut layer).unwrap();
        plane.display(&mut layer).unwrap();

        let log = log.lock().unwrap();
        let queued: Vec<_> = log.iter().filter(|e| e.starts_with("qbuf")).collect();
        // The slot index wraps at the granted count, not the requested one.
        assert_eq!(queued, ["qbuf:0", "qbuf:1", "qbuf:0"]);
    }

    #[test]
    fn identical_frames_rebuild_the_ring_once() {
        let (backend, log) = FakeVideo::new(NUM_VIDEO_BUFFERS);
        let mut plane = HeoPlane::new(backend, Size::new(800, 600));
        let layer = yv12_layer(640, 480);

        plane.prepare(&layer, 0).unwrap();
        plane.prepare(&layer, 0).unwrap();

        let log = log.lock().unwrap();
        let allocations = log.iter().filter(|e| *e == &format!("reqbufs:{NUM_VIDEO_BUFFERS}")).count();
        assert_eq!(allocations, 1);
    }

    #[test]
    fn rebuild_follows_the_required_order() {
        let (backend, log) = FakeVideo::new(NUM_VIDEO_BUFFERS);
        let mut plane = HeoPlane::new(backend, Size::new(800, 600));
        let layer = yv12_layer(640, 480);

        plane.prepare(&layer, 0).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            &[
                "reqbufs:0",
                "set_fmt:640x480",
                "set_win:0,0,640,480",
                "reqbufs:3",
                "map:0",
                "map:1",
                "map:2",
                "stream_on",
            ]
        );
    }

    #[test]
    fn release_fence_signals_when_the_buffer_recycles() {
        let (backend, _log) = FakeVideo::new(NUM_VIDEO_BUFFERS);
        let mut plane = HeoPlane::new(backend, Size::new(800, 600));
        let mut layer = yv12_layer(640, 480);

        plane.prepare(&layer, 0).unwrap();
        plane.display(&mut layer).unwrap();

        let fence = layer.release_fence.clone().unwrap();
        assert!(fence.wait(Duration::from_secs(5)));
    }

    #[test]
    fn letterbox_centers_small_sources() {
        // Source smaller than the destination: native size, centered.
        assert_eq!(
            video_window(Size::new(320, 240), 0, 0, 640, 480),
            (160, 120, 320, 240)
        );
        // Downscale uses the full destination.
        assert_eq!(
            video_window(Size::new(800, 600), 0, 0, 640, 480),
            (0, 0, 640, 480)
        );
        // Mixed axes letterbox only where needed.
        assert_eq!(
            video_window(Size::new(320, 600), 0, 0, 640, 480),
            (160, 0, 320, 480)
        );
    }
}
