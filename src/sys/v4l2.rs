//! V4L2 output-device access for the video overlay.
//!
//! The scaling overlay of the display controller is exposed as a V4L2 video
//! output device: frames are queued to the output buffer queue and the
//! overlay window rectangle is programmed through the overlay format. The
//! driver rejects format changes while buffers are allocated or streaming is
//! active, so callers must follow the stream-off → free → set-format →
//! request → map → stream-on order; the sequencing itself lives in the
//! plane protocol, not here.

use std::io;
use std::mem;
use std::path::{Path, PathBuf};

use rustix::fs::{open, Mode, OFlags};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use super::{ioc, ioctl, MappedRegion, IOC_READ, IOC_WRITE};
use crate::Error;

/// Buffer queue type: video output.
pub const BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
/// Buffer queue type: overlay window.
pub const BUF_TYPE_VIDEO_OVERLAY: u32 = 3;

/// Progressive frames.
pub const FIELD_NONE: u32 = 1;

/// Memory kind of a V4L2 buffer queue.
#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Driver-allocated buffers mapped into the process
    #[default]
    Mmap = 1,
    /// Caller-provided user pointers, queued zero-copy
    UserPtr = 2,
}

/// Four-character pixel format code.
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Planar YCbCr 4:2:0.
pub const PIX_FMT_YUV420: u32 = fourcc(b'Y', b'U', b'1', b'2');
/// Interleaved YCbCr 4:2:2.
pub const PIX_FMT_YUYV: u32 = fourcc(b'Y', b'U', b'Y', b'V');

/// `struct v4l2_capability`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Capability {
    /// Driver name
    pub driver: [u8; 16],
    /// Card name; identifies the overlay hardware
    pub card: [u8; 32],
    /// Bus info
    pub bus_info: [u8; 32],
    /// Driver version
    pub version: u32,
    /// Capability flags
    pub capabilities: u32,
    /// Per-device capability flags
    pub device_caps: u32,
    /// Reserved
    pub reserved: [u32; 3],
}

impl Capability {
    fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }

    /// The card name as a string.
    pub fn card_str(&self) -> &str {
        let end = self.card.iter().position(|&b| b == 0).unwrap_or(self.card.len());
        std::str::from_utf8(&self.card[..end]).unwrap_or("")
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("card", &self.card_str())
            .field("capabilities", &format_args!("{:#x}", self.capabilities))
            .finish()
    }
}

/// `struct v4l2_rect`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Rect {
    /// Left edge
    pub left: i32,
    /// Top edge
    pub top: i32,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

/// `struct v4l2_pix_format`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PixFormat {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Fourcc pixel format
    pub pixelformat: u32,
    /// Field order
    pub field: u32,
    /// Bytes per row
    pub bytesperline: u32,
    /// Total image size in bytes
    pub sizeimage: u32,
    /// Colorspace
    pub colorspace: u32,
    /// Private data
    pub priv_: u32,
    /// Format flags
    pub flags: u32,
    /// YCbCr encoding
    pub ycbcr_enc: u32,
    /// Quantization range
    pub quantization: u32,
    /// Transfer function
    pub xfer_func: u32,
}

/// `struct v4l2_window`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Window {
    /// Destination rectangle on the panel
    pub w: V4l2Rect,
    /// Field order
    pub field: u32,
    /// Chroma key
    pub chromakey: u32,
    /// Clip list (unused)
    pub clips: *mut libc::c_void,
    /// Clip count
    pub clipcount: u32,
    /// Clip bitmap (unused)
    pub bitmap: *mut libc::c_void,
    /// Global alpha
    pub global_alpha: u8,
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window").field("w", &self.w).finish()
    }
}

/// `struct v4l2_format`, restricted to the union members this crate uses.
#[repr(C)]
pub struct Format {
    /// Buffer queue type selecting the union member
    pub type_: u32,
    /// Format payload
    pub fmt: FormatUnion,
}

/// The format union of `struct v4l2_format`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union FormatUnion {
    /// Output pixel format
    pub pix: PixFormat,
    /// Overlay window
    pub win: Window,
    /// Kernel padding
    pub raw_data: [u8; 200],
}

impl Format {
    /// A zeroed format struct for the given buffer type.
    pub fn zeroed(type_: u32) -> Self {
        let mut format: Format = unsafe { mem::zeroed() };
        format.type_ = type_;
        format
    }
}

impl std::fmt::Debug for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Format").field("type_", &self.type_).finish()
    }
}

/// `struct v4l2_requestbuffers`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestBuffers {
    /// Requested (in) / granted (out) buffer count
    pub count: u32,
    /// Buffer queue type
    pub type_: u32,
    /// Memory kind
    pub memory: u32,
    /// Reserved
    pub reserved: [u32; 2],
}

/// `struct v4l2_timecode`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Timecode {
    /// Timecode type
    pub type_: u32,
    /// Flags
    pub flags: u32,
    /// Frame count
    pub frames: u8,
    /// Seconds
    pub seconds: u8,
    /// Minutes
    pub minutes: u8,
    /// Hours
    pub hours: u8,
    /// User bits
    pub userbits: [u8; 4],
}

/// The memory union of `struct v4l2_buffer`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union BufferM {
    /// Mapping offset for MMAP buffers
    pub offset: u32,
    /// User pointer for USERPTR buffers
    pub userptr: libc::c_ulong,
}

/// `struct v4l2_buffer`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Buffer {
    /// Ring slot index
    pub index: u32,
    /// Buffer queue type
    pub type_: u32,
    /// Bytes used in the buffer
    pub bytesused: u32,
    /// State flags
    pub flags: u32,
    /// Field order
    pub field: u32,
    /// Capture/display timestamp
    pub timestamp: libc::timeval,
    /// Timecode
    pub timecode: Timecode,
    /// Sequence number
    pub sequence: u32,
    /// Memory kind
    pub memory: u32,
    /// Memory location
    pub m: BufferM,
    /// Buffer length in bytes
    pub length: u32,
    /// Reserved
    pub reserved2: u32,
    /// Reserved
    pub reserved: u32,
}

impl Buffer {
    fn zeroed(type_: u32, memory: MemoryKind) -> Self {
        let mut buf: Buffer = unsafe { mem::zeroed() };
        buf.type_ = type_;
        buf.memory = memory as u32;
        buf
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("flags", &format_args!("{:#x}", self.flags))
            .finish()
    }
}

/// Buffer flag: mapped into user space.
pub const BUF_FLAG_MAPPED: u32 = 0x1;

const VIDIOC_QUERYCAP: libc::c_ulong = ioc(IOC_READ, b'V' as u32, 0, mem::size_of::<Capability>());
const VIDIOC_G_FMT: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, b'V' as u32, 4, mem::size_of::<Format>());
const VIDIOC_S_FMT: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, b'V' as u32, 5, mem::size_of::<Format>());
const VIDIOC_REQBUFS: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, b'V' as u32, 8, mem::size_of::<RequestBuffers>());
const VIDIOC_QUERYBUF: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, b'V' as u32, 9, mem::size_of::<Buffer>());
const VIDIOC_QBUF: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, b'V' as u32, 15, mem::size_of::<Buffer>());
const VIDIOC_DQBUF: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, b'V' as u32, 17, mem::size_of::<Buffer>());
const VIDIOC_STREAMON: libc::c_ulong = ioc(IOC_WRITE, b'V' as u32, 18, mem::size_of::<libc::c_int>());
const VIDIOC_STREAMOFF: libc::c_ulong = ioc(IOC_WRITE, b'V' as u32, 19, mem::size_of::<libc::c_int>());

/// An open V4L2 output device node.
#[derive(Debug)]
pub struct VideoOutputDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl VideoOutputDevice {
    /// Open a video device node read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let fd = open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()).map_err(|err| {
            Error::DeviceOpen {
                path: path.clone(),
                source: io::Error::from(err),
            }
        })?;
        Ok(VideoOutputDevice { fd, path })
    }

    /// Path of the underlying device node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Query the device identity.
    pub fn querycap(&self) -> Result<Capability, Error> {
        let mut cap = Capability::zeroed();
        ioctl(self.fd.as_fd(), VIDIOC_QUERYCAP, &mut cap, "VIDIOC_QUERYCAP failed")?;
        Ok(cap)
    }

    /// Program the output pixel format (the source frame geometry).
    pub fn set_output_format(&self, width: u32, height: u32, pixelformat: u32) -> Result<(), Error> {
        let mut format = Format::zeroed(BUF_TYPE_VIDEO_OUTPUT);
        ioctl(self.fd.as_fd(), VIDIOC_G_FMT, &mut format, "VIDIOC_G_FMT (output) failed")?;
        format.type_ = BUF_TYPE_VIDEO_OUTPUT;
        let pix = unsafe { &mut format.fmt.pix };
        pix.width = width;
        pix.height = height;
        pix.pixelformat = pixelformat;
        pix.field = FIELD_NONE;
        ioctl(self.fd.as_fd(), VIDIOC_S_FMT, &mut format, "VIDIOC_S_FMT (output) failed")
    }

    /// Program the overlay window rectangle (the destination on the panel).
    pub fn set_overlay_window(&self, x: i32, y: i32, width: u32, height: u32) -> Result<(), Error> {
        let mut format = Format::zeroed(BUF_TYPE_VIDEO_OVERLAY);
        ioctl(self.fd.as_fd(), VIDIOC_G_FMT, &mut format, "VIDIOC_G_FMT (overlay) failed")?;
        format.type_ = BUF_TYPE_VIDEO_OVERLAY;
        let win = unsafe { &mut format.fmt.win };
        win.w = V4l2Rect {
            left: x,
            top: y,
            width,
            height,
        };
        ioctl(self.fd.as_fd(), VIDIOC_S_FMT, &mut format, "VIDIOC_S_FMT (overlay) failed")
    }

    /// Request `count` buffers; the kernel answers with the granted count.
    ///
    /// Requesting zero frees a previously allocated queue.
    pub fn request_buffers(&self, count: u32, memory: MemoryKind) -> Result<u32, Error> {
        let mut req = RequestBuffers {
            count,
            type_: BUF_TYPE_VIDEO_OUTPUT,
            memory: memory as u32,
            reserved: [0; 2],
        };
        ioctl(self.fd.as_fd(), VIDIOC_REQBUFS, &mut req, "VIDIOC_REQBUFS failed")?;
        Ok(req.count)
    }

    /// Map ring slot `index` into the process.
    pub fn map_buffer(&self, index: u32) -> Result<MappedRegion, Error> {
        let mut buf = Buffer::zeroed(BUF_TYPE_VIDEO_OUTPUT, MemoryKind::Mmap);
        buf.index = index;
        ioctl(self.fd.as_fd(), VIDIOC_QUERYBUF, &mut buf, "VIDIOC_QUERYBUF failed")?;

        if buf.flags & BUF_FLAG_MAPPED != 0 {
            return Err(Error::Access {
                errmsg: "Buffer is already mapped",
                dev: Some(self.path.clone()),
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }

        let offset = unsafe { buf.m.offset };
        MappedRegion::map(self.fd.as_fd(), buf.length as usize, offset as u64)
    }

    /// Queue ring slot `index` for display.
    pub fn queue_buffer(&self, index: u32, bytesused: u32, memory: MemoryKind) -> Result<(), Error> {
        let mut buf = Buffer::zeroed(BUF_TYPE_VIDEO_OUTPUT, memory);
        buf.index = index;
        buf.bytesused = bytesused;
        buf.field = FIELD_NONE;
        ioctl(self.fd.as_fd(), VIDIOC_QBUF, &mut buf, "VIDIOC_QBUF failed")
    }

    /// Dequeue a completed ring slot, blocking until one is available.
    pub fn dequeue_buffer(&self, memory: MemoryKind) -> Result<u32, Error> {
        let mut buf = Buffer::zeroed(BUF_TYPE_VIDEO_OUTPUT, memory);
        ioctl(self.fd.as_fd(), VIDIOC_DQBUF, &mut buf, "VIDIOC_DQBUF failed")?;
        Ok(buf.index)
    }

    /// Start streaming on the output queue.
    pub fn stream_on(&self) -> Result<(), Error> {
        let mut type_: libc::c_int = BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        ioctl(self.fd.as_fd(), VIDIOC_STREAMON, &mut type_, "VIDIOC_STREAMON failed")
    }

    /// Stop streaming, returning all queued buffers.
    pub fn stream_off(&self) -> Result<(), Error> {
        let mut type_: libc::c_int = BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        ioctl(self.fd.as_fd(), VIDIOC_STREAMOFF, &mut type_, "VIDIOC_STREAMOFF failed")
    }

    /// Borrow the underlying fd.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_encoding() {
        assert_eq!(PIX_FMT_YUYV, 0x5659_5559);
        assert_eq!(PIX_FMT_YUV420, 0x3231_5559);
    }

    #[test]
    fn struct_sizes_match_the_abi() {
        assert_eq!(mem::size_of::<Capability>(), 104);
        assert_eq!(mem::size_of::<RequestBuffers>(), 20);
        assert_eq!(mem::size_of::<PixFormat>(), 48);
    }

    #[test]
    fn card_name_parsing() {
        let mut cap = Capability::zeroed();
        cap.card[..14].copy_from_slice(b"Atmel HEO Laye");
        assert_eq!(cap.card_str(), "Atmel HEO Laye");
    }
}
