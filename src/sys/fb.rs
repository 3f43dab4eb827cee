//! Linux framebuffer device access.
//!
//! The overlay windows of the display controller are exposed as secondary
//! framebuffer devices. Window geometry travels through the variable screen
//! info (with the controller's packed position encoding in `nonstd`), buffer
//! flips through pan-display, and the panel's vsync interrupt is toggled
//! through a vendor ioctl on the base device.

use std::io;
use std::mem;
use std::path::{Path, PathBuf};

use rustix::fs::{open, Mode, OFlags};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use super::{ioc, ioctl, MappedRegion, IOC_WRITE};
use crate::Error;

/// Color channel layout inside a pixel.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FbBitfield {
    /// Bit offset of the channel
    pub offset: u32,
    /// Channel width in bits
    pub length: u32,
    /// Most significant bit first
    pub msb_right: u32,
}

/// `struct fb_var_screeninfo`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VarScreeninfo {
    /// Visible horizontal resolution
    pub xres: u32,
    /// Visible vertical resolution
    pub yres: u32,
    /// Virtual horizontal resolution
    pub xres_virtual: u32,
    /// Virtual vertical resolution (yres × ring size for flipping)
    pub yres_virtual: u32,
    /// Horizontal pan offset
    pub xoffset: u32,
    /// Vertical pan offset, selects the ring slot
    pub yoffset: u32,
    /// Bits per pixel
    pub bits_per_pixel: u32,
    /// Grayscale flag
    pub grayscale: u32,
    /// Red channel layout
    pub red: FbBitfield,
    /// Green channel layout
    pub green: FbBitfield,
    /// Blue channel layout
    pub blue: FbBitfield,
    /// Alpha channel layout
    pub transp: FbBitfield,
    /// Non-standard pixel layout; carries the packed window position
    pub nonstd: u32,
    /// Activation flags
    pub activate: u32,
    /// Physical height in mm
    pub height: u32,
    /// Physical width in mm
    pub width: u32,
    /// Acceleration flags; drives per-pixel alpha on the controller
    pub accel_flags: u32,
    /// Pixel clock in ps
    pub pixclock: u32,
    /// Left margin timing
    pub left_margin: u32,
    /// Right margin timing
    pub right_margin: u32,
    /// Upper margin timing
    pub upper_margin: u32,
    /// Lower margin timing
    pub lower_margin: u32,
    /// Horizontal sync length
    pub hsync_len: u32,
    /// Vertical sync length
    pub vsync_len: u32,
    /// Sync flags
    pub sync: u32,
    /// Video mode flags
    pub vmode: u32,
    /// Rotation angle
    pub rotate: u32,
    /// Colorspace
    pub colorspace: u32,
    /// Reserved
    pub reserved: [u32; 4],
}

/// `struct fb_fix_screeninfo`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FixScreeninfo {
    /// Identification string of the device
    pub id: [u8; 16],
    /// Physical start address of the reserved frame memory
    pub smem_start: libc::c_ulong,
    /// Length of the frame memory
    pub smem_len: u32,
    /// Framebuffer type
    pub type_: u32,
    /// Interleave for planar types
    pub type_aux: u32,
    /// Visual type
    pub visual: u32,
    /// Horizontal pan step
    pub xpanstep: u16,
    /// Vertical pan step
    pub ypanstep: u16,
    /// Wrap step
    pub ywrapstep: u16,
    /// Bytes per visible row
    pub line_length: u32,
    /// MMIO start address
    pub mmio_start: libc::c_ulong,
    /// MMIO length
    pub mmio_len: u32,
    /// Acceleration chip
    pub accel: u32,
    /// Capability flags
    pub capabilities: u16,
    /// Reserved
    pub reserved: [u16; 2],
}

impl FixScreeninfo {
    /// The device identification as a string.
    pub fn id_str(&self) -> &str {
        let end = self.id.iter().position(|&b| b == 0).unwrap_or(self.id.len());
        std::str::from_utf8(&self.id[..end]).unwrap_or("")
    }
}

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOPUT_VSCREENINFO: libc::c_ulong = 0x4601;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;
const FBIOPAN_DISPLAY: libc::c_ulong = 0x4606;
const FBIOBLANK: libc::c_ulong = 0x4611;

// Vendor ioctl on the base device toggling the vsync interrupt.
const FBIO_SET_VSYNC_INT: libc::c_ulong = ioc(IOC_WRITE, b'F' as u32, 0x21, mem::size_of::<u32>());

/// `activate` field: apply immediately.
pub const FB_ACTIVATE_NOW: u32 = 0;
/// `activate` field: force application even without changes.
pub const FB_ACTIVATE_FORCE: u32 = 128;
/// Mask of the activate mode bits.
pub const FB_ACTIVATE_MASK: u32 = 15;

const FB_BLANK_UNBLANK: libc::c_int = 0;
const FB_BLANK_POWERDOWN: libc::c_int = 4;

/// An open framebuffer device node.
#[derive(Debug)]
pub struct FbDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl FbDevice {
    /// Open a framebuffer device node read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let fd = open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()).map_err(|err| {
            Error::DeviceOpen {
                path: path.clone(),
                source: io::Error::from(err),
            }
        })?;
        Ok(FbDevice { fd, path })
    }

    /// Path of the underlying device node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the variable screen info.
    pub fn var_screeninfo(&self) -> Result<VarScreeninfo, Error> {
        let mut info = VarScreeninfo::default();
        ioctl(self.fd.as_fd(), FBIOGET_VSCREENINFO, &mut info, "FBIOGET_VSCREENINFO failed")?;
        Ok(info)
    }

    /// Apply a variable screen info, reprogramming window geometry.
    pub fn put_var_screeninfo(&self, info: &VarScreeninfo) -> Result<(), Error> {
        let mut info = *info;
        ioctl(self.fd.as_fd(), FBIOPUT_VSCREENINFO, &mut info, "FBIOPUT_VSCREENINFO failed")
    }

    /// Read the fixed screen info.
    pub fn fix_screeninfo(&self) -> Result<FixScreeninfo, Error> {
        let mut info = FixScreeninfo::default();
        ioctl(self.fd.as_fd(), FBIOGET_FSCREENINFO, &mut info, "FBIOGET_FSCREENINFO failed")?;
        Ok(info)
    }

    /// Pan the display to the offsets in `info`, flipping to a ring slot.
    pub fn pan_display(&self, info: &VarScreeninfo) -> Result<(), Error> {
        let mut info = *info;
        ioctl(self.fd.as_fd(), FBIOPAN_DISPLAY, &mut info, "FBIOPAN_DISPLAY failed")
    }

    /// Blank or unblank the display.
    pub fn blank(&self, blank: bool) -> Result<(), Error> {
        let mut arg = if blank { FB_BLANK_POWERDOWN } else { FB_BLANK_UNBLANK };
        ioctl(self.fd.as_fd(), FBIOBLANK, &mut arg, "FBIOBLANK failed")
    }

    /// Toggle the panel vsync interrupt.
    pub fn set_vsync_interrupt(&self, enabled: bool) -> Result<(), Error> {
        let mut arg: u32 = enabled as u32;
        ioctl(self.fd.as_fd(), FBIO_SET_VSYNC_INT, &mut arg, "vsync interrupt toggle failed")
    }

    /// Map `len` bytes of the device's reserved frame memory.
    pub fn map(&self, len: usize) -> Result<MappedRegion, Error> {
        MappedRegion::map(self.fd.as_fd(), len, 0)
    }

    /// Borrow the underlying fd.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Round a byte count up to whole pages.
pub fn round_up_to_page_size(len: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    (len + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_codes_match_the_abi() {
        assert_eq!(FBIOGET_VSCREENINFO, 0x4600);
        assert_eq!(FBIOPAN_DISPLAY, 0x4606);
        // _IOW('F', 0x21, __u32)
        assert_eq!(FBIO_SET_VSYNC_INT, 0x4004_4621);
    }

    #[test]
    fn fix_screeninfo_id_parsing() {
        let mut info = FixScreeninfo::default();
        info.id[..16].copy_from_slice(b"atmel_hlcdfb_ovl");
        assert_eq!(info.id_str(), "atmel_hlcdfb_ovl");
    }

    #[test]
    fn page_rounding() {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert_eq!(round_up_to_page_size(1), page);
        assert_eq!(round_up_to_page_size(page), page);
        assert_eq!(round_up_to_page_size(page + 1), 2 * page);
    }
}
