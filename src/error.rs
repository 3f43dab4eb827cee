use std::io;
use std::path::PathBuf;

use crate::hal::PixelFormat;
use crate::plane::PlaneKind;

/// Errors thrown by the composer devices and the per-plane protocols.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Opening a required device node failed
    #[error("Failed to open device `{path:?}`: {source}")]
    DeviceOpen {
        /// Path of the device node
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// A device ioctl failed
    #[error("Device access error: {errmsg} on `{dev:?}` ({source})")]
    Access {
        /// Error message associated to the access error
        errmsg: &'static str,
        /// Device on which the error was generated
        dev: Option<PathBuf>,
        /// Underlying device error
        source: io::Error,
    },
    /// No display connector could be initialized at open time
    #[error("No usable display connector found")]
    NoDisplay,
    /// The probed device node is not the expected hardware
    #[error("Device `{0}` does not identify as `{1}`")]
    WrongDevice(PathBuf, &'static str),
    /// The pixel format is not handled by the addressed plane type
    #[error("Pixel format {0:?} is not supported on {1:?} planes")]
    UnsupportedFormat(PixelFormat, PlaneKind),
    /// The kernel granted zero buffers for a ring request
    #[error("Buffer request returned an empty ring")]
    EmptyBufferRing,
    /// The plane has no buffer ring prepared for display
    #[error("Plane has no prepared buffer ring")]
    NoBufferRing,
    /// Every plane of the requested kind is already reserved this frame
    #[error("No free {0:?} plane available")]
    NoFreePlane(PlaneKind),
    /// A layer referenced by a reserved plane carries no buffer
    #[error("Layer has no backing buffer")]
    NoBuffer,
    /// A host call carried an argument outside the contract
    #[error("Invalid argument: {0}")]
    Invalid(&'static str),
    /// Presenting the GPU-rendered framebuffer failed
    #[error("Framebuffer swap failed")]
    SwapFailed,
}

impl Error {
    /// The host's negative-errno representation of this error.
    ///
    /// Only open-time errors are ever surfaced to the host; everything else
    /// is absorbed per-layer. The mapping is total anyway so callers never
    /// need to special-case.
    pub fn errno(&self) -> i32 {
        match self {
            Error::DeviceOpen { source, .. } | Error::Access { source, .. } => {
                -source.raw_os_error().unwrap_or(libc::EIO)
            }
            Error::NoDisplay | Error::WrongDevice(..) => -libc::ENODEV,
            Error::UnsupportedFormat(..) | Error::Invalid(_) => -libc::EINVAL,
            Error::EmptyBufferRing | Error::NoFreePlane(_) => -libc::ENOSPC,
            Error::NoBufferRing | Error::NoBuffer => -libc::ENXIO,
            Error::SwapFailed => -libc::EIO,
        }
    }

    pub(crate) fn access(errmsg: &'static str, source: rustix::io::Errno) -> Self {
        Error::Access {
            errmsg,
            dev: None,
            source: source.into(),
        }
    }
}
