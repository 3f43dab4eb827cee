//! Gralloc buffer descriptors.
//!
//! Buffers arrive from the external gralloc allocator and are consumed
//! read-only by the copy routines of the plane protocols and by the KMS
//! import path. A descriptor exposes the buffer geometry, the pixel format,
//! the dma-buf fd used for zero-copy import, and the CPU-visible bytes.
//!
//! A mapping always has exactly one owner and is unmapped exactly once: the
//! [`GrallocBuffer`] owns the region and releases it on drop.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::hal::PixelFormat;
use crate::sys::MappedRegion;
use crate::Error;

enum Storage {
    Mapped(MappedRegion),
    Bytes(Box<[u8]>),
}

/// A buffer handed over by the gralloc allocator.
pub struct GrallocBuffer {
    width: i32,
    height: i32,
    stride: i32,
    format: PixelFormat,
    storage: Storage,
    share_fd: Option<OwnedFd>,
}

impl GrallocBuffer {
    /// Import a dma-buf backed buffer, mapping its bytes for CPU access.
    pub fn from_dmabuf(
        fd: OwnedFd,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
    ) -> Result<Self, Error> {
        let len = format.buffer_size(stride, height);
        let region = MappedRegion::map(fd.as_fd(), len, 0)?;
        Ok(GrallocBuffer {
            width,
            height,
            stride,
            format,
            storage: Storage::Mapped(region),
            share_fd: Some(fd),
        })
    }

    /// Wrap CPU-allocated bytes, for software buffers and tests.
    pub fn from_bytes(
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
        bytes: Vec<u8>,
    ) -> Self {
        debug_assert!(bytes.len() >= format.buffer_size(stride, height));
        GrallocBuffer {
            width,
            height,
            stride,
            format,
            storage: Storage::Bytes(bytes.into_boxed_slice()),
            share_fd: None,
        }
    }

    /// Allocate a zeroed software buffer of the right size.
    pub fn zeroed(width: i32, height: i32, stride: i32, format: PixelFormat) -> Self {
        let bytes = vec![0u8; format.buffer_size(stride, height)];
        Self::from_bytes(width, height, stride, format, bytes)
    }

    /// Width of the buffer in pixels.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Height of the buffer in pixels.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Row stride in pixels.
    pub fn stride(&self) -> i32 {
        self.stride
    }

    /// Pixel format of the buffer.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bits per pixel, as recorded by the allocator.
    pub fn bits_per_pixel(&self) -> u32 {
        self.format.bits_per_pixel()
    }

    /// The CPU-visible bytes of the buffer.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Mapped(region) => region.bytes(),
            Storage::Bytes(bytes) => bytes,
        }
    }

    /// The dma-buf fd backing this buffer, if any.
    pub fn share_fd(&self) -> Option<BorrowedFd<'_>> {
        self.share_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// A key identifying the backing storage across frames.
    ///
    /// Two descriptors with the same key refer to the same physical buffer;
    /// the KMS commit path uses this to detect unchanged scanout content.
    pub fn key(&self) -> BufferKey {
        match &self.share_fd {
            Some(fd) => BufferKey(fd.as_raw_fd() as i64),
            None => BufferKey(-(self.bytes().as_ptr() as i64)),
        }
    }
}

impl fmt::Debug for GrallocBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrallocBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("share_fd", &self.share_fd)
            .finish()
    }
}

/// Identity of a buffer's backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey(i64);

#[cfg(test)]
impl BufferKey {
    pub(crate) fn synthetic(v: i64) -> Self {
        BufferKey(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_buffer_sizing() {
        let buf = GrallocBuffer::zeroed(64, 64, 64, PixelFormat::Rgba8888);
        assert_eq!(buf.bytes().len(), 64 * 64 * 4);

        let yv12 = GrallocBuffer::zeroed(64, 64, 64, PixelFormat::Yv12);
        assert_eq!(yv12.bytes().len(), 64 * 64 * 3 / 2);
    }

    #[test]
    fn distinct_buffers_have_distinct_keys() {
        let a = GrallocBuffer::zeroed(16, 16, 16, PixelFormat::Rgba8888);
        let b = GrallocBuffer::zeroed(16, 16, 16, PixelFormat::Rgba8888);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a.key());
    }
}
