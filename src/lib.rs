#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like HEO
#![allow(clippy::upper_case_acronyms)]

//! # samhwc: a hardware composer for SAMA5-class display controllers
//!
//! This crate implements the composition pipeline of a hardware composer
//! (hwcomposer) for embedded SoC platforms whose display controller exposes a
//! small fixed set of hardware overlay planes: simple RGBA overlay windows
//! backed by secondary framebuffer devices, and a video/scaling overlay
//! ("HEO") backed by a V4L2 output device. A DRM/KMS variant drives the same
//! policy through KMS planes with fence-timeline synchronization.
//!
//! ## Structure of the crate
//!
//! - [`hal`] models the host compositor surface: the per-frame layer lists
//!   handed to [`prepare`](hal::HwcDevice::prepare) and
//!   [`set`](hal::HwcDevice::set), and the device entry points.
//! - [`composer`] holds the per-frame policy: which layers are eligible for a
//!   hardware plane, how planes are reserved and released across frames, and
//!   how a frame is committed.
//! - [`plane`] contains the per-plane buffer and streaming protocols.
//! - [`kms`] is the DRM/KMS display-commit variant, including the
//!   vblank-driven release/retire fence machinery.
//! - [`sys`] wraps the kernel interfaces (framebuffer and V4L2 ioctls) the
//!   plane protocols are built on.
//!
//! ## General principles
//!
//! The host runtime calls `prepare` and `set` synchronously on its compositor
//! thread; background threads exist only for asynchronous completion (vsync
//! delivery, V4L2 buffer dequeue, DRM event dispatch). Per-layer failures
//! never fail a frame: the GPU-rendered framebuffer is the universal
//! fallback and must always remain correct, so a layer that cannot be placed
//! on a plane is simply composited by the GPU instead.
//!
//! ## Logging
//!
//! samhwc makes extensive use of [`tracing`] for its internal logging. No
//! subscriber is installed by the library.

pub mod composer;
pub mod config;
mod error;
pub mod gralloc;
pub mod hal;
pub mod kms;
pub mod plane;
pub mod sync;
pub mod sys;
pub mod vsync;

pub mod utils;

pub use config::HwcConfig;
pub use error::Error;
