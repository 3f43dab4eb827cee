//! Per-resource scan-out state and fence issuance.
//!
//! Every scan-out resource of a display (each overlay plane, the cursor,
//! the primary framebuffer, the whole-frame retire point) tracks a
//! `current` buffer (on screen) and a `next` buffer (committed, waiting for
//! the vblank that makes it current). The vblank handler promotes `next` to
//! `current`, hands the superseded buffer back for destruction and advances
//! the resource's release timeline — decoupling buffer reclamation from the
//! commit path, which therefore never blocks.
//!
//! Fence contract: a release fence issued for a commit that kept the buffer
//! unchanged signals after exactly one vblank; a fence issued for a newly
//! committed buffer signals after exactly two (the content must be on
//! screen for a full refresh before it can have been superseded), and never
//! earlier.

use std::num::NonZeroU32;

use drm::control::framebuffer;

use crate::gralloc::BufferKey;
use crate::sync::{SyncFence, SyncTimeline};

/// Fence offset for a commit that kept the current buffer.
const FENCE_CURRENT_BUF: u32 = 1;
/// Fence offset for a commit that replaced the buffer.
const FENCE_NEW_BUF: u32 = 2;

/// An imported scan-out buffer: the kernel framebuffer object (absent for
/// cursor buffers), the GEM handle backing it, and the identity of the
/// gralloc buffer it was imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbInfo {
    /// Framebuffer object attached to the buffer
    pub fb: Option<framebuffer::Handle>,
    /// Raw GEM handle from the prime import
    pub bo: u32,
    /// Identity of the source gralloc buffer
    pub key: BufferKey,
}

/// Make a framebuffer handle from its raw id.
pub fn framebuffer_handle(raw: u32) -> Option<framebuffer::Handle> {
    NonZeroU32::new(raw).map(framebuffer::Handle::from)
}

/// Current/next state of one scan-out resource.
#[derive(Debug, Default)]
pub struct ScanoutSlot {
    current: Option<FbInfo>,
    next: Option<FbInfo>,
    updated: bool,
}

impl ScanoutSlot {
    /// The buffer currently on screen.
    pub fn current(&self) -> Option<&FbInfo> {
        self.current.as_ref()
    }

    /// Whether the on-screen buffer is the one identified by `key`.
    pub fn matches(&self, key: BufferKey) -> bool {
        self.current.map(|info| info.key == key).unwrap_or(false)
    }

    /// Record a newly committed buffer (or `None` for a disable).
    pub fn record(&mut self, info: Option<FbInfo>) {
        self.next = info;
        self.updated = true;
    }

    /// Vblank: promote `next` to `current`. Returns the superseded buffer,
    /// which is now off screen and must be destroyed.
    pub fn advance(&mut self) -> Option<FbInfo> {
        if !self.updated {
            return None;
        }
        self.updated = false;
        let old = self.current.take();
        self.current = self.next;
        old
    }

    /// Whether a commit is waiting for its vblank.
    pub fn pending(&self) -> bool {
        self.updated
    }
}

/// A slot paired with its release timeline.
#[derive(Debug)]
pub struct ScanoutResource {
    slot: ScanoutSlot,
    timeline: SyncTimeline,
    issued: u32,
}

impl ScanoutResource {
    fn new(name: String) -> Self {
        ScanoutResource {
            slot: ScanoutSlot::default(),
            timeline: SyncTimeline::new(name),
            issued: 0,
        }
    }

    /// The underlying slot.
    pub fn slot(&self) -> &ScanoutSlot {
        &self.slot
    }

    /// Record a commit and issue the matching release fence: +1 when the
    /// buffer is unchanged, +2 when it is new.
    pub fn commit(&mut self, info: FbInfo, changed: bool) -> SyncFence {
        if changed {
            self.slot.record(Some(info));
        }
        let fence = self
            .timeline
            .fence_relative(if changed { FENCE_NEW_BUF } else { FENCE_CURRENT_BUF });
        self.issued = self.issued.max(fence.point());
        fence
    }

    /// Record that the resource was turned off this frame.
    ///
    /// Returns whether it was actually showing something.
    pub fn disable(&mut self) -> bool {
        if self.slot.current().is_none() && !self.slot.pending() {
            return false;
        }
        self.slot.record(None);
        true
    }

    /// Vblank bookkeeping: release the superseded buffer and advance the
    /// timeline while fences are outstanding.
    fn on_vblank(&mut self, release: &mut dyn FnMut(FbInfo)) {
        if let Some(old) = self.slot.advance() {
            release(old);
        }
        if self.timeline.signaled() < self.issued {
            self.timeline.signal(1);
        }
    }
}

/// The complete scan-out state of one display.
#[derive(Debug)]
pub struct ScanoutState {
    /// Overlay planes, indexed like the display's plane list
    planes: Vec<ScanoutResource>,
    /// The primary (GPU framebuffer target) slot; its lifetime is managed
    /// by the GPU swap chain, so it has no release timeline
    main: ScanoutSlot,
    /// Hardware cursor, when supported
    cursor: Option<ScanoutResource>,
    /// Whole-frame retire timeline
    retire: SyncTimeline,
    retire_issued: u32,
    frame_updated: bool,
}

impl ScanoutState {
    /// State for a display with `num_planes` overlay planes.
    pub fn new(num_planes: usize, cursor_supported: bool) -> Self {
        ScanoutState {
            planes: (0..num_planes)
                .map(|i| ScanoutResource::new(format!("plane{i}")))
                .collect(),
            main: ScanoutSlot::default(),
            cursor: cursor_supported.then(|| ScanoutResource::new("cursor".into())),
            retire: SyncTimeline::new("retire"),
            retire_issued: 0,
            frame_updated: false,
        }
    }

    /// The overlay plane resource at `index`.
    pub fn plane(&mut self, index: usize) -> &mut ScanoutResource {
        &mut self.planes[index]
    }

    /// The overlay plane resource at `index`, immutable.
    pub fn plane_ref(&self, index: usize) -> &ScanoutResource {
        &self.planes[index]
    }

    /// Number of plane resources.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// The primary framebuffer slot.
    pub fn main(&mut self) -> &mut ScanoutSlot {
        &mut self.main
    }

    /// The cursor resource, when the hardware has one.
    pub fn cursor(&mut self) -> Option<&mut ScanoutResource> {
        self.cursor.as_mut()
    }

    /// Issue the whole-frame retire fence and mark the frame committed.
    pub fn retire_fence(&mut self) -> SyncFence {
        self.frame_updated = true;
        let fence = self.retire.fence_relative(FENCE_NEW_BUF);
        self.retire_issued = self.retire_issued.max(fence.point());
        fence
    }

    /// Whether a committed frame has not seen its vblank yet.
    pub fn frame_pending(&self) -> bool {
        self.frame_updated
    }

    /// Vblank: walk every resource, release superseded buffers through
    /// `release`, advance the timelines, and retire the frame.
    pub fn on_vblank(&mut self, mut release: impl FnMut(FbInfo)) {
        for plane in &mut self.planes {
            plane.on_vblank(&mut release);
        }

        if let Some(old) = self.main.advance() {
            release(old);
        }

        if let Some(cursor) = &mut self.cursor {
            cursor.on_vblank(&mut release);
        }

        if self.frame_updated {
            self.frame_updated = false;
        }
        if self.retire.signaled() < self.retire_issued {
            self.retire.signal(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(fb: u32, key: i64) -> FbInfo {
        FbInfo {
            fb: framebuffer_handle(fb),
            bo: fb,
            key: BufferKey::synthetic(key),
        }
    }

    #[test]
    fn new_buffer_fence_signals_after_exactly_two_vblanks() {
        let mut state = ScanoutState::new(1, false);

        let fence = state.plane(0).commit(info(1, 1), true);
        assert!(!fence.is_signaled());

        state.on_vblank(|_| {});
        assert!(!fence.is_signaled());

        state.on_vblank(|_| {});
        assert!(fence.is_signaled());
    }

    #[test]
    fn unchanged_buffer_fence_signals_after_exactly_one_vblank() {
        let mut state = ScanoutState::new(1, false);

        let first = state.plane(0).commit(info(1, 1), true);
        state.on_vblank(|_| {});
        state.on_vblank(|_| {});
        assert!(first.is_signaled());

        // Same buffer again.
        let second = state.plane(0).commit(info(1, 1), false);
        assert!(!second.is_signaled());
        state.on_vblank(|_| {});
        assert!(second.is_signaled());
    }

    #[test]
    fn superseded_buffer_is_released_on_the_next_vblank() {
        let mut state = ScanoutState::new(1, false);
        let mut released = Vec::new();

        state.plane(0).commit(info(1, 1), true);
        state.on_vblank(|old| released.push(old));
        assert!(released.is_empty());

        state.plane(0).commit(info(2, 2), true);
        state.on_vblank(|old| released.push(old));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].bo, 1);
    }

    #[test]
    fn disable_releases_the_current_buffer() {
        let mut state = ScanoutState::new(1, false);
        let mut released = Vec::new();

        state.plane(0).commit(info(1, 1), true);
        state.on_vblank(|_| {});

        assert!(state.plane(0).disable());
        // Nothing to do when already off.
        state.on_vblank(|old| released.push(old));
        assert_eq!(released.len(), 1);
        assert!(state.plane_ref(0).slot().current().is_none());
        assert!(!state.plane(0).disable());
    }

    #[test]
    fn retire_fence_signals_after_two_vblanks() {
        let mut state = ScanoutState::new(0, false);

        let retire = state.retire_fence();
        state.on_vblank(|_| {});
        assert!(!retire.is_signaled());
        state.on_vblank(|_| {});
        assert!(retire.is_signaled());
    }

    #[test]
    fn slot_matches_tracks_the_displayed_key() {
        let mut state = ScanoutState::new(1, false);

        state.plane(0).commit(info(1, 7), true);
        assert!(!state.plane_ref(0).slot().matches(BufferKey::synthetic(7)));

        state.on_vblank(|_| {});
        assert!(state.plane_ref(0).slot().matches(BufferKey::synthetic(7)));
        assert!(!state.plane_ref(0).slot().matches(BufferKey::synthetic(8)));
    }
}
