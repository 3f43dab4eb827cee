//! Software sync timelines and fences.
//!
//! A [`SyncTimeline`] is a monotonically increasing counter owned by one
//! resource class (an overlay plane, the cursor, the whole-frame retire
//! point, a video window's buffer queue). A [`SyncFence`] is a point on a
//! timeline: it becomes signaled once the timeline has advanced at least
//! that far and never unsignals.
//!
//! Fences are handed across threads freely; signaling is performed by the
//! completion side (vblank handler, dequeue thread) while fences are
//! consumed by the producer side, so the counter lives under a mutex paired
//! with a condvar for blocking waits.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Inner {
    name: String,
    value: Mutex<u32>,
    cond: Condvar,
}

/// A monotonic synchronization counter.
#[derive(Clone)]
pub struct SyncTimeline {
    inner: Arc<Inner>,
}

impl SyncTimeline {
    /// Create a timeline starting at zero.
    pub fn new(name: impl Into<String>) -> Self {
        SyncTimeline {
            inner: Arc::new(Inner {
                name: name.into(),
                value: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Advance the timeline by `count`, signaling every fence at or below
    /// the new value.
    pub fn signal(&self, count: u32) {
        let mut value = self.inner.value.lock().unwrap();
        *value += count;
        self.inner.cond.notify_all();
    }

    /// The number of points signaled so far.
    pub fn signaled(&self) -> u32 {
        *self.inner.value.lock().unwrap()
    }

    /// A fence at the absolute point `point`.
    pub fn fence_at(&self, point: u32) -> SyncFence {
        SyncFence {
            inner: self.inner.clone(),
            point,
        }
    }

    /// A fence `ahead` points past the currently signaled value.
    ///
    /// Reading the counter and creating the fence happens under one lock so
    /// a concurrent signal cannot slip in between.
    pub fn fence_relative(&self, ahead: u32) -> SyncFence {
        let value = self.inner.value.lock().unwrap();
        SyncFence {
            inner: self.inner.clone(),
            point: *value + ahead,
        }
    }
}

impl fmt::Debug for SyncTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTimeline")
            .field("name", &self.inner.name)
            .field("signaled", &self.signaled())
            .finish()
    }
}

/// A point on a [`SyncTimeline`].
#[derive(Clone)]
pub struct SyncFence {
    inner: Arc<Inner>,
    point: u32,
}

impl SyncFence {
    /// Whether the fence has been signaled.
    pub fn is_signaled(&self) -> bool {
        *self.inner.value.lock().unwrap() >= self.point
    }

    /// Block until the fence signals or `timeout` elapses.
    ///
    /// Returns `true` when the fence signaled within the timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut value = self.inner.value.lock().unwrap();
        while *value < self.point {
            let (guard, result) = self.inner.cond.wait_timeout(value, timeout).unwrap();
            value = guard;
            if result.timed_out() {
                return *value >= self.point;
            }
        }
        true
    }

    /// The timeline point this fence waits for.
    pub fn point(&self) -> u32 {
        self.point
    }
}

impl fmt::Debug for SyncFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncFence")
            .field("timeline", &self.inner.name)
            .field("point", &self.point)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fence_signals_in_order() {
        let timeline = SyncTimeline::new("test");
        let first = timeline.fence_relative(1);
        let second = timeline.fence_relative(2);

        assert!(!first.is_signaled());
        timeline.signal(1);
        assert!(first.is_signaled());
        assert!(!second.is_signaled());
        timeline.signal(1);
        assert!(second.is_signaled());
    }

    #[test]
    fn relative_fences_track_the_counter() {
        let timeline = SyncTimeline::new("test");
        timeline.signal(5);
        let fence = timeline.fence_relative(2);
        assert_eq!(fence.point(), 7);
    }

    #[test]
    fn wait_wakes_on_signal() {
        let timeline = SyncTimeline::new("test");
        let fence = timeline.fence_relative(1);

        let signaler = {
            let timeline = timeline.clone();
            thread::spawn(move || timeline.signal(1))
        };

        assert!(fence.wait(Duration::from_secs(5)));
        signaler.join().unwrap();
    }

    #[test]
    fn wait_times_out_unsignaled() {
        let timeline = SyncTimeline::new("test");
        let fence = timeline.fence_relative(1);
        assert!(!fence.wait(Duration::from_millis(10)));
    }
}
