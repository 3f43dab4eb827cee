//! Vsync delivery.
//!
//! The panel driver exposes a vsync timestamp attribute that becomes
//! readable (`POLLPRI`) on every refresh boundary. A dedicated monitor
//! thread blocks in `poll()` on that attribute and forwards each timestamp
//! to the host's registered vsync callback while delivery is enabled.
//!
//! The host contract wants vsync handled with display-urgent priority and
//! for the lifetime of the device: the thread is started at open, woken
//! through an eventfd for shutdown, and joined when the monitor drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags};
use rustix::fs::{seek, SeekFrom};
use rustix::io::Errno;
use std::os::fd::OwnedFd;

use tracing::{debug, error, trace};

use crate::hal::HostProcs;
use crate::Error;

/// Shared slot for the host callbacks, filled by `register_procs`.
pub type ProcsSlot = Arc<Mutex<Option<Arc<dyn HostProcs>>>>;

/// The background vsync notifier.
pub struct VsyncMonitor {
    thread: Option<thread::JoinHandle<()>>,
    wakeup: Arc<OwnedFd>,
}

impl std::fmt::Debug for VsyncMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsyncMonitor")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl VsyncMonitor {
    /// Spawn the monitor over an open vsync attribute fd.
    ///
    /// `enabled` gates delivery (toggled by `event_control`), `procs` holds
    /// the host callbacks once registered.
    pub fn start(vsync_fd: OwnedFd, procs: ProcsSlot, enabled: Arc<AtomicBool>) -> Result<Self, Error> {
        let wakeup = Arc::new(eventfd(0, EventfdFlags::CLOEXEC).map_err(|err| {
            Error::access("Failed to create vsync wakeup fd", err)
        })?);

        let thread_wakeup = wakeup.clone();
        let thread = thread::Builder::new()
            .name("hwc-vsync".into())
            .spawn(move || monitor_loop(vsync_fd, thread_wakeup, procs, enabled))
            .map_err(|source| Error::Access {
                errmsg: "Failed to spawn vsync thread",
                dev: None,
                source,
            })?;

        Ok(VsyncMonitor {
            thread: Some(thread),
            wakeup,
        })
    }
}

impl Drop for VsyncMonitor {
    fn drop(&mut self) {
        let _ = rustix::io::write(&*self.wakeup, &1u64.to_ne_bytes());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn monitor_loop(vsync_fd: OwnedFd, wakeup: Arc<OwnedFd>, procs: ProcsSlot, enabled: Arc<AtomicBool>) {
    debug!("vsync monitor running");

    loop {
        let mut fds = [
            PollFd::new(&vsync_fd, PollFlags::PRI),
            PollFd::new(&*wakeup, PollFlags::IN),
        ];

        match poll(&mut fds, -1) {
            Err(Errno::INTR) => continue,
            Err(err) => {
                error!("vsync poll failed: {err}");
                break;
            }
            Ok(_) => {}
        }

        if fds[1].revents().contains(PollFlags::IN) {
            break;
        }

        if fds[0].revents().intersects(PollFlags::PRI | PollFlags::ERR) {
            match read_timestamp(&vsync_fd) {
                Ok(timestamp) => {
                    trace!(timestamp, "vsync");
                    if enabled.load(Ordering::Relaxed) {
                        let procs = procs.lock().unwrap().clone();
                        if let Some(procs) = procs {
                            procs.vsync(0, timestamp);
                        }
                    }
                }
                Err(err) => error!("failed to read vsync timestamp: {err}"),
            }
        }
    }

    debug!("vsync monitor exiting");
}

/// The attribute holds the timestamp of the latest refresh as a decimal
/// string; it must be re-read from the start on every event.
fn read_timestamp(fd: &OwnedFd) -> Result<i64, Error> {
    seek(fd, SeekFrom::Start(0)).map_err(|err| Error::access("Failed to rewind vsync attribute", err))?;

    let mut buf = [0u8; 64];
    let n = rustix::io::read(fd, &mut buf).map_err(|err| Error::access("Failed to read vsync attribute", err))?;

    Ok(parse_timestamp(&buf[..n]))
}

fn parse_timestamp(bytes: &[u8]) -> i64 {
    let mut value: i64 = 0;
    for &b in bytes {
        match b {
            b'0'..=b'9' => value = value.wrapping_mul(10).wrapping_add((b - b'0') as i64),
            _ => break,
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_parsing() {
        assert_eq!(parse_timestamp(b"123456789\n"), 123_456_789);
        assert_eq!(parse_timestamp(b""), 0);
        assert_eq!(parse_timestamp(b"42"), 42);
        assert_eq!(parse_timestamp(b"7 trailing"), 7);
    }
}
