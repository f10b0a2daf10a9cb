//! Stall detection for dispatch loops.
//!
//! Each loop publishes the start time of the item it is processing (0 when
//! idle). The watchdog thread wakes every interval and reports loops whose
//! current item has been running for at least their timeout. Detection only:
//! nothing is restarted or interrupted.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use super::dispatch_loop::DispatchLoop;
use crate::trace::{debug, error, info};
use crate::types::ThreadId;

/// A loop found stuck on one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    pub thread: ThreadId,
    pub busy_for: Duration,
    pub timeout: Duration,
}

/// One loop's watchdog inputs.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub thread: ThreadId,
    /// Microseconds since epoch the current item started, 0 when idle.
    pub started_micros: u64,
    pub timeout: Duration,
}

/// Returns the probes that violate their timeout at `now_micros`.
///
/// Idle loops and loops with a zero timeout are never reported.
#[must_use]
pub fn check(now_micros: u64, probes: impl IntoIterator<Item = Probe>) -> Vec<Stall> {
    probes
        .into_iter()
        .filter(|p| p.started_micros != 0 && !p.timeout.is_zero())
        .filter_map(|p| {
            let busy_for = Duration::from_micros(now_micros.saturating_sub(p.started_micros));
            (busy_for >= p.timeout).then_some(Stall {
                thread: p.thread,
                busy_for,
                timeout: p.timeout,
            })
        })
        .collect()
}

/// Handle to the watchdog thread.
pub struct Watchdog {
    shutdown_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn spawn(
        loops: Vec<Arc<DispatchLoop>>,
        epoch: Instant,
        interval: Duration,
    ) -> io::Result<Self> {
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        debug!(interval_ms = interval.as_millis() as u64, "spawning watchdog");
        let handle = thread::Builder::new()
            .name("tether-watchdog".into())
            .spawn(move || {
                info!("watchdog started");
                while !flag.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    let now = elapsed_micros(epoch);
                    let probes = loops.iter().map(|l| Probe {
                        thread: l.id(),
                        started_micros: l.process_started(),
                        timeout: l.watchdog_timeout(),
                    });
                    for stall in check(now, probes) {
                        error!(
                            thread = %stall.thread,
                            busy_ms = stall.busy_for.as_millis() as u64,
                            timeout_ms = stall.timeout.as_millis() as u64,
                            "watchdog: dispatch loop stalled"
                        );
                    }
                }
                info!("watchdog exiting");
            })?;
        Ok(Self {
            shutdown_flag,
            handle: Some(handle),
        })
    }

    /// Stops the watchdog thread and waits for it.
    pub fn shutdown(mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }
}

/// Microseconds since `epoch`.
pub(crate) fn elapsed_micros(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}
