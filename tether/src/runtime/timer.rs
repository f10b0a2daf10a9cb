//! Timers delivered as events to the owning thread.
//!
//! A single service thread keeps every armed timer in a deadline heap. When a
//! deadline passes it sends a timer event (priority [`Priority::TIMER`]) to
//! the thread that created the [`Timer`]; the timer consumer there counts the
//! tick and calls its handler.
//!
//! Re-arming bumps a generation counter, so ticks still queued from an
//! earlier run are ignored.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use super::dispatcher::{Consumer, Dispatcher};
use super::{SendError, WeakRuntime};
use crate::dispatch::{Event, Signature};
use crate::trace::{debug, info, trace, warn};
use crate::types::{ConsumerId, Context, Priority, ThreadId};

pub(crate) const TIMER_TAG: &str = "tether::timer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

/// How many times a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCount {
    Times(u64),
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer already running")]
    AlreadyRunning,
    #[error("timer not running")]
    NotRunning,
    #[error("timer period must be non-zero")]
    ZeroPeriod,
    #[error("timer count must be non-zero")]
    ZeroCount,
    #[error("timer service is not running")]
    ServiceStopped,
}

/// Payload of a timer event.
#[derive(Debug, Clone, Copy)]
struct Tick {
    generation: u64,
}

struct Armed {
    owner: ThreadId,
    period: Duration,
    remaining: Option<u64>,
    generation: u64,
}

#[derive(Default)]
struct Schedule {
    deadlines: BinaryHeap<Reverse<(Instant, TimerId, u64)>>,
    armed: HashMap<TimerId, Armed>,
    closed: bool,
}

impl Schedule {
    /// Pops every deadline at or before `now`, rescheduling periodic timers.
    fn take_due(&mut self, now: Instant) -> Vec<(ThreadId, TimerId, u64)> {
        let mut due = Vec::new();
        while let Some(&Reverse((at, id, generation))) = self.deadlines.peek() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(armed) = self.armed.get_mut(&id) else {
                continue;
            };
            if armed.generation != generation {
                continue;
            }
            due.push((armed.owner, id, generation));
            match armed.remaining {
                Some(n) if n <= 1 => {
                    self.armed.remove(&id);
                }
                remaining => {
                    armed.remaining = remaining.map(|n| n - 1);
                    self.deadlines
                        .push(Reverse((at + armed.period, id, generation)));
                }
            }
        }
        due
    }
}

/// Process-wide timer thread.
pub(crate) struct TimerService {
    schedule: Mutex<Schedule>,
    wake: Condvar,
    next_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            schedule: Mutex::new(Schedule {
                closed: true,
                ..Schedule::default()
            }),
            wake: Condvar::new(),
            next_id: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self) -> TimerId {
        TimerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn arm(
        &self,
        id: TimerId,
        owner: ThreadId,
        period: Duration,
        count: TimerCount,
        generation: u64,
    ) -> Result<(), TimerError> {
        let mut schedule = self.lock();
        if schedule.closed {
            return Err(TimerError::ServiceStopped);
        }
        let remaining = match count {
            TimerCount::Times(n) => Some(n),
            TimerCount::Continuous => None,
        };
        schedule.armed.insert(
            id,
            Armed {
                owner,
                period,
                remaining,
                generation,
            },
        );
        schedule
            .deadlines
            .push(Reverse((Instant::now() + period, id, generation)));
        drop(schedule);
        self.wake.notify_one();
        Ok(())
    }

    fn cancel(&self, id: TimerId) {
        // Stale heap entries are skipped when they come due.
        self.lock().armed.remove(&id);
    }

    pub(crate) fn start(self: &Arc<Self>, runtime: WeakRuntime) -> io::Result<()> {
        self.lock().closed = false;
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tether-timer".into())
            .spawn(move || {
                info!("timer service started");
                this.run(&runtime);
                info!("timer service exiting");
            })?;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut schedule = self.lock();
            schedule.closed = true;
            schedule.armed.clear();
            schedule.deadlines.clear();
        }
        self.wake.notify_all();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Blocks until at least one timer is due. `None` once closed.
    fn wait_due(&self) -> Option<Vec<(ThreadId, TimerId, u64)>> {
        let mut schedule = self.lock();
        loop {
            if schedule.closed {
                return None;
            }
            let now = Instant::now();
            let next = schedule.deadlines.peek().map(|Reverse((at, _, _))| *at);
            schedule = match next {
                Some(at) if at <= now => {
                    let due = schedule.take_due(now);
                    if !due.is_empty() {
                        return Some(due);
                    }
                    continue;
                }
                Some(at) => {
                    self.wake
                        .wait_timeout(schedule, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.wake.wait(schedule).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn run(&self, runtime: &WeakRuntime) {
        while let Some(due) = self.wait_due() {
            let Some(runtime) = runtime.upgrade() else {
                return;
            };
            for (owner, id, generation) in due {
                trace!(%id, thread = %owner, "timer fired");
                let event = Event::new(signature(id))
                    .with_payload(Tick { generation })
                    .with_priority(Priority::TIMER)
                    .with_origin(Context::thread(owner));
                match runtime.send(event, Context::thread(owner)) {
                    Ok(()) => {}
                    Err(SendError::NoSubscribers { .. } | SendError::NotStarted(_)) => {
                        debug!(%id, "timer owner gone, cancelling");
                        self.cancel(id);
                    }
                    Err(e) => warn!(%id, error = %e, "timer tick not delivered"),
                }
            }
        }
    }
}

fn signature(id: TimerId) -> Signature {
    Signature::new(TIMER_TAG, id.0.to_string())
}

/// A timer owned by the current dispatch loop.
pub struct Timer {
    id: TimerId,
    consumer: ConsumerId,
    name: String,
    dispatcher: Dispatcher,
    on_tick: Box<dyn Fn(TimerId)>,
    generation: Cell<u64>,
    running: Cell<bool>,
    ticks: Cell<u64>,
    count: Cell<TimerCount>,
}

impl Timer {
    /// Creates a stopped timer whose ticks run `on_tick` on this thread.
    pub fn new(
        dispatcher: &Dispatcher,
        name: impl Into<String>,
        on_tick: impl Fn(TimerId) + 'static,
    ) -> Rc<Self> {
        let id = dispatcher.runtime().timers().allocate();
        let timer = dispatcher.register(|consumer| Self {
            id,
            consumer,
            name: name.into(),
            dispatcher: dispatcher.clone(),
            on_tick: Box::new(on_tick),
            generation: Cell::new(0),
            running: Cell::new(false),
            ticks: Cell::new(0),
            count: Cell::new(TimerCount::Continuous),
        });
        dispatcher.subscribe(signature(id), timer.consumer);
        timer
    }

    #[must_use]
    pub const fn id(&self) -> TimerId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Ticks delivered since the last `start`.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    /// Arms the timer.
    ///
    /// # Errors
    ///
    /// Refuses a zero period or count, a timer that is already running, or a
    /// runtime whose timer service is not running.
    pub fn start(&self, period: Duration, count: TimerCount) -> Result<(), TimerError> {
        if self.running.get() {
            warn!(timer = %self.id, name = %self.name, "timer already started");
            return Err(TimerError::AlreadyRunning);
        }
        if period.is_zero() {
            return Err(TimerError::ZeroPeriod);
        }
        if count == TimerCount::Times(0) {
            return Err(TimerError::ZeroCount);
        }
        let generation = self.generation.get() + 1;
        self.dispatcher.runtime().timers().arm(
            self.id,
            self.dispatcher.thread_id(),
            period,
            count,
            generation,
        )?;
        self.generation.set(generation);
        self.ticks.set(0);
        self.count.set(count);
        self.running.set(true);
        debug!(timer = %self.id, name = %self.name, period_us = period.as_micros() as u64, "timer started");
        Ok(())
    }

    /// Disarms the timer; ticks already queued are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NotRunning`] if the timer was not started.
    pub fn stop(&self) -> Result<(), TimerError> {
        if !self.running.get() {
            return Err(TimerError::NotRunning);
        }
        self.running.set(false);
        self.dispatcher.runtime().timers().cancel(self.id);
        Ok(())
    }
}

impl Consumer for Timer {
    fn process(&self, event: &Event) {
        let Some(tick) = event.data::<Tick>() else {
            return;
        };
        if !self.running.get() || tick.generation != self.generation.get() {
            trace!(timer = %self.id, "stale tick ignored");
            return;
        }
        let ticks = self.ticks.get() + 1;
        self.ticks.set(ticks);
        if let TimerCount::Times(n) = self.count.get() {
            if ticks >= n {
                self.running.set(false);
            }
        }
        (self.on_tick)(self.id);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.dispatcher.runtime().timers().cancel(self.id);
        self.dispatcher.deregister(self.consumer);
    }
}
