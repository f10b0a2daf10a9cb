//! Strict-priority FIFO inbox with blocking consumption.
//!
//! ```text
//!   lane N-1  [ a3 a4 ]        <- served first
//!   ...
//!   lane 1    [ ]
//!   lane 0    [ b1 b2 b3 ]     <- served only when every higher lane is empty
//! ```
//!
//! `pop` returns the oldest item of the highest non-empty lane. There is no
//! aging: a steady stream of high-priority items defers lower lanes
//! indefinitely.
//!
//! Any number of threads may `insert`; one thread (the owning loop) pops.
//! A frozen inbox refuses inserts and holds back pops until unfrozen. A
//! closed inbox refuses inserts and wakes the popper with `None`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

use crate::trace::trace;
use crate::types::Priority;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Items that know which lane they belong to.
pub trait Prioritized {
    fn priority(&self) -> Priority;
}

/// Reason an insert was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InboxError {
    #[error("inbox is frozen")]
    Frozen,
    #[error("inbox is closed")]
    Closed,
}

struct Lanes<T> {
    lanes: Vec<VecDeque<T>>,
    len: usize,
    frozen: bool,
    closed: bool,
}

impl<T> Lanes<T> {
    fn take_front(&mut self) -> Option<T> {
        let item = self.lanes.iter_mut().rev().find_map(VecDeque::pop_front)?;
        self.len -= 1;
        Some(item)
    }
}

/// Thread-safe priority inbox.
pub struct PriorityInbox<T> {
    state: Mutex<Lanes<T>>,
    ready: Condvar,
}

impl<T: Prioritized> PriorityInbox<T> {
    /// Creates an inbox with `max_priority` lanes (at least one).
    #[must_use]
    pub fn new(max_priority: usize) -> Self {
        let lanes = (0..max_priority.max(1)).map(|_| VecDeque::new()).collect();
        Self {
            state: Mutex::new(Lanes {
                lanes,
                len: 0,
                frozen: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item` to its priority lane.
    ///
    /// Priorities beyond the configured lane count are clamped to the top lane.
    ///
    /// # Errors
    ///
    /// Returns the refusal reason if the inbox is frozen or closed; the item
    /// is dropped.
    pub fn insert(&self, item: T) -> Result<(), InboxError> {
        let mut state = self.lock();
        if state.closed {
            return Err(InboxError::Closed);
        }
        if state.frozen {
            return Err(InboxError::Frozen);
        }
        let top = state.lanes.len() - 1;
        let requested = usize::from(item.priority().0);
        if requested > top {
            trace!(requested, top, "priority clamped to top lane");
        }
        state.lanes[requested.min(top)].push_back(item);
        state.len += 1;
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Removes and returns the next item, blocking while the inbox is empty
    /// or frozen.
    ///
    /// Returns `None` when the timeout elapses or the inbox is closed.
    pub fn pop(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if !state.frozen {
                if let Some(item) = state.take_front() {
                    return Some(item);
                }
            }
            state = match deadline {
                None => self.ready.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Non-blocking pop.
    #[cfg(test)]
    fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        if state.closed || state.frozen {
            return None;
        }
        state.take_front()
    }

    /// Drops every queued item.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.lanes.iter_mut().for_each(VecDeque::clear);
        state.len = 0;
    }

    pub fn freeze(&self) {
        self.lock().frozen = true;
    }

    pub fn unfreeze(&self) {
        self.lock().frozen = false;
        self.ready.notify_all();
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// Refuses further inserts and wakes the popper.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Re-opens a closed inbox, discarding anything left in it.
    pub fn reopen(&self) {
        let mut state = self.lock();
        state.lanes.iter_mut().for_each(VecDeque::clear);
        state.len = 0;
        state.closed = false;
        state.frozen = false;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
