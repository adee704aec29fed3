//! Timer storage ordered by due time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use super::EventLoop;

/// Identifier handed out by [`EventLoop::register_timer`]. Ids are assigned
/// in increasing order and never reused within one loop.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TimerId(pub(crate) u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned by a timer callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerAction {
    /// Remove the timer (running its finalizer).
    Done,
    /// Fire again this long after the previous due time.
    Again(Duration),
}

pub(crate) type TimerProc = Box<dyn FnMut(&mut EventLoop, TimerId) -> TimerAction>;
pub(crate) type TimerFinalizer = Box<dyn FnOnce(&mut EventLoop, TimerId)>;

pub(crate) struct Timer {
    pub callback: TimerProc,
    pub finalizer: Option<TimerFinalizer>,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    last_id: u64,
    by_due: BTreeMap<(Instant, TimerId), Timer>,
    due_of: HashMap<TimerId, Instant>,
}

impl TimerQueue {
    pub fn next_id(&mut self) -> TimerId {
        self.last_id += 1;
        TimerId(self.last_id)
    }

    pub fn insert(&mut self, id: TimerId, due: Instant, timer: Timer) {
        self.due_of.insert(id, due);
        self.by_due.insert((due, id), timer);
    }

    pub fn remove(&mut self, id: TimerId) -> Option<Timer> {
        let due = self.due_of.remove(&id)?;
        self.by_due.remove(&(due, id))
    }

    pub fn earliest(&self) -> Option<Instant> {
        self.by_due.keys().next().map(|(due, _)| *due)
    }

    /// Keys of every timer due at or before `now`, earliest first.
    pub fn due_by(&self, now: Instant) -> Vec<(Instant, TimerId)> {
        self.by_due
            .range(..=(now, TimerId(u64::MAX)))
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_due.len()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.due_of.contains_key(&id)
    }
}
