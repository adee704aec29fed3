//! Single-threaded event reactor.
//!
//! Multiplexes readiness of OS descriptors with a set of timers:
//! - I/O sources live in a table indexed by descriptor number, so the table
//!   capacity bounds the largest descriptor that can be registered
//! - timers fire in due-time order; recurring timers reschedule relative to
//!   their previous due time
//! - before/after-sleep hooks run around the blocking wait
//!
//! Handlers receive `&mut EventLoop` and may register, unregister, cancel,
//! or stop from inside a callback. Anything a handler needs beyond that
//! (a client, a connection) is captured by the handler closure itself.

mod mask;
mod poller;
mod timer;

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

pub use self::mask::{Mask, ProcessFlags};
pub use self::poller::FiredEvent;
pub use self::timer::{TimerAction, TimerId};

use self::poller::Multiplexer;
use self::timer::{Timer, TimerQueue};

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("descriptor {fd} is outside the event table (capacity {capacity})")]
    OutOfRange { fd: RawFd, capacity: usize },

    #[error("multiplexer error: {0}")]
    Multiplexer(#[from] io::Error),

    #[error("cannot shrink event table to {requested}: descriptor {max_fd} is registered")]
    CapacityTooSmall { requested: usize, max_fd: RawFd },
}

/// I/O callback. Errors are logged and the loop carries on.
pub type IoHandler = Rc<RefCell<dyn FnMut(&mut EventLoop, RawFd, Mask) -> anyhow::Result<()>>>;

type SleepHook = Box<dyn FnMut(&mut EventLoop)>;

/// Stand-in due time for delays past what `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `from + delay`, clamped so huge delays never overflow.
fn deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

#[derive(Default)]
struct IoSource {
    mask: Mask,
    on_readable: Option<IoHandler>,
    on_writable: Option<IoHandler>,
}

struct RunningTimer {
    id: TimerId,
    cancelled: bool,
}

pub struct EventLoop {
    sources: Vec<IoSource>,
    /// Highest registered descriptor.
    max_fd: Option<RawFd>,
    mux: Multiplexer,
    fired: Vec<FiredEvent>,
    timers: TimerQueue,
    running_timer: Option<RunningTimer>,
    now: Instant,
    stop: bool,
    before_sleep: Option<SleepHook>,
    after_sleep: Option<SleepHook>,
}

impl EventLoop {
    /// Create a loop able to track descriptors `0..capacity`.
    pub fn new(capacity: usize) -> Result<Self, ReactorError> {
        let mux = Multiplexer::new(capacity)?;
        let mut sources = Vec::with_capacity(capacity);
        sources.resize_with(capacity, IoSource::default);
        debug!(capacity, backend = mux.backend_name(), "Event loop created");
        Ok(Self {
            sources,
            max_fd: None,
            mux,
            fired: Vec::with_capacity(capacity),
            timers: TimerQueue::default(),
            running_timer: None,
            now: Instant::now(),
            stop: false,
            before_sleep: None,
            after_sleep: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.sources.len()
    }

    pub fn max_fd(&self) -> Option<RawFd> {
        self.max_fd
    }

    /// Time snapshot taken at the start of the latest timer pass.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Current interest of `fd`; [`Mask::NONE`] if untracked or out of range.
    pub fn mask_of(&self, fd: RawFd) -> Mask {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.sources.get(idx))
            .map(|s| s.mask)
            .unwrap_or(Mask::NONE)
    }

    /// Change the table capacity. Fails if a registered descriptor would no
    /// longer fit.
    pub fn resize(&mut self, capacity: usize) -> Result<(), ReactorError> {
        if capacity == self.sources.len() {
            return Ok(());
        }
        if let Some(max_fd) = self.max_fd {
            if max_fd as usize >= capacity {
                return Err(ReactorError::CapacityTooSmall {
                    requested: capacity,
                    max_fd,
                });
            }
        }
        self.sources.resize_with(capacity, IoSource::default);
        self.sources.shrink_to_fit();
        self.fired = Vec::with_capacity(capacity);
        self.mux.resize(capacity);
        debug!(capacity, "Event table resized");
        Ok(())
    }

    fn slot(&self, fd: RawFd) -> Result<usize, ReactorError> {
        usize::try_from(fd)
            .ok()
            .filter(|idx| *idx < self.sources.len())
            .ok_or(ReactorError::OutOfRange {
                fd,
                capacity: self.sources.len(),
            })
    }

    /// Add interest in `mask` for `fd`, merging with any existing interest.
    ///
    /// The same handler is bound to every direction in `mask`; when bound to
    /// both it runs at most once per iteration.
    pub fn register_io<F>(&mut self, fd: RawFd, mask: Mask, handler: F) -> Result<(), ReactorError>
    where
        F: FnMut(&mut EventLoop, RawFd, Mask) -> anyhow::Result<()> + 'static,
    {
        self.register_io_handler(fd, mask, Rc::new(RefCell::new(handler)))
    }

    /// Like [`register_io`](Self::register_io) with an already shared
    /// handler, so one callback can serve several registrations.
    pub fn register_io_handler(
        &mut self,
        fd: RawFd,
        mask: Mask,
        handler: IoHandler,
    ) -> Result<(), ReactorError> {
        let idx = self.slot(fd)?;
        let old = self.sources[idx].mask;
        let merged = old | mask;
        if merged.io().is_none() {
            return Ok(());
        }

        if old.is_none() {
            self.mux.add(fd, merged)?;
        } else {
            self.mux.modify(fd, merged)?;
        }

        let source = &mut self.sources[idx];
        source.mask = merged;
        if mask.contains(Mask::READABLE) {
            source.on_readable = Some(Rc::clone(&handler));
        }
        if mask.contains(Mask::WRITABLE) {
            source.on_writable = Some(handler);
        }
        if self.max_fd.map_or(true, |max| fd > max) {
            self.max_fd = Some(fd);
        }
        trace!(fd, mask = ?merged, "Registered I/O source");
        Ok(())
    }

    /// Drop interest in `mask` for `fd`. Removing WRITABLE also clears
    /// BARRIER. Untracked or out-of-range descriptors are ignored.
    ///
    /// If the multiplexer refuses the new interest set, the source keeps its
    /// old mask and handlers, matching what the OS still reports. A failed
    /// delete leaves nothing registered on either side: the descriptor was
    /// already closed or unknown to the multiplexer.
    ///
    /// Unregister before closing the descriptor.
    pub fn unregister_io(&mut self, fd: RawFd, mask: Mask) -> Result<(), ReactorError> {
        let Ok(idx) = self.slot(fd) else {
            return Ok(());
        };
        let old = self.sources[idx].mask;
        if old.is_none() {
            return Ok(());
        }

        let mut mask = mask;
        if mask.contains(Mask::WRITABLE) {
            mask |= Mask::BARRIER;
        }
        let remaining = old.remove(mask);

        if remaining.io().is_none() {
            if let Err(e) = self.mux.delete(fd) {
                warn!(fd, error = %e, "Multiplexer delete failed, descriptor already gone");
            }
            self.sources[idx] = IoSource::default();
            if self.max_fd == Some(fd) {
                self.max_fd = (0..fd)
                    .rev()
                    .find(|&f| !self.sources[f as usize].mask.is_none());
            }
        } else {
            if let Err(e) = self.mux.modify(fd, remaining) {
                error!(fd, mask = ?old, error = %e, "Multiplexer modify failed, keeping registration");
                return Err(e.into());
            }
            let source = &mut self.sources[idx];
            source.mask = remaining;
            if !remaining.contains(Mask::READABLE) {
                source.on_readable = None;
            }
            if !remaining.contains(Mask::WRITABLE) {
                source.on_writable = None;
            }
        }
        trace!(fd, mask = ?remaining, "Unregistered I/O interest");
        Ok(())
    }

    /// Schedule `callback` to fire after `delay`.
    pub fn register_timer<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut EventLoop, TimerId) -> TimerAction + 'static,
    {
        self.insert_timer(delay, Box::new(callback), None)
    }

    /// Schedule `callback`; `finalizer` runs once when the timer is removed,
    /// whether it finished or was cancelled.
    pub fn register_timer_with_finalizer<F, G>(
        &mut self,
        delay: Duration,
        callback: F,
        finalizer: G,
    ) -> TimerId
    where
        F: FnMut(&mut EventLoop, TimerId) -> TimerAction + 'static,
        G: FnOnce(&mut EventLoop, TimerId) + 'static,
    {
        self.insert_timer(delay, Box::new(callback), Some(Box::new(finalizer)))
    }

    fn insert_timer(
        &mut self,
        delay: Duration,
        callback: timer::TimerProc,
        finalizer: Option<timer::TimerFinalizer>,
    ) -> TimerId {
        self.now = Instant::now();
        let id = self.timers.next_id();
        self.timers.insert(
            id,
            deadline(self.now, delay),
            Timer {
                callback,
                finalizer,
            },
        );
        trace!(timer = %id, delay_ms = delay.as_millis() as u64, "Registered timer");
        id
    }

    /// Cancel a timer. Returns `false` if no such timer is pending.
    /// A timer may cancel itself from its own callback.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        if let Some(running) = self.running_timer.as_mut() {
            if running.id == id {
                let first = !running.cancelled;
                running.cancelled = true;
                return first;
            }
        }
        match self.timers.remove(id) {
            Some(mut timer) => {
                if let Some(finalizer) = timer.finalizer.take() {
                    finalizer(self, id);
                }
                trace!(timer = %id, "Cancelled timer");
                true
            }
            None => false,
        }
    }

    pub fn set_before_sleep<F>(&mut self, hook: F)
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        self.before_sleep = Some(Box::new(hook));
    }

    pub fn set_after_sleep<F>(&mut self, hook: F)
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        self.after_sleep = Some(Box::new(hook));
    }

    /// Ask [`run`](Self::run) to return after the current iteration.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stop
    }

    /// Run iterations until [`stop`](Self::stop) is called.
    pub fn run(&mut self) {
        self.stop = false;
        while !self.stop {
            self.process_events(
                ProcessFlags::ALL_EVENTS
                    | ProcessFlags::CALL_BEFORE_SLEEP
                    | ProcessFlags::CALL_AFTER_SLEEP,
            );
        }
        debug!("Event loop stopped");
    }

    /// One iteration: wait for readiness (bounded by the nearest timer),
    /// dispatch ready descriptors in ascending order, then run due timers.
    /// Returns how many handlers and timers ran.
    ///
    /// # Panics
    ///
    /// On a multiplexer failure other than an interrupted wait.
    pub fn process_events(&mut self, flags: ProcessFlags) -> usize {
        let wants_files = flags.contains(ProcessFlags::FILE_EVENTS);
        let wants_timers = flags.contains(ProcessFlags::TIME_EVENTS);
        if !wants_files && !wants_timers {
            return 0;
        }
        let dont_wait = flags.contains(ProcessFlags::DONT_WAIT);
        let mut processed = 0;

        // With no descriptors we still sleep until the next timer.
        if self.max_fd.is_some() || (wants_timers && !dont_wait) {
            if flags.contains(ProcessFlags::CALL_BEFORE_SLEEP) {
                self.run_before_sleep();
            }

            let timeout = if dont_wait {
                Some(Duration::ZERO)
            } else if wants_timers {
                self.timers
                    .earliest()
                    .map(|due| due.saturating_duration_since(Instant::now()))
            } else {
                None
            };

            let mut fired = std::mem::take(&mut self.fired);
            fired.clear();
            if let Err(e) = self.mux.wait(timeout, &mut fired) {
                error!(error = %e, "Multiplexer wait failed");
                panic!("multiplexer wait failed: {e}");
            }

            if flags.contains(ProcessFlags::CALL_AFTER_SLEEP) {
                self.run_after_sleep();
            }

            if wants_files {
                fired.sort_unstable_by_key(|ev| ev.fd);
                for ev in &fired {
                    processed += self.dispatch(ev.fd, ev.mask);
                }
            }
            self.fired = fired;
        }

        if wants_timers {
            processed += self.process_timers();
        }
        processed
    }

    fn run_before_sleep(&mut self) {
        if let Some(mut hook) = self.before_sleep.take() {
            hook(self);
            // A hook installed by the hook itself wins.
            if self.before_sleep.is_none() {
                self.before_sleep = Some(hook);
            }
        }
    }

    fn run_after_sleep(&mut self) {
        if let Some(mut hook) = self.after_sleep.take() {
            hook(self);
            if self.after_sleep.is_none() {
                self.after_sleep = Some(hook);
            }
        }
    }

    fn dispatch(&mut self, fd: RawFd, fired: Mask) -> usize {
        let Ok(idx) = self.slot(fd) else {
            return 0;
        };
        let invert = self.sources[idx].mask.contains(Mask::BARRIER);
        let mut calls = 0;
        let mut first: Option<IoHandler> = None;

        if !invert {
            if let Some(h) = self.ready_handler(idx, fired, Mask::READABLE) {
                self.invoke(&h, fd, fired);
                first = Some(h);
                calls += 1;
            }
        }

        // Re-read the table: the readable handler may have changed it.
        if let Some(h) = self.ready_handler(idx, fired, Mask::WRITABLE) {
            if !first.as_ref().is_some_and(|f| Rc::ptr_eq(f, &h)) {
                self.invoke(&h, fd, fired);
                first.get_or_insert(h);
                calls += 1;
            }
        }

        if invert {
            if let Some(h) = self.ready_handler(idx, fired, Mask::READABLE) {
                if !first.as_ref().is_some_and(|f| Rc::ptr_eq(f, &h)) {
                    self.invoke(&h, fd, fired);
                    calls += 1;
                }
            }
        }
        calls
    }

    fn ready_handler(&self, idx: usize, fired: Mask, direction: Mask) -> Option<IoHandler> {
        let source = &self.sources[idx];
        if !(fired.contains(direction) && source.mask.contains(direction)) {
            return None;
        }
        if direction == Mask::READABLE {
            source.on_readable.clone()
        } else {
            source.on_writable.clone()
        }
    }

    fn invoke(&mut self, handler: &IoHandler, fd: RawFd, fired: Mask) {
        let mut callback = handler.borrow_mut();
        if let Err(e) = (&mut *callback)(self, fd, fired) {
            warn!(fd, mask = ?fired, "I/O handler failed: {e:#}");
        }
    }

    fn process_timers(&mut self) -> usize {
        self.now = Instant::now();
        // Collected up front: timers created while this pass runs wait for
        // the next iteration.
        let due = self.timers.due_by(self.now);
        let mut processed = 0;

        for (due_at, id) in due {
            let Some(mut timer) = self.timers.remove(id) else {
                // Cancelled by an earlier callback in this pass.
                continue;
            };
            self.running_timer = Some(RunningTimer {
                id,
                cancelled: false,
            });
            let action = (timer.callback)(self, id);
            let cancelled = self
                .running_timer
                .take()
                .is_some_and(|running| running.cancelled);
            processed += 1;

            match action {
                TimerAction::Again(interval) if !cancelled => {
                    self.timers.insert(id, deadline(due_at, interval), timer);
                }
                _ => {
                    if let Some(finalizer) = timer.finalizer.take() {
                        finalizer(self, id);
                    }
                    trace!(timer = %id, "Timer finished");
                }
            }
        }
        processed
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("capacity", &self.sources.len())
            .field("max_fd", &self.max_fd)
            .field("pending_timers", &self.timers.len())
            .field("stop", &self.stop)
            .finish()
    }
}
