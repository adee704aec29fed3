//! OS multiplexer backend: a level-triggered `polling::Poller`
//! (epoll on Linux, kqueue on the BSDs and macOS).

use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use polling::{Event, Events, PollMode, Poller};

use super::mask::Mask;

/// A descriptor reported ready by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredEvent {
    pub fd: RawFd,
    pub mask: Mask,
}

pub(crate) struct Multiplexer {
    poller: Poller,
    events: Events,
}

impl Multiplexer {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            events: Events::with_capacity(non_zero(capacity)),
        })
    }

    /// Grow or shrink the per-wait event buffer.
    pub fn resize(&mut self, capacity: usize) {
        self.events = Events::with_capacity(non_zero(capacity));
    }

    fn interest(fd: RawFd, mask: Mask) -> Event {
        let key = fd as usize;
        match (mask.contains(Mask::READABLE), mask.contains(Mask::WRITABLE)) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }

    /// Start tracking `fd`.
    pub fn add(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
        // SAFETY: the event loop only tracks descriptors the caller registered
        // and requires them to stay open until unregistered.
        unsafe {
            self.poller
                .add_with_mode(fd, Self::interest(fd, mask), PollMode::Level)
        }
    }

    /// Replace the interest of an already tracked `fd`.
    pub fn modify(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
        // SAFETY: see `add`; the descriptor is still registered and open.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .modify_with_mode(borrowed, Self::interest(fd, mask), PollMode::Level)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: see `add`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.delete(borrowed)
    }

    /// Block for at most `timeout` (forever when `None`) and append every
    /// ready descriptor to `fired`.
    pub fn wait(&mut self, timeout: Option<Duration>, fired: &mut Vec<FiredEvent>) -> io::Result<()> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            let mut mask = Mask::NONE;
            if event.readable {
                mask |= Mask::READABLE;
            }
            if event.writable {
                mask |= Mask::WRITABLE;
            }
            if !mask.is_none() {
                fired.push(FiredEvent {
                    fd: event.key as RawFd,
                    mask,
                });
            }
        }
        Ok(())
    }

    pub fn backend_name(&self) -> &'static str {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            "epoll"
        } else {
            "kqueue"
        }
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}
