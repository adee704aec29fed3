//! Readiness masks and loop flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Readiness interest of a registered source.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Mask = Mask(0);
    pub const READABLE: Mask = Mask(1);
    pub const WRITABLE: Mask = Mask(2);
    /// Fire the writable handler before the readable one for this source.
    /// Lets a reply be flushed (and the connection torn down) before a
    /// pending read is serviced in the same iteration.
    pub const BARRIER: Mask = Mask(4);

    pub fn contains(self, other: Mask) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(self, other: Mask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(self, other: Mask) -> Mask {
        Mask(self.0 & !other.0)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Only the READABLE/WRITABLE bits, which is what the OS sees.
    pub fn io(self) -> Mask {
        Mask(self.0 & (Self::READABLE.0 | Self::WRITABLE.0))
    }
}

impl BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "NONE");
        }
        let mut parts = Vec::with_capacity(3);
        if self.contains(Mask::READABLE) {
            parts.push("READABLE");
        }
        if self.contains(Mask::WRITABLE) {
            parts.push("WRITABLE");
        }
        if self.contains(Mask::BARRIER) {
            parts.push("BARRIER");
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// What a single [`EventLoop::process_events`] call should do.
///
/// [`EventLoop::process_events`]: super::EventLoop::process_events
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ProcessFlags(u8);

impl ProcessFlags {
    pub const FILE_EVENTS: ProcessFlags = ProcessFlags(1);
    pub const TIME_EVENTS: ProcessFlags = ProcessFlags(2);
    pub const ALL_EVENTS: ProcessFlags = ProcessFlags(1 | 2);
    /// Poll without blocking.
    pub const DONT_WAIT: ProcessFlags = ProcessFlags(4);
    pub const CALL_BEFORE_SLEEP: ProcessFlags = ProcessFlags(8);
    pub const CALL_AFTER_SLEEP: ProcessFlags = ProcessFlags(16);

    pub fn contains(self, other: ProcessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ProcessFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ProcessFlags {
    type Output = ProcessFlags;

    fn bitor(self, rhs: ProcessFlags) -> ProcessFlags {
        ProcessFlags(self.0 | rhs.0)
    }
}
