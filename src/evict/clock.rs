//! LRU clock and LFU counter arithmetic for the 24-bit object access field.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Width of the access field.
pub const ACCESS_BITS: u32 = 24;
pub const LRU_CLOCK_MAX: u32 = (1 << ACCESS_BITS) - 1;
/// Milliseconds per LRU clock tick.
pub const LRU_CLOCK_RESOLUTION_MS: u64 = 1000;

/// Counter value of a freshly created key, so new keys are not evicted
/// before they had a chance to be accessed.
pub const LFU_INIT_VAL: u8 = 5;

/// Wall-clock snapshot the engine refreshes on every cron tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Clock {
    unix_ms: u64,
}

impl Clock {
    pub fn now() -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { unix_ms }
    }

    pub fn from_unix_ms(unix_ms: u64) -> Self {
        Self { unix_ms }
    }

    pub fn unix_ms(&self) -> u64 {
        self.unix_ms
    }

    /// Current LRU clock value (seconds, wrapping at 24 bits).
    pub fn lru(&self) -> u32 {
        ((self.unix_ms / LRU_CLOCK_RESOLUTION_MS) & LRU_CLOCK_MAX as u64) as u32
    }

    /// Minutes since the epoch, wrapping at 16 bits.
    pub fn minutes(&self) -> u16 {
        ((self.unix_ms / 1000 / 60) & 0xFFFF) as u16
    }
}

/// Approximate milliseconds since an object stamped with `lru` was touched.
/// Handles a single wrap of the clock.
pub fn idle_ms(clock: &Clock, lru: u32) -> u64 {
    let now = clock.lru();
    let ticks = if now >= lru {
        (now - lru) as u64
    } else {
        (now as u64 + LRU_CLOCK_MAX as u64) - lru as u64
    };
    ticks * LRU_CLOCK_RESOLUTION_MS
}

/// Access field of a new object under an LFU policy.
pub fn lfu_init(clock: &Clock) -> u32 {
    ((clock.minutes() as u32) << 8) | LFU_INIT_VAL as u32
}

fn lfu_minutes(access: u32) -> u16 {
    (access >> 8) as u16
}

fn lfu_counter(access: u32) -> u8 {
    (access & 0xFF) as u8
}

/// Minutes elapsed since `then`, accounting for one 16-bit wrap.
fn minutes_elapsed(clock: &Clock, then: u16) -> u32 {
    let now = clock.minutes();
    if now >= then {
        (now - then) as u32
    } else {
        65_535 - then as u32 + now as u32
    }
}

/// Counter after applying decay for the time since the last access,
/// without writing it back.
pub fn lfu_decayed(access: u32, clock: &Clock, decay_minutes: u32) -> u8 {
    let counter = lfu_counter(access);
    if decay_minutes == 0 {
        return counter;
    }
    let periods = minutes_elapsed(clock, lfu_minutes(access)) / decay_minutes;
    counter.saturating_sub(periods.min(255) as u8)
}

/// Logarithmic increment: the higher the counter, the less likely a hit
/// bumps it. Saturates at 255.
pub fn lfu_log_incr<R: Rng>(counter: u8, log_factor: u8, rng: &mut R) -> u8 {
    if counter == u8::MAX {
        return counter;
    }
    let base = counter.saturating_sub(LFU_INIT_VAL) as f64;
    let p = 1.0 / (base * log_factor as f64 + 1.0);
    if rng.gen::<f64>() < p {
        counter + 1
    } else {
        counter
    }
}

/// Access field after a hit under an LFU policy: decay, then increment,
/// then restamp the minutes.
pub fn lfu_touch<R: Rng>(access: u32, clock: &Clock, log_factor: u8, decay_minutes: u32, rng: &mut R) -> u32 {
    let counter = lfu_decayed(access, clock, decay_minutes);
    let counter = lfu_log_incr(counter, log_factor, rng);
    ((clock.minutes() as u32) << 8) | counter as u32
}
