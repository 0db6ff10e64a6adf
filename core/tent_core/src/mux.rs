//! Event loop helpers shared by the coordinator and the peer
//!
//! mio delivers edge-triggered readiness. The loops latch it per entity in
//! [`Readiness`] and clear it only when the operation reports `WouldBlock`,
//! which lets each iteration service one unit of work per entity without
//! losing edges. Timeouts are cooperative [`Deadline`]s checked at the loop
//! head.

use std::time::{Duration, Instant};

use mio::event::Event;
use mio::Interest;

// ============================================================================
// Deadlines
// ============================================================================

/// Inactivity timer for one entity
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    last_activity: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    pub fn new(now: Instant, timeout: Option<Duration>) -> Self {
        Deadline {
            last_activity: now,
            timeout,
        }
    }

    /// Restart the timer from `now`
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Restart the timer with a new duration (`None` disarms it)
    pub fn set(&mut self, now: Instant, timeout: Option<Duration>) {
        self.last_activity = now;
        self.timeout = timeout;
    }

    #[cfg(test)]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time left before expiry; `None` when disarmed
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let timeout = self.timeout?;
        let elapsed = now.saturating_duration_since(self.last_activity);
        Some(timeout.saturating_sub(elapsed))
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.remaining(now) == Some(Duration::ZERO)
    }
}

/// Poll timeout: the default capped by the nearest armed deadline
pub fn next_timeout<I>(default: Duration, remaining: I) -> Duration
where
    I: IntoIterator<Item = Option<Duration>>,
{
    remaining.into_iter().flatten().fold(default, Duration::min)
}

// ============================================================================
// Readiness
// ============================================================================

/// Latched readiness of one registered source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    /// Merge an event into the latch
    pub fn absorb(&mut self, event: &Event) {
        // Hang-ups and errors surface through the next read
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.readable = true;
        }
        if event.is_writable() || event.is_write_closed() {
            self.writable = true;
        }
    }

    pub fn clear_read(&mut self) {
        self.readable = false;
    }

    pub fn clear_write(&mut self) {
        self.writable = false;
    }

    pub fn any(&self) -> bool {
        self.readable || self.writable
    }
}

/// Interest for a source that is always read and written on demand
pub fn interest(want_write: bool) -> Interest {
    if want_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}
