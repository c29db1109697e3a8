//! # Clock and Timers
//!
//! Every wait in the duel logic is a [`Timer`] checked on the tick against a
//! [`Clock`]. Expiry is strict: a timer armed for `d` ms at `t` expires once
//! `now - t > d`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Millisecond time source.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Wall clock measured from construction.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Starts counting from now.
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One-shot timer polled against a clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    started_ms: u64,
    duration_ms: u64,
    running: bool,
}

impl Timer {
    /// Arms the timer.
    pub fn start(&mut self, now_ms: u64, duration_ms: u64) {
        self.started_ms = now_ms;
        self.duration_ms = duration_ms;
        self.running = true;
    }

    /// Disarms the timer; it will not report expiry until restarted.
    pub fn invalidate(&mut self) {
        self.running = false;
    }

    /// True if armed and strictly past its duration.
    #[inline]
    #[must_use]
    pub const fn expired(&self, now_ms: u64) -> bool {
        self.running && now_ms.saturating_sub(self.started_ms) > self.duration_ms
    }
}
