//! Monotonic time source for the engine.
//!
//! All deadlines in the core (probe expiry, flow-memory expiry) are
//! `Duration` offsets from the engine epoch, so wall-clock adjustments
//! never affect expiry. Deferred work is scheduled on the tokio runtime
//! by the engine itself; the clock only answers "how long have we been
//! running".

use std::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Monotonic time since the engine epoch.
    pub fn now(&self) -> std::time::Duration {
        self.epoch.elapsed()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
