//! Trailing-edge rate limiter.
//!
//! The first value pushed opens a window. Values pushed while the window is
//! open replace the pending one. When the window closes the latest value is
//! released, so at most one value leaves per window and the final value is
//! never lost. Nothing is released on the leading edge.
//!
//! Time is passed in by the caller, which keeps the limiter free of timers
//! and deterministic under test.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record the latest value.
    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// Release the pending value if its window has closed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// When the pending value is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the pending value without releasing it.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
