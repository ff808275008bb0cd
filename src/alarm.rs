//! One-shot timer polled from the cooperative loop.
//!
//! Setting a new timeout replaces the previous one. Whatever the payload
//! triggers is checked against current state when it fires, so a late or
//! superseded alarm is harmless.

use embassy_time::{Duration, Instant};

pub struct Alarm<E> {
    deadline: Option<(Instant, E)>,
}

impl<E: Copy> Alarm<E> {
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    pub fn set_timeout(&mut self, now: Instant, after: Duration, payload: E) {
        self.deadline = Some((now + after, payload));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some((at, _)) if now >= at)
    }

    /// Fire the alarm if its deadline has passed, disarming it
    pub fn poll(&mut self, now: Instant) -> Option<E> {
        if !self.is_due(now) {
            return None;
        }
        self.deadline.take().map(|(_, payload)| payload)
    }
}

impl<E: Copy> Default for Alarm<E> {
    fn default() -> Self {
        Self::new()
    }
}
