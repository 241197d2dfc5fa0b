//! Timer and request bookkeeping for the single-threaded controller.
//!
//! Nothing here spawns or sleeps; the owner passes `Instant`s in and decides
//! when to act, which keeps both types deterministic under test.

use std::time::{Duration, Instant};

/// A cancellable one-shot timer. Scheduling while armed pushes the deadline
/// out, so a burst of calls collapses into a single firing after the last.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true exactly once per armed period, when `now` has reached the
    /// deadline.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Hands out request ids for one stream of requests and remembers the newest
/// outstanding one. Responses for any other id are stale.
#[derive(Debug, Clone, Default)]
pub struct LatestRequest {
    next_id: u64,
    outstanding: Option<u64>,
}

impl LatestRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> u64 {
        self.next_id += 1;
        self.outstanding = Some(self.next_id);
        self.next_id
    }

    pub fn is_pending(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Accepts the response for `id` if it is the newest outstanding request,
    /// and marks the stream idle.
    pub fn complete(&mut self, id: u64) -> bool {
        if self.outstanding == Some(id) {
            self.outstanding = None;
            true
        } else {
            false
        }
    }

    pub fn abandon(&mut self) {
        self.outstanding = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_collapses_into_one_firing() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(300));
        for step in 0..5u64 {
            debouncer.schedule(start + Duration::from_millis(step * 100));
        }
        assert!(!debouncer.fire_if_due(start + Duration::from_millis(500)));
        assert!(!debouncer.fire_if_due(start + Duration::from_millis(699)));
        assert!(debouncer.fire_if_due(start + Duration::from_millis(700)));
        assert!(!debouncer.fire_if_due(start + Duration::from_millis(900)));
        assert!(!debouncer.is_armed());
    }

    #[test]
    fn cancel_disarms() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(10));
        debouncer.schedule(start);
        debouncer.cancel();
        assert!(!debouncer.fire_if_due(start + Duration::from_secs(1)));
    }

    #[test]
    fn only_latest_request_completes() {
        let mut latest = LatestRequest::new();
        let first = latest.issue();
        let second = latest.issue();
        assert!(!latest.complete(first));
        assert!(latest.is_pending());
        assert!(latest.complete(second));
        assert!(!latest.is_pending());
        assert!(!latest.complete(second));
    }
}
