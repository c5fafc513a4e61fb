//! Sliding-window limiter on task starts.
//!
//! At most `max_starts` admissions are granted within any window of length
//! `window`. Admissions that did not lead to a started task are refunded.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shared start limiter for a worker pool.
#[derive(Debug)]
pub struct RateLimiter {
    max_starts: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `max_starts` per `window`.
    pub fn new(max_starts: usize, window: Duration) -> Self {
        Self {
            max_starts,
            window,
            starts: Mutex::new(VecDeque::with_capacity(max_starts)),
        }
    }

    /// Maximum admissions per window.
    pub fn max_starts(&self) -> usize {
        self.max_starts
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Tries to admit one start now.
    ///
    /// Returns the admission instant, to be passed to [`refund`](Self::refund)
    /// if no task ends up starting.
    pub fn try_acquire(&self) -> Option<Instant> {
        self.try_acquire_at(Instant::now())
    }

    /// Tries to admit one start at the given instant.
    pub fn try_acquire_at(&self, now: Instant) -> Option<Instant> {
        let mut starts = self.starts.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut starts, now);
        if starts.len() >= self.max_starts {
            return None;
        }
        starts.push_back(now);
        Some(now)
    }

    /// Returns an unused admission to the window.
    pub fn refund(&self, admitted_at: Instant) {
        let mut starts = self.starts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = starts.iter().rposition(|at| *at == admitted_at) {
            starts.remove(pos);
        }
    }

    /// Time until the next admission could succeed.
    pub fn retry_after(&self) -> Duration {
        self.retry_after_at(Instant::now())
    }

    /// Time until the next admission could succeed, seen from `now`.
    pub fn retry_after_at(&self, now: Instant) -> Duration {
        let mut starts = self.starts.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut starts, now);
        if starts.len() < self.max_starts {
            return Duration::ZERO;
        }
        starts
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Starts counted in the current window.
    pub fn in_window(&self) -> usize {
        let mut starts = self.starts.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut starts, Instant::now());
        starts.len()
    }

    fn evict(&self, starts: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = starts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                starts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denies_past_limit_within_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at(t0).is_some());
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(1)).is_some());
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(2)).is_none());
        assert_eq!(
            limiter.retry_after_at(t0 + Duration::from_secs(2)),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at(t0).is_some());
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(9_999)).is_none());
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(10)).is_some());
    }

    #[test]
    fn test_refund_frees_slot() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let admitted = limiter.try_acquire().expect("first admission");
        assert!(limiter.try_acquire().is_none());

        limiter.refund(admitted);
        assert_eq!(limiter.in_window(), 0);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_zero_limit_never_admits() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert!(limiter.try_acquire().is_none());
    }
}
