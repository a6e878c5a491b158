use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// SlidingWindow admits at most `limit` operations within any trailing
/// `window`. Timestamps of admitted operations are pruned lazily.
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        assert!(limit > 0);
        Self {
            limit,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Admit one operation now, or report false if the window is full.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Duration until the next slot frees, or zero if a slot is free now.
    pub fn retry_after(&self) -> Duration {
        self.retry_after_at(Instant::now())
    }

    /// Fraction of the window currently in use, in [0, 1].
    pub fn utilization(&self) -> f64 {
        let mut admitted = self.admitted.lock().unwrap();
        Self::prune(&mut admitted, Instant::now(), self.window);
        admitted.len() as f64 / self.limit as f64
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        let mut admitted = self.admitted.lock().unwrap();
        Self::prune(&mut admitted, now, self.window);

        if admitted.len() < self.limit {
            admitted.push_back(now);
            true
        } else {
            false
        }
    }

    pub(crate) fn retry_after_at(&self, now: Instant) -> Duration {
        let mut admitted = self.admitted.lock().unwrap();
        Self::prune(&mut admitted, now, self.window);

        if admitted.len() < self.limit {
            Duration::ZERO
        } else {
            // The oldest admission ages out first.
            (admitted[0] + self.window).saturating_duration_since(now)
        }
    }

    fn prune(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&front) = admitted.front() {
            if now.saturating_duration_since(front) >= window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn admits_limit_within_window() {
        let limiter = SlidingWindow::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(1)));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(2)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(30)));

        // The first admission ages out at t0+60s.
        let retry = limiter.retry_after_at(t0 + Duration::from_secs(30));
        assert_eq!(retry, Duration::from_secs(30));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn slides_rather_than_resets() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(9)));

        // t0 ages out at +10s, the second admission only at +19s.
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(10)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(11)));
    }
}
