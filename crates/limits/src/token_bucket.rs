use std::sync::Mutex;
use std::time::{Duration, Instant};

/// TokenBucket admits bursts up to `capacity` and refills continuously at
/// `refill_per_sec`. Refill is computed from elapsed time on each call.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<State>,
}

struct State {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens which refills at
    /// `refill_per_sec` tokens per second.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        assert!(refill_per_sec > 0.0);
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(State {
                tokens: capacity as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens if available. Tokens are not partially consumed.
    pub fn try_acquire(&self, n: u32) -> bool {
        self.try_acquire_at(n, Instant::now())
    }

    /// Duration until `n` tokens will be available, or zero if they already
    /// are. Does not consume.
    pub fn time_to_available(&self, n: u32) -> Duration {
        self.time_to_available_at(n, Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, n: u32, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, now);

        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    pub(crate) fn time_to_available_at(&self, n: u32, now: Instant) -> Duration {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, now);

        let deficit = n as f64 - state.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }

    fn refill(&self, state: &mut State, now: Instant) {
        let elapsed = now.saturating_duration_since(state.refilled_at);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.refilled_at = now;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn burst_then_refill() {
        let bucket = TokenBucket::new(50, 100.0 / 60.0);
        let t0 = Instant::now();

        // The full burst is admitted, then the bucket is dry.
        for _ in 0..50 {
            assert!(bucket.try_acquire_at(1, t0));
        }
        assert!(!bucket.try_acquire_at(1, t0));

        // 100/min refill: after 600ms one token is back.
        assert!(bucket.try_acquire_at(1, t0 + Duration::from_millis(700)));
        assert!(!bucket.try_acquire_at(1, t0 + Duration::from_millis(700)));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(5, 1000.0);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(5, t0));

        // A long idle period refills to capacity, not beyond.
        let later = t0 + Duration::from_secs(3600);
        assert!(bucket.try_acquire_at(5, later));
        assert!(!bucket.try_acquire_at(1, later));
    }

    #[test]
    fn time_to_available_reports_deficit() {
        let bucket = TokenBucket::new(1, 2.0);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(1, t0));

        let wait = bucket.time_to_available_at(1, t0);
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(500));
        assert_eq!(
            bucket.time_to_available_at(1, t0 + Duration::from_secs(1)),
            Duration::ZERO
        );
    }
}
