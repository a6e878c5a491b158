use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admission is the breaker's decision for one call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the call.
    Allowed,
    /// The breaker is open. Retry after the embedded duration.
    Rejected(Duration),
}

#[derive(Debug)]
enum State {
    /// Healthy, counting consecutive failures.
    Closed { failures: u32 },
    /// Tripped at the embedded instant. Calls are rejected until cooldown
    /// elapses, then a single probe is admitted.
    Open { tripped_at: Instant },
    /// A probe call is in flight. Its outcome closes or re-opens.
    HalfOpen,
}

/// CircuitBreaker trips after `failure_threshold` consecutive failures and
/// admits a single probe after `cooldown`.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        assert!(failure_threshold > 0);
        Self {
            failure_threshold,
            cooldown,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        *state = State::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub(crate) fn admit_at(&self, now: Instant) -> Admission {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } => Admission::Allowed,
            State::Open { tripped_at } => {
                let elapsed = now.saturating_duration_since(tripped_at);
                if elapsed >= self.cooldown {
                    *state = State::HalfOpen;
                    Admission::Allowed
                } else {
                    Admission::Rejected(self.cooldown - elapsed)
                }
            }
            // One probe at a time; concurrent calls wait out the probe.
            State::HalfOpen => Admission::Rejected(self.cooldown),
        }
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    *state = State::Open { tripped_at: now };
                } else {
                    *state = State::Closed { failures };
                }
            }
            // A failed probe re-opens with a fresh cooldown.
            State::HalfOpen => *state = State::Open { tripped_at: now },
            State::Open { .. } => (),
        }
    }

    /// True when the breaker is currently rejecting calls.
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Open { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trips_after_threshold_and_recovers_via_probe() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        let t0 = Instant::now();

        breaker.record_failure_at(t0);
        breaker.record_failure_at(t0);
        assert_eq!(breaker.admit_at(t0), Admission::Allowed);

        breaker.record_failure_at(t0);
        let Admission::Rejected(wait) = breaker.admit_at(t0 + Duration::from_secs(4)) else {
            panic!("expected rejection");
        };
        assert_eq!(wait, Duration::from_secs(6));

        // Cooldown elapses: one probe is admitted, concurrent calls are not.
        assert_eq!(
            breaker.admit_at(t0 + Duration::from_secs(10)),
            Admission::Allowed
        );
        assert!(matches!(
            breaker.admit_at(t0 + Duration::from_secs(10)),
            Admission::Rejected(_)
        ));

        breaker.record_success();
        assert_eq!(
            breaker.admit_at(t0 + Duration::from_secs(10)),
            Admission::Allowed
        );
        assert!(!breaker.is_open());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        let t0 = Instant::now();

        breaker.record_failure_at(t0);
        assert_eq!(
            breaker.admit_at(t0 + Duration::from_secs(5)),
            Admission::Allowed
        );
        breaker.record_failure_at(t0 + Duration::from_secs(5));

        assert!(matches!(
            breaker.admit_at(t0 + Duration::from_secs(9)),
            Admission::Rejected(_)
        ));
        assert_eq!(
            breaker.admit_at(t0 + Duration::from_secs(10)),
            Admission::Allowed
        );
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        let t0 = Instant::now();

        breaker.record_failure_at(t0);
        breaker.record_success();
        breaker.record_failure_at(t0);
        assert_eq!(breaker.admit_at(t0), Admission::Allowed);
    }
}
