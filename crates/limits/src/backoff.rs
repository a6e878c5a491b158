use std::time::Duration;

/// Full-jitter exponential backoff: a uniformly random duration in
/// `[0, min(cap, base << attempt))`, with a small floor so attempt storms
/// never collapse to busy-waiting.
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    backoff_at(attempt, base, cap, rand::random::<f64>())
}

/// As `backoff`, with the jitter coin injected for deterministic tests.
/// `unit` must be in [0, 1).
pub fn backoff_at(attempt: u32, base: Duration, cap: Duration, unit: f64) -> Duration {
    debug_assert!((0.0..1.0).contains(&unit));

    let ceiling = base
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .unwrap_or(cap)
        .min(cap);

    let jittered = ceiling.mul_f64(unit);
    jittered.max(Duration::from_millis(10))
}
