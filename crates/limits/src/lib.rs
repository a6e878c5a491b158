//! Small time-based admission primitives shared by the signed HTTP client
//! and the purge pipeline. None of these spawn background tasks: state is
//! advanced lazily from the caller's clock, which keeps them trivially
//! testable with an injected `Instant`.

mod backoff;
mod circuit_breaker;
mod sliding_window;
mod token_bucket;

pub use backoff::{backoff, backoff_at};
pub use circuit_breaker::{Admission, CircuitBreaker};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;
