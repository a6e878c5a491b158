//! A signed HTTP client for the edge control-plane APIs.
//!
//! Requests are authenticated with the EG1-HMAC-SHA256 keyed-MAC scheme,
//! retried with full-jitter backoff where safe, and surfaced with typed
//! errors, parsed RFC 7807 bodies, and a structured rate-limit snapshot.

mod client;
mod pagination;
mod rate_limit;
mod signer;

pub use client::{Client, Request, Response, Transport};
pub use pagination::{next_link, PageQuery};
pub use rate_limit::RateLimitInfo;
pub use signer::{authorization, Credentials, SigningMoment, DEFAULT_MAX_BODY};

use models::ProblemDetails;
use std::time::Duration;

/// Error is the typed failure surface of the signed client.
///
/// Retryable conditions (`Server`, `Transport`, `RateLimited`) are retried
/// internally and only escape once attempts are exhausted; everything else
/// surfaces immediately.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad request: {}", problem_summary(.0))]
    BadRequest(Option<ProblemDetails>),
    #[error("unauthorized: {}", problem_summary(.0))]
    Unauthorized(Option<ProblemDetails>),
    #[error("forbidden: {}", problem_summary(.0))]
    Forbidden(Option<ProblemDetails>),
    #[error("not found: {}", problem_summary(.0))]
    NotFound(Option<ProblemDetails>),
    #[error("conflict: {}", problem_summary(.0))]
    Conflict(Option<ProblemDetails>),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        info: RateLimitInfo,
        problem: Option<ProblemDetails>,
        retry_after: Duration,
    },
    #[error("server error with status {status}: {}", problem_summary(.problem))]
    Server {
        status: u16,
        problem: Option<ProblemDetails>,
    },
    #[error("transport error")]
    Transport(#[source] reqwest::Error),
    #[error("request deadline exceeded")]
    Timeout,
    #[error("host {host} is failing; circuit open for {retry_after:?}")]
    CircuitOpen { host: String, retry_after: Duration },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to decode response body")]
    Decode(#[source] serde_json::Error),
}

impl Error {
    /// Whether a fresh attempt of the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        // Transport covers connect refusals, resets, and per-attempt
        // timeouts; the client additionally gates retries on idempotency.
        matches!(
            self,
            Error::Server { .. }
                | Error::RateLimited { .. }
                | Error::CircuitOpen { .. }
                | Error::Transport(_)
        )
    }

    /// The attached problem document, if the response carried one.
    pub fn problem(&self) -> Option<&ProblemDetails> {
        match self {
            Error::BadRequest(p)
            | Error::Unauthorized(p)
            | Error::Forbidden(p)
            | Error::NotFound(p)
            | Error::Conflict(p) => p.as_ref(),
            Error::RateLimited { problem, .. } | Error::Server { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }

    /// Map a non-success status and optional problem body to an Error.
    /// `retry_after` applies only to 429.
    pub(crate) fn from_status(
        status: u16,
        problem: Option<ProblemDetails>,
        info: RateLimitInfo,
        retry_after: Duration,
    ) -> Self {
        match status {
            400 => Error::BadRequest(problem),
            401 => Error::Unauthorized(problem),
            403 => Error::Forbidden(problem),
            404 => Error::NotFound(problem),
            409 => Error::Conflict(problem),
            429 => Error::RateLimited {
                info,
                problem,
                retry_after,
            },
            status => Error::Server { status, problem },
        }
    }
}

fn problem_summary(problem: &Option<ProblemDetails>) -> String {
    match problem {
        Some(p) => p.to_string(),
        None => "no problem detail".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (400, "bad request"),
            (401, "unauthorized"),
            (403, "forbidden"),
            (404, "not found"),
            (409, "conflict"),
            (500, "server error"),
            (503, "server error"),
        ];
        for (status, needle) in cases {
            let err = Error::from_status(
                status,
                None,
                RateLimitInfo::default(),
                Duration::from_secs(1),
            );
            assert!(
                err.to_string().contains(needle),
                "{status} -> {err}, wanted {needle}"
            );
        }
    }

    #[test]
    fn retryability() {
        let server = Error::from_status(502, None, RateLimitInfo::default(), Duration::ZERO);
        assert!(server.is_retryable());

        let limited = Error::from_status(429, None, RateLimitInfo::default(), Duration::ZERO);
        assert!(limited.is_retryable());

        let not_found = Error::from_status(404, None, RateLimitInfo::default(), Duration::ZERO);
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn problem_is_attached_and_rendered() {
        let problem: ProblemDetails = serde_json::from_value(serde_json::json!({
            "title": "Invalid purge object",
        }))
        .unwrap();
        let err = Error::from_status(
            400,
            Some(problem),
            RateLimitInfo::default(),
            Duration::ZERO,
        );
        assert_eq!(err.to_string(), "bad request: Invalid purge object");
        assert_eq!(err.problem().unwrap().summary(), "Invalid purge object");
    }
}
