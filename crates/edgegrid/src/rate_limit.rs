use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// RateLimitInfo is the structured view of the `X-RateLimit-*` response
/// headers, carried on every response and on rate-limited errors.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Epoch instant at which the window resets.
    pub reset: Option<DateTime<Utc>>,
    /// Length of the enforcement window.
    pub window: Option<Duration>,
}

impl RateLimitInfo {
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let int = |name: &str| -> Option<u64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        };

        Self {
            limit: int("X-RateLimit-Limit"),
            remaining: int("X-RateLimit-Remaining"),
            reset: int("X-RateLimit-Reset")
                .and_then(|epoch| Utc.timestamp_opt(epoch as i64, 0).single()),
            window: int("X-RateLimit-Window").map(Duration::from_secs),
        }
    }

    /// True when the window is exhausted.
    pub fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// How long to wait before the window admits another request:
    /// until reset plus a one-second buffer, or a 60-second default when the
    /// window is exhausted with no advertised reset.
    pub fn wait_hint(&self, now: DateTime<Utc>) -> Option<Duration> {
        match (self.remaining, self.reset) {
            (Some(0), Some(reset)) => Some(
                (reset - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .saturating_add(Duration::from_secs(1)),
            ),
            (Some(0), None) => Some(Duration::from_secs(60)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use reqwest::header::HeaderMap;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn parses_all_headers() {
        let parsed = RateLimitInfo::from_headers(&headers(&[
            ("X-RateLimit-Limit", "100"),
            ("X-RateLimit-Remaining", "7"),
            ("X-RateLimit-Reset", "1704067200"),
            ("X-RateLimit-Window", "60"),
        ]));

        assert_eq!(parsed.limit, Some(100));
        assert_eq!(parsed.remaining, Some(7));
        assert_eq!(
            parsed.reset.unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(parsed.window, Some(Duration::from_secs(60)));
        assert!(!parsed.exhausted());
    }

    #[test]
    fn absent_headers_parse_to_none() {
        let parsed = RateLimitInfo::from_headers(&HeaderMap::new());
        assert_eq!(parsed, RateLimitInfo::default());
        assert_eq!(parsed.wait_hint(Utc::now()), None);
    }

    #[test]
    fn exhausted_waits_until_reset_plus_buffer() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let parsed = RateLimitInfo::from_headers(&headers(&[
            ("X-RateLimit-Remaining", "0"),
            ("X-RateLimit-Reset", "1704067230"), // now + 30s
        ]));

        assert!(parsed.exhausted());
        assert_eq!(parsed.wait_hint(now), Some(Duration::from_secs(31)));
    }

    #[test]
    fn exhausted_without_reset_defaults_to_a_minute() {
        let parsed = RateLimitInfo::from_headers(&headers(&[("X-RateLimit-Remaining", "0")]));
        assert_eq!(parsed.wait_hint(Utc::now()), Some(Duration::from_secs(60)));
    }
}
