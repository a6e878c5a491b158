use crate::{authorization, Credentials, Error, RateLimitInfo, SigningMoment};
use limits::{Admission, CircuitBreaker};
use models::ProblemDetails;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Total budget for a single attempt, excluding retries and backoff.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(16);

// A host this many consecutive transport failures deep is likely down;
// fail fast until a probe succeeds.
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Transport is the process-wide HTTP machinery shared by every per-call
/// [`Client`]: one pooled reqwest client (keep-alive connections are
/// per-host inside it, so tenants with distinct hosts never share a
/// connection) and a circuit breaker per API host.
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl Transport {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("building the shared HTTP client cannot fail");

        Self {
            http,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn breaker(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN)))
            .clone()
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

/// Client binds one tenant's credentials to the shared transport for the
/// scope of a single operation. Construction is cheap: connection pools
/// live in the transport.
pub struct Client {
    transport: Transport,
    creds: Arc<Credentials>,
    concurrency: Option<Arc<tokio::sync::Semaphore>>,
    attempt_timeout: Duration,
}

impl Client {
    pub fn new(transport: Transport, creds: Arc<Credentials>) -> Self {
        Self {
            transport,
            creds,
            concurrency: None,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    /// Bound in-flight requests issued through this client. The semaphore
    /// is shared per tenant by the context layer.
    pub fn with_concurrency(mut self, semaphore: Arc<tokio::sync::Semaphore>) -> Self {
        self.concurrency = Some(semaphore);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.creds.host
    }

    /// Issue `req`, signing each attempt freshly and retrying retryable
    /// failures of idempotent requests with full-jitter backoff.
    #[tracing::instrument(
        skip(self, req),
        fields(method = %req.method, path = %req.path, host = %self.creds.host),
        err,
    )]
    pub async fn send(&self, req: Request) -> Result<Response, Error> {
        let relative = req.relative_url(&self.creds)?;
        let url = url::Url::parse(&format!("https://{}{relative}", self.creds.host))
            .map_err(|err| Error::InvalidRequest(err.to_string()))?;
        let retryable_method = req.is_retryable_method();
        let breaker = self.transport.breaker(&self.creds.host);

        let mut attempt: u32 = 0;
        loop {
            if let Some(deadline) = req.deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
            }

            if let Admission::Rejected(retry_after) = breaker.admit() {
                return Err(Error::CircuitOpen {
                    host: self.creds.host.clone(),
                    retry_after,
                });
            }

            let permit = match &self.concurrency {
                Some(semaphore) => Some(
                    semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("tenant semaphore is never closed"),
                ),
                None => None,
            };
            let outcome = self.attempt(&req, &relative, url.clone()).await;
            drop(permit);

            match outcome {
                Ok(response) => {
                    breaker.record_success();
                    return Ok(response);
                }
                Err(err) => {
                    if matches!(err, Error::Transport(_)) {
                        breaker.record_failure();
                    } else {
                        breaker.record_success();
                    }

                    attempt += 1;
                    if !retryable_method || !err.is_retryable() || attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }

                    let wait = match &err {
                        Error::RateLimited { retry_after, .. } => *retry_after,
                        _ => limits::backoff(attempt - 1, BACKOFF_BASE, BACKOFF_CAP),
                    };
                    if let Some(deadline) = req.deadline {
                        if Instant::now() + wait >= deadline {
                            return Err(Error::Timeout);
                        }
                    }

                    tracing::debug!(attempt, ?wait, error = %err, "retrying request");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Issue `req` and decode a JSON response body.
    pub async fn send_json<T: serde::de::DeserializeOwned>(&self, req: Request) -> Result<T, Error> {
        self.send(req).await?.json()
    }

    async fn attempt(
        &self,
        req: &Request,
        relative: &str,
        url: url::Url,
    ) -> Result<Response, Error> {
        let moment = SigningMoment::mint();
        let auth = authorization(
            &self.creds,
            req.method.as_str(),
            relative,
            &req.headers,
            req.body.as_deref(),
            &moment,
        );

        let timeout = match req.deadline {
            Some(deadline) => self
                .attempt_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.attempt_timeout,
        };

        let mut builder = self
            .transport
            .http
            .request(req.method.clone(), url)
            .timeout(timeout)
            .header(reqwest::header::AUTHORIZATION, auth);

        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(content_type) = &req.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(Error::Transport)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let rate_limit = RateLimitInfo::from_headers(&headers);
        let body = response.bytes().await.map_err(Error::Transport)?;

        if (200..300).contains(&status) {
            return Ok(Response {
                status,
                headers,
                body,
                rate_limit,
            });
        }

        let retry_after = retry_after(&headers)
            .or_else(|| rate_limit.wait_hint(chrono::Utc::now()))
            .unwrap_or(Duration::from_secs(60));
        let problem = parse_problem(&body);

        Err(Error::from_status(status, problem, rate_limit, retry_after))
    }
}

/// Request is one edge API call: method, path, query, optional body and
/// vendor content type, and retry/deadline hints.
#[derive(Debug, Clone)]
pub struct Request {
    method: reqwest::Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    content_type: Option<String>,
    idempotent_post: bool,
    deadline: Option<Instant>,
}

impl Request {
    fn new(method: reqwest::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            content_type: None,
            idempotent_post: false,
            deadline: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::GET, path)
    }
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::POST, path)
    }
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::PUT, path)
    }
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::DELETE, path)
    }
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(reqwest::Method::PATCH, path)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize `body` as the JSON request body.
    pub fn json<T: serde::Serialize>(mut self, body: &T) -> Result<Self, Error> {
        self.body = Some(serde_json::to_vec(body).map_err(Error::Decode)?);
        self.content_type
            .get_or_insert_with(|| "application/json".to_string());
        Ok(self)
    }

    /// Override the content type, e.g. a vendor
    /// `application/vnd.<vendor>.<resource>.v<N>+json` media type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Tag a POST as safe to retry.
    pub fn idempotent(mut self) -> Self {
        self.idempotent_post = true;
        self
    }

    /// Overall deadline; attempts and backoff never extend past it.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    fn is_retryable_method(&self) -> bool {
        use reqwest::Method;
        if self.method == Method::POST {
            return self.idempotent_post;
        }
        [Method::GET, Method::HEAD, Method::PUT, Method::DELETE].contains(&self.method)
    }

    /// The relative URL exactly as signed and sent, with the tenant's
    /// account-switch key appended when the bundle carries one.
    fn relative_url(&self, creds: &Credentials) -> Result<String, Error> {
        if !self.path.starts_with('/') {
            return Err(Error::InvalidRequest(format!(
                "path {:?} must be absolute",
                self.path
            )));
        }

        let mut query = self.query.clone();
        if let Some(key) = &creds.account_switch_key {
            query.push(("accountSwitchKey".to_string(), key.clone()));
        }
        if query.is_empty() {
            return Ok(self.path.clone());
        }

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &query {
            serializer.append_pair(name, value);
        }
        Ok(format!("{}?{}", self.path, serializer.finish()))
    }
}

/// Response couples the body with the status, headers, and the rate-limit
/// snapshot parsed from this exchange.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: bytes::Bytes,
    pub rate_limit: RateLimitInfo,
}

impl Response {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(Error::Decode)
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// Error bodies are expected to be RFC 7807; tolerate anything else.
fn parse_problem(body: &[u8]) -> Option<ProblemDetails> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relative_url_appends_account_switch_key() {
        let mut creds = Credentials::new("ct", "at", "secret", "h.example");
        creds.account_switch_key = Some("1-ABC:DEF".to_string());

        let req = Request::get("/papi/v1/properties").query("contractId", "ctr_1");
        assert_eq!(
            req.relative_url(&creds).unwrap(),
            "/papi/v1/properties?contractId=ctr_1&accountSwitchKey=1-ABC%3ADEF"
        );

        creds.account_switch_key = None;
        let req = Request::get("/papi/v1/properties");
        assert_eq!(req.relative_url(&creds).unwrap(), "/papi/v1/properties");
    }

    #[test]
    fn relative_paths_are_rejected() {
        let creds = Credentials::new("ct", "at", "secret", "h.example");
        let err = Request::get("papi/v1/properties")
            .relative_url(&creds)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn retry_gating_by_method() {
        assert!(Request::get("/a").is_retryable_method());
        assert!(Request::put("/a").is_retryable_method());
        assert!(Request::delete("/a").is_retryable_method());
        assert!(!Request::post("/a").is_retryable_method());
        assert!(Request::post("/a").idempotent().is_retryable_method());
        assert!(!Request::patch("/a").is_retryable_method());
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "17".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(17)));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn problem_bodies_parse_leniently() {
        assert!(parse_problem(b"").is_none());
        assert!(parse_problem(b"<html>oops</html>").is_none());

        let problem = parse_problem(br#"{"title":"Bad object","status":400}"#).unwrap();
        assert_eq!(problem.title.as_deref(), Some("Bad object"));
    }

    #[test]
    fn json_body_sets_content_type_once() {
        let req = Request::post("/x")
            .content_type("application/vnd.cps.enrollment.v11+json")
            .json(&serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(
            req.content_type.as_deref(),
            Some("application/vnd.cps.enrollment.v11+json")
        );
        assert_eq!(req.body.as_deref(), Some(&br#"{"a":1}"#[..]));
    }
}
