//! Shared HTTP plumbing for the provider clients.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::warn;

/// User-Agent string for every provider request.
pub(crate) const USER_AGENT: &str = concat!("Leadflow/", env!("CARGO_PKG_VERSION"));

/// Timeout for health checks, independent of the per-adapter request timeout.
pub(crate) const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded retry on HTTP 429.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Wait used when the provider sends no usable `Retry-After`.
    pub default_wait: Duration,
    /// Upper bound on any single wait.
    pub max_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_wait: Duration::from_secs(5),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl RateLimitPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn wait_for(&self, headers: &HeaderMap) -> Duration {
        parse_retry_after_header(headers)
            .unwrap_or(self.default_wait)
            .min(self.max_wait)
    }
}

/// Build a reqwest client with the shared user agent and a request timeout.
pub(crate) fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Send the request built by `make`, re-sending on 429 until the policy is
/// exhausted. The last response is returned as-is, whatever its status.
pub(crate) async fn send_with_rate_limit<F>(
    make: F,
    policy: &RateLimitPolicy,
    provider: &'static str,
) -> reqwest::Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let response = make().send().await?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS || attempt >= policy.max_retries {
            return Ok(response);
        }

        attempt += 1;
        let wait = policy.wait_for(response.headers());
        warn!(
            provider,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "rate limited, retrying"
        );
        tokio::time::sleep(wait).await;
    }
}

/// Read a bounded, lossy snippet of an error body for diagnostics.
pub(crate) async fn error_snippet(response: Response) -> String {
    const MAX: usize = 300;
    match response.text().await {
        Ok(body) if body.len() > MAX => {
            let mut end = MAX;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &body[..end])
        }
        Ok(body) => body,
        Err(e) => format!("<unreadable body: {e}>"),
    }
}

/// Retryable statuses: rate limiting and server errors.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Parse `Retry-After` as either delta-seconds or an RFC 2822 date.
/// Dates in the past yield `None`.
fn parse_retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (chrono::DateTime::<chrono::Utc>::from(at) - chrono::Utc::now())
        .to_std()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(
            parse_retry_after_header(&headers_with("7")),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn retry_after_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(120);
        let parsed = parse_retry_after_header(&headers_with(&future.to_rfc2822())).unwrap();
        assert!(parsed > Duration::from_secs(100));
        assert!(parsed <= Duration::from_secs(120));
    }

    #[test]
    fn retry_after_past_or_garbage() {
        assert_eq!(
            parse_retry_after_header(&headers_with("Mon, 01 Jan 2001 00:00:00 +0000")),
            None
        );
        assert_eq!(parse_retry_after_header(&headers_with("soon")), None);
        assert_eq!(parse_retry_after_header(&HeaderMap::new()), None);
    }

    #[test]
    fn wait_is_capped() {
        let policy = RateLimitPolicy {
            max_retries: 1,
            default_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(2),
        };
        assert_eq!(policy.wait_for(&headers_with("3600")), Duration::from_secs(2));
        assert_eq!(policy.wait_for(&HeaderMap::new()), Duration::from_secs(1));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::CONFLICT));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let url = format!("{}/limited", server.uri());
        let response = send_with_rate_limit(
            || client.get(&url),
            &RateLimitPolicy::with_max_retries(3),
            "test",
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(2)
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let url = server.uri();
        let response = send_with_rate_limit(
            || client.get(&url),
            &RateLimitPolicy::with_max_retries(1),
            "test",
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
