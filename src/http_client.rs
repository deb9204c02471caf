//! Outbound HTTP client with bounded retries.
//!
//! Transient failures (connection errors, timeouts, 429 and 5xx other than 501) are
//! retried with exponential backoff until the retry-wait budget runs out. The budget
//! is a hard ceiling: once the next backoff would cross it, the last response or
//! error is returned as is.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
    /// Total time spent waiting between attempts before giving up.
    pub max_retry_wait: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(100),
            max_retry_wait: Duration::from_secs(1),
        }
    }
}

/// Determines if a reqwest error is retryable.
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

/// Determines if a response status is worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

/// Backoff before retry number `attempt` (0-based): 50ms, 100ms, 200ms, ... capped at 1s.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    INITIAL_BACKOFF
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

/// A reqwest client that retries transient failures within a time budget.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    client: reqwest::Client,
    settings: RetrySettings,
}

impl ResilientClient {
    pub fn new(settings: RetrySettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.connection_timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> RetrySettings {
        self.settings
    }

    /// The underlying client, for building requests.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends `request`, retrying transient failures.
    ///
    /// Requests with streaming bodies cannot be replayed and are sent once.
    pub async fn execute(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let deadline = Instant::now() + self.settings.max_retry_wait;
        let url = request.url().clone();
        let mut attempt: u32 = 0;

        loop {
            let Some(next) = request.try_clone() else {
                return self.client.execute(request).await;
            };

            let result = self.client.execute(next).await;
            let retryable = match &result {
                Ok(response) => is_retryable_status(response.status()),
                Err(error) => is_retryable_error(error),
            };
            if !retryable {
                if attempt > 0 {
                    debug!(url = %url, attempt = attempt + 1, "Request completed after retry");
                }
                return result;
            }

            let delay = backoff_for_attempt(attempt);
            if Instant::now() + delay > deadline {
                warn!(
                    url = %url,
                    attempts = attempt + 1,
                    max_retry_wait_ms = self.settings.max_retry_wait.as_millis(),
                    "Retry budget exhausted"
                );
                return result;
            }

            match &result {
                Ok(response) => warn!(
                    url = %url,
                    status = %response.status(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retryable status code, will retry after delay"
                ),
                Err(error) => warn!(
                    url = %url,
                    error = %error,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retryable error, will retry after delay"
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_IMPLEMENTED));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_for_attempt(0), Duration::from_millis(50));
        assert_eq!(backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/check"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = ResilientClient::new(RetrySettings {
            connection_timeout: Duration::from_secs(2),
            max_retry_wait: Duration::from_secs(2),
        })
        .unwrap();
        let request = client
            .inner()
            .post(format!("{}/check", server.uri()))
            .body("{}")
            .build()
            .unwrap();

        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ResilientClient::new(RetrySettings {
            connection_timeout: Duration::from_secs(2),
            max_retry_wait: Duration::from_millis(120),
        })
        .unwrap();
        let request = client.inner().post(server.uri()).build().unwrap();

        let started = std::time::Instant::now();
        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(started.elapsed() < Duration::from_secs(2));

        // 50ms and then 100ms would exceed 120ms: two attempts in total.
        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = ResilientClient::new(RetrySettings::default()).unwrap();
        let request = client.inner().post(server.uri()).build().unwrap();
        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
