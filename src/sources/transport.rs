use crate::config::RetryPolicy;
use crate::error::{FetchError, TransientFetchFailure};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = "Tally/0.1 (Market Data Ingestion)";
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// A single HTTP GET. Implementations must not retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Return the response body for a 2xx status, an error otherwise.
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<String, FetchError>;
}

/// reqwest-backed transport with JSON accept and identifying user agent.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(default_headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<String, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }

        Ok(text)
    }
}

/// Wraps a transport with exponential-backoff retry.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// GET `url`, retrying on any failure until the policy is exhausted.
    pub async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<String, TransientFetchFailure> {
        let attempts = self.policy.max_attempts.max(1);
        let display_url = strip_query(url);
        let mut last_error = FetchError::Network("no attempt made".to_string());

        for attempt in 1..=attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!("Retrying {} in {:?} (attempt {}/{})", display_url, delay, attempt, attempts);
                tokio::time::sleep(delay).await;
            }

            match self.transport.get(url, headers).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!("Request to {} failed (attempt {}/{}): {}", display_url, attempt, attempts, e);
                    last_error = e;
                }
            }
        }

        Err(TransientFetchFailure {
            url: display_url.to_string(),
            attempts,
            last_error,
        })
    }
}

/// Drop the query string so credentials passed as parameters stay out of logs.
fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
