use crate::config::Config;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// `Accept` header sent with every feed request.
pub const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml, text/xml";

/// Errors that can occur while fetching a single feed.
///
/// Whether an error is worth another attempt is decided by
/// [`FetchError::is_retryable`]; the processor turns retryable errors into
/// `retry` results while the task still has budget.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the total fetch deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The caller cancelled the batch while the fetch was in flight
    #[error("Fetch cancelled")]
    Cancelled,
    /// Response body exceeded the configured size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// No source is registered under the requested id
    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

impl FetchError {
    /// Returns true if this error is transient and the fetch should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_)
            | FetchError::HttpStatus(_)
            | FetchError::Timeout(_)
            | FetchError::IncompleteResponse { .. } => true,
            FetchError::Cancelled
            | FetchError::ResponseTooLarge(_)
            | FetchError::UnknownSource(_) => false,
        }
    }
}

/// Builds the shared HTTP client.
///
/// `Accept-Encoding: gzip, deflate` is added by reqwest, which also decodes
/// compressed bodies. Both the connect timeout and the total timeout from `config` are applied
/// here, so every request made through the client honours them.
pub fn build_client(config: &Config) -> Result<reqwest::Client, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));

    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .default_headers(headers)
        .connect_timeout(config.connection_timeout())
        .timeout(config.total_timeout())
        .build()?;

    Ok(client)
}

/// Performs one GET against `url` and returns the body.
///
/// # Errors
///
/// - [`FetchError::Timeout`] - the whole exchange exceeded `total_timeout`
/// - [`FetchError::Cancelled`] - `cancel` fired first
/// - [`FetchError::HttpStatus`] - non-2xx response
/// - [`FetchError::ResponseTooLarge`] / [`FetchError::IncompleteResponse`] - body problems
/// - [`FetchError::Network`] - anything reqwest reports
pub async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    total_timeout: Duration,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, FetchError> {
    let exchange = async {
        let response = client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, limit).await
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        outcome = tokio::time::timeout(total_timeout, exchange) => {
            outcome.map_err(|_| FetchError::Timeout(total_timeout))?
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    // EDGE-005: Fewer bytes than Content-Length means the transfer was cut short
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
