//! HTTP transport used by paged sources.

use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::retry::{api_retry_config, with_retry, RetryConfig};
use crate::sources::FetchError;

/// Issues the network round trips of a source
///
/// Abstracted so sources can be driven by scripted responses in tests.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Fetch the body at `url`
    async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

/// Shared HTTP client with sensible defaults
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Arc<Client>,
    retry: RetryConfig,
}

impl HttpClient {
    /// Create a new HTTP client with a custom user agent and request timeout
    pub fn with_user_agent(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client: Arc::new(client),
            retry: api_retry_config(),
        })
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        tracing::debug!("GET {}", url);

        let response = with_retry(self.retry, || {
            let client = Arc::clone(&self.client);
            let url = url.clone();
            async move {
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| FetchError::Network(format!("Failed to fetch {}: {}", url, e)))?;

                let status = response.status();
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    return Err(FetchError::Network(format!("{} returned status: {}", url, status)));
                }
                if !status.is_success() {
                    return Err(FetchError::InvalidRequest(format!(
                        "{} returned status: {}",
                        url, status
                    )));
                }

                Ok(response)
            }
        })
        .await?;

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}
