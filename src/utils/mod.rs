//! Utility modules supporting the sources.
//!
//! - [`Transport`]: network round trips, abstracted for testing
//! - [`HttpClient`]: reqwest-backed transport with retry of transient errors
//! - [`RetryConfig`] / [`with_retry`]: retry with exponential backoff
//! - [`is_duplicate_hit`] / [`find_duplicate`]: duplicate detection across sources
//!
//! # Retry with Backoff
//!
//! ```rust,no_run
//! use metafetch::utils::{with_retry, RetryConfig};
//! use metafetch::sources::FetchError;
//!
//! # async fn fetch_data() -> Result<String, FetchError> { Ok("data".to_string()) }
//! # #[tokio::main]
//! # async fn main() -> Result<(), FetchError> {
//! let config = RetryConfig::default().max_attempts(3);
//! let data = with_retry(config, || fetch_data()).await?;
//! # Ok(())
//! # }
//! ```

mod dedup;
mod http;
mod retry;

pub use dedup::{find_duplicate, is_duplicate_hit};
pub use http::{HttpClient, Transport};
pub use retry::{api_retry_config, is_transient, with_retry, RetryConfig};
