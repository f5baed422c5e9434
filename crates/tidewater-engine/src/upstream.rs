//! Shared HTTP client for upstream government APIs.
//!
//! Transient failures (timeouts, refused or reset connections) are retried
//! here with a linear delay. Everything else is classified and handed back
//! to the partition that asked, which decides whether to retry.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Extra attempts made for transient failures before giving up.
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum UpstreamError {
  /// Timeout, connect failure or reset; retried inside the client first.
  #[error("transient network failure for {url}: {message}")]
  Transient { url: String, message: String },

  /// The server answered with a non-success status.
  #[error("{url} answered HTTP {status}")]
  Rejected { url: String, status: u16 },

  /// The body could not be decoded, or the API reported failure in-band.
  #[error("malformed payload from {url}: {message}")]
  Malformed { url: String, message: String },
}

impl UpstreamError {
  pub fn is_transient(&self) -> bool { matches!(self, Self::Transient { .. }) }

  pub fn malformed(url: &str, message: impl Into<String>) -> Self {
    Self::Malformed { url: url.to_owned(), message: message.into() }
  }

  fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
    if let Some(status) = e.status() {
      Self::Rejected { url: url.to_owned(), status: status.as_u16() }
    } else if e.is_timeout() || e.is_connect() || e.is_request() {
      Self::Transient { url: url.to_owned(), message: e.to_string() }
    } else if e.is_decode() || e.is_body() {
      Self::Malformed { url: url.to_owned(), message: e.to_string() }
    } else {
      Self::Transient { url: url.to_owned(), message: e.to_string() }
    }
  }
}

/// Connection settings for [`Upstream`].
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
  pub timeout:           Duration,
  pub user_agent:        String,
  pub transient_retries: u32,
  /// Delay before the first transient retry; grows linearly.
  pub retry_delay:       Duration,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      timeout:           Duration::from_secs(120),
      user_agent:        concat!("tidewater/", env!("CARGO_PKG_VERSION")).to_owned(),
      transient_retries: DEFAULT_TRANSIENT_RETRIES,
      retry_delay:       Duration::from_secs(5),
    }
  }
}

/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct Upstream {
  client: Client,
  config: UpstreamConfig,
}

impl Upstream {
  pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
    let client = Client::builder()
      .timeout(config.timeout)
      .user_agent(config.user_agent.clone())
      .build()?;
    Ok(Self { client, config })
  }

  /// `GET url?query` decoded as JSON.
  pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, UpstreamError> {
    let body = self.get_bytes(url, query).await?;
    serde_json::from_slice(&body).map_err(|e| UpstreamError::malformed(url, e.to_string()))
  }

  /// `GET url?query` returning the raw body.
  pub async fn get_bytes(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, UpstreamError> {
    let mut attempt = 0;
    loop {
      match self.get_once(url, query).await {
        Err(e) if e.is_transient() && attempt < self.config.transient_retries => {
          attempt += 1;
          let delay = self.config.retry_delay * attempt;
          warn!(url, attempt, error = %e, "transient upstream failure; retrying");
          tokio::time::sleep(delay).await;
        }
        other => return other,
      }
    }
  }

  async fn get_once(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, UpstreamError> {
    debug!(url, "GET");
    let resp = self
      .client
      .get(url)
      .query(query)
      .send()
      .await
      .map_err(|e| UpstreamError::from_reqwest(url, e))?;

    let status = resp.status();
    if !status.is_success() {
      return Err(UpstreamError::Rejected { url: url.to_owned(), status: status.as_u16() });
    }

    let body = resp
      .bytes()
      .await
      .map_err(|e| UpstreamError::from_reqwest(url, e))?;
    Ok(body.to_vec())
  }
}
