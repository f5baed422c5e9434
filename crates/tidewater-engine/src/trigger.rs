//! How the scheduler (and the CLI) start a build.
//!
//! In-process sources run their [`BuildOrchestrator`] directly. A source
//! owned by another instance is reached through its
//! `/cron/rebuild/{source}` endpoint, so the build runs where its cache
//! lives.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::Client;
use tidewater_core::source::SourceId;
use tracing::{info, warn};

use crate::build::{BuildOrchestrator, BuildReport};

#[async_trait]
pub trait BuildTrigger: Send + Sync {
  /// Start a build and wait for its report. Failures are reported, never
  /// returned.
  async fn trigger(&self) -> BuildReport;
}

#[async_trait]
impl BuildTrigger for BuildOrchestrator {
  async fn trigger(&self) -> BuildReport { self.run().await }
}

/// Run `trigger` on its own task and wait for the report. Dropping the
/// returned future does not cancel the build.
pub async fn trigger_detached(trigger: Arc<dyn BuildTrigger>, source: SourceId) -> BuildReport {
  let started = Instant::now();
  match tokio::spawn(async move { trigger.trigger().await }).await {
    Ok(report) => report,
    Err(e) => {
      warn!(source = %source, error = %e, "build task aborted");
      BuildReport::error(source, format!("build task aborted: {e}"), started.elapsed())
    }
  }
}

/// Remote builds can take as long as the build lock allows.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub struct RemoteTrigger {
  client:   Client,
  base_url: String,
  token:    String,
  source:   SourceId,
}

impl RemoteTrigger {
  pub fn new(
    base_url: impl Into<String>,
    token: impl Into<String>,
    source: SourceId,
    timeout: Duration,
  ) -> Result<Self, reqwest::Error> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client, base_url: base_url.into(), token: token.into(), source })
  }

  pub fn url(&self) -> String {
    format!("{}/cron/rebuild/{}", self.base_url.trim_end_matches('/'), self.source)
  }

  async fn call(&self) -> Result<BuildReport, String> {
    let resp = self
      .client
      .get(self.url())
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| e.to_string())?;

    let status = resp.status();
    if !status.is_success() {
      let body = resp.text().await.unwrap_or_default();
      return Err(format!("HTTP {status}: {body}"));
    }
    resp.json::<BuildReport>().await.map_err(|e| format!("bad report: {e}"))
  }
}

#[async_trait]
impl BuildTrigger for RemoteTrigger {
  async fn trigger(&self) -> BuildReport {
    let started = Instant::now();
    info!(source = %self.source, url = %self.url(), "triggering remote build");
    match self.call().await {
      Ok(report) => report,
      Err(message) => {
        warn!(source = %self.source, error = %message, "remote build trigger failed");
        BuildReport::error(self.source.clone(), format!("remote trigger failed: {message}"), started.elapsed())
      }
    }
  }
}
