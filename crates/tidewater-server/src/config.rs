//! Runtime configuration, read from an optional TOML file layered with
//! `TIDEWATER__*` environment variables.
//!
//! ```toml
//! store_path = "~/.local/share/tidewater/coordination.db"
//! cache_dir = "~/.cache/tidewater"
//! trigger_token_hash = "$argon2id$v=19$..."
//! tick_interval_secs = 300
//!
//! [[sources]]
//! id = "nwis"
//! partitions = ["MD", "VA", "DC"]
//! base_interval_min = 30
//!
//! [sources.adapter]
//! type = "nwis"
//! ```

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;
use tidewater_core::{grid::DEFAULT_RESOLUTION, schedule::SchedulePolicy, source::SourceId};
use tidewater_engine::{
  adapter::{Pacing, PartitionConcurrency},
  adapters::AdapterConfig,
  insights::InsightsSettings,
  upstream::UpstreamConfig,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:               String,
  #[serde(default = "default_port")]
  pub port:               u16,
  /// SQLite file holding scheduler rows, the health log and insights.
  pub store_path:         PathBuf,
  /// Directory for per-source cache artifacts.
  pub cache_dir:          PathBuf,
  /// argon2 PHC string of the trigger secret.
  pub trigger_token_hash: String,
  /// Plain trigger secret, used when calling other instances.
  #[serde(default)]
  pub trigger_token:      Option<String>,
  /// Soft-lock owner name; a random UUID when unset.
  #[serde(default)]
  pub instance_id:        Option<String>,
  #[serde(default = "default_lock_ttl_secs")]
  pub lock_ttl_secs:      u64,
  /// Enables the in-process tick loop.
  #[serde(default)]
  pub tick_interval_secs: Option<u64>,
  #[serde(default = "default_resolution")]
  pub grid_resolution:    f64,
  #[serde(default)]
  pub upstream:           UpstreamSettings,
  #[serde(default)]
  pub sources:            Vec<SourceConfig>,
  #[serde(default)]
  pub insights:           Option<InsightsConfig>,
}

fn default_host() -> String { "127.0.0.1".to_owned() }

fn default_port() -> u16 { 8080 }

fn default_lock_ttl_secs() -> u64 { 300 }

fn default_resolution() -> f64 { DEFAULT_RESOLUTION }

impl ServerConfig {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("TIDEWATER").separator("__"))
      .build()
      .context("failed to read configuration")?;

    let mut cfg: ServerConfig = settings
      .try_deserialize()
      .context("failed to deserialise ServerConfig")?;
    cfg.store_path = expand_tilde(&cfg.store_path);
    cfg.cache_dir = expand_tilde(&cfg.cache_dir);
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    for (i, source) in self.sources.iter().enumerate() {
      if self.sources[..i].iter().any(|s| s.id == source.id) {
        bail!("source {} is configured twice", source.id);
      }
      source.concurrency()?;
      if source.remote.is_some() && self.trigger_token.is_none() {
        bail!("source {} is remote but trigger_token is not set", source.id);
      }
    }
    Ok(())
  }

  pub fn lock_ttl(&self) -> Duration { Duration::from_secs(self.lock_ttl_secs) }
}

// ─── Upstream ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
  pub timeout_secs:      u64,
  pub user_agent:        Option<String>,
  pub transient_retries: u32,
  pub retry_delay_ms:    u64,
}

impl Default for UpstreamSettings {
  fn default() -> Self {
    let d = UpstreamConfig::default();
    Self {
      timeout_secs:      d.timeout.as_secs(),
      user_agent:        None,
      transient_retries: d.transient_retries,
      retry_delay_ms:    d.retry_delay.as_millis() as u64,
    }
  }
}

impl UpstreamSettings {
  pub fn to_config(&self) -> UpstreamConfig {
    let mut cfg = UpstreamConfig {
      timeout: Duration::from_secs(self.timeout_secs),
      transient_retries: self.transient_retries,
      retry_delay: Duration::from_millis(self.retry_delay_ms),
      ..UpstreamConfig::default()
    };
    if let Some(ua) = &self.user_agent {
      cfg.user_agent = ua.clone();
    }
    cfg
  }
}

// ─── Sources ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
  pub id:                SourceId,
  pub adapter:           AdapterConfig,
  /// Partition priority order.
  #[serde(default)]
  pub partitions:        Vec<String>,
  #[serde(default = "default_true")]
  pub enabled:           bool,
  #[serde(default)]
  pub base_interval_min: Option<u32>,
  #[serde(default)]
  pub max_interval_min:  Option<u32>,
  #[serde(default)]
  pub jitter_pct:        Option<u32>,
  /// `"sequential"` or a pool size between 5 and 10.
  #[serde(default)]
  pub concurrency:       Option<ConcurrencySetting>,
  #[serde(default)]
  pub pacing:            Pacing,
  /// Base URL of the instance that builds this source.
  #[serde(default)]
  pub remote:            Option<String>,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConcurrencySetting {
  Pool(usize),
  Named(String),
}

impl SourceConfig {
  pub fn policy(&self) -> SchedulePolicy {
    let d = SchedulePolicy::default();
    SchedulePolicy {
      base_interval_min: self.base_interval_min.unwrap_or(d.base_interval_min),
      max_interval_min:  self.max_interval_min.unwrap_or(d.max_interval_min),
      jitter_pct:        self.jitter_pct.unwrap_or(d.jitter_pct),
    }
  }

  pub fn concurrency(&self) -> anyhow::Result<PartitionConcurrency> {
    let pool = match &self.concurrency {
      None => return Ok(PartitionConcurrency::Sequential),
      Some(ConcurrencySetting::Pool(n)) => *n,
      Some(ConcurrencySetting::Named(s)) if s.eq_ignore_ascii_case("sequential") => {
        return Ok(PartitionConcurrency::Sequential);
      }
      // Environment overrides arrive as strings.
      Some(ConcurrencySetting::Named(s)) => s
        .trim()
        .parse()
        .with_context(|| format!("source {}: concurrency must be \"sequential\" or a number, got {s:?}", self.id))?,
    };
    if !(PartitionConcurrency::MIN_POOL..=PartitionConcurrency::MAX_POOL).contains(&pool) {
      bail!(
        "source {}: pool size {pool} outside {}..={}",
        self.id,
        PartitionConcurrency::MIN_POOL,
        PartitionConcurrency::MAX_POOL
      );
    }
    Ok(PartitionConcurrency::pooled(pool))
  }
}

// ─── Insights ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct InsightsConfig {
  pub endpoint:             String,
  #[serde(default)]
  pub api_key:              Option<String>,
  #[serde(default = "default_provider")]
  pub provider:             String,
  #[serde(default = "default_roles")]
  pub roles:                Vec<String>,
  #[serde(default = "default_roles")]
  pub urgent_roles:         Vec<String>,
  #[serde(default)]
  pub partitions:           Vec<String>,
  #[serde(default = "default_insight_concurrency")]
  pub concurrency:          usize,
  #[serde(default = "default_max_age_hours")]
  pub max_age_hours:        i64,
  #[serde(default = "default_insight_timeout_secs")]
  pub timeout_secs:         u64,
  /// Enables the in-process main run loop.
  #[serde(default)]
  pub interval_secs:        Option<u64>,
  /// Enables the in-process urgent run loop.
  #[serde(default)]
  pub urgent_interval_secs: Option<u64>,
}

fn default_provider() -> String { "http".to_owned() }

fn default_roles() -> Vec<String> { vec!["summary".to_owned()] }

fn default_insight_concurrency() -> usize { 3 }

fn default_max_age_hours() -> i64 { 24 }

fn default_insight_timeout_secs() -> u64 { 60 }

impl InsightsConfig {
  pub fn settings(&self) -> InsightsSettings {
    InsightsSettings {
      roles: self.roles.clone(),
      urgent_roles: self.urgent_roles.clone(),
      partitions: self.partitions.clone(),
      concurrency: self.concurrency,
      max_age: chrono::Duration::hours(self.max_age_hours),
      ..InsightsSettings::default()
    }
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
