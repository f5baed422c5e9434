//! Assembles a running Tidewater instance from [`ServerConfig`].

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use tidewater_api::{AppState, auth::AuthConfig};
use tidewater_core::grid::GridIndex;
use tidewater_engine::{
  adapters::AdapterSettings,
  build::BuildOrchestrator,
  cache::CacheStore,
  insights::{HttpInsightGenerator, InsightsPipeline, RegistrySignals},
  lock::DEFAULT_BUILD_TIMEOUT,
  persist::DiskPersistence,
  registry::{SourceEntry, SourceRegistry},
  scheduler::Scheduler,
  trigger::{DEFAULT_REMOTE_TIMEOUT, RemoteTrigger},
  upstream::Upstream,
};
use tidewater_store_sqlite::SqliteStore;
use uuid::Uuid;

pub mod config;

pub use self::config::ServerConfig;

/// One cache, trigger and schedule policy per configured source.
pub fn build_registry(cfg: &ServerConfig) -> anyhow::Result<SourceRegistry> {
  let index = GridIndex::new(cfg.grid_resolution).context("invalid grid_resolution")?;
  let disk = DiskPersistence::new(cfg.cache_dir.clone());
  let upstream = Upstream::new(cfg.upstream.to_config()).context("failed to build HTTP client")?;

  let mut entries = Vec::with_capacity(cfg.sources.len());
  for source in &cfg.sources {
    let cache = Arc::new(CacheStore::new(source.id.clone(), index, Some(disk.clone())));

    let entry = match &source.remote {
      Some(base_url) => {
        let token = cfg.trigger_token.clone().unwrap_or_default();
        let trigger = RemoteTrigger::new(base_url, token, source.id.clone(), DEFAULT_REMOTE_TIMEOUT)
          .context("failed to build remote trigger client")?;
        SourceEntry::remote(cache, Arc::new(trigger), source.policy(), source.enabled)
      }
      None => {
        let settings = AdapterSettings {
          source:      source.id.clone(),
          partitions:  source.partitions.clone(),
          pacing:      source.pacing.clone(),
          concurrency: source.concurrency()?,
        };
        let adapter = source
          .adapter
          .clone()
          .build(settings, upstream.clone())
          .with_context(|| format!("failed to configure source {}", source.id))?;
        let orchestrator = Arc::new(BuildOrchestrator::new(adapter, cache, DEFAULT_BUILD_TIMEOUT));
        SourceEntry::local(orchestrator, source.policy(), source.enabled)
      }
    };
    entries.push(entry);
  }

  Ok(SourceRegistry::new(entries)?)
}

/// Open the coordination store and wire the registry, scheduler and
/// optional insights pipeline into an [`AppState`].
pub async fn build_state(cfg: &ServerConfig) -> anyhow::Result<AppState<SqliteStore>> {
  if let Some(parent) = cfg.store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    tokio::fs::create_dir_all(parent)
      .await
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;
  let store = Arc::new(store);

  let registry = Arc::new(build_registry(cfg)?);

  let owner = cfg.instance_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
  tracing::info!(%owner, sources = registry.len(), "scheduler configured");
  let scheduler = Arc::new(Scheduler::new(store.clone(), registry.clone(), owner, cfg.lock_ttl()));

  let insights = match &cfg.insights {
    Some(icfg) => {
      let generator = HttpInsightGenerator::new(
        &icfg.endpoint,
        icfg.api_key.clone(),
        &icfg.provider,
        Duration::from_secs(icfg.timeout_secs),
      )
      .context("failed to build insights client")?;
      let signals = RegistrySignals::new(registry.clone());
      Some(Arc::new(InsightsPipeline::new(
        store.clone(),
        Arc::new(signals),
        Arc::new(generator),
        icfg.settings(),
      )))
    }
    None => None,
  };

  Ok(AppState {
    registry,
    scheduler,
    insights,
    auth: Arc::new(AuthConfig { token_hash: cfg.trigger_token_hash.clone() }),
  })
}
