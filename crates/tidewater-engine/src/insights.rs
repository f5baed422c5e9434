//! Regenerates derived insight text per `(partition, role)` when the
//! signals feeding it change.
//!
//! Each unit hashes its current signals. If the stored entry has the same
//! hash and is younger than the max age it is kept as is (delta-skip) and
//! the generator is not called. Otherwise the generator runs, retrying only
//! on rate limiting with a doubling delay.
//!
//! Two runs share the lock family: the main run covers every partition and
//! role; the urgent run covers only partitions flagged critical with a
//! reduced role set, and defers entirely while a main run holds its lock.

use std::{
  collections::BTreeMap,
  sync::Arc,
  time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tidewater_core::insight::{InsightEntry, InsightKey, InsightStore, signals_hash};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{lock::BuildLock, registry::SourceRegistry};

// ─── Signals ─────────────────────────────────────────────────────────────────

/// Inputs for one partition's insights.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSignals {
  pub partition: String,
  pub signals:   Value,
  /// Partition currently shows a critical condition.
  pub critical:  bool,
}

pub trait SignalSource: Send + Sync {
  fn collect(&self) -> Vec<PartitionSignals>;
}

/// Most alert keys listed per source and partition.
const MAX_ALERT_KEYS: usize = 25;

/// Per-partition signals derived from the published caches: record counts
/// by source and kind, plus alert totals and keys. Build timestamps are
/// left out so an unchanged rebuild hashes the same.
pub struct RegistrySignals {
  registry: Arc<SourceRegistry>,
}

impl RegistrySignals {
  pub fn new(registry: Arc<SourceRegistry>) -> Self { Self { registry } }
}

#[derive(Default)]
struct SourceTally {
  counts:     BTreeMap<String, usize>,
  alerts:     usize,
  alert_keys: Vec<String>,
}

impl SignalSource for RegistrySignals {
  fn collect(&self) -> Vec<PartitionSignals> {
    // partition → source → tally
    let mut tallies: BTreeMap<String, BTreeMap<String, SourceTally>> = BTreeMap::new();
    for entry in self.registry.sources() {
      let Some(blob) = entry.cache().snapshot() else { continue };
      for record in blob.grid.values().flat_map(|cell| cell.records()) {
        let Some(partition) = &record.partition else { continue };
        let tally = tallies
          .entry(partition.clone())
          .or_default()
          .entry(entry.id().to_string())
          .or_default();
        *tally.counts.entry(record.kind.clone()).or_default() += 1;
        if record.alert {
          tally.alerts += 1;
          tally.alert_keys.push(format!("{}:{}", record.kind, record.key));
        }
      }
    }

    tallies
      .into_iter()
      .map(|(partition, sources)| {
        let alerts: usize = sources.values().map(|t| t.alerts).sum();
        let sources: serde_json::Map<String, Value> = sources
          .into_iter()
          .map(|(source, mut t)| {
            t.alert_keys.sort();
            t.alert_keys.truncate(MAX_ALERT_KEYS);
            (source, json!({ "counts": t.counts, "alerts": t.alerts, "alertKeys": t.alert_keys }))
          })
          .collect();
        PartitionSignals {
          signals: json!({ "partition": partition, "alerts": alerts, "sources": sources }),
          partition,
          critical: alerts > 0,
        }
      })
      .collect()
  }
}

// ─── Generator ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GenerateError {
  #[error("generator rate limited")]
  RateLimited,

  #[error("generation failed: {0}")]
  Failed(String),
}

/// External text generation service.
#[async_trait]
pub trait InsightGenerator: Send + Sync {
  /// Recorded on every entry this generator produces.
  fn provider(&self) -> &str;

  async fn generate(&self, key: &InsightKey, signals: &Value) -> Result<String, GenerateError>;
}

/// Posts `{partition, role, signals}` to an HTTP endpoint that answers
/// `{"content": "..."}`. HTTP 429 is reported as rate limiting.
pub struct HttpInsightGenerator {
  client:   Client,
  endpoint: String,
  api_key:  Option<String>,
  provider: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
  content: String,
}

impl HttpInsightGenerator {
  pub fn new(
    endpoint: impl Into<String>,
    api_key: Option<String>,
    provider: impl Into<String>,
    timeout: Duration,
  ) -> Result<Self, reqwest::Error> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client, endpoint: endpoint.into(), api_key, provider: provider.into() })
  }
}

#[async_trait]
impl InsightGenerator for HttpInsightGenerator {
  fn provider(&self) -> &str { &self.provider }

  async fn generate(&self, key: &InsightKey, signals: &Value) -> Result<String, GenerateError> {
    let mut req = self.client.post(&self.endpoint).json(&json!({
      "partition": key.partition,
      "role": key.role,
      "signals": signals,
    }));
    if let Some(api_key) = &self.api_key {
      req = req.bearer_auth(api_key);
    }

    let resp = req.send().await.map_err(|e| GenerateError::Failed(e.to_string()))?;
    match resp.status() {
      StatusCode::TOO_MANY_REQUESTS => Err(GenerateError::RateLimited),
      status if !status.is_success() => Err(GenerateError::Failed(format!("HTTP {status}"))),
      _ => {
        let body: GenerateResponse = resp.json().await.map_err(|e| GenerateError::Failed(e.to_string()))?;
        if body.content.trim().is_empty() {
          return Err(GenerateError::Failed("empty content".to_owned()));
        }
        Ok(body.content)
      }
    }
  }
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightsMode {
  Main,
  Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightsStatus {
  Complete,
  /// A run of the same mode was already in progress.
  Skipped,
  /// Urgent run gave way to an in-progress main run.
  Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ItemResult {
  Generated,
  /// Delta-skip: stored entry still matches its signals.
  Fresh,
  Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
  #[serde(flatten)]
  pub key:    InsightKey,
  #[serde(flatten)]
  pub result: ItemResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsReport {
  pub mode:        InsightsMode,
  pub status:      InsightsStatus,
  pub generated:   usize,
  pub fresh:       usize,
  pub failed:      usize,
  pub items:       Vec<ItemReport>,
  pub duration_ms: u64,
}

impl InsightsReport {
  fn bare(mode: InsightsMode, status: InsightsStatus) -> Self {
    Self { mode, status, generated: 0, fresh: 0, failed: 0, items: Vec::new(), duration_ms: 0 }
  }

  fn from_items(mode: InsightsMode, items: Vec<ItemReport>, elapsed: Duration) -> Self {
    let count = |f: fn(&ItemResult) -> bool| items.iter().filter(|i| f(&i.result)).count();
    Self {
      mode,
      status: InsightsStatus::Complete,
      generated: count(|r| matches!(r, ItemResult::Generated)),
      fresh: count(|r| matches!(r, ItemResult::Fresh)),
      failed: count(|r| matches!(r, ItemResult::Failed { .. })),
      duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
      items,
    }
  }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InsightsSettings {
  pub roles:            Vec<String>,
  pub urgent_roles:     Vec<String>,
  /// Restrict to these partitions; empty means every partition with signals.
  pub partitions:       Vec<String>,
  pub concurrency:      usize,
  pub max_age:          chrono::Duration,
  pub attempts:         u32,
  /// Delay before the first rate-limit retry; doubles each time.
  pub retry_base_delay: Duration,
  pub lock_timeout:     Duration,
}

impl Default for InsightsSettings {
  fn default() -> Self {
    Self {
      roles:            vec!["summary".to_owned()],
      urgent_roles:     vec!["summary".to_owned()],
      partitions:       Vec::new(),
      concurrency:      3,
      max_age:          chrono::Duration::hours(24),
      attempts:         3,
      retry_base_delay: Duration::from_secs(2),
      lock_timeout:     Duration::from_secs(30 * 60),
    }
  }
}

pub struct InsightsPipeline<S> {
  store:       Arc<S>,
  signals:     Arc<dyn SignalSource>,
  generator:   Arc<dyn InsightGenerator>,
  settings:    InsightsSettings,
  main_lock:   Arc<BuildLock>,
  urgent_lock: Arc<BuildLock>,
}

impl<S: InsightStore> InsightsPipeline<S> {
  pub fn new(
    store: Arc<S>,
    signals: Arc<dyn SignalSource>,
    generator: Arc<dyn InsightGenerator>,
    settings: InsightsSettings,
  ) -> Self {
    let main_lock = Arc::new(BuildLock::new("insights", settings.lock_timeout));
    let urgent_lock = Arc::new(BuildLock::new("insights:urgent", settings.lock_timeout));
    Self { store, signals, generator, settings, main_lock, urgent_lock }
  }

  pub fn main_lock(&self) -> &Arc<BuildLock> { &self.main_lock }

  pub fn store(&self) -> &Arc<S> { &self.store }

  /// Every partition × every role.
  pub async fn run(&self, now: DateTime<Utc>) -> InsightsReport {
    let Some(_guard) = self.main_lock.try_acquire() else {
      info!("insights run already in progress; skipping");
      return InsightsReport::bare(InsightsMode::Main, InsightsStatus::Skipped);
    };
    let partitions = self.selected(self.signals.collect());
    self.process(InsightsMode::Main, partitions, &self.settings.roles, now).await
  }

  /// Critical partitions × urgent roles. Defers while a main run holds its
  /// lock, since the main run covers the same work.
  pub async fn run_urgent(&self, now: DateTime<Utc>) -> InsightsReport {
    if self.main_lock.is_in_progress() {
      info!("main insights run in progress; deferring urgent run");
      return InsightsReport::bare(InsightsMode::Urgent, InsightsStatus::Deferred);
    }
    let Some(_guard) = self.urgent_lock.try_acquire() else {
      info!("urgent insights run already in progress; skipping");
      return InsightsReport::bare(InsightsMode::Urgent, InsightsStatus::Skipped);
    };
    let critical = self.selected(self.signals.collect()).into_iter().filter(|p| p.critical).collect();
    self.process(InsightsMode::Urgent, critical, &self.settings.urgent_roles, now).await
  }

  fn selected(&self, all: Vec<PartitionSignals>) -> Vec<PartitionSignals> {
    if self.settings.partitions.is_empty() {
      return all;
    }
    all.into_iter().filter(|p| self.settings.partitions.contains(&p.partition)).collect()
  }

  async fn process(
    &self,
    mode: InsightsMode,
    partitions: Vec<PartitionSignals>,
    roles: &[String],
    now: DateTime<Utc>,
  ) -> InsightsReport {
    let started = Instant::now();
    let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));

    let units = partitions.iter().flat_map(|p| {
      let hash = signals_hash(&p.signals);
      roles.iter().map(move |role| (InsightKey::new(p.partition.clone(), role.clone()), &p.signals, hash.clone()))
    });

    let items = join_all(units.map(|(key, signals, hash)| {
      let permits = Arc::clone(&permits);
      async move {
        let result = match permits.acquire_owned().await {
          Ok(_permit) => self.process_one(&key, signals, &hash, now).await,
          Err(e) => ItemResult::Failed { error: e.to_string() },
        };
        ItemReport { key, result }
      }
    }))
    .await;

    let report = InsightsReport::from_items(mode, items, started.elapsed());
    info!(
      mode = ?mode,
      generated = report.generated,
      fresh = report.fresh,
      failed = report.failed,
      elapsed_ms = report.duration_ms,
      "insights run finished"
    );
    report
  }

  async fn process_one(&self, key: &InsightKey, signals: &Value, hash: &str, now: DateTime<Utc>) -> ItemResult {
    let existing = match self.store.get_insight(key).await {
      Ok(existing) => existing,
      Err(e) => {
        warn!(partition = %key.partition, role = %key.role, error = %e, "insight lookup failed; regenerating");
        None
      }
    };
    if existing.is_some_and(|e| e.is_fresh(hash, now, self.settings.max_age)) {
      debug!(partition = %key.partition, role = %key.role, "signals unchanged; keeping insight");
      return ItemResult::Fresh;
    }

    let content = match self.generate_with_retry(key, signals).await {
      Ok(content) => content,
      Err(e) => {
        warn!(partition = %key.partition, role = %key.role, error = %e, "insight generation failed");
        return ItemResult::Failed { error: e.to_string() };
      }
    };

    let entry = InsightEntry {
      content,
      generated_at: now,
      signals_hash: hash.to_owned(),
      provider: self.generator.provider().to_owned(),
    };
    match self.store.put_insight(key, entry).await {
      Ok(()) => ItemResult::Generated,
      Err(e) => {
        warn!(partition = %key.partition, role = %key.role, error = %e, "failed to store insight");
        ItemResult::Failed { error: e.to_string() }
      }
    }
  }

  async fn generate_with_retry(&self, key: &InsightKey, signals: &Value) -> Result<String, GenerateError> {
    let attempts = self.settings.attempts.max(1);
    let mut delay = self.settings.retry_base_delay;
    let mut attempt = 1;
    loop {
      match self.generator.generate(key, signals).await {
        Err(GenerateError::RateLimited) if attempt < attempts => {
          warn!(partition = %key.partition, role = %key.role, attempt, delay_ms = delay.as_millis() as u64, "rate limited; backing off");
          tokio::time::sleep(delay).await;
          delay *= 2;
          attempt += 1;
        }
        other => return other,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    sync::{
      Mutex,
      atomic::{AtomicUsize, Ordering},
    },
  };

  use axum::{Json, Router, http::StatusCode as AxumStatus, routing::post};
  use chrono::TimeZone;
  use tidewater_core::{grid::GridIndex, record::GeoRecord, schedule::SchedulePolicy};
  use tidewater_store_sqlite::SqliteStore;

  use super::*;
  use crate::{
    build::BuildOrchestrator,
    cache::CacheStore,
    lock::DEFAULT_BUILD_TIMEOUT,
    registry::SourceEntry,
    testing::{ScriptedAdapter, serve, sid},
  };

  fn t0() -> DateTime<Utc> { Utc.timestamp_opt(1_700_000_000, 0).unwrap() }

  struct StaticSignals(Mutex<Vec<PartitionSignals>>);

  impl StaticSignals {
    fn new(partitions: &[(&str, u64, bool)]) -> Arc<Self> {
      let s = Arc::new(Self(Mutex::new(Vec::new())));
      s.set(partitions);
      s
    }

    fn set(&self, partitions: &[(&str, u64, bool)]) {
      *self.0.lock().unwrap() = partitions
        .iter()
        .map(|(p, n, critical)| PartitionSignals {
          partition: (*p).to_owned(),
          signals:   json!({ "records": n }),
          critical:  *critical,
        })
        .collect();
    }
  }

  impl SignalSource for StaticSignals {
    fn collect(&self) -> Vec<PartitionSignals> { self.0.lock().unwrap().clone() }
  }

  #[derive(Default)]
  struct ScriptedGenerator {
    script:    Mutex<VecDeque<Result<String, GenerateError>>>,
    calls:     AtomicUsize,
    in_flight: AtomicUsize,
    peak:      AtomicUsize,
    latency:   Duration,
  }

  impl ScriptedGenerator {
    fn with(script: impl IntoIterator<Item = Result<String, GenerateError>>) -> Arc<Self> {
      Arc::new(Self { script: Mutex::new(script.into_iter().collect()), ..Default::default() })
    }

    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
  }

  #[async_trait]
  impl InsightGenerator for ScriptedGenerator {
    fn provider(&self) -> &str { "scripted" }

    async fn generate(&self, key: &InsightKey, _signals: &Value) -> Result<String, GenerateError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      if !self.latency.is_zero() {
        tokio::time::sleep(self.latency).await;
      }
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      let scripted = self.script.lock().unwrap().pop_front();
      scripted.unwrap_or_else(|| Ok(format!("{} {}", key.partition, key.role)))
    }
  }

  fn settings() -> InsightsSettings {
    InsightsSettings {
      roles: vec!["summary".into(), "operator".into()],
      urgent_roles: vec!["summary".into()],
      retry_base_delay: Duration::from_millis(1),
      ..Default::default()
    }
  }

  async fn pipeline(
    signals: Arc<StaticSignals>,
    generator: Arc<ScriptedGenerator>,
    settings: InsightsSettings,
  ) -> InsightsPipeline<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    InsightsPipeline::new(store, signals, generator, settings)
  }

  #[tokio::test]
  async fn unchanged_signals_issue_no_calls() {
    let generator = ScriptedGenerator::with([]);
    let p = pipeline(StaticSignals::new(&[("MD", 3, false), ("VA", 1, false)]), generator.clone(), settings()).await;

    let first = p.run(t0()).await;
    assert_eq!(first.status, InsightsStatus::Complete);
    assert_eq!(first.generated, 4);
    assert_eq!(generator.calls(), 4);

    let second = p.run(t0() + chrono::Duration::hours(1)).await;
    assert_eq!(second.fresh, 4);
    assert_eq!(second.generated, 0);
    assert_eq!(generator.calls(), 4, "delta-skip makes zero generator calls");

    let stored = p.store().get_insight(&InsightKey::new("MD", "summary")).await.unwrap().unwrap();
    assert_eq!(stored.content, "MD summary");
    assert_eq!(stored.provider, "scripted");
    assert_eq!(stored.generated_at, t0());
  }

  #[tokio::test]
  async fn changed_or_aged_signals_regenerate() {
    let signals = StaticSignals::new(&[("MD", 3, false), ("VA", 1, false)]);
    let generator = ScriptedGenerator::with([]);
    let p = pipeline(signals.clone(), generator.clone(), settings()).await;
    p.run(t0()).await;

    signals.set(&[("MD", 4, false), ("VA", 1, false)]);
    let changed = p.run(t0() + chrono::Duration::hours(1)).await;
    assert_eq!((changed.generated, changed.fresh), (2, 2));

    let aged = p.run(t0() + chrono::Duration::minutes(24 * 60 + 30)).await;
    assert_eq!(aged.generated, 2, "VA entries from t0 are past max age");
    assert_eq!(aged.fresh, 2);
  }

  #[tokio::test]
  async fn rate_limits_are_retried_with_backoff() {
    let generator = ScriptedGenerator::with([Err(GenerateError::RateLimited), Err(GenerateError::RateLimited)]);
    let p = pipeline(
      StaticSignals::new(&[("MD", 1, false)]),
      generator.clone(),
      InsightsSettings { roles: vec!["summary".into()], ..settings() },
    )
    .await;

    let report = p.run(t0()).await;
    assert_eq!(report.generated, 1);
    assert_eq!(generator.calls(), 3);
  }

  #[tokio::test]
  async fn rate_limit_gives_up_after_three_attempts() {
    let generator = ScriptedGenerator::with((0..3).map(|_| Err(GenerateError::RateLimited)));
    let p = pipeline(
      StaticSignals::new(&[("MD", 1, false)]),
      generator.clone(),
      InsightsSettings { roles: vec!["summary".into()], ..settings() },
    )
    .await;

    let report = p.run(t0()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(generator.calls(), 3);
    assert!(p.store().get_insight(&InsightKey::new("MD", "summary")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn other_failures_are_not_retried() {
    let generator = ScriptedGenerator::with([Err(GenerateError::Failed("boom".into()))]);
    let p = pipeline(
      StaticSignals::new(&[("MD", 1, false)]),
      generator.clone(),
      InsightsSettings { roles: vec!["summary".into()], ..settings() },
    )
    .await;

    let report = p.run(t0()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(generator.calls(), 1);
  }

  #[tokio::test]
  async fn urgent_run_defers_to_main_and_covers_critical_only() {
    let generator = ScriptedGenerator::with([]);
    let p = pipeline(StaticSignals::new(&[("MD", 3, true), ("VA", 1, false)]), generator.clone(), settings()).await;

    p.main_lock().set_in_progress(true);
    let deferred = p.run_urgent(t0()).await;
    assert_eq!(deferred.status, InsightsStatus::Deferred);
    assert_eq!(generator.calls(), 0);

    let skipped = p.run(t0()).await;
    assert_eq!(skipped.status, InsightsStatus::Skipped);

    p.main_lock().set_in_progress(false);
    let urgent = p.run_urgent(t0()).await;
    assert_eq!(urgent.status, InsightsStatus::Complete);
    let keys: Vec<_> = urgent.items.iter().map(|i| (i.key.partition.as_str(), i.key.role.as_str())).collect();
    assert_eq!(keys, [("MD", "summary")]);
  }

  #[tokio::test]
  async fn concurrency_is_bounded() {
    let generator = Arc::new(ScriptedGenerator { latency: Duration::from_millis(20), ..Default::default() });
    let partitions: Vec<(String, u64, bool)> = (0..6).map(|i| (format!("P{i}"), i, false)).collect();
    let refs: Vec<(&str, u64, bool)> = partitions.iter().map(|(p, n, c)| (p.as_str(), *n, *c)).collect();
    let p = pipeline(StaticSignals::new(&refs), generator.clone(), InsightsSettings { concurrency: 2, ..settings() }).await;

    let report = p.run(t0()).await;
    assert_eq!(report.generated, 12);
    assert!(generator.peak.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn registry_signals_count_and_flag_alerts() {
    let cache = Arc::new(CacheStore::new(sid("echo"), GridIndex::default(), None));
    let orch = Arc::new(BuildOrchestrator::new(
      Arc::new(ScriptedAdapter::new("echo", &["MD"])),
      cache.clone(),
      DEFAULT_BUILD_TIMEOUT,
    ));
    let registry = Arc::new(SourceRegistry::new([SourceEntry::local(orch, SchedulePolicy::default(), true)]).unwrap());

    let mut records = vec![
      GeoRecord::new("violation", "v1", 38.9, -77.0).with_alert(true),
      GeoRecord::new("facility", "f1", 38.9, -77.0),
      GeoRecord::new("facility", "f2", 37.5, -77.4),
    ];
    records[0].partition = Some("MD".into());
    records[1].partition = Some("MD".into());
    records[2].partition = Some("VA".into());
    cache.publish(tidewater_core::blob::CacheBlob::build(
      &GridIndex::default(),
      records,
      Default::default(),
      t0(),
    ));

    let signals = RegistrySignals::new(registry).collect();
    assert_eq!(signals.len(), 2);
    let md = &signals[0];
    assert_eq!(md.partition, "MD");
    assert!(md.critical);
    assert_eq!(md.signals["sources"]["echo"]["counts"]["facility"], 1);
    assert_eq!(md.signals["sources"]["echo"]["alertKeys"][0], "violation:v1");
    assert!(!signals[1].critical);
  }

  #[tokio::test]
  async fn http_generator_maps_status_codes() {
    let base = serve(
      Router::new()
        .route("/ok", post(|| async { Json(json!({ "content": "Two violations near Baltimore." })) }))
        .route("/busy", post(|| async { AxumStatus::TOO_MANY_REQUESTS }))
        .route("/down", post(|| async { AxumStatus::BAD_GATEWAY })),
    )
    .await;
    let key = InsightKey::new("MD", "summary");
    let generator =
      |path: &str| HttpInsightGenerator::new(format!("{base}{path}"), None, "http", Duration::from_secs(5)).unwrap();

    assert_eq!(generator("/ok").generate(&key, &json!({})).await.unwrap(), "Two violations near Baltimore.");
    assert!(matches!(generator("/busy").generate(&key, &json!({})).await, Err(GenerateError::RateLimited)));
    assert!(matches!(generator("/down").generate(&key, &json!({})).await, Err(GenerateError::Failed(_))));
  }
}
