//! Shared fixtures for engine tests.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use tidewater_core::{
  blob::{BuildSummary, CacheBlob},
  grid::GridIndex,
  record::{GeoRecord, parse_number, parse_text},
  source::SourceId,
};

use crate::{
  adapter::{Page, PageRequest, Pacing, PartitionConcurrency, SourceAdapter},
  upstream::UpstreamError,
};

pub fn sid(s: &str) -> SourceId { SourceId::new(s).unwrap() }

pub fn blob_with(points: &[(&str, f64, f64)]) -> CacheBlob {
  let records = points
    .iter()
    .map(|(key, lat, lng)| GeoRecord::new("facility", *key, *lat, *lng))
    .collect();
  CacheBlob::build(
    &GridIndex::default(),
    records,
    BuildSummary::default(),
    Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
  )
}

pub fn row(key: &str, lat: f64, lng: f64) -> Value { json!({ "key": key, "lat": lat, "lng": lng }) }

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: axum::Router) -> String {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
  format!("http://{addr}")
}

// ─── Scripted adapter ────────────────────────────────────────────────────────

/// One scripted upstream response.
#[derive(Debug, Clone)]
pub enum Step {
  Rows { rows: Vec<Value>, has_more: bool },
  Fail(u16),
  Panic,
}

impl Step {
  /// Final page of a partition.
  pub fn rows(rows: Vec<Value>) -> Self { Self::Rows { rows, has_more: false } }

  /// A full page with more to follow.
  pub fn page(rows: Vec<Value>) -> Self { Self::Rows { rows, has_more: true } }
}

/// Fetch counts per partition, shared with the test after the adapter is
/// moved into an orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<HashMap<String, usize>>>);

impl CallLog {
  pub fn get(&self, partition: &str) -> usize {
    self.0.lock().unwrap().get(partition).copied().unwrap_or(0)
  }

  pub fn total(&self) -> usize { self.0.lock().unwrap().values().sum() }

  fn hit(&self, partition: &str) { *self.0.lock().unwrap().entry(partition.to_owned()).or_default() += 1; }
}

/// Adapter that replays scripted responses per partition. An exhausted
/// script answers with an empty final page.
pub struct ScriptedAdapter {
  source:          SourceId,
  partitions:      Vec<String>,
  scripts:         Mutex<HashMap<String, VecDeque<Step>>>,
  calls:           CallLog,
  pub pacing:      Pacing,
  pub concurrency: PartitionConcurrency,
  pub latency:     Duration,
}

impl ScriptedAdapter {
  pub fn new(source: &str, partitions: &[&str]) -> Self {
    Self {
      source:      sid(source),
      partitions:  partitions.iter().map(|p| (*p).to_owned()).collect(),
      scripts:     Mutex::new(HashMap::new()),
      calls:       CallLog::default(),
      pacing:      Pacing::immediate(),
      concurrency: PartitionConcurrency::Sequential,
      latency:     Duration::ZERO,
    }
  }

  pub fn script(self, partition: &str, steps: impl IntoIterator<Item = Step>) -> Self {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(partition.to_owned())
      .or_default()
      .extend(steps);
    self
  }

  pub fn calls(&self) -> CallLog { self.calls.clone() }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
  fn source(&self) -> &SourceId { &self.source }

  fn partitions(&self) -> &[String] { &self.partitions }

  fn concurrency(&self) -> PartitionConcurrency { self.concurrency }

  fn pacing(&self) -> &Pacing { &self.pacing }

  async fn fetch_page(&self, partition: &str, _page: PageRequest) -> Result<Page, UpstreamError> {
    self.calls.hit(partition);
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    let step = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(partition)
      .and_then(VecDeque::pop_front);
    match step {
      None => Ok(Page::single(Vec::new())),
      Some(Step::Rows { rows, has_more }) => Ok(Page { rows, has_more }),
      Some(Step::Fail(status)) => Err(UpstreamError::Rejected { url: format!("scripted://{partition}"), status }),
      Some(Step::Panic) => panic!("scripted panic for {partition}"),
    }
  }

  fn transform(&self, _partition: &str, row: &Value) -> Option<GeoRecord> {
    let key = parse_text(&row["key"])?;
    let lat = parse_number(&row["lat"])?;
    let lng = parse_number(&row["lng"])?;
    let kind = parse_text(&row["kind"]).unwrap_or_else(|| "facility".to_owned());
    Some(GeoRecord::new(kind, key, lat, lng).with_alert(row["alert"].as_bool().unwrap_or(false)))
  }
}
