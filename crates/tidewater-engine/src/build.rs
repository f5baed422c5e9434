//! The rebuild procedure shared by every source.
//!
//! 1. Take the source's [`BuildLock`]; if held, report `skipped`.
//! 2. Page every partition through the adapter, transform, validate and
//!    dedupe (first seen wins). A failing partition is logged and skipped.
//! 3. Retry each failed partition exactly once after an extra delay.
//! 4. Grid-index everything that was collected.
//! 5. If nothing was collected, report `empty` and leave the published
//!    cache untouched.
//! 6. Otherwise publish atomically (the disk save follows in the background)
//!    and report `complete`.
//!
//! The lock is released on every path, including panics.

use std::{
  any::Any,
  collections::{BTreeMap, HashMap, HashSet},
  panic::AssertUnwindSafe,
  sync::Arc,
  time::{Duration, Instant},
};

use chrono::Utc;
use futures::{FutureExt as _, StreamExt as _, stream};
use serde::{Deserialize, Serialize};
use tidewater_core::{
  blob::{BuildSummary, CacheBlob},
  record::GeoRecord,
  source::SourceId,
};
use tracing::{debug, error, info, warn};

use crate::{
  adapter::{PageRequest, SourceAdapter},
  cache::CacheStore,
  lock::BuildLock,
  upstream::UpstreamError,
};

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
  /// A new blob was published.
  Complete,
  /// Another build for the source was already running.
  Skipped,
  /// Every partition failed or returned nothing; the old blob stays.
  Empty,
  /// The build itself broke (panic or remote trigger failure).
  Error,
}

/// Structured result of one build, returned by every trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
  pub source:               SourceId,
  pub status:               BuildStatus,
  #[serde(default)]
  pub record_counts:        BTreeMap<String, usize>,
  #[serde(default)]
  pub total_records:        usize,
  #[serde(default)]
  pub partitions_processed: Vec<String>,
  #[serde(default)]
  pub partitions_failed:    Vec<String>,
  #[serde(default)]
  pub duration_ms:          u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error:                Option<String>,
}

impl BuildReport {
  fn bare(source: SourceId, status: BuildStatus, elapsed: Duration) -> Self {
    Self {
      source,
      status,
      record_counts: BTreeMap::new(),
      total_records: 0,
      partitions_processed: Vec::new(),
      partitions_failed: Vec::new(),
      duration_ms: millis(elapsed),
      error: None,
    }
  }

  pub fn skipped(source: SourceId) -> Self { Self::bare(source, BuildStatus::Skipped, Duration::ZERO) }

  pub fn error(source: SourceId, message: impl Into<String>, elapsed: Duration) -> Self {
    Self { error: Some(message.into()), ..Self::bare(source, BuildStatus::Error, elapsed) }
  }
}

fn millis(d: Duration) -> u64 { u64::try_from(d.as_millis()).unwrap_or(u64::MAX) }

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct BuildOrchestrator {
  adapter: Arc<dyn SourceAdapter>,
  cache:   Arc<CacheStore>,
  lock:    Arc<BuildLock>,
}

type PartitionResult = (String, Result<Vec<GeoRecord>, UpstreamError>);

impl BuildOrchestrator {
  pub fn new(adapter: Arc<dyn SourceAdapter>, cache: Arc<CacheStore>, lock_timeout: Duration) -> Self {
    let lock = Arc::new(BuildLock::new(format!("build:{}", adapter.source()), lock_timeout));
    Self { adapter, cache, lock }
  }

  pub fn source(&self) -> &SourceId { self.adapter.source() }

  pub fn cache(&self) -> &Arc<CacheStore> { &self.cache }

  pub fn lock(&self) -> &Arc<BuildLock> { &self.lock }

  /// Run one build. Never fails: every outcome is a [`BuildReport`].
  pub async fn run(&self) -> BuildReport {
    let source = self.source().clone();
    let Some(guard) = self.lock.try_acquire() else {
      info!(source = %source, "build already in progress; skipping");
      return BuildReport::skipped(source);
    };

    let started = Instant::now();
    info!(source = %source, partitions = self.adapter.partitions().len(), "build started");
    let outcome = AssertUnwindSafe(self.build(started)).catch_unwind().await;
    drop(guard);

    match outcome {
      Ok(report) => report,
      Err(panic) => {
        let message = panic_message(panic.as_ref());
        error!(source = %source, error = %message, "build panicked");
        BuildReport::error(source, format!("build panicked: {message}"), started.elapsed())
      }
    }
  }

  async fn build(&self, started: Instant) -> BuildReport {
    let source = self.source().clone();
    let partitions = self.adapter.partitions().to_vec();

    let mut collected: HashMap<String, Vec<GeoRecord>> = HashMap::new();
    let mut failed = Vec::new();
    for (partition, result) in self.fetch_all(&partitions).await {
      match result {
        Ok(records) => {
          collected.insert(partition, records);
        }
        Err(e) => {
          warn!(source = %source, partition = %partition, error = %e, "partition failed");
          failed.push(partition);
        }
      }
    }

    if !failed.is_empty() {
      let delay = self.adapter.pacing().retry_delay();
      info!(source = %source, failed = failed.len(), delay_ms = millis(delay), "retrying failed partitions once");
      tokio::time::sleep(delay).await;
      // Keep priority order for the retry pass.
      failed.sort_by_key(|p| partitions.iter().position(|q| q == p));
      for (partition, result) in self.fetch_all(&failed).await {
        match result {
          Ok(records) => {
            info!(source = %source, partition = %partition, records = records.len(), "partition recovered on retry");
            collected.insert(partition, records);
          }
          Err(e) => {
            warn!(source = %source, partition = %partition, error = %e, "partition failed again; giving up");
          }
        }
      }
    }

    let mut records = Vec::new();
    let mut processed = Vec::new();
    let mut partitions_failed = Vec::new();
    for partition in &partitions {
      match collected.remove(partition) {
        Some(batch) => {
          processed.push(partition.clone());
          records.extend(batch);
        }
        None => partitions_failed.push(partition.clone()),
      }
    }

    if records.is_empty() {
      warn!(
        source = %source,
        failed = partitions_failed.len(),
        "build produced no records; keeping previous cache"
      );
      return BuildReport {
        partitions_processed: processed,
        partitions_failed,
        ..BuildReport::bare(source, BuildStatus::Empty, started.elapsed())
      };
    }

    let summary = BuildSummary {
      partitions_processed: processed.clone(),
      partitions_failed:    partitions_failed.clone(),
      build_duration_ms:    millis(started.elapsed()),
    };
    let blob = self.cache.publish(CacheBlob::build(self.cache.index(), records, summary, Utc::now()));

    let report = BuildReport {
      source:               source.clone(),
      status:               BuildStatus::Complete,
      record_counts:        blob.meta.record_counts.clone(),
      total_records:        blob.total_records(),
      partitions_processed: processed,
      partitions_failed,
      duration_ms:          millis(started.elapsed()),
      error:                None,
    };
    info!(
      source = %source,
      records = report.total_records,
      failed = report.partitions_failed.len(),
      elapsed_ms = report.duration_ms,
      "build complete"
    );
    report
  }

  /// Fetch `partitions` with the adapter's concurrency. Results come back in
  /// completion order.
  ///
  /// Starts are paced by `partition_delay`: the first pooled wave is
  /// staggered one delay apart, and every later start waits one delay.
  async fn fetch_all(&self, partitions: &[String]) -> Vec<PartitionResult> {
    let width = self.adapter.concurrency().width();
    let delay = self.adapter.pacing().partition_delay();

    stream::iter(partitions.iter().cloned().enumerate())
      .map(|(i, partition)| async move {
        let wait = match i {
          0 => Duration::ZERO,
          i if i < width => delay * u32::try_from(i).unwrap_or(u32::MAX),
          _ => delay,
        };
        if !wait.is_zero() {
          tokio::time::sleep(wait).await;
        }
        let result = self.fetch_partition(&partition).await;
        (partition, result)
      })
      .buffer_unordered(width)
      .collect()
      .await
  }

  /// Page through one partition. Any page error fails the whole partition.
  async fn fetch_partition(&self, partition: &str) -> Result<Vec<GeoRecord>, UpstreamError> {
    let pacing = self.adapter.pacing();
    let mut request = PageRequest::first(pacing.page_size.max(1));
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut records = Vec::new();
    let mut dropped = 0usize;
    let mut duplicates = 0usize;

    loop {
      let page = self.adapter.fetch_page(partition, request).await?;
      for row in &page.rows {
        match self.adapter.transform(partition, row) {
          Some(mut record) if record.is_resolvable() => {
            if record.partition.is_none() {
              record.partition = Some(partition.to_owned());
            }
            if seen.insert(record.dedupe_key()) {
              records.push(record);
            } else {
              duplicates += 1;
            }
          }
          _ => dropped += 1,
        }
      }

      if !page.has_more {
        break;
      }
      if request.index + 1 >= pacing.max_pages {
        warn!(
          source = %self.source(),
          partition,
          pages = request.index + 1,
          "page cap reached; truncating partition"
        );
        break;
      }
      tokio::time::sleep(pacing.page_delay()).await;
      request = request.next();
    }

    debug!(
      source = %self.source(),
      partition,
      records = records.len(),
      dropped,
      duplicates,
      "partition fetched"
    );
    Ok(records)
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_owned()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_owned()
  }
}

#[cfg(test)]
mod tests {
  use tidewater_core::grid::GridIndex;

  use super::*;
  use crate::{
    adapter::PartitionConcurrency,
    lock::DEFAULT_BUILD_TIMEOUT,
    persist::DiskPersistence,
    testing::{ScriptedAdapter, Step, row, sid},
  };

  fn orchestrator(adapter: ScriptedAdapter, disk: Option<DiskPersistence>) -> BuildOrchestrator {
    let cache = Arc::new(CacheStore::new(adapter.source().clone(), GridIndex::default(), disk));
    BuildOrchestrator::new(Arc::new(adapter), cache, DEFAULT_BUILD_TIMEOUT)
  }

  fn abc() -> ScriptedAdapter { ScriptedAdapter::new("echo-facilities", &["A", "B", "C"]) }

  #[tokio::test]
  async fn failed_partition_is_retried_once_and_merged() {
    let adapter = abc()
      .script("A", [Step::rows(vec![row("a1", 38.95, -77.05), row("a2", 39.3, -76.6)])])
      .script("B", [Step::Fail(500), Step::rows(vec![row("b1", 36.1, -120.2)])])
      .script("C", [Step::rows(vec![row("c1", 40.7, -74.0)])]);
    let calls = adapter.calls();
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(report.status, BuildStatus::Complete);
    assert_eq!(report.total_records, 4);
    assert_eq!(report.partitions_processed, ["A", "B", "C"]);
    assert!(report.partitions_failed.is_empty());
    assert_eq!(calls.get("B"), 2);
    assert_eq!(calls.get("A"), 1);
    assert_eq!(orch.cache().snapshot().unwrap().meta.partitions_processed.len(), 3);
  }

  #[tokio::test]
  async fn partition_failing_twice_is_reported_but_build_completes() {
    let adapter = abc()
      .script("A", [Step::rows(vec![row("a1", 38.95, -77.05)])])
      .script("B", [Step::Fail(500), Step::Fail(503)])
      .script("C", [Step::rows(vec![row("c1", 40.7, -74.0)])]);
    let calls = adapter.calls();
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(report.status, BuildStatus::Complete);
    assert_eq!(report.partitions_failed, ["B"]);
    assert_eq!(report.total_records, 2);
    assert_eq!(calls.get("B"), 2);
  }

  #[tokio::test]
  async fn total_failure_keeps_previous_cache_and_skips_disk() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskPersistence::new(dir.path());
    let adapter = abc()
      .script("A", [Step::rows(vec![row("a1", 38.95, -77.05)]), Step::Fail(500), Step::Fail(500)])
      .script("B", [Step::rows(vec![row("b1", 36.1, -120.2)]), Step::Fail(500), Step::Fail(500)])
      .script("C", [Step::rows(vec![]), Step::Fail(500), Step::Fail(500)]);
    let orch = orchestrator(adapter, Some(disk.clone()));

    assert_eq!(orch.run().await.status, BuildStatus::Complete);
    orch.cache().flush().await;
    let before = orch.cache().snapshot().unwrap();
    let bytes_before = std::fs::read(disk.path_for(&sid("echo-facilities"))).unwrap();
    std::fs::remove_file(disk.path_for(&sid("echo-facilities"))).unwrap();

    let report = orch.run().await;
    orch.cache().flush().await;
    assert_eq!(report.status, BuildStatus::Empty);
    assert_eq!(report.partitions_failed, ["A", "B", "C"]);

    let after = orch.cache().snapshot().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(serde_json::to_vec(&*after).unwrap(), bytes_before);
    assert!(!disk.path_for(&sid("echo-facilities")).exists(), "empty build must not write to disk");
  }

  #[tokio::test]
  async fn all_partitions_failing_on_cold_cache_stays_unloaded() {
    let adapter = abc()
      .script("A", [Step::Fail(500), Step::Fail(500)])
      .script("B", [Step::Fail(502), Step::Fail(502)])
      .script("C", [Step::Fail(504), Step::Fail(504)]);
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(report.status, BuildStatus::Empty);
    assert!(!orch.cache().status().is_loaded());
  }

  #[tokio::test]
  async fn rebuild_with_identical_data_does_not_grow() {
    let rows = vec![row("a1", 38.95, -77.05), row("a1", 38.95, -77.05), row("a2", 39.3, -76.6)];
    let adapter = ScriptedAdapter::new("nwis", &["MD"])
      .script("MD", [Step::rows(rows.clone()), Step::rows(rows)]);
    let orch = orchestrator(adapter, None);

    let first = orch.run().await;
    let second = orch.run().await;
    assert_eq!(first.total_records, 2);
    assert_eq!(second.total_records, first.total_records);
    assert_eq!(second.record_counts, first.record_counts);
  }

  #[tokio::test]
  async fn unresolvable_rows_are_dropped() {
    let adapter = ScriptedAdapter::new("nwis", &["CA"]).script("CA", [Step::rows(vec![
      row("good", 36.1, -120.2),
      row("sentinel", -88.0, -120.0),
      row("zero", 0.0, -120.0),
      serde_json::json!({"key": "text", "lat": "n/a", "lng": "-120"}),
    ])]);
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(report.total_records, 1);
  }

  #[tokio::test]
  async fn pages_are_followed_until_short_page() {
    let adapter = ScriptedAdapter::new("ceden-chemistry", &["2025"]).script("2025", [
      Step::page(vec![row("a", 36.1, -120.2), row("b", 36.2, -120.3)]),
      Step::page(vec![row("c", 36.3, -120.4), row("a", 36.1, -120.2)]),
      Step::rows(vec![row("d", 36.4, -120.5)]),
    ]);
    let calls = adapter.calls();
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(calls.get("2025"), 3);
    assert_eq!(report.total_records, 4);
  }

  #[tokio::test]
  async fn page_cap_truncates_partition() {
    let mut adapter = ScriptedAdapter::new("nwis", &["TX"]).script("TX", [
      Step::page(vec![row("a", 30.1, -97.7)]),
      Step::page(vec![row("b", 30.2, -97.8)]),
      Step::page(vec![row("c", 30.3, -97.9)]),
    ]);
    adapter.pacing.max_pages = 2;
    let calls = adapter.calls();
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(calls.get("TX"), 2);
    assert_eq!(report.total_records, 2);
  }

  #[tokio::test]
  async fn concurrent_runs_do_upstream_work_once() {
    let mut adapter = ScriptedAdapter::new("nwis", &["MD"])
      .script("MD", [Step::rows(vec![row("a", 38.95, -77.05)])]);
    adapter.latency = Duration::from_millis(50);
    let calls = adapter.calls();
    let orch = orchestrator(adapter, None);

    let (first, second) = tokio::join!(orch.run(), orch.run());
    let mut statuses = [first.status, second.status];
    statuses.sort_by_key(|s| *s as u8);
    assert_eq!(statuses, [BuildStatus::Complete, BuildStatus::Skipped]);
    assert_eq!(calls.total(), 1);
    assert!(!orch.lock().is_in_progress());
  }

  #[tokio::test]
  async fn panicking_adapter_reports_error_and_releases_lock() {
    let adapter = ScriptedAdapter::new("nwis", &["MD"]).script("MD", [Step::Panic]);
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(report.status, BuildStatus::Error);
    assert!(report.error.unwrap().contains("panicked"));
    assert!(!orch.lock().is_in_progress());
  }

  #[tokio::test]
  async fn pooled_partitions_keep_priority_order_in_report() {
    let mut adapter = ScriptedAdapter::new("echo-facilities", &["CA", "MD", "TX", "VA", "NY", "PA"]);
    for (i, p) in ["CA", "MD", "TX", "VA", "NY", "PA"].into_iter().enumerate() {
      adapter = adapter.script(p, [Step::rows(vec![row(p, 30.0 + i as f64, -80.0)])]);
    }
    adapter.concurrency = PartitionConcurrency::pooled(5);
    let orch = orchestrator(adapter, None);

    let report = orch.run().await;
    assert_eq!(report.partitions_processed, ["CA", "MD", "TX", "VA", "NY", "PA"]);
    assert_eq!(report.total_records, 6);
  }

  #[tokio::test]
  async fn pooled_starts_are_staggered_by_partition_delay() {
    let mut adapter = abc()
      .script("A", [Step::rows(vec![row("a", 38.9, -77.0)])])
      .script("B", [Step::rows(vec![row("b", 38.9, -77.0)])])
      .script("C", [Step::rows(vec![row("c", 38.9, -77.0)])]);
    adapter.concurrency = PartitionConcurrency::pooled(5);
    adapter.pacing.partition_delay_ms = 100;
    let orch = orchestrator(adapter, None);

    let started = Instant::now();
    let report = orch.run().await;
    assert_eq!(report.total_records, 3);
    // C is the third slot of the first wave: two delays before it starts.
    assert!(started.elapsed() >= Duration::from_millis(200), "{:?}", started.elapsed());
  }

  #[test]
  fn report_serialises_camel_case() {
    let report = BuildReport::skipped(sid("nwis"));
    let v = serde_json::to_value(&report).unwrap();
    assert_eq!(v["status"], "skipped");
    assert_eq!(v["source"], "nwis");
    assert!(v["partitionsProcessed"].is_array());
    assert!(v.get("error").is_none());
  }
}
