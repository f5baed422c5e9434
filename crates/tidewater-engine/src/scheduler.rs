//! Cross-source, cross-instance rebuild scheduling.
//!
//! A tick walks every registered source: refresh its row, skip it unless it
//! is enabled and due, take the soft lock, trigger the build, log health,
//! compute the next due time with backoff and jitter, then release the lock.
//! Due sources run concurrently; each owns its own lock and cache.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use tidewater_core::{
  coordination::CoordinationStore,
  schedule::{HealthEntry, RunOutcome, RunRecord, SchedulerRow, backoff_minutes, jittered, next_fail_count},
  source::SourceId,
};
use tracing::{debug, info, warn};

use crate::{
  Error, Result,
  build::{BuildReport, BuildStatus},
  registry::{SourceEntry, SourceRegistry},
};

/// Default soft-lock reservation length.
pub const DEFAULT_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Map a build report onto the scheduler's three outcomes.
///
/// A skipped build means another build is already refreshing the source,
/// so it counts as a success for backoff purposes.
pub fn classify(report: &BuildReport) -> RunOutcome {
  match report.status {
    BuildStatus::Complete if report.partitions_failed.is_empty() => RunOutcome::Success,
    BuildStatus::Complete => RunOutcome::Partial,
    BuildStatus::Skipped => RunOutcome::Success,
    BuildStatus::Empty | BuildStatus::Error => RunOutcome::Error,
  }
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum TickResult {
  #[serde(rename_all = "camelCase")]
  Ran {
    outcome:     RunOutcome,
    status:      BuildStatus,
    records:     usize,
    fail_count:  u32,
    next_run_at: DateTime<Utc>,
  },
  Disabled,
  #[serde(rename_all = "camelCase")]
  NotDue { next_run_at: Option<DateTime<Utc>> },
  /// Another tick or instance holds the soft lock.
  Locked,
  /// The coordination store failed; the source was not run.
  Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceTick {
  pub source: SourceId,
  #[serde(flatten)]
  pub result: TickResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
  pub started_at: DateTime<Utc>,
  pub ran:        usize,
  pub sources:    Vec<SourceTick>,
}

impl TickReport {
  pub fn get(&self, source: &SourceId) -> Option<&TickResult> {
    self.sources.iter().find(|t| &t.source == source).map(|t| &t.result)
  }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct Scheduler<S> {
  store:    Arc<S>,
  registry: Arc<SourceRegistry>,
  owner:    String,
  lock_ttl: Duration,
}

impl<S> Clone for Scheduler<S> {
  fn clone(&self) -> Self {
    Self {
      store:    Arc::clone(&self.store),
      registry: Arc::clone(&self.registry),
      owner:    self.owner.clone(),
      lock_ttl: self.lock_ttl,
    }
  }
}

impl<S: CoordinationStore> Scheduler<S> {
  pub fn new(
    store: Arc<S>,
    registry: Arc<SourceRegistry>,
    owner: impl Into<String>,
    lock_ttl: std::time::Duration,
  ) -> Self {
    let lock_ttl = Duration::from_std(lock_ttl).unwrap_or(Duration::minutes(5));
    Self { store, registry, owner: owner.into(), lock_ttl }
  }

  pub fn owner(&self) -> &str { &self.owner }

  pub fn store(&self) -> &Arc<S> { &self.store }
}

impl<S: CoordinationStore + 'static> Scheduler<S> {
  /// Run every due source once.
  ///
  /// Each source runs on its own task, so dropping the returned future
  /// (a disconnected cron caller, a timeout) never stops a build halfway
  /// or leaves a run unrecorded.
  pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
    let tasks = self.registry.ids().cloned().map(|id| {
      let this = self.clone();
      let task_id = id.clone();
      let handle = tokio::spawn(async move { this.tick_source(&task_id, now).await });
      async move {
        let result = match handle.await {
          Ok(Ok(result)) => result,
          Ok(Err(e)) => {
            warn!(source = %id, error = %e, "scheduler tick failed for source");
            TickResult::Failed { error: e.to_string() }
          }
          Err(e) => {
            warn!(source = %id, error = %e, "scheduler task aborted");
            TickResult::Failed { error: e.to_string() }
          }
        };
        SourceTick { source: id, result }
      }
    });
    let sources = join_all(tasks).await;

    let ran = sources.iter().filter(|t| matches!(t.result, TickResult::Ran { .. })).count();
    info!(ran, sources = sources.len(), "scheduler tick finished");
    TickReport { started_at: now, ran, sources }
  }

  /// Tick forever at `period`. Missed ticks are skipped, not replayed.
  pub async fn run_every(&self, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      interval.tick().await;
      self.tick(Utc::now()).await;
    }
  }

  async fn tick_source(&self, id: &SourceId, now: DateTime<Utc>) -> Result<TickResult> {
    let entry = self.registry.require(id)?;
    let row = self
      .store
      .ensure_source(id, entry.policy(), entry.enabled())
      .await
      .map_err(Error::coordination)?;

    if !row.enabled {
      return Ok(TickResult::Disabled);
    }
    if !row.is_due(now) {
      debug!(source = %id, next_run_at = ?row.next_run_at, "not due");
      return Ok(TickResult::NotDue { next_run_at: row.next_run_at });
    }

    let acquired = self
      .store
      .try_acquire_lock(id, &self.owner, now, now + self.lock_ttl)
      .await
      .map_err(Error::coordination)?;
    if !acquired {
      info!(source = %id, "soft lock held elsewhere; skipping");
      return Ok(TickResult::Locked);
    }

    let lock = SoftLock {
      store:    Arc::clone(&self.store),
      source:   id.clone(),
      owner:    self.owner.clone(),
      released: false,
    };
    let result = self.run_locked(entry, &row, now).await;
    lock.release().await;
    result
  }

  async fn run_locked(&self, entry: &SourceEntry, row: &SchedulerRow, now: DateTime<Utc>) -> Result<TickResult> {
    let id = entry.id();
    let started = Instant::now();
    let report = entry.trigger().trigger().await;
    let elapsed = started.elapsed();

    let outcome = classify(&report);
    let ran_at = now + Duration::from_std(elapsed).unwrap_or(Duration::zero());

    let health = HealthEntry {
      source: id.clone(),
      ran_at,
      outcome,
      duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
      records: (report.status == BuildStatus::Complete).then_some(report.total_records as u64),
      detail: health_detail(&report),
    };
    if let Err(e) = self.store.append_health(health).await {
      warn!(source = %id, error = %e, "failed to append health log");
    }

    let fail_count = next_fail_count(outcome, row.fail_count);
    let minutes = backoff_minutes(outcome, fail_count, &row.policy);
    let next_run_at = ran_at + jittered(minutes, &row.policy, jitter_unit());

    self
      .store
      .record_run(id, RunRecord { ran_at, outcome, fail_count, next_run_at })
      .await
      .map_err(Error::coordination)?;

    info!(
      source = %id,
      outcome = %outcome,
      status = ?report.status,
      fail_count,
      next_run_at = %next_run_at,
      "scheduled run recorded"
    );
    Ok(TickResult::Ran {
      outcome,
      status: report.status,
      records: report.total_records,
      fail_count,
      next_run_at,
    })
  }
}

/// A held soft lock. Released explicitly after the run; if the run unwinds
/// first, dropping the guard schedules the release instead.
struct SoftLock<S: CoordinationStore + 'static> {
  store:    Arc<S>,
  source:   SourceId,
  owner:    String,
  released: bool,
}

impl<S: CoordinationStore + 'static> SoftLock<S> {
  async fn release(mut self) {
    if let Err(e) = self.store.release_lock(&self.source, &self.owner).await {
      // The TTL frees it eventually.
      warn!(source = %self.source, error = %e, "failed to release soft lock");
    }
    self.released = true;
  }
}

impl<S: CoordinationStore + 'static> Drop for SoftLock<S> {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    let store = Arc::clone(&self.store);
    let source = self.source.clone();
    let owner = std::mem::take(&mut self.owner);
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          if let Err(e) = store.release_lock(&source, &owner).await {
            warn!(source = %source, error = %e, "failed to release soft lock");
          }
        });
      }
      Err(_) => warn!(source = %self.source, "no runtime to release soft lock; left to expire"),
    }
  }
}

fn health_detail(report: &BuildReport) -> Option<String> {
  if let Some(error) = &report.error {
    return Some(error.clone());
  }
  match report.status {
    BuildStatus::Skipped => Some("build already in progress".to_owned()),
    BuildStatus::Empty => Some("no records; previous cache kept".to_owned()),
    _ if !report.partitions_failed.is_empty() => {
      Some(format!("failed partitions: {}", report.partitions_failed.join(",")))
    }
    _ => None,
  }
}

/// Uniform sample in `[-1, 1]`.
fn jitter_unit() -> f64 { f64::from(OsRng.next_u32()) / f64::from(u32::MAX) * 2.0 - 1.0 }
