//! The `CoordinationStore` trait: persisted scheduler rows, soft locks and
//! the health log.
//!
//! This is the only state shared across server instances. Locks are TTL
//! reservations taken by compare-and-swap on `{lock_owner, lock_until}`; an
//! expired reservation is free without anyone releasing it.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
  schedule::{HealthEntry, RunRecord, SchedulePolicy, SchedulerRow},
  source::SourceId,
};

/// Abstraction over the coordination backend (e.g. `tidewater-store-sqlite`).
///
/// All methods return `Send` futures so the trait can be used from axum
/// handlers and spawned tasks.
pub trait CoordinationStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Schedule rows ─────────────────────────────────────────────────────

  /// Create the row for `source` if missing; otherwise refresh its policy
  /// columns. `enabled` is only applied on insert so an operator's
  /// `set_enabled` survives restarts.
  fn ensure_source<'a>(
    &'a self,
    source: &'a SourceId,
    policy: SchedulePolicy,
    enabled: bool,
  ) -> impl Future<Output = Result<SchedulerRow, Self::Error>> + Send + 'a;

  fn get_schedule<'a>(
    &'a self,
    source: &'a SourceId,
  ) -> impl Future<Output = Result<Option<SchedulerRow>, Self::Error>> + Send + 'a;

  /// All rows, ordered by source id.
  fn list_schedules(
    &self,
  ) -> impl Future<Output = Result<Vec<SchedulerRow>, Self::Error>> + Send + '_;

  /// Returns `false` if the source has no row.
  fn set_enabled<'a>(
    &'a self,
    source: &'a SourceId,
    enabled: bool,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  // ── Soft lock ─────────────────────────────────────────────────────────

  /// Take the reservation if it is free or expired at `now`. A live
  /// reservation is never granted again, not even to its own holder.
  /// Returns `true` when `owner` now holds it until `until`.
  fn try_acquire_lock<'a>(
    &'a self,
    source: &'a SourceId,
    owner: &'a str,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Clear the reservation if `owner` still holds it.
  fn release_lock<'a>(
    &'a self,
    source: &'a SourceId,
    owner: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Runs & health ─────────────────────────────────────────────────────

  /// Write the outcome of a completed run back to the row.
  fn record_run<'a>(
    &'a self,
    source: &'a SourceId,
    run: RunRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn append_health(
    &self,
    entry: HealthEntry,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Newest first.
  fn recent_health<'a>(
    &'a self,
    source: &'a SourceId,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<HealthEntry>, Self::Error>> + Send + 'a;
}
