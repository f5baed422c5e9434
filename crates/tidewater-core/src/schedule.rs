//! Scheduler rows and the backoff policy that drives them.
//!
//! Each source has one persisted [`SchedulerRow`]. Per tick it moves
//! `Idle(due) → Locked-Running → Idle(next_due)`; the next due time comes
//! from [`backoff_minutes`].

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, source::SourceId};

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Per-source cadence settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePolicy {
  pub base_interval_min: u32,
  pub max_interval_min:  u32,
  /// Jitter applied to every computed interval, in percent (0..=100).
  pub jitter_pct:        u32,
}

impl Default for SchedulePolicy {
  fn default() -> Self {
    Self { base_interval_min: 60, max_interval_min: 1440, jitter_pct: 10 }
  }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Classification of one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
  /// Build published with every partition processed.
  Success,
  /// Build published but some partitions failed.
  Partial,
  /// Nothing was published.
  Error,
}

impl RunOutcome {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Success => "success",
      Self::Partial => "partial",
      Self::Error => "error",
    }
  }
}

impl fmt::Display for RunOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for RunOutcome {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "success" => Ok(Self::Success),
      "partial" => Ok(Self::Partial),
      "error" => Ok(Self::Error),
      other => Err(Error::UnknownOutcome(other.to_owned())),
    }
  }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Consecutive failure count after a run with `outcome`.
pub fn next_fail_count(outcome: RunOutcome, previous: u32) -> u32 {
  match outcome {
    RunOutcome::Error => previous.saturating_add(1),
    RunOutcome::Success | RunOutcome::Partial => 0,
  }
}

/// Un-jittered interval until the next run.
///
/// success → base; partial → 2 × base; error → base × 2^failures.
/// Every branch is capped at `max_interval_min`.
pub fn backoff_minutes(
  outcome: RunOutcome,
  consecutive_failures: u32,
  policy: &SchedulePolicy,
) -> u32 {
  let base = u64::from(policy.base_interval_min.max(1));
  let max = u64::from(policy.max_interval_min.max(policy.base_interval_min).max(1));
  let raw = match outcome {
    RunOutcome::Success => base,
    RunOutcome::Partial => base.saturating_mul(2),
    RunOutcome::Error => {
      let shift = consecutive_failures.min(32);
      base.saturating_mul(1u64 << shift)
    }
  };
  raw.min(max) as u32
}

/// Apply `±jitter_pct` to `minutes`. `unit` is a uniform sample in
/// `[-1.0, 1.0]`; the result is clamped to `[1, max_interval_min]`.
pub fn jittered(minutes: u32, policy: &SchedulePolicy, unit: f64) -> Duration {
  let unit = if unit.is_finite() { unit.clamp(-1.0, 1.0) } else { 0.0 };
  let pct = f64::from(policy.jitter_pct.min(100)) / 100.0;
  let seconds = f64::from(minutes) * 60.0 * (1.0 + pct * unit);
  let max_seconds = f64::from(policy.max_interval_min.max(policy.base_interval_min).max(1)) * 60.0;
  Duration::seconds(seconds.clamp(60.0, max_seconds).round() as i64)
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Persisted scheduling and soft-lock state for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerRow {
  pub source:      SourceId,
  pub enabled:     bool,
  pub last_run_at: Option<DateTime<Utc>>,
  pub last_status: Option<RunOutcome>,
  pub fail_count:  u32,
  pub next_run_at: Option<DateTime<Utc>>,
  pub policy:      SchedulePolicy,
  pub lock_owner:  Option<String>,
  pub lock_until:  Option<DateTime<Utc>>,
}

impl SchedulerRow {
  pub fn new(source: SourceId, policy: SchedulePolicy, enabled: bool) -> Self {
    Self {
      source,
      enabled,
      last_run_at: None,
      last_status: None,
      fail_count: 0,
      next_run_at: None,
      policy,
      lock_owner: None,
      lock_until: None,
    }
  }

  /// Enabled and either never scheduled or scheduled at/before `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.enabled && self.next_run_at.is_none_or(|next| next <= now)
  }

  /// `true` if another owner holds an unexpired soft lock.
  pub fn is_locked_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
    match (&self.lock_owner, self.lock_until) {
      (Some(holder), Some(until)) => holder != owner && until > now,
      _ => false,
    }
  }
}

/// Result of one completed scheduled run, written back to the row.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
  pub ran_at:      DateTime<Utc>,
  pub outcome:     RunOutcome,
  pub fail_count:  u32,
  pub next_run_at: DateTime<Utc>,
}

/// One line of the per-source health log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEntry {
  pub source:      SourceId,
  pub ran_at:      DateTime<Utc>,
  pub outcome:     RunOutcome,
  pub duration_ms: u64,
  pub records:     Option<u64>,
  pub detail:      Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy() -> SchedulePolicy {
    SchedulePolicy { base_interval_min: 30, max_interval_min: 600, jitter_pct: 0 }
  }

  #[test]
  fn success_uses_base_interval() {
    assert_eq!(backoff_minutes(RunOutcome::Success, 0, &policy()), 30);
  }

  #[test]
  fn partial_doubles_base() {
    assert_eq!(backoff_minutes(RunOutcome::Partial, 0, &policy()), 60);
  }

  #[test]
  fn consecutive_failures_strictly_increase_until_cap() {
    let p = policy();
    let mut fails = 0;
    let mut last = 0;
    let mut seen_cap = false;
    for _ in 0..10 {
      fails = next_fail_count(RunOutcome::Error, fails);
      let interval = backoff_minutes(RunOutcome::Error, fails, &p);
      assert!(interval <= p.max_interval_min);
      if interval == p.max_interval_min {
        seen_cap = true;
        assert!(interval >= last);
      } else {
        assert!(interval > last, "{interval} should exceed {last}");
      }
      last = interval;
    }
    assert!(seen_cap);

    let reset = next_fail_count(RunOutcome::Success, fails);
    assert_eq!(reset, 0);
    assert_eq!(backoff_minutes(RunOutcome::Success, reset, &p), 30);
  }

  #[test]
  fn huge_fail_counts_do_not_overflow() {
    assert_eq!(backoff_minutes(RunOutcome::Error, u32::MAX, &policy()), 600);
  }

  #[test]
  fn jitter_stays_within_percent() {
    let p = SchedulePolicy { base_interval_min: 100, max_interval_min: 1000, jitter_pct: 10 };
    assert_eq!(jittered(100, &p, 0.0), Duration::minutes(100));
    assert_eq!(jittered(100, &p, 1.0), Duration::minutes(110));
    assert_eq!(jittered(100, &p, -1.0), Duration::minutes(90));
    assert_eq!(jittered(1000, &p, 1.0), Duration::minutes(1000));
  }

  #[test]
  fn due_when_never_scheduled_or_past() {
    let now = Utc::now();
    let mut row = SchedulerRow::new(SourceId::new("nwis").unwrap(), policy(), true);
    assert!(row.is_due(now));
    row.next_run_at = Some(now + Duration::minutes(5));
    assert!(!row.is_due(now));
    row.next_run_at = Some(now - Duration::minutes(5));
    assert!(row.is_due(now));
    row.enabled = false;
    assert!(!row.is_due(now));
  }

  #[test]
  fn outcome_round_trips_through_str() {
    for o in [RunOutcome::Success, RunOutcome::Partial, RunOutcome::Error] {
      assert_eq!(o.as_str().parse::<RunOutcome>().unwrap(), o);
    }
    assert!("weird".parse::<RunOutcome>().is_err());
  }
}
