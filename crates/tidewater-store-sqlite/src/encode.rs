//! Encoding and decoding helpers between domain types and SQLite columns.
//!
//! Timestamps are stored as `YYYY-MM-DDTHH:MM:SS.mmmZ`. The fixed width is
//! what lets lock expiry and health ordering compare as plain text.

use chrono::{DateTime, SecondsFormat, Utc};
use tidewater_core::{
  insight::{InsightEntry, InsightKey},
  schedule::{HealthEntry, RunOutcome, SchedulePolicy, SchedulerRow},
  source::SourceId,
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Millis, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

// ─── Integers ────────────────────────────────────────────────────────────────

fn to_u32(column: &'static str, value: i64) -> Result<u32> {
  u32::try_from(value).map_err(|_| Error::OutOfRange { column, value })
}

fn to_u64(column: &'static str, value: i64) -> Result<u64> {
  u64::try_from(value).map_err(|_| Error::OutOfRange { column, value })
}

pub fn encode_u64(value: u64) -> i64 { i64::try_from(value).unwrap_or(i64::MAX) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column order used by every `source_schedule` SELECT.
pub const SCHEDULE_COLUMNS: &str = "source, enabled, last_run_at, last_status, fail_count, \
   next_run_at, base_interval_min, max_interval_min, jitter_pct, lock_owner, lock_until";

/// Raw values read directly from a `source_schedule` row.
pub struct RawScheduleRow {
  pub source:            String,
  pub enabled:           bool,
  pub last_run_at:       Option<String>,
  pub last_status:       Option<String>,
  pub fail_count:        i64,
  pub next_run_at:       Option<String>,
  pub base_interval_min: i64,
  pub max_interval_min:  i64,
  pub jitter_pct:        i64,
  pub lock_owner:        Option<String>,
  pub lock_until:        Option<String>,
}

impl RawScheduleRow {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      source:            row.get(0)?,
      enabled:           row.get(1)?,
      last_run_at:       row.get(2)?,
      last_status:       row.get(3)?,
      fail_count:        row.get(4)?,
      next_run_at:       row.get(5)?,
      base_interval_min: row.get(6)?,
      max_interval_min:  row.get(7)?,
      jitter_pct:        row.get(8)?,
      lock_owner:        row.get(9)?,
      lock_until:        row.get(10)?,
    })
  }

  pub fn into_row(self) -> Result<SchedulerRow> {
    Ok(SchedulerRow {
      source:      SourceId::new(self.source)?,
      enabled:     self.enabled,
      last_run_at: decode_opt_dt(self.last_run_at)?,
      last_status: self
        .last_status
        .as_deref()
        .map(str::parse::<RunOutcome>)
        .transpose()?,
      fail_count:  to_u32("fail_count", self.fail_count)?,
      next_run_at: decode_opt_dt(self.next_run_at)?,
      policy:      SchedulePolicy {
        base_interval_min: to_u32("base_interval_min", self.base_interval_min)?,
        max_interval_min:  to_u32("max_interval_min", self.max_interval_min)?,
        jitter_pct:        to_u32("jitter_pct", self.jitter_pct)?,
      },
      lock_owner:  self.lock_owner,
      lock_until:  decode_opt_dt(self.lock_until)?,
    })
  }
}

/// Raw values read directly from a `health_log` row.
pub struct RawHealth {
  pub source:      String,
  pub ran_at:      String,
  pub outcome:     String,
  pub duration_ms: i64,
  pub records:     Option<i64>,
  pub detail:      Option<String>,
}

impl RawHealth {
  pub fn into_entry(self) -> Result<HealthEntry> {
    Ok(HealthEntry {
      source:      SourceId::new(self.source)?,
      ran_at:      decode_dt(&self.ran_at)?,
      outcome:     self.outcome.parse()?,
      duration_ms: to_u64("duration_ms", self.duration_ms)?,
      records:     self.records.map(|r| to_u64("records", r)).transpose()?,
      detail:      self.detail,
    })
  }
}

/// Raw values read directly from an `insights` row.
pub struct RawInsight {
  pub partition:    String,
  pub role:         String,
  pub content:      String,
  pub generated_at: String,
  pub signals_hash: String,
  pub provider:     String,
}

impl RawInsight {
  pub fn into_pair(self) -> Result<(InsightKey, InsightEntry)> {
    Ok((InsightKey { partition: self.partition, role: self.role }, InsightEntry {
      content:      self.content,
      generated_at: decode_dt(&self.generated_at)?,
      signals_hash: self.signals_hash,
      provider:     self.provider,
    }))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_are_fixed_width_and_sortable() {
    let a = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let b = Utc.timestamp_opt(1_700_000_000, 5_000_000).unwrap();
    let (ea, eb) = (encode_dt(a), encode_dt(b));
    assert_eq!(ea, "2023-11-14T22:13:20.000Z");
    assert_eq!(ea.len(), eb.len());
    assert!(ea < eb);
    assert_eq!(decode_dt(&eb).unwrap(), b);
  }
}
