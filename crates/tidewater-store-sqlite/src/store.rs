//! [`SqliteStore`]: the SQLite implementation of [`CoordinationStore`] and
//! [`InsightStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;

use tidewater_core::{
  coordination::CoordinationStore,
  insight::{InsightEntry, InsightKey, InsightStore},
  schedule::{HealthEntry, RunRecord, SchedulePolicy, SchedulerRow},
  source::SourceId,
};

use crate::{
  Result,
  encode::{RawHealth, RawInsight, RawScheduleRow, SCHEDULE_COLUMNS, encode_dt, encode_u64},
  error::Error,
  schema::SCHEMA,
};

/// Health-log rows kept per source.
pub const HEALTH_LOG_RETENTION: i64 = 200;

// ─── Store ───────────────────────────────────────────────────────────────────

/// Coordination state backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store; useful for tests and one-shot CLI runs.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn fetch_schedule(&self, source: &SourceId) -> Result<Option<SchedulerRow>> {
    let source = source.as_str().to_owned();

    let raw: Option<RawScheduleRow> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM source_schedule WHERE source = ?1"),
            rusqlite::params![source],
            RawScheduleRow::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawScheduleRow::into_row).transpose()
  }
}

// ─── CoordinationStore impl ──────────────────────────────────────────────────

impl CoordinationStore for SqliteStore {
  type Error = Error;

  // ── Schedule rows ─────────────────────────────────────────────────────────

  async fn ensure_source(
    &self,
    source: &SourceId,
    policy: SchedulePolicy,
    enabled: bool,
  ) -> Result<SchedulerRow> {
    let id = source.as_str().to_owned();

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO source_schedule
             (source, enabled, base_interval_min, max_interval_min, jitter_pct)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(source) DO UPDATE SET
             base_interval_min = excluded.base_interval_min,
             max_interval_min  = excluded.max_interval_min,
             jitter_pct        = excluded.jitter_pct",
          rusqlite::params![
            id,
            enabled,
            policy.base_interval_min,
            policy.max_interval_min,
            policy.jitter_pct,
          ],
        )?;
        Ok(())
      })
      .await?;

    self
      .fetch_schedule(source)
      .await?
      .ok_or_else(|| Error::MissingRow(source.clone()))
  }

  async fn get_schedule(&self, source: &SourceId) -> Result<Option<SchedulerRow>> {
    self.fetch_schedule(source).await
  }

  async fn list_schedules(&self) -> Result<Vec<SchedulerRow>> {
    let raws: Vec<RawScheduleRow> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SCHEDULE_COLUMNS} FROM source_schedule ORDER BY source"
        ))?;
        let rows = stmt
          .query_map([], RawScheduleRow::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawScheduleRow::into_row).collect()
  }

  async fn set_enabled(&self, source: &SourceId, enabled: bool) -> Result<bool> {
    let id = source.as_str().to_owned();

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE source_schedule SET enabled = ?2 WHERE source = ?1",
          rusqlite::params![id, enabled],
        )?)
      })
      .await?;

    Ok(changed == 1)
  }

  // ── Soft lock ─────────────────────────────────────────────────────────────

  async fn try_acquire_lock(
    &self,
    source: &SourceId,
    owner: &str,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
  ) -> Result<bool> {
    let id        = source.as_str().to_owned();
    let owner     = owner.to_owned();
    let now_str   = encode_dt(now);
    let until_str = encode_dt(until);

    // Single conditional UPDATE: whichever instance's statement lands
    // first flips the owner; the others match zero rows.
    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE source_schedule
             SET lock_owner = ?2, lock_until = ?3
           WHERE source = ?1
             AND (lock_owner IS NULL
                  OR lock_until IS NULL
                  OR lock_until <= ?4)",
          rusqlite::params![id, owner, until_str, now_str],
        )?)
      })
      .await?;

    Ok(changed == 1)
  }

  async fn release_lock(&self, source: &SourceId, owner: &str) -> Result<()> {
    let id    = source.as_str().to_owned();
    let owner = owner.to_owned();

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE source_schedule
             SET lock_owner = NULL, lock_until = NULL
           WHERE source = ?1 AND lock_owner = ?2",
          rusqlite::params![id, owner],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Runs & health ─────────────────────────────────────────────────────────

  async fn record_run(&self, source: &SourceId, run: RunRecord) -> Result<()> {
    let id       = source.as_str().to_owned();
    let ran_at   = encode_dt(run.ran_at);
    let outcome  = run.outcome.as_str();
    let next_run = encode_dt(run.next_run_at);
    let fails    = run.fail_count;

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE source_schedule
             SET last_run_at = ?2, last_status = ?3, fail_count = ?4, next_run_at = ?5
           WHERE source = ?1",
          rusqlite::params![id, ran_at, outcome, fails, next_run],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn append_health(&self, entry: HealthEntry) -> Result<()> {
    let source   = entry.source.as_str().to_owned();
    let ran_at   = encode_dt(entry.ran_at);
    let outcome  = entry.outcome.as_str();
    let duration = encode_u64(entry.duration_ms);
    let records  = entry.records.map(encode_u64);
    let detail   = entry.detail;

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO health_log (source, ran_at, outcome, duration_ms, records, detail)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          rusqlite::params![source, ran_at, outcome, duration, records, detail],
        )?;
        tx.execute(
          "DELETE FROM health_log
           WHERE source = ?1
             AND id NOT IN (
               SELECT id FROM health_log WHERE source = ?1 ORDER BY id DESC LIMIT ?2
             )",
          rusqlite::params![source, HEALTH_LOG_RETENTION],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn recent_health(&self, source: &SourceId, limit: usize) -> Result<Vec<HealthEntry>> {
    let id    = source.as_str().to_owned();
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let raws: Vec<RawHealth> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT source, ran_at, outcome, duration_ms, records, detail
           FROM health_log
           WHERE source = ?1
           ORDER BY id DESC
           LIMIT ?2",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id, limit], |row| {
            Ok(RawHealth {
              source:      row.get(0)?,
              ran_at:      row.get(1)?,
              outcome:     row.get(2)?,
              duration_ms: row.get(3)?,
              records:     row.get(4)?,
              detail:      row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawHealth::into_entry).collect()
  }
}

// ─── InsightStore impl ───────────────────────────────────────────────────────

fn insight_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawInsight> {
  Ok(RawInsight {
    partition:    row.get(0)?,
    role:         row.get(1)?,
    content:      row.get(2)?,
    generated_at: row.get(3)?,
    signals_hash: row.get(4)?,
    provider:     row.get(5)?,
  })
}

impl InsightStore for SqliteStore {
  type Error = Error;

  async fn get_insight(&self, key: &InsightKey) -> Result<Option<InsightEntry>> {
    let partition = key.partition.clone();
    let role      = key.role.clone();

    let raw: Option<RawInsight> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT partition, role, content, generated_at, signals_hash, provider
             FROM insights WHERE partition = ?1 AND role = ?2",
            rusqlite::params![partition, role],
            insight_from_row,
          )
          .optional()?)
      })
      .await?;

    Ok(raw.map(RawInsight::into_pair).transpose()?.map(|(_, entry)| entry))
  }

  async fn put_insight(&self, key: &InsightKey, entry: InsightEntry) -> Result<()> {
    let partition    = key.partition.clone();
    let role         = key.role.clone();
    let generated_at = encode_dt(entry.generated_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO insights (partition, role, content, generated_at, signals_hash, provider)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(partition, role) DO UPDATE SET
             content      = excluded.content,
             generated_at = excluded.generated_at,
             signals_hash = excluded.signals_hash,
             provider     = excluded.provider",
          rusqlite::params![
            partition,
            role,
            entry.content,
            generated_at,
            entry.signals_hash,
            entry.provider,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_insights(&self, partition: Option<&str>) -> Result<Vec<(InsightKey, InsightEntry)>> {
    let partition = partition.map(str::to_owned);

    let raws: Vec<RawInsight> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT partition, role, content, generated_at, signals_hash, provider
           FROM insights
           WHERE ?1 IS NULL OR partition = ?1
           ORDER BY partition, role",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![partition], insight_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawInsight::into_pair).collect()
  }
}
