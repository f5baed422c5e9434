//! SQL schema for the Tidewater SQLite store.
//!
//! Executed once at connection startup. Timestamps are fixed-width RFC 3339
//! strings with millisecond precision, so `<=` in SQL orders them correctly.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

-- One row per source: scheduling state plus the cross-instance soft lock.
CREATE TABLE IF NOT EXISTS source_schedule (
    source             TEXT PRIMARY KEY,
    enabled            INTEGER NOT NULL DEFAULT 1,
    last_run_at        TEXT,
    last_status        TEXT,             -- 'success' | 'partial' | 'error'
    fail_count         INTEGER NOT NULL DEFAULT 0,
    next_run_at        TEXT,
    base_interval_min  INTEGER NOT NULL,
    max_interval_min   INTEGER NOT NULL,
    jitter_pct         INTEGER NOT NULL,
    lock_owner         TEXT,
    lock_until         TEXT
);

-- Trimmed to the newest rows per source on every append.
CREATE TABLE IF NOT EXISTS health_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source      TEXT NOT NULL,
    ran_at      TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    records     INTEGER,
    detail      TEXT
);

CREATE TABLE IF NOT EXISTS insights (
    partition    TEXT NOT NULL,
    role         TEXT NOT NULL,
    content      TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    signals_hash TEXT NOT NULL,
    provider     TEXT NOT NULL,
    PRIMARY KEY (partition, role)
);

CREATE INDEX IF NOT EXISTS health_source_idx ON health_log(source, id);

PRAGMA user_version = 1;
";
