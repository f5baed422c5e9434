//! The `SourceAdapter` trait: everything source-specific about a build.
//!
//! An adapter knows how to page through one upstream feed for one partition
//! and how to turn a raw row into a [`GeoRecord`]. The generic procedure
//! around it (retry, dedupe, empty guard, publication) lives in
//! [`build`](crate::build).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tidewater_core::{record::GeoRecord, source::SourceId};

use crate::upstream::UpstreamError;

// ─── Paging ──────────────────────────────────────────────────────────────────

/// Which page of a partition to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
  /// Zero-based page number.
  pub index:  u32,
  pub offset: u64,
  pub limit:  u32,
}

impl PageRequest {
  pub fn first(limit: u32) -> Self { Self { index: 0, offset: 0, limit } }

  pub fn next(self) -> Self {
    Self { index: self.index + 1, offset: self.offset + u64::from(self.limit), limit: self.limit }
  }
}

/// One page of raw upstream rows.
#[derive(Debug, Clone, Default)]
pub struct Page {
  pub rows:     Vec<Value>,
  /// Set when the upstream may have more rows after this page.
  pub has_more: bool,
}

impl Page {
  /// A page is full when it returned `limit` rows; anything shorter is the
  /// last page of an offset-paginated feed.
  pub fn from_rows(rows: Vec<Value>, limit: u32) -> Self {
    let has_more = !rows.is_empty() && rows.len() >= limit as usize;
    Self { rows, has_more }
  }

  /// A feed that returns everything in one response.
  pub fn single(rows: Vec<Value>) -> Self { Self { rows, has_more: false } }
}

// ─── Tuning ──────────────────────────────────────────────────────────────────

/// How many partitions of one source may be fetched at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionConcurrency {
  /// One partition at a time, for fragile upstreams.
  Sequential,
  /// A bounded pool; the width is clamped to `5..=10`.
  Pooled(usize),
}

impl PartitionConcurrency {
  pub const MIN_POOL: usize = 5;
  pub const MAX_POOL: usize = 10;

  pub fn pooled(width: usize) -> Self { Self::Pooled(width.clamp(Self::MIN_POOL, Self::MAX_POOL)) }

  pub fn width(self) -> usize {
    match self {
      Self::Sequential => 1,
      Self::Pooled(n) => n.clamp(Self::MIN_POOL, Self::MAX_POOL),
    }
  }
}

impl Default for PartitionConcurrency {
  fn default() -> Self { Self::Sequential }
}

/// Page sizing and politeness delays for one source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Pacing {
  pub page_size:          u32,
  /// Safety cap on pages per partition.
  pub max_pages:          u32,
  pub page_delay_ms:      u64,
  pub partition_delay_ms: u64,
  /// Extra wait before the single retry pass over failed partitions.
  pub retry_delay_ms:     u64,
}

impl Default for Pacing {
  fn default() -> Self {
    Self {
      page_size:          10_000,
      max_pages:          50,
      page_delay_ms:      500,
      partition_delay_ms: 2_000,
      retry_delay_ms:     5_000,
    }
  }
}

impl Pacing {
  /// No delays; for tests and one-shot local runs.
  pub fn immediate() -> Self {
    Self { page_delay_ms: 0, partition_delay_ms: 0, retry_delay_ms: 0, ..Default::default() }
  }

  pub fn page_delay(&self) -> Duration { Duration::from_millis(self.page_delay_ms) }

  pub fn partition_delay(&self) -> Duration { Duration::from_millis(self.partition_delay_ms) }

  pub fn retry_delay(&self) -> Duration { Duration::from_millis(self.retry_delay_ms) }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Source-specific half of a build.
///
/// Object-safe so a registry can hold adapters chosen at runtime from
/// configuration.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
  fn source(&self) -> &SourceId;

  /// Partitions in priority order.
  fn partitions(&self) -> &[String];

  fn concurrency(&self) -> PartitionConcurrency { PartitionConcurrency::Sequential }

  fn pacing(&self) -> &Pacing;

  /// Fetch one page of raw rows for `partition`.
  async fn fetch_page(&self, partition: &str, page: PageRequest) -> Result<Page, UpstreamError>;

  /// Map a raw row to a record. Returning `None` drops the row.
  fn transform(&self, partition: &str, row: &Value) -> Option<GeoRecord>;
}
