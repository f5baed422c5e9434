//! The immutable published snapshot of one source.
//!
//! A blob is produced only by a successful build and is never mutated once
//! published; the next successful build replaces it wholesale. Its JSON form
//! is also the on-disk artifact:
//!
//! ```json
//! { "meta": { "builtAt": "...", "recordCounts": {...}, "partitionsProcessed": [...] },
//!   "grid": { "38.9_-77.1": { "chemistry": [ ... ] } } }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{grid::GridIndex, record::GeoRecord};

// ─── Cell ────────────────────────────────────────────────────────────────────

/// Records in one grid cell, grouped by record kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridCell {
  pub kinds: BTreeMap<String, Vec<GeoRecord>>,
}

impl GridCell {
  pub fn push(&mut self, record: GeoRecord) {
    self.kinds.entry(record.kind.clone()).or_default().push(record);
  }

  /// Append every record of `other` into `self`.
  pub fn merge(&mut self, other: &GridCell) {
    for (kind, records) in &other.kinds {
      self
        .kinds
        .entry(kind.clone())
        .or_default()
        .extend(records.iter().cloned());
    }
  }

  pub fn len(&self) -> usize { self.kinds.values().map(Vec::len).sum() }

  pub fn is_empty(&self) -> bool { self.kinds.values().all(Vec::is_empty) }

  pub fn records(&self) -> impl Iterator<Item = &GeoRecord> { self.kinds.values().flatten() }
}

// ─── Meta ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
  pub built_at:             DateTime<Utc>,
  /// Record count per kind.
  pub record_counts:        BTreeMap<String, usize>,
  /// Partitions that contributed data, in priority order.
  pub partitions_processed: Vec<String>,
  /// Partitions that failed both the first pass and the retry.
  #[serde(default)]
  pub partitions_failed:    Vec<String>,
  pub grid_resolution:      f64,
  #[serde(default)]
  pub build_duration_ms:    u64,
}

/// Inputs describing a finished build, used to stamp [`CacheMeta`].
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
  pub partitions_processed: Vec<String>,
  pub partitions_failed:    Vec<String>,
  pub build_duration_ms:    u64,
}

// ─── Blob ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheBlob {
  pub meta: CacheMeta,
  pub grid: BTreeMap<String, GridCell>,
}

impl CacheBlob {
  /// Bucket `records` into grid cells. Records are expected to be
  /// resolvable already; the orchestrator filters before calling this.
  pub fn build(
    index: &GridIndex,
    records: Vec<GeoRecord>,
    summary: BuildSummary,
    built_at: DateTime<Utc>,
  ) -> Self {
    let mut record_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut grid: BTreeMap<String, GridCell> = BTreeMap::new();

    for record in records {
      *record_counts.entry(record.kind.clone()).or_default() += 1;
      grid
        .entry(index.key(record.lat, record.lng))
        .or_default()
        .push(record);
    }

    Self {
      meta: CacheMeta {
        built_at,
        record_counts,
        partitions_processed: summary.partitions_processed,
        partitions_failed: summary.partitions_failed,
        grid_resolution: index.resolution(),
        build_duration_ms: summary.build_duration_ms,
      },
      grid,
    }
  }

  pub fn total_records(&self) -> usize { self.meta.record_counts.values().sum() }

  pub fn cell_count(&self) -> usize { self.grid.len() }

  /// Union of the 3×3 neighbourhood around the point; `None` if empty.
  pub fn lookup(&self, index: &GridIndex, lat: f64, lng: f64) -> Option<GridCell> {
    let mut merged = GridCell::default();
    for key in index.neighbor_keys(lat, lng) {
      if let Some(cell) = self.grid.get(&key) {
        merged.merge(cell);
      }
    }
    (!merged.is_empty()).then_some(merged)
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn blob(records: Vec<GeoRecord>) -> CacheBlob {
    let built_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    CacheBlob::build(&GridIndex::default(), records, BuildSummary::default(), built_at)
  }

  #[test]
  fn record_is_found_at_its_own_coordinate() {
    let b = blob(vec![GeoRecord::new("facility", "110000350174", 38.97, -77.03)]);
    let cell = b.lookup(&GridIndex::default(), 38.97, -77.03).unwrap();
    assert_eq!(cell.len(), 1);
    assert_eq!(cell.kinds["facility"][0].key, "110000350174");
  }

  #[test]
  fn lookup_merges_neighbouring_cells() {
    let b = blob(vec![
      GeoRecord::new("facility", "a", 38.95, -77.05),
      GeoRecord::new("facility", "b", 39.02, -77.12),
      GeoRecord::new("violation", "c", 38.88, -76.98),
    ]);
    let cell = b.lookup(&GridIndex::default(), 38.95, -77.05).unwrap();
    assert_eq!(cell.len(), 3);
    assert_eq!(cell.kinds.len(), 2);
  }

  #[test]
  fn lookup_far_away_is_none() {
    let b = blob(vec![GeoRecord::new("facility", "a", 38.95, -77.05)]);
    assert!(b.lookup(&GridIndex::default(), 34.05, -118.24).is_none());
  }

  #[test]
  fn counts_are_per_kind() {
    let b = blob(vec![
      GeoRecord::new("chemistry", "a", 38.95, -77.05),
      GeoRecord::new("chemistry", "b", 36.0, -120.0),
      GeoRecord::new("toxicity", "c", 36.0, -120.0),
    ]);
    assert_eq!(b.meta.record_counts["chemistry"], 2);
    assert_eq!(b.meta.record_counts["toxicity"], 1);
    assert_eq!(b.total_records(), 3);
    assert_eq!(b.cell_count(), 2);
  }

  #[test]
  fn json_shape_has_meta_and_grid() {
    let b = blob(vec![GeoRecord::new("gauge", "x", 38.95, -77.05)]);
    let v = serde_json::to_value(&b).unwrap();
    assert!(v["meta"]["builtAt"].is_string());
    assert_eq!(v["meta"]["recordCounts"]["gauge"], 1);
    assert!(v["grid"]["38.9_-77.1"]["gauge"].is_array());

    let back: CacheBlob = serde_json::from_value(v).unwrap();
    assert_eq!(back, b);
  }
}
