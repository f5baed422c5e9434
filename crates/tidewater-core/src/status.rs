//! Cache status reported by the read interface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::blob::CacheBlob;

/// Whether a source's cache has a published blob, and what it holds.
///
/// Serialises as `{"loaded": false}` or
/// `{"loaded": true, "builtAt": ..., "recordCounts": ..., ...}`.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheStatus {
  Unloaded,
  Loaded(LoadedStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedStatus {
  pub built_at:             DateTime<Utc>,
  pub record_counts:        BTreeMap<String, usize>,
  pub total_records:        usize,
  pub cell_count:           usize,
  pub partitions_processed: Vec<String>,
  pub partitions_failed:    Vec<String>,
}

impl CacheStatus {
  pub fn of(blob: Option<&CacheBlob>) -> Self {
    match blob {
      None => Self::Unloaded,
      Some(b) => Self::Loaded(LoadedStatus {
        built_at:             b.meta.built_at,
        record_counts:        b.meta.record_counts.clone(),
        total_records:        b.total_records(),
        cell_count:           b.cell_count(),
        partitions_processed: b.meta.partitions_processed.clone(),
        partitions_failed:    b.meta.partitions_failed.clone(),
      }),
    }
  }

  pub fn is_loaded(&self) -> bool { matches!(self, Self::Loaded(_)) }
}

impl Serialize for CacheStatus {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Wire<'a> {
      loaded: bool,
      #[serde(flatten)]
      detail: Option<&'a LoadedStatus>,
    }

    let wire = match self {
      Self::Unloaded => Wire { loaded: false, detail: None },
      Self::Loaded(s) => Wire { loaded: true, detail: Some(s) },
    };
    wire.serialize(serializer)
  }
}
