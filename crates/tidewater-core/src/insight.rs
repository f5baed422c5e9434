//! Derived insight entries and their store.
//!
//! An entry is regenerated only when the hash of its input signals changes
//! or it ages past the pipeline's max age.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One unit of insight work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InsightKey {
  pub partition: String,
  pub role:      String,
}

impl InsightKey {
  pub fn new(partition: impl Into<String>, role: impl Into<String>) -> Self {
    Self { partition: partition.into(), role: role.into() }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightEntry {
  pub content:      String,
  pub generated_at: DateTime<Utc>,
  pub signals_hash: String,
  pub provider:     String,
}

impl InsightEntry {
  /// `true` if the entry was produced from `hash` less than `max_age` ago.
  pub fn is_fresh(&self, hash: &str, now: DateTime<Utc>, max_age: Duration) -> bool {
    self.signals_hash == hash && now - self.generated_at < max_age
  }
}

/// Hex SHA-256 of the canonical JSON encoding of `signals`.
///
/// `serde_json::Map` is ordered by key, so two values with the same content
/// hash equally regardless of construction order.
pub fn signals_hash(signals: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(signals.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

pub trait InsightStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn get_insight<'a>(
    &'a self,
    key: &'a InsightKey,
  ) -> impl Future<Output = Result<Option<InsightEntry>, Self::Error>> + Send + 'a;

  /// Insert or replace the entry for `key`.
  fn put_insight<'a>(
    &'a self,
    key: &'a InsightKey,
    entry: InsightEntry,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// All entries, optionally restricted to one partition.
  fn list_insights<'a>(
    &'a self,
    partition: Option<&'a str>,
  ) -> impl Future<Output = Result<Vec<(InsightKey, InsightEntry)>, Self::Error>> + Send + 'a;
}
