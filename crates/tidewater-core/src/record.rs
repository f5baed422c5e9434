//! One point-located upstream record.
//!
//! Records are source-specific payloads (a facility, a permit, a gauge
//! reading, a chemistry sample). The cache only cares about the envelope:
//! the record kind, its natural dedupe key and a resolvable coordinate.
//! Everything else lives in `attributes`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A point-located record bucketed by the grid index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoRecord {
  /// Record family within a source, e.g. `"chemistry"` or `"violation"`.
  pub kind:        String,
  /// Natural key, e.g. a registry ID or `station:parameter`.
  pub key:         String,
  pub lat:         f64,
  pub lng:         f64,
  /// Ingestion partition the record came from (usually a state code).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partition:   Option<String>,
  /// Upstream observation/issue date as reported, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub observed_at: Option<String>,
  /// Set when the upstream row signals a critical condition.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub alert:       bool,
  #[serde(default, skip_serializing_if = "Map::is_empty")]
  pub attributes:  Map<String, Value>,
}

impl GeoRecord {
  pub fn new(kind: impl Into<String>, key: impl Into<String>, lat: f64, lng: f64) -> Self {
    Self {
      kind: kind.into(),
      key: key.into(),
      lat,
      lng,
      partition: None,
      observed_at: None,
      alert: false,
      attributes: Map::new(),
    }
  }

  pub fn with_attr(mut self, name: &str, value: impl Into<Value>) -> Self {
    let value = value.into();
    if !value.is_null() {
      self.attributes.insert(name.to_owned(), value);
    }
    self
  }

  pub fn with_observed_at(mut self, at: Option<String>) -> Self {
    self.observed_at = at.filter(|s| !s.is_empty());
    self
  }

  pub fn with_alert(mut self, alert: bool) -> Self {
    self.alert = alert;
    self
  }

  /// `true` if the coordinate can be placed on the grid.
  ///
  /// `lat <= 0` is the upstream sentinel for "unresolved" (several feeds
  /// use `-88` or `0`), so it is rejected along with non-finite values.
  pub fn is_resolvable(&self) -> bool { is_resolvable(self.lat, self.lng) }

  /// Key used for first-seen-wins deduplication within a partition.
  pub fn dedupe_key(&self) -> (String, String) { (self.kind.clone(), self.key.clone()) }
}

/// Coordinate validity check shared by adapters and the orchestrator.
pub fn is_resolvable(lat: f64, lng: f64) -> bool {
  lat.is_finite()
    && lng.is_finite()
    && lat > 0.0
    && lat <= 90.0
    && (-180.0..=180.0).contains(&lng)
}

/// Read a coordinate or measurement that upstream may send as a number or
/// as a numeric string. Blank strings and anything else yield `None`.
pub fn parse_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
    _ => None,
  }
}

/// Read a non-empty string field, trimming whitespace. Numbers are
/// stringified because some feeds send identifiers as integers.
pub fn parse_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => {
      let t = s.trim();
      (!t.is_empty()).then(|| t.to_owned())
    }
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
