//! EPA Envirofacts tables (ICIS, SDWIS, FRS, ...) paged per state.
//!
//! URL shape: `{base}/{table}/{state_column}/{state}/rows/{first}:{last}/JSON`
//! where the row range is inclusive. Column mapping is configuration, so
//! one adapter covers every table.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tidewater_core::{
  record::{GeoRecord, parse_number, parse_text},
  source::SourceId,
};

use super::{AdapterSettings, copy_attributes, field, join_key, truthy};
use crate::{
  adapter::{Page, PageRequest, Pacing, PartitionConcurrency, SourceAdapter},
  upstream::{Upstream, UpstreamError},
};

pub const DEFAULT_BASE_URL: &str = "https://data.epa.gov/efservice";

#[derive(Debug, Clone, Deserialize)]
pub struct EnvirofactsConfig {
  #[serde(default = "default_base_url")]
  pub base_url:       String,
  pub table:          String,
  #[serde(default = "default_state_column")]
  pub state_column:   String,
  /// Record kind stamped on every row, e.g. `"permit"`.
  pub kind:           String,
  /// Columns joined with `:` to form the dedupe key.
  pub key_fields:     Vec<String>,
  pub lat_field:      String,
  pub lng_field:      String,
  #[serde(default)]
  pub name_field:     Option<String>,
  #[serde(default)]
  pub observed_field: Option<String>,
  /// Column whose truthy value marks a critical condition.
  #[serde(default)]
  pub alert_field:    Option<String>,
  /// When set, the alert column must equal one of these instead.
  #[serde(default)]
  pub alert_values:   Vec<String>,
  /// Extra columns copied into the record attributes.
  #[serde(default)]
  pub attributes:     Vec<String>,
}

fn default_base_url() -> String { DEFAULT_BASE_URL.to_owned() }

fn default_state_column() -> String { "STATE_CODE".to_owned() }

pub struct EnvirofactsAdapter {
  source:      SourceId,
  partitions:  Vec<String>,
  pacing:      Pacing,
  concurrency: PartitionConcurrency,
  config:      EnvirofactsConfig,
  upstream:    Upstream,
}

impl EnvirofactsAdapter {
  pub fn new(settings: AdapterSettings, config: EnvirofactsConfig, upstream: Upstream) -> Self {
    Self {
      source: settings.source,
      partitions: settings.partitions,
      pacing: settings.pacing,
      concurrency: settings.concurrency,
      config,
      upstream,
    }
  }

  pub fn page_url(&self, partition: &str, page: PageRequest) -> String {
    let first = page.offset;
    let last = page.offset + u64::from(page.limit.max(1)) - 1;
    format!(
      "{}/{}/{}/{}/rows/{first}:{last}/JSON",
      self.config.base_url.trim_end_matches('/'),
      self.config.table,
      self.config.state_column,
      partition,
    )
  }

  fn is_alert(&self, row: &Value) -> bool {
    let Some(column) = &self.config.alert_field else { return false };
    let value = field(row, column);
    if self.config.alert_values.is_empty() {
      truthy(value)
    } else {
      parse_text(value).is_some_and(|v| self.config.alert_values.iter().any(|a| a.eq_ignore_ascii_case(&v)))
    }
  }
}

#[async_trait]
impl SourceAdapter for EnvirofactsAdapter {
  fn source(&self) -> &SourceId { &self.source }

  fn partitions(&self) -> &[String] { &self.partitions }

  fn concurrency(&self) -> PartitionConcurrency { self.concurrency }

  fn pacing(&self) -> &Pacing { &self.pacing }

  async fn fetch_page(&self, partition: &str, page: PageRequest) -> Result<Page, UpstreamError> {
    let url = self.page_url(partition, page);
    match self.upstream.get_json(&url, &[]).await? {
      Value::Array(rows) => Ok(Page::from_rows(rows, page.limit)),
      // Envirofacts reports query problems as a JSON object with a 200.
      other => Err(UpstreamError::malformed(&url, format!("expected array, got {}", kind_of(&other)))),
    }
  }

  fn transform(&self, _partition: &str, row: &Value) -> Option<GeoRecord> {
    let key = join_key(row, &self.config.key_fields)?;
    let lat = parse_number(field(row, &self.config.lat_field))?;
    let lng = parse_number(field(row, &self.config.lng_field))?;

    let mut record = GeoRecord::new(self.config.kind.clone(), key, lat, lng).with_alert(self.is_alert(row));
    if let Some(name) = &self.config.name_field {
      record = record.with_attr("name", parse_text(field(row, name)));
    }
    if let Some(observed) = &self.config.observed_field {
      record = record.with_observed_at(parse_text(field(row, observed)));
    }
    Some(copy_attributes(record, row, &self.config.attributes))
  }
}

fn kind_of(v: &Value) -> &'static str {
  match v {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{testing::sid, upstream::UpstreamConfig};

  fn adapter(alert_values: &[&str]) -> EnvirofactsAdapter {
    EnvirofactsAdapter::new(
      AdapterSettings {
        source:      sid("icis-permits"),
        partitions:  vec!["MD".into(), "VA".into()],
        pacing:      Pacing::immediate(),
        concurrency: PartitionConcurrency::pooled(5),
      },
      EnvirofactsConfig {
        base_url:       "https://data.epa.gov/efservice/".into(),
        table:          "ICIS_PERMITS".into(),
        state_column:   "STATE_CODE".into(),
        kind:           "permit".into(),
        key_fields:     vec!["EXTERNAL_PERMIT_NMBR".into()],
        lat_field:      "LATITUDE".into(),
        lng_field:      "LONGITUDE".into(),
        name_field:     Some("FACILITY_NAME".into()),
        observed_field: Some("ISSUE_DATE".into()),
        alert_field:    Some("PERMIT_STATUS_CODE".into()),
        alert_values:   alert_values.iter().map(|s| s.to_string()).collect(),
        attributes:     vec!["PERMIT_TYPE_CODE".into()],
      },
      Upstream::new(UpstreamConfig::default()).unwrap(),
    )
  }

  #[test]
  fn row_range_is_inclusive() {
    let a = adapter(&[]);
    let url = a.page_url("MD", PageRequest { index: 1, offset: 10_000, limit: 10_000 });
    assert_eq!(url, "https://data.epa.gov/efservice/ICIS_PERMITS/STATE_CODE/MD/rows/10000:19999/JSON");
  }

  #[test]
  fn maps_configured_columns() {
    let a = adapter(&["EXP", "ADC"]);
    let row = json!({
      "external_permit_nmbr": "MD0021601", "latitude": "39.27", "longitude": "-76.61",
      "facility_name": "Back River WWTP", "issue_date": "2019-06-01",
      "permit_status_code": "EXP", "permit_type_code": "NPD",
    });
    let r = a.transform("MD", &row).unwrap();
    assert_eq!(r.kind, "permit");
    assert_eq!(r.key, "MD0021601");
    assert!(r.alert);
    assert_eq!(r.attributes["name"], "Back River WWTP");
    assert_eq!(r.attributes["permit_type_code"], "NPD");
    assert_eq!(r.observed_at.as_deref(), Some("2019-06-01"));
  }

  #[test]
  fn non_listed_status_is_not_alert() {
    let a = adapter(&["EXP"]);
    let row = json!({
      "EXTERNAL_PERMIT_NMBR": "VA0001", "LATITUDE": 37.5, "LONGITUDE": -77.4,
      "PERMIT_STATUS_CODE": "EFF",
    });
    assert!(!a.transform("VA", &row).unwrap().alert);
  }

  #[test]
  fn missing_key_drops_row() {
    let a = adapter(&[]);
    assert!(a.transform("MD", &json!({"LATITUDE": 39.0, "LONGITUDE": -76.0})).is_none());
  }
}
