//! California CEDEN water-quality data via the CKAN SQL endpoint.
//!
//! Each partition is one CKAN resource (typically one dataset year). Pages
//! are ordered newest sample first so first-seen dedupe keeps the latest
//! reading per station.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tidewater_core::{
  record::{GeoRecord, parse_number, parse_text},
  source::SourceId,
};

use super::{AdapterSettings, field};
use crate::{
  Error, Result,
  adapter::{Page, PageRequest, Pacing, PartitionConcurrency, SourceAdapter},
  upstream::{Upstream, UpstreamError},
};

/// CKAN rejects larger pages.
pub const MAX_PAGE_SIZE: u32 = 32_000;

pub const DEFAULT_ENDPOINT: &str = "https://data.ca.gov/api/3/action/datastore_search_sql";

const CHEMISTRY_COLUMNS: &str = r#""StationName","StationCode","SampleDate","Analyte","Result","Unit","Latitude","Longitude","DataQuality","SampleAgency""#;

const TOXICITY_COLUMNS: &str = r#""StationName","StationCode","SampleDate","OrganismName","Analyte","Result","Unit","Mean","SigEffectCode","Latitude","Longitude","DataQuality""#;

/// CEDEN analyte names mapped to the parameter keys used in lookups.
const ANALYTES: &[(&str, &str)] = &[
  ("Oxygen, Dissolved, Total", "DO"),
  ("Oxygen, Dissolved", "DO"),
  ("Temperature", "temperature"),
  ("pH", "pH"),
  ("Turbidity, Total", "turbidity"),
  ("Turbidity", "turbidity"),
  ("E. coli", "bacteria"),
  ("Enterococcus", "bacteria"),
  ("Enterococcus, Total", "bacteria"),
  ("Coliform, Fecal", "bacteria"),
  ("Coliform, Total", "coliform_total"),
  ("Nitrogen, Total", "TN"),
  ("Nitrogen, Total Kjeldahl", "TN"),
  ("Phosphorus as P", "TP"),
  ("Phosphorus, Total", "TP"),
  ("Chlorophyll a", "chlorophyll"),
  ("SpecificConductivity", "conductivity"),
  ("Specific Conductance", "conductivity"),
  ("Salinity", "salinity"),
  ("Total Suspended Solids", "TSS"),
  ("Suspended Sediment Concentration", "TSS"),
];

pub fn parameter_for(analyte: &str) -> Option<&'static str> {
  ANALYTES.iter().find(|(name, _)| *name == analyte).map(|(_, key)| *key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CedenDataset {
  /// Field chemistry; one record per station and parameter.
  Chemistry,
  /// Toxicity tests; one record per station and organism.
  Toxicity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CedenResource {
  /// Partition name, e.g. `"2025"`.
  pub partition:   String,
  pub resource_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CedenConfig {
  #[serde(default = "default_endpoint")]
  pub endpoint:  String,
  pub dataset:   CedenDataset,
  /// Resources in priority order; these become the partitions.
  pub resources: Vec<CedenResource>,
  /// Only samples on or after this `YYYY-MM-DD` date.
  #[serde(default)]
  pub since:     Option<String>,
}

fn default_endpoint() -> String { DEFAULT_ENDPOINT.to_owned() }

pub struct CedenAdapter {
  source:      SourceId,
  partitions:  Vec<String>,
  pacing:      Pacing,
  concurrency: PartitionConcurrency,
  config:      CedenConfig,
  upstream:    Upstream,
}

impl CedenAdapter {
  pub fn new(settings: AdapterSettings, config: CedenConfig, upstream: Upstream) -> Result<Self> {
    if config.resources.is_empty() {
      return Err(Error::Config(format!("ceden source {} has no resources", settings.source)));
    }
    if let Some(since) = &config.since {
      if chrono::NaiveDate::parse_from_str(since, "%Y-%m-%d").is_err() {
        return Err(Error::Config(format!("ceden `since` must be YYYY-MM-DD, got {since:?}")));
      }
    }

    let mut pacing = settings.pacing;
    pacing.page_size = pacing.page_size.clamp(1, MAX_PAGE_SIZE);
    Ok(Self {
      source: settings.source,
      partitions: config.resources.iter().map(|r| r.partition.clone()).collect(),
      pacing,
      concurrency: settings.concurrency,
      config,
      upstream,
    })
  }

  fn resource_id(&self, partition: &str) -> Option<&str> {
    self
      .config
      .resources
      .iter()
      .find(|r| r.partition == partition)
      .map(|r| r.resource_id.as_str())
  }

  /// The SQL for one page. Resource ids and dates are validated or quoted
  /// before they get here.
  pub fn page_sql(&self, resource_id: &str, page: PageRequest) -> String {
    let mut filter = String::from(r#""DataQuality" NOT IN ('MetaData','Reject') AND "Latitude" > 0"#);

    let columns = match self.config.dataset {
      CedenDataset::Chemistry => {
        let analytes = ANALYTES
          .iter()
          .map(|(name, _)| format!("'{}'", name.replace('\'', "''")))
          .collect::<Vec<_>>()
          .join(",");
        filter.push_str(&format!(r#" AND "Analyte" IN ({analytes})"#));
        CHEMISTRY_COLUMNS
      }
      CedenDataset::Toxicity => TOXICITY_COLUMNS,
    };
    if let Some(since) = &self.config.since {
      filter.push_str(&format!(r#" AND "SampleDate" >= '{since}'"#));
    }

    let resource = resource_id.replace('"', "");
    format!(
      r#"SELECT {columns} FROM "{resource}" WHERE {filter} ORDER BY "SampleDate" DESC LIMIT {} OFFSET {}"#,
      page.limit, page.offset
    )
  }

  fn chemistry(&self, row: &Value) -> Option<GeoRecord> {
    let station = parse_text(field(row, "StationCode"))?;
    let analyte = parse_text(field(row, "Analyte"))?;
    let parameter = parameter_for(&analyte)?;
    let value = parse_number(field(row, "Result"))?;
    let lat = parse_number(field(row, "Latitude"))?;
    let lng = parse_number(field(row, "Longitude"))?;

    Some(
      GeoRecord::new("chemistry", format!("{station}:{parameter}"), lat, lng)
        .with_observed_at(parse_text(field(row, "SampleDate")))
        .with_attr("station", station)
        .with_attr("stationName", parse_text(field(row, "StationName")))
        .with_attr("parameter", parameter)
        .with_attr("analyte", analyte)
        .with_attr("value", value)
        .with_attr("unit", parse_text(field(row, "Unit")))
        .with_attr("agency", parse_text(field(row, "SampleAgency"))),
    )
  }

  fn toxicity(&self, row: &Value) -> Option<GeoRecord> {
    let station = parse_text(field(row, "StationCode"))?;
    let organism = parse_text(field(row, "OrganismName")).unwrap_or_default();
    let lat = parse_number(field(row, "Latitude"))?;
    let lng = parse_number(field(row, "Longitude"))?;
    let sig_effect = parse_text(field(row, "SigEffectCode"));

    Some(
      GeoRecord::new("toxicity", format!("{station}:{organism}"), lat, lng)
        .with_observed_at(parse_text(field(row, "SampleDate")))
        .with_alert(sig_effect.as_deref().is_some_and(is_significant_effect))
        .with_attr("station", station)
        .with_attr("stationName", parse_text(field(row, "StationName")))
        .with_attr("organism", organism)
        .with_attr("analyte", parse_text(field(row, "Analyte")))
        .with_attr("result", parse_number(field(row, "Result")))
        .with_attr("mean", parse_number(field(row, "Mean")))
        .with_attr("unit", parse_text(field(row, "Unit")))
        .with_attr("sigEffect", sig_effect),
    )
  }
}

/// CEDEN codes significant toxicity as `SL`/`SG` (significant, lower or
/// greater than control); `NSC`/`NSG` and blanks are not alerts.
fn is_significant_effect(code: &str) -> bool { code.trim().starts_with('S') }

/// Unwrap a CKAN action response, surfacing `success: false` as malformed.
pub fn ckan_records(url: &str, mut body: Value) -> Result<Vec<Value>, UpstreamError> {
  if !body["success"].as_bool().unwrap_or(false) {
    let message = body["error"]["message"]
      .as_str()
      .unwrap_or("CKAN query failed")
      .to_owned();
    return Err(UpstreamError::malformed(url, message));
  }
  match body
    .get_mut("result")
    .and_then(|r| r.get_mut("records"))
    .map(Value::take)
  {
    Some(Value::Array(records)) => Ok(records),
    _ => Err(UpstreamError::malformed(url, "missing result.records")),
  }
}

#[async_trait]
impl SourceAdapter for CedenAdapter {
  fn source(&self) -> &SourceId { &self.source }

  fn partitions(&self) -> &[String] { &self.partitions }

  fn concurrency(&self) -> PartitionConcurrency { self.concurrency }

  fn pacing(&self) -> &Pacing { &self.pacing }

  async fn fetch_page(&self, partition: &str, page: PageRequest) -> Result<Page, UpstreamError> {
    let url = self.config.endpoint.as_str();
    let resource = self
      .resource_id(partition)
      .ok_or_else(|| UpstreamError::malformed(url, format!("no resource for partition {partition}")))?;
    let sql = self.page_sql(resource, page);
    let body = self.upstream.get_json(url, &[("sql", sql)]).await?;
    Ok(Page::from_rows(ckan_records(url, body)?, page.limit))
  }

  fn transform(&self, _partition: &str, row: &Value) -> Option<GeoRecord> {
    match self.config.dataset {
      CedenDataset::Chemistry => self.chemistry(row),
      CedenDataset::Toxicity => self.toxicity(row),
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{testing::sid, upstream::UpstreamConfig};

  fn adapter(dataset: CedenDataset, since: Option<&str>) -> CedenAdapter {
    CedenAdapter::new(
      AdapterSettings {
        source:      sid("ceden-chemistry"),
        partitions:  vec![],
        pacing:      Pacing { page_size: 100_000, ..Pacing::immediate() },
        concurrency: PartitionConcurrency::Sequential,
      },
      CedenConfig {
        endpoint: DEFAULT_ENDPOINT.into(),
        dataset,
        resources: vec![
          CedenResource { partition: "2025".into(), resource_id: "97b8bb60".into() },
          CedenResource { partition: "aug".into(), resource_id: "e07c5e0b".into() },
        ],
        since: since.map(str::to_owned),
      },
      Upstream::new(UpstreamConfig::default()).unwrap(),
    )
    .unwrap()
  }

  #[test]
  fn partitions_follow_resources_and_page_size_is_capped() {
    let a = adapter(CedenDataset::Chemistry, None);
    assert_eq!(a.partitions(), ["2025", "aug"]);
    assert_eq!(a.pacing().page_size, MAX_PAGE_SIZE);
  }

  #[test]
  fn sql_is_newest_first_with_offset() {
    let a = adapter(CedenDataset::Toxicity, Some("2022-01-01"));
    let sql = a.page_sql("97b8bb60", PageRequest { index: 2, offset: 64_000, limit: 32_000 });
    assert!(sql.contains(r#"FROM "97b8bb60""#));
    assert!(sql.contains(r#""Latitude" > 0"#));
    assert!(sql.contains(r#""SampleDate" >= '2022-01-01'"#));
    assert!(sql.ends_with(r#"ORDER BY "SampleDate" DESC LIMIT 32000 OFFSET 64000"#));
    assert!(!sql.contains(r#""Analyte" IN"#));
  }

  #[test]
  fn chemistry_sql_filters_analytes() {
    let a = adapter(CedenDataset::Chemistry, None);
    let sql = a.page_sql("97b8bb60", PageRequest::first(10));
    assert!(sql.contains("'Oxygen, Dissolved'"));
    assert!(sql.contains("'E. coli'"));
  }

  #[test]
  fn rejects_bad_since_date() {
    let err = CedenAdapter::new(
      AdapterSettings {
        source:      sid("ceden-toxicity"),
        partitions:  vec![],
        pacing:      Pacing::immediate(),
        concurrency: PartitionConcurrency::Sequential,
      },
      CedenConfig {
        endpoint:  DEFAULT_ENDPOINT.into(),
        dataset:   CedenDataset::Toxicity,
        resources: vec![CedenResource { partition: "tox".into(), resource_id: "bd48".into() }],
        since:     Some("2022'; DROP".into()),
      },
      Upstream::new(UpstreamConfig::default()).unwrap(),
    );
    assert!(err.is_err());
  }

  #[test]
  fn chemistry_row_maps_analyte_and_coerces_strings() {
    let a = adapter(CedenDataset::Chemistry, None);
    let row = json!({
      "StationName": "Putah Creek", "StationCode": "510PCR001",
      "SampleDate": "2025-03-04T00:00:00", "Analyte": "Oxygen, Dissolved",
      "Result": "8.4", "Unit": "mg/L", "Latitude": "38.52", "Longitude": "-121.77",
    });
    let r = a.transform("2025", &row).unwrap();
    assert_eq!(r.kind, "chemistry");
    assert_eq!(r.key, "510PCR001:DO");
    assert_eq!(r.attributes["value"], 8.4);
    assert_eq!(r.observed_at.as_deref(), Some("2025-03-04T00:00:00"));
  }

  #[test]
  fn unmapped_analyte_or_blank_result_is_dropped() {
    let a = adapter(CedenDataset::Chemistry, None);
    let base = json!({"StationCode": "X", "Latitude": 38.5, "Longitude": -121.7});
    let mut unmapped = base.clone();
    unmapped["Analyte"] = json!("Mercury");
    unmapped["Result"] = json!(1.0);
    assert!(a.transform("2025", &unmapped).is_none());

    let mut blank = base;
    blank["Analyte"] = json!("pH");
    blank["Result"] = json!("");
    assert!(a.transform("2025", &blank).is_none());
  }

  #[test]
  fn toxicity_significant_effect_is_alert() {
    let a = adapter(CedenDataset::Toxicity, None);
    let row = json!({
      "StationCode": "204SFB", "OrganismName": "Hyalella azteca",
      "SigEffectCode": "SL", "Latitude": 37.6, "Longitude": -122.3,
    });
    let r = a.transform("tox", &row).unwrap();
    assert_eq!(r.key, "204SFB:Hyalella azteca");
    assert!(r.alert);

    let mut calm = row.clone();
    calm["SigEffectCode"] = json!("NSC");
    assert!(!a.transform("tox", &calm).unwrap().alert);
  }

  #[test]
  fn ckan_failure_is_malformed() {
    let err = ckan_records("u", json!({"success": false, "error": {"message": "bad sql"}})).unwrap_err();
    assert!(matches!(err, UpstreamError::Malformed { ref message, .. } if message == "bad sql"));

    let ok = ckan_records("u", json!({"success": true, "result": {"records": [{"a": 1}]}})).unwrap();
    assert_eq!(ok.len(), 1);
  }
}
