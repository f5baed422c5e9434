//! USGS NWIS instantaneous values, one request per state.
//!
//! The response carries one time series per site and parameter. Each series
//! becomes a single gauge record holding its latest reading.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tidewater_core::{
  record::{GeoRecord, parse_number, parse_text},
  source::SourceId,
};

use super::AdapterSettings;
use crate::{
  adapter::{Page, PageRequest, Pacing, PartitionConcurrency, SourceAdapter},
  upstream::{Upstream, UpstreamError},
};

pub const DEFAULT_BASE_URL: &str = "https://waterservices.usgs.gov/nwis/iv/";

/// NWIS reports missing readings with this sentinel.
const NO_DATA: f64 = -999_999.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NwisConfig {
  pub base_url:   String,
  /// Parameter code → parameter key, e.g. `"00300" = "DO"`.
  pub parameters: BTreeMap<String, String>,
  /// ISO-8601 lookback window.
  pub period:     String,
}

impl Default for NwisConfig {
  fn default() -> Self {
    let parameters = [
      ("00300", "DO"),
      ("00010", "temperature"),
      ("00400", "pH"),
      ("63680", "turbidity"),
      ("00095", "conductivity"),
      ("00060", "discharge"),
      ("00065", "gage_height"),
      ("00480", "salinity"),
    ]
    .into_iter()
    .map(|(code, key)| (code.to_owned(), key.to_owned()))
    .collect();
    Self { base_url: DEFAULT_BASE_URL.to_owned(), parameters, period: "P1D".to_owned() }
  }
}

pub struct NwisAdapter {
  source:      SourceId,
  partitions:  Vec<String>,
  pacing:      Pacing,
  concurrency: PartitionConcurrency,
  config:      NwisConfig,
  upstream:    Upstream,
}

impl NwisAdapter {
  pub fn new(settings: AdapterSettings, config: NwisConfig, upstream: Upstream) -> Self {
    Self {
      source: settings.source,
      partitions: settings.partitions,
      pacing: settings.pacing,
      concurrency: settings.concurrency,
      config,
      upstream,
    }
  }

  pub fn query(&self, partition: &str) -> Vec<(&'static str, String)> {
    let codes = self.config.parameters.keys().cloned().collect::<Vec<_>>().join(",");
    vec![
      ("format", "json".to_owned()),
      ("stateCd", partition.to_ascii_lowercase()),
      ("parameterCd", codes),
      ("period", self.config.period.clone()),
      ("siteStatus", "active".to_owned()),
    ]
  }
}

#[async_trait]
impl SourceAdapter for NwisAdapter {
  fn source(&self) -> &SourceId { &self.source }

  fn partitions(&self) -> &[String] { &self.partitions }

  fn concurrency(&self) -> PartitionConcurrency { self.concurrency }

  fn pacing(&self) -> &Pacing { &self.pacing }

  async fn fetch_page(&self, partition: &str, _page: PageRequest) -> Result<Page, UpstreamError> {
    let url = self.config.base_url.as_str();
    let mut body = self.upstream.get_json(url, &self.query(partition)).await?;
    match body.pointer_mut("/value/timeSeries").map(Value::take) {
      Some(Value::Array(series)) => Ok(Page::single(series)),
      // A state with no active sites answers without the array.
      Some(Value::Null) | None => Ok(Page::single(Vec::new())),
      Some(_) => Err(UpstreamError::malformed(url, "value.timeSeries is not an array")),
    }
  }

  fn transform(&self, _partition: &str, series: &Value) -> Option<GeoRecord> {
    let site = &series["sourceInfo"];
    let site_code = parse_text(&site["siteCode"][0]["value"])?;
    let location = &site["geoLocation"]["geogLocation"];
    let lat = parse_number(&location["latitude"])?;
    let lng = parse_number(&location["longitude"])?;

    let code = parse_text(&series["variable"]["variableCode"][0]["value"])?;
    let parameter = self.config.parameters.get(&code).cloned().unwrap_or_else(|| code.clone());

    // Readings are oldest first.
    let latest = series["values"][0]["value"]
      .as_array()?
      .iter()
      .rev()
      .find(|v| parse_number(&v["value"]).is_some_and(|x| x != NO_DATA))?;

    Some(
      GeoRecord::new("gauge", format!("{site_code}:{parameter}"), lat, lng)
        .with_observed_at(parse_text(&latest["dateTime"]))
        .with_attr("site", site_code)
        .with_attr("siteName", parse_text(&site["siteName"]))
        .with_attr("parameter", parameter)
        .with_attr("parameterCode", code)
        .with_attr("value", parse_number(&latest["value"]))
        .with_attr("unit", parse_text(&series["variable"]["unit"]["unitCode"]))
        .with_attr("qualifier", parse_text(&latest["qualifiers"][0])),
    )
  }
}
