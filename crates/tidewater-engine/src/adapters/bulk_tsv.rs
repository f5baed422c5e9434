//! Tab-delimited bulk downloads, one file per partition.
//!
//! Some programs (ECHO exports, state portals) only publish full-table
//! dumps. The file is fetched whole, decompressed if it is gzip, and every
//! line after the header becomes a JSON object keyed by column name.

use std::io::Read;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::{Map, Value};
use tidewater_core::{
  record::{GeoRecord, parse_number, parse_text},
  source::SourceId,
};

use super::{AdapterSettings, copy_attributes, field, join_key, truthy};
use crate::{
  Error, Result,
  adapter::{Page, PageRequest, Pacing, PartitionConcurrency, SourceAdapter},
  upstream::{Upstream, UpstreamError},
};

const PARTITION_PLACEHOLDER: &str = "{partition}";

#[derive(Debug, Clone, Deserialize)]
pub struct BulkTsvConfig {
  /// Download URL with a `{partition}` placeholder.
  pub url_template:    String,
  /// `None` sniffs the gzip magic bytes.
  #[serde(default)]
  pub gzip:            Option<bool>,
  pub kind:            String,
  pub key_columns:     Vec<String>,
  pub lat_column:      String,
  pub lng_column:      String,
  #[serde(default)]
  pub observed_column: Option<String>,
  #[serde(default)]
  pub alert_column:    Option<String>,
  #[serde(default)]
  pub attributes:      Vec<String>,
}

pub struct BulkTsvAdapter {
  source:      SourceId,
  partitions:  Vec<String>,
  pacing:      Pacing,
  concurrency: PartitionConcurrency,
  config:      BulkTsvConfig,
  upstream:    Upstream,
}

impl BulkTsvAdapter {
  pub fn new(settings: AdapterSettings, config: BulkTsvConfig, upstream: Upstream) -> Result<Self> {
    if !config.url_template.contains(PARTITION_PLACEHOLDER) {
      return Err(Error::Config(format!(
        "source {}: url_template must contain {PARTITION_PLACEHOLDER}",
        settings.source
      )));
    }
    Ok(Self {
      source: settings.source,
      partitions: settings.partitions,
      pacing: settings.pacing,
      concurrency: settings.concurrency,
      config,
      upstream,
    })
  }

  pub fn url_for(&self, partition: &str) -> String {
    self.config.url_template.replace(PARTITION_PLACEHOLDER, partition)
  }
}

#[async_trait]
impl SourceAdapter for BulkTsvAdapter {
  fn source(&self) -> &SourceId { &self.source }

  fn partitions(&self) -> &[String] { &self.partitions }

  fn concurrency(&self) -> PartitionConcurrency { self.concurrency }

  fn pacing(&self) -> &Pacing { &self.pacing }

  async fn fetch_page(&self, partition: &str, _page: PageRequest) -> Result<Page, UpstreamError> {
    let url = self.url_for(partition);
    let bytes = self.upstream.get_bytes(&url, &[]).await?;
    let gzip = self.config.gzip;

    // Bulk files run to hundreds of megabytes; keep the parse off the runtime.
    let parsed = tokio::task::spawn_blocking(move || decode(&bytes, gzip).map(|text| parse_tsv(&text)))
      .await
      .map_err(|e| UpstreamError::malformed(&url, format!("parse task failed: {e}")))?;

    match parsed {
      Ok(rows) => Ok(Page::single(rows)),
      Err(e) => Err(UpstreamError::malformed(&url, e.to_string())),
    }
  }

  fn transform(&self, _partition: &str, row: &Value) -> Option<GeoRecord> {
    let key = join_key(row, &self.config.key_columns)?;
    let lat = parse_number(field(row, &self.config.lat_column))?;
    let lng = parse_number(field(row, &self.config.lng_column))?;
    let alert = self.config.alert_column.as_ref().is_some_and(|c| truthy(field(row, c)));

    let mut record = GeoRecord::new(self.config.kind.clone(), key, lat, lng).with_alert(alert);
    if let Some(column) = &self.config.observed_column {
      record = record.with_observed_at(parse_text(field(row, column)));
    }
    Some(copy_attributes(record, row, &self.config.attributes))
  }
}

/// Decompress if needed and decode as UTF-8, replacing invalid bytes.
fn decode(bytes: &[u8], gzip: Option<bool>) -> std::io::Result<String> {
  let is_gzip = gzip.unwrap_or_else(|| bytes.starts_with(&[0x1f, 0x8b]));
  if !is_gzip {
    return Ok(String::from_utf8_lossy(bytes).into_owned());
  }
  let mut raw = Vec::new();
  GzDecoder::new(bytes).read_to_end(&mut raw)?;
  Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Header line names the columns. Short lines are padded with nulls and
/// blank lines skipped.
fn parse_tsv(text: &str) -> Vec<Value> {
  let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));
  let Some(header) = lines.next() else { return Vec::new() };
  let columns: Vec<&str> = header.split('\t').map(str::trim).collect();

  lines
    .filter(|line| !line.trim().is_empty())
    .map(|line| {
      let mut cells = line.split('\t');
      let object: Map<String, Value> = columns
        .iter()
        .map(|name| {
          let cell = cells.next().map(str::trim).filter(|c| !c.is_empty());
          ((*name).to_owned(), cell.map_or(Value::Null, |c| Value::String(c.to_owned())))
        })
        .collect();
      Value::Object(object)
    })
    .collect()
}
