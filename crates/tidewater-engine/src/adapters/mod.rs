//! Concrete [`SourceAdapter`]s, selected from configuration.
//!
//! | `type`        | Upstream                                        |
//! |---------------|-------------------------------------------------|
//! | `ceden`       | CKAN `datastore_search_sql`, LIMIT/OFFSET pages |
//! | `envirofacts` | EPA Envirofacts `rows/{a}:{b}/JSON` pages       |
//! | `nwis`        | USGS instantaneous values, one call per state   |
//! | `bulk_tsv`    | Tab-delimited bulk file, optionally gzipped     |

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tidewater_core::{
  record::{GeoRecord, parse_text},
  source::SourceId,
};

use crate::{
  Error, Result,
  adapter::{Pacing, PartitionConcurrency, SourceAdapter},
  upstream::Upstream,
};

pub mod bulk_tsv;
pub mod ceden;
pub mod envirofacts;
pub mod nwis;

pub use bulk_tsv::{BulkTsvAdapter, BulkTsvConfig};
pub use ceden::{CedenAdapter, CedenConfig, CedenDataset};
pub use envirofacts::{EnvirofactsAdapter, EnvirofactsConfig};
pub use nwis::{NwisAdapter, NwisConfig};

/// Adapter selection, as written under `[sources.adapter]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterConfig {
  Ceden(CedenConfig),
  Envirofacts(EnvirofactsConfig),
  Nwis(NwisConfig),
  BulkTsv(BulkTsvConfig),
}

/// Settings common to every adapter.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
  pub source:      SourceId,
  pub partitions:  Vec<String>,
  pub pacing:      Pacing,
  pub concurrency: PartitionConcurrency,
}

impl AdapterConfig {
  pub fn build(self, settings: AdapterSettings, upstream: Upstream) -> Result<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match self {
      Self::Ceden(config) => Arc::new(CedenAdapter::new(settings, config, upstream)?),
      Self::Envirofacts(config) => {
        require_partitions(&settings)?;
        Arc::new(EnvirofactsAdapter::new(settings, config, upstream))
      }
      Self::Nwis(config) => {
        require_partitions(&settings)?;
        Arc::new(NwisAdapter::new(settings, config, upstream))
      }
      Self::BulkTsv(config) => {
        require_partitions(&settings)?;
        Arc::new(BulkTsvAdapter::new(settings, config, upstream)?)
      }
    };
    Ok(adapter)
  }
}

fn require_partitions(settings: &AdapterSettings) -> Result<()> {
  if settings.partitions.is_empty() {
    return Err(Error::Config(format!("source {} has no partitions", settings.source)));
  }
  Ok(())
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

static NULL: Value = Value::Null;

/// Field lookup that tolerates upstreams switching column case.
pub(crate) fn field<'a>(row: &'a Value, name: &str) -> &'a Value {
  row
    .get(name)
    .or_else(|| row.get(name.to_ascii_lowercase()))
    .or_else(|| row.get(name.to_ascii_uppercase()))
    .unwrap_or(&NULL)
}

/// Join the named fields with `:`. `None` if any part is missing.
pub(crate) fn join_key(row: &Value, names: &[String]) -> Option<String> {
  let parts: Option<Vec<String>> = names.iter().map(|n| parse_text(field(row, n))).collect();
  parts.filter(|p| !p.is_empty()).map(|p| p.join(":"))
}

/// Copy the named fields into the record's attributes under their
/// lowercase names.
pub(crate) fn copy_attributes(mut record: GeoRecord, row: &Value, names: &[String]) -> GeoRecord {
  for name in names {
    let value = field(row, name);
    let value = match value {
      Value::String(s) if s.trim().is_empty() => continue,
      other => other.clone(),
    };
    record = record.with_attr(&name.to_ascii_lowercase(), value);
  }
  record
}

/// Upstream boolean-ish flags: `true`, `"Y"`, `"yes"`, `"true"`, non-zero.
pub(crate) fn truthy(value: &Value) -> bool {
  match value {
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
    Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "y" | "yes" | "true" | "1"),
    _ => false,
  }
}
