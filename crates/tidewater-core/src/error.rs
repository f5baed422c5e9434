//! Error types for `tidewater-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid source id: {0:?}")]
  InvalidSourceId(String),

  #[error("unknown run outcome: {0:?}")]
  UnknownOutcome(String),

  #[error("invalid grid resolution: {0}")]
  InvalidResolution(f64),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
