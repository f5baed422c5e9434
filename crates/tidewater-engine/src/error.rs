//! Error type for `tidewater-engine`.

use thiserror::Error;
use tidewater_core::source::SourceId;

use crate::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] tidewater_core::Error),

  #[error(transparent)]
  Upstream(#[from] UpstreamError),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("coordination store error: {0}")]
  Coordination(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("unknown source: {0}")]
  UnknownSource(SourceId),

  #[error("remote trigger failed: {0}")]
  Remote(String),

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl Error {
  pub(crate) fn coordination(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Coordination(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
