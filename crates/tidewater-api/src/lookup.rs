//! Handler for `GET /api/lookup`.
//!
//! | Param    | Notes                                   |
//! |----------|-----------------------------------------|
//! | `lat`    | Required, `-90..=90`                    |
//! | `lng`    | Required, `-180..=180`                  |
//! | `source` | Optional; restrict to one source (404 if unknown) |

use axum::{
  Json,
  extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use tidewater_core::source::SourceId;
use tidewater_engine::registry::SourceHit;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct LookupParams {
  pub lat:    f64,
  pub lng:    f64,
  pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LookupResponse {
  pub lat:     f64,
  pub lng:     f64,
  pub results: Vec<SourceHit>,
}

/// `GET /api/lookup?lat=..&lng=..[&source=..]`
pub async fn handler<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<LookupParams>,
) -> Result<Json<LookupResponse>, ApiError> {
  let LookupParams { lat, lng, source } = params;
  if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
    return Err(ApiError::BadRequest(format!("lat out of range: {lat}")));
  }
  if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
    return Err(ApiError::BadRequest(format!("lng out of range: {lng}")));
  }

  let source = source
    .map(|s| s.parse::<SourceId>().map_err(|_| ApiError::NotFound(format!("source {s} not found"))))
    .transpose()?;
  let results = state.registry.lookup(lat, lng, source.as_ref())?;
  Ok(Json(LookupResponse { lat, lng, results }))
}
