//! Cache status and scheduler observability.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/api/status` | Every source's [`CacheStatus`] |
//! | `GET`  | `/api/status/{source}` | 404 if unknown |
//! | `GET`  | `/api/schedule` | Persisted scheduler rows |
//! | `GET`  | `/api/health/{source}` | Newest first, `?limit=` (default 20) |

use std::collections::BTreeMap;

use axum::{
  Json,
  extract::{Path, Query, State},
};
use serde::Deserialize;
use tidewater_core::{
  coordination::CoordinationStore,
  schedule::{HealthEntry, SchedulerRow},
  source::SourceId,
  status::CacheStatus,
};

use crate::{AppState, error::ApiError};

const DEFAULT_HEALTH_LIMIT: usize = 20;
const MAX_HEALTH_LIMIT: usize = 200;

fn parse_source(raw: &str) -> Result<SourceId, ApiError> {
  raw.parse().map_err(|_| ApiError::NotFound(format!("source {raw} not found")))
}

/// `GET /api/status`
pub async fn all<S>(State(state): State<AppState<S>>) -> Json<BTreeMap<SourceId, CacheStatus>> {
  Json(state.registry.status())
}

/// `GET /api/status/{source}`
pub async fn one<S>(
  State(state): State<AppState<S>>,
  Path(source): Path<String>,
) -> Result<Json<CacheStatus>, ApiError> {
  let id = parse_source(&source)?;
  let entry = state.registry.require(&id)?;
  Ok(Json(entry.cache().status()))
}

/// `GET /api/schedule`
pub async fn schedule<S>(State(state): State<AppState<S>>) -> Result<Json<Vec<SchedulerRow>>, ApiError>
where
  S: CoordinationStore,
{
  let rows = state.scheduler.store().list_schedules().await.map_err(ApiError::store)?;
  Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct HealthParams {
  pub limit: Option<usize>,
}

/// `GET /api/health/{source}[?limit=N]`
pub async fn health<S>(
  State(state): State<AppState<S>>,
  Path(source): Path<String>,
  Query(params): Query<HealthParams>,
) -> Result<Json<Vec<HealthEntry>>, ApiError>
where
  S: CoordinationStore,
{
  let id = parse_source(&source)?;
  state.registry.require(&id)?;
  let limit = params.limit.unwrap_or(DEFAULT_HEALTH_LIMIT).clamp(1, MAX_HEALTH_LIMIT);
  let entries = state
    .scheduler
    .store()
    .recent_health(&id, limit)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(entries))
}
