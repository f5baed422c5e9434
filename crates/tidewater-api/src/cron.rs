//! Bearer-guarded trigger endpoints.
//!
//! Every handler answers 200 with a structured report; failures inside a
//! build or tick are part of the report, not an HTTP error. The work runs on
//! its own task, so a caller that disconnects or times out does not cancel
//! it halfway.

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
};
use chrono::Utc;
use tidewater_core::{coordination::CoordinationStore, insight::InsightStore, source::SourceId};
use tidewater_engine::{
  build::BuildReport,
  insights::InsightsReport,
  scheduler::TickReport,
  trigger::trigger_detached,
};
use tracing::info;

use crate::{AppState, auth::Authenticated, error::ApiError};

/// `GET /cron/tick`
pub async fn tick<S>(_auth: Authenticated, State(state): State<AppState<S>>) -> Json<TickReport>
where
  S: CoordinationStore + 'static,
{
  Json(state.scheduler.tick(Utc::now()).await)
}

/// `GET /cron/rebuild/{source}`
pub async fn rebuild<S>(
  _auth: Authenticated,
  State(state): State<AppState<S>>,
  Path(source): Path<String>,
) -> Result<Json<BuildReport>, ApiError> {
  let id: SourceId = source
    .parse()
    .map_err(|_| ApiError::NotFound(format!("source {source} not found")))?;
  let entry = state.registry.require(&id)?;
  info!(source = %id, "rebuild requested");
  Ok(Json(trigger_detached(Arc::clone(entry.trigger()), id).await))
}

/// `GET /cron/insights`
pub async fn insights<S>(
  _auth: Authenticated,
  State(state): State<AppState<S>>,
) -> Result<Json<InsightsReport>, ApiError>
where
  S: InsightStore + 'static,
{
  let pipeline = Arc::clone(state.insights.as_ref().ok_or_else(not_configured)?);
  let report = tokio::spawn(async move { pipeline.run(Utc::now()).await }).await?;
  Ok(Json(report))
}

/// `GET /cron/insights/urgent`
pub async fn insights_urgent<S>(
  _auth: Authenticated,
  State(state): State<AppState<S>>,
) -> Result<Json<InsightsReport>, ApiError>
where
  S: InsightStore + 'static,
{
  let pipeline = Arc::clone(state.insights.as_ref().ok_or_else(not_configured)?);
  let report = tokio::spawn(async move { pipeline.run_urgent(Utc::now()).await }).await?;
  Ok(Json(report))
}

fn not_configured() -> ApiError { ApiError::NotFound("insights pipeline not configured".to_owned()) }
