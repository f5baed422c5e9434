//! HTTP interface for Tidewater.
//!
//! Read endpoints under `/api` serve lookups and observability from the
//! in-memory caches. Trigger endpoints under `/cron` start builds, scheduler
//! ticks and insight runs; they require the shared bearer secret.
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | `GET`  | `/api/lookup?lat=&lng=[&source=]` | none |
//! | `GET`  | `/api/status`, `/api/status/{source}` | none |
//! | `GET`  | `/api/schedule`, `/api/health/{source}` | none |
//! | `GET`  | `/cron/tick` | bearer |
//! | `GET`  | `/cron/rebuild/{source}` | bearer |
//! | `GET`  | `/cron/insights`, `/cron/insights/urgent` | bearer |

pub mod auth;
pub mod cron;
pub mod error;
pub mod lookup;
pub mod status;

use std::sync::Arc;

use axum::{Router, routing::get};
use tidewater_core::{coordination::CoordinationStore, insight::InsightStore};
use tidewater_engine::{insights::InsightsPipeline, registry::SourceRegistry, scheduler::Scheduler};
use tower_http::trace::TraceLayer;

pub use auth::AuthConfig;
pub use error::ApiError;

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S> {
  pub registry:  Arc<SourceRegistry>,
  pub scheduler: Arc<Scheduler<S>>,
  /// `None` when no insights endpoint is configured.
  pub insights:  Option<Arc<InsightsPipeline<S>>>,
  pub auth:      Arc<AuthConfig>,
}

impl<S> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self {
      registry:  Arc::clone(&self.registry),
      scheduler: Arc::clone(&self.scheduler),
      insights:  self.insights.clone(),
      auth:      Arc::clone(&self.auth),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

pub fn router<S>(state: AppState<S>) -> Router
where
  S: CoordinationStore + InsightStore + 'static,
{
  Router::new()
    // Read interface
    .route("/api/lookup", get(lookup::handler::<S>))
    .route("/api/status", get(status::all::<S>))
    .route("/api/status/{source}", get(status::one::<S>))
    .route("/api/schedule", get(status::schedule::<S>))
    .route("/api/health/{source}", get(status::health::<S>))
    // Trigger interface
    .route("/cron/tick", get(cron::tick::<S>))
    .route("/cron/rebuild/{source}", get(cron::rebuild::<S>))
    .route("/cron/insights", get(cron::insights::<S>))
    .route("/cron/insights/urgent", get(cron::insights_urgent::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

// ─── Integration tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
  use async_trait::async_trait;
  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
  };
  use rand_core::OsRng;
  use serde_json::{Value, json};
  use tidewater_core::{
    grid::GridIndex,
    record::{GeoRecord, parse_number, parse_text},
    schedule::SchedulePolicy,
    source::SourceId,
  };
  use tidewater_engine::{
    adapter::{Page, PageRequest, Pacing, SourceAdapter},
    build::BuildOrchestrator,
    cache::CacheStore,
    insights::{GenerateError, InsightGenerator, InsightsSettings, RegistrySignals},
    lock::DEFAULT_BUILD_TIMEOUT,
    registry::SourceEntry,
    scheduler::DEFAULT_LOCK_TTL,
    upstream::UpstreamError,
  };
  use tidewater_store_sqlite::SqliteStore;
  use tower::ServiceExt as _;

  use super::*;

  const SECRET: &str = "s3cret";

  /// One partition, fixed rows.
  struct FixedAdapter {
    source:     SourceId,
    partitions: Vec<String>,
    pacing:     Pacing,
    rows:       Vec<Value>,
  }

  #[async_trait]
  impl SourceAdapter for FixedAdapter {
    fn source(&self) -> &SourceId { &self.source }

    fn partitions(&self) -> &[String] { &self.partitions }

    fn pacing(&self) -> &Pacing { &self.pacing }

    async fn fetch_page(&self, _partition: &str, _page: PageRequest) -> Result<Page, UpstreamError> {
      Ok(Page::single(self.rows.clone()))
    }

    fn transform(&self, _partition: &str, row: &Value) -> Option<GeoRecord> {
      Some(
        GeoRecord::new("facility", parse_text(&row["key"])?, parse_number(&row["lat"])?, parse_number(&row["lng"])?)
          .with_alert(row["alert"].as_bool().unwrap_or(false)),
      )
    }
  }

  struct EchoGenerator;

  #[async_trait]
  impl InsightGenerator for EchoGenerator {
    fn provider(&self) -> &str { "echo" }

    async fn generate(
      &self,
      key: &tidewater_core::insight::InsightKey,
      _signals: &Value,
    ) -> Result<String, GenerateError> {
      Ok(format!("{} {}", key.partition, key.role))
    }
  }

  fn entry(id: &str) -> SourceEntry {
    let source = SourceId::new(id).unwrap();
    let adapter = FixedAdapter {
      source:     source.clone(),
      partitions: vec!["MD".into()],
      pacing:     Pacing::immediate(),
      rows:       vec![
        json!({"key": "blue-plains", "lat": 38.82, "lng": -77.02, "alert": true}),
        json!({"key": "back-river", "lat": 39.29, "lng": -76.49}),
      ],
    };
    let cache = Arc::new(CacheStore::new(source, GridIndex::default(), None));
    let orch = Arc::new(BuildOrchestrator::new(Arc::new(adapter), cache, DEFAULT_BUILD_TIMEOUT));
    SourceEntry::local(orch, SchedulePolicy::default(), true)
  }

  async fn state(with_insights: bool) -> AppState<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let registry = Arc::new(SourceRegistry::new([entry("echo-facilities"), entry("nwis")]).unwrap());
    let scheduler = Arc::new(Scheduler::new(store.clone(), registry.clone(), "test", DEFAULT_LOCK_TTL));
    let insights = with_insights.then(|| {
      Arc::new(InsightsPipeline::new(
        store.clone(),
        Arc::new(RegistrySignals::new(registry.clone())),
        Arc::new(EchoGenerator),
        InsightsSettings { retry_base_delay: Duration::from_millis(1), ..Default::default() },
      ))
    });

    let salt = SaltString::generate(&mut OsRng);
    let token_hash = Argon2::default()
      .hash_password(SECRET.as_bytes(), &salt)
      .unwrap()
      .to_string();

    AppState { registry, scheduler, insights, auth: Arc::new(AuthConfig { token_hash }) }
  }

  async fn get(state: &AppState<SqliteStore>, uri: &str, token: Option<&str>) -> Response {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
      builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    router(state.clone()).oneshot(builder.body(Body::empty()).unwrap()).await.unwrap()
  }

  async fn json_body(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  // ── Auth ───────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn cron_requires_token() {
    let s = state(false).await;

    let missing = get(&s, "/cron/tick", None).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert!(missing.headers().contains_key(header::WWW_AUTHENTICATE));
    assert_eq!(json_body(missing).await["error"], "unauthorized");

    let wrong = get(&s, "/cron/rebuild/nwis", Some("guess")).await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert!(!s.registry.status()[&SourceId::new("nwis").unwrap()].is_loaded());
  }

  // ── Rebuild + read path ────────────────────────────────────────────────────

  #[tokio::test]
  async fn rebuild_then_lookup() {
    let s = state(false).await;

    let resp = get(&s, "/cron/rebuild/nwis", Some(SECRET)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report = json_body(resp).await;
    assert_eq!(report["status"], "complete");
    assert_eq!(report["totalRecords"], 2);
    assert_eq!(report["partitionsProcessed"], json!(["MD"]));

    let resp = get(&s, "/api/lookup?lat=38.83&lng=-77.01", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1, "only the rebuilt source is loaded");
    assert_eq!(results[0]["source"], "nwis");
    assert_eq!(results[0]["records"]["facility"][0]["key"], "blue-plains");

    let status = json_body(get(&s, "/api/status", None).await).await;
    assert_eq!(status["nwis"]["loaded"], true);
    assert_eq!(status["echo-facilities"]["loaded"], false);

    let one = json_body(get(&s, "/api/status/nwis", None).await).await;
    assert_eq!(one["totalRecords"], 2);
  }

  #[tokio::test]
  async fn unknown_source_is_404() {
    let s = state(false).await;
    assert_eq!(get(&s, "/cron/rebuild/nope", Some(SECRET)).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(get(&s, "/api/status/Not_Valid", None).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(get(&s, "/api/lookup?lat=38.8&lng=-77.0&source=nope", None).await.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn lookup_validates_coordinates() {
    let s = state(false).await;
    let resp = get(&s, "/api/lookup?lat=123&lng=-77", None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(resp).await["error"].as_str().unwrap().contains("lat"));
    assert_eq!(get(&s, "/api/lookup?lat=38.8", None).await.status(), StatusCode::BAD_REQUEST);
  }

  // ── Scheduler ──────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn tick_runs_sources_and_records_health() {
    let s = state(false).await;

    let report = json_body(get(&s, "/cron/tick", Some(SECRET)).await).await;
    assert_eq!(report["ran"], 2);
    assert_eq!(report["sources"][0]["result"], "ran");
    assert_eq!(report["sources"][0]["outcome"], "success");

    let rows = json_body(get(&s, "/api/schedule", None).await).await;
    assert_eq!(rows.as_array().unwrap().len(), 2);
    assert_eq!(rows[0]["lastStatus"], "success");

    let health = json_body(get(&s, "/api/health/nwis?limit=5", None).await).await;
    assert_eq!(health[0]["outcome"], "success");
    assert_eq!(health[0]["records"], 2);

    let again = json_body(get(&s, "/cron/tick", Some(SECRET)).await).await;
    assert_eq!(again["ran"], 0);
    assert_eq!(again["sources"][1]["result"], "notDue");
  }

  // ── Insights ───────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn insights_require_configuration() {
    let s = state(false).await;
    assert_eq!(get(&s, "/cron/insights", Some(SECRET)).await.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn insights_run_and_delta_skip() {
    let s = state(true).await;
    get(&s, "/cron/rebuild/nwis", Some(SECRET)).await;

    let first = json_body(get(&s, "/cron/insights", Some(SECRET)).await).await;
    assert_eq!(first["status"], "complete");
    assert_eq!(first["generated"], 1);

    let second = json_body(get(&s, "/cron/insights", Some(SECRET)).await).await;
    assert_eq!(second["generated"], 0);
    assert_eq!(second["fresh"], 1);

    let urgent = json_body(get(&s, "/cron/insights/urgent", Some(SECRET)).await).await;
    assert_eq!(urgent["mode"], "urgent");
    assert_eq!(urgent["fresh"], 1, "MD carries an alert so it is critical");
  }
}
