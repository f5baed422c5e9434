//! tidewater-server binary.
//!
//! Reads `tidewater.toml` (or the path given with `--config`), layered with
//! `TIDEWATER__*` environment variables, and either serves the HTTP API or
//! runs one operation and exits.
//!
//! # Trigger secret
//!
//! The cron endpoints expect a bearer token whose argon2 hash is stored as
//! `trigger_token_hash`. Generate it with:
//!
//! ```
//! cargo run -p tidewater-server -- hash-token
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context as _, bail};
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand_core::OsRng;
use tidewater_api::AppState;
use tidewater_core::source::SourceId;
use tidewater_engine::build::BuildStatus;
use tidewater_server::{ServerConfig, build_state, config::InsightsConfig};
use tidewater_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Tidewater environmental data cache")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tidewater.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the HTTP API (default).
  Serve,
  /// Build one source now and print the report.
  Rebuild {
    /// Source id, e.g. `nwis`.
    source: String,
  },
  /// Run one scheduler tick and print the report.
  Tick,
  /// Run the insights pipeline once and print the report.
  Insights {
    /// Only refresh critical partitions.
    #[arg(long)]
    urgent: bool,
  },
  /// Print the argon2 hash for a trigger token entered on stdin and exit.
  HashToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let command = cli.command.unwrap_or(Command::Serve);

  if let Command::HashToken = command {
    let token = read_token()?;
    if token.is_empty() {
      bail!("empty token");
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(token.as_bytes(), &salt)
      .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
      .to_string();
    println!("{hash}");
    return Ok(());
  }

  let cfg = ServerConfig::load(&cli.config)?;
  let state = build_state(&cfg).await?;
  state.registry.ensure_warmed_all().await;

  match command {
    Command::Serve => serve(&cfg, state).await,
    Command::Rebuild { source } => {
      let id: SourceId = source.parse().context("invalid source id")?;
      let entry = state.registry.require(&id)?;
      let report = entry.trigger().trigger().await;
      print_json(&report)?;
      state.registry.flush_all().await;
      if report.status == BuildStatus::Error {
        bail!("build failed for {id}");
      }
      Ok(())
    }
    Command::Tick => {
      let report = state.scheduler.tick(Utc::now()).await;
      print_json(&report)?;
      state.registry.flush_all().await;
      Ok(())
    }
    Command::Insights { urgent } => {
      let Some(pipeline) = &state.insights else {
        bail!("no [insights] section configured");
      };
      let report = if urgent {
        pipeline.run_urgent(Utc::now()).await
      } else {
        pipeline.run(Utc::now()).await
      };
      print_json(&report)
    }
    Command::HashToken => Ok(()),
  }
}

async fn serve(cfg: &ServerConfig, state: AppState<SqliteStore>) -> anyhow::Result<()> {
  if let Some(secs) = cfg.tick_interval_secs {
    let scheduler = Arc::clone(&state.scheduler);
    tokio::spawn(async move { scheduler.run_every(Duration::from_secs(secs.max(1))).await });
    tracing::info!(secs, "scheduler loop started");
  }
  if let (Some(pipeline), Some(icfg)) = (&state.insights, &cfg.insights) {
    spawn_insight_loops(Arc::clone(pipeline), icfg);
  }

  let app = tidewater_api::router(state);
  let address = format!("{}:{}", cfg.host, cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

fn spawn_insight_loops(pipeline: Arc<tidewater_engine::insights::InsightsPipeline<SqliteStore>>, icfg: &InsightsConfig) {
  if let Some(secs) = icfg.interval_secs {
    let pipeline = Arc::clone(&pipeline);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        pipeline.run(Utc::now()).await;
      }
    });
  }
  if let Some(secs) = icfg.urgent_interval_secs {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        pipeline.run_urgent(Utc::now()).await;
      }
    });
  }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Read the token from stdin.
fn read_token() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  eprint!("Token: ");
  io::stderr().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  Ok(line.trim_end_matches('\n').trim_end_matches('\r').to_string())
}
