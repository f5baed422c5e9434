//! SQLite backend for Tidewater coordination state and insight entries.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. One file can be shared by several
//! server instances; soft locks are taken with a single conditional UPDATE.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{HEALTH_LOG_RETENTION, SqliteStore};
