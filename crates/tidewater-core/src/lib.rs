//! Core types and trait definitions for the Tidewater spatial cache.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! All other crates depend on it; it depends on nothing proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod blob;
pub mod coordination;
pub mod error;
pub mod grid;
pub mod insight;
pub mod record;
pub mod schedule;
pub mod source;
pub mod status;

pub use error::{Error, Result};
