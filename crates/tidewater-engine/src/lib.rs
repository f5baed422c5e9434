//! Cache and build orchestration for Tidewater sources.
//!
//! Each source gets a [`CacheStore`](cache::CacheStore) (lock-free reads,
//! atomic publication), a [`BuildLock`](lock::BuildLock) and a
//! [`BuildOrchestrator`](build::BuildOrchestrator) driving a
//! [`SourceAdapter`](adapter::SourceAdapter). The [`Scheduler`](scheduler::Scheduler)
//! coordinates rebuilds across sources and server instances, and the
//! [`InsightsPipeline`](insights::InsightsPipeline) regenerates derived text
//! only when its inputs change.

pub mod adapter;
pub mod adapters;
pub mod build;
pub mod cache;
pub mod error;
pub mod insights;
pub mod lock;
pub mod persist;
pub mod registry;
pub mod scheduler;
pub mod trigger;
pub mod upstream;

pub use error::{Error, Result};

#[cfg(test)]
mod testing;
