//! The set of configured sources, built once at startup and shared by the
//! read path, the scheduler and the insights pipeline.

use std::{collections::BTreeMap, sync::Arc};

use futures::future::join_all;
use serde::Serialize;
use tidewater_core::{
  blob::GridCell,
  schedule::SchedulePolicy,
  source::SourceId,
  status::CacheStatus,
};

use crate::{Error, Result, build::BuildOrchestrator, cache::CacheStore, trigger::BuildTrigger};

/// One registered source.
pub struct SourceEntry {
  cache:        Arc<CacheStore>,
  trigger:      Arc<dyn BuildTrigger>,
  /// Present when this process builds the source itself.
  orchestrator: Option<Arc<BuildOrchestrator>>,
  policy:       SchedulePolicy,
  enabled:      bool,
}

impl SourceEntry {
  /// A source built in this process.
  pub fn local(orchestrator: Arc<BuildOrchestrator>, policy: SchedulePolicy, enabled: bool) -> Self {
    Self {
      cache: orchestrator.cache().clone(),
      trigger: orchestrator.clone(),
      orchestrator: Some(orchestrator),
      policy,
      enabled,
    }
  }

  /// A source whose builds run elsewhere. The cache is still read locally
  /// (typically warmed from a shared cache directory).
  pub fn remote(
    cache: Arc<CacheStore>,
    trigger: Arc<dyn BuildTrigger>,
    policy: SchedulePolicy,
    enabled: bool,
  ) -> Self {
    Self { cache, trigger, orchestrator: None, policy, enabled }
  }

  pub fn id(&self) -> &SourceId { self.cache.source() }

  pub fn cache(&self) -> &Arc<CacheStore> { &self.cache }

  pub fn trigger(&self) -> &Arc<dyn BuildTrigger> { &self.trigger }

  pub fn orchestrator(&self) -> Option<&Arc<BuildOrchestrator>> { self.orchestrator.as_ref() }

  pub fn policy(&self) -> SchedulePolicy { self.policy }

  pub fn enabled(&self) -> bool { self.enabled }
}

/// Nearby records from one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHit {
  pub source:  SourceId,
  pub records: GridCell,
}

#[derive(Default)]
pub struct SourceRegistry {
  sources: BTreeMap<SourceId, SourceEntry>,
}

impl SourceRegistry {
  pub fn new(entries: impl IntoIterator<Item = SourceEntry>) -> Result<Self> {
    let mut sources = BTreeMap::new();
    for entry in entries {
      let id = entry.id().clone();
      if sources.insert(id.clone(), entry).is_some() {
        return Err(Error::Config(format!("source {id} registered twice")));
      }
    }
    Ok(Self { sources })
  }

  pub fn get(&self, source: &SourceId) -> Option<&SourceEntry> { self.sources.get(source) }

  pub fn require(&self, source: &SourceId) -> Result<&SourceEntry> {
    self.get(source).ok_or_else(|| Error::UnknownSource(source.clone()))
  }

  /// Sources in id order.
  pub fn sources(&self) -> impl Iterator<Item = &SourceEntry> { self.sources.values() }

  pub fn ids(&self) -> impl Iterator<Item = &SourceId> { self.sources.keys() }

  pub fn len(&self) -> usize { self.sources.len() }

  pub fn is_empty(&self) -> bool { self.sources.is_empty() }

  /// Nearby records from every loaded source, or from `only` if given.
  /// Sources with nothing nearby are left out.
  pub fn lookup(&self, lat: f64, lng: f64, only: Option<&SourceId>) -> Result<Vec<SourceHit>> {
    if let Some(id) = only {
      let entry = self.require(id)?;
      return Ok(entry.cache.get(lat, lng).map(|records| SourceHit { source: id.clone(), records }).into_iter().collect());
    }
    Ok(
      self
        .sources
        .iter()
        .filter_map(|(id, entry)| entry.cache.get(lat, lng).map(|records| SourceHit { source: id.clone(), records }))
        .collect(),
    )
  }

  pub fn status(&self) -> BTreeMap<SourceId, CacheStatus> {
    self.sources.iter().map(|(id, entry)| (id.clone(), entry.cache.status())).collect()
  }

  /// Load every source's disk artifact, once per process.
  pub async fn ensure_warmed_all(&self) {
    join_all(self.sources.values().map(|entry| entry.cache.ensure_warmed())).await;
  }

  /// Wait for pending background disk saves.
  pub async fn flush_all(&self) {
    join_all(self.sources.values().map(|entry| entry.cache.flush())).await;
  }
}
