//! Per-source in-memory cache with atomic publication.
//!
//! Readers load the current blob with a single atomic pointer read and never
//! block. The only writer is the source's own build, which replaces the blob
//! wholesale.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use tidewater_core::{
  blob::{CacheBlob, GridCell},
  grid::GridIndex,
  source::SourceId,
  status::CacheStatus,
};
use tokio::{sync::OnceCell, task::JoinHandle};
use tracing::{info, warn};

use crate::persist::DiskPersistence;

pub struct CacheStore {
  source:       SourceId,
  index:        GridIndex,
  current:      ArcSwapOption<CacheBlob>,
  disk:         Option<DiskPersistence>,
  /// Most recent background save; each save waits for its predecessor.
  pending_save: Mutex<Option<JoinHandle<()>>>,
  warmed:       OnceCell<()>,
}

impl CacheStore {
  pub fn new(source: SourceId, index: GridIndex, disk: Option<DiskPersistence>) -> Self {
    Self {
      source,
      index,
      current: ArcSwapOption::empty(),
      disk,
      pending_save: Mutex::new(None),
      warmed: OnceCell::new(),
    }
  }

  pub fn source(&self) -> &SourceId { &self.source }

  pub fn index(&self) -> &GridIndex { &self.index }

  /// Records in the 3×3 neighbourhood of the point, or `None`.
  pub fn get(&self, lat: f64, lng: f64) -> Option<GridCell> {
    self.current.load_full()?.lookup(&self.index, lat, lng)
  }

  /// The currently published blob. Callers keep a consistent view even if
  /// a new build is published while they hold it.
  pub fn snapshot(&self) -> Option<Arc<CacheBlob>> { self.current.load_full() }

  pub fn status(&self) -> CacheStatus { CacheStatus::of(self.snapshot().as_deref()) }

  /// Swap in `blob` and schedule a best-effort disk save.
  pub fn publish(&self, blob: CacheBlob) -> Arc<CacheBlob> {
    let blob = Arc::new(blob);
    self.current.store(Some(Arc::clone(&blob)));
    info!(
      source = %self.source,
      records = blob.total_records(),
      cells = blob.cell_count(),
      "published cache"
    );

    if let Some(disk) = self.disk.clone() {
      let mut pending = self.pending_save.lock().unwrap_or_else(PoisonError::into_inner);
      let previous = pending.take();
      let source = self.source.clone();
      let to_save = Arc::clone(&blob);
      *pending = Some(tokio::spawn(async move {
        if let Some(previous) = previous {
          let _ = previous.await;
        }
        if let Err(e) = disk.save(&source, &to_save).await {
          warn!(source = %source, error = %e, "disk save failed; continuing without it");
        }
      }));
    }

    blob
  }

  /// Wait for the most recent background save to finish.
  pub async fn flush(&self) {
    let pending = self
      .pending_save
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(handle) = pending {
      let _ = handle.await;
    }
  }

  /// Load the disk artifact the first time this is called, unless a build
  /// has already published. Later calls are no-ops.
  pub async fn ensure_warmed(&self) {
    self
      .warmed
      .get_or_init(|| async {
        if self.current.load().is_some() {
          return;
        }
        let Some(disk) = &self.disk else { return };
        if let Some(blob) = disk.load(&self.source).await {
          // A build may have published while we were reading.
          let blob = Arc::new(blob);
          self.current.rcu(|current| current.clone().or_else(|| Some(Arc::clone(&blob))));
        }
      })
      .await;
  }
}
