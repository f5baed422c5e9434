//! Best-effort disk copy of published blobs, used to survive cold starts.
//!
//! The upstream feeds stay authoritative: nothing here is allowed to fail a
//! build or a read. Two instances sharing a directory simply overwrite each
//! other; the last rename wins.

use std::path::{Path, PathBuf};

use tidewater_core::{blob::CacheBlob, source::SourceId};
use tracing::{debug, info, warn};

use crate::Result;

#[derive(Debug, Clone)]
pub struct DiskPersistence {
  dir: PathBuf,
}

impl DiskPersistence {
  pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

  pub fn dir(&self) -> &Path { &self.dir }

  /// `<dir>/<source>.json`
  pub fn path_for(&self, source: &SourceId) -> PathBuf {
    self.dir.join(format!("{source}.json"))
  }

  /// Write `blob` as compact JSON via a temporary file and a rename, so a
  /// crash mid-write never leaves a truncated artifact behind.
  pub async fn save(&self, source: &SourceId, blob: &CacheBlob) -> Result<()> {
    let body = serde_json::to_vec(blob)?;
    tokio::fs::create_dir_all(&self.dir).await?;

    let path = self.path_for(source);
    let tmp = self.dir.join(format!(".{source}.json.tmp"));
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, &path).await?;

    debug!(source = %source, bytes = body.len(), path = %path.display(), "saved cache to disk");
    Ok(())
  }

  /// Read the artifact for `source`. Missing or unreadable files yield
  /// `None`; the latter is logged.
  pub async fn load(&self, source: &SourceId) -> Option<CacheBlob> {
    let path = self.path_for(source);
    let body = match tokio::fs::read(&path).await {
      Ok(b) => b,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(source = %source, path = %path.display(), "no cache on disk");
        return None;
      }
      Err(e) => {
        warn!(source = %source, path = %path.display(), error = %e, "failed to read disk cache");
        return None;
      }
    };

    match serde_json::from_slice::<CacheBlob>(&body) {
      Ok(blob) => {
        info!(
          source = %source,
          records = blob.total_records(),
          built_at = %blob.meta.built_at,
          "loaded cache from disk"
        );
        Some(blob)
      }
      Err(e) => {
        warn!(source = %source, path = %path.display(), error = %e, "discarding corrupt disk cache");
        None
      }
    }
  }
}
