//! In-process build lock with a stale timeout.
//!
//! A set flag older than the timeout is treated as abandoned (a build that
//! panicked or hung) and cleared by whoever looks next.

use std::{
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::{Duration, Instant},
};

use tracing::warn;

/// Default age after which a held lock is considered stale.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(12 * 60);

#[derive(Debug, Default)]
struct LockState {
  started:    Option<Instant>,
  generation: u64,
}

#[derive(Debug)]
pub struct BuildLock {
  name:    String,
  timeout: Duration,
  state:   Mutex<LockState>,
}

impl BuildLock {
  pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
    Self { name: name.into(), timeout, state: Mutex::new(LockState::default()) }
  }

  pub fn name(&self) -> &str { &self.name }

  fn state(&self) -> MutexGuard<'_, LockState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Clear the flag if it has outlived the timeout. Returns whether the
  /// lock is still held afterwards.
  fn held(&self, state: &mut LockState) -> bool {
    match state.started {
      None => false,
      Some(at) if at.elapsed() < self.timeout => true,
      Some(at) => {
        warn!(
          lock = %self.name,
          held_secs = at.elapsed().as_secs(),
          "clearing stale build lock"
        );
        state.started = None;
        false
      }
    }
  }

  /// `true` if a build holds the lock and it has not gone stale.
  pub fn is_in_progress(&self) -> bool {
    let mut state = self.state();
    self.held(&mut state)
  }

  /// Raw set/clear. Prefer [`try_acquire`](Self::try_acquire), which
  /// clears automatically.
  pub fn set_in_progress(&self, on: bool) {
    let mut state = self.state();
    if on {
      state.generation += 1;
      state.started = Some(Instant::now());
    } else {
      state.started = None;
    }
  }

  /// Atomically take the lock if it is free or stale.
  pub fn try_acquire(self: &Arc<Self>) -> Option<BuildGuard> {
    let mut state = self.state();
    if self.held(&mut state) {
      return None;
    }
    state.generation += 1;
    state.started = Some(Instant::now());
    Some(BuildGuard { lock: Arc::clone(self), generation: state.generation })
  }
}

/// Releases the lock on drop, unless a newer holder took it over after
/// this one went stale.
#[derive(Debug)]
pub struct BuildGuard {
  lock:       Arc<BuildLock>,
  generation: u64,
}

impl Drop for BuildGuard {
  fn drop(&mut self) {
    let mut state = self.lock.state();
    if state.generation == self.generation {
      state.started = None;
    }
  }
}
