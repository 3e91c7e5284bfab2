use std::time::Duration;

use thiserror::Error;

/// The error type produced by user callbacks (post-eviction, load, create, save).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
  /// The cache was configured with a size limit of zero. Leave the limit
  /// unset for an unbounded cache.
  #[error("cache size limit cannot be zero")]
  ZeroCapacity,
  /// The cache was configured with zero shards, which is not allowed.
  #[error("shard count cannot be zero")]
  ZeroShards,
  /// The compaction percentage must lie within `[0.0, 1.0]`.
  #[error("compaction percentage {0} is outside of [0, 1]")]
  InvalidCompactionPercentage(f64),
}

/// Errors returned by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
  /// The key lock could not be acquired within the given timeout.
  #[error("timed out after {0:?} waiting for the key lock")]
  LockTimeout(Duration),

  /// The operation needs a live entry and none exists for the key.
  #[error("no entry exists for the key")]
  KeyNotFound,

  /// The cache has been disposed.
  #[error("the cache has been disposed")]
  AlreadyDisposed,

  /// The `load` callback failed and no `create` callback is registered.
  #[error("load callback failed: {0}")]
  LoadFailure(#[source] BoxError),

  /// Neither `load` nor `create` produced a value.
  #[error("entry could not be initialized: {0}")]
  InitializationFailure(#[source] BoxError),

  /// The `save` callback failed or reported failure. The key stays dirty.
  #[error("save callback failed: {0}")]
  SaveFailure(#[source] BoxError),

  /// One or more post-eviction callbacks failed. The removal itself happened.
  #[error(transparent)]
  Callbacks(#[from] CallbackErrors),

  /// Adding the dependency would make the dependency graph cyclic.
  #[error("dependency would create a cycle")]
  DependencyCycle,

  /// The value is already borrowed by an enclosing `read` or `update` on
  /// this thread.
  #[error("the value is already borrowed by an enclosing access")]
  ValueBorrowed,

  /// A single entry is larger than the whole cache.
  #[error("entry size {size} exceeds the cache size limit {limit}")]
  EntryTooLarge { size: u64, limit: u64 },
}

/// The aggregate of every post-eviction callback failure raised by one
/// eviction. All callbacks run even when earlier ones fail.
#[derive(Debug, Default, Error)]
#[error("{} post-eviction callback(s) failed", .errors.len())]
pub struct CallbackErrors {
  pub errors: Vec<BoxError>,
}

impl CallbackErrors {
  pub(crate) fn push(&mut self, error: BoxError) {
    self.errors.push(error);
  }

  pub(crate) fn extend(&mut self, other: CallbackErrors) {
    self.errors.extend(other.errors);
  }

  /// Adds `error`, flattening it first if it is itself an aggregate raised
  /// by a nested eviction (the coordinator hook or a dependency cascade).
  pub(crate) fn absorb(&mut self, error: BoxError) {
    match error.downcast::<CallbackErrors>() {
      Ok(nested) => self.extend(*nested),
      Err(error) => self.push(error),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.errors.is_empty()
  }

  pub fn len(&self) -> usize {
    self.errors.len()
  }

  /// Converts into a `Result`, `Ok` when nothing failed.
  pub(crate) fn into_result(self) -> Result<(), CallbackErrors> {
    if self.errors.is_empty() {
      Ok(())
    } else {
      Err(self)
    }
  }
}

/// Runs a user callback, turning a panic into an error so that the caller
/// can keep going with the remaining callbacks.
pub(crate) fn catch_callback<T, F>(f: F) -> Result<T, BoxError>
where
  F: FnOnce() -> Result<T, BoxError>,
{
  match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
    Ok(result) => result,
    Err(payload) => Err(panic_message(payload).into()),
  }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    format!("callback panicked: {msg}")
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    format!("callback panicked: {msg}")
  } else {
    "callback panicked".to_string()
  }
}
