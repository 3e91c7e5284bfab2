use crate::persistent::dirty::{DirtySet, Wake};

use std::hash::{BuildHasher, Hash};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The background write-behind thread.
///
/// It sleeps on the dirty set until a key is marked or the save interval
/// passes, then runs one save cycle. A cycle that panics is logged and the
/// loop carries on; the thread only ends when the dirty set is stopped or the
/// cycle reports that the cache is gone.
#[derive(Debug)]
pub(crate) struct Saver {
  handle: JoinHandle<()>,
}

impl Saver {
  pub(crate) fn spawn<K, H, F>(dirty: Arc<DirtySet<K, H>>, interval: Duration, cycle: F) -> Self
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    H: BuildHasher + Clone + Send + Sync + 'static,
    F: Fn() -> bool + Send + 'static,
  {
    let handle = thread::spawn(move || loop {
      if dirty.wait(interval) == Wake::Stopped {
        break;
      }
      match catch_unwind(AssertUnwindSafe(&cycle)) {
        Ok(true) => {}
        Ok(false) => break,
        Err(_) => tracing::warn!("save cycle panicked; the saver keeps running"),
      }
    });
    Self { handle }
  }

  /// Waits for the thread to finish. The dirty set must already be stopped.
  pub(crate) fn join(self) {
    if self.handle.thread().id() == thread::current().id() {
      return;
    }
    if self.handle.join().is_err() {
      tracing::warn!("saver thread panicked");
    }
  }
}
