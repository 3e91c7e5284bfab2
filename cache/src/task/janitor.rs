use crate::shared::StoreShared;

use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Signal {
  stopped: bool,
  nudged: bool,
}

/// Wake-up channel between the cache and its janitor thread.
#[derive(Debug, Default)]
struct JanitorSignal {
  state: Mutex<Signal>,
  wake: Condvar,
}

/// The background task that runs the time-gated compaction pass and reacts
/// to overflow nudges from committing threads.
#[derive(Debug)]
pub(crate) struct Janitor {
  handle: JoinHandle<()>,
  signal: Arc<JanitorSignal>,
}

impl Janitor {
  /// Spawns a new janitor thread that holds the cache only weakly, so that
  /// dropping the last handle ends the thread.
  pub(crate) fn spawn<K, V, H>(shared: Weak<StoreShared<K, V, H>>, tick_interval: Duration) -> Self
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    H: BuildHasher + Clone + Send + Sync + 'static,
  {
    let signal = Arc::new(JanitorSignal::default());
    let thread_signal = signal.clone();

    let handle = thread::spawn(move || loop {
      let nudged = {
        let mut state = thread_signal.state.lock();
        if !state.stopped && !state.nudged {
          thread_signal.wake.wait_for(&mut state, tick_interval);
        }
        if state.stopped {
          break;
        }
        std::mem::take(&mut state.nudged)
      };

      let Some(shared) = shared.upgrade() else {
        break;
      };
      if shared.is_disposed() {
        break;
      }
      if nudged {
        shared.compact();
      } else {
        shared.scan_for_expired_if_due();
      }
    });

    Self { handle, signal }
  }

  /// Asks for an immediate compaction pass.
  pub(crate) fn nudge(&self) {
    let mut state = self.signal.state.lock();
    state.nudged = true;
    self.signal.wake.notify_one();
  }

  /// Signals the janitor thread to stop.
  pub(crate) fn stop(&self) {
    let mut state = self.signal.state.lock();
    state.stopped = true;
    self.signal.wake.notify_one();
  }

  /// Stops the thread and waits for it, unless called from the janitor
  /// thread itself.
  pub(crate) fn stop_and_join(self) {
    self.stop();
    if self.handle.thread().id() == thread::current().id() {
      return;
    }
    if self.handle.join().is_err() {
      tracing::warn!("cache janitor thread panicked");
    }
  }
}
