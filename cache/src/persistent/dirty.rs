use std::collections::HashSet;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct DirtyState<K, H> {
  keys: HashSet<K, H>,
  /// A wake-up was requested since the saver last looked. Survives a
  /// signal raised while the saver is busy saving.
  signalled: bool,
  stopped: bool,
}

/// Why [`DirtySet::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
  Signalled,
  Timeout,
  Stopped,
}

/// The set of keys whose values changed since they were last saved, with
/// the condition variable the saver sleeps on.
///
/// The set has its own lock, independent of the per-key locks, and it is
/// never held while a save callback runs.
pub(crate) struct DirtySet<K, H> {
  state: Mutex<DirtyState<K, H>>,
  wake: Condvar,
}

impl<K, H> fmt::Debug for DirtySet<K, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("DirtySet")
      .field("len", &state.keys.len())
      .field("signalled", &state.signalled)
      .field("stopped", &state.stopped)
      .finish()
  }
}

impl<K, H> DirtySet<K, H> {
  /// Ends every current and future [`wait`](Self::wait).
  pub(crate) fn stop(&self) {
    let mut state = self.state.lock();
    state.stopped = true;
    self.wake.notify_all();
  }
}

impl<K, H> DirtySet<K, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  pub(crate) fn new(hasher: H) -> Self {
    Self {
      state: Mutex::new(DirtyState {
        keys: HashSet::with_hasher(hasher),
        signalled: false,
        stopped: false,
      }),
      wake: Condvar::new(),
    }
  }

  /// Marks `key` dirty and wakes the saver. An urgent mark wakes every
  /// waiter. Returns whether the key was newly added.
  pub(crate) fn mark(&self, key: &K, urgent: bool) -> bool {
    let mut state = self.state.lock();
    let added = state.keys.insert(key.clone());
    state.signalled = true;
    if urgent {
      self.wake.notify_all();
    } else {
      self.wake.notify_one();
    }
    added
  }

  pub(crate) fn contains(&self, key: &K) -> bool {
    self.state.lock().keys.contains(key)
  }

  pub(crate) fn remove(&self, key: &K) -> bool {
    self.state.lock().keys.remove(key)
  }

  /// Removes `key` if the set's lock can be had within `timeout`. A key
  /// left behind only costs one redundant save.
  pub(crate) fn try_remove(&self, key: &K, timeout: Duration) -> bool {
    match self.state.try_lock_for(timeout) {
      Some(mut state) => state.keys.remove(key),
      None => false,
    }
  }

  /// Swaps the whole set out for processing.
  pub(crate) fn take_all(&self) -> Vec<K> {
    let mut state = self.state.lock();
    state.keys.drain().collect()
  }

  /// Puts keys that could not be saved back without waking anyone.
  pub(crate) fn restore(&self, keys: Vec<K>) {
    if keys.is_empty() {
      return;
    }
    self.state.lock().keys.extend(keys);
  }

  pub(crate) fn len(&self) -> usize {
    self.state.lock().keys.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Sleeps until a key is marked, `timeout` passes, or the set is stopped.
  pub(crate) fn wait(&self, timeout: Duration) -> Wake {
    let mut state = self.state.lock();
    if !state.signalled && !state.stopped {
      self.wake.wait_for(&mut state, timeout);
    }
    if state.stopped {
      Wake::Stopped
    } else if std::mem::take(&mut state.signalled) {
      Wake::Signalled
    } else {
      Wake::Timeout
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  fn dirty() -> DirtySet<&'static str, ahash::RandomState> {
    DirtySet::new(ahash::RandomState::new())
  }

  #[test]
  fn marking_is_idempotent() {
    let set = dirty();
    assert!(set.mark(&"a", false));
    assert!(!set.mark(&"a", true));
    assert_eq!(set.len(), 1);
    assert!(set.contains(&"a"));
  }

  #[test]
  fn take_all_swaps_the_set_out() {
    let set = dirty();
    set.mark(&"a", false);
    set.mark(&"b", false);

    let mut taken = set.take_all();
    taken.sort();
    assert_eq!(taken, vec!["a", "b"]);
    assert!(set.is_empty());

    set.restore(vec!["b"]);
    assert!(set.contains(&"b"));
    assert!(set.try_remove(&"b", Duration::from_millis(10)));
    assert!(set.is_empty());
  }

  #[test]
  fn signal_raised_before_waiting_is_not_lost() {
    let set = dirty();
    set.mark(&"a", false);
    assert_eq!(set.wait(Duration::from_secs(5)), Wake::Signalled);
    assert_eq!(set.wait(Duration::from_millis(10)), Wake::Timeout);
  }

  #[test]
  fn stop_wakes_a_sleeping_waiter() {
    let set = Arc::new(dirty());
    let waiter = {
      let set = set.clone();
      thread::spawn(move || set.wait(Duration::from_secs(30)))
    };
    thread::sleep(Duration::from_millis(20));
    set.stop();
    assert_eq!(waiter.join().unwrap(), Wake::Stopped);
  }
}
