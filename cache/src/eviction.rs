//! Reference-counted, priority-ordered post-eviction callbacks.
//!
//! Each key may own an `EvictionState` holding a reference count and a
//! queue of callbacks. The store runs the queue through a single hook that
//! sits in the entry's post-eviction list. A removal that happens while the
//! key is pinned by outstanding references is parked as a batch and run by
//! whichever `release` brings the count back to zero.

use crate::error::{catch_callback, BoxError, CallbackErrors};
use crate::listener::EvictionReason;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// A callback queued with a priority; smaller priorities run first.
pub type PriorityCallback<K, V> =
  Box<dyn FnOnce(&K, &Arc<V>, EvictionReason) -> Result<(), BoxError> + Send>;

struct Queued<K, V> {
  priority: i32,
  seq: u64,
  callback: PriorityCallback<K, V>,
}

// `BinaryHeap` is a max-heap, so the ordering is inverted to pop the
// smallest (priority, seq) pair first.
impl<K, V> Ord for Queued<K, V> {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    other
      .priority
      .cmp(&self.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl<K, V> PartialOrd for Queued<K, V> {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl<K, V> PartialEq for Queued<K, V> {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.seq == other.seq
  }
}

impl<K, V> Eq for Queued<K, V> {}

/// The callbacks captured for one removal event, in execution order.
struct Batch<K, V> {
  value: Arc<V>,
  reason: EvictionReason,
  callbacks: Vec<Queued<K, V>>,
}

struct StateQueue<K, V> {
  pending: BinaryHeap<Queued<K, V>>,
  next_seq: u64,
  deferred: VecDeque<Batch<K, V>>,
}

struct EvictionState<K, V> {
  ref_count: AtomicI64,
  callback_registered: AtomicBool,
  queue: Mutex<StateQueue<K, V>>,
}

impl<K, V> EvictionState<K, V> {
  fn new() -> Self {
    Self {
      ref_count: AtomicI64::new(0),
      callback_registered: AtomicBool::new(false),
      queue: Mutex::new(StateQueue {
        pending: BinaryHeap::new(),
        next_seq: 0,
        deferred: VecDeque::new(),
      }),
    }
  }

  /// Decrements the count unless it is already zero. Returns whether it moved.
  /// Callers hold the queue lock.
  fn decrement(&self) -> bool {
    self
      .ref_count
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
        (count > 0).then(|| count - 1)
      })
      .is_ok()
  }

  /// References other than the pin held by a currently registered hook.
  /// Parked batches wait for this to reach zero. Callers hold the queue lock.
  fn outside_refs(&self) -> i64 {
    let hook = i64::from(self.callback_registered.load(Ordering::Acquire));
    self.ref_count.load(Ordering::Acquire) - hook
  }

  fn is_idle(&self) -> bool {
    let queue = self.queue.lock();
    self.ref_count.load(Ordering::Acquire) <= 0
      && !self.callback_registered.load(Ordering::Acquire)
      && queue.pending.is_empty()
      && queue.deferred.is_empty()
  }
}

/// Per-key reference counts and priority callback queues.
///
/// State mutations happen while the map guard for the key is held so that a
/// concurrent discard can never orphan a freshly registered callback, and
/// the count and hook flag only change under the state's queue lock so that
/// the drain decision sees them consistently. Callbacks themselves always
/// run outside of any lock.
pub struct EvictionCoordinator<K, V, H = ahash::RandomState> {
  states: DashMap<K, Arc<EvictionState<K, V>>, H>,
}

impl<K, V, H> fmt::Debug for EvictionCoordinator<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher + Clone,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EvictionCoordinator")
      .field("tracked_keys", &self.states.len())
      .finish()
  }
}

impl<K, V, H> EvictionCoordinator<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  pub(crate) fn new(hasher: H) -> Self {
    Self {
      states: DashMap::with_hasher(hasher),
    }
  }

  /// Pins `key`, returning the new reference count.
  pub fn add_ref(&self, key: &K) -> i64 {
    let state = self
      .states
      .entry(key.clone())
      .or_insert_with(|| Arc::new(EvictionState::new()));
    let _queue = state.queue.lock();
    state.ref_count.fetch_add(1, Ordering::AcqRel) + 1
  }

  /// Drops one pin on `key`. If this brings the count to zero and a removal
  /// happened while the key was pinned, the parked callbacks run now on this
  /// thread and their failures are returned.
  ///
  /// Only pins taken with [`add_ref`](Self::add_ref) can be released here.
  /// The hook's own pin is released by the removal it waits for.
  pub fn release(&self, key: &K) -> Result<(), CallbackErrors> {
    let state = match self.states.get(key) {
      Some(state) => {
        let _queue = state.queue.lock();
        if state.outside_refs() <= 0 || !state.decrement() {
          tracing::trace!("release on a key with no outstanding references");
        }
        state.clone()
      }
      None => return Ok(()),
    };
    self.drain_if_released(key, &state)
  }

  /// The current reference count of `key`, zero when untracked.
  pub fn ref_count(&self, key: &K) -> i64 {
    self
      .states
      .get(key)
      .map_or(0, |state| state.ref_count.load(Ordering::Acquire))
  }

  /// Number of keys with live eviction state.
  pub fn tracked_keys(&self) -> usize {
    self.states.len()
  }

  /// Queues `callback` for `key`. Returns `true` when the caller must attach
  /// the eviction hook to the key's entry; the first registration after each
  /// removal takes the implicit self-reference that the hook later releases.
  pub(crate) fn register(
    &self,
    key: &K,
    callback: Option<PriorityCallback<K, V>>,
    priority: i32,
  ) -> bool {
    let state = self
      .states
      .entry(key.clone())
      .or_insert_with(|| Arc::new(EvictionState::new()));

    let mut queue = state.queue.lock();
    let attach = !state.callback_registered.swap(true, Ordering::AcqRel);
    if attach {
      state.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    if let Some(callback) = callback {
      let seq = queue.next_seq;
      queue.next_seq += 1;
      queue.pending.push(Queued {
        priority,
        seq,
        callback,
      });
    }
    attach
  }

  /// Runs the key's queued callbacks for one structural removal.
  ///
  /// Called exactly once per removal through the entry hook. The queued
  /// callbacks are captured into a batch for this removal, so registrations
  /// for a later entry under the same key are never swept into it.
  pub(crate) fn execute_callbacks(
    &self,
    key: &K,
    value: &Arc<V>,
    reason: EvictionReason,
  ) -> Result<(), CallbackErrors> {
    let state = match self.states.get(key) {
      Some(state) => {
        let mut queue = state.queue.lock();
        let mut callbacks = Vec::with_capacity(queue.pending.len());
        while let Some(item) = queue.pending.pop() {
          callbacks.push(item);
        }
        queue.deferred.push_back(Batch {
          value: value.clone(),
          reason,
          callbacks,
        });
        state.callback_registered.store(false, Ordering::Release);
        // Release the implicit self-reference taken at registration.
        state.decrement();
        drop(queue);
        state.clone()
      }
      None => return Ok(()),
    };
    self.drain_if_released(key, &state)
  }

  fn drain_if_released(
    &self,
    key: &K,
    state: &Arc<EvictionState<K, V>>,
  ) -> Result<(), CallbackErrors> {
    let mut errors = CallbackErrors::default();

    loop {
      // Popping under the queue lock hands each batch to exactly one thread.
      let batch = {
        let mut queue = state.queue.lock();
        if state.outside_refs() > 0 {
          None
        } else {
          queue.deferred.pop_front()
        }
      };
      let Some(batch) = batch else {
        break;
      };
      for item in batch.callbacks {
        let callback = item.callback;
        if let Err(error) = catch_callback(|| callback(key, &batch.value, batch.reason)) {
          errors.push(error);
        }
      }
    }

    self
      .states
      .remove_if(key, |_, current| Arc::ptr_eq(current, state) && current.is_idle());

    errors.into_result()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::Mutex as StdMutex;

  type Log = Arc<StdMutex<Vec<&'static str>>>;

  fn recorder(log: &Log, name: &'static str) -> PriorityCallback<i32, String> {
    let log = log.clone();
    Box::new(move |_, _, _| {
      log.lock().unwrap().push(name);
      Ok(())
    })
  }

  fn coordinator() -> EvictionCoordinator<i32, String> {
    EvictionCoordinator::new(ahash::RandomState::new())
  }

  #[test]
  fn callbacks_run_in_ascending_priority() {
    let coordinator = coordinator();
    let log: Log = Default::default();

    assert!(coordinator.register(&1, Some(recorder(&log, "p5")), 5));
    assert!(!coordinator.register(&1, Some(recorder(&log, "p1")), 1));
    assert!(!coordinator.register(&1, Some(recorder(&log, "p1-second")), 1));

    let value = Arc::new("v".to_string());
    coordinator
      .execute_callbacks(&1, &value, EvictionReason::Removed)
      .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["p1", "p1-second", "p5"]);
    assert_eq!(coordinator.tracked_keys(), 0);
  }

  #[test]
  fn pinned_removal_is_deferred_until_release() {
    let coordinator = coordinator();
    let log: Log = Default::default();

    coordinator.register(&1, Some(recorder(&log, "cb")), 0);
    assert_eq!(coordinator.add_ref(&1), 2);

    let value = Arc::new("v".to_string());
    coordinator
      .execute_callbacks(&1, &value, EvictionReason::Expired)
      .unwrap();
    assert!(log.lock().unwrap().is_empty(), "a pinned key must not drain");

    coordinator.release(&1).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["cb"]);

    // Further releases neither rerun callbacks nor go negative.
    coordinator.release(&1).unwrap();
    assert_eq!(coordinator.ref_count(&1), 0);
    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(coordinator.tracked_keys(), 0);
  }

  #[test]
  fn failures_are_collected_without_stopping() {
    let coordinator = coordinator();
    let log: Log = Default::default();

    coordinator.register(&1, Some(Box::new(|_, _, _| Err("first".into()))), 0);
    coordinator.register(&1, Some(Box::new(|_, _, _| panic!("second"))), 1);
    coordinator.register(&1, Some(recorder(&log, "third")), 2);

    let value = Arc::new("v".to_string());
    let errors = coordinator
      .execute_callbacks(&1, &value, EvictionReason::Removed)
      .unwrap_err();
    assert_eq!(errors.len(), 2);
    assert_eq!(*log.lock().unwrap(), vec!["third"]);
  }

  #[test]
  fn registration_after_removal_starts_a_new_batch() {
    let coordinator = coordinator();
    let log: Log = Default::default();

    coordinator.register(&1, Some(recorder(&log, "old")), 0);
    coordinator.add_ref(&1);
    let value = Arc::new("v".to_string());
    coordinator
      .execute_callbacks(&1, &value, EvictionReason::Replaced)
      .unwrap();

    // A new entry under the same key registers again and needs a new hook.
    assert!(coordinator.register(&1, Some(recorder(&log, "new")), 0));

    coordinator.release(&1).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["old"]);

    coordinator
      .execute_callbacks(&1, &value, EvictionReason::Removed)
      .unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["old", "new"]);
  }

  #[test]
  fn stray_release_keeps_the_hook_pin() {
    let coordinator = coordinator();
    let log: Log = Default::default();

    coordinator.register(&1, Some(recorder(&log, "cb")), 0);
    coordinator.release(&1).unwrap();
    assert_eq!(coordinator.ref_count(&1), 1, "the hook pin survives");

    assert_eq!(coordinator.add_ref(&1), 2);
    let value = Arc::new("v".to_string());
    coordinator
      .execute_callbacks(&1, &value, EvictionReason::Removed)
      .unwrap();
    assert!(log.lock().unwrap().is_empty(), "still pinned by add_ref");

    coordinator.release(&1).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["cb"]);
  }
}
