//! Named, per-key mutual exclusion.
//!
//! Every mutation of an entry happens while its key is locked through a
//! [`KeyLock`] provider. The default provider, [`NamedLockRegistry`], hands
//! out one recursive mutex per key and forgets it again once nobody holds
//! or waits for it.

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::store::hash_key;

/// A reentrant named-mutex abstraction keyed by opaque keys.
///
/// Implementations must allow the thread that holds a key to acquire it
/// again (each acquisition is paired with one `release`), and must keep the
/// locks of unrelated keys independent of one another.
pub trait KeyLock<K>: Send + Sync {
  /// Attempts to lock `key`, blocking for at most `timeout`.
  /// Returns `false` if the lock could not be acquired in time.
  fn try_acquire(&self, key: &K, timeout: Duration) -> bool;

  /// Releases one acquisition of `key` held by the calling thread.
  fn release(&self, key: &K);

  /// Returns `true` if the calling thread currently holds `key`.
  fn is_held(&self, key: &K) -> bool;
}

/// An RAII guard that releases a key lock when dropped.
///
/// The guard is tied to the acquiring thread and is therefore `!Send`.
pub struct KeyLockGuard<'a, K> {
  provider: &'a dyn KeyLock<K>,
  key: K,
  _not_send: PhantomData<*const ()>,
}

impl<'a, K> KeyLockGuard<'a, K> {
  /// Acquires `key` on `provider`, returning `None` on timeout.
  pub fn acquire(provider: &'a dyn KeyLock<K>, key: K, timeout: Duration) -> Option<Self> {
    if provider.try_acquire(&key, timeout) {
      Some(Self {
        provider,
        key,
        _not_send: PhantomData,
      })
    } else {
      None
    }
  }

  pub fn key(&self) -> &K {
    &self.key
  }
}

impl<K> Drop for KeyLockGuard<'_, K> {
  fn drop(&mut self) {
    self.provider.release(&self.key);
  }
}

impl<K: fmt::Debug> fmt::Debug for KeyLockGuard<'_, K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyLockGuard").field("key", &self.key).finish()
  }
}

/// Ownership state of a single recursive lock.
#[derive(Debug, Default)]
struct SlotState {
  owner: Option<ThreadId>,
  depth: usize,
}

#[derive(Debug, Default)]
struct LockSlot {
  state: Mutex<SlotState>,
  available: Condvar,
}

/// A registry entry: the lock plus the number of threads holding or
/// waiting on it. The registry drops the entry when `users` reaches zero.
struct SlotEntry {
  slot: Arc<LockSlot>,
  users: usize,
}

type SlotMap<K, H> = HashMap<K, SlotEntry, H>;

/// The default [`KeyLock`] provider: a sharded registry of recursive mutexes.
///
/// Slots are created on first use and reclaimed as soon as no thread holds
/// or waits for them, so the registry only grows with the number of keys
/// that are locked at the same time.
pub struct NamedLockRegistry<K, H = ahash::RandomState> {
  shards: Box<[CachePadded<Mutex<SlotMap<K, H>>>]>,
  hasher: H,
}

impl<K, H> fmt::Debug for NamedLockRegistry<K, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NamedLockRegistry")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<K> NamedLockRegistry<K, ahash::RandomState>
where
  K: Eq + Hash + Clone,
{
  pub fn new() -> Self {
    Self::with_hasher(num_cpus::get().max(1) * 4, ahash::RandomState::new())
  }
}

impl<K> Default for NamedLockRegistry<K, ahash::RandomState>
where
  K: Eq + Hash + Clone,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, H> NamedLockRegistry<K, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  /// Creates a registry with `num_shards` independently locked tables.
  pub fn with_hasher(num_shards: usize, hasher: H) -> Self {
    let shards = (0..num_shards.max(1))
      .map(|_| CachePadded::new(Mutex::new(HashMap::with_hasher(hasher.clone()))))
      .collect::<Vec<_>>();
    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  fn shard(&self, key: &K) -> &Mutex<SlotMap<K, H>> {
    let index = hash_key(&self.hasher, key) as usize % self.shards.len();
    &self.shards[index]
  }

  /// Registers the caller as a user of `key`'s slot and returns the slot.
  fn pin(&self, key: &K) -> Arc<LockSlot> {
    let mut slots = self.shard(key).lock();
    let entry = slots.entry(key.clone()).or_insert_with(|| SlotEntry {
      slot: Arc::new(LockSlot::default()),
      users: 0,
    });
    entry.users += 1;
    entry.slot.clone()
  }

  /// Drops one user of `key`'s slot, reclaiming the slot at zero.
  fn unpin(&self, key: &K) {
    let mut slots = self.shard(key).lock();
    if let Some(entry) = slots.get_mut(key) {
      entry.users = entry.users.saturating_sub(1);
      if entry.users == 0 {
        slots.remove(key);
      }
    }
  }

  /// Returns the number of keys that currently have a live lock slot.
  pub fn active_keys(&self) -> usize {
    self.shards.iter().map(|shard| shard.lock().len()).sum()
  }
}

impl<K, H> KeyLock<K> for NamedLockRegistry<K, H>
where
  K: Eq + Hash + Clone + Send + Sync,
  H: BuildHasher + Clone + Send + Sync,
{
  fn try_acquire(&self, key: &K, timeout: Duration) -> bool {
    let me = thread::current().id();
    // `None` means the timeout is too large to represent; wait forever.
    let deadline = Instant::now().checked_add(timeout);
    let slot = self.pin(key);

    let acquired = {
      let mut state = slot.state.lock();
      loop {
        match state.owner {
          None => {
            state.owner = Some(me);
            state.depth = 1;
            break true;
          }
          Some(owner) if owner == me => {
            state.depth += 1;
            break true;
          }
          Some(_) => match deadline {
            Some(deadline) => {
              if Instant::now() >= deadline {
                break false;
              }
              slot.available.wait_until(&mut state, deadline);
            }
            None => slot.available.wait(&mut state),
          },
        }
      }
    };

    if !acquired {
      self.unpin(key);
    }
    acquired
  }

  fn release(&self, key: &K) {
    let me = thread::current().id();
    let slot = match self.shard(key).lock().get(key) {
      Some(entry) => entry.slot.clone(),
      None => {
        tracing::warn!("release called for a key that is not locked");
        return;
      }
    };

    {
      let mut state = slot.state.lock();
      if state.owner != Some(me) {
        tracing::warn!("release called by a thread that does not hold the key");
        return;
      }
      state.depth -= 1;
      if state.depth == 0 {
        state.owner = None;
        slot.available.notify_one();
      }
    }

    self.unpin(key);
  }

  fn is_held(&self, key: &K) -> bool {
    let me = thread::current().id();
    let slot = match self.shard(key).lock().get(key) {
      Some(entry) => entry.slot.clone(),
      None => return false,
    };
    let owner = slot.state.lock().owner;
    owner == Some(me)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Barrier;

  #[test]
  fn lock_is_reentrant_for_the_owner() {
    let registry = NamedLockRegistry::<&str>::new();
    assert!(registry.try_acquire(&"a", Duration::ZERO));
    assert!(registry.try_acquire(&"a", Duration::ZERO));
    assert!(registry.is_held(&"a"));

    registry.release(&"a");
    assert!(registry.is_held(&"a"), "one acquisition is still outstanding");
    registry.release(&"a");
    assert!(!registry.is_held(&"a"));
  }

  #[test]
  fn slots_are_reclaimed_when_unused() {
    let registry = NamedLockRegistry::<i32>::new();
    for key in 0..100 {
      assert!(registry.try_acquire(&key, Duration::ZERO));
    }
    assert_eq!(registry.active_keys(), 100);
    for key in 0..100 {
      registry.release(&key);
    }
    assert_eq!(registry.active_keys(), 0);
  }

  #[test]
  fn contended_acquire_times_out() {
    let registry = Arc::new(NamedLockRegistry::<i32>::new());
    assert!(registry.try_acquire(&1, Duration::ZERO));

    let other = registry.clone();
    let handle = thread::spawn(move || {
      let started = Instant::now();
      let acquired = other.try_acquire(&1, Duration::from_millis(50));
      (acquired, started.elapsed())
    });
    let (acquired, waited) = handle.join().unwrap();
    assert!(!acquired);
    assert!(waited >= Duration::from_millis(50));

    // A different key is never blocked by key 1.
    let other = registry.clone();
    assert!(thread::spawn(move || {
      let ok = other.try_acquire(&2, Duration::ZERO);
      other.release(&2);
      ok
    })
    .join()
    .unwrap());

    registry.release(&1);
    assert_eq!(registry.active_keys(), 0);
  }

  #[test]
  fn waiter_acquires_after_release() {
    let registry = Arc::new(NamedLockRegistry::<i32>::new());
    let barrier = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));

    assert!(registry.try_acquire(&7, Duration::ZERO));

    let (r, b, flag) = (registry.clone(), barrier.clone(), released.clone());
    let waiter = thread::spawn(move || {
      b.wait();
      let acquired = r.try_acquire(&7, Duration::from_secs(5));
      // The owner must have let go before we got in.
      assert!(flag.load(Ordering::SeqCst));
      r.release(&7);
      acquired
    });

    barrier.wait();
    thread::sleep(Duration::from_millis(20));
    released.store(true, Ordering::SeqCst);
    registry.release(&7);

    assert!(waiter.join().unwrap());
    assert_eq!(registry.active_keys(), 0);
  }
}
