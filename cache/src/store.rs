use crate::entry::CacheEntry;

use core::fmt;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// A helper function to hash a key using a `BuildHasher`.
#[inline]
pub(crate) fn hash_key<K: Hash, H: BuildHasher>(hasher: &H, key: &K) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

type EntryMap<K, V, H> = HashMap<K, Arc<CacheEntry<K, V>>, H>;

/// The key → entry map, partitioned into independently locked shards.
///
/// The shard locks only protect the map structure and are held for the
/// duration of a single lookup, insert or remove. Ordering between
/// operations on the same key comes from the key lock, never from these.
pub(crate) struct ShardedStore<K, V, H> {
  shards: Box<[CachePadded<RwLock<EntryMap<K, V, H>>>]>,
  pub(crate) hasher: H,
}

impl<K, V, H> fmt::Debug for ShardedStore<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShardedStore")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<K, V, H> ShardedStore<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  /// Creates a new `ShardedStore` with the specified number of shards and hasher.
  pub(crate) fn new(num_shards: usize, hasher: H) -> Self {
    let mut shards = Vec::with_capacity(num_shards);
    for _ in 0..num_shards {
      shards.push(CachePadded::new(RwLock::new(HashMap::with_hasher(
        hasher.clone(),
      ))));
    }

    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  fn shard(&self, key: &K) -> &RwLock<EntryMap<K, V, H>> {
    // This is safe because we validate that num_shards > 0 in the builder.
    let index = hash_key(&self.hasher, key) as usize % self.shards.len();
    &self.shards[index]
  }

  pub(crate) fn get(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
    self.shard(key).read().get(key).cloned()
  }

  pub(crate) fn contains(&self, key: &K) -> bool {
    self.shard(key).read().contains_key(key)
  }

  /// Publishes `entry`, returning the entry it replaced.
  pub(crate) fn insert(
    &self,
    key: K,
    entry: Arc<CacheEntry<K, V>>,
  ) -> Option<Arc<CacheEntry<K, V>>> {
    self.shard(&key).write().insert(key, entry)
  }

  pub(crate) fn remove(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
    self.shard(key).write().remove(key)
  }

  /// Removes `key` only if it still maps to `expected`.
  pub(crate) fn remove_if_same(
    &self,
    key: &K,
    expected: &Arc<CacheEntry<K, V>>,
  ) -> Option<Arc<CacheEntry<K, V>>> {
    let mut guard = self.shard(key).write();
    match guard.get(key) {
      Some(current) if Arc::ptr_eq(current, expected) => guard.remove(key),
      _ => None,
    }
  }

  /// Takes a point-in-time copy of every (key, entry) pair, one shard at a time.
  pub(crate) fn snapshot(&self) -> Vec<(K, Arc<CacheEntry<K, V>>)> {
    let mut out = Vec::with_capacity(self.len());
    for shard in self.shards.iter() {
      let guard = shard.read();
      out.extend(guard.iter().map(|(k, e)| (k.clone(), e.clone())));
    }
    out
  }

  pub(crate) fn keys(&self) -> Vec<K> {
    let mut out = Vec::new();
    for shard in self.shards.iter() {
      out.extend(shard.read().keys().cloned());
    }
    out
  }

  pub(crate) fn len(&self) -> usize {
    self.shards.iter().map(|shard| shard.read().len()).sum()
  }
}
