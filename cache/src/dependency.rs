use crate::error::CacheError;

use std::collections::HashSet;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

/// Maps each dependency target to the keys that must go when it goes.
///
/// The graph only records edges. The cascade itself is a post-eviction
/// callback that the store attaches to the target's entry. Edges belong to
/// the dependent: they are dropped when the dependent leaves the cache and
/// rebuilt from scratch when it is committed again.
pub struct DependencyGraph<K, H = ahash::RandomState> {
  dependents: DashMap<K, DashSet<K, H>, H>,
  /// Reverse index: dependent -> the targets it depends on.
  targets: DashMap<K, DashSet<K, H>, H>,
  hasher: H,
  /// Serializes edge insertion so the cycle check sees a stable graph.
  edges: Mutex<()>,
}

impl<K, H> fmt::Debug for DependencyGraph<K, H>
where
  K: Eq + Hash,
  H: BuildHasher + Clone,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DependencyGraph")
      .field("targets", &self.dependents.len())
      .finish()
  }
}

impl<K, H> DependencyGraph<K, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  pub(crate) fn new(hasher: H) -> Self {
    Self {
      dependents: DashMap::with_hasher(hasher.clone()),
      targets: DashMap::with_hasher(hasher.clone()),
      hasher,
      edges: Mutex::new(()),
    }
  }

  /// Records that `key` depends on `target`.
  ///
  /// Rejects the edge with `DependencyCycle` when `target` is `key` itself or
  /// is already reachable from `key`, since evicting either would then
  /// cascade back around to the other.
  pub(crate) fn add(&self, key: &K, target: &K) -> Result<(), CacheError> {
    if key == target {
      return Err(CacheError::DependencyCycle);
    }

    let _edges = self.edges.lock();
    if self.reaches(key, target) {
      return Err(CacheError::DependencyCycle);
    }
    self.link(key, target);
    Ok(())
  }

  /// Replaces every outgoing edge of `key` with edges to `targets`.
  ///
  /// All new edges are checked before any is written, so on
  /// `DependencyCycle` the previous edges of `key` are left as they were.
  pub(crate) fn replace(&self, key: &K, targets: &[K]) -> Result<(), CacheError> {
    let _edges = self.edges.lock();
    // Edges into `key` never lie on a path out of `key` in an acyclic graph,
    // so the old edges cannot change the outcome of these checks.
    for target in targets {
      if target == key || self.reaches(key, target) {
        return Err(CacheError::DependencyCycle);
      }
    }
    self.unlink_all(key);
    for target in targets {
      self.link(key, target);
    }
    Ok(())
  }

  /// Drops every outgoing edge of `key`. Called when `key` leaves the cache.
  pub(crate) fn detach(&self, key: &K) {
    if !self.targets.contains_key(key) {
      return;
    }
    let _edges = self.edges.lock();
    self.unlink_all(key);
  }

  /// Callers hold the edge lock.
  fn link(&self, key: &K, target: &K) {
    self
      .dependents
      .entry(target.clone())
      .or_insert_with(|| DashSet::with_hasher(self.hasher.clone()))
      .insert(key.clone());
    self
      .targets
      .entry(key.clone())
      .or_insert_with(|| DashSet::with_hasher(self.hasher.clone()))
      .insert(target.clone());
  }

  /// Callers hold the edge lock.
  fn unlink_all(&self, key: &K) {
    let Some((_, targets)) = self.targets.remove(key) else {
      return;
    };
    for target in targets {
      if let Some(set) = self.dependents.get(&target) {
        set.remove(key);
      }
      self
        .dependents
        .remove_if(&target, |_, set| set.is_empty());
    }
  }

  /// Whether evicting `from` would, through any chain of edges, evict `to`.
  fn reaches(&self, from: &K, to: &K) -> bool {
    let mut visited: HashSet<K, H> = HashSet::with_hasher(self.hasher.clone());
    let mut stack = vec![from.clone()];

    while let Some(current) = stack.pop() {
      if !visited.insert(current.clone()) {
        continue;
      }
      // Copy the children out so no map guard is held while walking.
      for child in self.dependents_of(&current) {
        if &child == to {
          return true;
        }
        stack.push(child);
      }
    }
    false
  }

  /// The keys that depend directly on `target`.
  pub fn dependents_of(&self, target: &K) -> Vec<K> {
    self
      .dependents
      .get(target)
      .map(|set| set.iter().map(|key| key.key().clone()).collect())
      .unwrap_or_default()
  }

  pub fn has_dependents(&self, target: &K) -> bool {
    self
      .dependents
      .get(target)
      .is_some_and(|set| !set.is_empty())
  }

  /// Deletes the mapping for `target` once its cascade has run, along with
  /// the reverse entries of dependents that were not in the cache.
  pub(crate) fn forget(&self, target: &K) {
    let _edges = self.edges.lock();
    let Some((_, dependents)) = self.dependents.remove(target) else {
      return;
    };
    for dependent in dependents {
      if let Some(set) = self.targets.get(&dependent) {
        set.remove(target);
      }
      self
        .targets
        .remove_if(&dependent, |_, set| set.is_empty());
    }
  }

  /// The keys that `key` directly depends on.
  pub fn targets_of(&self, key: &K) -> Vec<K> {
    self
      .targets
      .get(key)
      .map(|set| set.iter().map(|target| target.key().clone()).collect())
      .unwrap_or_default()
  }

  /// Number of keys that currently have dependents.
  pub fn target_count(&self) -> usize {
    self.dependents.len()
  }
}
