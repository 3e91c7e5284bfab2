mod common;

use common::*;
use fibre_keyed_cache::{
  BuildError, CacheBuilder, CacheError, CacheStore, EvictionReason, ManualClock,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

fn new_test_cache() -> CacheStore<i32, String> {
  build_manual_cache(&Arc::new(ManualClock::new()))
}

#[test]
fn test_insert_and_get() {
  let cache = new_test_cache();
  cache.insert(1, "one".to_string()).unwrap();

  assert_eq!(cache.get(&1).unwrap().as_deref(), Some(&"one".to_string()));
  assert!(cache.get(&2).unwrap().is_none());

  let metrics = cache.metrics();
  assert_eq!(metrics.inserts, 1);
  assert_eq!(metrics.hits, 1);
  assert_eq!(metrics.misses, 1);
  assert_eq!(metrics.current_size, 1);
  assert_eq!(cache.size(), 1);
  assert_eq!(cache.len(), 1);
  assert!(cache.contains_key(&1));
}

#[test]
fn test_replacement_evicts_previous_entry() {
  let cache = new_test_cache();
  let log = new_log();

  cache
    .create_entry(1)
    .unwrap()
    .size(3)
    .post_eviction_callback(record_reason(&log))
    .commit("old".to_string())
    .unwrap();
  assert_eq!(cache.size(), 3);

  cache.insert(1, "new".to_string()).unwrap();

  assert_eq!(entries(&log), vec![(1, EvictionReason::Replaced)]);
  assert_eq!(*cache.get(&1).unwrap().unwrap(), "new");
  assert_eq!(cache.size(), 1, "only the new entry is charged");
  assert_eq!(cache.metrics().replaced, 1);
}

#[test]
fn test_remove_reports_whether_it_removed() {
  let cache = new_test_cache();
  let log = new_log();
  cache
    .create_entry(1)
    .unwrap()
    .post_eviction_callback(record_reason(&log))
    .commit("one".to_string())
    .unwrap();

  assert!(cache.remove(&1, EvictionReason::Capacity).unwrap());
  assert!(!cache.remove(&1, EvictionReason::Removed).unwrap());
  assert!(!cache.invalidate(&1).unwrap());

  assert_eq!(entries(&log), vec![(1, EvictionReason::Capacity)]);
  assert!(cache.get(&1).unwrap().is_none());
  assert_eq!(cache.size(), 0);
}

#[test]
fn test_callback_failures_are_aggregated() {
  let cache = new_test_cache();
  let ran = Arc::new(AtomicUsize::new(0));
  let counter = ran.clone();

  cache
    .create_entry(1)
    .unwrap()
    .post_eviction_callback(|_: &i32, _: &Arc<String>, _: EvictionReason| Err("first".into()))
    .post_eviction_callback(|_: &i32, _: &Arc<String>, _: EvictionReason| panic!("second"))
    .post_eviction_callback(move |_: &i32, _: &Arc<String>, _: EvictionReason| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    })
    .commit("one".to_string())
    .unwrap();

  match cache.invalidate(&1) {
    Err(CacheError::Callbacks(errors)) => assert_eq!(errors.len(), 2),
    other => panic!("expected aggregated callback errors, got {other:?}"),
  }
  // The removal happened and every callback ran.
  assert_eq!(ran.load(Ordering::SeqCst), 1);
  assert!(!cache.contains_key(&1));
  assert_eq!(cache.metrics().callback_failures, 2);
}

#[test]
fn test_get_or_create_runs_factory_once() {
  let cache = new_test_cache();
  let calls = AtomicUsize::new(0);

  for _ in 0..3 {
    let value = cache
      .get_or_create(5, |key| {
        calls.fetch_add(1, Ordering::SeqCst);
        format!("value-{key}")
      })
      .unwrap();
    assert_eq!(*value, "value-5");
  }
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropped_builder_leaves_cache_unchanged() {
  let cache = new_test_cache();
  cache.insert(1, "kept".to_string()).unwrap();

  {
    let builder = cache.create_entry(1).unwrap().size(10);
    assert_eq!(*builder.current().unwrap(), "kept");
  }

  assert_eq!(*cache.get(&1).unwrap().unwrap(), "kept");
  assert_eq!(cache.size(), 1);
}

#[test]
fn test_clear_removes_everything() {
  let (tx, rx) = mpsc::channel();
  let cache: CacheStore<i32, String> = CacheBuilder::new()
    .background_maintenance(false)
    .eviction_listener(ChannelListener { sender: tx })
    .build()
    .unwrap();

  for key in 0..10 {
    cache.insert(key, key.to_string()).unwrap();
  }
  cache.clear().unwrap();

  assert!(cache.is_empty());
  assert_eq!(cache.size(), 0);
  let events = drain(&rx);
  assert_eq!(events.len(), 10);
  assert!(events.iter().all(|(_, _, reason)| *reason == EvictionReason::Removed));
}

#[test]
fn test_listener_sees_replacements() {
  let (tx, rx) = mpsc::channel();
  let cache: CacheStore<i32, String> = CacheBuilder::new()
    .background_maintenance(false)
    .eviction_listener(ChannelListener { sender: tx })
    .build()
    .unwrap();

  cache.insert(1, "one".to_string()).unwrap();
  cache.insert(1, "uno".to_string()).unwrap();

  assert_eq!(
    drain(&rx),
    vec![(1, "one".to_string(), EvictionReason::Replaced)]
  );
}

#[test]
fn test_disposed_cache_rejects_operations() {
  let cache = new_test_cache();
  cache.insert(1, "one".to_string()).unwrap();
  cache.dispose();

  assert!(cache.is_disposed());
  assert!(matches!(cache.get(&1), Err(CacheError::AlreadyDisposed)));
  assert!(matches!(
    cache.insert(2, "two".to_string()),
    Err(CacheError::AlreadyDisposed)
  ));
  assert!(matches!(cache.invalidate(&1), Err(CacheError::AlreadyDisposed)));
  assert!(matches!(cache.compact(), Err(CacheError::AlreadyDisposed)));

  // Disposing twice is harmless.
  cache.dispose();
}

#[test]
fn test_builder_validation() {
  let zero = CacheBuilder::<i32, String>::default().size_limit(0).build();
  assert_eq!(zero.unwrap_err(), BuildError::ZeroCapacity);

  let shards = CacheBuilder::<i32, String>::default().shards(0).build();
  assert_eq!(shards.unwrap_err(), BuildError::ZeroShards);

  let percentage = CacheBuilder::<i32, String>::default()
    .compaction_percentage(1.5)
    .build();
  assert_eq!(
    percentage.unwrap_err(),
    BuildError::InvalidCompactionPercentage(1.5)
  );
}

#[test]
fn test_entry_larger_than_limit_is_rejected() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache_with_limit(&clock, 10, 0.05);

  let result = cache.create_entry(1).unwrap().size(11).commit("big".to_string());
  assert!(matches!(
    result,
    Err(CacheError::EntryTooLarge { size: 11, limit: 10 })
  ));
  assert!(!cache.contains_key(&1));
  assert_eq!(cache.size(), 0);
}
