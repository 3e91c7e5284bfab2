mod common;

use common::*;
use fibre_keyed_cache::{
  BoxError, CacheError, CacheStore, EvictionReason, ExpirationToken, ManualClock, PriorityCallback,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn new_test_cache() -> CacheStore<i32, String> {
  build_manual_cache(&Arc::new(ManualClock::new()))
}

fn recorder(log: &Log<&'static str>, name: &'static str) -> PriorityCallback<i32, String> {
  let log = log.clone();
  Box::new(move |_: &i32, _: &Arc<String>, _: EvictionReason| -> Result<(), BoxError> {
    log.lock().unwrap().push(name);
    Ok(())
  })
}

#[test]
fn test_priority_callbacks_run_lowest_first() {
  let cache = new_test_cache();
  let log = new_log();
  cache.insert(1, "one".to_string()).unwrap();

  cache
    .enable_priority_eviction(&1, Some(recorder(&log, "priority-5")), 5)
    .unwrap();
  cache
    .enable_priority_eviction(&1, Some(recorder(&log, "priority-1")), 1)
    .unwrap();

  cache.invalidate(&1).unwrap();

  assert_eq!(entries(&log), vec!["priority-1", "priority-5"]);
  assert_eq!(cache.coordinator().tracked_keys(), 0);
}

#[test]
fn test_priority_callbacks_from_the_builder() {
  let cache = new_test_cache();
  let log = new_log();

  {
    let log_a = log.clone();
    let log_b = log.clone();
    cache
      .create_entry(1)
      .unwrap()
      .priority_callback(10, move |_, _, reason| {
        log_a.lock().unwrap().push(format!("late:{reason:?}"));
        Ok(())
      })
      .priority_callback(-1, move |_, _, reason| {
        log_b.lock().unwrap().push(format!("early:{reason:?}"));
        Ok(())
      })
      .commit("one".to_string())
      .unwrap();
  }

  cache.remove(&1, EvictionReason::Expired).unwrap();
  assert_eq!(entries(&log), vec!["early:Expired", "late:Expired"]);
}

#[test]
fn test_priority_eviction_requires_a_live_entry() {
  let cache = new_test_cache();
  let result = cache.enable_priority_eviction(&42, None, 0);
  assert!(matches!(result, Err(CacheError::KeyNotFound)));
}

#[test]
fn test_pinned_key_defers_callbacks_until_release() {
  let cache = new_test_cache();
  let log = new_log();
  cache.insert(1, "one".to_string()).unwrap();
  cache
    .enable_priority_eviction(&1, Some(recorder(&log, "drained")), 0)
    .unwrap();

  cache.add_ref(&1);
  cache.add_ref(&1);
  cache.invalidate(&1).unwrap();
  assert!(!cache.contains_key(&1), "structural removal is not deferred");
  assert!(entries(&log).is_empty(), "callbacks wait for the pins");

  cache.release(&1).unwrap();
  assert!(entries(&log).is_empty());
  cache.release(&1).unwrap();
  assert_eq!(entries(&log), vec!["drained"]);

  // Extra releases never rerun the batch or push the count below zero.
  cache.release(&1).unwrap();
  assert_eq!(entries(&log), vec!["drained"]);
  assert_eq!(cache.coordinator().ref_count(&1), 0);
}

#[test]
fn test_release_without_add_ref_keeps_deferral() {
  let cache = new_test_cache();
  let log = new_log();
  cache.insert(1, "one".to_string()).unwrap();
  cache
    .enable_priority_eviction(&1, Some(recorder(&log, "drained")), 0)
    .unwrap();

  // Nothing to release yet; the hook keeps its own pin.
  cache.release(&1).unwrap();
  assert_eq!(cache.coordinator().ref_count(&1), 1);

  cache.add_ref(&1);
  cache.invalidate(&1).unwrap();
  assert!(entries(&log).is_empty(), "the add_ref still pins the key");

  cache.release(&1).unwrap();
  assert_eq!(entries(&log), vec!["drained"]);
}

#[test]
fn test_release_returns_deferred_failures() {
  let cache = new_test_cache();
  cache.insert(1, "one".to_string()).unwrap();
  cache
    .enable_priority_eviction(
      &1,
      Some(Box::new(|_: &i32, _: &Arc<String>, _: EvictionReason| -> Result<(), BoxError> {
        Err("boom".into())
      })),
      0,
    )
    .unwrap();

  cache.add_ref(&1);
  cache.invalidate(&1).unwrap();
  match cache.release(&1) {
    Err(CacheError::Callbacks(errors)) => assert_eq!(errors.len(), 1),
    other => panic!("expected the deferred failure, got {other:?}"),
  }
}

#[test]
fn test_callbacks_fire_once_under_concurrent_refs() {
  const ROUNDS: usize = 50;
  const THREADS: usize = 4;

  for round in 0..ROUNDS {
    let cache = new_test_cache();
    let fired = Arc::new(AtomicUsize::new(0));
    cache.insert(1, "one".to_string()).unwrap();
    {
      let fired = fired.clone();
      cache
        .enable_priority_eviction(
          &1,
          Some(Box::new(move |_: &i32, _: &Arc<String>, _: EvictionReason| -> Result<(), BoxError> {
            fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
          })),
          0,
        )
        .unwrap();
    }

    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        let cache = cache.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          cache.add_ref(&1);
          barrier.wait();
          thread::yield_now();
          cache.release(&1).unwrap();
        })
      })
      .collect();

    barrier.wait();
    cache.invalidate(&1).unwrap();
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(fired.load(Ordering::SeqCst), 1, "round {round}");
  }
}

#[test]
fn test_expired_entry_is_a_miss_on_read() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache(&clock);
  let log = new_log();

  cache
    .create_entry(1)
    .unwrap()
    .absolute_expiration_relative_to_now(Duration::from_secs(10))
    .post_eviction_callback(record_reason(&log))
    .commit("one".to_string())
    .unwrap();

  clock.advance(Duration::from_secs(9));
  assert!(cache.get(&1).unwrap().is_some());

  clock.advance(Duration::from_secs(1));
  assert!(cache.get(&1).unwrap().is_none());
  assert_eq!(entries(&log), vec![(1, EvictionReason::Expired)]);
  assert!(!cache.contains_key(&1));
}

#[test]
fn test_sliding_expiration_is_renewed_by_reads() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache(&clock);
  cache
    .create_entry(1)
    .unwrap()
    .sliding_expiration(Duration::from_secs(2))
    .commit("one".to_string())
    .unwrap();

  for _ in 0..5 {
    clock.advance(Duration::from_millis(1500));
    assert!(cache.get(&1).unwrap().is_some());
  }

  clock.advance(Duration::from_secs(2));
  assert!(cache.get(&1).unwrap().is_none());
}

#[test]
fn test_unbounded_sliding_window_never_expires() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache(&clock);
  cache
    .create_entry(1)
    .unwrap()
    .sliding_expiration(Duration::MAX)
    .commit("one".to_string())
    .unwrap();

  assert!(cache.get(&1).unwrap().is_some());
  clock.advance(Duration::from_secs(365 * 24 * 3600));
  assert!(cache.get(&1).unwrap().is_some());
}

#[test]
fn test_cancelled_token_evicts_entry() {
  let cache = new_test_cache();
  let log = new_log();
  let token = ExpirationToken::new();

  cache
    .create_entry(1)
    .unwrap()
    .expiration_token(token.clone())
    .post_eviction_callback(record_reason(&log))
    .commit("one".to_string())
    .unwrap();
  assert!(cache.contains_key(&1));

  token.cancel();
  assert!(!cache.contains_key(&1));
  assert_eq!(entries(&log), vec![(1, EvictionReason::TokenExpired)]);

  // A second cancel is a no-op.
  token.cancel();
  assert_eq!(entries(&log).len(), 1);
}

#[test]
fn test_already_cancelled_token_evicts_on_commit() {
  let cache = new_test_cache();
  let token = ExpirationToken::new();
  token.cancel();

  cache
    .create_entry(1)
    .unwrap()
    .expiration_token(token)
    .commit("one".to_string())
    .unwrap();
  assert!(!cache.contains_key(&1));
  assert_eq!(cache.metrics().evicted_by_token, 1);
}

#[test]
fn test_eviction_cancels_linked_token() {
  let cache = new_test_cache();
  let token = ExpirationToken::new();

  cache
    .create_entry(1)
    .unwrap()
    .cancel_on_eviction(token.clone())
    .commit("one".to_string())
    .unwrap();
  assert!(!token.is_cancelled());

  cache.insert(1, "replacement".to_string()).unwrap();
  assert!(token.is_cancelled());
}

#[test]
fn test_token_chain_links_two_entries() {
  let cache = new_test_cache();
  let token = ExpirationToken::new();

  cache
    .create_entry(1)
    .unwrap()
    .cancel_on_eviction(token.clone())
    .commit("source".to_string())
    .unwrap();
  cache
    .create_entry(2)
    .unwrap()
    .expiration_token(token)
    .commit("follower".to_string())
    .unwrap();

  cache.invalidate(&1).unwrap();
  assert!(!cache.contains_key(&2));
}
