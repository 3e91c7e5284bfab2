mod common;

use common::*;
use fibre_keyed_cache::{ExpirationToken, ManualClock};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_child_expiration_propagates_to_parent() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache(&clock);

  let parent = cache
    .create_entry(1)
    .unwrap()
    .absolute_expiration_relative_to_now(Duration::from_secs(60));
  let link = parent.parent_link();

  // The child lives on another key, so it can be built while the parent's
  // builder still holds key 1.
  cache
    .create_entry(2)
    .unwrap()
    .link_parent(&link)
    .absolute_expiration_relative_to_now(Duration::from_secs(5))
    .commit("child".to_string())
    .unwrap();
  parent.commit("parent".to_string()).unwrap();

  clock.advance(Duration::from_secs(6));
  assert!(cache.get(&1).unwrap().is_none(), "parent adopted the child's 5s");
  assert!(cache.get(&2).unwrap().is_none());
}

#[test]
fn test_child_tokens_propagate_to_parent() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache(&clock);
  let token = ExpirationToken::new();

  let parent = cache.create_entry(1).unwrap();
  let link = parent.parent_link();
  cache
    .create_entry(2)
    .unwrap()
    .link_parent(&link)
    .expiration_token(token.clone())
    .commit("child".to_string())
    .unwrap();
  parent.commit("parent".to_string()).unwrap();

  token.cancel();
  assert!(!cache.contains_key(&1));
  assert!(!cache.contains_key(&2));
}

#[test]
fn test_parent_keeps_its_own_earlier_expiration() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache(&clock);

  let parent = cache
    .create_entry(1)
    .unwrap()
    .absolute_expiration_relative_to_now(Duration::from_secs(2));
  let link = parent.parent_link();
  cache
    .create_entry(2)
    .unwrap()
    .link_parent(&link)
    .absolute_expiration_relative_to_now(Duration::from_secs(30))
    .commit("child".to_string())
    .unwrap();
  parent.commit("parent".to_string()).unwrap();

  clock.advance(Duration::from_secs(3));
  assert!(cache.get(&1).unwrap().is_none());
  assert!(cache.get(&2).unwrap().is_some());
}

#[test]
fn test_unlinked_builder_is_unaffected() {
  let clock = Arc::new(ManualClock::new());
  let cache = build_manual_cache(&clock);

  let parent = cache.create_entry(1).unwrap();
  let _unused = parent.parent_link();
  cache
    .create_entry(2)
    .unwrap()
    .absolute_expiration_relative_to_now(Duration::from_secs(1))
    .commit("stranger".to_string())
    .unwrap();
  parent.commit("parent".to_string()).unwrap();

  clock.advance(Duration::from_secs(2));
  assert!(cache.get(&1).unwrap().is_some());
}
