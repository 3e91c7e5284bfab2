use fibre_keyed_cache::{CacheBuilder, CacheItemPriority, EvictionReason};
use std::sync::Arc;
use std::time::Duration;

fn main() {
  // A cache bounded to 100 size units with a 1-second maintenance interval.
  let cache = CacheBuilder::default()
    .size_limit(100)
    .expiration_scan_frequency(Duration::from_secs(1))
    .build()
    .expect("Failed to build cache");

  println!("Inserting 'config' with a 2-second sliding expiration.");
  cache
    .create_entry("config".to_string())
    .expect("key lock")
    .sliding_expiration(Duration::from_secs(2))
    .priority(CacheItemPriority::High)
    .post_eviction_callback(|key: &String, value: &Arc<u64>, reason: EvictionReason| {
      println!("  '{key}' ({value}) left the cache: {reason}");
      Ok(())
    })
    .commit(42)
    .expect("commit");

  match cache.get(&"config".to_string()).expect("key lock") {
    Some(value) => println!("Found value for config: {value}"),
    None => println!("Value for config not found."),
  }

  cache.insert("session".to_string(), 7).expect("insert");
  cache
    .add_dependency(&"session".to_string(), &["config".to_string()])
    .expect("no cycle");

  println!("\nRemoving 'config' also removes 'session', which depends on it.");
  cache.invalidate(&"config".to_string()).expect("callbacks");
  println!("session present: {}", cache.contains_key(&"session".to_string()));

  println!("\nCache metrics: {:#?}", cache.metrics());
}
