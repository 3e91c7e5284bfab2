#![allow(dead_code)]

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use fibre_keyed_cache::{
  BoxError, CacheBuilder, CacheStore, EvictionListener, EvictionReason, ManualClock,
};

/// Installs a test-writer subscriber once per test binary. `RUST_LOG`
/// controls the filter.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

// Builds a cache driven by a manual clock, with maintenance run inline so
// tests decide exactly when compaction happens.
pub fn build_manual_cache(clock: &Arc<ManualClock>) -> CacheStore<i32, String> {
  init_tracing();
  CacheBuilder::new()
    .clock(clock.clone())
    .background_maintenance(false)
    .build()
    .unwrap()
}

pub fn build_manual_cache_with_limit(
  clock: &Arc<ManualClock>,
  size_limit: u64,
  compaction_percentage: f64,
) -> CacheStore<i32, String> {
  init_tracing();
  CacheBuilder::new()
    .clock(clock.clone())
    .size_limit(size_limit)
    .compaction_percentage(compaction_percentage)
    .background_maintenance(false)
    .build()
    .unwrap()
}

/// A shared, ordered record of what callbacks observed.
pub type Log<T> = Arc<Mutex<Vec<T>>>;

pub fn new_log<T>() -> Log<T> {
  Arc::new(Mutex::new(Vec::new()))
}

pub fn entries<T: Clone>(log: &Log<T>) -> Vec<T> {
  log.lock().unwrap().clone()
}

/// A post-eviction callback that records `(key, reason)`.
pub fn record_reason(
  log: &Log<(i32, EvictionReason)>,
) -> impl Fn(&i32, &Arc<String>, EvictionReason) -> Result<(), BoxError> + Send + Sync + 'static {
  let log = log.clone();
  move |key: &i32, _value: &Arc<String>, reason: EvictionReason| {
    log.lock().unwrap().push((*key, reason));
    Ok(())
  }
}

// Use std::sync::mpsc for listener tests. Sends never block.
pub struct ChannelListener {
  pub sender: mpsc::Sender<(i32, String, EvictionReason)>,
}

impl EvictionListener<i32, String> for ChannelListener {
  fn on_evict(&self, key: &i32, value: &Arc<String>, reason: EvictionReason) {
    let _ = self.sender.send((*key, value.to_string(), reason));
  }
}

pub fn drain<T>(rx: &mpsc::Receiver<T>) -> Vec<T> {
  rx.try_iter().collect()
}

pub const GENEROUS: Duration = Duration::from_secs(5);
