//! Plain configuration values that can be loaded from a config file.
//!
//! With the `serde` feature (on by default) [`CacheOptions`] deserializes
//! from any serde format. Durations are written the human way, as in
//! `"3s"`, `"250ms"` or `"1m 30s"`.

use std::time::Duration;

/// Default lock timeout for key operations.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);
/// Default interval between time-gated compaction passes.
pub const DEFAULT_SCAN_FREQUENCY: Duration = Duration::from_secs(60);
/// Default share of the size limit kept free by a capacity pass.
pub const DEFAULT_COMPACTION_PERCENTAGE: f64 = 0.05;
/// Default interval between background saver cycles.
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(5);
/// Default lock timeout the saver uses per key.
pub const DEFAULT_SAVE_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Cache configuration as plain data. Feed it to
/// [`CacheBuilder::from_options`](crate::CacheBuilder::from_options) and
/// [`PersistentCacheBuilder::options`](crate::PersistentCacheBuilder::options).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheOptions {
  #[cfg_attr(feature = "serde", serde(with = "human_duration"))]
  pub default_lock_timeout: Duration,
  #[cfg_attr(feature = "serde", serde(with = "human_duration"))]
  pub expiration_scan_frequency: Duration,
  pub compaction_percentage: f64,
  pub size_limit: Option<u64>,
  /// Number of store shards. `None` picks a value from the CPU count.
  pub shards: Option<usize>,
  pub background_maintenance: bool,
  #[cfg_attr(feature = "serde", serde(with = "human_duration"))]
  pub save_interval: Duration,
  #[cfg_attr(feature = "serde", serde(with = "human_duration"))]
  pub save_lock_timeout: Duration,
  pub background_saver: bool,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      default_lock_timeout: DEFAULT_LOCK_TIMEOUT,
      expiration_scan_frequency: DEFAULT_SCAN_FREQUENCY,
      compaction_percentage: DEFAULT_COMPACTION_PERCENTAGE,
      size_limit: None,
      shards: None,
      background_maintenance: true,
      save_interval: DEFAULT_SAVE_INTERVAL,
      save_lock_timeout: DEFAULT_SAVE_LOCK_TIMEOUT,
      background_saver: true,
    }
  }
}

#[cfg(feature = "serde")]
mod human_duration {
  use serde::{de, Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*duration))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(de::Error::custom)
  }
}
