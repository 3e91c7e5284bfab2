use crate::error::BoxError;

use std::fmt;
use std::sync::Arc;

/// Describes the reason an entry was removed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
  /// The entry was removed explicitly by a caller.
  Removed,
  /// A newer entry was committed under the same key.
  Replaced,
  /// The entry's absolute or sliding expiration passed.
  Expired,
  /// The entry was removed to bring the cache back under its size limit.
  Capacity,
  /// An entry this one depends on was evicted.
  Dependency,
  /// An expiration token attached to the entry was cancelled.
  TokenExpired,
}

impl fmt::Display for EvictionReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EvictionReason::Removed => write!(f, "removed"),
      EvictionReason::Replaced => write!(f, "replaced by a newer entry"),
      EvictionReason::Expired => write!(f, "evicted due to expiration"),
      EvictionReason::Capacity => write!(f, "evicted due to capacity"),
      EvictionReason::Dependency => write!(f, "evicted because a dependency was evicted"),
      EvictionReason::TokenExpired => write!(f, "evicted because its expiration token fired"),
    }
  }
}

/// A callback attached to a single entry, run after that entry leaves the
/// store. Callbacks run in registration order on the evicting thread.
pub type PostEvictionCallback<K, V> =
  Arc<dyn Fn(&K, &Arc<V>, EvictionReason) -> Result<(), BoxError> + Send + Sync>;

/// A listener that can be registered with the cache to receive notifications
/// for every removal, whatever the reason.
///
/// The `on_evict` method runs on the thread that performed the eviction,
/// after the entry's own post-eviction callbacks. It must not block on the
/// lock of the key it is told about from another thread.
pub trait EvictionListener<K, V>: Send + Sync {
  fn on_evict(&self, key: &K, value: &Arc<V>, reason: EvictionReason);
}
