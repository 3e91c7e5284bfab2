//! A concurrent, keyed, in-memory cache with per-key locking.
//!
//! # Features
//! - **Per-Key Locking**: Every operation on a key runs under that key's
//!   reentrant lock, so same-key operations are totally ordered while
//!   unrelated keys never contend.
//! - **Rich Expiration**: Absolute, relative and sliding expiration, plus
//!   expiration tokens that evict their entries when cancelled.
//! - **Eviction Callbacks**: Ordered post-eviction callbacks, and priority
//!   callbacks that wait for every outstanding reference on the key.
//! - **Dependencies**: Evicting an entry cascades to the entries that depend
//!   on it. Cycles are rejected.
//! - **Size Limits**: Capacity compaction drains low-priority and least
//!   recently used entries first.
//! - **Write-Behind**: [`PersistentObjectCache`] loads objects on demand and
//!   saves changed ones from a background thread.
//! - **Configuration**: Optional `serde` feature for reading [`CacheOptions`]
//!   from config files.

// Public modules that form the API
pub mod builder;
pub mod clock;
pub mod dependency;
pub mod entry_api;
pub mod error;
pub mod eviction;
pub mod handles;
pub mod listener;
pub mod lock;
pub mod metrics;
pub mod options;
pub mod persistent;
pub mod token;

// Internal, crate-only modules
mod entry;
mod shared;
mod store;
mod task;

// Re-export the primary user-facing types for convenience
pub use builder::CacheBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dependency::DependencyGraph;
pub use entry::CacheItemPriority;
pub use entry_api::{EntryBuilder, ParentLink};
pub use error::{BoxError, BuildError, CacheError, CallbackErrors};
pub use eviction::{EvictionCoordinator, PriorityCallback};
pub use handles::CacheStore;
pub use listener::{EvictionListener, EvictionReason, PostEvictionCallback};
pub use lock::{KeyLock, KeyLockGuard, NamedLockRegistry};
pub use metrics::MetricsSnapshot;
pub use options::CacheOptions;
pub use persistent::{ObjectCallbacks, ObjectSlot, PersistentCacheBuilder, PersistentObjectCache, SaveReport};
pub use task::compactor::CompactionReport;
pub use token::ExpirationToken;
