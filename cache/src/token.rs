use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type TokenCallback = Box<dyn FnOnce() + Send>;

struct TokenInner {
  cancelled: AtomicBool,
  next_id: AtomicU64,
  callbacks: Mutex<Vec<(u64, TokenCallback)>>,
}

/// An external cancellation signal that can be linked to cache entries.
///
/// Attaching a token with [`EntryBuilder::expiration_token`] evicts the entry
/// with `EvictionReason::TokenExpired` when the token is cancelled. Passing a
/// token to [`EntryBuilder::cancel_on_eviction`] links the other direction:
/// the token is cancelled when the entry leaves the cache.
///
/// Clones share the same underlying signal.
///
/// [`EntryBuilder::expiration_token`]: crate::EntryBuilder::expiration_token
/// [`EntryBuilder::cancel_on_eviction`]: crate::EntryBuilder::cancel_on_eviction
#[derive(Clone)]
pub struct ExpirationToken {
  inner: Arc<TokenInner>,
}

impl fmt::Debug for ExpirationToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExpirationToken")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

impl Default for ExpirationToken {
  fn default() -> Self {
    Self::new()
  }
}

/// Identifies a callback registered on a token so it can be withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TokenRegistration(u64);

impl ExpirationToken {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(TokenInner {
        cancelled: AtomicBool::new(false),
        next_id: AtomicU64::new(0),
        callbacks: Mutex::new(Vec::new()),
      }),
    }
  }

  #[inline]
  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::Acquire)
  }

  /// Cancels the token, running every registered callback on this thread.
  /// Cancelling twice is a no-op.
  pub fn cancel(&self) {
    if self.inner.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
    for (_, callback) in callbacks {
      callback();
    }
  }

  /// Registers `callback` to run on cancellation. If the token is already
  /// cancelled the callback runs immediately and `None` is returned.
  pub(crate) fn register(&self, callback: TokenCallback) -> Option<TokenRegistration> {
    {
      let mut callbacks = self.inner.callbacks.lock();
      if !self.is_cancelled() {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        callbacks.push((id, callback));
        return Some(TokenRegistration(id));
      }
    }
    callback();
    None
  }

  /// Withdraws a callback that has not run yet.
  pub(crate) fn unregister(&self, registration: TokenRegistration) {
    self
      .inner
      .callbacks
      .lock()
      .retain(|(id, _)| *id != registration.0);
  }

  #[cfg(test)]
  pub(crate) fn pending_callbacks(&self) -> usize {
    self.inner.callbacks.lock().len()
  }
}
