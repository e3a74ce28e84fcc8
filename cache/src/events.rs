use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use herd_broker::BrokerError;
use parking_lot::RwLock;

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Details of one reconnection attempt, delivered to both `reconnecting`
/// and (for the attempt that succeeded) `reconnected` listeners.
#[derive(Debug, Clone)]
pub struct ReconnectEvent {
  /// The failure that caused, or preceded, this attempt.
  pub error: BrokerError,
  /// 1-based attempt counter, reset on every fresh disconnect.
  pub attempt: u64,
  /// Backoff interval derived from the attempt; the cache sleeps this long
  /// after the attempt fails.
  pub retry_interval: Duration,
}

/// Observes invalidation messages accepted from the bus.
///
/// Called after the message has been applied locally, for every accepted
/// message, including payloads the cache did not recognize. Runs on the
/// delivery task; keep it quick.
pub trait InvalidationListener: Send + Sync {
  fn on_invalidation(&self, content: &str, publisher_id: &str);
}

/// Observes the start of every reconnection attempt.
pub trait ReconnectingListener: Send + Sync {
  fn on_reconnecting(&self, event: &ReconnectEvent);
}

/// Observes successful reconnections.
pub trait ReconnectedListener: Send + Sync {
  fn on_reconnected(&self, event: &ReconnectEvent);
}

struct Registry<L: ?Sized> {
  entries: RwLock<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Registry<L> {
  fn new() -> Self {
    Self {
      entries: RwLock::new(Vec::new()),
    }
  }

  fn add(&self, next_id: &AtomicU64, listener: Arc<L>) -> ListenerId {
    let id = ListenerId(next_id.fetch_add(1, Ordering::Relaxed));
    self.entries.write().push((id, listener));
    id
  }

  fn remove(&self, id: ListenerId) -> bool {
    let mut entries = self.entries.write();
    let before = entries.len();
    entries.retain(|(entry_id, _)| *entry_id != id);
    entries.len() != before
  }

  /// Clones the current listener set so emission runs without the lock;
  /// listeners may re-enter the registry from their callbacks.
  fn snapshot(&self) -> Vec<Arc<L>> {
    self.entries.read().iter().map(|(_, listener)| listener.clone()).collect()
  }
}

/// The three listener registries. A panicking listener is logged and
/// skipped; it never takes down delivery or the reconnection loop, and
/// the remaining listeners still run.
pub(crate) struct EventBus {
  invalidation: Registry<dyn InvalidationListener>,
  reconnecting: Registry<dyn ReconnectingListener>,
  reconnected: Registry<dyn ReconnectedListener>,
  next_id: AtomicU64,
}

impl EventBus {
  pub(crate) fn new() -> Self {
    Self {
      invalidation: Registry::new(),
      reconnecting: Registry::new(),
      reconnected: Registry::new(),
      next_id: AtomicU64::new(0),
    }
  }

  pub(crate) fn add_invalidation(&self, listener: Arc<dyn InvalidationListener>) -> ListenerId {
    self.invalidation.add(&self.next_id, listener)
  }

  pub(crate) fn remove_invalidation(&self, id: ListenerId) -> bool {
    self.invalidation.remove(id)
  }

  pub(crate) fn add_reconnecting(&self, listener: Arc<dyn ReconnectingListener>) -> ListenerId {
    self.reconnecting.add(&self.next_id, listener)
  }

  pub(crate) fn remove_reconnecting(&self, id: ListenerId) -> bool {
    self.reconnecting.remove(id)
  }

  pub(crate) fn add_reconnected(&self, listener: Arc<dyn ReconnectedListener>) -> ListenerId {
    self.reconnected.add(&self.next_id, listener)
  }

  pub(crate) fn remove_reconnected(&self, id: ListenerId) -> bool {
    self.reconnected.remove(id)
  }

  pub(crate) fn emit_invalidation(&self, content: &str, publisher_id: &str) {
    for listener in self.invalidation.snapshot() {
      let outcome =
        panic::catch_unwind(AssertUnwindSafe(|| listener.on_invalidation(content, publisher_id)));
      if outcome.is_err() {
        tracing::warn!(content, "invalidation listener panicked");
      }
    }
  }

  pub(crate) fn emit_reconnecting(&self, event: &ReconnectEvent) {
    for listener in self.reconnecting.snapshot() {
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_reconnecting(event)));
      if outcome.is_err() {
        tracing::warn!(attempt = event.attempt, "reconnecting listener panicked");
      }
    }
  }

  pub(crate) fn emit_reconnected(&self, event: &ReconnectEvent) {
    for listener in self.reconnected.snapshot() {
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_reconnected(event)));
      if outcome.is_err() {
        tracing::warn!(attempt = event.attempt, "reconnected listener panicked");
      }
    }
  }
}
