use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BoxError, CacheError};
use crate::events::{
  InvalidationListener, ListenerId, ReconnectedListener, ReconnectingListener,
};
use crate::loads::{Begin, LeaderGuard};
use crate::metrics::MetricsSnapshot;
use crate::protocol::Outbound;
use crate::shared::CacheShared;
use crate::supervisor::ConnectionState;

/// A process-local cache kept coherent with its sibling instances through
/// broker-fanned invalidations. Built with [`CacheBuilder`].
///
/// Values are stored and returned as `Arc<V>`, so reads are cheap and a
/// value handed out survives its own invalidation. Every operation except
/// the pure accessors fails with [`CacheError::Closing`] once [`close`]
/// has begun.
///
/// [`CacheBuilder`]: crate::CacheBuilder
/// [`close`]: Cache::close
pub struct Cache<V: Send + Sync + 'static> {
  shared: Arc<CacheShared<V>>,
}

impl<V: Send + Sync + 'static> Cache<V> {
  pub(crate) fn from_shared(shared: Arc<CacheShared<V>>) -> Self {
    Self { shared }
  }

  fn guard(&self) -> Result<(), CacheError> {
    if self.shared.is_closed() {
      Err(CacheError::Closing)
    } else {
      Ok(())
    }
  }

  /// Reads a value. While the broker link is being rebuilt (and stale
  /// serving is off) this behaves as a miss, whatever the store holds.
  pub fn get(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
    self.guard()?;
    if self.shared.degraded() {
      self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
      return Ok(None);
    }
    let value = self.shared.store.lock().get(key);
    match value {
      Some(value) => {
        self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(value))
      }
      None => {
        self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
      }
    }
  }

  /// Reads without refreshing recency. Same degraded-mode rule as
  /// [`get`](Self::get).
  pub fn peek(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
    self.guard()?;
    if self.shared.degraded() {
      return Ok(None);
    }
    Ok(self.shared.store.lock().peek(key))
  }

  pub fn has(&self, key: &str) -> Result<bool, CacheError> {
    self.guard()?;
    if self.shared.degraded() {
      return Ok(false);
    }
    Ok(self.shared.store.lock().has(key))
  }

  pub fn keys(&self) -> Result<Vec<String>, CacheError> {
    self.guard()?;
    Ok(self.shared.store.lock().keys())
  }

  /// Writes a value locally. Writing is a broadcast-free operation: other
  /// instances are only told when data is invalidated, not when it is
  /// produced. Returns `Ok(false)` without writing while the link is being
  /// rebuilt and stale serving is off.
  pub fn insert(&self, key: impl Into<String>, value: V) -> Result<bool, CacheError> {
    self.guard()?;
    if self.shared.degraded() {
      return Ok(false);
    }
    self.shared.store.lock().set(key.into(), Arc::new(value));
    self.shared.metrics.inserts.fetch_add(1, Ordering::Relaxed);
    Ok(true)
  }

  /// Deletes a key everywhere: publishes `del:<key>` to the other
  /// instances (when connected), then applies the deletion locally,
  /// including dropping any in-flight load for the key.
  pub fn invalidate(&self, key: &str) -> Result<(), CacheError> {
    self.guard()?;
    self.shared.publish_invalidation(Outbound::Delete(key));
    self.shared.loads.invalidate(key);
    self.shared.store.lock().delete(key);
    self.shared.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  /// Empties the cache everywhere: publishes `reset` (when connected),
  /// then clears the local store and every in-flight load entry.
  pub fn clear(&self) -> Result<(), CacheError> {
    self.guard()?;
    self.shared.publish_invalidation(Outbound::Reset);
    self.shared.loads.clear();
    self.shared.store.lock().clear();
    self.shared.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  /// Read-through with load coalescing: a hit returns immediately; on a
  /// miss, the first caller runs `loader` and everyone else asking for the
  /// same key awaits that same load and observes its result, value or
  /// error alike.
  ///
  /// `Ok(None)` from the loader is handed to callers but never cached. A
  /// successful value is written back only if the load is still current:
  /// an `invalidate`/`clear` (local or from the bus) that lands mid-load
  /// wins over the write-back. While the link is being rebuilt (and stale
  /// serving is off) results are likewise not written back.
  pub async fn get_with<F, Fut>(&self, key: &str, loader: F) -> Result<Option<Arc<V>>, CacheError>
  where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<Option<V>, BoxError>>,
  {
    self.guard()?;
    if !self.shared.degraded() {
      if let Some(value) = self.shared.store.lock().get(key) {
        self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
        return Ok(Some(value));
      }
    }
    self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);

    let slot = match self.shared.loads.begin(key) {
      Begin::Join(slot) => return (&*slot).await,
      Begin::Lead(slot) => slot,
    };
    self.shared.metrics.loads.fetch_add(1, Ordering::Relaxed);
    let guard = LeaderGuard::new(&self.shared.loads, key, &slot);

    let outcome = loader(key.to_string()).await;

    let result = match outcome {
      Ok(Some(value)) => {
        let value = Arc::new(value);
        let written = value.clone();
        let cacheable = !self.shared.degraded();
        self.shared.loads.finish_leader(key, &slot, |current| {
          if current && cacheable {
            self.shared.store.lock().set(key.to_string(), written);
            self.shared.metrics.inserts.fetch_add(1, Ordering::Relaxed);
          }
        });
        Ok(Some(value))
      }
      Ok(None) => {
        self.shared.loads.finish_leader(key, &slot, |_| {});
        Ok(None)
      }
      Err(error) => {
        self.shared.metrics.load_failures.fetch_add(1, Ordering::Relaxed);
        self.shared.loads.finish_leader(key, &slot, |_| {});
        Err(CacheError::Load {
          key: key.to_string(),
          cause: Arc::from(error),
        })
      }
    };
    guard.defuse();
    slot.complete(result.clone());
    result
  }

  /// Drops every expired entry from the local store.
  pub fn purge_stale(&self) -> Result<(), CacheError> {
    self.guard()?;
    self.shared.store.lock().purge_stale();
    Ok(())
  }

  /// Local entry count, including expired entries not yet swept.
  pub fn size(&self) -> Result<usize, CacheError> {
    self.guard()?;
    Ok(self.shared.store.lock().len())
  }

  pub fn max_entries(&self) -> Result<Option<usize>, CacheError> {
    self.guard()?;
    Ok(self.shared.store.lock().max_entries())
  }

  pub fn time_to_live(&self) -> Result<Option<Duration>, CacheError> {
    self.guard()?;
    Ok(self.shared.store.lock().time_to_live())
  }

  pub fn allows_stale(&self) -> Result<bool, CacheError> {
    self.guard()?;
    Ok(self.shared.store.lock().allow_stale())
  }

  /// Registers a listener for invalidation messages accepted from the bus.
  pub fn add_invalidation_listener(
    &self,
    listener: Arc<dyn InvalidationListener>,
  ) -> Result<ListenerId, CacheError> {
    self.guard()?;
    Ok(self.shared.events.add_invalidation(listener))
  }

  pub fn remove_invalidation_listener(&self, id: ListenerId) -> Result<bool, CacheError> {
    self.guard()?;
    Ok(self.shared.events.remove_invalidation(id))
  }

  /// Registers a listener fired at the start of every reconnection
  /// attempt. This is the alerting surface for broker trouble: operation
  /// results never carry connection failures.
  pub fn add_reconnecting_listener(
    &self,
    listener: Arc<dyn ReconnectingListener>,
  ) -> Result<ListenerId, CacheError> {
    self.guard()?;
    Ok(self.shared.events.add_reconnecting(listener))
  }

  pub fn remove_reconnecting_listener(&self, id: ListenerId) -> Result<bool, CacheError> {
    self.guard()?;
    Ok(self.shared.events.remove_reconnecting(id))
  }

  /// Registers a listener fired when a reconnection attempt succeeds.
  pub fn add_reconnected_listener(
    &self,
    listener: Arc<dyn ReconnectedListener>,
  ) -> Result<ListenerId, CacheError> {
    self.guard()?;
    Ok(self.shared.events.add_reconnected(listener))
  }

  pub fn remove_reconnected_listener(&self, id: ListenerId) -> Result<bool, CacheError> {
    self.guard()?;
    Ok(self.shared.events.remove_reconnected(id))
  }

  /// Shuts the instance down: cancels the consumer, closes channels and
  /// connection (best effort), and clears local state. Idempotent; the
  /// first caller performs the teardown and everyone else gets `Ok(())`.
  /// In-flight loads run to completion but their results are discarded.
  pub async fn close(&self) -> Result<(), CacheError> {
    if !self.shared.state.close() {
      return Ok(());
    }
    self.shared.teardown_link().await;
    self.shared.loads.clear();
    self.shared.store.lock().clear();
    tracing::debug!(name = %self.shared.name, "cache closed");
    Ok(())
  }

  /// Point-in-time counters. Available even after `close()`.
  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  pub fn connection_state(&self) -> ConnectionState {
    self.shared.state.load()
  }

  /// This instance's current id on the bus; `None` while the link is
  /// down. A fresh id (and queue) is minted on every reconnect.
  pub fn instance_id(&self) -> Option<String> {
    self.shared.instance_id()
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }
}

impl<V: Send + Sync + 'static> fmt::Debug for Cache<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache")
      .field("name", &self.shared.name)
      .field("state", &self.shared.state.load())
      .finish_non_exhaustive()
  }
}
