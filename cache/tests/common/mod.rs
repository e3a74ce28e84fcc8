#![allow(dead_code)] // each test binary uses its own subset of these helpers

use std::sync::Arc;
use std::time::Duration;

use herd_cache::{
  Cache, CacheBuilder, InvalidationListener, MemoryBroker, ReconnectEvent, ReconnectedListener,
  ReconnectingListener,
};
use parking_lot::Mutex;

/// Connects a cache to the given broker with short retry intervals, so
/// reconnection scenarios resolve in milliseconds.
pub async fn connect_cache(name: &str, broker: &MemoryBroker) -> Cache<String> {
  CacheBuilder::new(name)
    .retry_min_interval(Duration::from_millis(10))
    .retry_max_interval(Duration::from_millis(40))
    .connect(Arc::new(broker.clone()))
    .await
    .expect("cache must connect to an online memory broker")
}

/// Polls `condition` until it holds. Panics after two seconds, naming what
/// it was waiting for.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  while !condition() {
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for {}", what);
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}

/// Records invalidation messages as (content, publisher id) pairs.
#[derive(Default)]
pub struct InvalidationProbe {
  seen: Mutex<Vec<(String, String)>>,
}

impl InvalidationProbe {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn seen(&self) -> Vec<(String, String)> {
    self.seen.lock().clone()
  }
}

impl InvalidationListener for InvalidationProbe {
  fn on_invalidation(&self, content: &str, publisher_id: &str) {
    self
      .seen
      .lock()
      .push((content.to_string(), publisher_id.to_string()));
  }
}

/// Records both edges of the reconnection lifecycle.
#[derive(Default)]
pub struct ReconnectProbe {
  reconnecting: Mutex<Vec<ReconnectEvent>>,
  reconnected: Mutex<Vec<ReconnectEvent>>,
}

impl ReconnectProbe {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn reconnecting(&self) -> Vec<ReconnectEvent> {
    self.reconnecting.lock().clone()
  }

  pub fn reconnected(&self) -> Vec<ReconnectEvent> {
    self.reconnected.lock().clone()
  }

  /// Registers this probe for both event kinds on `cache`.
  pub fn attach(self: &Arc<Self>, cache: &Cache<String>) {
    cache
      .add_reconnecting_listener(self.clone())
      .expect("cache is open");
    cache
      .add_reconnected_listener(self.clone())
      .expect("cache is open");
  }
}

impl ReconnectingListener for ReconnectProbe {
  fn on_reconnecting(&self, event: &ReconnectEvent) {
    self.reconnecting.lock().push(event.clone());
  }
}

impl ReconnectedListener for ReconnectProbe {
  fn on_reconnected(&self, event: &ReconnectEvent) {
    self.reconnected.lock().push(event.clone());
  }
}
