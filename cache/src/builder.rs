use std::sync::Arc;
use std::time::Duration;

use herd_broker::Broker;
use parking_lot::{Mutex, RwLock};

use crate::error::CacheError;
use crate::events::EventBus;
use crate::handles::Cache;
use crate::loads::LoadTable;
use crate::metrics::Metrics;
use crate::protocol;
use crate::shared::CacheShared;
use crate::store::{LocalStore, LruStore, StoreOptions};
use crate::supervisor::{self, ConnectionState, StateCell};

pub(crate) const DEFAULT_RETRY_MIN: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_RETRY_FACTOR: f64 = 2.0;

/// How the cache behaves when its broker link fails.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectionOptions {
  /// Serve retained (possibly incoherent) values while reconnecting
  /// instead of wiping local state and parking reads. Defaults to false.
  pub allow_stale_data: bool,
  /// Backoff floor; also the delay after the first failed attempt.
  pub retry_min_interval: Duration,
  /// Backoff ceiling.
  pub retry_max_interval: Duration,
  /// Multiplier applied per attempt.
  pub retry_factor: f64,
}

impl Default for ReconnectionOptions {
  fn default() -> Self {
    Self {
      allow_stale_data: false,
      retry_min_interval: DEFAULT_RETRY_MIN,
      retry_max_interval: DEFAULT_RETRY_MAX,
      retry_factor: DEFAULT_RETRY_FACTOR,
    }
  }
}

impl ReconnectionOptions {
  /// Backoff for the given 0-based attempt:
  /// `min(retry_min * factor^attempt, retry_max)`.
  pub(crate) fn interval_for(&self, attempt: u64) -> Duration {
    let base = self.retry_min_interval.as_millis() as f64;
    let exponent = attempt.min(i32::MAX as u64) as i32;
    let scaled = base * self.retry_factor.powi(exponent);
    let capped = scaled.min(self.retry_max_interval.as_millis() as f64);
    Duration::from_millis(capped as u64)
  }
}

/// Configures and connects a [`Cache`].
///
/// Construction is two-phase: setters are infallible, and
/// [`connect`](Self::connect) validates everything synchronously before the
/// first broker call, so bad options never produce half-built topology.
pub struct CacheBuilder<V: Send + Sync> {
  name: String,
  store_options: StoreOptions,
  store: Option<Box<dyn LocalStore<V>>>,
  reconnection: ReconnectionOptions,
}

impl<V: Send + Sync + 'static> CacheBuilder<V> {
  /// `name` scopes the coherence domain: every instance built with the
  /// same name shares one invalidation exchange.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      store_options: StoreOptions::default(),
      store: None,
      reconnection: ReconnectionOptions::default(),
    }
  }

  /// Capacity of the bundled store, in entries.
  pub fn max_entries(mut self, max: usize) -> Self {
    self.store_options.max_entries = Some(max);
    self
  }

  /// Time-to-live for values in the bundled store.
  pub fn time_to_live(mut self, ttl: Duration) -> Self {
    self.store_options.time_to_live = Some(ttl);
    self
  }

  /// Lets the bundled store return an expired value one last time.
  pub fn allow_stale(mut self, allow: bool) -> Self {
    self.store_options.allow_stale = allow;
    self
  }

  /// Replaces the bundled [`LruStore`] with a caller-supplied store. The
  /// bundled store options are ignored when this is set.
  pub fn store(mut self, store: impl LocalStore<V> + 'static) -> Self {
    self.store = Some(Box::new(store));
    self
  }

  /// Keep serving retained values while the broker link is down. See
  /// [`ReconnectionOptions::allow_stale_data`].
  pub fn allow_stale_data(mut self, allow: bool) -> Self {
    self.reconnection.allow_stale_data = allow;
    self
  }

  pub fn retry_min_interval(mut self, interval: Duration) -> Self {
    self.reconnection.retry_min_interval = interval;
    self
  }

  pub fn retry_max_interval(mut self, interval: Duration) -> Self {
    self.reconnection.retry_max_interval = interval;
    self
  }

  pub fn retry_factor(mut self, factor: f64) -> Self {
    self.reconnection.retry_factor = factor;
    self
  }

  pub fn reconnection(mut self, options: ReconnectionOptions) -> Self {
    self.reconnection = options;
    self
  }

  fn validate(&self) -> Result<(), CacheError> {
    if self.name.trim().is_empty() {
      return Err(CacheError::InvalidOptions("name must not be empty".to_string()));
    }
    if self.store_options.max_entries == Some(0) {
      return Err(CacheError::InvalidOptions(
        "max_entries must be greater than zero".to_string(),
      ));
    }
    if self.reconnection.retry_min_interval.is_zero() {
      return Err(CacheError::InvalidOptions(
        "retry_min_interval must be greater than zero".to_string(),
      ));
    }
    if self.reconnection.retry_max_interval < self.reconnection.retry_min_interval {
      return Err(CacheError::InvalidOptions(
        "retry_max_interval must not be below retry_min_interval".to_string(),
      ));
    }
    if !(self.reconnection.retry_factor >= 1.0) {
      return Err(CacheError::InvalidOptions(
        "retry_factor must be at least 1".to_string(),
      ));
    }
    Ok(())
  }

  /// Validates the configuration, connects, builds the invalidation
  /// topology and returns the ready facade.
  ///
  /// A failure here is surfaced to the caller; the reconnection machinery
  /// only arms after this initial link succeeds.
  pub async fn connect(self, broker: Arc<dyn Broker>) -> Result<Cache<V>, CacheError> {
    self.validate()?;
    let store: Box<dyn LocalStore<V>> = match self.store {
      Some(store) => store,
      None => Box::new(LruStore::new(self.store_options)),
    };
    let exchange = protocol::exchange_name(&self.name);
    let shared = Arc::new(CacheShared {
      name: self.name,
      exchange,
      broker,
      reconnection: self.reconnection,
      store: Mutex::new(store),
      loads: LoadTable::new(),
      events: EventBus::new(),
      metrics: Metrics::new(),
      state: StateCell::new(ConnectionState::Connecting),
      link: RwLock::new(None),
    });
    supervisor::open_link(&shared).await?;
    shared.state.store(ConnectionState::Connected);
    tracing::debug!(name = %shared.name, exchange = %shared.exchange, "cache connected");
    Ok(Cache::from_shared(shared))
  }
}
