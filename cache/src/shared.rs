use std::sync::atomic::Ordering;
use std::sync::Arc;

use herd_broker::{Broker, Channel, Connection, Envelope};
use parking_lot::{Mutex, RwLock};

use crate::builder::ReconnectionOptions;
use crate::events::EventBus;
use crate::loads::LoadTable;
use crate::metrics::Metrics;
use crate::protocol::{self, Outbound};
use crate::store::LocalStore;
use crate::supervisor::{ConnectionState, StateCell};

/// One established broker link: identity, topology and channels. Replaced
/// wholesale on every reconnect; the instance id (and with it the queue
/// name) never survives a link.
pub(crate) struct Link {
  pub(crate) instance_id: String,
  pub(crate) queue: String,
  pub(crate) connection: Arc<dyn Connection>,
  pub(crate) publish_channel: Arc<dyn Channel>,
  pub(crate) subscribe_channel: Arc<dyn Channel>,
}

/// State shared by the facade, the delivery callback and the supervisor
/// tasks. All critical sections are short and never held across an await.
pub(crate) struct CacheShared<V: Send + Sync> {
  pub(crate) name: String,
  pub(crate) exchange: String,
  pub(crate) broker: Arc<dyn Broker>,
  pub(crate) reconnection: ReconnectionOptions,
  pub(crate) store: Mutex<Box<dyn LocalStore<V>>>,
  pub(crate) loads: LoadTable<V>,
  pub(crate) events: EventBus,
  pub(crate) metrics: Metrics,
  pub(crate) state: StateCell,
  pub(crate) link: RwLock<Option<Link>>,
}

impl<V: Send + Sync> CacheShared<V> {
  pub(crate) fn is_closed(&self) -> bool {
    self.state.load() == ConnectionState::Closed
  }

  /// While the link is being rebuilt, reads and writes are parked unless
  /// the cache was configured to serve stale data.
  pub(crate) fn degraded(&self) -> bool {
    self.state.load() == ConnectionState::Reconnecting && !self.reconnection.allow_stale_data
  }

  /// Wipes local state around a reconnect, so entries whose invalidations
  /// were missed while the link was down cannot outlive the outage. With
  /// stale serving enabled nothing is wiped; that incoherence window is
  /// the configured trade.
  pub(crate) fn clear_for_degraded(&self) {
    if self.reconnection.allow_stale_data {
      return;
    }
    self.loads.clear();
    self.store.lock().clear();
  }

  // Invalidations drop the in-flight load entry before the stored value,
  // so a delete racing a load can never lose: either the load's write-back
  // sees its entry gone, or the written value is deleted right here.

  pub(crate) fn apply_remote_reset(&self) {
    self.loads.clear();
    self.store.lock().clear();
  }

  pub(crate) fn apply_remote_delete(&self, key: &str) {
    self.loads.invalidate(key);
    self.store.lock().delete(key);
  }

  /// Publishes an invalidation to the other instances. Fire-and-forget:
  /// only while connected, and failures are logged, not surfaced.
  pub(crate) fn publish_invalidation(&self, message: Outbound<'_>) {
    if self.state.load() != ConnectionState::Connected {
      return;
    }
    let link = self.link.read();
    let Some(link) = link.as_ref() else {
      return;
    };
    let envelope = Envelope::new(message.encode())
      .with_header(protocol::CACHE_ID_HEADER, link.instance_id.clone());
    match link.publish_channel.publish(&self.exchange, envelope) {
      Ok(()) => {
        self.metrics.publishes.fetch_add(1, Ordering::Relaxed);
      }
      Err(error) => {
        tracing::warn!(error = %error, "invalidation publish failed");
      }
    }
  }

  pub(crate) fn install_link(&self, link: Link) {
    *self.link.write() = Some(link);
  }

  /// Best-effort teardown: cancel the consumer, close both channels, close
  /// the connection. Failures are logged and swallowed so closing during
  /// an outage still succeeds.
  pub(crate) async fn teardown_link(&self) {
    let link = self.link.write().take();
    let Some(link) = link else {
      return;
    };
    if let Err(error) = link.subscribe_channel.cancel(&link.instance_id).await {
      tracing::debug!(error = %error, queue = %link.queue, "consumer cancel during teardown failed");
    }
    let (subscribe, publish) = futures_util::future::join(
      link.subscribe_channel.close(),
      link.publish_channel.close(),
    )
    .await;
    for result in [subscribe, publish] {
      if let Err(error) = result {
        tracing::debug!(error = %error, "channel close during teardown failed");
      }
    }
    if let Err(error) = link.connection.close().await {
      tracing::debug!(error = %error, "connection close during teardown failed");
    }
  }

  /// The current instance id, if a link is up. Changes on every reconnect.
  pub(crate) fn instance_id(&self) -> Option<String> {
    self.link.read().as_ref().map(|link| link.instance_id.clone())
  }
}
