use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::try_join;
use herd_broker::{BrokerError, Channel, Connection, ConnectionEvent, QueueOptions};
use tokio::sync::broadcast;

use crate::events::ReconnectEvent;
use crate::protocol;
use crate::shared::{CacheShared, Link};

/// Connection lifecycle as observed by cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  /// Initial connect in progress; no operations have run yet.
  Connecting,
  /// Invalidations flow; all operations behave normally.
  Connected,
  /// The link is down and being rebuilt. Reads and writes are parked
  /// unless the cache was configured to serve stale data.
  Reconnecting,
  /// `close()` has begun. Terminal; every operation fails from here on.
  Closed,
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
  pub(crate) fn new(state: ConnectionState) -> Self {
    Self(AtomicU8::new(state as u8))
  }

  pub(crate) fn load(&self) -> ConnectionState {
    match self.0.load(Ordering::Acquire) {
      0 => ConnectionState::Connecting,
      1 => ConnectionState::Connected,
      2 => ConnectionState::Reconnecting,
      _ => ConnectionState::Closed,
    }
  }

  pub(crate) fn store(&self, state: ConnectionState) {
    self.0.store(state as u8, Ordering::Release);
  }

  /// Transitions unless the cache has been closed; `Closed` is terminal
  /// and must never be overwritten by a racing reconnect.
  pub(crate) fn store_unless_closed(&self, state: ConnectionState) -> bool {
    let closed = ConnectionState::Closed as u8;
    let mut current = self.0.load(Ordering::Acquire);
    loop {
      if current == closed {
        return false;
      }
      match self
        .0
        .compare_exchange_weak(current, state as u8, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return true,
        Err(observed) => current = observed,
      }
    }
  }

  /// Marks the cache closed. True only for the caller that actually made
  /// the transition.
  pub(crate) fn close(&self) -> bool {
    self.0.swap(ConnectionState::Closed as u8, Ordering::AcqRel) != ConnectionState::Closed as u8
  }
}

/// One-shot trigger shared by a link's event watcher and its consumer
/// callback: however a link dies, the failure is handled exactly once.
pub(crate) struct OnceGate(AtomicBool);

impl OnceGate {
  pub(crate) fn new() -> Self {
    Self(AtomicBool::new(false))
  }

  /// True for exactly one caller.
  pub(crate) fn fire(&self) -> bool {
    !self.0.swap(true, Ordering::AcqRel)
  }
}

/// Connects and builds the invalidation topology: a fresh instance id, the
/// shared fanout exchange, this instance's exclusive queue, a no-ack
/// consumer, and a watcher for connection failures.
pub(crate) async fn open_link<V: Send + Sync + 'static>(
  shared: &Arc<CacheShared<V>>,
) -> Result<(), BrokerError> {
  let connection: Arc<dyn Connection> = Arc::from(shared.broker.connect().await?);
  // Subscribe before using the connection; earlier events are not replayed.
  let events = connection.events();
  let (publish_channel, subscribe_channel) =
    try_join(connection.create_channel(), connection.create_channel()).await?;
  let publish_channel: Arc<dyn Channel> = Arc::from(publish_channel);
  let subscribe_channel: Arc<dyn Channel> = Arc::from(subscribe_channel);

  let instance_id = uuid::Uuid::new_v4().to_string();
  let queue = protocol::queue_name(&shared.exchange, &instance_id);

  publish_channel
    .declare_fanout_exchange(&shared.exchange)
    .await?;
  subscribe_channel
    .declare_queue(
      &queue,
      QueueOptions {
        durable: false,
        exclusive: true,
        auto_delete: true,
      },
    )
    .await?;
  subscribe_channel.bind_queue(&queue, &shared.exchange).await?;

  let gate = Arc::new(OnceGate::new());
  let handler = protocol::delivery_handler(Arc::downgrade(shared), instance_id.clone(), gate.clone());
  subscribe_channel.consume(&queue, &instance_id, handler).await?;

  tracing::debug!(exchange = %shared.exchange, queue = %queue, "invalidation link established");
  shared.install_link(Link {
    instance_id,
    queue,
    connection,
    publish_channel,
    subscribe_channel,
  });
  spawn_watcher(Arc::downgrade(shared), events, gate);
  Ok(())
}

/// Routes a link failure into the reconnection loop, if this gate has not
/// fired yet. Used by the consumer callback for broker-side cancellation.
pub(crate) fn report_link_fault<V: Send + Sync + 'static>(
  shared: &Arc<CacheShared<V>>,
  gate: &OnceGate,
  error: BrokerError,
) {
  if !gate.fire() {
    return;
  }
  let weak = Arc::downgrade(shared);
  tokio::spawn(async move {
    reconnect_loop(weak, error).await;
  });
}

/// Watches one connection's lifecycle events. The first error or close to
/// pass the gate becomes a reconnect; everything after that belongs to the
/// next link's watcher.
fn spawn_watcher<V: Send + Sync + 'static>(
  weak: Weak<CacheShared<V>>,
  mut events: broadcast::Receiver<ConnectionEvent>,
  gate: Arc<OnceGate>,
) {
  tokio::spawn(async move {
    loop {
      let error = match events.recv().await {
        Ok(ConnectionEvent::Error(error)) => error,
        Ok(ConnectionEvent::Closed) => BrokerError::ConnectionClosed,
        Err(broadcast::error::RecvError::Closed) => BrokerError::ConnectionClosed,
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
      };
      if gate.fire() {
        reconnect_loop(weak, error).await;
      }
      return;
    }
  });
}

/// Retries forever with capped exponential backoff. The first attempt runs
/// immediately; the loop sleeps only after a failed attempt. Stops early
/// when the cache is closed or dropped.
async fn reconnect_loop<V: Send + Sync + 'static>(weak: Weak<CacheShared<V>>, error: BrokerError) {
  {
    let Some(shared) = weak.upgrade() else {
      return;
    };
    if !shared.state.store_unless_closed(ConnectionState::Reconnecting) {
      return;
    }
    // Wipe before the first await: once the state reads Reconnecting,
    // keys()/size() must not list pre-outage entries.
    shared.clear_for_degraded();
    // Usually the old connection is already dead and every call here fails
    // fast, but a consumer-level fault leaves it open; close it for real.
    shared.teardown_link().await;
    tracing::warn!(error = %error, name = %shared.name, "invalidation link lost, reconnecting");
  }

  let mut last_error = error;
  let mut attempt: u64 = 0;
  loop {
    let Some(shared) = weak.upgrade() else {
      return;
    };
    if shared.state.load() == ConnectionState::Closed {
      return;
    }
    let interval = shared.reconnection.interval_for(attempt);
    attempt += 1;
    // Entries whose invalidations were missed during the outage must not
    // survive it.
    shared.clear_for_degraded();
    shared.events.emit_reconnecting(&ReconnectEvent {
      error: last_error.clone(),
      attempt,
      retry_interval: interval,
    });

    match open_link(&shared).await {
      Ok(()) => {
        shared.clear_for_degraded();
        if !shared.state.store_unless_closed(ConnectionState::Connected) {
          // close() won the race; tear the fresh link down again.
          shared.teardown_link().await;
          return;
        }
        shared.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
        shared.events.emit_reconnected(&ReconnectEvent {
          error: last_error.clone(),
          attempt,
          retry_interval: interval,
        });
        tracing::info!(name = %shared.name, attempt, "invalidation link restored");
        return;
      }
      Err(error) => {
        tracing::error!(error = %error, attempt, retry_in_ms = interval.as_millis() as u64, "reconnect attempt failed");
        last_error = error;
        // Do not pin the cache alive while sleeping.
        drop(shared);
        tokio::time::sleep(interval).await;
      }
    }
  }
}
