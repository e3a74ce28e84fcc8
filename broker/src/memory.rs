use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::error::BrokerError;
use crate::link::{
  Broker, Channel, Connection, ConnectionEvent, Delivery, DeliveryHandler, Envelope, QueueOptions,
};

/// In-process broker: a shared fanout hub with per-queue FIFO delivery.
///
/// Clones share the same hub, so handing clones to several components wires
/// them to one bus. Besides implementing [`Broker`], it exposes control
/// hooks (`set_online`, `drop_connections`, `delete_queue`, `raw_publish`)
/// used to simulate broker-side failures in tests and examples.
#[derive(Clone)]
pub struct MemoryBroker {
  hub: Arc<Hub>,
}

struct Hub {
  state: Mutex<HubState>,
  online: AtomicBool,
  publishes: AtomicU64,
  next_connection: AtomicU64,
}

#[derive(Default)]
struct HubState {
  /// exchange name -> bound queue names
  exchanges: HashMap<String, Vec<String>>,
  queues: HashMap<String, QueueSlot>,
  connections: HashMap<u64, Arc<ConnectionCore>>,
}

struct QueueSlot {
  owner: u64,
  options: QueueOptions,
  feed: mpsc::UnboundedSender<QueueSignal>,
  /// Receiving half, parked here until a consumer starts. Messages
  /// published before `consume` are buffered in the channel.
  inbox: Option<mpsc::UnboundedReceiver<QueueSignal>>,
  consumer_tag: Option<String>,
}

enum QueueSignal {
  Deliver(Envelope),
  /// Broker-side cancellation: the consumer is told, then stopped.
  Cancel,
  /// Silent teardown of the dispatch task.
  Stop,
}

struct ConnectionCore {
  id: u64,
  hub: Arc<Hub>,
  events: broadcast::Sender<ConnectionEvent>,
  closed: AtomicBool,
}

struct MemoryConnection {
  core: Arc<ConnectionCore>,
}

struct MemoryChannel {
  core: Arc<ConnectionCore>,
  open: AtomicBool,
}

impl MemoryBroker {
  pub fn new() -> Self {
    Self {
      hub: Arc::new(Hub {
        state: Mutex::new(HubState::default()),
        online: AtomicBool::new(true),
        publishes: AtomicU64::new(0),
        next_connection: AtomicU64::new(0),
      }),
    }
  }

  /// Gates new connections. Existing connections are unaffected; pair with
  /// [`drop_connections`](Self::drop_connections) to simulate a full outage.
  pub fn set_online(&self, online: bool) {
    self.hub.online.store(online, Ordering::Release);
  }

  pub fn is_online(&self) -> bool {
    self.hub.online.load(Ordering::Acquire)
  }

  /// Fails every live connection: each observes an `Error` event followed
  /// by `Closed`, and its exclusive queues are removed.
  pub fn drop_connections(&self) {
    let ids: Vec<u64> = self.hub.state.lock().connections.keys().copied().collect();
    for id in ids {
      self.hub.teardown_connection(
        id,
        Some(BrokerError::ConnectionLost(
          "connection dropped by broker".to_string(),
        )),
      );
    }
  }

  /// Deletes a queue out from under its consumer, which observes
  /// [`Delivery::Cancelled`]. Returns false if the queue does not exist.
  pub fn delete_queue(&self, queue: &str) -> bool {
    let mut state = self.hub.state.lock();
    let Some(slot) = state.queues.remove(queue) else {
      return false;
    };
    for bound in state.exchanges.values_mut() {
      bound.retain(|name| name != queue);
    }
    let _ = slot.feed.send(QueueSignal::Cancel);
    tracing::debug!(queue, "queue deleted administratively");
    true
  }

  /// Publishes without a connection, as some foreign party on the bus
  /// would.
  pub fn raw_publish(&self, exchange: &str, envelope: Envelope) -> Result<(), BrokerError> {
    self.hub.fanout(exchange, envelope)
  }

  /// Total messages fanned out through this hub.
  pub fn publish_count(&self) -> u64 {
    self.hub.publishes.load(Ordering::Relaxed)
  }

  pub fn queue_names(&self) -> Vec<String> {
    self.hub.state.lock().queues.keys().cloned().collect()
  }

  pub fn connection_count(&self) -> usize {
    self.hub.state.lock().connections.len()
  }
}

impl Default for MemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl Hub {
  fn fanout(&self, exchange: &str, envelope: Envelope) -> Result<(), BrokerError> {
    let state = self.state.lock();
    let Some(bound) = state.exchanges.get(exchange) else {
      return Err(BrokerError::UnknownExchange(exchange.to_string()));
    };
    for queue in bound {
      if let Some(slot) = state.queues.get(queue) {
        let _ = slot.feed.send(QueueSignal::Deliver(envelope.clone()));
      }
    }
    drop(state);
    self.publishes.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  /// Removes a connection and its exclusive/auto-delete queues, then emits
  /// lifecycle events. `failure` distinguishes a broker-side drop from a
  /// local close.
  fn teardown_connection(&self, id: u64, failure: Option<BrokerError>) {
    let core = {
      let mut state = self.state.lock();
      let Some(core) = state.connections.remove(&id) else {
        return;
      };
      let owned: Vec<String> = state
        .queues
        .iter()
        .filter(|(_, slot)| {
          slot.owner == id && (slot.options.exclusive || slot.options.auto_delete)
        })
        .map(|(name, _)| name.clone())
        .collect();
      for name in owned {
        if let Some(slot) = state.queues.remove(&name) {
          let _ = slot.feed.send(QueueSignal::Stop);
        }
        for bound in state.exchanges.values_mut() {
          bound.retain(|queue| queue != &name);
        }
      }
      core
    };
    core.closed.store(true, Ordering::Release);
    if let Some(error) = failure {
      let _ = core.events.send(ConnectionEvent::Error(error));
    }
    let _ = core.events.send(ConnectionEvent::Closed);
    tracing::debug!(connection = id, "memory broker connection torn down");
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError> {
    if !self.hub.online.load(Ordering::Acquire) {
      return Err(BrokerError::Unreachable("memory broker is offline".to_string()));
    }
    let id = self.hub.next_connection.fetch_add(1, Ordering::Relaxed);
    let (events, _) = broadcast::channel(16);
    let core = Arc::new(ConnectionCore {
      id,
      hub: self.hub.clone(),
      events,
      closed: AtomicBool::new(false),
    });
    self.hub.state.lock().connections.insert(id, core.clone());
    tracing::debug!(connection = id, "memory broker connection opened");
    Ok(Box::new(MemoryConnection { core }))
  }
}

#[async_trait]
impl Connection for MemoryConnection {
  async fn create_channel(&self) -> Result<Box<dyn Channel>, BrokerError> {
    if self.core.closed.load(Ordering::Acquire) {
      return Err(BrokerError::ConnectionClosed);
    }
    Ok(Box::new(MemoryChannel {
      core: self.core.clone(),
      open: AtomicBool::new(true),
    }))
  }

  fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.core.events.subscribe()
  }

  async fn close(&self) -> Result<(), BrokerError> {
    self.core.hub.teardown_connection(self.core.id, None);
    Ok(())
  }
}

impl MemoryChannel {
  fn ensure_open(&self) -> Result<(), BrokerError> {
    if !self.open.load(Ordering::Acquire) {
      return Err(BrokerError::ChannelClosed);
    }
    if self.core.closed.load(Ordering::Acquire) {
      return Err(BrokerError::ConnectionClosed);
    }
    Ok(())
  }
}

#[async_trait]
impl Channel for MemoryChannel {
  async fn declare_fanout_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
    self.ensure_open()?;
    self
      .core
      .hub
      .state
      .lock()
      .exchanges
      .entry(exchange.to_string())
      .or_default();
    Ok(())
  }

  async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
    self.ensure_open()?;
    let mut state = self.core.hub.state.lock();
    if let Some(existing) = state.queues.get(queue) {
      if existing.owner != self.core.id && (existing.options.exclusive || options.exclusive) {
        return Err(BrokerError::QueueLocked(queue.to_string()));
      }
      return Ok(());
    }
    let (feed, inbox) = mpsc::unbounded_channel();
    state.queues.insert(
      queue.to_string(),
      QueueSlot {
        owner: self.core.id,
        options,
        feed,
        inbox: Some(inbox),
        consumer_tag: None,
      },
    );
    Ok(())
  }

  async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
    self.ensure_open()?;
    let mut state = self.core.hub.state.lock();
    if !state.queues.contains_key(queue) {
      return Err(BrokerError::UnknownQueue(queue.to_string()));
    }
    let Some(bound) = state.exchanges.get_mut(exchange) else {
      return Err(BrokerError::UnknownExchange(exchange.to_string()));
    };
    if !bound.iter().any(|name| name == queue) {
      bound.push(queue.to_string());
    }
    Ok(())
  }

  async fn consume(
    &self,
    queue: &str,
    consumer_tag: &str,
    handler: DeliveryHandler,
  ) -> Result<(), BrokerError> {
    self.ensure_open()?;
    let mut inbox = {
      let mut state = self.core.hub.state.lock();
      let Some(slot) = state.queues.get_mut(queue) else {
        return Err(BrokerError::UnknownQueue(queue.to_string()));
      };
      let Some(inbox) = slot.inbox.take() else {
        return Err(BrokerError::QueueLocked(queue.to_string()));
      };
      slot.consumer_tag = Some(consumer_tag.to_string());
      inbox
    };
    let queue_name = queue.to_string();
    tokio::spawn(async move {
      while let Some(signal) = inbox.recv().await {
        match signal {
          QueueSignal::Deliver(envelope) => handler(Delivery::Message(envelope)),
          QueueSignal::Cancel => {
            handler(Delivery::Cancelled);
            break;
          }
          QueueSignal::Stop => break,
        }
      }
      tracing::debug!(queue = %queue_name, "consumer dispatch stopped");
    });
    Ok(())
  }

  async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
    self.ensure_open()?;
    let state = self.core.hub.state.lock();
    for slot in state.queues.values() {
      if slot.owner == self.core.id && slot.consumer_tag.as_deref() == Some(consumer_tag) {
        // A locally cancelled consumer just stops; only broker-side
        // cancellation notifies the handler.
        let _ = slot.feed.send(QueueSignal::Stop);
        return Ok(());
      }
    }
    Ok(())
  }

  fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), BrokerError> {
    self.ensure_open()?;
    self.core.hub.fanout(exchange, envelope)
  }

  async fn close(&self) -> Result<(), BrokerError> {
    self.open.store(false, Ordering::Release);
    Ok(())
  }
}
