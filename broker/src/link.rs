use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BrokerError;

/// A message as published to an exchange and delivered to bound queues.
#[derive(Debug, Clone)]
pub struct Envelope {
  pub body: Vec<u8>,
  pub headers: HashMap<String, String>,
}

impl Envelope {
  pub fn new(body: impl Into<Vec<u8>>) -> Self {
    Self {
      body: body.into(),
      headers: HashMap::new(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).map(String::as_str)
  }
}

/// What a consumer callback receives for each event on its queue.
#[derive(Debug, Clone)]
pub enum Delivery {
  /// A message routed to the queue.
  Message(Envelope),
  /// The broker dropped the consumer, e.g. because the queue was deleted.
  /// No further deliveries will arrive for this consumer.
  Cancelled,
}

/// Callback invoked for every delivery on a consumer. Runs on a
/// broker-owned task and must not block.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Lifecycle events observed on an open connection. A locally initiated
/// [`Connection::close`] also emits `Closed`.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
  /// The transport reported a failure. The connection is unusable.
  Error(BrokerError),
  /// The connection was closed, by either side.
  Closed,
}

/// Declaration options for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
  /// Queue survives a broker restart. Never used by the cache topology.
  pub durable: bool,
  /// Queue is private to the declaring connection.
  pub exclusive: bool,
  /// Queue is removed once its connection or last consumer goes away.
  pub auto_delete: bool,
}

/// Entry point to a broker: hands out connections.
///
/// Implementations carry their own endpoint and authentication
/// configuration; callers only ask for a connection.
#[async_trait]
pub trait Broker: Send + Sync {
  async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError>;
}

/// One open connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync {
  /// Opens a channel multiplexed over this connection.
  async fn create_channel(&self) -> Result<Box<dyn Channel>, BrokerError>;

  /// Subscribes to lifecycle events. Events emitted before the returned
  /// receiver exists are not replayed, so subscribe before relying on the
  /// connection.
  fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

  /// Closes the connection and every channel created from it.
  async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel: the unit on which topology is declared and messages flow.
#[async_trait]
pub trait Channel: Send + Sync {
  /// Declares a fanout exchange. Idempotent.
  async fn declare_fanout_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

  /// Declares a queue. Redeclaring an existing queue from its owning
  /// connection is a no-op.
  async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

  /// Binds a queue to a fanout exchange. No routing key: every message
  /// published to the exchange reaches every bound queue.
  async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError>;

  /// Starts an exclusive, auto-acknowledging consumer on the queue.
  /// Deliveries are pushed to `handler` in queue order.
  async fn consume(
    &self,
    queue: &str,
    consumer_tag: &str,
    handler: DeliveryHandler,
  ) -> Result<(), BrokerError>;

  /// Stops the consumer with the given tag. Unknown tags are ignored.
  async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

  /// Publishes to every queue bound to the exchange. Fire-and-forget:
  /// returns once the message is handed to the broker, never suspends.
  fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), BrokerError>;

  /// Closes the channel. The connection stays open.
  async fn close(&self) -> Result<(), BrokerError>;
}
