use thiserror::Error;

/// Errors reported by broker implementations.
///
/// Cloneable so a single transport failure can be fanned out to every party
/// observing the connection (lifecycle watchers, reconnect events).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
  /// The broker refused or could not accept a new connection.
  #[error("broker is unreachable: {0}")]
  Unreachable(String),

  /// An established connection failed underneath its owner.
  #[error("connection lost: {0}")]
  ConnectionLost(String),

  /// The connection was closed and can no longer be used.
  #[error("connection is closed")]
  ConnectionClosed,

  /// The channel was closed and can no longer be used.
  #[error("channel is closed")]
  ChannelClosed,

  /// An operation referenced an exchange that was never declared.
  #[error("unknown exchange: {0}")]
  UnknownExchange(String),

  /// An operation referenced a queue that was never declared.
  #[error("unknown queue: {0}")]
  UnknownQueue(String),

  /// The queue exists but is held exclusively by another connection.
  #[error("queue is locked by another connection: {0}")]
  QueueLocked(String),

  /// The broker cancelled the consumer, typically because its queue was
  /// deleted out from under it.
  #[error("consumer was cancelled by the broker: {0}")]
  ConsumerCancelled(String),
}
