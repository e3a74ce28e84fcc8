//! Broker seam for the herd cache: connections, channels and fanout
//! topology behind object-safe async traits, plus an in-process
//! [`MemoryBroker`] implementation.
//!
//! The trait surface is the minimal slice of an AMQP-style broker the
//! cache's invalidation protocol needs: fanout exchanges, exclusive
//! auto-delete queues, no-ack consumers and fire-and-forget publishes.
//! Bindings to a real broker implement [`Broker`], [`Connection`] and
//! [`Channel`]; `MemoryBroker` serves tests, examples and single-process
//! deployments, and can simulate broker-side failures on demand.

pub mod error;
pub mod link;
pub mod memory;

pub use error::BrokerError;
pub use link::{
  Broker, Channel, Connection, ConnectionEvent, Delivery, DeliveryHandler, Envelope, QueueOptions,
};
pub use memory::MemoryBroker;
