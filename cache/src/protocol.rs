use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use herd_broker::{BrokerError, Delivery, DeliveryHandler, Envelope};

use crate::shared::CacheShared;
use crate::supervisor::{self, OnceGate};

/// All caches with the same name share `<prefix>-<name>` as their fanout
/// exchange; instances of differently named caches never see each other.
pub(crate) const EXCHANGE_PREFIX: &str = "herd-cache";

/// Header carrying the publishing instance's id, used to ignore our own
/// messages.
pub(crate) const CACHE_ID_HEADER: &str = "x-cache-id";

const RESET_BODY: &str = "reset";
const DELETE_PREFIX: &str = "del:";

pub(crate) fn exchange_name(cache_name: &str) -> String {
  format!("{}-{}", EXCHANGE_PREFIX, cache_name)
}

pub(crate) fn queue_name(exchange: &str, instance_id: &str) -> String {
  format!("{}-{}", exchange, instance_id)
}

/// Outbound invalidation messages.
pub(crate) enum Outbound<'a> {
  Reset,
  Delete(&'a str),
}

impl Outbound<'_> {
  pub(crate) fn encode(&self) -> Vec<u8> {
    match self {
      Outbound::Reset => RESET_BODY.as_bytes().to_vec(),
      Outbound::Delete(key) => format!("{}{}", DELETE_PREFIX, key).into_bytes(),
    }
  }
}

/// Inbound classification. Unknown payloads are surfaced to listeners but
/// have no cache effect.
enum Inbound<'a> {
  Reset,
  Delete(&'a str),
  Unknown,
}

fn decode(content: &str) -> Inbound<'_> {
  if content == RESET_BODY {
    Inbound::Reset
  } else if let Some(key) = content.strip_prefix(DELETE_PREFIX) {
    Inbound::Delete(key)
  } else {
    Inbound::Unknown
  }
}

/// Builds the consumer callback for one link. The callback runs on the
/// broker's delivery task: it applies the message synchronously and never
/// blocks or suspends.
pub(crate) fn delivery_handler<V: Send + Sync + 'static>(
  shared: Weak<CacheShared<V>>,
  instance_id: String,
  gate: Arc<OnceGate>,
) -> DeliveryHandler {
  Arc::new(move |delivery| {
    let Some(shared) = shared.upgrade() else {
      return;
    };
    match delivery {
      Delivery::Message(envelope) => handle_message(&shared, &instance_id, envelope),
      Delivery::Cancelled => {
        tracing::warn!(instance = %instance_id, "consumer cancelled by the broker");
        supervisor::report_link_fault(
          &shared,
          &gate,
          BrokerError::ConsumerCancelled(instance_id.clone()),
        );
      }
    }
  })
}

fn handle_message<V: Send + Sync>(shared: &Arc<CacheShared<V>>, own_id: &str, envelope: Envelope) {
  // A missing publisher header is treated as some foreign party: the only
  // thing the id is for is recognizing our own publishes.
  let publisher = envelope.header(CACHE_ID_HEADER).unwrap_or("").to_string();
  if publisher == own_id {
    return;
  }
  let content = String::from_utf8_lossy(&envelope.body).into_owned();
  match decode(&content) {
    Inbound::Reset => shared.apply_remote_reset(),
    Inbound::Delete(key) => shared.apply_remote_delete(key),
    Inbound::Unknown => {
      tracing::debug!(body = %content, "unknown invalidation payload, no cache effect");
    }
  }
  shared
    .metrics
    .invalidations_received
    .fetch_add(1, Ordering::Relaxed);
  shared.events.emit_invalidation(&content, &publisher);
}
