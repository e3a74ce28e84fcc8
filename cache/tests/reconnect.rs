mod common;

use std::sync::Arc;
use std::time::Duration;

use herd_cache::{
  BoxError, BrokerError, CacheBuilder, CacheError, ConnectionState, MemoryBroker,
};
use tokio::sync::Notify;

use common::{connect_cache, wait_until, ReconnectProbe};

#[tokio::test]
async fn test_initial_connect_failure_is_surfaced() {
  let broker = MemoryBroker::new();
  broker.set_online(false);

  let result = CacheBuilder::<String>::new("unreachable")
    .connect(Arc::new(broker.clone()))
    .await;

  assert!(matches!(
    result,
    Err(CacheError::Broker(BrokerError::Unreachable(_)))
  ));
  assert_eq!(broker.connection_count(), 0, "nothing is retried at startup");
}

#[tokio::test]
async fn test_dropped_connection_heals_with_a_fresh_identity() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("self-heal", &broker).await;
  let probe = ReconnectProbe::new();
  probe.attach(&cache);
  let first_id = cache.instance_id().expect("connected cache has an id");

  broker.drop_connections();

  wait_until("the link is restored", || cache.metrics().reconnects == 1).await;
  assert_eq!(cache.connection_state(), ConnectionState::Connected);

  // The broker was reachable the whole time, so the first attempt won.
  let reconnecting = probe.reconnecting();
  let reconnected = probe.reconnected();
  assert_eq!(reconnecting.len(), 1);
  assert_eq!(reconnected.len(), 1);
  assert_eq!(reconnecting[0].attempt, 1);
  assert_eq!(reconnecting[0].retry_interval, Duration::from_millis(10));
  assert!(matches!(reconnecting[0].error, BrokerError::ConnectionLost(_)));
  assert_eq!(reconnected[0].attempt, 1);
  assert_eq!(reconnected[0].retry_interval, Duration::from_millis(10));

  // Reconnecting mints a new instance id and with it a new queue.
  let second_id = cache.instance_id().expect("connected cache has an id");
  assert_ne!(first_id, second_id);
  assert_eq!(
    broker.queue_names(),
    vec![format!("herd-cache-self-heal-{}", second_id)]
  );
  assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn test_backoff_follows_the_retry_policy() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("backoff", &broker).await;
  let probe = ReconnectProbe::new();
  probe.attach(&cache);

  broker.set_online(false);
  broker.drop_connections();
  wait_until("several attempts fail", || probe.reconnecting().len() >= 4).await;
  broker.set_online(true);
  wait_until("the link is restored", || cache.metrics().reconnects == 1).await;

  // 10ms base, factor 2, capped at 40ms.
  let events = probe.reconnecting();
  for (index, event) in events.iter().enumerate() {
    assert_eq!(event.attempt, (index + 1) as u64, "attempts count up from one");
  }
  assert_eq!(events[0].retry_interval, Duration::from_millis(10));
  assert_eq!(events[1].retry_interval, Duration::from_millis(20));
  assert_eq!(events[2].retry_interval, Duration::from_millis(40));
  assert_eq!(
    events[3].retry_interval,
    Duration::from_millis(40),
    "intervals stay capped at the configured max"
  );

  // The first attempt reports the failure that started the outage; later
  // ones report the most recent connect error.
  assert!(matches!(events[0].error, BrokerError::ConnectionLost(_)));
  assert!(matches!(events[1].error, BrokerError::Unreachable(_)));

  // The reconnected event mirrors the attempt that succeeded.
  let reconnected = probe.reconnected();
  assert_eq!(reconnected.len(), 1);
  let winning = events.last().unwrap();
  assert_eq!(reconnected[0].attempt, winning.attempt);
  assert_eq!(reconnected[0].retry_interval, winning.retry_interval);
}

#[tokio::test]
async fn test_outage_clears_the_store_and_parks_operations() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("strict", &broker).await;
  cache.insert("k", "v".to_string()).unwrap();
  let publishes_before = broker.publish_count();

  broker.set_online(false);
  broker.drop_connections();
  wait_until("the store is wiped", || cache.size().unwrap() == 0).await;
  assert_eq!(cache.connection_state(), ConnectionState::Reconnecting);

  // Reads and writes are parked while coherence cannot be guaranteed.
  assert!(cache.get("k").unwrap().is_none());
  assert!(cache.peek("k").unwrap().is_none());
  assert!(!cache.has("k").unwrap());
  assert!(!cache.insert("k2", "x".to_string()).unwrap());
  assert!(!cache.has("k2").unwrap());

  // Invalidations still succeed locally but nothing is broadcast.
  cache.invalidate("k").unwrap();
  assert_eq!(broker.publish_count(), publishes_before);

  broker.set_online(true);
  wait_until("the link is restored", || cache.metrics().reconnects == 1).await;
  assert!(cache.insert("k3", "y".to_string()).unwrap());
  assert!(cache.has("k3").unwrap());
}

#[tokio::test]
async fn test_reconnecting_state_never_exposes_pre_outage_entries() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("window", &broker).await;
  cache.insert("a", "1".to_string()).unwrap();
  cache.insert("b", "2".to_string()).unwrap();

  // Keep the broker unreachable so the loop parks in Reconnecting instead
  // of healing straight away.
  broker.set_online(false);
  broker.drop_connections();
  wait_until("the cache starts reconnecting", || {
    cache.connection_state() == ConnectionState::Reconnecting
  })
  .await;

  // The wipe lands together with the state flip: the moment Reconnecting
  // is observable, introspection already reports an empty store.
  assert_eq!(cache.size().unwrap(), 0);
  assert!(cache.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_outage_serves_stale_data_when_allowed() {
  let broker = MemoryBroker::new();
  let cache = CacheBuilder::new("relaxed")
    .allow_stale_data(true)
    .retry_min_interval(Duration::from_millis(10))
    .retry_max_interval(Duration::from_millis(40))
    .connect(Arc::new(broker.clone()))
    .await
    .unwrap();
  cache.insert("k", "v".to_string()).unwrap();

  broker.set_online(false);
  broker.drop_connections();
  wait_until("the cache starts reconnecting", || {
    cache.connection_state() == ConnectionState::Reconnecting
  })
  .await;

  // Entries survive the outage and reads keep flowing.
  let value = cache.get("k").unwrap();
  assert_eq!(value.as_deref().map(String::as_str), Some("v"));
  assert!(cache.insert("k2", "w".to_string()).unwrap());

  broker.set_online(true);
  wait_until("the link is restored", || cache.metrics().reconnects == 1).await;
  assert!(cache.has("k").unwrap(), "reconnecting must not wipe a stale-tolerant cache");
  assert!(cache.has("k2").unwrap());
}

#[tokio::test]
async fn test_load_finishing_during_an_outage_is_not_cached() {
  let broker = MemoryBroker::new();
  let cache = Arc::new(connect_cache("mid-load", &broker).await);
  let entered = Arc::new(Notify::new());
  let release = Arc::new(Notify::new());

  let task = tokio::spawn({
    let cache = cache.clone();
    let entered = entered.clone();
    let release = release.clone();
    async move {
      cache
        .get_with("k", move |_key| async move {
          entered.notify_one();
          release.notified().await;
          Ok::<_, BoxError>(Some("late".to_string()))
        })
        .await
    }
  });

  entered.notified().await;
  broker.set_online(false);
  broker.drop_connections();
  wait_until("the cache starts reconnecting", || {
    cache.connection_state() == ConnectionState::Reconnecting
  })
  .await;
  release.notify_one();

  // The caller still gets its value, but it is not written back.
  let result = task.await.unwrap().unwrap();
  assert_eq!(result.as_deref().map(String::as_str), Some("late"));

  broker.set_online(true);
  wait_until("the link is restored", || cache.metrics().reconnects == 1).await;
  assert!(!cache.has("k").unwrap());
}

#[tokio::test]
async fn test_broker_side_consumer_cancel_triggers_a_reconnect() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("cancelled", &broker).await;
  let probe = ReconnectProbe::new();
  probe.attach(&cache);
  let first_id = cache.instance_id().expect("connected cache has an id");

  assert!(broker.delete_queue(&format!("herd-cache-cancelled-{}", first_id)));

  wait_until("the link is restored", || cache.metrics().reconnects == 1).await;
  assert!(matches!(
    probe.reconnecting()[0].error,
    BrokerError::ConsumerCancelled(_)
  ));
  assert_ne!(cache.instance_id().unwrap(), first_id);
  // The cancelled link's connection was closed, not leaked.
  assert_eq!(broker.connection_count(), 1);
}
