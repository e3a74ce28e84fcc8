mod common;

use std::sync::Arc;
use std::time::Duration;

use herd_cache::{BoxError, CacheError, ConnectionState, MemoryBroker};
use tokio::sync::Notify;

use common::{connect_cache, wait_until, InvalidationProbe};

#[tokio::test]
async fn test_close_tears_down_and_is_idempotent() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("closing", &broker).await;
  cache.insert("k", "v".to_string()).unwrap();

  cache.close().await.unwrap();
  // Later calls are no-ops, not errors.
  cache.close().await.unwrap();

  assert_eq!(cache.connection_state(), ConnectionState::Closed);
  assert!(cache.instance_id().is_none());
  assert_eq!(broker.connection_count(), 0);
  assert!(broker.queue_names().is_empty(), "the exclusive queue is gone");
}

#[tokio::test]
async fn test_every_operation_fails_once_closed() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("fenced", &broker).await;
  let probe = InvalidationProbe::new();
  let id = cache.add_invalidation_listener(probe.clone()).unwrap();
  cache.close().await.unwrap();

  let message = "Cache is closing or has been closed";
  assert_eq!(cache.get("k").unwrap_err().to_string(), message);
  assert_eq!(cache.peek("k").unwrap_err().to_string(), message);
  assert_eq!(cache.has("k").unwrap_err().to_string(), message);
  assert_eq!(cache.keys().unwrap_err().to_string(), message);
  assert_eq!(
    cache.insert("k", "v".to_string()).unwrap_err().to_string(),
    message
  );
  assert_eq!(cache.invalidate("k").unwrap_err().to_string(), message);
  assert_eq!(cache.clear().unwrap_err().to_string(), message);
  assert_eq!(cache.purge_stale().unwrap_err().to_string(), message);
  assert_eq!(cache.size().unwrap_err().to_string(), message);
  assert_eq!(cache.max_entries().unwrap_err().to_string(), message);
  assert_eq!(cache.time_to_live().unwrap_err().to_string(), message);
  assert_eq!(cache.allows_stale().unwrap_err().to_string(), message);

  let error = cache
    .get_with("k", |_key: String| async move {
      panic!("the loader must not run on a closed cache")
    })
    .await
    .unwrap_err();
  assert!(matches!(error, CacheError::Closing));

  assert!(matches!(
    cache.add_invalidation_listener(probe).unwrap_err(),
    CacheError::Closing
  ));
  assert!(matches!(
    cache.remove_invalidation_listener(id).unwrap_err(),
    CacheError::Closing
  ));

  // The read-only surface stays available.
  assert_eq!(cache.name(), "fenced");
  assert_eq!(cache.connection_state(), ConnectionState::Closed);
  let _ = cache.metrics();
}

#[tokio::test]
async fn test_close_during_an_outage_succeeds() {
  let broker = MemoryBroker::new();
  let cache = connect_cache("stuck", &broker).await;

  broker.set_online(false);
  broker.drop_connections();
  wait_until("the cache starts reconnecting", || {
    cache.connection_state() == ConnectionState::Reconnecting
  })
  .await;

  cache.close().await.unwrap();
  assert_eq!(cache.connection_state(), ConnectionState::Closed);

  // Even once the broker is back, a closed cache never reconnects.
  broker.set_online(true);
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_in_flight_load_completes_but_is_discarded() {
  let broker = MemoryBroker::new();
  let cache = Arc::new(connect_cache("draining", &broker).await);
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
          Ok::<_, BoxError>(Some("too-late".to_string()))
        })
        .await
    }
  });

  entered.notified().await;
  cache.close().await.unwrap();
  release.notify_one();

  // The caller that was already past the gate still gets its value.
  let result = task.await.unwrap().unwrap();
  assert_eq!(result.as_deref().map(String::as_str), Some("too-late"));
  assert_eq!(cache.metrics().inserts, 0, "nothing is written back after close");
}
