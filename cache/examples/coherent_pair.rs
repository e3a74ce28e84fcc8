// Two cache instances on one bus: local writes, broadcast invalidations,
// and a simulated broker outage. Run with RUST_LOG=debug to watch the
// supervisor work.
use std::sync::Arc;
use std::time::Duration;

use herd_cache::{
  BoxError, CacheBuilder, InvalidationListener, MemoryBroker, ReconnectEvent,
  ReconnectedListener, ReconnectingListener,
};

struct Announcer(&'static str);

impl InvalidationListener for Announcer {
  fn on_invalidation(&self, content: &str, publisher_id: &str) {
    println!("[{}] message \"{}\" from {}", self.0, content, publisher_id);
  }
}

impl ReconnectingListener for Announcer {
  fn on_reconnecting(&self, event: &ReconnectEvent) {
    println!(
      "[{}] reconnecting (attempt {}, retry in {:?}): {}",
      self.0, event.attempt, event.retry_interval, event.error
    );
  }
}

impl ReconnectedListener for Announcer {
  fn on_reconnected(&self, event: &ReconnectEvent) {
    println!("[{}] reconnected on attempt {}", self.0, event.attempt);
  }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    )
    .init();

  let broker = MemoryBroker::new();

  println!("--- Two caches, one bus ---");
  let writer = CacheBuilder::new("products")
    .max_entries(1_000)
    .connect(Arc::new(broker.clone()))
    .await?;
  let reader = CacheBuilder::new("products")
    .max_entries(1_000)
    .connect(Arc::new(broker.clone()))
    .await?;
  let announcer = Arc::new(Announcer("reader"));
  reader.add_invalidation_listener(announcer.clone())?;
  reader.add_reconnecting_listener(announcer.clone())?;
  reader.add_reconnected_listener(announcer)?;

  writer.insert("sku:1", "hammer".to_string())?;
  reader.insert("sku:1", "hammer".to_string())?;
  println!("[writer] and [reader] both hold sku:1");

  let value = reader
    .get_with("sku:2", |key| async move {
      println!("[reader] loading {} from the backing store", key);
      Ok::<_, BoxError>(Some("wrench".to_string()))
    })
    .await?;
  println!("[reader] loaded sku:2 = {:?}", value.as_deref());

  println!("\n--- Invalidation fans out ---");
  writer.invalidate("sku:1")?;
  tokio::time::sleep(Duration::from_millis(50)).await;
  println!("[reader] still holds sku:1: {}", reader.has("sku:1")?);

  println!("\n--- Broker outage ---");
  broker.drop_connections();
  tokio::time::sleep(Duration::from_millis(100)).await;
  println!(
    "[reader] healed with a fresh identity: {:?}",
    reader.instance_id()
  );
  println!(
    "[reader] sku:2 after the outage: {:?} (wiped, coherence first)",
    reader.get("sku:2")?.as_deref()
  );
  println!("[reader] metrics: {:?}", reader.metrics());

  writer.close().await?;
  reader.close().await?;
  Ok(())
}
