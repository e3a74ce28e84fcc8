use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use generational_arena::{Arena, Index};

/// Configuration for the bundled [`LruStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
  /// Capacity in entries; `None` means unbounded.
  pub max_entries: Option<usize>,
  /// Time-to-live from the moment a value is written; `None` disables
  /// expiry.
  pub time_to_live: Option<Duration>,
  /// When true, a read of an expired entry returns the stale value one
  /// last time before the entry is dropped.
  pub allow_stale: bool,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      max_entries: None,
      time_to_live: None,
      allow_stale: false,
    }
  }
}

/// The local storage seam behind the cache facade.
///
/// Implementations are single-owner: the cache wraps the store in a mutex
/// and calls it from short critical sections, so no internal locking is
/// required. Values travel as `Arc<V>` so reads never clone the payload.
pub trait LocalStore<V>: Send {
  /// Recency-updating read. Expired entries are dropped here; with
  /// `allow_stale` the dropped value is still returned this one time.
  fn get(&mut self, key: &str) -> Option<Arc<V>>;

  /// Read without touching recency and without dropping expired entries.
  fn peek(&self, key: &str) -> Option<Arc<V>>;

  fn set(&mut self, key: String, value: Arc<V>);

  /// Returns true if the key was present.
  fn delete(&mut self, key: &str) -> bool;

  fn clear(&mut self);

  /// Non-stale presence check; never mutates.
  fn has(&self, key: &str) -> bool;

  /// Every present key, including expired entries not yet swept.
  fn keys(&self) -> Vec<String>;

  /// Drops every expired entry.
  fn purge_stale(&mut self);

  /// Entry count, including expired entries not yet swept.
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn max_entries(&self) -> Option<usize>;

  fn time_to_live(&self) -> Option<Duration>;

  fn allow_stale(&self) -> bool;
}

struct Node {
  key: String,
  prev: Option<Index>,
  next: Option<Index>,
}

/// Doubly-linked recency list over an arena. Head is most recently used,
/// tail is the eviction candidate.
struct RecencyList {
  nodes: Arena<Node>,
  head: Option<Index>,
  tail: Option<Index>,
}

impl RecencyList {
  fn new() -> Self {
    Self {
      nodes: Arena::new(),
      head: None,
      tail: None,
    }
  }

  fn push_front(&mut self, key: String) -> Index {
    let index = self.nodes.insert(Node {
      key,
      prev: None,
      next: self.head,
    });
    if let Some(old_head) = self.head {
      if let Some(node) = self.nodes.get_mut(old_head) {
        node.prev = Some(index);
      }
    }
    self.head = Some(index);
    if self.tail.is_none() {
      self.tail = Some(index);
    }
    index
  }

  /// Detaches the node from the chain but leaves it in the arena.
  fn detach(&mut self, index: Index) {
    let (prev, next) = match self.nodes.get(index) {
      Some(node) => (node.prev, node.next),
      None => return,
    };
    match prev {
      Some(prev_index) => {
        if let Some(node) = self.nodes.get_mut(prev_index) {
          node.next = next;
        }
      }
      None => self.head = next,
    }
    match next {
      Some(next_index) => {
        if let Some(node) = self.nodes.get_mut(next_index) {
          node.prev = prev;
        }
      }
      None => self.tail = prev,
    }
    if let Some(node) = self.nodes.get_mut(index) {
      node.prev = None;
      node.next = None;
    }
  }

  fn move_to_front(&mut self, index: Index) {
    if self.head == Some(index) {
      return;
    }
    self.detach(index);
    let old_head = self.head;
    if let Some(node) = self.nodes.get_mut(index) {
      node.next = old_head;
    }
    if let Some(old_head) = old_head {
      if let Some(node) = self.nodes.get_mut(old_head) {
        node.prev = Some(index);
      }
    }
    self.head = Some(index);
    if self.tail.is_none() {
      self.tail = Some(index);
    }
  }

  fn remove(&mut self, index: Index) -> Option<String> {
    self.detach(index);
    self.nodes.remove(index).map(|node| node.key)
  }

  fn pop_back(&mut self) -> Option<String> {
    let tail = self.tail?;
    self.remove(tail)
  }

  fn clear(&mut self) {
    self.nodes.clear();
    self.head = None;
    self.tail = None;
  }

  #[cfg(test)]
  fn keys_front_to_back(&self) -> Vec<String> {
    let mut keys = Vec::new();
    let mut cursor = self.head;
    while let Some(index) = cursor {
      let node = &self.nodes[index];
      keys.push(node.key.clone());
      cursor = node.next;
    }
    keys
  }
}

struct StoreEntry<V> {
  value: Arc<V>,
  expires_at: Option<Instant>,
  node: Index,
}

/// Bundled LRU + TTL store. Plain by design: a hash map of entries and a
/// recency list; capacity eviction pops the list tail, expiry is lazy.
pub struct LruStore<V> {
  entries: AHashMap<String, StoreEntry<V>>,
  recency: RecencyList,
  max_entries: Option<usize>,
  time_to_live: Option<Duration>,
  allow_stale: bool,
}

impl<V> LruStore<V> {
  pub fn new(options: StoreOptions) -> Self {
    Self {
      entries: AHashMap::new(),
      recency: RecencyList::new(),
      max_entries: options.max_entries,
      time_to_live: options.time_to_live,
      allow_stale: options.allow_stale,
    }
  }

  fn deadline(&self) -> Option<Instant> {
    self.time_to_live.map(|ttl| Instant::now() + ttl)
  }

  fn remove_entry(&mut self, key: &str) -> Option<StoreEntry<V>> {
    let entry = self.entries.remove(key)?;
    self.recency.remove(entry.node);
    Some(entry)
  }

  #[cfg(test)]
  fn recency_keys(&self) -> Vec<String> {
    self.recency.keys_front_to_back()
  }
}

fn expired<V>(entry: &StoreEntry<V>, now: Instant) -> bool {
  entry.expires_at.map_or(false, |at| at <= now)
}

impl<V: Send + Sync> LocalStore<V> for LruStore<V> {
  fn get(&mut self, key: &str) -> Option<Arc<V>> {
    let now = Instant::now();
    let is_expired = match self.entries.get(key) {
      None => return None,
      Some(entry) => expired(entry, now),
    };
    if is_expired {
      let entry = self.remove_entry(key);
      return if self.allow_stale {
        entry.map(|entry| entry.value)
      } else {
        None
      };
    }
    let (node, value) = {
      let entry = self.entries.get(key)?;
      (entry.node, entry.value.clone())
    };
    self.recency.move_to_front(node);
    Some(value)
  }

  fn peek(&self, key: &str) -> Option<Arc<V>> {
    let entry = self.entries.get(key)?;
    if expired(entry, Instant::now()) && !self.allow_stale {
      return None;
    }
    Some(entry.value.clone())
  }

  fn set(&mut self, key: String, value: Arc<V>) {
    let expires_at = self.deadline();
    if let Some(entry) = self.entries.get_mut(&key) {
      entry.value = value;
      entry.expires_at = expires_at;
      let node = entry.node;
      self.recency.move_to_front(node);
      return;
    }
    if let Some(max) = self.max_entries {
      while self.entries.len() >= max {
        match self.recency.pop_back() {
          Some(evicted) => {
            self.entries.remove(&evicted);
          }
          None => break,
        }
      }
    }
    let node = self.recency.push_front(key.clone());
    self.entries.insert(key, StoreEntry { value, expires_at, node });
  }

  fn delete(&mut self, key: &str) -> bool {
    self.remove_entry(key).is_some()
  }

  fn clear(&mut self) {
    self.entries.clear();
    self.recency.clear();
  }

  fn has(&self, key: &str) -> bool {
    self
      .entries
      .get(key)
      .map_or(false, |entry| !expired(entry, Instant::now()))
  }

  fn keys(&self) -> Vec<String> {
    self.entries.keys().cloned().collect()
  }

  fn purge_stale(&mut self) {
    let now = Instant::now();
    let expired_keys: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, entry)| expired(entry, now))
      .map(|(key, _)| key.clone())
      .collect();
    for key in expired_keys {
      self.remove_entry(&key);
    }
  }

  fn len(&self) -> usize {
    self.entries.len()
  }

  fn max_entries(&self) -> Option<usize> {
    self.max_entries
  }

  fn time_to_live(&self) -> Option<Duration> {
    self.time_to_live
  }

  fn allow_stale(&self) -> bool {
    self.allow_stale
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread::sleep;

  fn store(options: StoreOptions) -> LruStore<String> {
    LruStore::new(options)
  }

  fn capped(max: usize) -> LruStore<String> {
    store(StoreOptions {
      max_entries: Some(max),
      ..StoreOptions::default()
    })
  }

  fn with_ttl(ttl: Duration, allow_stale: bool) -> LruStore<String> {
    store(StoreOptions {
      max_entries: None,
      time_to_live: Some(ttl),
      allow_stale,
    })
  }

  fn put(store: &mut LruStore<String>, key: &str) {
    store.set(key.to_string(), Arc::new(format!("value-{}", key)));
  }

  #[test]
  fn evicts_least_recently_used_at_capacity() {
    let mut store = capped(2);
    put(&mut store, "a");
    put(&mut store, "b");
    put(&mut store, "c");

    assert_eq!(store.len(), 2);
    assert!(!store.has("a"), "oldest entry should have been evicted");
    assert!(store.has("b"));
    assert!(store.has("c"));
  }

  #[test]
  fn get_refreshes_recency() {
    let mut store = capped(2);
    put(&mut store, "a");
    put(&mut store, "b");
    assert!(store.get("a").is_some());
    put(&mut store, "c");

    assert!(store.has("a"), "recently read entry survives");
    assert!(!store.has("b"));
    assert_eq!(store.recency_keys(), vec!["c".to_string(), "a".to_string()]);
  }

  #[test]
  fn peek_does_not_refresh_recency() {
    let mut store = capped(2);
    put(&mut store, "a");
    put(&mut store, "b");
    assert!(store.peek("a").is_some());
    put(&mut store, "c");

    assert!(!store.has("a"), "peek must not protect an entry from eviction");
  }

  #[test]
  fn overwrite_updates_value_and_recency() {
    let mut store = capped(2);
    put(&mut store, "a");
    put(&mut store, "b");
    store.set("a".to_string(), Arc::new("fresh".to_string()));
    put(&mut store, "c");

    assert_eq!(store.get("a").as_deref().map(String::as_str), Some("fresh"));
    assert!(!store.has("b"));
  }

  #[test]
  fn expired_entries_vanish_without_allow_stale() {
    let mut store = with_ttl(Duration::from_millis(20), false);
    put(&mut store, "a");
    sleep(Duration::from_millis(40));

    assert!(!store.has("a"));
    assert!(store.get("a").is_none());
    assert_eq!(store.len(), 0, "expired entry is dropped by the read");
  }

  #[test]
  fn allow_stale_returns_expired_value_once() {
    let mut store = with_ttl(Duration::from_millis(20), true);
    put(&mut store, "a");
    sleep(Duration::from_millis(40));

    assert_eq!(
      store.get("a").as_deref().map(String::as_str),
      Some("value-a"),
      "first read after expiry serves the stale value"
    );
    assert!(store.get("a").is_none(), "stale value is served only once");
  }

  #[test]
  fn purge_stale_sweeps_expired_entries() {
    let mut store = with_ttl(Duration::from_millis(20), false);
    put(&mut store, "a");
    put(&mut store, "b");
    sleep(Duration::from_millis(40));
    put(&mut store, "c");

    assert_eq!(store.len(), 3, "lazy expiry leaves entries in place");
    store.purge_stale();
    assert_eq!(store.len(), 1);
    assert!(store.has("c"));
  }

  #[test]
  fn delete_and_clear_release_recency_slots() {
    let mut store = capped(4);
    put(&mut store, "a");
    put(&mut store, "b");
    assert!(store.delete("a"));
    assert!(!store.delete("a"));
    assert_eq!(store.recency_keys(), vec!["b".to_string()]);

    store.clear();
    assert_eq!(store.len(), 0);
    assert!(store.recency_keys().is_empty());
    assert!(store.keys().is_empty());
  }
}
