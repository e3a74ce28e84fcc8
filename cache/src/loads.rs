use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::CacheError;

/// What a coalesced load resolves to. `Ok(None)` means the loader found
/// nothing; that outcome is handed to callers but never cached.
pub(crate) type LoadResult<V> = Result<Option<Arc<V>>, CacheError>;

enum SlotState<V> {
  Loading,
  Complete(LoadResult<V>),
}

struct SlotInner<V> {
  state: SlotState<V>,
  waiters: VecDeque<Waker>,
}

/// A value in flight. Awaited by every caller that asked for the key while
/// the load was running; completed exactly once by the leader (or its drop
/// guard).
pub(crate) struct LoadSlot<V> {
  inner: Mutex<SlotInner<V>>,
}

impl<V> LoadSlot<V> {
  fn new() -> Self {
    Self {
      inner: Mutex::new(SlotInner {
        state: SlotState::Loading,
        waiters: VecDeque::new(),
      }),
    }
  }

  /// Completes the slot and wakes all waiters. The first completion wins;
  /// later calls are ignored.
  pub(crate) fn complete(&self, result: LoadResult<V>) {
    let waiters = {
      let mut inner = self.inner.lock();
      if matches!(inner.state, SlotState::Complete(_)) {
        return;
      }
      inner.state = SlotState::Complete(result);
      std::mem::take(&mut inner.waiters)
    };
    for waiter in waiters {
      waiter.wake();
    }
  }
}

impl<V> Future for &LoadSlot<V> {
  type Output = LoadResult<V>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.inner.lock();
    match &inner.state {
      SlotState::Complete(result) => Poll::Ready(result.clone()),
      SlotState::Loading => {
        inner.waiters.push_back(cx.waker().clone());
        Poll::Pending
      }
    }
  }
}

/// Outcome of [`LoadTable::begin`]: either this caller runs the loader, or
/// it joins a load already in flight.
pub(crate) enum Begin<V> {
  Lead(Arc<LoadSlot<V>>),
  Join(Arc<LoadSlot<V>>),
}

/// In-flight loads by key: at most one live loader per key per instance.
pub(crate) struct LoadTable<V> {
  slots: Mutex<AHashMap<String, Arc<LoadSlot<V>>>>,
}

impl<V> LoadTable<V> {
  pub(crate) fn new() -> Self {
    Self {
      slots: Mutex::new(AHashMap::new()),
    }
  }

  pub(crate) fn begin(&self, key: &str) -> Begin<V> {
    let mut slots = self.slots.lock();
    if let Some(existing) = slots.get(key) {
      return Begin::Join(existing.clone());
    }
    let slot = Arc::new(LoadSlot::new());
    slots.insert(key.to_string(), slot.clone());
    Begin::Lead(slot)
  }

  /// Ends a leader's tenure. `write_back` runs under the table lock with
  /// a flag saying whether this slot is still the key's current entry, so
  /// an invalidation can never slip between the check and the store
  /// write. The entry is removed when it is still current.
  pub(crate) fn finish_leader<F>(&self, key: &str, slot: &Arc<LoadSlot<V>>, write_back: F)
  where
    F: FnOnce(bool),
  {
    let mut slots = self.slots.lock();
    let current = slots
      .get(key)
      .map_or(false, |present| Arc::ptr_eq(present, slot));
    write_back(current);
    if current {
      slots.remove(key);
    }
  }

  /// Forgets the in-flight load for a key. The slot still completes and
  /// hands its value to waiting callers; it just will not be written back.
  pub(crate) fn invalidate(&self, key: &str) {
    self.slots.lock().remove(key);
  }

  pub(crate) fn clear(&self) {
    self.slots.lock().clear();
  }
}

/// Completes the slot with an error if the leading task is dropped before
/// finishing, so joined callers observe a failure instead of waiting
/// forever.
pub(crate) struct LeaderGuard<'a, V> {
  table: &'a LoadTable<V>,
  key: &'a str,
  slot: &'a Arc<LoadSlot<V>>,
  armed: bool,
}

impl<'a, V> LeaderGuard<'a, V> {
  pub(crate) fn new(table: &'a LoadTable<V>, key: &'a str, slot: &'a Arc<LoadSlot<V>>) -> Self {
    Self {
      table,
      key,
      slot,
      armed: true,
    }
  }

  pub(crate) fn defuse(mut self) {
    self.armed = false;
  }
}

impl<V> Drop for LeaderGuard<'_, V> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    self.table.finish_leader(self.key, self.slot, |_| {});
    self.slot.complete(Err(CacheError::Load {
      key: self.key.to_string(),
      cause: Arc::new(LoadAbandoned),
    }));
  }
}

/// Error observed by joiners when the leading task was cancelled mid-load.
#[derive(Debug)]
struct LoadAbandoned;

impl fmt::Display for LoadAbandoned {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("load was cancelled before it completed")
  }
}

impl std::error::Error for LoadAbandoned {}
