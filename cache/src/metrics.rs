use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// Internal metrics collector. All fields are atomic so the hot paths
/// never take a lock to record.
#[derive(Debug)]
pub(crate) struct Metrics {
  // --- Hit/Miss Ratios ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Local throughput ---
  pub(crate) inserts: CachePadded<AtomicU64>,
  pub(crate) invalidations: CachePadded<AtomicU64>,

  // --- Loader activity ---
  pub(crate) loads: CachePadded<AtomicU64>,
  pub(crate) load_failures: CachePadded<AtomicU64>,

  // --- Bus traffic ---
  pub(crate) publishes: CachePadded<AtomicU64>,
  pub(crate) invalidations_received: CachePadded<AtomicU64>,

  // --- Connection lifecycle ---
  pub(crate) reconnects: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      inserts: CachePadded::new(AtomicU64::new(0)),
      invalidations: CachePadded::new(AtomicU64::new(0)),
      loads: CachePadded::new(AtomicU64::new(0)),
      load_failures: CachePadded::new(AtomicU64::new(0)),
      publishes: CachePadded::new(AtomicU64::new(0)),
      invalidations_received: CachePadded::new(AtomicU64::new(0)),
      reconnects: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      inserts: self.inserts.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      loads: self.loads.load(Ordering::Relaxed),
      load_failures: self.load_failures.load(Ordering::Relaxed),
      publishes: self.publishes.load(Ordering::Relaxed),
      invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
      reconnects: self.reconnects.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// The number of successful local lookups.
  pub hits: u64,
  /// The number of failed local lookups, including reads parked while the
  /// connection is degraded.
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// The total number of values written locally (`insert` and loader
  /// write-backs).
  pub inserts: u64,
  /// The number of locally initiated invalidations (`invalidate`/`clear`).
  pub invalidations: u64,
  /// The number of loader invocations (one per coalesced load).
  pub loads: u64,
  /// The number of loader invocations that returned an error.
  pub load_failures: u64,
  /// The number of invalidation messages published to the bus.
  pub publishes: u64,
  /// The number of messages accepted from other instances.
  pub invalidations_received: u64,
  /// The number of successful reconnections.
  pub reconnects: u64,
  /// The number of seconds the cache has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("inserts", &self.inserts)
      .field("invalidations", &self.invalidations)
      .field("loads", &self.loads)
      .field("load_failures", &self.load_failures)
      .field("publishes", &self.publishes)
      .field("invalidations_received", &self.invalidations_received)
      .field("reconnects", &self.reconnects)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
