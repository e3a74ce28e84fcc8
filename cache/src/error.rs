use std::sync::Arc;

use herd_broker::BrokerError;
use thiserror::Error;

/// Boxed error type user loaders may return from [`get_with`].
///
/// [`get_with`]: crate::Cache::get_with
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by cache operations.
///
/// Cloneable: a failed load is handed to every caller that coalesced onto
/// it, and all of them observe the same underlying error instance.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// The builder rejected its configuration. Reported synchronously,
  /// before anything touches the broker.
  #[error("invalid cache options: {0}")]
  InvalidOptions(String),

  /// The operation arrived after `close()` had begun. Terminal.
  #[error("Cache is closing or has been closed")]
  Closing,

  /// The loader passed to `get_with` failed.
  #[error("load for key {key:?} failed: {cause}")]
  Load {
    key: String,
    cause: Arc<dyn std::error::Error + Send + Sync>,
  },

  /// The initial broker connection or topology build failed. After
  /// construction, broker failures never surface through return values;
  /// they are absorbed by the reconnection loop and show up as
  /// `reconnecting`/`reconnected` events instead.
  #[error(transparent)]
  Broker(#[from] BrokerError),
}

impl CacheError {
  /// The underlying loader error, when this is a [`CacheError::Load`].
  pub fn load_cause(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
    match self {
      CacheError::Load { cause, .. } => Some(cause.as_ref()),
      _ => None,
    }
  }
}
