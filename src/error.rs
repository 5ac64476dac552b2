//! Error taxonomy shared by the caching, client and storage layers.

use std::time::Duration;

/// Errors raised inside the resilience layer.
///
/// Most of these never reach application code: the strategy engine turns
/// network and cache failures into fallback responses, and the persistent
/// store absorbs storage failures at its boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The transport could not reach the origin
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// No cached entry exists for the request
  #[error("no cached response for {0}")]
  CacheMiss(String),

  /// Origin answered 429
  #[error("rate limited, retry after {retry_after:?}")]
  RateLimited { retry_after: Duration },

  /// Origin answered 503 and the retry budget ran out
  #[error("service unavailable, {budget} retries left")]
  ServiceUnavailable { budget: u32 },

  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The fetch exceeded its timeout and was aborted
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// Response excluded from caching (non-200 or wrong response kind)
  #[error("response not cacheable: {0}")]
  ValidationFailure(String),

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::StorageUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::StorageUnavailable(format!("serialization: {}", e))
  }
}

impl Error {
  /// Whether this failure means "the network leg did not produce a response".
  pub fn is_network_failure(&self) -> bool {
    matches!(self, Error::NetworkUnavailable(_) | Error::Timeout(_))
  }
}

pub type Result<T> = std::result::Result<T, Error>;
