//! Core types for the caching system.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response held in a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Result of a strategy fetch, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The response handed back to the caller
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  /// Create a new cache result from a live network response.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache hit.
  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Offline,
      cached_at: Some(cached.cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Network unavailable, serving cached data
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
    };
    f.write_str(label)
  }
}
