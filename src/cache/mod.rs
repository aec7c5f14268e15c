//! Named response caches and the strategies that combine them with the network.
//!
//! This module provides:
//! - `CacheStorage`, the store of named caches (SQLite-backed by default)
//! - `CacheLayer`, which fetches through the network and fills caches
//! - Cache-first and network-first strategies with offline fallback

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedResponse};

use url::Url;

/// Storage key of a request URL. Fragments never reach the server and are
/// not part of a cache entry's identity.
pub(crate) fn entry_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.into()
}
