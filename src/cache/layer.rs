//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::http::{Network, Request, Response};

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the worker and the network, filling named caches
/// from network responses and serving from them when appropriate.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  /// Create a new cache layer over the given storage and network.
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self { storage, network }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  /// Fetch every request and store all responses, or none.
  ///
  /// Requests run concurrently. A transport failure or a non-2xx status on
  /// any of them fails the whole batch before anything is written.
  pub async fn add_all(&self, cache: &str, requests: &[Request]) -> Result<usize> {
    let fetched = try_join_all(requests.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "Request for {} failed with status {}",
          request.url,
          response.status
        ));
      }
      Ok((request, response))
    }))
    .await?;

    self.storage.open(cache)?;
    for (request, response) in &fetched {
      self.storage.put(cache, &request.url, response)?;
    }

    Ok(fetched.len())
  }

  /// Copy every entry of one cache into another, overwriting. Returns the
  /// copied URLs.
  pub fn copy_entries(&self, from: &str, to: &str) -> Result<Vec<Url>> {
    let keys = self.storage.keys(from)?;
    for url in &keys {
      if let Some(cached) = self.storage.get(from, url)? {
        self.storage.put(to, url, &cached.response)?;
      }
    }
    Ok(keys)
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if present, return immediately
  /// 2. If missing, fetch from network
  /// 3. Store successful (2xx) responses before returning them
  ///
  /// Error statuses are returned uncached; transport failures propagate.
  pub async fn cache_first(&self, cache: &str, request: &Request) -> Result<CacheResult> {
    if let Some(cached) = self.storage.get(cache, &request.url)? {
      debug!(url = %request.url, "Cache hit");
      return Ok(CacheResult::from_cache(cached));
    }

    debug!(url = %request.url, "Cache miss, fetching");
    let response = self.network.fetch(request).await?;
    self.store_if_ok(cache, request, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch from network; store and return successful responses
  /// 2. On network failure, return the cached copy (offline mode)
  /// 3. With no cached copy, propagate the network error
  pub async fn network_first(&self, cache: &str, request: &Request) -> Result<CacheResult> {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_if_ok(cache, request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => match self.storage.get(cache, &request.url) {
        Ok(Some(cached)) => {
          debug!(url = %request.url, error = %err, "Network failed, serving cached copy");
          Ok(CacheResult::offline(cached))
        }
        Ok(None) => Err(err),
        Err(lookup) => {
          warn!(url = %request.url, error = %lookup, "Offline cache lookup failed");
          Err(err)
        }
      },
    }
  }

  /// Cache writes on the request path never fail the request.
  fn store_if_ok(&self, cache: &str, request: &Request, response: &Response) {
    if !response.is_ok() {
      debug!(url = %request.url, status = response.status, "Not caching error response");
      return;
    }
    if let Err(e) = self.storage.put(cache, &request.url, response) {
      warn!(url = %request.url, error = %e, "Failed to cache response");
    }
  }
}
