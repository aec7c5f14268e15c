//! Request interception.

use color_eyre::Result;
use reqwest::Method;
use tracing::debug;

use super::{ServiceWorker, WorkerState};
use crate::cache::{CacheResult, CacheStorage};
use crate::http::{Network, Request};
use crate::manifest::{resource_key, ROOT_KEY};

/// How the worker handled a request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not a bundle resource; the host performs the request itself
  Passthrough,
  /// Answered by the worker
  Respond(CacheResult),
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// Handle an outgoing request.
  ///
  /// Only GET requests for manifest resources are intercepted, and only once
  /// this version is active. The root document is fetched online-first so
  /// the landing page tracks the latest deployment; everything else is
  /// served cache-first and cached lazily.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if request.method != Method::GET {
      return Ok(FetchOutcome::Passthrough);
    }

    let state = self.state();
    if state != WorkerState::Activated {
      debug!(url = %request.url, %state, "Worker not active, passing through");
      return Ok(FetchOutcome::Passthrough);
    }

    let key = match resource_key(&self.config.origin, &request.url) {
      Some(key) if self.config.manifest.contains(&key) => key,
      _ => {
        debug!(url = %request.url, "Not a bundle resource, passing through");
        return Ok(FetchOutcome::Passthrough);
      }
    };

    let content = &self.config.caches.content;
    let result = if key == ROOT_KEY {
      self.layer.network_first(content, request).await?
    } else {
      self.layer.cache_first(content, request).await?
    };

    debug!(%key, source = %result.source, status = result.response.status, "Served");
    Ok(FetchOutcome::Respond(result))
  }
}
