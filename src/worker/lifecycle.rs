//! Install and activate handling.
//!
//! Install fetches the shell of the new version into the staging cache, so a
//! failed download never touches the durable cache. Activate reconciles the
//! durable cache against the previously activated manifest, promotes the
//! staged shell and records the new manifest. If anything fails during
//! activation the caches cannot be trusted and all of them are dropped.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{ServiceWorker, WorkerState};
use crate::cache::CacheStorage;
use crate::http::{CacheMode, Network, Request, Response};
use crate::manifest::{resource_key, resource_url, ResourceManifest};

/// Key of the single entry in the manifest cache.
const SNAPSHOT_KEY: &str = "manifest";

/// What activation did to the durable cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
  /// No previous manifest; the content cache was rebuilt from the staged shell
  FirstInstall { staged: Vec<String> },
  /// Reconciled against the previous manifest
  Upgrade {
    retained: Vec<String>,
    evicted: Vec<String>,
    staged: Vec<String>,
  },
  /// Reconciliation failed and every cache was deleted
  Reset { error: String },
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// Stage the shell resources of this version.
  ///
  /// Every shell resource is fetched past any HTTP cache. One failure fails
  /// the install and the worker becomes redundant.
  pub async fn install(&self) -> Result<()> {
    self.transition(WorkerState::Parsed, WorkerState::Installing)?;

    if self.config.skip_waiting_on_install {
      self.skip_waiting.store(true, Ordering::SeqCst);
    }

    match self.stage_shell().await {
      Ok(count) => {
        info!(count, "Staged shell resources");
        self.set_state(WorkerState::Installed);
        Ok(())
      }
      Err(e) => {
        error!(error = %e, "Install failed");
        if let Err(cleanup) = self.storage().delete(&self.config.caches.staging) {
          warn!(error = %cleanup, "Failed to drop staging cache");
        }
        self.set_state(WorkerState::Redundant);
        Err(e.wrap_err("Failed to install worker"))
      }
    }
  }

  async fn stage_shell(&self) -> Result<usize> {
    // Leftovers of a version that never activated must not be promoted
    self.storage().delete(&self.config.caches.staging)?;

    let requests = self
      .config
      .shell
      .iter()
      .map(|path| {
        let url = resource_url(&self.config.origin, path)?;
        Ok(Request::get(url).with_cache(CacheMode::Reload))
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .layer
      .add_all(&self.config.caches.staging, &requests)
      .await
  }

  /// Install, then activate right away if skip-waiting was requested.
  ///
  /// Returns `None` when the new version is left waiting.
  pub async fn update(&self) -> Result<Option<Activation>> {
    self.install().await?;
    if self.skip_waiting_requested() {
      return self.activate().map(Some);
    }
    info!("Installed version is waiting to activate");
    Ok(None)
  }

  /// Activate the waiting version.
  ///
  /// A reconciliation failure is not returned as an error: the caches are
  /// cleared and the worker activates cold.
  pub fn activate(&self) -> Result<Activation> {
    self.transition(WorkerState::Installed, WorkerState::Activating)?;

    let activation = match self.reconcile() {
      Ok(activation) => activation,
      Err(e) => {
        error!(error = %e, "Failed to upgrade worker, clearing all caches");
        self.clear_caches();
        // An empty manifest cache keeps the worker active across restarts
        if let Err(reopen) = self.storage().open(&self.config.caches.manifest) {
          warn!(error = %reopen, "Failed to recreate manifest cache");
        }
        Activation::Reset {
          error: format!("{:#}", e),
        }
      }
    };

    self.set_state(WorkerState::Activated);
    info!(?activation, "Worker activated");
    Ok(activation)
  }

  /// Request activation without waiting. Activates immediately when a
  /// version is installed and waiting.
  pub fn skip_waiting(&self) -> Result<Option<Activation>> {
    self.skip_waiting.store(true, Ordering::SeqCst);
    if self.state() == WorkerState::Installed {
      return self.activate().map(Some);
    }
    Ok(None)
  }

  fn reconcile(&self) -> Result<Activation> {
    let caches = &self.config.caches;
    let storage = self.storage();

    storage.open(&caches.content)?;
    storage.open(&caches.staging)?;
    storage.open(&caches.manifest)?;

    let snapshot_url = self.snapshot_url()?;
    let activation = match storage.get(&caches.manifest, &snapshot_url)? {
      None => {
        // Nothing in the content cache can be vouched for
        storage.delete(&caches.content)?;
        storage.open(&caches.content)?;
        let staged = self.promote_staging()?;
        Activation::FirstInstall { staged }
      }
      Some(cached) => {
        let previous = ResourceManifest::from_json(&cached.response.body)
          .map_err(|e| eyre!("Corrupt manifest snapshot: {}", e))?;
        let (retained, evicted) = self.evict_stale(&previous)?;
        let staged = self.promote_staging()?;
        Activation::Upgrade {
          retained,
          evicted,
          staged,
        }
      }
    };

    storage.delete(&caches.staging)?;
    self.save_snapshot(&snapshot_url)?;
    self.claim_clients();

    Ok(activation)
  }

  /// Drop content entries that are no longer listed or whose fingerprint
  /// changed since `previous`. Returns (retained, evicted) keys.
  fn evict_stale(&self, previous: &ResourceManifest) -> Result<(Vec<String>, Vec<String>)> {
    let content = &self.config.caches.content;
    let mut retained = Vec::new();
    let mut evicted = Vec::new();

    for url in self.storage().keys(content)? {
      let key = resource_key(&self.config.origin, &url);
      let reusable = key
        .as_deref()
        .is_some_and(|k| self.config.manifest.is_reusable(k, previous));

      let label = key.unwrap_or_else(|| url.to_string());
      if reusable {
        retained.push(label);
      } else {
        debug!(key = %label, "Evicting stale resource");
        self.storage().remove(content, &url)?;
        evicted.push(label);
      }
    }

    Ok((retained, evicted))
  }

  /// Copy staged shell resources over the content cache.
  fn promote_staging(&self) -> Result<Vec<String>> {
    let caches = &self.config.caches;
    let copied = self.layer.copy_entries(&caches.staging, &caches.content)?;

    Ok(
      copied
        .iter()
        .map(|url| resource_key(&self.config.origin, url).unwrap_or_else(|| url.to_string()))
        .collect(),
    )
  }

  fn snapshot_url(&self) -> Result<Url> {
    resource_url(&self.config.origin, SNAPSHOT_KEY)
  }

  fn save_snapshot(&self, url: &Url) -> Result<()> {
    let mut response = Response::new(url.clone(), 200, self.config.manifest.to_json()?);
    response
      .headers
      .push(("content-type".to_string(), "application/json".to_string()));

    self
      .storage()
      .put(&self.config.caches.manifest, url, &response)
  }

  /// Manifest recorded by the last successful activation.
  pub fn snapshot(&self) -> Result<Option<ResourceManifest>> {
    let url = self.snapshot_url()?;
    match self.storage().get(&self.config.caches.manifest, &url)? {
      Some(cached) => Ok(Some(ResourceManifest::from_json(&cached.response.body)?)),
      None => Ok(None),
    }
  }

  /// Drop every cache this worker owns. Each deletion is attempted even if
  /// an earlier one fails.
  fn clear_caches(&self) {
    let caches = &self.config.caches;
    for name in [&caches.content, &caches.staging, &caches.manifest] {
      if let Err(e) = self.storage().delete(name) {
        warn!(cache = %name, error = %e, "Failed to delete cache");
      }
    }
  }

  fn claim_clients(&self) {
    self.clients_claimed.store(true, Ordering::SeqCst);
    debug!("Claimed clients");
  }
}
