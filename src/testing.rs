//! Test doubles for the cache store and the network.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{entry_key, CacheStorage, CachedResponse};
use crate::config::{CacheNames, WorkerConfig};
use crate::http::{CacheMode, Network, Request, Response};
use crate::manifest::{resource_key, ResourceManifest};
use crate::worker::ServiceWorker;

pub const ORIGIN: &str = "https://app.test";

pub fn origin() -> Url {
  Url::parse(ORIGIN).unwrap()
}

pub fn url(path: &str) -> Url {
  origin().join(path).unwrap()
}

/// Store operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
  Keys,
  Get,
  Put,
  Remove,
}

/// Cache store kept in memory, with injectable failures.
#[derive(Default)]
pub struct MemoryStorage {
  caches: Mutex<BTreeMap<String, BTreeMap<String, CachedResponse>>>,
  failing: Mutex<HashSet<StoreOp>>,
}

impl MemoryStorage {
  /// Make every later call of `op` fail until `heal` is called.
  pub fn fail_on(&self, op: StoreOp) {
    self.failing.lock().unwrap().insert(op);
  }

  pub fn heal(&self) {
    self.failing.lock().unwrap().clear();
  }

  /// Body of a stored entry, as text.
  pub fn body(&self, cache: &str, path: &str) -> Option<String> {
    self
      .caches
      .lock()
      .unwrap()
      .get(cache)
      .and_then(|entries| entries.get(&entry_key(&url(path))))
      .map(|cached| String::from_utf8_lossy(&cached.response.body).into_owned())
  }

  fn check(&self, op: StoreOp) -> Result<()> {
    if self.failing.lock().unwrap().contains(&op) {
      return Err(eyre!("Simulated {:?} failure", op));
    }
    Ok(())
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, cache: &str) -> Result<()> {
    self
      .caches
      .lock()
      .unwrap()
      .entry(cache.to_string())
      .or_default();
    Ok(())
  }

  fn has(&self, cache: &str) -> Result<bool> {
    Ok(self.caches.lock().unwrap().contains_key(cache))
  }

  fn delete(&self, cache: &str) -> Result<bool> {
    Ok(self.caches.lock().unwrap().remove(cache).is_some())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(self.caches.lock().unwrap().keys().cloned().collect())
  }

  fn keys(&self, cache: &str) -> Result<Vec<Url>> {
    self.check(StoreOp::Keys)?;
    let caches = self.caches.lock().unwrap();
    Ok(
      caches
        .get(cache)
        .map(|entries| entries.keys().map(|k| Url::parse(k).unwrap()).collect())
        .unwrap_or_default(),
    )
  }

  fn get(&self, cache: &str, url: &Url) -> Result<Option<CachedResponse>> {
    self.check(StoreOp::Get)?;
    let caches = self.caches.lock().unwrap();
    Ok(
      caches
        .get(cache)
        .and_then(|entries| entries.get(&entry_key(url)))
        .cloned(),
    )
  }

  fn put(&self, cache: &str, url: &Url, response: &Response) -> Result<()> {
    self.check(StoreOp::Put)?;
    self
      .caches
      .lock()
      .unwrap()
      .entry(cache.to_string())
      .or_default()
      .insert(
        entry_key(url),
        CachedResponse {
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    Ok(())
  }

  fn remove(&self, cache: &str, url: &Url) -> Result<bool> {
    self.check(StoreOp::Remove)?;
    Ok(
      self
        .caches
        .lock()
        .unwrap()
        .get_mut(cache)
        .and_then(|entries| entries.remove(&entry_key(url)))
        .is_some(),
    )
  }
}

#[derive(Debug, Clone)]
enum Route {
  Respond { status: u16, body: String },
  Fail,
}

/// Network answering from a table of scripted routes.
///
/// Unrouted URLs fail like an unreachable host.
#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Route>>,
  calls: Mutex<Vec<(String, CacheMode)>>,
}

impl MockNetwork {
  pub fn serve(&self, path: &str, status: u16, body: &str) {
    self.routes.lock().unwrap().insert(
      entry_key(&url(path)),
      Route::Respond {
        status,
        body: body.to_string(),
      },
    );
  }

  pub fn fail(&self, path: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(entry_key(&url(path)), Route::Fail);
  }

  pub fn fetch_count(&self, path: &str) -> usize {
    let key = entry_key(&url(path));
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(u, _)| *u == key)
      .count()
  }

  pub fn total_fetches(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn cache_modes(&self, path: &str) -> Vec<CacheMode> {
    let key = entry_key(&url(path));
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(u, _)| *u == key)
      .map(|(_, mode)| *mode)
      .collect()
  }
}

impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = entry_key(&request.url);
    self
      .calls
      .lock()
      .unwrap()
      .push((key.clone(), request.cache));

    let route = self.routes.lock().unwrap().get(&key).cloned();
    match route {
      Some(Route::Respond { status, body }) => Ok(Response::new(request.url.clone(), status, body)),
      Some(Route::Fail) | None => Err(eyre!("Failed to fetch {}: connection refused", request.url)),
    }
  }
}

/// A worker environment sharing one store and one network.
pub struct Fixture {
  pub storage: Arc<MemoryStorage>,
  pub network: Arc<MockNetwork>,
}

impl Fixture {
  pub fn new() -> Self {
    Self {
      storage: Arc::new(MemoryStorage::default()),
      network: Arc::new(MockNetwork::default()),
    }
  }

  /// Configuration with default cache names that activates on install.
  pub fn config(resources: &[(&str, &str)], shell: &[&str]) -> Arc<WorkerConfig> {
    let manifest: ResourceManifest = resources.iter().copied().collect();
    let config = WorkerConfig::new(
      ORIGIN,
      manifest,
      shell.iter().map(|s| s.to_string()).collect(),
      CacheNames::default(),
      true,
    )
    .unwrap();
    Arc::new(config)
  }

  pub fn worker(&self, config: Arc<WorkerConfig>) -> ServiceWorker<MemoryStorage, MockNetwork> {
    ServiceWorker::new(config, Arc::clone(&self.storage), Arc::clone(&self.network))
  }

  pub fn resume(&self, config: Arc<WorkerConfig>) -> ServiceWorker<MemoryStorage, MockNetwork> {
    ServiceWorker::resume(config, Arc::clone(&self.storage), Arc::clone(&self.network)).unwrap()
  }

  /// A worker that has been installed and activated.
  pub async fn activated(
    &self,
    config: Arc<WorkerConfig>,
  ) -> ServiceWorker<MemoryStorage, MockNetwork> {
    let worker = self.worker(config);
    worker.update().await.unwrap();
    worker
  }

  pub fn seed(&self, cache: &str, path: &str, body: &str) {
    let url = url(path);
    self
      .storage
      .put(cache, &url, &Response::new(url.clone(), 200, body))
      .unwrap();
  }

  /// Record `resources` as the manifest of the previously activated version.
  pub fn seed_snapshot(&self, resources: &[(&str, &str)]) {
    let manifest: ResourceManifest = resources.iter().copied().collect();
    let json = String::from_utf8(manifest.to_json().unwrap()).unwrap();
    self.seed(&CacheNames::default().manifest, "manifest", &json);
  }

  /// Resource keys currently in the content cache.
  pub fn content_keys(&self) -> Vec<String> {
    let origin = origin();
    self
      .storage
      .keys(&CacheNames::default().content)
      .unwrap()
      .iter()
      .filter_map(|u| resource_key(&origin, u))
      .collect()
  }
}
