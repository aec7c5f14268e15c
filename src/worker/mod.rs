//! The cache-managing worker for one application bundle.
//!
//! A worker version goes through the host's lifecycle:
//! - install: stage the shell resources of the new version
//! - activate: reconcile the durable cache against the previous manifest
//! - fetch: serve manifest resources from cache or network
//! - message: out-of-band commands from the page

mod control;
mod interceptor;
mod lifecycle;

pub use control::MessageOutcome;
pub use interceptor::FetchOutcome;
pub use lifecycle::Activation;

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::cache::{CacheLayer, CacheStorage};
use crate::config::WorkerConfig;
use crate::http::Network;

/// Lifecycle state of a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  Activated,
  /// Failed to install; will never activate
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(label)
  }
}

/// A worker version bound to its configuration, cache store and network.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  config: Arc<WorkerConfig>,
  layer: CacheLayer<S, N>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// A freshly parsed worker version, not yet installed.
  pub fn new(config: Arc<WorkerConfig>, storage: Arc<S>, network: Arc<N>) -> Self {
    Self::with_state(config, storage, network, WorkerState::Parsed)
  }

  /// Restart a worker against existing storage.
  ///
  /// A staging cache means a version is installed and waiting; a manifest
  /// cache, empty after a reset, means a version was activated.
  pub fn resume(config: Arc<WorkerConfig>, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let state = if storage.has(&config.caches.staging)? {
      WorkerState::Installed
    } else if storage.has(&config.caches.manifest)? {
      WorkerState::Activated
    } else {
      WorkerState::Parsed
    };
    debug!(%state, "Resuming worker");

    Ok(Self::with_state(config, storage, network, state))
  }

  fn with_state(
    config: Arc<WorkerConfig>,
    storage: Arc<S>,
    network: Arc<N>,
    state: WorkerState,
  ) -> Self {
    Self {
      config,
      layer: CacheLayer::new(storage, network),
      state: Mutex::new(state),
      skip_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn storage(&self) -> &S {
    self.layer.storage()
  }

  pub fn network(&self) -> &N {
    self.layer.network()
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Move to `to` if currently in `from`.
  fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if *state != from {
      return Err(eyre!("Worker is {}, expected {}", *state, from));
    }
    *state = to;
    Ok(())
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }
}
