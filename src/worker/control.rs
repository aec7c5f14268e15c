//! Commands posted to the worker by the hosting page.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};

use super::{Activation, ServiceWorker};
use crate::cache::CacheStorage;
use crate::http::{Network, Request};
use crate::manifest::{resource_key, resource_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate a waiting version now; the page reloads itself afterwards
  SkipWaiting,
  /// Download every manifest resource not cached yet
  DownloadOffline,
}

impl FromStr for ControlMessage {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "skipWaiting" => Ok(Self::SkipWaiting),
      "downloadOffline" => Ok(Self::DownloadOffline),
      other => Err(eyre!("Unknown control message '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
  /// Unrecognized message
  Ignored,
  /// Skip-waiting recorded, with the activation it triggered if any
  SkipWaiting(Option<Activation>),
  /// Keys fetched into the content cache
  Downloaded(Vec<String>),
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// Handle a message posted by the page. Unknown messages are ignored.
  pub async fn handle_message(&self, data: &str) -> Result<MessageOutcome> {
    let message = match data.parse::<ControlMessage>() {
      Ok(message) => message,
      Err(e) => {
        debug!(error = %e, "Ignoring message");
        return Ok(MessageOutcome::Ignored);
      }
    };

    match message {
      ControlMessage::SkipWaiting => Ok(MessageOutcome::SkipWaiting(self.skip_waiting()?)),
      ControlMessage::DownloadOffline => Ok(MessageOutcome::Downloaded(
        self.download_offline().await?,
      )),
    }
  }

  /// Fetch every manifest resource missing from the content cache, so the
  /// whole application works offline. All or nothing, like install.
  pub async fn download_offline(&self) -> Result<Vec<String>> {
    let origin = &self.config.origin;
    let content = &self.config.caches.content;

    let present: HashSet<String> = self
      .storage()
      .keys(content)?
      .iter()
      .filter_map(|url| resource_key(origin, url))
      .collect();

    let missing: Vec<String> = self
      .config
      .manifest
      .keys()
      .filter(|key| !present.contains(*key))
      .map(String::from)
      .collect();

    let requests = missing
      .iter()
      .map(|key| Ok(Request::get(resource_url(origin, key)?)))
      .collect::<Result<Vec<_>>>()?;

    let count = self.layer.add_all(content, &requests).await?;
    info!(count, "Downloaded resources for offline use");

    Ok(missing)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{Fixture, StoreOp};
  use crate::worker::WorkerState;

  const CONTENT: &str = "app-cache";

  #[test]
  fn test_parse_messages() {
    assert_eq!(
      "skipWaiting".parse::<ControlMessage>().unwrap(),
      ControlMessage::SkipWaiting
    );
    assert_eq!(
      "downloadOffline".parse::<ControlMessage>().unwrap(),
      ControlMessage::DownloadOffline
    );
    assert!("skipwaiting".parse::<ControlMessage>().is_err());
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let fx = Fixture::new();
    let worker = fx.activated(Fixture::config(&[("a.js", "h1")], &[])).await;

    let outcome = worker.handle_message("reload").await.unwrap();
    assert_eq!(outcome, MessageOutcome::Ignored);
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_waiting_version() {
    let fx = Fixture::new();
    let mut config = (*Fixture::config(&[("main.js", "h1")], &["main.js"])).clone();
    config.skip_waiting_on_install = false;
    fx.network.serve("main.js", 200, "main");
    let worker = fx.worker(std::sync::Arc::new(config));
    worker.update().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Installed);

    let outcome = worker.handle_message("skipWaiting").await.unwrap();

    assert!(matches!(
      outcome,
      MessageOutcome::SkipWaiting(Some(Activation::FirstInstall { .. }))
    ));
    assert_eq!(worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_download_offline_fetches_only_missing() {
    let fx = Fixture::new();
    let config = Fixture::config(
      &[("/", "h0"), ("main.js", "h1"), ("a.js", "h2"), ("b.js", "h3")],
      &["main.js"],
    );
    fx.network.serve("main.js", 200, "main");
    let worker = fx.activated(config).await;
    fx.seed(CONTENT, "a.js?v=1", "a");
    fx.network.serve("/", 200, "<html>");
    fx.network.serve("b.js", 200, "b");

    let outcome = worker.handle_message("downloadOffline").await.unwrap();

    assert_eq!(
      outcome,
      MessageOutcome::Downloaded(vec!["/".to_string(), "b.js".to_string()])
    );
    assert_eq!(fx.network.fetch_count("main.js"), 1);
    assert_eq!(fx.network.fetch_count("a.js"), 0);
    assert_eq!(fx.storage.body(CONTENT, "/").as_deref(), Some("<html>"));
    assert_eq!(fx.storage.body(CONTENT, "b.js").as_deref(), Some("b"));

    // Everything is present now
    assert!(worker.download_offline().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_download_offline_is_all_or_nothing() {
    let fx = Fixture::new();
    let worker = fx
      .activated(Fixture::config(&[("a.js", "h1"), ("b.js", "h2")], &[]))
      .await;
    fx.network.serve("a.js", 200, "a");
    fx.network.fail("b.js");

    assert!(worker.download_offline().await.is_err());
    assert_eq!(fx.storage.body(CONTENT, "a.js"), None);
  }

  #[tokio::test]
  async fn test_download_offline_surfaces_store_errors() {
    let fx = Fixture::new();
    let worker = fx.activated(Fixture::config(&[("a.js", "h1")], &[])).await;
    fx.storage.fail_on(StoreOp::Keys);

    assert!(worker.handle_message("downloadOffline").await.is_err());
  }
}
