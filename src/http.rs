//! Request/response snapshots and the network the worker fetches through.

use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Client, Method};
use std::future::Future;
use std::time::Duration;
use url::Url;

/// How a request interacts with the HTTP cache between worker and server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
  #[default]
  Default,
  /// Bypass any intermediate cache and revalidate against the server.
  Reload,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub cache: CacheMode,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      cache: CacheMode::Default,
    }
  }

  pub fn with_cache(mut self, cache: CacheMode) -> Self {
    self.cache = cache;
    self
  }
}

/// A fully buffered response, as stored in a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: Url,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(url: Url, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url,
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Whether the status is in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Transport used by the worker for every outgoing request.
///
/// An `Err` means the request never produced a response (DNS, connection,
/// timeout); HTTP error statuses are returned as `Ok` responses.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Network backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestNetwork {
  client: Client,
}

impl ReqwestNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for ReqwestNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    if request.cache == CacheMode::Reload {
      builder = builder
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::PRAGMA, "no-cache");
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let url = response.url().clone();
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      url,
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_ok_range() {
    let url = Url::parse("https://app.test/a.js").unwrap();
    assert!(Response::new(url.clone(), 200, "").is_ok());
    assert!(Response::new(url.clone(), 204, "").is_ok());
    assert!(!Response::new(url.clone(), 304, "").is_ok());
    assert!(!Response::new(url.clone(), 404, "").is_ok());
    assert!(!Response::new(url, 503, "").is_ok());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let mut response = Response::new(Url::parse("https://app.test/").unwrap(), 200, "");
    response
      .headers
      .push(("content-type".into(), "text/html".into()));
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert_eq!(response.header("etag"), None);
  }
}
