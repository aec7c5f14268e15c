//! Resource manifest, shell set, and the logical key of a request URL.

use color_eyre::{eyre::eyre, Result};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// Key of the root document in the manifest.
pub const ROOT_KEY: &str = "/";

/// Cache-busting query parameter stripped before manifest lookup.
const CACHE_BUSTER: &str = "?v=";

/// Mapping of resource path to content fingerprint for one deployed version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceManifest {
  resources: BTreeMap<String, String>,
}

impl ResourceManifest {
  pub fn new(resources: BTreeMap<String, String>) -> Self {
    Self { resources }
  }

  /// Load a manifest from a JSON object file.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;

    Self::from_json(contents.as_bytes())
      .map_err(|e| eyre!("Failed to parse manifest {}: {}", path.display(), e))
  }

  pub fn from_json(bytes: &[u8]) -> Result<Self> {
    Ok(serde_json::from_slice(bytes)?)
  }

  pub fn to_json(&self) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(self)?)
  }

  pub fn fingerprint(&self, key: &str) -> Option<&str> {
    self.resources.get(key).map(String::as_str)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.resources.contains_key(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.resources.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.resources.len()
  }

  /// Whether an entry cached under a previous manifest can be reused.
  ///
  /// The key must still be listed and its fingerprint must not have changed.
  pub fn is_reusable(&self, key: &str, previous: &ResourceManifest) -> bool {
    match self.fingerprint(key) {
      Some(current) => previous.fingerprint(key) == Some(current),
      None => false,
    }
  }

  /// Compare this manifest against a previously activated one.
  pub fn diff(&self, previous: &ResourceManifest) -> ManifestDiff {
    let mut diff = ManifestDiff::default();

    for (key, fingerprint) in &self.resources {
      match previous.fingerprint(key) {
        None => diff.added.push(key.clone()),
        Some(old) if old != fingerprint => diff.changed.push(key.clone()),
        Some(_) => diff.unchanged.push(key.clone()),
      }
    }

    diff.removed = previous
      .keys()
      .filter(|key| !self.contains(key))
      .map(String::from)
      .collect();

    diff
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResourceManifest {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self::new(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// Per-key comparison of two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
  pub added: Vec<String>,
  pub changed: Vec<String>,
  pub removed: Vec<String>,
  pub unchanged: Vec<String>,
}

/// Resources that must be staged before a worker version can activate.
/// Order is fetch priority only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellSet {
  paths: Vec<String>,
}

impl ShellSet {
  /// Build a shell set, rejecting paths the manifest does not list.
  pub fn new(paths: Vec<String>, manifest: &ResourceManifest) -> Result<Self> {
    if let Some(unknown) = paths.iter().find(|p| !manifest.contains(p)) {
      return Err(eyre!("Shell resource '{}' is not in the manifest", unknown));
    }
    Ok(Self { paths })
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.paths.iter().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.paths.len()
  }
}

/// Logical manifest key for a request URL.
///
/// Returns `None` for URLs outside `origin`. The key is the path without its
/// leading slash, percent-decoded, plus any query, cut at a `?v=` cache
/// buster. The origin root, with or without an anchor, maps to [`ROOT_KEY`].
pub fn resource_key(origin: &Url, url: &Url) -> Option<String> {
  if url.origin() != origin.origin() {
    return None;
  }

  let path = percent_decode_str(url.path())
    .decode_utf8()
    .unwrap_or(Cow::Borrowed(url.path()));
  let mut key = path.strip_prefix('/').unwrap_or(&*path).to_string();
  if let Some(query) = url.query() {
    key.push('?');
    key.push_str(query);
  }

  if let Some(idx) = key.find(CACHE_BUSTER) {
    key.truncate(idx);
  }

  if key.is_empty() {
    key.push_str(ROOT_KEY);
  }
  Some(key)
}

/// URL a manifest key is fetched from.
pub fn resource_url(origin: &Url, key: &str) -> Result<Url> {
  origin
    .join(key)
    .map_err(|e| eyre!("Invalid resource path '{}': {}", key, e))
}
