use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::manifest::{ResourceManifest, ShellSet};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application is served from (scheme, host, port)
  pub origin: String,
  /// JSON file mapping resource path to content fingerprint
  pub manifest: PathBuf,
  /// Resources staged at install, in fetch priority order
  #[serde(default)]
  pub shell: Vec<String>,
  #[serde(default)]
  pub caches: CacheNames,
  /// SQLite database holding the caches (defaults to the data directory)
  pub database: Option<PathBuf>,
  /// Activate a freshly installed version without waiting
  #[serde(default = "default_true")]
  pub skip_waiting_on_install: bool,
  #[serde(default)]
  pub network: NetworkConfig,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
  /// Directory relative paths are resolved against
  #[serde(skip)]
  base_dir: PathBuf,
}

fn default_true() -> bool {
  true
}

/// Names of the three cache stores.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheNames {
  /// Durable content, stable across versions
  pub content: String,
  /// Shell resources of a version being installed
  pub staging: String,
  /// Manifest of the last activated version
  pub manifest: String,
}

impl Default for CacheNames {
  fn default() -> Self {
    Self {
      content: "app-cache".to_string(),
      staging: "app-temp-cache".to_string(),
      manifest: "app-manifest".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shellcache/config.yaml\n\
                 or pass --config."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let base_dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_default();

    Self::from_yaml(&contents, base_dir)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str, base_dir: PathBuf) -> Result<Self> {
    let mut config: Config = serde_yaml::from_str(contents)?;
    config.base_dir = base_dir;
    Ok(config)
  }

  fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.base_dir.join(path)
    }
  }

  pub fn manifest_path(&self) -> PathBuf {
    self.resolve(&self.manifest)
  }

  pub fn database_path(&self) -> Option<PathBuf> {
    self.database.as_deref().map(|p| self.resolve(p))
  }

  pub fn log_path(&self) -> Option<PathBuf> {
    self.log_file.as_deref().map(|p| self.resolve(p))
  }

  /// Read the manifest and build the immutable worker configuration.
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let manifest = ResourceManifest::load(&self.manifest_path())?;
    WorkerConfig::new(
      &self.origin,
      manifest,
      self.shell.clone(),
      self.caches.clone(),
      self.skip_waiting_on_install,
    )
  }
}

/// Everything a worker version needs, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub origin: Url,
  pub manifest: ResourceManifest,
  pub shell: ShellSet,
  pub caches: CacheNames,
  pub skip_waiting_on_install: bool,
}

impl WorkerConfig {
  pub fn new(
    origin: &str,
    manifest: ResourceManifest,
    shell: Vec<String>,
    caches: CacheNames,
    skip_waiting_on_install: bool,
  ) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    if origin.cannot_be_a_base() || origin.path() != "/" || origin.query().is_some() {
      return Err(eyre!(
        "Origin must be scheme, host and port only, got '{}'",
        origin
      ));
    }

    let names = [&caches.content, &caches.staging, &caches.manifest];
    if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
      return Err(eyre!("Cache names must be distinct: {:?}", caches));
    }

    let shell = ShellSet::new(shell, &manifest)?;

    Ok(Self {
      origin,
      manifest,
      shell,
      caches,
      skip_waiting_on_install,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = "
origin: https://app.test
manifest: build/resources.json
";

  fn manifest() -> ResourceManifest {
    [("/", "h0"), ("main.js", "h1")].into_iter().collect()
  }

  #[test]
  fn test_defaults() {
    let config = Config::from_yaml(MINIMAL, PathBuf::from("/srv/app")).unwrap();

    assert!(config.shell.is_empty());
    assert_eq!(config.caches, CacheNames::default());
    assert!(config.skip_waiting_on_install);
    assert_eq!(config.network.timeout(), Duration::from_secs(30));
    assert_eq!(config.database_path(), None);
    assert_eq!(
      config.manifest_path(),
      PathBuf::from("/srv/app/build/resources.json")
    );
  }

  #[test]
  fn test_full_config() {
    let yaml = "
origin: https://app.test
manifest: /abs/resources.json
shell: [main.js, index.html]
caches:
  content: content-v
database: data/cache.db
skip_waiting_on_install: false
network:
  timeout_secs: 5
log_file: shellcache.log
";
    let config = Config::from_yaml(yaml, PathBuf::from("/srv/app")).unwrap();

    assert_eq!(config.shell, vec!["main.js", "index.html"]);
    assert_eq!(config.caches.content, "content-v");
    assert_eq!(config.caches.staging, "app-temp-cache");
    assert!(!config.skip_waiting_on_install);
    assert_eq!(config.network.timeout_secs, 5);
    assert_eq!(config.manifest_path(), PathBuf::from("/abs/resources.json"));
    assert_eq!(
      config.database_path(),
      Some(PathBuf::from("/srv/app/data/cache.db"))
    );
    assert_eq!(
      config.log_path(),
      Some(PathBuf::from("/srv/app/shellcache.log"))
    );
  }

  #[test]
  fn test_missing_origin_is_rejected() {
    assert!(Config::from_yaml("manifest: a.json", PathBuf::new()).is_err());
  }

  #[test]
  fn test_worker_config_reads_manifest_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
      dir.path().join("resources.json"),
      r#"{"/": "h0", "main.js": "h1"}"#,
    )
    .unwrap();
    let yaml = "
origin: https://app.test
manifest: resources.json
shell: [main.js]
";
    let config = Config::from_yaml(yaml, dir.path().to_path_buf()).unwrap();

    let worker = config.worker_config().unwrap();
    assert_eq!(worker.manifest, manifest());
    assert_eq!(worker.shell.iter().collect::<Vec<_>>(), vec!["main.js"]);
  }

  #[test]
  fn test_origin_with_path_is_rejected() {
    let err = WorkerConfig::new(
      "https://app.test/app/",
      manifest(),
      vec![],
      CacheNames::default(),
      true,
    )
    .unwrap_err();
    assert!(err.to_string().contains("Origin"));
  }

  #[test]
  fn test_shell_outside_manifest_is_rejected() {
    let result = WorkerConfig::new(
      "https://app.test",
      manifest(),
      vec!["other.js".into()],
      CacheNames::default(),
      true,
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_cache_names_must_differ() {
    let caches = CacheNames {
      staging: "app-cache".to_string(),
      ..CacheNames::default()
    };
    assert!(WorkerConfig::new("https://app.test", manifest(), vec![], caches, true).is_err());
  }
}
