//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use url::Url;

use super::entry_key;
use super::CachedResponse;
use crate::http::Response;

/// Named caches of request URL -> response.
///
/// Every operation is atomic on its own; nothing spans calls. Entries are
/// addressed by URL without its fragment.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist.
  fn open(&self, cache: &str) -> Result<()>;

  /// Whether the named cache exists.
  fn has(&self, cache: &str) -> Result<bool>;

  /// Delete a whole cache with its entries. Returns whether it existed.
  fn delete(&self, cache: &str) -> Result<bool>;

  /// Names of all existing caches.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Request URLs stored in a cache, empty if the cache does not exist.
  fn keys(&self, cache: &str) -> Result<Vec<Url>>;

  /// Look up the response stored for a URL.
  fn get(&self, cache: &str, url: &Url) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry. Creates the cache.
  fn put(&self, cache: &str, url: &Url, response: &Response) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn remove(&self, cache: &str, url: &Url) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage at the given path, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as the value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url)
);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, cache: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;

    Ok(())
  }

  fn has(&self, cache: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM caches WHERE name = ?",
        params![cache],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", cache, e))?;

    Ok(found.is_some())
  }

  fn delete(&self, cache: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", cache, e))?;

    let deleted = tx
      .execute("DELETE FROM caches WHERE name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn keys(&self, cache: &str) -> Result<Vec<Url>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list entries of cache {}: {}", cache, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    urls
      .iter()
      .map(|u| Url::parse(u).map_err(|e| eyre!("Corrupt cache key '{}': {}", u, e)))
      .collect()
  }

  fn get(&self, cache: &str, url: &Url) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT response_url, status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND url = ?",
        params![cache, entry_key(url)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in cache {}: {}", url, cache, e))?;

    match row {
      Some((response_url, status, headers, body, cached_at_str)) => {
        let response = Response {
          url: Url::parse(&response_url)
            .map_err(|e| eyre!("Corrupt response url '{}': {}", response_url, e))?,
          status,
          headers: serde_json::from_str(&headers)
            .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?,
          body,
        };
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, cache: &str, url: &Url, response: &Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, url, response_url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache,
        entry_key(url),
        response.url.as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in cache {}: {}", url, cache, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn remove(&self, cache: &str, url: &Url) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ? AND url = ?",
        params![cache, entry_key(url)],
      )
      .map_err(|e| eyre!("Failed to remove {} from cache {}: {}", url, cache, e))?;

    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
