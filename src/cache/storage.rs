//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::CacheEntry;
use crate::http::{CacheKey, Response};

/// Trait for cache storage backends.
///
/// Every operation is atomic per entry. Writers racing on the same key
/// resolve last-write-wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Make sure a bucket exists so it shows up in `list_buckets`.
  fn create_bucket(&self, bucket: &str) -> Result<()>;

  /// Look up an entry.
  fn get(&self, bucket: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any previous one with the same key.
  ///
  /// Fails if the bucket was never created or has been deleted, so a late
  /// write can't resurrect a pruned generation.
  fn put(&self, bucket: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

  /// Remove an entry. Returns whether it existed.
  fn delete(&self, bucket: &str, key: &CacheKey) -> Result<bool>;

  /// All keys currently in a bucket.
  fn keys(&self, bucket: &str) -> Result<Vec<CacheKey>>;

  /// Names of every persisted bucket.
  fn list_buckets(&self) -> Result<Vec<String>>;

  /// Drop a bucket and all of its entries. Returns whether it existed.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// The version whose buckets currently serve requests.
  fn current_generation(&self) -> Result<Option<String>>;

  /// Atomically move the generation pointer.
  fn set_current_generation(&self, version: &str) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn create_bucket(&self, _bucket: &str) -> Result<()> {
    Ok(())
  }

  fn get(&self, _bucket: &str, _key: &CacheKey) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _bucket: &str, _key: &CacheKey, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _bucket: &str, _key: &CacheKey) -> Result<bool> {
    Ok(false)
  }

  fn keys(&self, _bucket: &str) -> Result<Vec<CacheKey>> {
    Ok(Vec::new())
  }

  fn list_buckets(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_bucket(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }

  fn current_generation(&self) -> Result<Option<String>> {
    Ok(None)
  }

  fn set_current_generation(&self, _version: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Volatile store that lives as long as the process.
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

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- One row per cached response; key_hash is the SHA256 of `canonical`
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    canonical TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (bucket, key_hash)
);

-- Single-row settings such as the current generation pointer
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const GENERATION_KEY: &str = "current_generation";

impl CacheStorage for SqliteStorage {
  fn create_bucket(&self, bucket: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, ?)",
        params![bucket, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;
    Ok(())
  }

  fn get(&self, bucket: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let Some((status, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;

    Ok(Some(CacheEntry {
      response: Response {
        status,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, bucket: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: bool = tx
      .query_row(
        "SELECT EXISTS (SELECT 1 FROM buckets WHERE name = ?)",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))?;
    if !exists {
      return Err(eyre!("Bucket {} does not exist", bucket));
    }

    tx.execute(
      "INSERT OR REPLACE INTO entries (bucket, key_hash, canonical, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        bucket,
        key.hash(),
        key.canonical(),
        entry.response.status,
        headers,
        entry.response.body,
        entry.cached_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, bucket: &str, key: &CacheKey) -> Result<bool> {
    let removed = self
      .lock()?
      .execute(
        "DELETE FROM entries WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.hash()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, bucket: &str) -> Result<Vec<CacheKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT canonical FROM entries WHERE bucket = ? ORDER BY canonical")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![bucket], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", bucket, e))?
      .filter_map(|r| r.ok())
      .map(CacheKey::from_canonical)
      .collect();

    Ok(keys)
  }

  fn list_buckets(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn current_generation(&self) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT value FROM meta WHERE key = ?",
        params![GENERATION_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read current generation: {}", e))
  }

  fn set_current_generation(&self, version: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![GENERATION_KEY, version],
      )
      .map_err(|e| eyre!("Failed to set current generation: {}", e))?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp as written by `put`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
