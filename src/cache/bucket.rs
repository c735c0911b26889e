//! Named bucket handle over a shared storage backend.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::CacheEntry;
use crate::http::CacheKey;

/// A named bucket opened on a storage backend.
///
/// Handles are cheap to clone; every clone talks to the same storage.
pub struct Bucket<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> Bucket<S> {
  /// Open a bucket, creating it if it doesn't exist yet.
  pub fn open(storage: Arc<S>, name: impl Into<String>) -> Result<Self> {
    let name = name.into();
    storage.create_bucket(&name)?;
    Ok(Self { name, storage })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    self.storage.get(&self.name, key)
  }

  pub fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    self.storage.put(&self.name, key, entry)
  }

  /// Write on a blocking task and wait for it.
  ///
  /// If the awaiting future is dropped the write still runs to completion,
  /// so an aborted request never leaves a half-written entry behind.
  pub async fn put_detached(&self, key: CacheKey, entry: CacheEntry) -> Result<()> {
    let bucket = self.clone();
    tokio::task::spawn_blocking(move || bucket.put(&key, &entry))
      .await
      .map_err(|e| eyre!("Cache write task failed: {}", e))?
  }

  pub fn delete(&self, key: &CacheKey) -> Result<bool> {
    self.storage.delete(&self.name, key)
  }

  pub fn keys(&self) -> Result<Vec<CacheKey>> {
    self.storage.keys(&self.name)
  }
}

impl<S: CacheStorage> Clone for Bucket<S> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      storage: Arc::clone(&self.storage),
    }
  }
}
