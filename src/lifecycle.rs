//! Cache generation lifecycle: install (pre-warm the manifest) and activate
//! (prune every other generation).

use futures::future::try_join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{generation_of, Bucket, BucketKind, CacheEntry, CacheStorage};
use crate::http::{CacheKey, Request, Response};
use crate::net::Network;

/// Where a generation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  /// Installed and waiting for the previous generation to let go
  Installed,
  Activating,
  Active,
  /// Replaced, or failed to install
  Redundant,
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LifecycleState::Installing => write!(f, "installing"),
      LifecycleState::Installed => write!(f, "installed (waiting)"),
      LifecycleState::Activating => write!(f, "activating"),
      LifecycleState::Active => write!(f, "active"),
      LifecycleState::Redundant => write!(f, "redundant"),
    }
  }
}

/// A registered engine version and its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub version: String,
  pub state: LifecycleState,
}

impl Generation {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
      state: LifecycleState::Installing,
    }
  }
}

#[derive(Error, Debug)]
pub enum InstallError {
  #[error("Manifest fetch failed for {path}: {reason}")]
  ManifestFetch { path: String, reason: String },

  #[error("Invalid manifest path {path}: {reason}")]
  InvalidPath { path: String, reason: String },

  #[error("Cache storage error: {0}")]
  Storage(String),
}

/// Installs and activates cache generations.
pub struct LifecycleManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  origin: Url,
  manifest: Vec<String>,
}

impl<S: CacheStorage> LifecycleManager<S> {
  pub fn new(storage: Arc<S>, network: Arc<dyn Network>, origin: Url, manifest: Vec<String>) -> Self {
    Self {
      storage,
      network,
      origin,
      manifest,
    }
  }

  /// Pre-warm the `static` bucket of `version` with every manifest entry.
  ///
  /// All or nothing: every entry is fetched before anything is written, and
  /// a single failed fetch rejects the install. Returns the number of
  /// entries written.
  pub async fn install(&self, version: &str) -> Result<usize, InstallError> {
    let requests = self
      .manifest
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(|url| (path.clone(), Request::get(url)))
          .map_err(|e| InstallError::InvalidPath {
            path: path.clone(),
            reason: e.to_string(),
          })
      })
      .collect::<Result<Vec<_>, _>>()?;

    info!(version, entries = requests.len(), "Installing generation");

    let fetched = try_join_all(requests.into_iter().map(|(path, request)| async move {
      let response = self.fetch_manifest_entry(&path, &request).await?;
      Ok::<_, InstallError>((CacheKey::for_request(&request), response))
    }))
    .await?;

    let bucket_name = BucketKind::Static.bucket_name(version);
    if let Err(e) = self.write_all(&bucket_name, &fetched) {
      warn!(version, error = %e, "Install failed while writing manifest");
      self.discard(version, &bucket_name);
      return Err(e);
    }

    info!(version, entries = fetched.len(), "Generation installed");
    Ok(fetched.len())
  }

  async fn fetch_manifest_entry(&self, path: &str, request: &Request) -> Result<Response, InstallError> {
    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => Ok(response),
      Ok(response) => Err(InstallError::ManifestFetch {
        path: path.to_string(),
        reason: format!("status {}", response.status),
      }),
      Err(e) => Err(InstallError::ManifestFetch {
        path: path.to_string(),
        reason: e.to_string(),
      }),
    }
  }

  fn write_all(&self, bucket_name: &str, entries: &[(CacheKey, Response)]) -> Result<(), InstallError> {
    let bucket = Bucket::open(Arc::clone(&self.storage), bucket_name)
      .map_err(|e| InstallError::Storage(e.to_string()))?;

    for (key, response) in entries {
      bucket
        .put(key, &CacheEntry::new(response.clone()))
        .map_err(|e| InstallError::Storage(e.to_string()))?;
    }
    Ok(())
  }

  /// Drop a half-written static bucket, unless it belongs to the serving
  /// generation.
  fn discard(&self, version: &str, bucket_name: &str) {
    let serving = self.storage.current_generation().ok().flatten();
    if serving.as_deref() == Some(version) {
      return;
    }
    if let Err(e) = self.storage.delete_bucket(bucket_name) {
      warn!(bucket = bucket_name, error = %e, "Failed to discard partial install");
    }
  }

  /// Make `version` the current generation and delete every bucket that
  /// belongs to any other. Returns the names of the deleted buckets.
  pub fn activate(&self, version: &str) -> color_eyre::Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.storage.list_buckets()? {
      if generation_of(&name) == Some(version) {
        continue;
      }
      if self.storage.delete_bucket(&name)? {
        debug!(bucket = %name, "Deleted stale bucket");
        deleted.push(name);
      }
    }

    self.storage.set_current_generation(version)?;
    info!(version, deleted = deleted.len(), "Generation activated");
    Ok(deleted)
  }
}
