//! Core types for the cache store.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A stored response plus the moment it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Capture a response now.
  pub fn new(response: Response) -> Self {
    Self {
      response,
      cached_at: Utc::now(),
    }
  }
}

/// The three logical buckets every generation owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
  /// Manifest resources written at install time
  Static,
  /// API responses and everything served stale-while-revalidate
  Dynamic,
  Image,
}

impl BucketKind {
  pub const ALL: [BucketKind; 3] = [BucketKind::Static, BucketKind::Dynamic, BucketKind::Image];

  pub fn prefix(&self) -> &'static str {
    match self {
      BucketKind::Static => "static",
      BucketKind::Dynamic => "dynamic",
      BucketKind::Image => "image",
    }
  }

  /// Persisted name of this bucket for a generation, e.g. `static-v3`.
  pub fn bucket_name(&self, version: &str) -> String {
    format!("{}-{}", self.prefix(), version)
  }
}

impl std::fmt::Display for BucketKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.prefix())
  }
}

/// Generation tag of a persisted bucket name.
///
/// Returns `None` for names that don't follow the `<kind>-<version>` layout;
/// those never belong to any generation.
pub fn generation_of(bucket_name: &str) -> Option<&str> {
  let (prefix, version) = bucket_name.split_once('-')?;
  let known = BucketKind::ALL.iter().any(|k| k.prefix() == prefix);
  (known && !version.is_empty()).then_some(version)
}
