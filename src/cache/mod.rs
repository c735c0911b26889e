//! Persistent response cache organised in named buckets.
//!
//! This module provides:
//! - Buckets of canonical (method, URL) → response entries
//! - A SQLite backend and a no-op backend for disabled caching
//! - The atomic "current generation" pointer used by the lifecycle manager

mod bucket;
mod storage;
mod traits;

pub use bucket::Bucket;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{generation_of, BucketKind, CacheEntry};
