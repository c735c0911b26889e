//! Strategy executors: network-first, cache-first and stale-while-revalidate.
//!
//! An [`Executor`] is bound to one cache generation. Storage failures on the
//! read path are logged and treated as misses; a broken cache must never take
//! the application down with it.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{Bucket, BucketKind, CacheEntry, CacheStorage};
use crate::http::{CacheKey, Request, Response};
use crate::net::{FetchError, Network};

/// Served when an image fails and no configured placeholder is cached.
const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1" viewBox="0 0 1 1"><rect width="1" height="1" fill="#e5e7eb"/></svg>"##;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live response from the origin
  Network,
  /// Stored copy from a cache bucket
  Cache,
  /// Placeholder or app shell substituted for a failed request
  Fallback,
  /// Mutation accepted into the offline queue
  Queued,
  /// Request not intercepted
  PassThrough,
}

/// A response together with its provenance.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  pub fn new(response: Response, source: ResponseSource) -> Self {
    Self { response, source }
  }
}

/// Runs the caching strategies against one generation's buckets.
pub struct Executor<S: CacheStorage> {
  network: Arc<dyn Network>,
  static_bucket: Bucket<S>,
  dynamic_bucket: Bucket<S>,
  image_bucket: Bucket<S>,
  /// App shell: the manifest root, served to HTML navigations while offline
  shell_url: Url,
  image_fallback: Option<Url>,
}

impl<S: CacheStorage> Executor<S> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    version: &str,
    shell_url: Url,
    image_fallback: Option<Url>,
  ) -> Result<Self> {
    Ok(Self {
      network,
      static_bucket: Bucket::open(Arc::clone(&storage), BucketKind::Static.bucket_name(version))?,
      dynamic_bucket: Bucket::open(Arc::clone(&storage), BucketKind::Dynamic.bucket_name(version))?,
      image_bucket: Bucket::open(storage, BucketKind::Image.bucket_name(version))?,
      shell_url,
      image_fallback,
    })
  }

  pub fn bucket(&self, kind: BucketKind) -> &Bucket<S> {
    match kind {
      BucketKind::Static => &self.static_bucket,
      BucketKind::Dynamic => &self.dynamic_bucket,
      BucketKind::Image => &self.image_bucket,
    }
  }

  /// Live response first; the cached copy only when the origin fails.
  ///
  /// With `store` set, successful responses are written to `dynamic`. A
  /// transport failure with no cached copy is propagated; a non-2xx with no
  /// cached copy is returned as the origin sent it.
  pub async fn network_first(&self, request: &Request, store: bool) -> Result<Served, FetchError> {
    let key = CacheKey::for_request(request);

    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        if store {
          self.store(&self.dynamic_bucket, key, &response).await;
        }
        Ok(Served::new(response, ResponseSource::Network))
      }
      Ok(response) => {
        debug!(key = %key, status = response.status, "Origin returned error status, trying cache");
        match self.lookup(&self.dynamic_bucket, &key) {
          Some(entry) => Ok(Served::new(entry.response, ResponseSource::Cache)),
          None => Ok(Served::new(response, ResponseSource::Network)),
        }
      }
      Err(e) => {
        debug!(key = %key, error = %e, "Origin unreachable, trying cache");
        match self.lookup(&self.dynamic_bucket, &key) {
          Some(entry) => Ok(Served::new(entry.response, ResponseSource::Cache)),
          None => Err(e),
        }
      }
    }
  }

  /// Cached copy first; the network only on a miss.
  ///
  /// Never fails: an image that can't be loaded is replaced by the
  /// configured placeholder, or a built-in one.
  pub async fn cache_first(&self, request: &Request) -> Served {
    let key = CacheKey::for_request(request);

    if let Some(entry) = self.lookup(&self.image_bucket, &key) {
      return Served::new(entry.response, ResponseSource::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        self.store(&self.image_bucket, key, &response).await;
        Served::new(response, ResponseSource::Network)
      }
      Ok(response) => {
        debug!(key = %key, status = response.status, "Image request failed, serving placeholder");
        Served::new(self.image_placeholder(), ResponseSource::Fallback)
      }
      Err(e) => {
        debug!(key = %key, error = %e, "Image request failed, serving placeholder");
        Served::new(self.image_placeholder(), ResponseSource::Fallback)
      }
    }
  }

  /// Cached copy immediately, refreshed by a detached background fetch.
  ///
  /// On a miss this behaves like network-first for the one request, except
  /// that HTML requests fall back to the app shell when the origin is
  /// unreachable. An error status that did reach us is returned as-is, for
  /// navigations too: the shell stands in for a missing connection, not for
  /// a page the origin refused or failed to render.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<Served, FetchError> {
    let key = CacheKey::for_request(request);

    let cached = self.lookup(&self.dynamic_bucket, &key).or_else(|| {
      if request.url == self.shell_url {
        self.lookup(&self.static_bucket, &key)
      } else {
        None
      }
    });

    if let Some(entry) = cached {
      self.revalidate(request.clone(), key);
      return Ok(Served::new(entry.response, ResponseSource::Cache));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&self.dynamic_bucket, key, &response).await;
        }
        Ok(Served::new(response, ResponseSource::Network))
      }
      Err(e) if request.accepts_html() => match self.shell() {
        Some(shell) => {
          debug!(key = %key, error = %e, "Navigation failed, serving app shell");
          Ok(Served::new(shell, ResponseSource::Fallback))
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  /// Fire-and-forget refresh of a cached entry. Errors stop here.
  fn revalidate(&self, request: Request, key: CacheKey) {
    let network = Arc::clone(&self.network);
    let bucket = self.dynamic_bucket.clone();

    tokio::spawn(async move {
      match network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = bucket.put_detached(key.clone(), CacheEntry::new(response)).await {
            debug!(key = %key, error = %e, "Background refresh could not be stored");
          }
        }
        Ok(response) => {
          debug!(key = %key, status = response.status, "Background refresh rejected by origin");
        }
        Err(e) => {
          debug!(key = %key, error = %e, "Background refresh failed");
        }
      }
    });
  }

  fn lookup(&self, bucket: &Bucket<S>, key: &CacheKey) -> Option<CacheEntry> {
    match bucket.get(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(bucket = bucket.name(), key = %key, error = %e, "Cache read failed");
        None
      }
    }
  }

  async fn store(&self, bucket: &Bucket<S>, key: CacheKey, response: &Response) {
    if let Err(e) = bucket
      .put_detached(key.clone(), CacheEntry::new(response.clone()))
      .await
    {
      warn!(bucket = bucket.name(), key = %key, error = %e, "Cache write failed");
    }
  }

  /// The manifest root entry.
  fn shell(&self) -> Option<Response> {
    let key = CacheKey::new(&reqwest::Method::GET, &self.shell_url);
    self
      .lookup(&self.static_bucket, &key)
      .or_else(|| self.lookup(&self.dynamic_bucket, &key))
      .map(|entry| entry.response)
  }

  fn image_placeholder(&self) -> Response {
    let configured = self.image_fallback.as_ref().and_then(|url| {
      let key = CacheKey::new(&reqwest::Method::GET, url);
      self
        .lookup(&self.static_bucket, &key)
        .or_else(|| self.lookup(&self.image_bucket, &key))
    });

    match configured {
      Some(entry) => entry.response,
      None => Response::ok(PLACEHOLDER_SVG).with_header("Content-Type", "image/svg+xml"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Destination;
  use crate::testing::{url, StubNetwork};
  use std::time::Duration;

  struct Fixture {
    network: Arc<StubNetwork>,
    executor: Executor<SqliteStorage>,
  }

  fn fixture(image_fallback: Option<&str>) -> Fixture {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(StubNetwork::new());
    let executor = Executor::new(
      storage,
      network.clone(),
      "v1",
      url("/"),
      image_fallback.map(url),
    )
    .unwrap();
    Fixture { network, executor }
  }

  fn seed(executor: &Executor<SqliteStorage>, kind: BucketKind, path: &str, body: &str) {
    let key = CacheKey::new(&reqwest::Method::GET, &url(path));
    executor
      .bucket(kind)
      .put(&key, &CacheEntry::new(Response::ok(body)))
      .unwrap();
  }

  fn cached_body(executor: &Executor<SqliteStorage>, kind: BucketKind, path: &str) -> Option<Vec<u8>> {
    let key = CacheKey::new(&reqwest::Method::GET, &url(path));
    executor
      .bucket(kind)
      .get(&key)
      .unwrap()
      .map(|e| e.response.body)
  }

  #[tokio::test]
  async fn test_network_first_stores_allow_listed_success() {
    let f = fixture(None);
    f.network.respond("/api/tests", Response::ok("[1,2]"));

    let served = f
      .executor
      .network_first(&Request::get(url("/api/tests")), true)
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.body, b"[1,2]");
    assert_eq!(
      cached_body(&f.executor, BucketKind::Dynamic, "/api/tests"),
      Some(b"[1,2]".to_vec())
    );
  }

  #[tokio::test]
  async fn test_network_first_without_store_leaves_cache_alone() {
    let f = fixture(None);
    f.network.respond("/api/users/me", Response::ok("me"));

    f.executor
      .network_first(&Request::get(url("/api/users/me")), false)
      .await
      .unwrap();

    assert_eq!(cached_body(&f.executor, BucketKind::Dynamic, "/api/users/me"), None);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache_on_network_error() {
    let f = fixture(None);
    seed(&f.executor, BucketKind::Dynamic, "/api/tests", "cached");
    f.network.fail("/api/tests");

    let served = f
      .executor
      .network_first(&Request::get(url("/api/tests")), true)
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_propagates_when_both_miss() {
    let f = fixture(None);
    f.network.fail("/api/tests");

    let result = f
      .executor
      .network_first(&Request::get(url("/api/tests")), true)
      .await;

    assert!(matches!(result, Err(FetchError::Transport(_))));
  }

  #[tokio::test]
  async fn test_network_first_error_status() {
    let f = fixture(None);
    f.network.respond("/api/tests", Response::new(503));
    let served = f
      .executor
      .network_first(&Request::get(url("/api/tests")), true)
      .await
      .unwrap();
    assert_eq!(served.response.status, 503);
    assert_eq!(cached_body(&f.executor, BucketKind::Dynamic, "/api/tests"), None);

    seed(&f.executor, BucketKind::Dynamic, "/api/tests", "cached");
    let served = f
      .executor
      .network_first(&Request::get(url("/api/tests")), true)
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_cache_first_hit_never_touches_network() {
    let f = fixture(None);
    f.network.respond("/img/logo.png", Response::ok("png"));
    let request = Request::get(url("/img/logo.png")).with_destination(Destination::Image);

    let first = f.executor.cache_first(&request).await;
    assert_eq!(first.source, ResponseSource::Network);

    f.network.fail("/img/logo.png");
    for _ in 0..3 {
      let again = f.executor.cache_first(&request).await;
      assert_eq!(again.source, ResponseSource::Cache);
      assert_eq!(again.response.body, b"png");
    }
    assert_eq!(f.network.call_count("/img/logo.png"), 1);
  }

  #[tokio::test]
  async fn test_cache_first_failure_serves_builtin_placeholder() {
    let f = fixture(None);
    f.network.fail("/img/missing.png");

    let served = f.executor.cache_first(&Request::get(url("/img/missing.png"))).await;

    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.status, 200);
    assert_eq!(served.response.content_type(), Some("image/svg+xml"));
  }

  #[tokio::test]
  async fn test_cache_first_failure_serves_configured_placeholder() {
    let f = fixture(Some("/img/placeholder.svg"));
    seed(&f.executor, BucketKind::Static, "/img/placeholder.svg", "<svg/>");
    f.network.respond("/img/gone.png", Response::new(404));

    let served = f.executor.cache_first(&Request::get(url("/img/gone.png"))).await;

    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.body, b"<svg/>");
    assert_eq!(cached_body(&f.executor, BucketKind::Image, "/img/gone.png"), None);
  }

  #[tokio::test]
  async fn test_swr_hit_returns_cached_even_if_refresh_fails() {
    let f = fixture(None);
    seed(&f.executor, BucketKind::Dynamic, "/dashboard", "cached dashboard");
    f.network.fail("/dashboard");

    let served = f
      .executor
      .stale_while_revalidate(&Request::get(url("/dashboard")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"cached dashboard");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
      cached_body(&f.executor, BucketKind::Dynamic, "/dashboard"),
      Some(b"cached dashboard".to_vec())
    );
  }

  #[tokio::test]
  async fn test_swr_hit_refreshes_in_background() {
    let f = fixture(None);
    seed(&f.executor, BucketKind::Dynamic, "/dashboard", "old");
    f.network.respond("/dashboard", Response::ok("new"));

    let served = f
      .executor
      .stale_while_revalidate(&Request::get(url("/dashboard")))
      .await
      .unwrap();
    assert_eq!(served.response.body, b"old");

    let mut refreshed = false;
    for _ in 0..100 {
      if cached_body(&f.executor, BucketKind::Dynamic, "/dashboard") == Some(b"new".to_vec()) {
        refreshed = true;
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed);
  }

  #[tokio::test]
  async fn test_swr_root_reads_static_bucket() {
    let f = fixture(None);
    seed(&f.executor, BucketKind::Static, "/", "shell");
    f.network.fail("/");

    let served = f
      .executor
      .stale_while_revalidate(&Request::get(url("/")))
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"shell");
  }

  #[tokio::test]
  async fn test_swr_miss_caches_network_response() {
    let f = fixture(None);
    f.network.respond("/assets/app.js", Response::ok("js"));

    let served = f
      .executor
      .stale_while_revalidate(&Request::get(url("/assets/app.js")))
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(
      cached_body(&f.executor, BucketKind::Dynamic, "/assets/app.js"),
      Some(b"js".to_vec())
    );
  }

  #[tokio::test]
  async fn test_swr_offline_navigation_gets_app_shell() {
    let f = fixture(None);
    seed(&f.executor, BucketKind::Static, "/", "shell");
    f.network.set_offline(true);

    let navigation = Request::get(url("/reports")).with_destination(Destination::Document);
    let served = f.executor.stale_while_revalidate(&navigation).await.unwrap();
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.body, b"shell");

    let script = Request::get(url("/assets/chart.js"));
    assert!(f.executor.stale_while_revalidate(&script).await.is_err());
  }

  #[tokio::test]
  async fn test_swr_navigation_error_status_is_not_replaced_by_shell() {
    let f = fixture(None);
    seed(&f.executor, BucketKind::Static, "/", "shell");
    f.network.respond("/reports", Response::new(503));

    let navigation = Request::get(url("/reports")).with_destination(Destination::Document);
    let served = f.executor.stale_while_revalidate(&navigation).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.status, 503);
    assert_eq!(cached_body(&f.executor, BucketKind::Dynamic, "/reports"), None);
  }
}
