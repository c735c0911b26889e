//! Request classification: which strategy serves a request, from which bucket.

use color_eyre::{eyre::eyre, Result};
use regex::RegexSet;

use crate::cache::BucketKind;
use crate::config::Config;
use crate::http::{Destination, Request};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "ico"];

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Live response first, cached copy when the origin is unreachable.
  /// `store` is set when the response may be written to the cache.
  NetworkFirst { store: bool },
  /// Cached copy first; network only on a miss. No background refresh.
  CacheFirst,
  /// Cached copy immediately, refreshed in the background.
  StaleWhileRevalidate,
  /// State-changing request, queued for replay when the origin is unreachable.
  Mutation,
}

impl Route {
  /// Bucket the route reads from and writes to.
  pub fn bucket(&self) -> Option<BucketKind> {
    match self {
      Route::NetworkFirst { .. } | Route::StaleWhileRevalidate => Some(BucketKind::Dynamic),
      Route::CacheFirst => Some(BucketKind::Image),
      Route::Mutation => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Route::NetworkFirst { .. } => "network-first",
      Route::CacheFirst => "cache-first",
      Route::StaleWhileRevalidate => "stale-while-revalidate",
      Route::Mutation => "mutation",
    }
  }
}

/// Classifies outbound requests against the configured API prefix and
/// response-caching allow-list.
#[derive(Debug, Clone)]
pub struct Router {
  api_prefix: String,
  cache_allow: RegexSet,
}

impl Router {
  pub fn new(api_prefix: impl Into<String>, cache_allow: &[String]) -> Result<Self> {
    let cache_allow = RegexSet::new(cache_allow)
      .map_err(|e| eyre!("Invalid api.cache_allow pattern: {}", e))?;

    Ok(Self {
      api_prefix: api_prefix.into(),
      cache_allow,
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(config.api.prefix.clone(), &config.api.cache_allow)
  }

  /// Pick the route for a request, or `None` to pass it through untouched.
  ///
  /// Precedence is fixed: allow-listed API calls, then images, then
  /// everything else. Image detection is evaluated on its own so an image
  /// under the API prefix that isn't allow-listed still goes cache-first.
  pub fn classify(&self, request: &Request) -> Option<Route> {
    if !request.is_http() {
      return None;
    }
    if request.is_mutation() {
      return Some(Route::Mutation);
    }
    if request.method != reqwest::Method::GET {
      return None;
    }

    let is_api = self.is_api(request);
    let cacheable_api = is_api && self.is_cache_eligible(request);
    let is_image = is_image(request);

    let route = if cacheable_api {
      Route::NetworkFirst { store: true }
    } else if is_image {
      Route::CacheFirst
    } else if is_api {
      Route::NetworkFirst { store: false }
    } else {
      Route::StaleWhileRevalidate
    };

    Some(route)
  }

  pub fn is_api(&self, request: &Request) -> bool {
    request.url.path().starts_with(&self.api_prefix)
  }

  /// Whether the allow-list permits caching this request's response.
  pub fn is_cache_eligible(&self, request: &Request) -> bool {
    self.cache_allow.is_match(&request.path_and_query())
  }
}

fn is_image(request: &Request) -> bool {
  if request.destination == Destination::Image {
    return true;
  }

  let last_segment = request.url.path().rsplit('/').next().unwrap_or_default();
  match last_segment.rsplit_once('.') {
    Some((_, ext)) => IMAGE_EXTENSIONS
      .iter()
      .any(|known| known.eq_ignore_ascii_case(ext)),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::url;
  use reqwest::Method;
  use url::Url;

  fn router() -> Router {
    Router::new("/api/", &["^/api/tests".to_string(), "^/api/subjects$".to_string()]).unwrap()
  }

  #[test]
  fn test_allow_listed_api_is_network_first_and_stored() {
    let route = router().classify(&Request::get(url("/api/tests?page=2")));
    assert_eq!(route, Some(Route::NetworkFirst { store: true }));
    assert_eq!(route.unwrap().bucket(), Some(BucketKind::Dynamic));
  }

  #[test]
  fn test_other_api_is_network_first_without_storing() {
    let route = router().classify(&Request::get(url("/api/users/me")));
    assert_eq!(route, Some(Route::NetworkFirst { store: false }));
  }

  #[test]
  fn test_images_by_extension_or_destination() {
    let r = router();
    assert_eq!(
      r.classify(&Request::get(url("/static/logo.PNG"))),
      Some(Route::CacheFirst)
    );
    assert_eq!(
      r.classify(&Request::get(url("/favicon.ico"))),
      Some(Route::CacheFirst)
    );
    assert_eq!(
      r.classify(&Request::get(url("/avatar/42")).with_destination(Destination::Image)),
      Some(Route::CacheFirst)
    );
    assert_eq!(
      r.classify(&Request::get(url("/api/avatars/42.png"))),
      Some(Route::CacheFirst)
    );
    assert_eq!(
      r.classify(&Request::get(url("/api/tests/cover.png"))),
      Some(Route::NetworkFirst { store: true })
    );
  }

  #[test]
  fn test_everything_else_is_stale_while_revalidate() {
    let r = router();
    assert_eq!(
      r.classify(&Request::get(url("/dashboard"))),
      Some(Route::StaleWhileRevalidate)
    );
    assert_eq!(
      r.classify(&Request::get(url("/assets/app.js"))),
      Some(Route::StaleWhileRevalidate)
    );
    assert_eq!(
      r.classify(&Request::get(url("/png-guide"))),
      Some(Route::StaleWhileRevalidate)
    );
  }

  #[test]
  fn test_non_http_and_non_get_pass_through() {
    let r = router();
    let ext = Request::get(Url::parse("chrome-extension://abc/icon.png").unwrap());
    assert_eq!(r.classify(&ext), None);
    assert_eq!(r.classify(&Request::new(Method::HEAD, url("/dashboard"))), None);
    assert_eq!(r.classify(&Request::new(Method::OPTIONS, url("/api/tests"))), None);
  }

  #[test]
  fn test_mutations() {
    let r = router();
    for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
      assert_eq!(
        r.classify(&Request::new(method, url("/api/answers"))),
        Some(Route::Mutation)
      );
    }
  }

  #[test]
  fn test_invalid_pattern_rejected() {
    assert!(Router::new("/api/", &["(".to_string()]).is_err());
  }
}
