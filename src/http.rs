//! Request and response shapes that flow through the engine.
//!
//! Callers build a [`Request`], hand it to the engine and get back a
//! [`Response`] with the same shape whether it came from the origin or from a
//! cache bucket.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// Declared resource type of a request, as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  #[default]
  Other,
  /// Top-level navigation
  Document,
  Image,
  Script,
  Style,
  Font,
}

/// An outbound request made by the client application.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      destination: Destination::Other,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  /// Case-insensitive header lookup (first match wins).
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Only http(s) requests are ever intercepted.
  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  /// Whether the request changes server state and belongs in the offline queue.
  pub fn is_mutation(&self) -> bool {
    matches!(
      self.method,
      Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
  }

  /// Navigations and anything that explicitly asks for HTML.
  pub fn accepts_html(&self) -> bool {
    self.destination == Destination::Document
      || self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Path plus query, the part of the URL matched by routing rules.
  pub fn path_and_query(&self) -> String {
    match self.url.query() {
      Some(query) => format!("{}?{}", self.url.path(), query),
      None => self.url.path().to_string(),
    }
  }
}

/// A response as seen by the client application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200).with_body(body)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Canonical (method, URL) identity of a cache entry.
///
/// The readable form is `METHOD url` with the fragment stripped; `Url`
/// already lower-cases scheme and host and drops default ports. The hash is
/// a SHA256 of the readable form, used as the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  canonical: String,
  hash: String,
}

impl CacheKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self::from_canonical(format!("{} {}", method.as_str().to_uppercase(), url))
  }

  pub fn for_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  /// Rebuild a key from its stored readable form.
  pub fn from_canonical(canonical: String) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());
    Self { canonical, hash }
  }

  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  pub fn hash(&self) -> &str {
    &self.hash
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.canonical)
  }
}
