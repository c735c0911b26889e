//! The network origin behind the engine.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use thiserror::Error;

use crate::http::{Request, Response};

/// Transport-level failure: the origin could not be reached at all.
///
/// A non-2xx status is not a `FetchError`; it comes back as a [`Response`]
/// and the strategies decide whether to treat it as a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Network error: {0}")]
  Transport(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_builder() {
      FetchError::InvalidRequest(e.to_string())
    } else {
      FetchError::Transport(e.to_string())
    }
  }
}

/// Something that can perform a request against the origin.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// `reqwest`-backed origin client.
///
/// Method, headers and body are forwarded exactly as received, including
/// `Authorization`.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
