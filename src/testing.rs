//! Scripted network double shared by the unit tests.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use crate::http::{Request, Response};
use crate::net::{FetchError, Network};

pub const ORIGIN: &str = "https://school.example";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Network stub answering by path (plus query).
///
/// Unscripted paths fail with a transport error, as does every path while
/// `set_offline(true)` is in effect.
#[derive(Default)]
pub struct StubNetwork {
  routes: Mutex<HashMap<String, Result<Response, FetchError>>>,
  offline: Mutex<bool>,
  calls: Mutex<Vec<(Method, String, Option<Vec<u8>>)>>,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), Ok(response));
  }

  pub fn fail(&self, path: &str) {
    self.routes.lock().unwrap().insert(
      path.to_string(),
      Err(FetchError::Transport("connection refused".into())),
    );
  }

  pub fn set_offline(&self, offline: bool) {
    *self.offline.lock().unwrap() = offline;
  }

  /// Every request seen so far as (method, path, body).
  pub fn calls(&self) -> Vec<(Method, String, Option<Vec<u8>>)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, p, _)| p == path)
      .count()
  }
}

#[async_trait]
impl Network for StubNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let path = request.path_and_query();
    self
      .calls
      .lock()
      .unwrap()
      .push((request.method.clone(), path.clone(), request.body.clone()));

    if *self.offline.lock().unwrap() {
      return Err(FetchError::Transport("offline".into()));
    }

    self
      .routes
      .lock()
      .unwrap()
      .get(&path)
      .cloned()
      .unwrap_or_else(|| Err(FetchError::Transport(format!("no route for {}", path))))
  }
}
