//! Durable queue of mutating requests made while the origin was unreachable.
//!
//! Mutations are replayed strictly in enqueue order. The first failure ends
//! the pass; the next reconnect starts a new one from the same item.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use url::Url;

use crate::http::Request;
use crate::net::Network;

/// A mutation waiting for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMutation {
  /// Monotonic across restarts
  pub id: i64,
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
  /// Replay attempts made so far
  pub attempt_count: u32,
}

impl QueuedMutation {
  /// Rebuild the original request, headers and body untouched.
  pub fn to_request(&self) -> Request {
    Request {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      destination: Default::default(),
    }
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
  /// Mutations the origin accepted and that were removed
  pub replayed: usize,
  /// Mutations discarded for exceeding `max_attempts`
  pub dropped: usize,
  /// Queue depth after the pass
  pub remaining: usize,
  /// Id of the mutation that stopped the pass, if any
  pub halted_at: Option<i64>,
}

/// SQLite-backed FIFO of mutations.
pub struct MutationQueue {
  conn: Mutex<Connection>,
  /// Serializes replay passes
  replay_lock: tokio::sync::Mutex<()>,
  max_attempts: Option<u32>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0
);
"#;

type MutationRow = (i64, String, String, String, Option<Vec<u8>>, String, u32);

const SELECT_MUTATION: &str =
  "SELECT id, method, url, headers, body, enqueued_at, attempt_count FROM mutations";

impl MutationQueue {
  /// Open (or create) the queue database at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      replay_lock: tokio::sync::Mutex::new(()),
      max_attempts: None,
    })
  }

  /// Drop mutations that have already been attempted this many times.
  pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Persist a mutation. Returns its id.
  pub fn enqueue(&self, request: &Request) -> Result<i64> {
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO mutations (method, url, headers, body, enqueued_at, attempt_count)
         VALUES (?, ?, ?, ?, ?, 0)",
        params![
          request.method.as_str(),
          request.url.as_str(),
          headers,
          request.body,
          Utc::now().to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    let id = conn.last_insert_rowid();
    info!(id, method = %request.method, url = %request.url, "Mutation queued for replay");
    Ok(id)
  }

  /// Everything still waiting, oldest first.
  pub fn pending(&self) -> Result<Vec<QueuedMutation>> {
    let rows: Vec<MutationRow> = {
      let conn = self.lock()?;
      let mut stmt = conn
        .prepare(&format!("{} ORDER BY id", SELECT_MUTATION))
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let rows = stmt
        .query_map([], read_row)
        .map_err(|e| eyre!("Failed to list queued mutations: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;
      rows
    };

    rows.into_iter().map(into_mutation).collect()
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queued mutations: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  fn front(&self) -> Result<Option<QueuedMutation>> {
    let row = self
      .lock()?
      .query_row(
        &format!("{} ORDER BY id LIMIT 1", SELECT_MUTATION),
        [],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue head: {}", e))?;

    row.map(into_mutation).transpose()
  }

  fn record_attempt(&self, id: i64) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE mutations SET attempt_count = attempt_count + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to record replay attempt for {}: {}", id, e))?;
    Ok(())
  }

  fn remove(&self, id: i64) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to dequeue mutation {}: {}", id, e))?;
    Ok(())
  }

  /// Re-issue queued mutations in order until the queue is empty or one fails.
  ///
  /// Only a 2xx counts as success. Concurrent calls run one after another.
  pub async fn replay(&self, network: &dyn Network) -> Result<ReplayReport> {
    let _pass = self.replay_lock.lock().await;
    let mut report = ReplayReport::default();

    while let Some(mutation) = self.front()? {
      if let Some(max) = self.max_attempts {
        if mutation.attempt_count >= max {
          warn!(
            id = mutation.id,
            attempts = mutation.attempt_count,
            url = %mutation.url,
            "Dropping mutation after too many failed replays"
          );
          self.remove(mutation.id)?;
          report.dropped += 1;
          continue;
        }
      }

      self.record_attempt(mutation.id)?;

      match network.fetch(&mutation.to_request()).await {
        Ok(response) if response.is_success() => {
          self.remove(mutation.id)?;
          report.replayed += 1;
          info!(id = mutation.id, url = %mutation.url, "Replayed queued mutation");
        }
        Ok(response) => {
          warn!(
            id = mutation.id,
            status = response.status,
            url = %mutation.url,
            "Replay rejected by origin, pausing queue"
          );
          report.halted_at = Some(mutation.id);
          break;
        }
        Err(e) => {
          warn!(id = mutation.id, error = %e, url = %mutation.url, "Replay failed, pausing queue");
          report.halted_at = Some(mutation.id);
          break;
        }
      }
    }

    report.remaining = self.len()?;
    Ok(report)
  }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn into_mutation(row: MutationRow) -> Result<QueuedMutation> {
  let (id, method, url, headers, body, enqueued_at, attempt_count) = row;

  Ok(QueuedMutation {
    id,
    method: Method::from_bytes(method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}' in queue: {}", method, e))?,
    url: Url::parse(&url).map_err(|e| eyre!("Invalid URL '{}' in queue: {}", url, e))?,
    headers: serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of mutation {}: {}", id, e))?,
    body,
    enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse datetime '{}': {}", enqueued_at, e))?,
    attempt_count,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::{url, StubNetwork};

  fn post(path: &str, body: &str) -> Request {
    Request::new(Method::POST, url(path))
      .with_header("Authorization", "Bearer t0ken")
      .with_header("Content-Type", "application/json")
      .with_body(body.as_bytes().to_vec())
  }

  #[test]
  fn test_enqueue_preserves_request() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let request = post("/api/answers", r#"{"q":1}"#);
    let id = queue.enqueue(&request).unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    let m = &pending[0];
    assert_eq!(m.id, id);
    assert_eq!(m.method, Method::POST);
    assert_eq!(m.url, request.url);
    assert_eq!(m.headers, request.headers);
    assert_eq!(m.body, request.body);
    assert_eq!(m.attempt_count, 0);
    assert_eq!(m.to_request().header("authorization"), Some("Bearer t0ken"));
  }

  #[test]
  fn test_ids_are_monotonic() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let a = queue.enqueue(&post("/api/a", "a")).unwrap();
    let b = queue.enqueue(&post("/api/b", "b")).unwrap();
    assert!(b > a);
  }

  #[tokio::test]
  async fn test_replay_drains_in_order() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let network = StubNetwork::new();
    for i in 0..5 {
      let path = format!("/api/answers/{}", i);
      network.respond(&path, Response::new(201));
      queue.enqueue(&post(&path, &i.to_string())).unwrap();
    }

    let report = queue.replay(&network).await.unwrap();

    assert_eq!(report.replayed, 5);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.halted_at, None);
    assert!(queue.is_empty().unwrap());

    let issued: Vec<String> = network.calls().into_iter().map(|(_, p, _)| p).collect();
    let expected: Vec<String> = (0..5).map(|i| format!("/api/answers/{}", i)).collect();
    assert_eq!(issued, expected);
    assert!(network.calls().iter().all(|(m, _, _)| *m == Method::POST));
  }

  #[tokio::test]
  async fn test_replay_halts_on_failure_and_resumes() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let network = StubNetwork::new();
    network.respond("/api/a", Response::new(200));
    network.fail("/api/b");
    network.respond("/api/c", Response::new(200));
    queue.enqueue(&post("/api/a", "a")).unwrap();
    let b = queue.enqueue(&post("/api/b", "b")).unwrap();
    queue.enqueue(&post("/api/c", "c")).unwrap();

    let first = queue.replay(&network).await.unwrap();
    assert_eq!(first.replayed, 1);
    assert_eq!(first.remaining, 2);
    assert_eq!(first.halted_at, Some(b));
    assert_eq!(network.call_count("/api/c"), 0);

    let pending = queue.pending().unwrap();
    assert_eq!(pending[0].url.path(), "/api/b");
    assert_eq!(pending[0].attempt_count, 1);
    assert_eq!(pending[1].url.path(), "/api/c");
    assert_eq!(pending[1].attempt_count, 0);

    network.respond("/api/b", Response::new(200));
    let second = queue.replay(&network).await.unwrap();
    assert_eq!(second.replayed, 2);
    assert_eq!(second.remaining, 0);

    let issued: Vec<String> = network.calls().into_iter().map(|(_, p, _)| p).collect();
    assert_eq!(issued, vec!["/api/a", "/api/b", "/api/b", "/api/c"]);
  }

  #[tokio::test]
  async fn test_error_status_halts_replay() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let network = StubNetwork::new();
    network.respond("/api/a", Response::new(500));
    queue.enqueue(&post("/api/a", "a")).unwrap();

    let report = queue.replay(&network).await.unwrap();
    assert_eq!(report.replayed, 0);
    assert_eq!(report.remaining, 1);
  }

  #[tokio::test]
  async fn test_max_attempts_drops_poison_mutation() {
    let queue = MutationQueue::open_in_memory()
      .unwrap()
      .with_max_attempts(Some(2));
    let network = StubNetwork::new();
    network.respond("/api/bad", Response::new(422));
    network.respond("/api/good", Response::new(200));
    queue.enqueue(&post("/api/bad", "x")).unwrap();
    queue.enqueue(&post("/api/good", "y")).unwrap();

    assert_eq!(queue.replay(&network).await.unwrap().remaining, 2);
    assert_eq!(queue.replay(&network).await.unwrap().remaining, 2);

    let third = queue.replay(&network).await.unwrap();
    assert_eq!(third.dropped, 1);
    assert_eq!(third.replayed, 1);
    assert_eq!(third.remaining, 0);
    assert_eq!(network.call_count("/api/bad"), 2);
  }

  #[tokio::test]
  async fn test_concurrent_replays_do_not_duplicate() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let network = StubNetwork::new();
    for path in ["/api/a", "/api/b", "/api/c"] {
      network.respond(path, Response::new(200));
      queue.enqueue(&post(path, "x")).unwrap();
    }

    let (first, second) = tokio::join!(queue.replay(&network), queue.replay(&network));

    assert_eq!(first.unwrap().replayed + second.unwrap().replayed, 3);
    assert_eq!(network.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let first_id = {
      let queue = MutationQueue::open_at(&path).unwrap();
      let id = queue.enqueue(&post("/api/a", "a")).unwrap();
      queue.enqueue(&post("/api/b", "b")).unwrap();
      id
    };

    let queue = MutationQueue::open_at(&path).unwrap();
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first_id);
    assert_eq!(pending[1].body.as_deref(), Some(&b"b"[..]));

    let network = StubNetwork::new();
    network.respond("/api/a", Response::new(200));
    network.respond("/api/b", Response::new(200));
    queue.replay(&network).await.unwrap();
    let next = queue.enqueue(&post("/api/c", "c")).unwrap();
    assert!(next > pending[1].id);
  }
}
