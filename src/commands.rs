//! CLI subcommands and their handlers

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;

use crate::cache::{BucketKind, CacheStorage};
use crate::config::Config;
use crate::engine::{Engine, EngineEvent, EngineOutcome};
use crate::http::{Destination, Request};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Install the configured version and activate it
  Install,
  /// Activate a waiting generation, or prune stale buckets
  Activate,
  /// Send one request through the engine
  Fetch {
    /// Absolute URL, or a path resolved against the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Extra header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Declare the request as an image load
    #[arg(long, conflicts_with = "document")]
    image: bool,
    /// Declare the request as a page navigation
    #[arg(long)]
    document: bool,
  },
  /// Replay queued mutations now
  Replay,
  /// Show generation, buckets and queue depth
  Status,
  /// List cached keys per bucket
  Buckets,
  /// List queued mutations
  Queue,
}

impl Command {
  /// Whether the command needs the engine started (and the configured
  /// version installed) before it runs.
  pub fn needs_start(&self) -> bool {
    matches!(
      self,
      Command::Install | Command::Activate | Command::Fetch { .. }
    )
  }
}

pub async fn run<S: CacheStorage>(engine: &Engine<S>, config: &Config, command: Command) -> Result<()> {
  if command.needs_start() {
    let state = engine.start().await?;
    tracing::debug!(version = %config.version, %state, "Engine started");
  }

  match command {
    Command::Install => {
      let generation = engine
        .active_generation()
        .ok_or_else(|| eyre!("No active generation after install"))?;
      println!("{} {}", generation.version, generation.state);
    }
    Command::Activate => {
      if let EngineOutcome::Activated { version, deleted } = engine.handle(EngineEvent::Activate).await? {
        println!("active: {}", version);
        for name in deleted {
          println!("deleted: {}", name);
        }
      }
    }
    Command::Fetch {
      url,
      method,
      headers,
      data,
      image,
      document,
    } => {
      let request = build_request(config, &url, &method, &headers, data, image, document)?;
      let outcome = engine.handle(EngineEvent::Fetch(request)).await?;
      if let EngineOutcome::Response(served) = outcome {
        eprintln!("{} ({:?})", served.response.status, served.source);
        for (name, value) in &served.response.headers {
          eprintln!("{}: {}", name, value);
        }
        std::io::stdout().write_all(&served.response.body)?;
      }
    }
    Command::Replay => {
      let report = engine.replay().await?;
      println!(
        "replayed: {}, dropped: {}, remaining: {}",
        report.replayed, report.dropped, report.remaining
      );
      if let Some(id) = report.halted_at {
        println!("halted at mutation {}", id);
      }
    }
    Command::Status => {
      let storage = engine.storage();
      match storage.current_generation()? {
        Some(version) => {
          println!("generation: {}", version);
          for kind in BucketKind::ALL {
            let name = kind.bucket_name(&version);
            println!("  {}: {} entries", name, storage.keys(&name)?.len());
          }
        }
        None => println!("generation: none"),
      }
      println!("queued mutations: {}", engine.queue().len()?);
    }
    Command::Buckets => {
      let storage = engine.storage();
      for name in storage.list_buckets()? {
        println!("{}", name);
        for key in storage.keys(&name)? {
          println!("  {}", key);
        }
      }
    }
    Command::Queue => {
      for mutation in engine.queue().pending()? {
        println!(
          "{}\t{}\t{}\tattempts={}\t{}",
          mutation.id,
          mutation.method,
          mutation.url,
          mutation.attempt_count,
          mutation.enqueued_at.to_rfc3339()
        );
      }
    }
  }

  Ok(())
}

fn build_request(
  config: &Config,
  url: &str,
  method: &str,
  headers: &[String],
  data: Option<String>,
  image: bool,
  document: bool,
) -> Result<Request> {
  let url = match url::Url::parse(url) {
    Ok(absolute) => absolute,
    Err(_) => config.resolve(url)?,
  };
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = Request::new(method, url);
  for header in headers {
    let (name, value) = parse_header(header)?;
    request = request.with_header(name, value);
  }
  if let Some(body) = data {
    request = request.with_body(body);
  }
  if image {
    request = request.with_destination(Destination::Image);
  } else if document {
    request = request.with_destination(Destination::Document);
  }

  Ok(request)
}

fn parse_header(header: &str) -> Result<(&str, &str)> {
  header
    .split_once(':')
    .map(|(name, value)| (name.trim(), value.trim()))
    .filter(|(name, _)| !name.is_empty())
    .ok_or_else(|| eyre!("Invalid header '{}', expected \"Name: value\"", header))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> Config {
    Config::from_yaml("origin: https://school.example\nversion: v1\n").unwrap()
  }

  #[test]
  fn test_parse_header() {
    assert_eq!(
      parse_header("Authorization: Bearer x:y").unwrap(),
      ("Authorization", "Bearer x:y")
    );
    assert!(parse_header("no-colon").is_err());
    assert!(parse_header(": value").is_err());
  }

  #[test]
  fn test_build_request_resolves_paths() {
    let request = build_request(
      &config(),
      "/api/tests?page=1",
      "post",
      &["Content-Type: application/json".to_string()],
      Some("{}".to_string()),
      false,
      false,
    )
    .unwrap();

    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.as_str(), "https://school.example/api/tests?page=1");
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
  }

  #[test]
  fn test_build_request_destination() {
    let request = build_request(
      &config(),
      "https://cdn.example/logo",
      "GET",
      &[],
      None,
      true,
      false,
    )
    .unwrap();
    assert_eq!(request.destination, Destination::Image);
    assert_eq!(request.url.host_str(), Some("cdn.example"));
  }

  #[test]
  fn test_read_only_commands_do_not_start() {
    assert!(!Command::Status.needs_start());
    assert!(!Command::Queue.needs_start());
    assert!(!Command::Replay.needs_start());
    assert!(Command::Install.needs_start());
  }
}
