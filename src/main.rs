use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shellcache::cache::{NoopStorage, SqliteStorage};
use shellcache::commands;
use shellcache::config::Config;
use shellcache::engine::Engine;
use shellcache::net::{HttpNetwork, Network};
use shellcache::queue::MutationQueue;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline-resilience caching proxy for the classroom web client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to a daily file under the data directory.
/// Use RUST_LOG to control the level (e.g., RUST_LOG=shellcache=debug).
fn init_tracing(data_dir: &Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "shellcache.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _log_guard = init_tracing(&data_dir)?;
  tracing::info!(version = %config.version, origin = %config.origin, "shellcache starting");

  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new()?);
  let queue = MutationQueue::open_at(&data_dir.join("queue.db"))?;

  if config.cache.enabled {
    let storage = Arc::new(SqliteStorage::open_at(&data_dir.join("cache.db"))?);
    let engine = Engine::new(&config, storage, network, queue)?;
    commands::run(&engine, &config, args.command).await?;
    engine.stop();
  } else {
    let engine = Engine::new(&config, Arc::new(NoopStorage), network, queue)?;
    commands::run(&engine, &config, args.command).await?;
    engine.stop();
  }

  Ok(())
}
