//! The engine: one dispatcher in front of router, executors, lifecycle,
//! queue and connectivity monitor.
//!
//! Fetches take a read guard on the serving generation only long enough to
//! pick up its executor; activation takes the write guard. No request is
//! dispatched against a new generation until its activation has fully
//! finished. A request of the old generation still in flight afterwards
//! cannot write into pruned buckets, since `put` rejects a missing bucket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::connectivity::{
  Connectivity, ConnectivityMonitor, InstallOutcome, PlatformSignal, StatusSnapshot,
};
use crate::http::{Request, Response};
use crate::lifecycle::{Generation, InstallError, LifecycleManager, LifecycleState};
use crate::net::{FetchError, Network};
use crate::queue::{MutationQueue, ReplayReport};
use crate::router::{Route, Router};
use crate::strategy::{Executor, ResponseSource, Served};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("Engine is not running")]
  NotRunning,

  #[error("No generation is waiting to be activated")]
  NoWaitingGeneration,

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Install(#[from] InstallError),

  #[error("Storage error: {0}")]
  Storage(String),
}

impl From<color_eyre::Report> for EngineError {
  fn from(e: color_eyre::Report) -> Self {
    EngineError::Storage(format!("{:#}", e))
  }
}

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum EngineEvent {
  /// Register (and install) an engine version
  Install { version: String },
  /// Activate the waiting generation now (skip waiting)
  Activate,
  /// An outbound request from the application
  Fetch(Request),
  /// A platform connectivity or install signal
  Connectivity(PlatformSignal),
}

/// Result of handling an [`EngineEvent`].
#[derive(Debug)]
pub enum EngineOutcome {
  Installed { version: String, state: LifecycleState },
  Activated { version: String, deleted: Vec<String> },
  Response(Served),
  Connectivity {
    snapshot: StatusSnapshot,
    /// Replay started by this signal; awaiting it is optional
    replay: Option<JoinHandle<Option<ReplayReport>>>,
  },
}

/// Identifies an attached application client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

struct ActiveGeneration<S: CacheStorage> {
  version: String,
  executor: Arc<Executor<S>>,
}

#[derive(Default)]
struct Registration {
  active: Option<Generation>,
  waiting: Option<Generation>,
  clients: HashSet<ClientId>,
}

/// The offline-resilience engine.
pub struct Engine<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  router: Router,
  queue: Arc<MutationQueue>,
  monitor: ConnectivityMonitor,
  lifecycle: LifecycleManager<S>,
  version: String,
  shell_url: Url,
  image_fallback: Option<Url>,
  serving: RwLock<Option<ActiveGeneration<S>>>,
  registration: Mutex<Registration>,
  /// Serializes install/activate sequences
  lifecycle_lock: tokio::sync::Mutex<()>,
  running: AtomicBool,
  next_client: AtomicU64,
  reload: watch::Sender<Option<String>>,
  replay_tasks: Mutex<Vec<AbortHandle>>,
}

impl<S: CacheStorage> Engine<S> {
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    queue: MutationQueue,
  ) -> color_eyre::Result<Self> {
    let origin = config.origin_url()?;
    let image_fallback = match &config.fallbacks.image {
      Some(path) => Some(config.resolve(path)?),
      None => None,
    };

    Ok(Self {
      lifecycle: LifecycleManager::new(
        Arc::clone(&storage),
        Arc::clone(&network),
        origin,
        config.manifest.clone(),
      ),
      storage,
      network,
      router: Router::from_config(config)?,
      queue: Arc::new(queue.with_max_attempts(config.replay.max_attempts)),
      monitor: ConnectivityMonitor::new(Connectivity::Online),
      version: config.version.clone(),
      shell_url: config.resolve(&config.fallbacks.document)?,
      image_fallback,
      serving: RwLock::new(None),
      registration: Mutex::new(Registration::default()),
      lifecycle_lock: tokio::sync::Mutex::new(()),
      running: AtomicBool::new(false),
      next_client: AtomicU64::new(1),
      reload: watch::channel(None).0,
      replay_tasks: Mutex::new(Vec::new()),
    })
  }

  /// Connectivity the engine assumes until the first platform signal.
  /// Defaults to online.
  pub fn with_connectivity(mut self, initial: Connectivity) -> Self {
    self.monitor = ConnectivityMonitor::new(initial);
    self
  }

  /// Resume the persisted generation, then register the configured version.
  pub async fn start(&self) -> Result<LifecycleState, EngineError> {
    self.running.store(true, Ordering::SeqCst);

    if let Some(version) = self.storage.current_generation()? {
      let executor = self.executor_for(&version)?;
      *self.serving.write().await = Some(ActiveGeneration {
        version: version.clone(),
        executor: Arc::new(executor),
      });
      self.with_registration(|r| {
        r.active = Some(Generation {
          version: version.clone(),
          state: LifecycleState::Active,
        })
      });
      info!(version = %version, "Resumed cache generation");
    }

    // Mutations left over from an earlier run.
    if self.monitor.snapshot().is_online() && !self.queue.is_empty()? {
      self.spawn_replay();
    }

    let version = self.version.clone();
    match self.register(&version).await {
      Ok(state) => Ok(state),
      Err(e) => {
        // Keep serving the previous generation if there is one.
        if self.active_version().is_some() {
          warn!(version = %version, error = %e, "Install failed, staying on previous generation");
          Ok(LifecycleState::Redundant)
        } else {
          self.running.store(false, Ordering::SeqCst);
          Err(e)
        }
      }
    }
  }

  /// Stop intercepting and abort every replay pass in progress or waiting
  /// for its turn.
  ///
  /// A pass can only be cut off while it waits on the network, so a
  /// mutation the origin accepted is always dequeued.
  pub fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
    if let Ok(mut tasks) = self.replay_tasks.lock() {
      for handle in tasks.drain(..) {
        handle.abort();
      }
    }
    info!("Engine stopped");
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Single entry point for every event.
  pub async fn handle(&self, event: EngineEvent) -> Result<EngineOutcome, EngineError> {
    match event {
      EngineEvent::Install { version } => {
        let state = self.register(&version).await?;
        Ok(EngineOutcome::Installed { version, state })
      }
      EngineEvent::Activate => {
        let (version, deleted) = self.skip_waiting().await?;
        Ok(EngineOutcome::Activated { version, deleted })
      }
      EngineEvent::Fetch(request) => Ok(EngineOutcome::Response(self.fetch(request).await?)),
      EngineEvent::Connectivity(signal) => {
        let replay = self.signal(signal);
        Ok(EngineOutcome::Connectivity {
          snapshot: self.monitor.snapshot(),
          replay,
        })
      }
    }
  }

  /// Serve an outbound request.
  pub async fn fetch(&self, request: Request) -> Result<Served, EngineError> {
    if !self.is_running() {
      return Err(EngineError::NotRunning);
    }

    let Some(route) = self.router.classify(&request) else {
      debug!(url = %request.url, "Not intercepted");
      return self.pass_through(&request).await;
    };

    // The guard is released before any network await.
    let executor = {
      let serving = self.serving.read().await;
      serving.as_ref().map(|active| {
        debug!(
          url = %request.url,
          route = route.name(),
          generation = %active.version,
          "Intercepted request"
        );
        Arc::clone(&active.executor)
      })
    };

    let Some(executor) = executor else {
      // Nothing installed yet: behave like the bare network.
      return match route {
        Route::Mutation => self.mutate(&request).await,
        _ => self.pass_through(&request).await,
      };
    };

    let served = match route {
      Route::NetworkFirst { store } => executor.network_first(&request, store).await?,
      Route::CacheFirst => executor.cache_first(&request).await,
      Route::StaleWhileRevalidate => executor.stale_while_revalidate(&request).await?,
      Route::Mutation => self.mutate(&request).await?,
    };
    Ok(served)
  }

  async fn pass_through(&self, request: &Request) -> Result<Served, EngineError> {
    let response = self.network.fetch(request).await?;
    Ok(Served::new(response, ResponseSource::PassThrough))
  }

  /// Forward a mutation; queue it if the origin is unreachable.
  async fn mutate(&self, request: &Request) -> Result<Served, EngineError> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(Served::new(response, ResponseSource::Network)),
      Err(FetchError::Transport(reason)) => {
        debug!(url = %request.url, %reason, "Mutation failed offline, queueing");
        let id = self.queue.enqueue(request)?;
        Ok(Served::new(queued_response(id), ResponseSource::Queued))
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Apply a platform signal. Coming back online starts one replay pass,
  /// unless the engine is stopped; `start` picks up the backlog then.
  pub fn signal(&self, signal: PlatformSignal) -> Option<JoinHandle<Option<ReplayReport>>> {
    if !self.monitor.apply(signal) || !self.is_running() {
      return None;
    }
    Some(self.spawn_replay())
  }

  fn spawn_replay(&self) -> JoinHandle<Option<ReplayReport>> {
    let queue = Arc::clone(&self.queue);
    let network = Arc::clone(&self.network);
    let handle = tokio::spawn(async move {
      match queue.replay(network.as_ref()).await {
        Ok(report) => {
          info!(
            replayed = report.replayed,
            remaining = report.remaining,
            "Replay pass finished"
          );
          Some(report)
        }
        Err(e) => {
          warn!(error = %e, "Replay pass failed");
          None
        }
      }
    });

    if let Ok(mut tasks) = self.replay_tasks.lock() {
      tasks.retain(|task| !task.is_finished());
      tasks.push(handle.abort_handle());
    }
    handle
  }

  /// Run a replay pass right now, regardless of connectivity state.
  pub async fn replay(&self) -> Result<ReplayReport, EngineError> {
    Ok(self.queue.replay(self.network.as_ref()).await?)
  }

  /// Register a version: install it, then activate it unless an older
  /// generation still has clients attached.
  pub async fn register(&self, version: &str) -> Result<LifecycleState, EngineError> {
    let _guard = self.lifecycle_lock.lock().await;

    if self.active_version().as_deref() == Some(version) {
      return Ok(LifecycleState::Active);
    }

    self.with_registration(|r| r.waiting = Some(Generation::new(version)));

    if let Err(e) = self.lifecycle.install(version).await {
      warn!(version, error = %e, "Install rejected");
      self.with_registration(|r| r.waiting = None);
      return Err(e.into());
    }
    self.set_waiting_state(LifecycleState::Installed);

    let has_active = self.active_version().is_some();
    let clients = self.with_registration(|r| r.clients.len());
    if has_active && clients > 0 {
      info!(version, clients, "New generation waiting for clients to close");
      return Ok(LifecycleState::Installed);
    }

    self.activate_waiting().await?;
    Ok(LifecycleState::Active)
  }

  /// Activate the waiting generation now. Without one, re-prune around the
  /// active generation.
  async fn skip_waiting(&self) -> Result<(String, Vec<String>), EngineError> {
    let _guard = self.lifecycle_lock.lock().await;

    if self.waiting_version().is_some() {
      return self.activate_waiting().await;
    }
    match self.active_version() {
      Some(version) => {
        let _serving = self.serving.write().await;
        let deleted = self.lifecycle.activate(&version)?;
        Ok((version, deleted))
      }
      None => Err(EngineError::NoWaitingGeneration),
    }
  }

  /// Caller holds `lifecycle_lock`.
  async fn activate_waiting(&self) -> Result<(String, Vec<String>), EngineError> {
    let version = self
      .waiting_version()
      .ok_or(EngineError::NoWaitingGeneration)?;
    self.set_waiting_state(LifecycleState::Activating);

    let mut serving = self.serving.write().await;
    let activated = self
      .executor_for(&version)
      .and_then(|executor| Ok((executor, self.lifecycle.activate(&version)?)));
    let (executor, deleted) = match activated {
      Ok(done) => done,
      Err(e) => {
        self.with_registration(|r| r.waiting = None);
        return Err(e.into());
      }
    };
    *serving = Some(ActiveGeneration {
      version: version.clone(),
      executor: Arc::new(executor),
    });
    drop(serving);

    let clients = self.with_registration(|r| {
      if let Some(old) = r.active.as_mut() {
        old.state = LifecycleState::Redundant;
      }
      r.active = Some(Generation {
        version: version.clone(),
        state: LifecycleState::Active,
      });
      r.waiting = None;
      r.clients.len()
    });
    info!(version = %version, clients, "Generation now controls all clients");

    Ok((version, deleted))
  }

  fn executor_for(&self, version: &str) -> color_eyre::Result<Executor<S>> {
    Executor::new(
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
      version,
      self.shell_url.clone(),
      self.image_fallback.clone(),
    )
  }

  /// Attach an application client to the engine.
  pub fn attach_client(&self) -> ClientId {
    let id = ClientId(self.next_client.fetch_add(1, Ordering::SeqCst));
    self.with_registration(|r| r.clients.insert(id));
    id
  }

  /// Detach a client. Detaching the last one activates a waiting generation.
  pub async fn detach_client(&self, id: ClientId) -> Result<Option<String>, EngineError> {
    let remaining = self.with_registration(|r| {
      r.clients.remove(&id);
      r.clients.len()
    });
    if remaining > 0 {
      return Ok(None);
    }

    let _guard = self.lifecycle_lock.lock().await;
    if self.waiting_version().is_none() {
      return Ok(None);
    }
    let (version, _) = self.activate_waiting().await?;
    Ok(Some(version))
  }

  /// UI action: show the captured install prompt.
  pub async fn install_app(&self) -> Option<InstallOutcome> {
    self.monitor.install_app().await
  }

  /// UI action: activate the waiting generation and ask clients to reload.
  pub async fn update_app(&self) -> Result<String, EngineError> {
    let _guard = self.lifecycle_lock.lock().await;
    if self.waiting_version().is_none() {
      return Err(EngineError::NoWaitingGeneration);
    }
    let (version, _) = self.activate_waiting().await?;
    self.reload.send_replace(Some(version.clone()));
    Ok(version)
  }

  /// Receives the version to reload into after `update_app`.
  pub fn subscribe_reload(&self) -> watch::Receiver<Option<String>> {
    self.reload.subscribe()
  }

  pub fn status(&self) -> StatusSnapshot {
    self.monitor.snapshot()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
    self.monitor.subscribe()
  }

  pub fn active_generation(&self) -> Option<Generation> {
    self.with_registration(|r| r.active.clone())
  }

  pub fn waiting_generation(&self) -> Option<Generation> {
    self.with_registration(|r| r.waiting.clone())
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  fn active_version(&self) -> Option<String> {
    self.active_generation().map(|g| g.version)
  }

  fn waiting_version(&self) -> Option<String> {
    self.waiting_generation().map(|g| g.version)
  }

  fn set_waiting_state(&self, state: LifecycleState) {
    self.with_registration(|r| {
      if let Some(waiting) = r.waiting.as_mut() {
        waiting.state = state;
      }
    });
  }

  fn with_registration<T>(&self, f: impl FnOnce(&mut Registration) -> T) -> T {
    let mut registration = match self.registration.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut registration)
  }
}

/// What the application sees when a mutation was accepted into the queue.
fn queued_response(id: i64) -> Response {
  Response::new(202)
    .with_header("Content-Type", "application/json")
    .with_header("X-Offline-Queued", id.to_string())
    .with_body(serde_json::json!({ "queued": true, "id": id }).to_string())
}
