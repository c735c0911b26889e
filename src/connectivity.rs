//! Connectivity and installation state, driven by platform signals.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
  NotInstalled,
  /// The platform offered an install prompt we are holding on to
  Installable,
  Installed,
}

/// Read-only view handed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
  pub connectivity: Connectivity,
  pub install: InstallState,
}

impl StatusSnapshot {
  pub fn is_online(&self) -> bool {
    self.connectivity == Connectivity::Online
  }

  pub fn is_installable(&self) -> bool {
    self.install == InstallState::Installable
  }

  pub fn is_installed(&self) -> bool {
    self.install == InstallState::Installed
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
  Accepted,
  Dismissed,
}

/// Install handle captured from the platform's before-install signal.
#[async_trait]
pub trait InstallPrompt: Send + Sync {
  /// Show the prompt and wait for the user's choice.
  async fn prompt(&self) -> InstallOutcome;
}

/// Signals raised by the platform.
#[derive(Clone)]
pub enum PlatformSignal {
  Online,
  Offline,
  BeforeInstallPrompt(Arc<dyn InstallPrompt>),
  AppInstalled,
}

impl std::fmt::Debug for PlatformSignal {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PlatformSignal::Online => write!(f, "Online"),
      PlatformSignal::Offline => write!(f, "Offline"),
      PlatformSignal::BeforeInstallPrompt(_) => write!(f, "BeforeInstallPrompt"),
      PlatformSignal::AppInstalled => write!(f, "AppInstalled"),
    }
  }
}

/// Tracks {online, offline} × {not installed, installable, installed}.
///
/// State only changes in response to [`PlatformSignal`]s; nothing polls.
pub struct ConnectivityMonitor {
  state: watch::Sender<StatusSnapshot>,
  prompt: Mutex<Option<Arc<dyn InstallPrompt>>>,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity) -> Self {
    let (state, _) = watch::channel(StatusSnapshot {
      connectivity: initial,
      install: InstallState::NotInstalled,
    });

    Self {
      state,
      prompt: Mutex::new(None),
    }
  }

  pub fn snapshot(&self) -> StatusSnapshot {
    *self.state.borrow()
  }

  /// Watch for state changes.
  pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
    self.state.subscribe()
  }

  /// Apply a platform signal.
  ///
  /// Returns `true` exactly when the signal moved the engine from offline
  /// to online, which is the caller's cue to replay queued mutations.
  pub fn apply(&self, signal: PlatformSignal) -> bool {
    debug!(?signal, "Platform signal");
    let mut came_online = false;

    match signal {
      PlatformSignal::Online => {
        self.state.send_if_modified(|s| {
          if s.connectivity == Connectivity::Offline {
            s.connectivity = Connectivity::Online;
            came_online = true;
            true
          } else {
            false
          }
        });
      }
      PlatformSignal::Offline => {
        self.state.send_if_modified(|s| {
          let changed = s.connectivity != Connectivity::Offline;
          s.connectivity = Connectivity::Offline;
          changed
        });
      }
      PlatformSignal::BeforeInstallPrompt(handle) => {
        if self.snapshot().is_installed() {
          return false;
        }
        if let Ok(mut prompt) = self.prompt.lock() {
          *prompt = Some(handle);
        }
        self.set_install(InstallState::Installable);
      }
      PlatformSignal::AppInstalled => {
        if let Ok(mut prompt) = self.prompt.lock() {
          prompt.take();
        }
        self.set_install(InstallState::Installed);
      }
    }

    if came_online {
      info!("Connectivity restored");
    }
    came_online
  }

  /// Show the captured install prompt.
  ///
  /// Returns `None` when there is nothing to install. The handle is used up
  /// either way: accepting installs, dismissing goes back to not installed.
  pub async fn install_app(&self) -> Option<InstallOutcome> {
    let handle = self.prompt.lock().ok().and_then(|mut p| p.take())?;

    let outcome = handle.prompt().await;
    match outcome {
      InstallOutcome::Accepted => self.set_install(InstallState::Installed),
      InstallOutcome::Dismissed => {
        if !self.snapshot().is_installed() {
          self.set_install(InstallState::NotInstalled);
        }
      }
    }
    info!(?outcome, "Install prompt answered");
    Some(outcome)
  }

  fn set_install(&self, install: InstallState) {
    self.state.send_if_modified(|s| {
      let changed = s.install != install;
      s.install = install;
      changed
    });
  }
}
