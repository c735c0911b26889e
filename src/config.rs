use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the backend the client application talks to
  pub origin: String,
  /// Deployed build version; names the cache generation
  pub version: String,
  /// Where cache.db, queue.db and logs live (defaults to $XDG_DATA_HOME/shellcache)
  pub data_dir: Option<PathBuf>,
  /// Paths that must be cached at install time
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub fallbacks: FallbackConfig,
  #[serde(default)]
  pub replay: ReplayConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

fn default_manifest() -> Vec<String> {
  vec!["/".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Path prefix identifying backend API calls
  #[serde(default = "default_api_prefix")]
  pub prefix: String,
  /// Regexes over path+query; only matching API responses are cached
  #[serde(default)]
  pub cache_allow: Vec<String>,
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      prefix: default_api_prefix(),
      cache_allow: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
  /// Placeholder served when an image can't be loaded at all
  pub image: Option<String>,
  /// App shell served to HTML navigations while offline
  #[serde(default = "default_document")]
  pub document: String,
}

fn default_document() -> String {
  "/".to_string()
}

impl Default for FallbackConfig {
  fn default() -> Self {
    Self {
      image: None,
      document: default_document(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
  /// Drop a queued mutation after this many failed replays (never, if unset)
  pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
}

fn default_true() -> bool {
  true
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shellcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.version.is_empty() || self.version.contains(char::is_whitespace) {
      return Err(eyre!("Invalid version '{}'", self.version));
    }
    if !self.api.prefix.starts_with('/') {
      return Err(eyre!("api.prefix must start with '/': {}", self.api.prefix));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path from the configuration against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  /// Directory holding the cache and queue databases.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache"))
  }
}
