use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Longest accepted record retention (ten years).
pub const MAX_RETENTION_HOURS: i64 = 24 * 365 * 10;

/// Runtime configuration. Every field has a default so a missing or partial
/// file still yields a usable configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application origin; requests to it are same-origin
  pub origin: String,
  /// Build version token embedded in every namespace name
  pub version: String,
  /// Prefix shared by all namespaces owned by this application
  pub cache_prefix: String,
  /// Path prefix identifying API requests
  pub api_prefix: String,
  pub max_concurrent: usize,
  pub network_timeout_ms: u64,
  /// Age after which persistent records become eligible for `delete_old`
  pub retention_hours: i64,
  pub service_unavailable_retries: u32,
  pub runtime_max_entries: usize,
  pub image_max_entries: usize,
  /// Static manifest added to the static namespace at install
  pub precache: Vec<String>,
  /// Idempotent GET paths kept warm by background sync
  pub critical_endpoints: Vec<String>,
  /// API paths whose responses may be written to the runtime namespace
  pub cacheable_apis: Vec<String>,
  /// Cross-origin hosts (scheme + host) that may be intercepted
  pub allowed_origins: Vec<String>,
  /// Extra navigation routes served stale-while-revalidate
  pub content_routes: Vec<String>,
  /// Directory holding the cache and store databases
  pub data_dir: Option<PathBuf>,
  /// Directory for rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      version: "v1".to_string(),
      cache_prefix: "lantern".to_string(),
      api_prefix: "/api/".to_string(),
      max_concurrent: 6,
      network_timeout_ms: 3000,
      retention_hours: 24,
      service_unavailable_retries: 3,
      runtime_max_entries: 50,
      image_max_entries: 30,
      precache: strings(&[
        "/",
        "/offline.html",
        "/manifest.json",
        "/css/app.css",
        "/js/app.js",
        "/icon-192x192.png",
      ]),
      critical_endpoints: strings(&["/api/health", "/api/status", "/api/models"]),
      cacheable_apis: strings(&[
        "/api/health",
        "/api/status",
        "/api/models",
        "/api/market/overview",
        "/api/symbols",
      ]),
      allowed_origins: strings(&[
        "https://fonts.googleapis.com",
        "https://fonts.gstatic.com",
        "https://cdn.jsdelivr.net",
        "https://cdnjs.cloudflare.com",
      ]),
      content_routes: strings(&["/market", "/charts", "/dashboard"]),
      data_dir: None,
      log_dir: None,
    }
  }
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lantern.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lantern/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("lantern.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lantern").join("config.yaml");
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
    if config.max_concurrent == 0 {
      return Err(eyre!("max_concurrent must be at least 1"));
    }
    if !(1..=MAX_RETENTION_HOURS).contains(&config.retention_hours) {
      return Err(eyre!(
        "retention_hours must be between 1 and {}, got {}",
        MAX_RETENTION_HOURS,
        config.retention_hours
      ));
    }
    Ok(config)
  }

  pub fn origin_url(&self) -> crate::Result<Url> {
    Url::parse(&self.origin)
      .map_err(|e| crate::Error::InvalidRequest(format!("bad origin {}: {}", self.origin, e)))
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network_timeout_ms)
  }

  pub fn retention(&self) -> chrono::Duration {
    chrono::Duration::hours(self.retention_hours)
  }

  /// Directory for databases: configured, else the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lantern"))
  }

  /// Anti-forgery token seeded from the environment.
  pub fn csrf_token() -> Option<String> {
    std::env::var("LANTERN_CSRF_TOKEN").ok()
  }
}
