use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub router: RouterConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Where notes.db, cache.db and logs live (defaults to $XDG_DATA_HOME/notesync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Origin of the application and the remote note store
  pub url: Url,
  /// Path notes are POSTed to, relative to `url`
  #[serde(default = "default_sync_path")]
  pub sync_path: String,
  #[serde(default = "default_remote_timeout")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub prefix: String,
  /// Bump to roll out a new app shell; unchanged means no upgrade is seen
  pub version: String,
  /// App shell resources, fetched all-or-nothing on install
  pub manifest: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "notesync".to_string(),
      version: "v1".to_string(),
      manifest: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/app.js".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
  pub api_prefix: String,
  /// File extensions served cache-first (case-insensitive, leading dot optional)
  pub static_extensions: Vec<String>,
}

impl Default for RouterConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      static_extensions: [
        "js", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  pub submit_timeout_secs: u64,
  pub max_in_flight: usize,
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      submit_timeout_secs: 15,
      max_in_flight: 4,
      probe_interval_secs: 10,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn submit_timeout(&self) -> Duration {
    Duration::from_secs(self.submit_timeout_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

fn default_sync_path() -> String {
  "/api/notes".to_string()
}

fn default_remote_timeout() -> u64 {
  10
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./notesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/notesync/config.yaml
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
        "No configuration file found. Create one at ~/.config/notesync/config.yaml\n\
                 with at least:\n\nremote:\n  url: https://notes.example.com\n"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("notesync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("notesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    Ok(config)
  }

  /// Resolved data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => crate::db::default_data_dir().map_err(|e| eyre!("{}", e)),
    }
  }

  /// Optional bearer token for the remote store, from NOTESYNC_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("NOTESYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
