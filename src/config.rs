use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::bundle::BundleConfig;
use crate::cache::TiersConfig;
use crate::queue::QueueConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub tiers: TiersConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub bundle: BundleConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the heritage API (e.g., "https://patrimonio.example.org/api/v1/")
  #[serde(deserialize_with = "deserialize_root")]
  pub root: Url,
  /// Entry document of the web app (defaults to the API origin)
  pub app_url: Option<String>,
  /// Collection whose writes are queued while offline
  #[serde(default = "default_contributions_path")]
  pub contributions_path: String,
  /// Paths below the root that carry per-user data and are never cached
  #[serde(default = "default_identity_paths")]
  pub identity_paths: Vec<String>,
  #[serde(default = "default_media_prefix")]
  pub media_prefix: String,
  #[serde(default = "default_map_tile_hosts")]
  pub map_tile_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

fn default_contributions_path() -> String {
  "contributions/".to_string()
}

fn default_identity_paths() -> Vec<String> {
  [
    "auth/",
    "users/me/",
    "notifications/",
    "my-contributions/",
    "route-progress/",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_media_prefix() -> String {
  "/media/".to_string()
}

fn default_map_tile_hosts() -> Vec<String> {
  vec!["tile.openstreetmap.org".to_string()]
}

fn deserialize_root<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  parse_root(&raw).map_err(serde::de::Error::custom)
}

/// Parse the API root, forcing a trailing slash so relative joins stay below it.
fn parse_root(raw: &str) -> Result<Url> {
  let mut root = Url::parse(raw.trim()).map_err(|e| eyre!("Invalid API root '{}': {}", raw, e))?;
  if !matches!(root.scheme(), "http" | "https") {
    return Err(eyre!("API root must be http(s): {}", raw));
  }
  if !root.path().ends_with('/') {
    let path = format!("{}/", root.path());
    root.set_path(&path);
  }
  root.set_query(None);
  root.set_fragment(None);
  Ok(root)
}

impl ApiConfig {
  /// Defaults for everything but the root.
  pub fn with_root(root: Url) -> Self {
    Self {
      root,
      app_url: None,
      contributions_path: default_contributions_path(),
      identity_paths: default_identity_paths(),
      media_prefix: default_media_prefix(),
      map_tile_hosts: default_map_tile_hosts(),
    }
  }

  /// URL of the application shell.
  pub fn app_url(&self) -> Result<Url> {
    match &self.app_url {
      Some(raw) => Url::parse(raw).map_err(|e| eyre!("Invalid app_url '{}': {}", raw, e)),
      None => self
        .root
        .join("/")
        .map_err(|e| eyre!("Cannot derive app URL from {}: {}", self.root, e)),
    }
  }
}

impl Config {
  /// Defaults around an API section.
  pub fn with_api(api: ApiConfig) -> Self {
    Self {
      api,
      tiers: TiersConfig::default(),
      queue: QueueConfig::default(),
      bundle: BundleConfig::default(),
      storage: StorageConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/heritage-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/heritage-sync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("hsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("heritage-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the API token from environment variables, if one is set.
  ///
  /// Checks HSYNC_API_TOKEN first, then HERITAGE_API_TOKEN as fallback.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HSYNC_API_TOKEN")
      .or_else(|_| std::env::var("HERITAGE_API_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
