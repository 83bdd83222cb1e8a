use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::db;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub cache: CacheConfig,
  pub intercept: InterceptConfig,
  pub sync: SyncConfig,
  /// Directory for databases and logs (defaults to $XDG_DATA_HOME/hearthkeep)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub base_url: String,
  /// Per-request timeout enforced by the HTTP client
  pub timeout_secs: u64,
  /// Path fetched to decide whether the server is reachable
  pub probe_path: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000".to_string(),
      timeout_secs: 30,
      probe_path: "/".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Suffix of every response partition name; bump on deploy to drop old partitions
  pub version: String,
  /// TTL for the generic read cache
  pub default_ttl_secs: i64,
  /// Paths served cache-first and pre-cached on install
  pub static_assets: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      default_ttl_secs: crate::store::DEFAULT_CACHE_TTL_SECS,
      static_assets: [
        "/",
        "/dashboard",
        "/offline",
        "/manifest.json",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
  /// Requests under this prefix are API calls (network-first)
  pub api_prefix: String,
  /// API paths that get an empty offline placeholder instead of an error
  #[serde(deserialize_with = "deserialize_path_set")]
  pub critical_paths: BTreeSet<String>,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      critical_paths: ["/api/tasks", "/api/assets"]
        .into_iter()
        .map(String::from)
        .collect(),
    }
  }
}

fn deserialize_path_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim().trim_end_matches('/').to_string())
      .filter(|s| !s.is_empty())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed submissions before a mutation is dead-lettered. Unset retries forever.
  pub max_attempts: Option<u32>,
  /// Seconds between connectivity probes in `watch` mode
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: None,
      probe_interval_secs: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hearthkeep.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hearthkeep/config.yaml
  ///
  /// Without any file the defaults apply. `HEARTHKEEP_SERVER_URL` overrides
  /// the server URL either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(url) = std::env::var("HEARTHKEEP_SERVER_URL") {
      config.server.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("hearthkeep.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hearthkeep").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Resolved data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    self
      .data_dir
      .clone()
      .or_else(db::default_data_dir)
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  /// Bearer token for the household API, if one is configured.
  ///
  /// Checks HEARTHKEEP_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HEARTHKEEP_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
