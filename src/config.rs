use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::{EndpointRegistry, EndpointSpec, EndpointTable};
use crate::query::QueryConfig;

pub const API_URL_ENV: &str = "ROSTERSYNC_API_URL";
pub const TOKEN_ENV: &str = "ROSTERSYNC_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub query: QuerySettings,
  #[serde(default)]
  pub logging: LoggingConfig,
  /// Declarative endpoint table
  #[serde(default)]
  pub endpoints: Vec<EndpointSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Per-request timeout enforced by the transport
  #[serde(default = "default_timeout_ms")]
  pub request_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
  30_000
}

fn default_keep_unused_ms() -> u64 {
  60_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuerySettings {
  /// How long an entry without subscribers survives before eviction
  #[serde(default = "default_keep_unused_ms")]
  pub keep_unused_ms: u64,
  /// Refetch fulfilled entries older than this on the next subscription
  pub stale_time_ms: Option<u64>,
}

impl Default for QuerySettings {
  fn default() -> Self {
    Self {
      keep_unused_ms: default_keep_unused_ms(),
      stale_time_ms: None,
    }
  }
}

impl From<&QuerySettings> for QueryConfig {
  fn from(settings: &QuerySettings) -> Self {
    QueryConfig {
      keep_unused: Duration::from_millis(settings.keep_unused_ms),
      stale_time: settings.stale_time_ms.map(Duration::from_millis),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
  /// Write logs here instead of stderr
  pub file: Option<PathBuf>,
  /// EnvFilter directives, used when RUST_LOG is unset
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rostersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rostersync/config.yaml
  /// 4. ~/.config/rostersync/config.yaml
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
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/rostersync/config.yaml\n\
                 See rostersync.example.yaml for the format."
        ))
      }
    };

    if let Ok(url) = std::env::var(API_URL_ENV) {
      config.api.base_url = url;
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rostersync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rostersync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.base_url.trim().is_empty() {
      return Err(eyre!("api.base_url must not be empty"));
    }
    Ok(config)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.api.request_timeout_ms)
  }

  pub fn query_config(&self) -> QueryConfig {
    QueryConfig::from(&self.query)
  }

  /// Build the endpoint registry from the `endpoints` table.
  pub fn registry(&self) -> Result<EndpointRegistry> {
    let table = EndpointTable {
      endpoints: self.endpoints.clone(),
    };
    table
      .into_registry()
      .map_err(|e| eyre!("Invalid endpoint table: {}", e))
  }

  /// Get the bearer token from the environment.
  ///
  /// Checks ROSTERSYNC_TOKEN. Absent or empty means unauthenticated.
  pub fn get_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty())
  }
}
