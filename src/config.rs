use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `gateway.admin_url`.
const ADMIN_URL_ENV: &str = "CAPI_GATEWAY_ADMIN_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub gateway: GatewayConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub catalog: CatalogConfig,
  #[serde(default)]
  pub proxy: ProxyConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
  /// Base URL of the gateway admin API (e.g. "http://kong:8001")
  #[serde(default = "default_admin_url")]
  pub admin_url: String,
  /// Per-request timeout for admin calls
  #[serde(default = "default_gateway_timeout")]
  pub timeout_secs: u64,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      admin_url: default_admin_url(),
      timeout_secs: default_gateway_timeout(),
    }
  }
}

impl GatewayConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to run every read against the catalog
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_cache_ttl")]
  pub ttl_secs: u64,
  /// Cache database path (defaults to the data directory)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl_secs: default_cache_ttl(),
      path: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
  /// Catalog database path (defaults to the data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
  #[serde(default = "default_proxy_timeout")]
  pub timeout_secs: u64,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_proxy_timeout(),
    }
  }
}

impl ProxyConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// EnvFilter directive, used when RUST_LOG is unset
  pub filter: Option<String>,
  /// Write a daily-rolling log file here in addition to stderr
  pub directory: Option<PathBuf>,
}

fn default_admin_url() -> String {
  "http://localhost:8001".to_string()
}

fn default_gateway_timeout() -> u64 {
  10
}

fn default_proxy_timeout() -> u64 {
  30
}

fn default_cache_ttl() -> u64 {
  600
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./capi.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/capi/config.yaml
  ///
  /// Without any file the defaults are used. `CAPI_GATEWAY_ADMIN_URL`
  /// always wins over the file value.
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
      None => Config::default(),
    };

    if let Ok(url) = std::env::var(ADMIN_URL_ENV) {
      config.gateway.admin_url = url;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("capi.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("capi").join("config.yaml");
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

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let url = url::Url::parse(&self.gateway.admin_url)
      .map_err(|e| eyre!("Invalid gateway admin_url {}: {}", self.gateway.admin_url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!(
        "Gateway admin_url must be http or https, got {}",
        url.scheme()
      ));
    }
    if self.gateway.timeout_secs == 0 || self.proxy.timeout_secs == 0 {
      return Err(eyre!("Timeouts must be at least one second"));
    }
    Ok(())
  }

  /// Directory holding the catalog and cache databases by default.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("capi"))
  }

  pub fn catalog_path(&self) -> Result<PathBuf> {
    match &self.catalog.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("catalog.db")),
    }
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }
}
