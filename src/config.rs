use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Release metadata endpoint for the upstream frp project
pub const DEFAULT_RELEASE_ENDPOINT: &str =
    "https://api.github.com/repos/fatedier/frp/releases/latest";

/// Global configuration for the fleet manager
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Root directory holding the frpc binary, generated configs and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Control API configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where and how to fetch frpc releases
    #[serde(default)]
    pub release: ReleaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Control API port (default: 7500)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the control API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum accepted size of an uploaded archive in bytes (default: 100 MiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Number of log lines returned when the caller does not ask for a count
    #[serde(default = "default_log_lines")]
    pub default_log_lines: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            admin_token: None,
            max_upload_bytes: default_max_upload_bytes(),
            default_log_lines: default_log_lines(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReleaseConfig {
    /// URL returning the latest release descriptor as JSON
    #[serde(default = "default_release_endpoint")]
    pub endpoint: String,

    /// Timeout for the metadata request in seconds
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,

    /// Timeout for the asset download in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_release_endpoint(),
            metadata_timeout_secs: default_metadata_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

impl ReleaseConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            release: ReleaseConfig::default(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/app/data")
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7500
}

fn default_max_upload_bytes() -> u64 {
    100 << 20
}

fn default_log_lines() -> i64 {
    200
}

fn default_release_endpoint() -> String {
    DEFAULT_RELEASE_ENDPOINT.to_string()
}

fn default_metadata_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    300 // release archives are a few tens of MiB
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, used when no config file is given
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `DATA_DIR`, `WEB_PORT` and `FRPC_FLEET_ADMIN_TOKEN` overrides
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("WEB_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(token) = lookup("FRPC_FLEET_ADMIN_TOKEN").filter(|v| !v.is_empty()) {
            self.server.admin_token = Some(token);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.data_dir.as_os_str().is_empty() {
            errors.push("'data_dir' must not be empty".to_string());
        }
        if self.release.endpoint.trim().is_empty() {
            errors.push("'release.endpoint' must not be empty".to_string());
        }
        if self.release.metadata_timeout_secs == 0 {
            errors.push("'release.metadata_timeout_secs' must be greater than 0".to_string());
        }
        if self.release.download_timeout_secs == 0 {
            errors.push("'release.download_timeout_secs' must be greater than 0".to_string());
        }
        if self.server.max_upload_bytes == 0 {
            errors.push("'server.max_upload_bytes' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }
}

/// File name of the frpc executable on this host
pub fn frpc_binary_name() -> &'static str {
    if cfg!(windows) {
        "frpc.exe"
    } else {
        "frpc"
    }
}

/// Fixed on-disk layout below the data root.
///
/// ```text
/// <root>/frpc/frpc          provisioned executable
/// <root>/conf/<id>.toml     generated config, rewritten on every start
/// <root>/logs/<id>.log      combined stdout/stderr, truncated on every start
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_dir(&self) -> PathBuf {
        self.root.join("frpc")
    }

    pub fn binary_path(&self) -> PathBuf {
        self.binary_dir().join(frpc_binary_name())
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn conf_path(&self, server_id: &str) -> PathBuf {
        self.conf_dir().join(format!("{}.toml", server_id))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self, server_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", server_id))
    }

    /// Scratch file for a downloaded asset; keeps the asset's extension
    pub fn download_scratch_path(&self, asset_name: &str) -> PathBuf {
        let ext = if asset_name.ends_with(".zip") {
            ".zip"
        } else if asset_name.ends_with(".tar.gz") {
            ".tar.gz"
        } else {
            ""
        };
        self.root.join(format!("frpc_download{}", ext))
    }

    pub fn upload_scratch_path(&self) -> PathBuf {
        self.root.join("frpc_upload")
    }

    /// Create the data root and its fixed subdirectories
    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [self.binary_dir(), self.conf_dir(), self.logs_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
