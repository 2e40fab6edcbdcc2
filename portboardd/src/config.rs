use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub scan: ScanConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Target handed to the fast sweep, e.g. "192.168.0.0/24"
    pub range: String,
    #[serde(default = "default_nmap_path")]
    pub nmap_path: PathBuf,
    #[serde(default = "default_fast_args")]
    pub fast_args: Vec<String>,
    #[serde(default = "default_full_args")]
    pub full_args: Vec<String>,
    /// Deadline for a single scanner invocation
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_ms: u64,
    /// Service hints whose page title is never fetched
    #[serde(default = "default_title_denylist")]
    pub title_denylist: Vec<String>,
    #[serde(default = "default_icon_target_width")]
    pub icon_target_width: u32,
    /// Concurrent enrichments per host
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_nmap_path() -> PathBuf {
    PathBuf::from("nmap")
}

fn default_fast_args() -> Vec<String> {
    ["-sT", "-F", "-T4"].iter().map(|s| s.to_string()).collect()
}

fn default_full_args() -> Vec<String> {
    ["-sT", "-p-", "-T4"].iter().map(|s| s.to_string()).collect()
}

fn default_scan_timeout() -> u64 {
    600
}

fn default_interval() -> u64 {
    30 * 60
}

fn default_fetch_timeout() -> u64 {
    1000
}

fn default_title_denylist() -> Vec<String> {
    vec!["jetdirect".to_string()]
}

fn default_icon_target_width() -> u32 {
    50
}

fn default_concurrency() -> usize {
    4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/portboard")
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fetch_timeout(),
            title_denylist: default_title_denylist(),
            icon_target_width: default_icon_target_width(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl EnrichConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl StorageConfig {
    /// Last published snapshot, for restarts without re-scanning
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.json")
    }

    /// User overlay document
    pub fn overlay_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn icon_dir(&self) -> PathBuf {
        self.data_dir.join("ico")
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        anyhow::ensure!(config.enrich.concurrency > 0, "enrich.concurrency must be at least 1");
        anyhow::ensure!(config.scan.interval_secs > 0, "scan.interval_secs must be at least 1");
        Ok(config)
    }
}
