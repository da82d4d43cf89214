use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};

use crate::storage::QueueOrder;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub http: HttpSettings,
    pub queue: QueueSettings,
    pub download: DownloadSettings,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub max_tries: u32,
    pub accepted_status: Vec<u16>,
    pub politeness_delay_ms: Option<u64>,  // Applied to tasks that carry no delay of their own
}

/// Request settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub header_generator: Option<String>,  // "random_user_agent", "fingerprint" or a registered name
    pub fingerprints: Vec<BrowserFingerprint>,
}

/// Browser fingerprint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

/// Which queue backend holds the frontier
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    #[default]
    Local,
    Redis,
}

/// Queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: QueueBackendKind,
    pub order: QueueOrder,
    pub max_size: Option<usize>,
    pub redis_url: String,
    pub name: String,
    pub pool_size: usize,
    pub poll_interval_ms: u64,
    pub timeout_ms: Option<u64>,  // Default bound for blocking operations
}

/// Download settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DownloadSettings {
    pub chunk_size: usize,
    pub save_dir: PathBuf,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            concurrency: 20,
            timeout_ms: 20_000,
            max_tries: 3,
            accepted_status: vec![200, 201],
            politeness_delay_ms: None,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("crawlpool/{}", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
            header_generator: None,
            fingerprints: vec![
                BrowserFingerprint {
                    name: "windows_chrome".to_string(),
                    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                    accept_language: "en-US,en;q=0.9".to_string(),
                    extra_headers: BTreeMap::new(),
                },
                BrowserFingerprint {
                    name: "mac_firefox".to_string(),
                    user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.2; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                    accept_language: "en-GB,en;q=0.8".to_string(),
                    extra_headers: BTreeMap::new(),
                },
            ],
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::Local,
            order: QueueOrder::Lifo,
            max_size: None,
            redis_url: "redis://localhost:6379".to_string(),
            name: "crawlpool:frontier".to_string(),
            pool_size: 4,
            poll_interval_ms: 100,
            timeout_ms: None,
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::http::download::DOWNLOAD_CHUNK_SIZE,
            save_dir: PathBuf::from("."),
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "crawlpool", "crawlpool") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Parse a YAML document; missing sections and fields take their defaults
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let sites_dir = Self::config_dir().join("sites");
        let profile_path = sites_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}
