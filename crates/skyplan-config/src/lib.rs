// skyplan-config - Unified configuration for the CLI and provider
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from SKYPLAN_CONFIG env var
// 3. Config file contents from SKYPLAN_CONFIG_CONTENT env var
// 4. Default config file locations (./skyplan.toml, ./.skyplan.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{apply_env_overrides, EnvSource, StdEnvSource, ENV_PREFIX};
pub use sources::load_or_default;

/// Main runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub aws: AwsConfig,

    #[serde(default)]
    pub ami: AmiConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub layers: LayerConfig,

    #[serde(default)]
    pub copy: CopyConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Provider connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    /// Base URL override (LocalStack, MinIO); the real hosts are used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Section of the shared credentials file
    pub profile: String,
    /// Directory under $HOME holding the JSON credentials cache
    pub app_dir: String,
    pub timeout_secs: u64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            profile: "default".to_string(),
            app_dir: "skyplan".to_string(),
            timeout_secs: 30,
        }
    }
}

impl AwsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Image lookup policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmiStrategy {
    Auto,
    Ssm,
    Describe,
    Static,
}

impl std::fmt::Display for AmiStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmiStrategy::Auto => write!(f, "auto"),
            AmiStrategy::Ssm => write!(f, "ssm"),
            AmiStrategy::Describe => write!(f, "describe"),
            AmiStrategy::Static => write!(f, "static"),
        }
    }
}

impl std::str::FromStr for AmiStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(AmiStrategy::Auto),
            "ssm" => Ok(AmiStrategy::Ssm),
            "describe" => Ok(AmiStrategy::Describe),
            "static" => Ok(AmiStrategy::Static),
            _ => anyhow::bail!(
                "Unsupported AMI strategy: {}. Supported: auto, ssm, describe, static",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmiConfig {
    pub strategy: AmiStrategy,
    pub ttl_hours: u64,
    pub cache_enabled: bool,
    pub fallback_to_static: bool,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            strategy: AmiStrategy::Auto,
            ttl_hours: 24,
            cache_enabled: true,
            fallback_to_static: true,
        }
    }
}

impl AmiConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

/// Remote state settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State bucket is `${app_prefix}-state-${region}`
    pub app_prefix: String,
    pub key: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            app_prefix: "skyplan".to_string(),
            key: "skyplan.tfstate.json".to_string(),
        }
    }
}

/// Lambda layer build cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// `~` expands to $HOME
    pub cache_dir: String,
    pub max_age_days: u64,
    /// Container image override for the layer builder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub builder_image: Option<String>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            cache_dir: "~/.skyplan/layers".to_string(),
            max_age_days: 7,
            builder_image: None,
        }
    }
}

impl LayerConfig {
    /// Cache directory with a leading `~` replaced by `home`
    pub fn cache_path(&self, home: Option<&Path>) -> PathBuf {
        match (self.cache_dir.strip_prefix("~/"), home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ if self.cache_dir == "~" => home
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            _ => PathBuf::from(&self.cache_dir),
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days * 24 * 3600)
    }
}

/// Cross-region copy tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub concurrency: usize,
    /// UploadPartCopy requests in flight per multipart object
    pub part_concurrency: usize,
    pub part_size_mib: u64,
    /// Objects above this size use multipart copy
    pub multipart_threshold_gib: u64,
    pub progress_interval_ms: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            part_concurrency: 4,
            part_size_mib: 100,
            multipart_threshold_gib: 5,
            progress_interval_ms: 500,
        }
    }
}

impl CopyConfig {
    pub fn part_size_bytes(&self) -> u64 {
        self.part_size_mib * 1024 * 1024
    }

    pub fn multipart_threshold_bytes(&self) -> u64 {
        self.multipart_threshold_gib * 1024 * 1024 * 1024
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load from an explicit file (CLI --config), then apply environment overrides
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Parse TOML text without consulting the environment
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}
