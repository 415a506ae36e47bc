//! Central configuration.
//!
//! One flat record with explicit optional fields and defaults, loadable
//! from JSON or YAML. Unknown keys are logged as warnings rather than
//! rejected, so older binaries keep working against newer config files.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{DEFAULT_PACK_THRESHOLD, DEFAULT_SEGMENT_SIZE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(String),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    /// Single-file SQLite engine, the default.
    #[serde(alias = "sqlite")]
    Embedded,
    /// PostgreSQL server engine.
    #[serde(alias = "postgresql", alias = "postgres")]
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_nntp_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl ServerConfig {
    /// Stable identity used as the pool key and in health records.
    pub fn server_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifiedConfig {
    pub database_type: DatabaseType,
    /// Database file for the embedded engine.
    pub database_path: String,
    /// Connection URL for the server engine.
    pub database_url: Option<String>,

    pub segment_size: usize,
    pub pack_threshold: usize,
    pub redundancy_level: u8,

    pub indexing_worker_threads: usize,
    pub upload_worker_threads: usize,
    pub download_worker_threads: usize,

    pub upload_rate_limit_mbps: Option<f64>,
    pub download_rate_limit_mbps: Option<f64>,

    pub max_retries: u32,
    #[serde(alias = "retry_base_delay")]
    pub retry_base_delay_ms: u64,

    pub servers: Vec<ServerConfig>,
    pub target_group: String,

    pub scrypt_n: u32,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
    pub pbkdf2_iterations: u32,

    pub expiry_default_days: Option<u32>,
    pub max_share_size_gb: u64,

    /// Keys this version does not recognise; surfaced as warnings.
    #[serde(flatten, skip_serializing)]
    pub unknown: HashMap<String, serde_json::Value>,
}

impl Default for UnifiedConfig {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::Embedded,
            database_path: "data/usenetsync.db".to_string(),
            database_url: None,
            segment_size: DEFAULT_SEGMENT_SIZE,
            pack_threshold: DEFAULT_PACK_THRESHOLD,
            redundancy_level: 1,
            indexing_worker_threads: 8,
            upload_worker_threads: 4,
            download_worker_threads: 4,
            upload_rate_limit_mbps: None,
            download_rate_limit_mbps: None,
            max_retries: 3,
            retry_base_delay_ms: 500,
            servers: Vec::new(),
            target_group: "alt.binaries.test".to_string(),
            scrypt_n: 16_384,
            scrypt_r: 8,
            scrypt_p: 1,
            pbkdf2_iterations: 100_000,
            expiry_default_days: Some(30),
            max_share_size_gb: 100,
            unknown: HashMap::new(),
        }
    }
}

impl UnifiedConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let config: Self = match ext {
            "json" => {
                serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            "yml" | "yaml" => {
                serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.warn_unknown_keys();
        config.validate()?;
        Ok(config)
    }

    fn warn_unknown_keys(&self) {
        for key in self.unknown.keys() {
            warn!(key, "unknown configuration key ignored");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size == 0 {
            return Err(ConfigError::Parse("segment_size must be >= 1".into()));
        }
        if self.redundancy_level == 0 {
            return Err(ConfigError::Parse("redundancy_level must be >= 1".into()));
        }
        if self.database_type == DatabaseType::Server && self.database_url.is_none() {
            return Err(ConfigError::Parse(
                "database_url is required for the server engine".into(),
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        match self.database_type {
            DatabaseType::Embedded => format!("sqlite://{}?mode=rwc", self.database_path),
            DatabaseType::Server => self.database_url.clone().unwrap_or_default(),
        }
    }
}

fn default_nntp_port() -> u16 {
    563
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    10
}

fn default_priority() -> u32 {
    1
}
