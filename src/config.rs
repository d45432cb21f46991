//! Configuration management for Folio Server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Default chunk size: 5MB
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Maximum file size: 500MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Chunks hashed and written concurrently per ingestion
pub const DEFAULT_INGEST_CONCURRENCY: usize = 4;

/// Grace period before an unreferenced blob may be removed: one hour
pub const DEFAULT_ORPHAN_MIN_AGE_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the sharded blob tree
    pub root: PathBuf,
    /// Private directory for inbound files awaiting chunking
    pub staging_dir: PathBuf,
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub ingest_concurrency: usize,
    pub deletion_policy: DeletionPolicy,
    /// Re-hash chunks when serving them
    pub verify_on_read: bool,
    /// Seconds between orphan sweeps (0 = disabled)
    pub orphan_sweep_interval_secs: u64,
    /// Blobs modified more recently than this are never removed
    pub orphan_min_age_secs: u64,
}

/// What happens to blobs when the last file referencing them is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    /// Leave blobs in place for a later garbage-collection sweep
    #[default]
    Retain,
    /// Remove blobs as soon as no chunk record references them
    Reclaim,
}

impl FromStr for DeletionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retain" | "gc" => Ok(Self::Retain),
            "reclaim" | "eager" => Ok(Self::Reclaim),
            other => Err(ConfigError::Invalid {
                key: "BLOB_DELETION_POLICY",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig::default(),
            database: DatabaseConfig {
                url: "sqlite:./folio.db".to_string(),
            },
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: PathBuf::from("./data/blobs"),
            staging_dir: PathBuf::from("./data/staging"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            ingest_concurrency: DEFAULT_INGEST_CONCURRENCY,
            deletion_policy: DeletionPolicy::Retain,
            verify_on_read: true,
            orphan_sweep_interval_secs: 0,
            orphan_min_age_secs: DEFAULT_ORPHAN_MIN_AGE_SECS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = StorageConfig::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 3000)?,
            },
            storage: StorageConfig {
                root: env::var("STORAGE_ROOT").map(PathBuf::from).unwrap_or(defaults.root),
                staging_dir: env::var("STAGING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.staging_dir),
                chunk_size: parse_var("CHUNK_SIZE", defaults.chunk_size)?,
                max_file_size: parse_var("MAX_FILE_SIZE", defaults.max_file_size)?,
                ingest_concurrency: parse_var("INGEST_CONCURRENCY", defaults.ingest_concurrency)?,
                deletion_policy: match env::var("BLOB_DELETION_POLICY") {
                    Ok(value) => value.parse()?,
                    Err(_) => defaults.deletion_policy,
                },
                verify_on_read: parse_var("VERIFY_ON_READ", defaults.verify_on_read)?,
                orphan_sweep_interval_secs: parse_var(
                    "ORPHAN_SWEEP_INTERVAL_SECS",
                    defaults.orphan_sweep_interval_secs,
                )?,
                orphan_min_age_secs: parse_var("ORPHAN_MIN_AGE_SECS", defaults.orphan_min_age_secs)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./folio.db".to_string()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.chunk_size == 0 {
            return Err(ConfigError::Zero("CHUNK_SIZE"));
        }
        if self.storage.ingest_concurrency == 0 {
            return Err(ConfigError::Zero("INGEST_CONCURRENCY"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
