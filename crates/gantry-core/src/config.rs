//! Configuration system for gantry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GANTRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gantry/config.toml
//!   3. ~/.config/gantry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    pub cluster: ClusterConfig,
    pub ipfs: IpfsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Namespace every per-task artifact is created in.
    pub namespace: String,
    /// Container image overriding the template. Empty = keep the template's.
    pub executor_image: String,
    /// Path to the YAML workload template.
    pub job_template: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpfsConfig {
    /// HTTP gateway base URL. Empty = read modules from the local mirror.
    pub endpoint: String,
    /// Directory the mirror fetcher reads modules from.
    pub mirror: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_EXECUTOR_IMAGE: &str = "executor-demo/executor:demo";
pub const DEFAULT_JOB_TEMPLATE: &str = "k8s/job.yaml";
pub const DEFAULT_IPFS_MIRROR: &str = "host/wasm";

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            executor_image: DEFAULT_EXECUTOR_IMAGE.to_string(),
            job_template: PathBuf::from(DEFAULT_JOB_TEMPLATE),
        }
    }
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            mirror: PathBuf::from(DEFAULT_IPFS_MIRROR),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gantry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GantryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GantryConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GANTRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&GantryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Refill fields an explicit config file may have blanked out.
    pub fn apply_defaults(&mut self) {
        if self.cluster.namespace.is_empty() {
            self.cluster.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if self.cluster.executor_image.is_empty() {
            self.cluster.executor_image = DEFAULT_EXECUTOR_IMAGE.to_string();
        }
        if self.cluster.job_template.as_os_str().is_empty() {
            self.cluster.job_template = PathBuf::from(DEFAULT_JOB_TEMPLATE);
        }
        if self.ipfs.mirror.as_os_str().is_empty() {
            self.ipfs.mirror = PathBuf::from(DEFAULT_IPFS_MIRROR);
        }
    }

    /// Apply GANTRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GANTRY_CLUSTER__NAMESPACE") {
            self.cluster.namespace = v;
        }
        if let Ok(v) = std::env::var("GANTRY_CLUSTER__EXECUTOR_IMAGE") {
            self.cluster.executor_image = v;
        }
        if let Ok(v) = std::env::var("GANTRY_CLUSTER__JOB_TEMPLATE") {
            self.cluster.job_template = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GANTRY_IPFS__ENDPOINT") {
            self.ipfs.endpoint = v;
        }
        if let Ok(v) = std::env::var("GANTRY_IPFS__MIRROR") {
            self.ipfs.mirror = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = GantryConfig::default();
        assert_eq!(config.cluster.namespace, "default");
        assert_eq!(config.cluster.executor_image, "executor-demo/executor:demo");
        assert_eq!(config.cluster.job_template, PathBuf::from("k8s/job.yaml"));
        assert!(config.ipfs.endpoint.is_empty());
        assert_eq!(config.ipfs.mirror, PathBuf::from("host/wasm"));
    }

    #[test]
    fn apply_defaults_refills_blanked_fields() {
        let mut config = GantryConfig::default();
        config.cluster.namespace.clear();
        config.cluster.executor_image.clear();
        config.cluster.job_template = PathBuf::new();
        config.ipfs.mirror = PathBuf::new();

        config.apply_defaults();
        assert_eq!(config.cluster.namespace, "default");
        assert_eq!(config.cluster.executor_image, "executor-demo/executor:demo");
        assert_eq!(config.cluster.job_template, PathBuf::from("k8s/job.yaml"));
        assert_eq!(config.ipfs.mirror, PathBuf::from("host/wasm"));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&GantryConfig::default()).unwrap();
        let parsed: GantryConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.cluster.namespace, "default");
        assert!(parsed.ipfs.endpoint.is_empty());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let parsed: GantryConfig =
            toml::from_str("[cluster]\nnamespace = \"jobs\"\n").unwrap();
        assert_eq!(parsed.cluster.namespace, "jobs");
        assert_eq!(parsed.cluster.executor_image, "executor-demo/executor:demo");
        assert_eq!(parsed.ipfs.mirror, PathBuf::from("host/wasm"));
    }
}
