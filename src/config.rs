//! Engine configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML file,
//! `CAPCOMPOSE_*` environment variables, then command-line flags.
//!
//! ```yaml
//! registry_dir: capabilities
//! load_concurrency: 16
//! contract_timeout_ms: 5000
//! manifest_format: yaml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::registry::DEFAULT_LOAD_CONCURRENCY;
use crate::capabilities::RegistryLoader;
use crate::contract::{ContractEvaluator, PredicateRegistry};
use crate::manifest::{ManifestEmitter, ManifestFormat};

pub const ENV_REGISTRY: &str = "CAPCOMPOSE_REGISTRY";
pub const ENV_LOAD_CONCURRENCY: &str = "CAPCOMPOSE_LOAD_CONCURRENCY";
pub const ENV_CONTRACT_TIMEOUT_MS: &str = "CAPCOMPOSE_CONTRACT_TIMEOUT_MS";
pub const ENV_MANIFEST_FORMAT: &str = "CAPCOMPOSE_MANIFEST_FORMAT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory the registry is loaded from.
    #[serde(default = "default_registry_dir")]
    pub registry_dir: PathBuf,
    /// Spec files read concurrently during a load.
    #[serde(default = "default_load_concurrency")]
    pub load_concurrency: usize,
    /// Per-contract evaluation timeout.
    #[serde(default = "default_contract_timeout_ms")]
    pub contract_timeout_ms: u64,
    #[serde(default)]
    pub manifest_format: ManifestFormat,
}

fn default_registry_dir() -> PathBuf {
    PathBuf::from("capabilities")
}

fn default_load_concurrency() -> usize {
    DEFAULT_LOAD_CONCURRENCY
}

fn default_contract_timeout_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registry_dir: default_registry_dir(),
            load_concurrency: default_load_concurrency(),
            contract_timeout_ms: default_contract_timeout_ms(),
            manifest_format: ManifestFormat::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Apply `CAPCOMPOSE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Values that do not parse are ignored
    /// with a warning.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_REGISTRY).filter(|d| !d.is_empty()) {
            self.registry_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_LOAD_CONCURRENCY) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.load_concurrency = n,
                _ => log::warn!("Config: ignoring {}='{}'", ENV_LOAD_CONCURRENCY, raw),
            }
        }
        if let Some(raw) = lookup(ENV_CONTRACT_TIMEOUT_MS) {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => self.contract_timeout_ms = ms,
                _ => log::warn!("Config: ignoring {}='{}'", ENV_CONTRACT_TIMEOUT_MS, raw),
            }
        }
        if let Some(raw) = lookup(ENV_MANIFEST_FORMAT) {
            match raw.parse::<ManifestFormat>() {
                Ok(format) => self.manifest_format = format,
                Err(e) => log::warn!("Config: ignoring {}: {}", ENV_MANIFEST_FORMAT, e),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "load_concurrency must be at least 1".to_string(),
            ));
        }
        if self.contract_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "contract_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn contract_timeout(&self) -> Duration {
        Duration::from_millis(self.contract_timeout_ms)
    }

    pub fn loader(&self) -> RegistryLoader {
        RegistryLoader::new().with_concurrency(self.load_concurrency)
    }

    pub fn evaluator(&self, predicates: PredicateRegistry) -> ContractEvaluator {
        ContractEvaluator::new(predicates).with_timeout(self.contract_timeout())
    }

    pub fn emitter(&self) -> ManifestEmitter {
        ManifestEmitter::new(self.manifest_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.registry_dir, PathBuf::from("capabilities"));
        assert_eq!(config.load_concurrency, 16);
        assert_eq!(config.contract_timeout(), Duration::from_secs(5));
        assert_eq!(config.manifest_format, ManifestFormat::Yaml);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml("registry_dir: specs\nmanifest_format: json\n").unwrap();
        assert_eq!(config.registry_dir, PathBuf::from("specs"));
        assert_eq!(config.manifest_format, ManifestFormat::Json);
        assert_eq!(config.contract_timeout_ms, 5000);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(matches!(
            EngineConfig::from_yaml("contract_timeout_ms: 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_REGISTRY, "/srv/capabilities"),
            (ENV_LOAD_CONCURRENCY, "4"),
            (ENV_CONTRACT_TIMEOUT_MS, "soon"),
            (ENV_MANIFEST_FORMAT, "json"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.registry_dir, PathBuf::from("/srv/capabilities"));
        assert_eq!(config.load_concurrency, 4);
        assert_eq!(config.contract_timeout_ms, 5000);
        assert_eq!(config.manifest_format, ManifestFormat::Json);
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capcompose.yaml");
        std::fs::write(&path, "load_concurrency: 2\n").unwrap();
        let config = EngineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.load_concurrency, 2);
    }
}
