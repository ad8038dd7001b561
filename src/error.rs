//! Crate-level error type.

use thiserror::Error;

use crate::capabilities::RegistryError;
use crate::composition::{CompositionFailed, RequestError};
use crate::config::ConfigError;
use crate::diagnostics::ExitStatus;
use crate::manifest::ManifestError;

/// Anything that can stop an engine operation.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("request error: {0}")]
    Request(#[from] RequestError),

    #[error(transparent)]
    Failed(#[from] CompositionFailed),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComposeError {
    /// Exit status a command-line driver should report for this error.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ComposeError::Failed(failed) => ExitStatus::from_code(failed.exit_code()),
            ComposeError::Manifest(ManifestError::Io(_)) | ComposeError::Io(_) => {
                ExitStatus::CompositionFailed
            }
            ComposeError::Registry(RegistryError::Task(_)) => ExitStatus::CompositionFailed,
            ComposeError::Registry(_)
            | ComposeError::Request(_)
            | ComposeError::Manifest(_)
            | ComposeError::Config(_)
            | ComposeError::Json(_)
            | ComposeError::Yaml(_) => ExitStatus::InvalidInput,
        }
    }
}
