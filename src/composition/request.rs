//! Composition requests: what an instance wants composed.
//!
//! ```yaml
//! composition:
//!   base_template: advisor
//!   capabilities:
//!     - memory-management
//!     - name: collaboration
//!       version: ">=1.0.0"
//!       config:
//!         cadence: daily
//!   composition_rules:
//!     conflict_resolution: first_wins
//! ```
//!
//! `conflict_resolution` is a closed set; an unknown value is rejected rather
//! than defaulted. When `composition_rules` is absent the policy is `error`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{is_valid_name, ConfigValue, SchemaError, VersionReq};

/// How behavior-name collisions are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Any collision fails the composition.
    #[default]
    Error,
    /// The capability earliest in canonical order keeps the behavior.
    FirstWins,
    /// The capability latest in canonical order keeps the behavior.
    LastWins,
    /// Colliding behaviors with compatible triggers are concatenated.
    Merge,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::FirstWins => "first_wins",
            Self::LastWins => "last_wins",
            Self::Merge => "merge",
        };
        f.write_str(s)
    }
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "first_wins" | "first-wins" => Ok(Self::FirstWins),
            "last_wins" | "last-wins" => Ok(Self::LastWins),
            "merge" => Ok(Self::Merge),
            other => Err(format!(
                "conflict_resolution '{}' is not one of error, first_wins, last_wins, merge",
                other
            )),
        }
    }
}

/// One requested capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "VersionReq::is_any")]
    pub version: VersionReq,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, ConfigValue>,
}

impl CapabilityRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: VersionReq::STAR,
            config: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: VersionReq) -> Self {
        self.version = version;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// A validated composition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionRequest {
    pub base_template: String,
    pub capabilities: Vec<CapabilityRequest>,
    pub conflict_resolution: ConflictResolution,
}

/// Errors from reading a composition request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid composition request: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl RequestError {
    /// Express this error as a schema error attributed to `source`.
    pub fn to_schema_error(&self, source: &str) -> SchemaError {
        match self {
            RequestError::Invalid(problems) => SchemaError::new(source, problems.clone()),
            other => SchemaError::single(source, other.to_string()),
        }
    }
}

impl CompositionRequest {
    pub fn new(base_template: impl Into<String>) -> Self {
        Self {
            base_template: base_template.into(),
            capabilities: Vec::new(),
            conflict_resolution: ConflictResolution::Error,
        }
    }

    pub fn with_capability(mut self, capability: CapabilityRequest) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_policy(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, RequestError> {
        let doc: RequestDocument = serde_yaml::from_str(yaml)?;
        Self::from_document(doc.composition).map_err(RequestError::Invalid)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RequestError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    fn from_document(doc: CompositionDocument) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();

        let base_template = match doc.base_template {
            Some(t) if is_valid_name(&t) => t,
            Some(t) => {
                problems.push(format!("base_template '{}' is not lowercase-hyphen", t));
                t
            }
            None => {
                problems.push("missing required field 'base_template'".to_string());
                String::new()
            }
        };

        let mut capabilities = Vec::new();
        for (i, entry) in doc.capabilities.into_iter().enumerate() {
            let (name, version, config) = match entry {
                CapabilityRequestDocument::Name(name) => (name, None, BTreeMap::new()),
                CapabilityRequestDocument::Full {
                    name,
                    version,
                    config,
                } => (name, version, config),
            };
            if !is_valid_name(&name) {
                problems.push(format!(
                    "capabilities[{}]: '{}' is not a valid capability name",
                    i, name
                ));
                continue;
            }
            let version = match version.as_deref().map(VersionReq::parse) {
                Some(Ok(req)) => req,
                Some(Err(e)) => {
                    problems.push(format!("capabilities[{}] ({}): {}", i, name, e));
                    continue;
                }
                None => VersionReq::STAR,
            };
            capabilities.push(CapabilityRequest {
                name,
                version,
                config,
            });
        }

        let conflict_resolution = match doc
            .composition_rules
            .and_then(|rules| rules.conflict_resolution)
        {
            Some(raw) => match raw.parse::<ConflictResolution>() {
                Ok(policy) => policy,
                Err(e) => {
                    problems.push(e);
                    ConflictResolution::Error
                }
            },
            None => ConflictResolution::Error,
        };

        if problems.is_empty() {
            Ok(Self {
                base_template,
                capabilities,
                conflict_resolution,
            })
        } else {
            Err(problems)
        }
    }
}

// ============================================================================
// Raw documents
// ============================================================================

#[derive(Debug, Deserialize)]
struct RequestDocument {
    composition: CompositionDocument,
}

#[derive(Debug, Deserialize)]
struct CompositionDocument {
    #[serde(default)]
    base_template: Option<String>,
    #[serde(default)]
    capabilities: Vec<CapabilityRequestDocument>,
    #[serde(default)]
    composition_rules: Option<RulesDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CapabilityRequestDocument {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        config: BTreeMap<String, ConfigValue>,
    },
}

#[derive(Debug, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    conflict_resolution: Option<String>,
}
