//! Capability specification: the unit of composable agent behavior.
//!
//! A capability declares:
//! - Its identity (lowercase-hyphen name, semver version, lifecycle status)
//! - The capabilities it requires, and the ones it can or cannot sit beside
//! - The behaviors it contributes (trigger, protocol steps, output)
//! - The structural contracts a materialized instance must satisfy
//! - The typed configuration keys it accepts
//!
//! Specs are authored externally as YAML and are read-only once loaded.
//! Parsing happens in two stages: a lenient [`CapabilityDocument`] is read
//! with serde, then [`CapabilitySpec::from_document`] checks every structural
//! rule and reports all problems in one pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::{check_schema, ConfigField, ConfigValue};
use super::version::{Version, VersionReq};

static CAPABILITY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").unwrap());

/// Check a capability name against the lowercase-hyphen convention.
pub fn is_valid_name(name: &str) -> bool {
    CAPABILITY_NAME.is_match(name)
}

/// Errors from parsing a single capability document.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid capability spec: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

// ============================================================================
// Domain types
// ============================================================================

/// Lifecycle status of a capability spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Draft,
    Review,
    Approved,
    Deprecated,
}

impl CapabilityStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "review" => Some(Self::Review),
            "approved" => Some(Self::Approved),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Review => "review",
            Self::Approved => "approved",
            Self::Deprecated => "deprecated",
        };
        f.write_str(s)
    }
}

/// A reference to another capability by name and version constraint.
///
/// Used for prerequisites, template defaults and compatibility lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "VersionReq::is_any")]
    pub version: VersionReq,
}

impl CapabilityRef {
    pub fn new(name: impl Into<String>, version: VersionReq) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, VersionReq::STAR)
    }
}

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_any() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} {}", self.name, self.version)
        }
    }
}

/// Structural class of a behavior trigger. Merging two behaviors requires
/// their triggers to share a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Natural-language cue ("user asks to step back").
    Phrase,
    /// Explicit command invocation.
    Command,
    /// Named lifecycle event.
    Event,
    /// Time-based schedule.
    Schedule,
}

/// What causes a behavior to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub value: String,
}

/// A behavior contributed by a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Behavior {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    pub protocol: Vec<String>,
    pub output: String,
}

/// The structural assertion a contract makes about a materialized instance.
/// Paths are relative to the instance root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    DirectoryExists {
        path: String,
    },
    FileExists {
        path: String,
    },
    /// File exists and its contents match `pattern` (a regular expression).
    FileContains {
        path: String,
        pattern: String,
    },
    PathAbsent {
        path: String,
    },
    /// Delegated to a predicate registered under `evaluator`.
    Custom {
        evaluator: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, ConfigValue>,
    },
}

impl Assertion {
    /// Assertion kind names accepted in spec documents.
    pub const KINDS: [&'static str; 5] = [
        "directory_exists",
        "file_exists",
        "file_contains",
        "path_absent",
        "custom",
    ];

    pub fn kind_name(&self) -> &'static str {
        match self {
            Assertion::DirectoryExists { .. } => "directory_exists",
            Assertion::FileExists { .. } => "file_exists",
            Assertion::FileContains { .. } => "file_contains",
            Assertion::PathAbsent { .. } => "path_absent",
            Assertion::Custom { .. } => "custom",
        }
    }

    /// The target path, if the assertion has one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Assertion::DirectoryExists { path }
            | Assertion::FileExists { path }
            | Assertion::FileContains { path, .. }
            | Assertion::PathAbsent { path } => Some(path),
            Assertion::Custom { path, .. } => path.as_deref(),
        }
    }
}

/// A named structural contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub assertion: Assertion,
}

/// A validated capability specification.
///
/// Example YAML:
/// ```yaml
/// capability:
///   name: collaboration
///   version: "1.2.0"
///   status: approved
///   prerequisites:
///     - name: domain-knowledge
///       version: ">=1.0.0"
///   behaviors:
///     - name: step_back
///       trigger: "user asks to step back"
///       protocol:
///         - "Summarize the current thread"
///         - "Ask which direction to take"
///       output: "A short reflection"
///   contracts:
///     - name: has_governance
///       assertion: directory_exists
///       path: governance/
///   incompatible_with: [solo-mode]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub version: Version,
    pub status: CapabilityStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub prerequisites: Vec<CapabilityRef>,
    pub behaviors: Vec<Behavior>,
    pub contracts: Vec<Contract>,
    /// When non-empty, the only capabilities (besides prerequisites) this one
    /// may be composed with.
    #[serde(default)]
    pub composable_with: Vec<CapabilityRef>,
    #[serde(default)]
    pub incompatible_with: Vec<CapabilityRef>,
    #[serde(default)]
    pub config: BTreeMap<String, ConfigField>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CapabilitySpec {
    /// Parse a single capability from YAML (nested under `capability:`).
    pub fn from_yaml(yaml: &str) -> Result<Self, SpecError> {
        let wrapper: CapabilityWrapper = serde_yaml::from_str(yaml)?;
        Self::from_document(wrapper.capability).map_err(SpecError::Invalid)
    }

    /// Validate a raw document, collecting every structural problem.
    pub fn from_document(doc: CapabilityDocument) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();

        let name = match doc.name {
            Some(n) if is_valid_name(&n) => n,
            Some(n) => {
                problems.push(format!("name '{}' is not lowercase-hyphen", n));
                n
            }
            None => {
                problems.push("missing required field 'name'".to_string());
                String::new()
            }
        };

        let version = match doc.version.as_deref().map(Version::parse) {
            Some(Ok(v)) => Some(v),
            Some(Err(e)) => {
                problems.push(e.to_string());
                None
            }
            None => {
                problems.push("missing required field 'version'".to_string());
                None
            }
        };

        let status = match doc.status.as_deref() {
            Some(s) => {
                let parsed = CapabilityStatus::parse(s);
                if parsed.is_none() {
                    problems.push(format!(
                        "status '{}' is not one of draft, review, approved, deprecated",
                        s
                    ));
                }
                parsed
            }
            None => {
                problems.push("missing required field 'status'".to_string());
                None
            }
        };

        let prerequisites = convert_refs("prerequisites", doc.prerequisites, &mut problems);
        let composable_with = convert_refs("composable_with", doc.composable_with, &mut problems);
        let incompatible_with =
            convert_refs("incompatible_with", doc.incompatible_with, &mut problems);

        if prerequisites.iter().any(|p| p.name == name) {
            problems.push(format!("'{}' lists itself as a prerequisite", name));
        }
        if incompatible_with.iter().any(|r| r.name == name) {
            problems.push(format!("'{}' lists itself as incompatible", name));
        }
        for r in &incompatible_with {
            if composable_with.iter().any(|c| c.name == r.name) {
                problems.push(format!(
                    "'{}' appears in both composable_with and incompatible_with",
                    r.name
                ));
            }
            if prerequisites.iter().any(|p| p.name == r.name) {
                problems.push(format!(
                    "'{}' is both a prerequisite and incompatible",
                    r.name
                ));
            }
        }

        let behaviors = convert_behaviors(doc.behaviors, &mut problems);
        let contracts = convert_contracts(doc.contracts, &mut problems);
        problems.extend(check_schema(&doc.config));

        match (version, status) {
            (Some(version), Some(status)) if problems.is_empty() => Ok(CapabilitySpec {
                name,
                version,
                status,
                description: doc.description,
                prerequisites,
                behaviors,
                contracts,
                composable_with,
                incompatible_with,
                config: doc.config,
                tags: doc.tags,
            }),
            _ => Err(problems),
        }
    }

    /// `name@version`, the identity used in diagnostics and provenance.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn behavior(&self, name: &str) -> Option<&Behavior> {
        self.behaviors.iter().find(|b| b.name == name)
    }

    pub fn behavior_names(&self) -> Vec<&str> {
        self.behaviors.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn requires(&self, name: &str) -> bool {
        self.prerequisites.iter().any(|p| p.name == name)
    }
}

// ============================================================================
// Raw documents
// ============================================================================

/// Wrapper for YAML deserialization (capability is nested under `capability:` key)
#[derive(Debug, Deserialize)]
pub(crate) struct CapabilityWrapper {
    pub(crate) capability: CapabilityDocument,
}

/// A capability document as written, before structural validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prerequisites: Vec<RefDocument>,
    #[serde(default)]
    pub behaviors: Vec<BehaviorDocument>,
    #[serde(default)]
    pub contracts: Vec<ContractDocument>,
    #[serde(default)]
    pub composable_with: Vec<RefDocument>,
    #[serde(default)]
    pub incompatible_with: Vec<RefDocument>,
    #[serde(default)]
    pub config: BTreeMap<String, ConfigField>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A capability reference as written: a bare name or `{name, version}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RefDocument {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
}

impl RefDocument {
    /// Validate into a [`CapabilityRef`]. `what` names the referring list in
    /// error messages.
    pub fn into_ref(self, what: &str) -> Result<CapabilityRef, String> {
        let (name, version) = match self {
            RefDocument::Name(name) => (name, None),
            RefDocument::Full { name, version } => (name, version),
        };
        if !is_valid_name(&name) {
            return Err(format!("{}: '{}' is not a valid capability name", what, name));
        }
        let version = match version {
            Some(raw) => VersionReq::parse(&raw).map_err(|e| format!("{}: {}", what, e))?,
            None => VersionReq::STAR,
        };
        Ok(CapabilityRef { name, version })
    }
}

/// Trigger as written: a plain phrase or `{kind, value}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TriggerDocument {
    Phrase(String),
    Structured {
        #[serde(alias = "type")]
        kind: TriggerKind,
        value: String,
    },
}

impl From<TriggerDocument> for Trigger {
    fn from(doc: TriggerDocument) -> Self {
        match doc {
            TriggerDocument::Phrase(value) => Trigger {
                kind: TriggerKind::Phrase,
                value,
            },
            TriggerDocument::Structured { kind, value } => Trigger { kind, value },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BehaviorDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger: Option<TriggerDocument>,
    #[serde(default, alias = "steps")]
    pub protocol: Vec<String>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assertion: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub evaluator: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ConfigValue>,
}

fn convert_refs(what: &str, docs: Vec<RefDocument>, problems: &mut Vec<String>) -> Vec<CapabilityRef> {
    let mut seen = BTreeSet::new();
    let mut refs = Vec::new();
    for doc in docs {
        match doc.into_ref(what) {
            Ok(r) => {
                if seen.insert(r.name.clone()) {
                    refs.push(r);
                } else {
                    problems.push(format!("{}: '{}' listed more than once", what, r.name));
                }
            }
            Err(e) => problems.push(e),
        }
    }
    refs
}

fn convert_behaviors(docs: Vec<BehaviorDocument>, problems: &mut Vec<String>) -> Vec<Behavior> {
    if docs.is_empty() {
        problems.push("at least one behavior is required".to_string());
    }
    let mut seen = BTreeSet::new();
    let mut behaviors = Vec::new();
    for (i, doc) in docs.into_iter().enumerate() {
        let label = doc
            .name
            .clone()
            .unwrap_or_else(|| format!("behaviors[{}]", i));
        let mut ok = true;
        let name = match doc.name {
            Some(n) if !n.trim().is_empty() => n,
            _ => {
                problems.push(format!("{}: missing behavior name", label));
                ok = false;
                String::new()
            }
        };
        if doc.protocol.is_empty() || doc.protocol.iter().any(|s| s.trim().is_empty()) {
            problems.push(format!("{}: protocol must list at least one non-empty step", label));
            ok = false;
        }
        let output = match doc.output {
            Some(o) if !o.trim().is_empty() => o,
            _ => {
                problems.push(format!("{}: missing behavior output", label));
                ok = false;
                String::new()
            }
        };
        if ok && !seen.insert(name.clone()) {
            problems.push(format!("behavior '{}' declared more than once", name));
            ok = false;
        }
        if ok {
            behaviors.push(Behavior {
                name,
                trigger: doc.trigger.map(Trigger::from),
                protocol: doc.protocol,
                output,
            });
        }
    }
    behaviors
}

fn convert_contracts(docs: Vec<ContractDocument>, problems: &mut Vec<String>) -> Vec<Contract> {
    if docs.is_empty() {
        problems.push("at least one contract is required".to_string());
    }
    let mut seen = BTreeSet::new();
    let mut contracts = Vec::new();
    for (i, doc) in docs.into_iter().enumerate() {
        let label = doc
            .name
            .clone()
            .unwrap_or_else(|| format!("contracts[{}]", i));
        match convert_contract(doc) {
            Ok(contract) => {
                if seen.insert(contract.name.clone()) {
                    contracts.push(contract);
                } else {
                    problems.push(format!("contract '{}' declared more than once", contract.name));
                }
            }
            Err(errs) => problems.extend(errs.into_iter().map(|e| format!("{}: {}", label, e))),
        }
    }
    contracts
}

fn convert_contract(doc: ContractDocument) -> Result<Contract, Vec<String>> {
    let mut problems = Vec::new();
    let name = match doc.name {
        Some(n) if !n.trim().is_empty() => n,
        _ => {
            problems.push("missing contract name".to_string());
            String::new()
        }
    };

    let require_path = |problems: &mut Vec<String>| match doc.path.clone() {
        Some(p) => match check_relative_path(&p) {
            Ok(()) => Some(p),
            Err(e) => {
                problems.push(e);
                None
            }
        },
        None => {
            problems.push("missing 'path'".to_string());
            None
        }
    };

    let assertion = match doc.assertion.as_deref() {
        Some("directory_exists") => {
            require_path(&mut problems).map(|path| Assertion::DirectoryExists { path })
        }
        Some("file_exists") => {
            require_path(&mut problems).map(|path| Assertion::FileExists { path })
        }
        Some("path_absent") => {
            require_path(&mut problems).map(|path| Assertion::PathAbsent { path })
        }
        Some("file_contains") => {
            let path = require_path(&mut problems);
            let pattern = match doc.pattern.clone() {
                Some(p) => match Regex::new(&p) {
                    Ok(_) => Some(p),
                    Err(e) => {
                        problems.push(format!("invalid pattern: {}", e));
                        None
                    }
                },
                None => {
                    problems.push("missing 'pattern'".to_string());
                    None
                }
            };
            match (path, pattern) {
                (Some(path), Some(pattern)) => Some(Assertion::FileContains { path, pattern }),
                _ => None,
            }
        }
        Some("custom") => {
            let path = match doc.path.clone() {
                Some(p) => match check_relative_path(&p) {
                    Ok(()) => Some(p),
                    Err(e) => {
                        problems.push(e);
                        None
                    }
                },
                None => None,
            };
            match doc.evaluator.clone() {
                Some(evaluator) if !evaluator.trim().is_empty() => Some(Assertion::Custom {
                    evaluator,
                    path,
                    params: doc.params.clone(),
                }),
                _ => {
                    problems.push("custom assertion requires 'evaluator'".to_string());
                    None
                }
            }
        }
        Some(other) => {
            problems.push(format!(
                "unrecognized assertion kind '{}' (expected one of {})",
                other,
                Assertion::KINDS.join(", ")
            ));
            None
        }
        None => {
            problems.push("missing 'assertion'".to_string());
            None
        }
    };

    match assertion {
        Some(assertion) if problems.is_empty() => Ok(Contract {
            name,
            description: doc.description,
            assertion,
        }),
        _ => Err(problems),
    }
}

/// Contract paths must stay inside the instance root.
fn check_relative_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("empty path".to_string());
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!("path '{}' must not contain '..'", path));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path '{}' must be relative", path));
            }
        }
    }
    Ok(())
}

/// Normalized form of a contract path, used to compare targets
/// (`./governance/` and `governance` are the same target).
pub fn normalize_target(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
