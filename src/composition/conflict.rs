//! Conflict detection over a built composition graph.
//!
//! Structural conflicts (`MissingPrerequisite`, `Cycle`, `Incompatibility`,
//! `DuplicateName`) are always blocking and never settled automatically.
//! `BehaviorNameCollision` is blocking until the resolution policy settles it.
//! `ContractContradiction` is advisory: it is reported but does not fail the
//! composition.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::graph::{CompositionGraph, GraphNode};
use crate::capabilities::capability::normalize_target;
use crate::capabilities::{Assertion, CapabilityRef, VersionReq};

// ============================================================================
// Conflict
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DuplicateName,
    MissingPrerequisite,
    Cycle,
    Incompatibility,
    BehaviorNameCollision,
    ContractContradiction,
}

impl ConflictKind {
    /// Only behavior collisions may be settled by the request's policy.
    pub fn is_policy_resolvable(&self) -> bool {
        matches!(self, ConflictKind::BehaviorNameCollision)
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::DuplicateName => "DuplicateName",
            ConflictKind::MissingPrerequisite => "MissingPrerequisite",
            ConflictKind::Cycle => "CycleDetected",
            ConflictKind::Incompatibility => "Incompatibility",
            ConflictKind::BehaviorNameCollision => "BehaviorNameCollision",
            ConflictKind::ContractContradiction => "ContractContradiction",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Advisory,
}

/// One detected conflict.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    /// Capability ids (`name@version`), or bare names for capabilities that
    /// are not in the composition. Cycles list the full path.
    pub participants: Vec<String>,
    /// Behavior name, config key or path the conflict is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

impl Conflict {
    fn blocking(kind: ConflictKind, participants: Vec<String>, message: String) -> Self {
        Self {
            kind,
            severity: Severity::Blocking,
            participants,
            subject: None,
            message,
        }
    }

    fn about(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }

    pub fn missing_prerequisite(requirer: &str, prerequisite: &CapabilityRef) -> Self {
        Self::blocking(
            ConflictKind::MissingPrerequisite,
            vec![requirer.to_string(), prerequisite.name.clone()],
            format!(
                "{} requires {}, which is not in the request",
                requirer, prerequisite
            ),
        )
    }

    pub fn prerequisite_version(requirer: &str, prerequisite: &CapabilityRef, present: &str) -> Self {
        Self::blocking(
            ConflictKind::Incompatibility,
            vec![requirer.to_string(), present.to_string()],
            format!(
                "{} requires {} but the request resolves {}",
                requirer, prerequisite, present
            ),
        )
    }

    /// `path` is closed: its first and last elements are the same node.
    pub fn cycle(path: Vec<String>) -> Self {
        let message = format!("prerequisite cycle: {}", path.join(" -> "));
        Self::blocking(ConflictKind::Cycle, path, message)
    }

    pub fn duplicate_versions(name: &str, constraints: &[VersionReq], candidates: Vec<String>) -> Self {
        let constraints: Vec<String> = constraints.iter().map(|c| c.to_string()).collect();
        Self::blocking(
            ConflictKind::DuplicateName,
            candidates,
            format!(
                "'{}' is requested as {}; no single version satisfies all of them",
                name,
                constraints.join(" and ")
            ),
        )
        .about(name)
    }

    pub fn duplicate_config(id: &str, key: &str) -> Self {
        Self::blocking(
            ConflictKind::DuplicateName,
            vec![id.to_string()],
            format!("{} is requested more than once with different values for '{}'", id, key),
        )
        .about(key)
    }

    pub fn incompatible(a: &GraphNode, b: &GraphNode, reason: &str) -> Self {
        Self::blocking(
            ConflictKind::Incompatibility,
            vec![a.id(), b.id()],
            format!("{} {} {}", a.id(), reason, b.id()),
        )
    }

    pub fn behavior_collision(behavior: &str, owners: Vec<String>) -> Self {
        let message = format!("behavior '{}' is declared by {}", behavior, owners.join(" and "));
        Self::blocking(ConflictKind::BehaviorNameCollision, owners, message).about(behavior)
    }

    pub fn contract_contradiction(path: &str, left: &ContractSite<'_>, right: &ContractSite<'_>) -> Self {
        Self {
            kind: ConflictKind::ContractContradiction,
            severity: Severity::Advisory,
            participants: vec![left.owner.clone(), right.owner.clone()],
            subject: Some(path.to_string()),
            message: format!(
                "{} contract '{}' ({}) contradicts {} contract '{}' ({}) on {}/",
                left.owner,
                left.contract,
                left.assertion.kind_name(),
                right.owner,
                right.contract,
                right.assertion.kind_name(),
                path
            ),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

// ============================================================================
// Notes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    DuplicateCollapsed,
    UnknownTemplate,
    Deprecated,
}

/// Informational finding that never affects the outcome.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Note {
    pub kind: NoteKind,
    pub subject: String,
    pub message: String,
}

impl Note {
    pub fn duplicate_collapsed(name: &str, count: usize, id: &str) -> Self {
        Self {
            kind: NoteKind::DuplicateCollapsed,
            subject: name.to_string(),
            message: format!("'{}' requested {} times; collapsed to {}", name, count, id),
        }
    }

    pub fn unknown_template(name: &str) -> Self {
        Self {
            kind: NoteKind::UnknownTemplate,
            subject: name.to_string(),
            message: format!("template '{}' is not in the registry; starting from an empty set", name),
        }
    }

    pub fn deprecated(id: &str) -> Self {
        Self {
            kind: NoteKind::Deprecated,
            subject: id.to_string(),
            message: format!("{} is deprecated", id),
        }
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ============================================================================
// Detector
// ============================================================================

/// A contract located on a capability, used when comparing assertions.
pub struct ContractSite<'a> {
    pub owner: String,
    pub contract: &'a str,
    pub assertion: &'a Assertion,
}

/// Scans a graph's resolved set for conflicts the builder cannot see.
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    contradictions: bool,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self { contradictions: true }
    }
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle the advisory contract-contradiction scan.
    pub fn with_contradictions(mut self, enabled: bool) -> Self {
        self.contradictions = enabled;
        self
    }

    pub fn detect(&self, graph: &CompositionGraph) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        conflicts.extend(behavior_collisions(graph));
        conflicts.extend(incompatibilities(graph));
        if self.contradictions {
            conflicts.extend(contradictions(graph));
        }
        conflicts
    }
}

fn behavior_collisions(graph: &CompositionGraph) -> Vec<Conflict> {
    let mut owners: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for node in graph.nodes() {
        for behavior in &node.spec.behaviors {
            owners.entry(behavior.name.as_str()).or_default().push(node.id());
        }
    }
    owners
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(behavior, ids)| Conflict::behavior_collision(behavior, ids))
        .collect()
}

fn incompatibilities(graph: &CompositionGraph) -> Vec<Conflict> {
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut conflicts = Vec::new();

    let mut report = |a: &GraphNode, b: &GraphNode, reason: &str| {
        let key = if a.name() <= b.name() {
            (a.name().to_string(), b.name().to_string())
        } else {
            (b.name().to_string(), a.name().to_string())
        };
        if seen.insert(key) {
            conflicts.push(Conflict::incompatible(a, b, reason));
        }
    };

    for a in graph.nodes() {
        for r in &a.spec.incompatible_with {
            if let Some(b) = graph.node(&r.name) {
                if r.version.matches(&b.spec.version) {
                    report(a, b, "is incompatible with");
                }
            }
        }

        if a.spec.composable_with.is_empty() {
            continue;
        }
        for b in graph.nodes() {
            if b.name() == a.name() || a.spec.requires(b.name()) {
                continue;
            }
            let allowed = a
                .spec
                .composable_with
                .iter()
                .any(|r| r.name == b.name() && r.version.matches(&b.spec.version));
            if !allowed {
                report(a, b, "only composes with its allowlist, which excludes");
            }
        }
    }
    conflicts
}

fn contradictions(graph: &CompositionGraph) -> Vec<Conflict> {
    let mut by_path: BTreeMap<String, Vec<ContractSite<'_>>> = BTreeMap::new();
    for node in graph.nodes() {
        for contract in &node.spec.contracts {
            if matches!(contract.assertion, Assertion::Custom { .. }) {
                continue;
            }
            if let Some(target) = contract.assertion.target() {
                by_path
                    .entry(normalize_target(target))
                    .or_default()
                    .push(ContractSite {
                        owner: node.id(),
                        contract: &contract.name,
                        assertion: &contract.assertion,
                    });
            }
        }
    }

    let mut conflicts = Vec::new();
    for (path, sites) in &by_path {
        for (i, left) in sites.iter().enumerate() {
            for right in &sites[i + 1..] {
                if opposed(left.assertion, right.assertion) {
                    conflicts.push(Conflict::contract_contradiction(path, left, right));
                }
            }
        }
    }
    conflicts
}

/// Whether two assertions on the same path cannot both hold.
fn opposed(a: &Assertion, b: &Assertion) -> bool {
    use Assertion::*;
    let exists = |x: &Assertion| matches!(x, DirectoryExists { .. } | FileExists { .. } | FileContains { .. });
    let is_file = |x: &Assertion| matches!(x, FileExists { .. } | FileContains { .. });
    match (a, b) {
        (PathAbsent { .. }, other) | (other, PathAbsent { .. }) => exists(other),
        (DirectoryExists { .. }, other) | (other, DirectoryExists { .. }) => is_file(other),
        _ => false,
    }
}
