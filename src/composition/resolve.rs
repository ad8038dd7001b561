//! Resolution engine: turns a graph plus its conflicts into either a
//! [`ResolvedComposition`] or a [`CompositionFailed`] carrying every blocking
//! conflict found.
//!
//! Only behavior-name collisions are settled by policy. Everything else that
//! is blocking aborts the composition whatever the policy says.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::conflict::{Conflict, ConflictKind, Note};
use super::graph::{CompositionGraph, GraphNode, UnresolvedReference};
use super::request::ConflictResolution;
use crate::capabilities::{
    Behavior, CapabilityStatus, ConfigValue, Contract, SchemaError, Trigger, Version,
};

// ============================================================================
// Output types
// ============================================================================

/// A capability in the resolved set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCapability {
    pub name: String,
    pub version: Version,
    pub status: CapabilityStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, ConfigValue>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
}

impl ResolvedCapability {
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    fn from_node(node: &GraphNode) -> Self {
        Self {
            name: node.spec.name.clone(),
            version: node.spec.version.clone(),
            status: node.spec.status,
            config: node.config.clone(),
            contracts: node.spec.contracts.clone(),
        }
    }
}

/// A `requires` edge between two resolved capabilities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Requirement {
    pub capability: String,
    pub requires: String,
}

/// One entry of the unified behavior catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBehavior {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    pub protocol: Vec<String>,
    pub output: String,
    /// Ids of the capabilities this behavior came from, canonical order.
    pub sources: Vec<String>,
}

impl ResolvedBehavior {
    fn single(owner: &str, behavior: &Behavior) -> Self {
        Self {
            name: behavior.name.clone(),
            trigger: behavior.trigger.clone(),
            protocol: behavior.protocol.clone(),
            output: behavior.output.clone(),
            sources: vec![owner.to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Overridden,
    Merged,
}

/// Provenance for one collision the policy settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub behavior: String,
    pub policy: ConflictResolution,
    pub outcome: ResolutionOutcome,
    pub kept: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<String>,
    pub reason: String,
}

impl fmt::Display for ResolutionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.behavior, self.policy, self.reason)
    }
}

/// The outcome of a successful composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedComposition {
    base_template: String,
    policy: ConflictResolution,
    capabilities: Vec<ResolvedCapability>,
    #[serde(default)]
    requirements: Vec<Requirement>,
    /// Prerequisites first, ties alphabetical.
    materialization_order: Vec<String>,
    behaviors: Vec<ResolvedBehavior>,
    #[serde(default)]
    resolutions: Vec<ResolutionRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    advisories: Vec<Conflict>,
}

impl ResolvedComposition {
    pub fn base_template(&self) -> &str {
        &self.base_template
    }

    pub fn policy(&self) -> ConflictResolution {
        self.policy
    }

    /// Capabilities in canonical order.
    pub fn capabilities(&self) -> &[ResolvedCapability] {
        &self.capabilities
    }

    pub fn capability(&self, name: &str) -> Option<&ResolvedCapability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    pub fn capability_names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn materialization_order(&self) -> &[String] {
        &self.materialization_order
    }

    /// Behavior catalogue, sorted by behavior name.
    pub fn behaviors(&self) -> &[ResolvedBehavior] {
        &self.behaviors
    }

    pub fn behavior(&self, name: &str) -> Option<&ResolvedBehavior> {
        self.behaviors.iter().find(|b| b.name == name)
    }

    pub fn resolutions(&self) -> &[ResolutionRecord] {
        &self.resolutions
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn advisories(&self) -> &[Conflict] {
        &self.advisories
    }

    /// Every contract with its owning capability, in declared order.
    pub fn contracts(&self) -> impl Iterator<Item = (&ResolvedCapability, &Contract)> {
        self.capabilities
            .iter()
            .flat_map(|c| c.contracts.iter().map(move |contract| (c, contract)))
    }
}

/// A composition that could not be resolved. Carries every cause found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionFailed {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema_errors: Vec<SchemaError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<UnresolvedReference>,
    /// Blocking conflicts, sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

impl CompositionFailed {
    /// `2` when the request itself was invalid, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.schema_errors.is_empty() {
            1
        } else {
            2
        }
    }

    pub fn has_conflict(&self, kind: ConflictKind) -> bool {
        self.conflicts.iter().any(|c| c.kind == kind)
    }

    /// Every cause as one line each.
    pub fn causes(&self) -> Vec<String> {
        self.schema_errors
            .iter()
            .map(|e| e.to_string())
            .chain(self.unresolved.iter().map(|u| u.to_string()))
            .chain(self.conflicts.iter().map(|c| c.to_string()))
            .collect()
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.schema_errors.is_empty() {
            parts.push(format!("{} schema error(s)", self.schema_errors.len()));
        }
        if !self.unresolved.is_empty() {
            parts.push(format!("{} unresolved reference(s)", self.unresolved.len()));
        }
        if !self.conflicts.is_empty() {
            parts.push(format!("{} blocking conflict(s)", self.conflicts.len()));
        }
        if parts.is_empty() {
            "no cause recorded".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl fmt::Display for CompositionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "composition failed: {}", self.summary())
    }
}

impl std::error::Error for CompositionFailed {}

// ============================================================================
// Engine
// ============================================================================

/// Applies a [`ConflictResolution`] policy to a detected conflict list.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionEngine {
    policy: ConflictResolution,
}

impl ResolutionEngine {
    pub fn new(policy: ConflictResolution) -> Self {
        Self { policy }
    }

    pub fn resolve(
        &self,
        graph: &CompositionGraph,
        mut conflicts: Vec<Conflict>,
        mut notes: Vec<Note>,
    ) -> Result<ResolvedComposition, CompositionFailed> {
        conflicts.sort();
        conflicts.dedup();
        notes.sort();
        notes.dedup();

        let (blocking, advisories): (Vec<Conflict>, Vec<Conflict>) =
            conflicts.into_iter().partition(Conflict::is_blocking);

        let mut unsettled = Vec::new();
        let mut settled: BTreeMap<String, ResolvedBehavior> = BTreeMap::new();
        let mut resolutions = Vec::new();

        for conflict in blocking {
            if !conflict.kind.is_policy_resolvable() {
                unsettled.push(conflict);
                continue;
            }
            let Some(behavior) = conflict.subject.clone() else {
                unsettled.push(conflict);
                continue;
            };
            match self.settle(graph, &behavior) {
                Ok((resolved, record)) => {
                    log::info!("Resolution: {}", record);
                    settled.insert(behavior, resolved);
                    resolutions.push(record);
                }
                Err(reason) => {
                    let mut conflict = conflict;
                    if let Some(reason) = reason {
                        conflict.message = format!("{}; {}", conflict.message, reason);
                    }
                    unsettled.push(conflict);
                }
            }
        }

        if !unsettled.is_empty() {
            unsettled.sort();
            log::warn!(
                "Resolution: {} blocking conflict(s) remain under policy {}",
                unsettled.len(),
                self.policy
            );
            return Err(CompositionFailed {
                conflicts: unsettled,
                advisories,
                notes,
                ..Default::default()
            });
        }

        let mut behaviors: BTreeMap<String, ResolvedBehavior> = BTreeMap::new();
        for node in graph.nodes() {
            for behavior in &node.spec.behaviors {
                if !settled.contains_key(&behavior.name) {
                    behaviors.insert(
                        behavior.name.clone(),
                        ResolvedBehavior::single(&node.id(), behavior),
                    );
                }
            }
        }
        behaviors.extend(settled);

        let materialization_order = graph
            .dependency_order()
            .unwrap_or_else(|| graph.names().map(str::to_string).collect());

        Ok(ResolvedComposition {
            base_template: graph.template().name.clone(),
            policy: self.policy,
            capabilities: graph.nodes().map(ResolvedCapability::from_node).collect(),
            requirements: graph
                .edges()
                .map(|(from, to)| Requirement {
                    capability: from.to_string(),
                    requires: to.to_string(),
                })
                .collect(),
            materialization_order,
            behaviors: behaviors.into_values().collect(),
            resolutions,
            notes,
            advisories,
        })
    }

    /// Settle one collision. `Err(None)` means the policy refuses; `Err(Some)`
    /// adds a reason to the conflict message.
    fn settle(
        &self,
        graph: &CompositionGraph,
        behavior: &str,
    ) -> Result<(ResolvedBehavior, ResolutionRecord), Option<String>> {
        // Node iteration is canonical: one node per name, alphabetical.
        let owners: Vec<(String, &Behavior)> = graph
            .nodes()
            .filter_map(|n| n.spec.behavior(behavior).map(|b| (n.id(), b)))
            .collect();
        if owners.len() < 2 {
            return Err(None);
        }

        let pick = |winner: usize, position: &str| {
            let (id, b) = &owners[winner];
            let dropped: Vec<String> = owners
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != winner)
                .map(|(_, (id, _))| id.clone())
                .collect();
            let record = ResolutionRecord {
                behavior: behavior.to_string(),
                policy: self.policy,
                outcome: ResolutionOutcome::Overridden,
                kept: vec![id.clone()],
                reason: format!(
                    "{} is {} in canonical order; dropped {}",
                    id,
                    position,
                    dropped.join(", ")
                ),
                dropped,
            };
            (ResolvedBehavior::single(id, b), record)
        };

        match self.policy {
            ConflictResolution::Error => Err(None),
            ConflictResolution::FirstWins => Ok(pick(0, "earliest")),
            ConflictResolution::LastWins => Ok(pick(owners.len() - 1, "latest")),
            ConflictResolution::Merge => merge(behavior, &owners).map(|merged| {
                let record = ResolutionRecord {
                    behavior: behavior.to_string(),
                    policy: self.policy,
                    outcome: ResolutionOutcome::Merged,
                    kept: merged.sources.clone(),
                    dropped: Vec::new(),
                    reason: format!(
                        "protocols of {} concatenated in canonical order",
                        merged.sources.join(", ")
                    ),
                };
                (merged, record)
            }),
        }
    }
}

/// Concatenate colliding behaviors. Triggers are compatible when every
/// present trigger has the same kind; an absent trigger constrains nothing.
fn merge(behavior: &str, owners: &[(String, &Behavior)]) -> Result<ResolvedBehavior, Option<String>> {
    let triggers: Vec<&Trigger> = owners.iter().filter_map(|(_, b)| b.trigger.as_ref()).collect();
    if let Some(first) = triggers.first() {
        if let Some(other) = triggers.iter().find(|t| t.kind != first.kind) {
            return Err(Some(format!(
                "triggers of kind {:?} and {:?} cannot be merged",
                first.kind, other.kind
            )));
        }
    }

    let mut trigger_values: Vec<&str> = Vec::new();
    let mut outputs: Vec<&str> = Vec::new();
    let mut protocol = Vec::new();
    for (_, b) in owners {
        protocol.extend(b.protocol.iter().cloned());
        if !outputs.contains(&b.output.as_str()) {
            outputs.push(&b.output);
        }
        if let Some(t) = &b.trigger {
            if !trigger_values.contains(&t.value.as_str()) {
                trigger_values.push(&t.value);
            }
        }
    }

    Ok(ResolvedBehavior {
        name: behavior.to_string(),
        trigger: triggers.first().map(|t| Trigger {
            kind: t.kind,
            value: trigger_values.join(" | "),
        }),
        protocol,
        output: outputs.join("\n"),
        sources: owners.iter().map(|(id, _)| id.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilitySpec, RegistrySnapshot, TriggerKind};
    use crate::composition::conflict::ConflictDetector;
    use crate::composition::graph::GraphBuilder;
    use crate::composition::request::{CapabilityRequest, CompositionRequest};

    fn cap(name: &str, trigger: &str, step: &str) -> CapabilitySpec {
        CapabilitySpec::from_yaml(&format!(
            r#"
capability:
  name: {name}
  version: "1.0.0"
  status: approved
  behaviors:
    - name: step_back
      trigger: {trigger}
      protocol: ["{step}"]
      output: "{name} reflection"
    - name: {name}-only
      protocol: ["{name} step"]
      output: "{name} out"
  contracts:
    - {{ name: {name}-root, assertion: directory_exists, path: {name} }}
"#
        ))
        .unwrap()
    }

    fn run(
        specs: Vec<CapabilitySpec>,
        policy: ConflictResolution,
    ) -> Result<ResolvedComposition, CompositionFailed> {
        let registry = RegistrySnapshot::from_specs(specs);
        let names: Vec<String> = registry.names().map(str::to_string).collect();
        let request = names
            .iter()
            .rev()
            .fold(CompositionRequest::new("advisor").with_policy(policy), |r, n| {
                r.with_capability(CapabilityRequest::new(n.as_str()))
            });
        let build = GraphBuilder::new(&registry).build(&request);
        let mut conflicts = build.conflicts;
        conflicts.extend(ConflictDetector::new().detect(&build.graph));
        ResolutionEngine::new(policy).resolve(&build.graph, conflicts, build.notes)
    }

    fn pair() -> Vec<CapabilitySpec> {
        vec![
            cap("reflection", "\"user asks to step back\"", "pause"),
            cap("collaboration", "\"team asks to step back\"", "summarize"),
        ]
    }

    #[test]
    fn test_error_policy_fails_with_collision() {
        let failed = run(pair(), ConflictResolution::Error).unwrap_err();
        assert_eq!(failed.exit_code(), 1);
        assert!(failed.has_conflict(ConflictKind::BehaviorNameCollision));
        assert_eq!(failed.conflicts.len(), 1);
    }

    #[test]
    fn test_first_wins_keeps_canonical_first() {
        let resolved = run(pair(), ConflictResolution::FirstWins).unwrap();
        let step_back = resolved.behavior("step_back").unwrap();
        assert_eq!(step_back.sources, vec!["collaboration@1.0.0"]);
        assert_eq!(step_back.protocol, vec!["summarize"]);
        assert_eq!(resolved.resolutions().len(), 1);
        assert_eq!(resolved.resolutions()[0].dropped, vec!["reflection@1.0.0"]);
        assert_eq!(resolved.behaviors().len(), 3);
        assert_eq!(resolved.capability_names(), vec!["collaboration", "reflection"]);
    }

    #[test]
    fn test_last_wins_keeps_canonical_last() {
        let resolved = run(pair(), ConflictResolution::LastWins).unwrap();
        let step_back = resolved.behavior("step_back").unwrap();
        assert_eq!(step_back.sources, vec!["reflection@1.0.0"]);
        assert_eq!(resolved.resolutions()[0].outcome, ResolutionOutcome::Overridden);
    }

    #[test]
    fn test_merge_concatenates_in_canonical_order() {
        let resolved = run(pair(), ConflictResolution::Merge).unwrap();
        let step_back = resolved.behavior("step_back").unwrap();
        assert_eq!(step_back.protocol, vec!["summarize", "pause"]);
        assert_eq!(step_back.sources, vec!["collaboration@1.0.0", "reflection@1.0.0"]);
        let trigger = step_back.trigger.as_ref().unwrap();
        assert_eq!(trigger.kind, TriggerKind::Phrase);
        assert_eq!(trigger.value, "team asks to step back | user asks to step back");
        assert_eq!(resolved.resolutions()[0].outcome, ResolutionOutcome::Merged);
    }

    #[test]
    fn test_merge_with_incompatible_triggers_fails_that_collision() {
        let specs = vec![
            cap("reflection", "\"user asks to step back\"", "pause"),
            cap("collaboration", "{ kind: command, value: /step-back }", "summarize"),
        ];
        let failed = run(specs, ConflictResolution::Merge).unwrap_err();
        assert_eq!(failed.conflicts.len(), 1);
        assert!(failed.conflicts[0].message.contains("cannot be merged"));
    }

    #[test]
    fn test_structural_conflicts_ignore_policy() {
        let registry = RegistrySnapshot::from_specs(vec![CapabilitySpec::from_yaml(
            r#"
capability:
  name: collaboration
  version: "1.0.0"
  status: approved
  prerequisites: [domain-knowledge]
  behaviors:
    - { name: pair, protocol: ["pair"], output: "notes" }
  contracts:
    - { name: c, assertion: file_exists, path: PAIRING.md }
"#,
        )
        .unwrap()]);
        let request = CompositionRequest::new("advisor")
            .with_policy(ConflictResolution::Merge)
            .with_capability(CapabilityRequest::new("collaboration"));
        let build = GraphBuilder::new(&registry).build(&request);
        let failed = ResolutionEngine::new(ConflictResolution::Merge)
            .resolve(&build.graph, build.conflicts, build.notes)
            .unwrap_err();
        assert!(failed.has_conflict(ConflictKind::MissingPrerequisite));
        assert_eq!(
            failed.to_string(),
            "composition failed: 1 blocking conflict(s)"
        );
    }
}
