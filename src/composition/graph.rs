//! Composition graph: the prerequisite DAG for one request.
//!
//! The builder resolves every requested `(name, constraint)` to the highest
//! matching version in the registry snapshot, collapses duplicate requests,
//! and adds a `requires(A → B)` edge for each declared prerequisite.
//!
//! Prerequisites are never added on the requester's behalf: a prerequisite
//! missing from the request is a `MissingPrerequisite` conflict naming both
//! ends. Cycles are searched for across the registry's prerequisite closure,
//! so `A requires B, B requires A` is reported even when only `A` is
//! requested.
//!
//! Nodes are keyed by name in a `BTreeMap`, so the node set and every
//! iteration order are independent of the order of the request.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::conflict::{Conflict, Note};
use super::request::CompositionRequest;
use crate::capabilities::{
    check_config, CapabilitySpec, CapabilityStatus, ConfigValue, RegistrySnapshot, SchemaError,
    Template, Version, VersionReq,
};

/// Where a capability entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    /// A default of the base template.
    Template,
    /// Listed in the request itself.
    Request,
}

impl fmt::Display for RequestOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOrigin::Template => f.write_str("template"),
            RequestOrigin::Request => f.write_str("request"),
        }
    }
}

/// A requested capability with no version in the registry that satisfies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub name: String,
    pub constraints: Vec<VersionReq>,
    /// Versions the registry does hold for `name`, highest first.
    pub available: Vec<Version>,
    pub origin: RequestOrigin,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.available.is_empty() {
            return write!(f, "unknown capability '{}'", self.name);
        }
        let constraints: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        let available: Vec<String> = self.available.iter().map(|v| v.to_string()).collect();
        write!(
            f,
            "no version of '{}' satisfies {} (available: {})",
            self.name,
            constraints.join(" and "),
            available.join(", ")
        )
    }
}

/// One resolved capability in the graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub spec: Arc<CapabilitySpec>,
    /// Effective config: request values plus declared defaults.
    pub config: BTreeMap<String, ConfigValue>,
    pub origins: BTreeSet<RequestOrigin>,
}

impl GraphNode {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn id(&self) -> String {
        self.spec.id()
    }
}

/// The resolved capability set and its `requires` edges.
#[derive(Debug, Clone)]
pub struct CompositionGraph {
    template: Template,
    nodes: BTreeMap<String, GraphNode>,
    /// `(requirer, prerequisite)` pairs; both ends are nodes.
    edges: BTreeSet<(String, String)>,
}

impl CompositionGraph {
    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Nodes in canonical order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    pub fn prerequisites_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |(from, _)| from == name)
            .map(|(_, to)| to.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Prerequisites before the capabilities that need them, ties broken
    /// alphabetically. `None` when the edges contain a cycle.
    pub fn dependency_order(&self) -> Option<Vec<String>> {
        let mut pending: BTreeMap<&str, usize> = self.nodes.keys().map(|n| (n.as_str(), 0)).collect();
        for (from, _) in &self.edges {
            if let Some(count) = pending.get_mut(from.as_str()) {
                *count += 1;
            }
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(next) = ready.pop_first() {
            order.push(next.to_string());
            for (from, to) in &self.edges {
                if to == next {
                    if let Some(count) = pending.get_mut(from.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(from.as_str());
                        }
                    }
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }
}

/// Everything the builder produced for one request.
#[derive(Debug, Clone)]
pub struct GraphBuild {
    pub graph: CompositionGraph,
    pub conflicts: Vec<Conflict>,
    pub notes: Vec<Note>,
    pub unresolved: Vec<UnresolvedReference>,
    pub schema_errors: Vec<SchemaError>,
}

impl GraphBuild {
    /// Unresolved references and invalid request config stop composition
    /// before conflict detection.
    pub fn is_fatal(&self) -> bool {
        !self.unresolved.is_empty() || !self.schema_errors.is_empty()
    }
}

struct Entry {
    version: VersionReq,
    config: BTreeMap<String, ConfigValue>,
    origin: RequestOrigin,
}

/// Resolves requests against one registry snapshot.
pub struct GraphBuilder<'r> {
    registry: &'r RegistrySnapshot,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r RegistrySnapshot) -> Self {
        Self { registry }
    }

    pub fn build(&self, request: &CompositionRequest) -> GraphBuild {
        let mut conflicts = Vec::new();
        let mut notes = Vec::new();
        let mut unresolved = Vec::new();
        let mut schema_errors = Vec::new();

        let template = match self.registry.template(&request.base_template) {
            Some(t) => t.as_ref().clone(),
            None => {
                notes.push(Note::unknown_template(&request.base_template));
                Template::bare(&request.base_template)
            }
        };

        let mut groups: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
        for r in &template.capabilities {
            groups.entry(r.name.clone()).or_default().push(Entry {
                version: r.version.clone(),
                config: BTreeMap::new(),
                origin: RequestOrigin::Template,
            });
        }
        for r in &request.capabilities {
            groups.entry(r.name.clone()).or_default().push(Entry {
                version: r.version.clone(),
                config: r.config.clone(),
                origin: RequestOrigin::Request,
            });
        }

        let mut nodes = BTreeMap::new();
        for (name, entries) in &groups {
            let Some(spec) = self.resolve_group(name, entries, &mut conflicts, &mut unresolved)
            else {
                continue;
            };

            if entries.len() > 1 {
                notes.push(Note::duplicate_collapsed(name, entries.len(), &spec.id()));
            }
            if spec.status == CapabilityStatus::Deprecated {
                log::warn!("Composition: {} is deprecated", spec.id());
                notes.push(Note::deprecated(&spec.id()));
            }

            let merged = merge_configs(&spec, entries, &mut conflicts);
            let config = match check_config(&spec.config, &merged) {
                Ok(effective) => effective,
                Err(problems) => {
                    schema_errors.push(SchemaError::new(
                        format!("request: {} config", name),
                        problems,
                    ));
                    merged
                }
            };

            nodes.insert(
                name.clone(),
                GraphNode {
                    spec,
                    config,
                    origins: entries.iter().map(|e| e.origin).collect(),
                },
            );
        }

        let mut edges = BTreeSet::new();
        for node in nodes.values() {
            for prereq in &node.spec.prerequisites {
                match nodes.get(&prereq.name) {
                    Some(target) => {
                        edges.insert((node.name().to_string(), prereq.name.clone()));
                        if !prereq.version.matches(&target.spec.version) {
                            conflicts.push(Conflict::prerequisite_version(
                                &node.id(),
                                prereq,
                                &target.id(),
                            ));
                        }
                    }
                    None => conflicts.push(Conflict::missing_prerequisite(&node.id(), prereq)),
                }
            }
        }

        for cycle in find_cycles(&self.prerequisite_closure(&nodes)) {
            conflicts.push(Conflict::cycle(cycle));
        }

        log::debug!(
            "Composition: graph for template '{}' has {} nodes, {} edges, {} conflicts",
            template.name,
            nodes.len(),
            edges.len(),
            conflicts.len()
        );

        GraphBuild {
            graph: CompositionGraph {
                template,
                nodes,
                edges,
            },
            conflicts,
            notes,
            unresolved,
            schema_errors,
        }
    }

    /// Pick one spec for every entry sharing a name: the highest version
    /// satisfying all their constraints.
    fn resolve_group(
        &self,
        name: &str,
        entries: &[Entry],
        conflicts: &mut Vec<Conflict>,
        unresolved: &mut Vec<UnresolvedReference>,
    ) -> Option<Arc<CapabilitySpec>> {
        let mut constraints: Vec<VersionReq> = Vec::new();
        for e in entries {
            if !constraints.contains(&e.version) {
                constraints.push(e.version.clone());
            }
        }
        let origin = entries
            .iter()
            .map(|e| e.origin)
            .max()
            .unwrap_or(RequestOrigin::Request);

        if let Some(spec) = self.registry.resolve_all(name, constraints.iter()) {
            return Some(spec.clone());
        }

        let individually: Vec<(&VersionReq, Option<&Arc<CapabilitySpec>>)> = constraints
            .iter()
            .map(|c| (c, self.registry.resolve(name, c)))
            .collect();
        let failing: Vec<VersionReq> = individually
            .iter()
            .filter(|(_, hit)| hit.is_none())
            .map(|(c, _)| (*c).clone())
            .collect();

        if !failing.is_empty() {
            unresolved.push(UnresolvedReference {
                name: name.to_string(),
                constraints: failing,
                available: self.registry.versions(name).into_iter().cloned().collect(),
                origin,
            });
            return None;
        }

        // Every constraint resolves on its own but no version satisfies all.
        let mut candidates: Vec<Arc<CapabilitySpec>> =
            individually.into_iter().filter_map(|(_, hit)| hit.cloned()).collect();
        candidates.sort_by(|a, b| b.version.cmp(&a.version));
        candidates.dedup_by(|a, b| a.version == b.version);
        conflicts.push(Conflict::duplicate_versions(
            name,
            &constraints,
            candidates.iter().map(|c| c.id()).collect(),
        ));
        candidates.into_iter().next()
    }

    /// Prerequisite adjacency reachable from the requested nodes, following
    /// the registry for prerequisites the request does not contain.
    fn prerequisite_closure(
        &self,
        nodes: &BTreeMap<String, GraphNode>,
    ) -> BTreeMap<String, Vec<String>> {
        let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<Arc<CapabilitySpec>> =
            nodes.values().map(|n| n.spec.clone()).collect();

        while let Some(spec) = queue.pop_front() {
            if !visited.insert(spec.name.clone()) {
                continue;
            }
            let targets = adjacency.entry(spec.name.clone()).or_default();
            for prereq in &spec.prerequisites {
                let target = match nodes.get(&prereq.name) {
                    Some(node) => Some(node.spec.clone()),
                    None => self.registry.resolve(&prereq.name, &prereq.version).cloned(),
                };
                if let Some(target) = target {
                    targets.push(target.name.clone());
                    queue.push_back(target);
                }
            }
            targets.sort();
            targets.dedup();
        }
        adjacency
    }
}

/// Merge config maps of duplicate entries. Two entries giving different
/// values for one key is a conflict; the first value is kept so detection
/// can continue.
fn merge_configs(
    spec: &CapabilitySpec,
    entries: &[Entry],
    conflicts: &mut Vec<Conflict>,
) -> BTreeMap<String, ConfigValue> {
    let mut merged: BTreeMap<String, ConfigValue> = BTreeMap::new();
    let mut clashing: BTreeSet<String> = BTreeSet::new();
    for entry in entries {
        for (key, value) in &entry.config {
            match merged.get(key) {
                Some(existing) if existing != value => {
                    clashing.insert(key.clone());
                }
                Some(_) => {}
                None => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
    }
    for key in clashing {
        conflicts.push(Conflict::duplicate_config(&spec.id(), &key));
    }
    merged
}

/// Every elementary cycle reachable by DFS, each rotated to start at its
/// alphabetically smallest node and closed (`[a, b, a]`). Sorted.
pub(crate) fn find_cycles(adjacency: &BTreeMap<String, Vec<String>>) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        Gray,
        Black,
    }

    fn normalize(cycle: &[String]) -> Vec<String> {
        let n = cycle.len();
        let start = (0..n).min_by(|&a, &b| cycle[a].cmp(&cycle[b])).unwrap_or(0);
        let mut out: Vec<String> = (0..n).map(|i| cycle[(start + i) % n].clone()).collect();
        if let Some(first) = out.first().cloned() {
            out.push(first);
        }
        out
    }

    fn visit(
        node: &str,
        adjacency: &BTreeMap<String, Vec<String>>,
        color: &mut BTreeMap<String, Color>,
        stack: &mut Vec<String>,
        found: &mut BTreeSet<Vec<String>>,
    ) {
        color.insert(node.to_string(), Color::Gray);
        stack.push(node.to_string());

        for target in adjacency.get(node).into_iter().flatten() {
            match color.get(target) {
                Some(Color::Gray) => {
                    if let Some(pos) = stack.iter().position(|n| n == target) {
                        found.insert(normalize(&stack[pos..]));
                    }
                }
                Some(Color::Black) => {}
                None => visit(target, adjacency, color, stack, found),
            }
        }

        stack.pop();
        color.insert(node.to_string(), Color::Black);
    }

    let mut color = BTreeMap::new();
    let mut stack = Vec::new();
    let mut found = BTreeSet::new();
    for node in adjacency.keys() {
        if !color.contains_key(node) {
            visit(node, adjacency, &mut color, &mut stack, &mut found);
        }
    }
    found.into_iter().collect()
}
