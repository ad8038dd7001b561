//! # Composition
//!
//! One pass per request:
//!
//! 1. [`GraphBuilder`] resolves the base template and requested capabilities
//!    into a [`CompositionGraph`] and reports structural conflicts
//! 2. [`ConflictDetector`] scans the resolved set for collisions and
//!    incompatibilities
//! 3. [`ResolutionEngine`] applies the request's [`ConflictResolution`] policy
//!
//! The result is a [`ResolvedComposition`] or a [`CompositionFailed`] listing
//! every cause found in the pass. A composition only reads its registry
//! snapshot, so requests can run concurrently against one snapshot.

pub mod conflict;
pub mod graph;
pub mod request;
pub mod resolve;

pub use conflict::{Conflict, ConflictDetector, ConflictKind, Note, NoteKind, Severity};
pub use graph::{
    CompositionGraph, GraphBuild, GraphBuilder, GraphNode, RequestOrigin, UnresolvedReference,
};
pub use request::{CapabilityRequest, CompositionRequest, ConflictResolution, RequestError};
pub use resolve::{
    CompositionFailed, Requirement, ResolutionEngine, ResolutionOutcome, ResolutionRecord,
    ResolvedBehavior, ResolvedCapability, ResolvedComposition,
};

use crate::capabilities::RegistrySnapshot;

/// Runs the full pipeline against one registry snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Composer<'r> {
    registry: &'r RegistrySnapshot,
    detector: ConflictDetector,
}

impl<'r> Composer<'r> {
    pub fn new(registry: &'r RegistrySnapshot) -> Self {
        Self {
            registry,
            detector: ConflictDetector::new(),
        }
    }

    pub fn with_detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn compose(
        &self,
        request: &CompositionRequest,
    ) -> Result<ResolvedComposition, CompositionFailed> {
        log::debug!(
            "Composition: template '{}' with {} requested capabilities, policy {}",
            request.base_template,
            request.capabilities.len(),
            request.conflict_resolution
        );

        let build = GraphBuilder::new(self.registry).build(request);
        let fatal = build.is_fatal();
        let GraphBuild {
            graph,
            mut conflicts,
            notes,
            unresolved,
            schema_errors,
        } = build;

        conflicts.extend(self.detector.detect(&graph));
        for conflict in &conflicts {
            log::debug!("Composition: {}", conflict);
        }

        let outcome =
            ResolutionEngine::new(request.conflict_resolution).resolve(&graph, conflicts, notes);
        if !fatal {
            return outcome;
        }

        // Unresolved names or bad config: report alongside whatever the
        // resolver still found blocking.
        let mut failed = match outcome {
            Ok(partial) => CompositionFailed {
                advisories: partial.advisories().to_vec(),
                notes: partial.notes().to_vec(),
                ..Default::default()
            },
            Err(failed) => failed,
        };
        failed.unresolved = unresolved;
        failed.schema_errors = schema_errors;
        Err(failed)
    }
}

/// Compose `request` against `registry` with default detection settings.
pub fn compose(
    registry: &RegistrySnapshot,
    request: &CompositionRequest,
) -> Result<ResolvedComposition, CompositionFailed> {
    Composer::new(registry).compose(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, prerequisites: &[&str], behavior: &str) -> String {
        format!(
            r#"
capability:
  name: {name}
  version: "1.0.0"
  status: approved
  prerequisites: [{prereqs}]
  behaviors:
    - {{ name: {behavior}, protocol: ["{name} step"], output: "{name} output" }}
  contracts:
    - {{ name: {name}-dir, assertion: directory_exists, path: {name}/ }}
"#,
            prereqs = prerequisites.join(", ")
        )
    }

    fn registry(docs: &[(&str, String)]) -> RegistrySnapshot {
        let mut builder = RegistrySnapshot::builder();
        for (source, yaml) in docs {
            builder.add_document(source, yaml);
        }
        builder.build()
    }

    fn advisor_registry() -> RegistrySnapshot {
        registry(&[
            ("memory.yaml", doc("memory-management", &[], "remember")),
            ("collaboration.yaml", doc("collaboration", &["domain-knowledge"], "step_back")),
            ("domain.yaml", doc("domain-knowledge", &[], "cite")),
        ])
    }

    fn request(names: &[&str]) -> CompositionRequest {
        names.iter().fold(CompositionRequest::new("advisor"), |r, n| {
            r.with_capability(CapabilityRequest::new(*n))
        })
    }

    #[test]
    fn test_missing_prerequisite_names_both_ends() {
        let registry = advisor_registry();
        let failed = compose(&registry, &request(&["memory-management", "collaboration"]))
            .unwrap_err();
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(failed.conflicts.len(), 1);
        let conflict = &failed.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::MissingPrerequisite);
        assert!(conflict.participants.iter().any(|p| p.starts_with("collaboration")));
        assert!(conflict.participants.iter().any(|p| p == "domain-knowledge"));
    }

    #[test]
    fn test_success_in_canonical_order() {
        let registry = advisor_registry();
        let composed = compose(
            &registry,
            &request(&["memory-management", "collaboration", "domain-knowledge"]),
        )
        .unwrap();
        assert_eq!(
            composed.capability_names(),
            vec!["collaboration", "domain-knowledge", "memory-management"]
        );
        // domain-knowledge is materialized before the capability that needs it.
        let order = composed.materialization_order();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("domain-knowledge") < pos("collaboration"));
    }

    #[test]
    fn test_request_order_does_not_matter() {
        let registry = advisor_registry();
        let a = compose(
            &registry,
            &request(&["memory-management", "collaboration", "domain-knowledge"]),
        )
        .unwrap();
        let b = compose(
            &registry,
            &request(&["domain-knowledge", "memory-management", "collaboration"]),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_repeat_composition_is_identical() {
        let registry = advisor_registry();
        let req = request(&["collaboration", "domain-knowledge"]);
        let first = compose(&registry, &req).unwrap();
        for _ in 0..5 {
            assert_eq!(compose(&registry, &req).unwrap(), first);
        }
    }

    #[test]
    fn test_duplicate_request_collapses_with_note() {
        let registry = advisor_registry();
        let once = compose(&registry, &request(&["memory-management"])).unwrap();
        let twice = compose(&registry, &request(&["memory-management", "memory-management"]))
            .unwrap();
        assert_eq!(twice.capabilities(), once.capabilities());
        assert_eq!(twice.behaviors(), once.behaviors());
        assert!(twice
            .notes()
            .iter()
            .any(|n| n.kind == NoteKind::DuplicateCollapsed && n.subject == "memory-management"));
    }

    #[test]
    fn test_step_back_collision_under_each_policy() {
        let registry = registry(&[
            ("x.yaml", doc("x", &[], "step_back")),
            ("y.yaml", doc("y", &[], "step_back")),
        ]);

        let failed = compose(&registry, &request(&["y", "x"])).unwrap_err();
        assert!(failed.has_conflict(ConflictKind::BehaviorNameCollision));

        let composed = compose(
            &registry,
            &request(&["y", "x"]).with_policy(ConflictResolution::FirstWins),
        )
        .unwrap();
        let kept: Vec<_> = composed
            .behaviors()
            .iter()
            .filter(|b| b.name == "step_back")
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].sources, vec!["x@1.0.0".to_string()]);
        assert_eq!(composed.resolutions()[0].dropped, vec!["y@1.0.0".to_string()]);
    }

    #[test]
    fn test_cycle_is_fatal_under_any_policy() {
        let registry = registry(&[
            ("a.yaml", doc("a", &["b"], "alpha")),
            ("b.yaml", doc("b", &["a"], "beta")),
        ]);
        for policy in [ConflictResolution::Error, ConflictResolution::Merge] {
            let failed = compose(&registry, &request(&["a", "b"]).with_policy(policy))
                .unwrap_err();
            let cycle = failed
                .conflicts
                .iter()
                .find(|c| c.kind == ConflictKind::Cycle)
                .unwrap();
            assert_eq!(cycle.participants.first(), cycle.participants.last());
        }
        // Requesting one side alone still reports the cycle.
        let failed = compose(&registry, &request(&["a"])).unwrap_err();
        assert!(failed.has_conflict(ConflictKind::Cycle));
    }

    #[test]
    fn test_every_cause_reported_in_one_pass() {
        let registry = registry(&[
            ("x.yaml", doc("x", &[], "step_back")),
            ("y.yaml", doc("y", &[], "step_back")),
            ("c.yaml", doc("c", &["d"], "gamma")),
        ]);
        let failed = compose(&registry, &request(&["x", "y", "c", "ghost"])).unwrap_err();
        assert_eq!(failed.unresolved.len(), 1);
        assert!(failed.has_conflict(ConflictKind::BehaviorNameCollision));
        assert!(failed.has_conflict(ConflictKind::MissingPrerequisite));
        assert!(failed.causes().len() >= 3);
    }
}
