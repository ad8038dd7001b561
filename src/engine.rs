//! `Engine`: load once, compose many.
//!
//! Wraps a [`SharedRegistry`] with the configured loader, predicate set and
//! manifest format. Every composition pins the snapshot that was current when
//! it started, so a concurrent [`Engine::reload`] never affects one in flight.

use std::path::Path;
use std::sync::Arc;

use crate::capabilities::{LoadReport, RegistrySnapshot, SharedRegistry};
use crate::composition::{
    CompositionFailed, CompositionRequest, Composer, ConflictDetector, ResolvedComposition,
};
use crate::config::EngineConfig;
use crate::contract::{ContractEvaluator, ContractResult, PredicateRegistry};
use crate::error::ComposeError;
use crate::manifest::Manifest;

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    registry: SharedRegistry,
    evaluator: ContractEvaluator,
    detector: ConflictDetector,
}

impl Engine {
    /// Load the registry named by `config`.
    pub async fn load(config: EngineConfig) -> Result<Self, ComposeError> {
        config.validate()?;
        let snapshot = config.loader().load_dir(&config.registry_dir).await?;
        Ok(Self::from_snapshot(config, snapshot))
    }

    /// An engine over an already built snapshot.
    pub fn from_snapshot(config: EngineConfig, snapshot: RegistrySnapshot) -> Self {
        let evaluator = config.evaluator(PredicateRegistry::with_builtins());
        Self {
            config,
            registry: SharedRegistry::new(snapshot),
            evaluator,
            detector: ConflictDetector::new(),
        }
    }

    /// Replace the predicate set used for `custom` contracts.
    pub fn with_predicates(mut self, predicates: PredicateRegistry) -> Self {
        self.evaluator = self.config.evaluator(predicates);
        self
    }

    pub fn with_detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    pub fn load_report(&self) -> LoadReport {
        self.registry.snapshot().report().clone()
    }

    /// Reload from the configured directory. On failure the current snapshot
    /// stays in place.
    pub async fn reload(&self) -> Result<LoadReport, ComposeError> {
        let snapshot = self
            .registry
            .reload(&self.config.loader(), &self.config.registry_dir)
            .await?;
        Ok(snapshot.report().clone())
    }

    pub fn compose(
        &self,
        request: &CompositionRequest,
    ) -> Result<ResolvedComposition, CompositionFailed> {
        let snapshot = self.registry.snapshot();
        Composer::new(&snapshot)
            .with_detector(self.detector)
            .compose(request)
    }

    /// Read a request document and compose it.
    pub fn compose_file(&self, path: &Path) -> Result<ResolvedComposition, ComposeError> {
        let request = CompositionRequest::from_yaml_file(path)?;
        Ok(self.compose(&request)?)
    }

    /// Compose and wrap the result in a digested manifest.
    pub fn manifest(&self, request: &CompositionRequest) -> Result<Manifest, ComposeError> {
        let composition = self.compose(request)?;
        Ok(Manifest::new(composition)?)
    }

    pub fn render(&self, composition: &ResolvedComposition) -> Result<String, ComposeError> {
        Ok(self.config.emitter().emit(composition)?)
    }

    /// Evaluate the manifest's contracts against the instance at `root`.
    pub async fn verify(&self, manifest: &Manifest, root: &Path) -> Vec<ContractResult> {
        self.evaluator.evaluate(&manifest.composition, root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::{compose, CapabilityRequest};

    const MEMORY: &str = r#"
capability:
  name: memory-management
  version: "1.0.0"
  status: approved
  behaviors:
    - { name: remember, protocol: ["write it down"], output: "a note" }
  contracts:
    - { name: has_memory, assertion: directory_exists, path: memory/ }
"#;

    const MEMORY_V2: &str = r#"
capability:
  name: memory-management
  version: "2.0.0"
  status: approved
  behaviors:
    - { name: remember, protocol: ["write it down", "index it"], output: "a note" }
  contracts:
    - { name: has_memory, assertion: directory_exists, path: memory/ }
"#;

    fn request() -> CompositionRequest {
        CompositionRequest::new("advisor").with_capability(CapabilityRequest::new("memory-management"))
    }

    #[tokio::test]
    async fn test_load_compose_verify() {
        let dir = tempfile::tempdir().unwrap();
        let registry_dir = dir.path().join("capabilities");
        std::fs::create_dir(&registry_dir).unwrap();
        std::fs::write(registry_dir.join("memory.yaml"), MEMORY).unwrap();

        let config = EngineConfig {
            registry_dir: registry_dir.clone(),
            ..EngineConfig::default()
        };
        let engine = Engine::load(config).await.unwrap();
        assert!(engine.load_report().is_clean());

        let manifest = engine.manifest(&request()).unwrap();
        let instance = dir.path().join("instance");
        std::fs::create_dir_all(instance.join("memory")).unwrap();
        let results = engine.verify(&manifest, &instance).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.yaml"), MEMORY).unwrap();
        let config = EngineConfig {
            registry_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let engine = Engine::load(config).await.unwrap();
        let before = engine.registry();

        std::fs::write(dir.path().join("memory-v2.yaml"), MEMORY_V2).unwrap();
        let report = engine.reload().await.unwrap();
        assert_eq!(report.capabilities_loaded, 2);

        // The old snapshot is unchanged for anyone still holding it.
        assert_eq!(before.len(), 1);
        let composed = engine.compose(&request()).unwrap();
        assert_eq!(
            composed.capability("memory-management").unwrap().version.to_string(),
            "2.0.0"
        );
    }

    #[test]
    fn test_concurrent_compose_during_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("memory.yaml");
        std::fs::write(&file, MEMORY).unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let config = EngineConfig {
            registry_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let engine = &runtime.block_on(Engine::load(config)).unwrap();
        let req = &request();

        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(move || {
                        let mut seen = Vec::new();
                        for _ in 0..50 {
                            let pinned = engine.registry();
                            let first = compose(&pinned, req).unwrap();
                            let again = compose(&pinned, req).unwrap();
                            assert_eq!(first, again);

                            let memory = first.capability("memory-management").unwrap();
                            let steps = first.behavior("remember").unwrap().protocol.len();
                            match memory.version.major {
                                1 => assert_eq!(steps, 1),
                                2 => assert_eq!(steps, 2),
                                other => panic!("unexpected major version {}", other),
                            }
                            seen.push(memory.version.major);
                        }
                        seen
                    })
                })
                .collect();

            for round in 0..20 {
                let yaml = if round % 2 == 0 { MEMORY_V2 } else { MEMORY };
                std::fs::write(&file, yaml).unwrap();
                let report = runtime.block_on(engine.reload()).unwrap();
                assert!(report.is_clean(), "{:?}", report.errors);
                assert_eq!(report.capabilities_loaded, 1);
            }

            for worker in workers {
                assert_eq!(worker.join().unwrap().len(), 50);
            }
        });
    }

    #[tokio::test]
    async fn test_missing_registry_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            registry_dir: dir.path().join("nope"),
            ..EngineConfig::default()
        };
        let err = Engine::load(config).await.unwrap_err();
        assert_eq!(err.exit_status().code(), 2);
    }

    #[test]
    fn test_compose_file_reports_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.yaml");
        std::fs::write(&path, "composition:\n  capabilities: [memory-management]\n").unwrap();
        let engine = Engine::from_snapshot(
            EngineConfig::default(),
            RegistrySnapshot::from_specs(Vec::new()),
        );
        let err = engine.compose_file(&path).unwrap_err();
        assert!(matches!(err, ComposeError::Request(_)));
        assert_eq!(err.exit_status().code(), 2);
    }
}
