//! # capcompose
//!
//! A capability composition engine. Agent instances are described as a base
//! template plus a set of versioned capabilities; the engine resolves the
//! request against a registry of capability specs, detects structural
//! conflicts, applies the request's conflict-resolution policy, and emits a
//! deterministic, digested manifest. Manifests carry structural contracts
//! that can later be verified against a materialized instance.
//!
//! ```no_run
//! # async fn demo() -> Result<(), capcompose::ComposeError> {
//! use capcompose::{CompositionRequest, Engine, EngineConfig};
//!
//! let engine = Engine::load(EngineConfig::default()).await?;
//! let request = CompositionRequest::from_yaml_file("request.yaml")?;
//! let manifest = engine.manifest(&request)?;
//! println!("{}", manifest.digest);
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod cli;
pub mod composition;
pub mod config;
pub mod contract;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod manifest;

pub use capabilities::{
    CapabilitySpec, LoadReport, RegistryLoader, RegistrySnapshot, SharedRegistry, Template,
    Version, VersionReq,
};
pub use composition::{
    compose, CapabilityRequest, Composer, CompositionFailed, CompositionRequest, Conflict,
    ConflictKind, ConflictResolution, ResolvedComposition,
};
pub use config::EngineConfig;
pub use contract::{ContractEvaluator, ContractResult, PredicateRegistry};
pub use diagnostics::{DiagnosticReport, ExitStatus};
pub use engine::Engine;
pub use error::ComposeError;
pub use manifest::{Manifest, ManifestEmitter, ManifestFormat};

/// Crate version, also recorded by the `capcompose` binary at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
