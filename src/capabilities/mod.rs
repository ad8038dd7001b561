//! # Capability Registry
//!
//! Capability specs are declarative, versioned units of agent behavior. Each
//! one names its prerequisites, the behaviors it contributes, and the
//! structural contracts a materialized instance must satisfy.
//!
//! ## Loading Flow
//!
//! 1. `RegistryLoader::load_dir("capabilities/")` reads every YAML file in parallel
//! 2. Each document is validated; failures become `SchemaError`s in the `LoadReport`
//! 3. Valid specs are indexed `name → versions` in an immutable `RegistrySnapshot`
//! 4. `SharedRegistry` hands out `Arc` snapshots and swaps them on reload
//!
//! Composition never mutates a snapshot, so any number of requests can be
//! composed against one concurrently.

pub mod capability;
pub mod config;
pub mod registry;
pub mod template;
pub mod version;

pub use capability::{
    is_valid_name, Assertion, Behavior, CapabilityRef, CapabilitySpec, CapabilityStatus,
    Contract, SpecError, Trigger, TriggerKind,
};
pub use config::{check_config, ConfigField, ConfigKind, ConfigScalar, ConfigValue};
pub use registry::{
    LoadReport, RegistryBuilder, RegistryError, RegistryLoader, RegistrySnapshot, SchemaError,
    SharedRegistry,
};
pub use template::Template;
pub use version::{Version, VersionError, VersionReq};
