//! Named predicates for `custom` contract assertions.
//!
//! A `custom` assertion names an evaluator id; the id is looked up in a
//! [`PredicateRegistry`] at evaluation time. Arbitrary logic lives here, in
//! Rust, rather than in capability YAML.
//!
//! # Adding a predicate
//!
//! ```rust,ignore
//! let mut predicates = PredicateRegistry::with_builtins();
//! predicates.register(
//!     "has-readme",
//!     |path: &Path, _ctx: &PredicateContext| -> Result<bool, EvalError> {
//!         Ok(path.join("README.md").is_file())
//!     },
//! );
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::capabilities::ConfigValue;

/// Errors a predicate may return. Any error fails the contract.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

/// What a predicate knows about the contract it is checking.
#[derive(Debug, Clone)]
pub struct PredicateContext {
    pub capability: String,
    pub contract: String,
    /// Instance root the contract path is relative to.
    pub root: PathBuf,
    pub params: BTreeMap<String, ConfigValue>,
}

impl PredicateContext {
    /// An integer parameter, if present.
    pub fn integer(&self, key: &str) -> Result<Option<i64>, EvalError> {
        match self.params.get(key) {
            None => Ok(None),
            Some(ConfigValue::Integer(n)) => Ok(Some(*n)),
            Some(other) => Err(EvalError::InvalidParams(format!(
                "'{}' must be an integer, got {}",
                key,
                other.kind()
            ))),
        }
    }
}

/// A named check over a path inside a materialized instance.
///
/// Predicates must not modify anything under the instance root.
pub trait ContractPredicate: Send + Sync {
    fn evaluate(&self, path: &Path, ctx: &PredicateContext) -> Result<bool, EvalError>;
}

impl<F> ContractPredicate for F
where
    F: Fn(&Path, &PredicateContext) -> Result<bool, EvalError> + Send + Sync,
{
    fn evaluate(&self, path: &Path, ctx: &PredicateContext) -> Result<bool, EvalError> {
        self(path, ctx)
    }
}

/// Evaluator ids to predicates.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: BTreeMap<String, Arc<dyn ContractPredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in predicates:
    ///
    /// - `non-empty-directory`: the path is a directory with at least
    ///   `min_entries` entries (default 1)
    /// - `yaml-parses`: the path is a file holding valid YAML
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("non-empty-directory", non_empty_directory);
        registry.register("yaml-parses", yaml_parses);
        registry
    }

    /// Register `predicate` under `id`, replacing any previous one.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        predicate: impl ContractPredicate + 'static,
    ) -> &mut Self {
        self.predicates.insert(id.into(), Arc::new(predicate));
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ContractPredicate>> {
        self.predicates.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.predicates.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.predicates.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("predicates", &self.ids())
            .finish()
    }
}

fn non_empty_directory(path: &Path, ctx: &PredicateContext) -> Result<bool, EvalError> {
    let min = ctx.integer("min_entries")?.unwrap_or(1);
    if min < 0 {
        return Err(EvalError::InvalidParams(
            "'min_entries' must not be negative".to_string(),
        ));
    }
    if !path.is_dir() {
        return Ok(false);
    }
    let count = std::fs::read_dir(path)?.count();
    Ok(count as i64 >= min)
}

fn yaml_parses(path: &Path, _ctx: &PredicateContext) -> Result<bool, EvalError> {
    if !path.is_file() {
        return Err(EvalError::Failed(format!("not a file: {}", path.display())));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str::<serde_yaml::Value>(&content).is_ok())
}
