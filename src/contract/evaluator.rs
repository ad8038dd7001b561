//! Contract evaluation against a materialized instance.
//!
//! Every contract of every capability is checked, in declared order, and one
//! [`ContractResult`] is returned per contract. A failing contract never stops
//! the others. Checks only read the filesystem.
//!
//! Each check runs on the blocking pool under a per-contract timeout; a check
//! that overruns is reported as failed with the message `timeout`.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::predicate::{PredicateContext, PredicateRegistry};
use crate::capabilities::{Assertion, Contract};
use crate::composition::ResolvedComposition;

/// Default per-contract timeout.
pub const DEFAULT_CONTRACT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Outcome of one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractResult {
    /// Owning capability id (`name@version`).
    pub capability: String,
    pub contract: String,
    pub passed: bool,
    pub message: String,
}

impl fmt::Display for ContractResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "{} {} {}: {}", mark, self.capability, self.contract, self.message)
    }
}

/// Evaluates the contracts of a resolved composition.
#[derive(Debug, Clone)]
pub struct ContractEvaluator {
    predicates: Arc<PredicateRegistry>,
    timeout: Duration,
}

impl Default for ContractEvaluator {
    fn default() -> Self {
        Self::new(PredicateRegistry::with_builtins())
    }
}

impl ContractEvaluator {
    pub fn new(predicates: PredicateRegistry) -> Self {
        Self {
            predicates: Arc::new(predicates),
            timeout: DEFAULT_CONTRACT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate every contract of `composition` against the instance at `root`.
    pub async fn evaluate(
        &self,
        composition: &ResolvedComposition,
        root: &Path,
    ) -> Vec<ContractResult> {
        let checks = composition.contracts().map(|(capability, contract)| {
            self.evaluate_one(capability.id(), contract.clone(), root.to_path_buf())
        });
        let results = join_all(checks).await;

        let failed = results.iter().filter(|r| !r.passed).count();
        log::info!(
            "Contracts: {} evaluated, {} failed under {}",
            results.len(),
            failed,
            root.display()
        );
        results
    }

    async fn evaluate_one(
        &self,
        capability: String,
        contract: Contract,
        root: PathBuf,
    ) -> ContractResult {
        let predicates = self.predicates.clone();
        let name = contract.name.clone();
        let owner = capability.clone();
        let task = tokio::task::spawn_blocking(move || {
            check(&contract, &owner, &root, &predicates)
        });

        let (passed, message) = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(message))) => (true, message),
            Ok(Ok(Err(message))) => (false, message),
            Ok(Err(e)) => (false, format!("evaluation aborted: {}", e)),
            Err(_) => {
                log::warn!(
                    "Contracts: {} {} exceeded {:?}",
                    capability,
                    name,
                    self.timeout
                );
                (false, "timeout".to_string())
            }
        };

        if !passed {
            log::debug!("Contracts: {} {} failed: {}", capability, name, message);
        }
        ContractResult {
            capability,
            contract: name,
            passed,
            message,
        }
    }
}

/// Run one assertion. `Ok` carries the pass message, `Err` the failure.
fn check(
    contract: &Contract,
    owner: &str,
    root: &Path,
    predicates: &PredicateRegistry,
) -> Result<String, String> {
    match &contract.assertion {
        Assertion::DirectoryExists { path } => {
            let target = resolve(root, path)?;
            if target.is_dir() {
                Ok(format!("directory exists: {}", path))
            } else if target.exists() {
                Err(format!("not a directory: {}", path))
            } else {
                Err(format!("directory not found: {}", path))
            }
        }
        Assertion::FileExists { path } => {
            let target = resolve(root, path)?;
            if target.is_file() {
                Ok(format!("file exists: {}", path))
            } else if target.exists() {
                Err(format!("not a file: {}", path))
            } else {
                Err(format!("file not found: {}", path))
            }
        }
        Assertion::FileContains { path, pattern } => {
            let target = resolve(root, path)?;
            if !target.is_file() {
                return Err(format!("file not found: {}", path));
            }
            let regex =
                Regex::new(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
            let content = std::fs::read_to_string(&target)
                .map_err(|e| format!("cannot read {}: {}", path, e))?;
            if regex.is_match(&content) {
                Ok(format!("pattern found in {}", path))
            } else {
                Err(format!("pattern not found in {}: {}", path, pattern))
            }
        }
        Assertion::PathAbsent { path } => {
            let target = resolve(root, path)?;
            if target.exists() {
                Err(format!("path exists: {}", path))
            } else {
                Ok(format!("path absent: {}", path))
            }
        }
        Assertion::Custom {
            evaluator,
            path,
            params,
        } => {
            let predicate = predicates
                .get(evaluator)
                .ok_or_else(|| format!("unknown evaluator: {}", evaluator))?;
            let target = match path {
                Some(p) => resolve(root, p)?,
                None => root.to_path_buf(),
            };
            let ctx = PredicateContext {
                capability: owner.to_string(),
                contract: contract.name.clone(),
                root: root.to_path_buf(),
                params: params.clone(),
            };
            match predicate.evaluate(&target, &ctx) {
                Ok(true) => Ok(format!("{} passed", evaluator)),
                Ok(false) => Err(format!("{} returned false", evaluator)),
                Err(e) => Err(format!("{}: {}", evaluator, e)),
            }
        }
    }
}

/// Join a contract path onto the instance root, refusing anything that could
/// leave it. Manifests read from disk skip capability validation, so this is
/// checked again here.
fn resolve(root: &Path, path: &str) -> Result<PathBuf, String> {
    let relative = Path::new(path);
    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(format!("path escapes instance root: {}", path));
    }
    Ok(root.join(relative))
}
