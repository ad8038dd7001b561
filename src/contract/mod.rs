//! Structural contract checks for materialized instances.
//!
//! - [`evaluator`]: `ContractEvaluator`, which runs every contract of a
//!   `ResolvedComposition` against an instance root and returns one
//!   `ContractResult` each
//! - [`predicate`]: the `ContractPredicate` trait and the `PredicateRegistry`
//!   that `custom` assertions are dispatched through

pub mod evaluator;
pub mod predicate;

pub use evaluator::{ContractEvaluator, ContractResult, DEFAULT_CONTRACT_TIMEOUT};
pub use predicate::{ContractPredicate, EvalError, PredicateContext, PredicateRegistry};
