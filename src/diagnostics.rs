//! Diagnostic reports: the structured record of one engine run.
//!
//! A report carries every schema error, unresolved reference, conflict,
//! resolution decision, note and contract result from the run, plus the exit
//! status a driver should return:
//!
//! | Status | Code | When |
//! |---|---|---|
//! | `success` | 0 | composed (and every contract passed) |
//! | `composition_failed` | 1 | blocking conflict, unresolved name, or failed contract |
//! | `invalid_input` | 2 | request or registry document failed schema checks |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capabilities::{LoadReport, SchemaError};
use crate::composition::{
    CompositionFailed, Conflict, Note, ResolutionRecord, ResolvedComposition, UnresolvedReference,
};
use crate::contract::ContractResult;
use crate::error::ComposeError;
use crate::manifest::ManifestFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    CompositionFailed,
    InvalidInput,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::CompositionFailed => 1,
            ExitStatus::InvalidInput => 2,
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }

    /// Unknown non-zero codes map to `CompositionFailed`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitStatus::Success,
            2 => ExitStatus::InvalidInput,
            _ => ExitStatus::CompositionFailed,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStatus::Success => "success",
            ExitStatus::CompositionFailed => "composition_failed",
            ExitStatus::InvalidInput => "invalid_input",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub status: ExitStatus,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema_errors: Vec<SchemaError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<UnresolvedReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolutions: Vec<ResolutionRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract_results: Vec<ContractResult>,
}

impl DiagnosticReport {
    fn empty(status: ExitStatus) -> Self {
        Self {
            status,
            exit_code: status.code(),
            schema_errors: Vec::new(),
            unresolved: Vec::new(),
            conflicts: Vec::new(),
            advisories: Vec::new(),
            resolutions: Vec::new(),
            notes: Vec::new(),
            contract_results: Vec::new(),
        }
    }

    fn set_status(&mut self, status: ExitStatus) {
        self.status = status;
        self.exit_code = status.code();
    }

    pub fn from_composition(composition: &ResolvedComposition) -> Self {
        let mut report = Self::empty(ExitStatus::Success);
        report.advisories = composition.advisories().to_vec();
        report.resolutions = composition.resolutions().to_vec();
        report.notes = composition.notes().to_vec();
        report
    }

    pub fn from_failure(failed: &CompositionFailed) -> Self {
        let mut report = Self::empty(ExitStatus::from_code(failed.exit_code()));
        report.schema_errors = failed.schema_errors.clone();
        report.unresolved = failed.unresolved.clone();
        report.conflicts = failed.conflicts.clone();
        report.advisories = failed.advisories.clone();
        report.notes = failed.notes.clone();
        report
    }

    /// A registry load: `invalid_input` if any document was rejected.
    pub fn from_load_report(load: &LoadReport) -> Self {
        let status = if load.is_clean() {
            ExitStatus::Success
        } else {
            ExitStatus::InvalidInput
        };
        let mut report = Self::empty(status);
        report.schema_errors = load.errors.clone();
        report
    }

    /// Any error that stopped a run before a composition result existed.
    pub fn from_error(error: &ComposeError, source: &str) -> Self {
        if let ComposeError::Failed(failed) = error {
            return Self::from_failure(failed);
        }
        let mut report = Self::empty(error.exit_status());
        report.schema_errors = match error {
            ComposeError::Request(e) => vec![e.to_schema_error(source)],
            other => vec![SchemaError::single(source, other.to_string())],
        };
        report
    }

    /// Attach contract results; any failure turns a success into
    /// `composition_failed`.
    pub fn with_contract_results(mut self, results: Vec<ContractResult>) -> Self {
        if self.status == ExitStatus::Success && results.iter().any(|r| !r.passed) {
            self.set_status(ExitStatus::CompositionFailed);
        }
        self.contract_results = results;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExitStatus::Success
    }

    pub fn failed_contracts(&self) -> impl Iterator<Item = &ContractResult> {
        self.contract_results.iter().filter(|r| !r.passed)
    }

    pub fn render(&self, format: ManifestFormat) -> Result<String, ComposeError> {
        Ok(match format {
            ManifestFormat::Yaml => serde_yaml::to_string(self)?,
            ManifestFormat::Json => {
                let mut out = serde_json::to_string_pretty(self)?;
                out.push('\n');
                out
            }
        })
    }

    /// Human-readable lines, one per finding.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.extend(self.schema_errors.iter().map(|e| format!("error: {}", e)));
        lines.extend(self.unresolved.iter().map(|u| format!("error: {}", u)));
        lines.extend(self.conflicts.iter().map(|c| format!("conflict: {}", c)));
        lines.extend(self.advisories.iter().map(|c| format!("advisory: {}", c)));
        lines.extend(self.resolutions.iter().map(|r| format!("resolved: {}", r)));
        lines.extend(self.notes.iter().map(|n| format!("note: {}", n)));
        lines.extend(self.contract_results.iter().map(|r| r.to_string()));
        lines
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status: {} (exit {})", self.status, self.exit_code)?;
        for line in self.lines() {
            writeln!(f, "  {}", line)?;
        }
        Ok(())
    }
}
