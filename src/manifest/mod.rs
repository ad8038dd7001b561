//! Manifest emission: the serialized form of a [`ResolvedComposition`] that
//! instance-materialization tooling consumes.
//!
//! ```yaml
//! manifest_version: 1
//! digest: "sha256:9f2c..."
//! composition:
//!   base_template: advisor
//!   policy: first_wins
//!   capabilities: [ ... ]        # canonical order
//!   requirements: [ ... ]        # requires edges, sorted
//!   materialization_order: [ ... ]
//!   behaviors: [ ... ]           # sorted by name
//!   resolutions: [ ... ]         # overrides and merges
//! ```
//!
//! Output is byte-identical for an identical request and registry snapshot:
//! every collection is ordered, and no timestamps or generated ids appear.
//! `digest` is the SHA-256 of the composition's JSON encoding.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::composition::ResolvedComposition;

/// Manifest schema version written by this crate.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported manifest_version {0} (expected {expected})", expected = MANIFEST_VERSION)]
    UnsupportedVersion(u32),

    #[error("digest mismatch: manifest says {expected}, content hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    #[default]
    Yaml,
    Json,
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestFormat::Yaml => f.write_str("yaml"),
            ManifestFormat::Json => f.write_str("json"),
        }
    }
}

impl FromStr for ManifestFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(ManifestFormat::Yaml),
            "json" => Ok(ManifestFormat::Json),
            other => Err(format!("unknown manifest format '{}' (expected yaml or json)", other)),
        }
    }
}

/// A versioned, digested composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: u32,
    pub digest: String,
    pub composition: ResolvedComposition,
}

impl Manifest {
    pub fn new(composition: ResolvedComposition) -> Result<Self, ManifestError> {
        let digest = digest_of(&composition)?;
        Ok(Self {
            manifest_version: MANIFEST_VERSION,
            digest,
            composition,
        })
    }

    /// Parse a manifest in either format and check its version and digest.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = if content.trim_start().starts_with('{') {
            serde_json::from_str(content)?
        } else {
            serde_yaml::from_str(content)?
        };
        manifest.verify()?;
        Ok(manifest)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn verify(&self) -> Result<(), ManifestError> {
        if self.manifest_version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        let actual = digest_of(&self.composition)?;
        if actual != self.digest {
            return Err(ManifestError::DigestMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn render(&self, format: ManifestFormat) -> Result<String, ManifestError> {
        Ok(match format {
            ManifestFormat::Yaml => serde_yaml::to_string(self)?,
            ManifestFormat::Json => {
                let mut out = serde_json::to_string_pretty(self)?;
                out.push('\n');
                out
            }
        })
    }
}

/// `sha256:<hex>` over the composition's JSON encoding.
pub fn digest_of(composition: &ResolvedComposition) -> Result<String, ManifestError> {
    let bytes = serde_json::to_vec(composition)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
}

/// Writes manifests in one format.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestEmitter {
    format: ManifestFormat,
}

impl ManifestEmitter {
    pub fn new(format: ManifestFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    pub fn emit(&self, composition: &ResolvedComposition) -> Result<String, ManifestError> {
        Manifest::new(composition.clone())?.render(self.format)
    }

    /// Render and write to `path`, returning the manifest written.
    pub fn write_to(
        &self,
        composition: &ResolvedComposition,
        path: &Path,
    ) -> Result<Manifest, ManifestError> {
        let manifest = Manifest::new(composition.clone())?;
        std::fs::write(path, manifest.render(self.format)?)?;
        log::info!(
            "Manifest: wrote {} ({}, {})",
            path.display(),
            self.format,
            manifest.digest
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilitySpec, ConfigValue, RegistrySnapshot};
    use crate::composition::{compose, CapabilityRequest, CompositionRequest, ConflictResolution};

    fn registry() -> RegistrySnapshot {
        let specs = [
            r#"
capability:
  name: reflection
  version: "1.0.0"
  status: approved
  behaviors:
    - { name: step_back, trigger: "user asks to step back", protocol: ["pause"], output: "a pause" }
  contracts:
    - { name: has-journal, assertion: file_contains, path: journal.md, pattern: "^# Journal" }
  config:
    depth: { type: float, default: 0.5 }
"#,
            r#"
capability:
  name: collaboration
  version: "1.2.0"
  status: approved
  prerequisites: [reflection]
  behaviors:
    - { name: step_back, protocol: ["summarize"], output: "a summary" }
    - { name: pair, trigger: { kind: command, value: /pair }, protocol: ["pair"], output: "notes" }
  contracts:
    - name: has-plugins
      assertion: custom
      evaluator: non-empty-directory
      path: plugins
      params: { min_entries: 2 }
  config:
    reviewers: { type: list, default: [alice, bob] }
"#,
        ];
        RegistrySnapshot::from_specs(specs.iter().map(|y| CapabilitySpec::from_yaml(y).unwrap()))
    }

    fn composition(order: &[&str]) -> ResolvedComposition {
        let request = order.iter().fold(
            CompositionRequest::new("advisor").with_policy(ConflictResolution::FirstWins),
            |r, n| r.with_capability(CapabilityRequest::new(*n)),
        );
        compose(&registry(), &request).unwrap()
    }

    #[test]
    fn test_emission_is_deterministic() {
        let a = composition(&["reflection", "collaboration"]);
        let b = composition(&["collaboration", "reflection"]);
        for format in [ManifestFormat::Yaml, ManifestFormat::Json] {
            let emitter = ManifestEmitter::new(format);
            assert_eq!(emitter.emit(&a).unwrap(), emitter.emit(&b).unwrap());
        }
        assert_eq!(digest_of(&a).unwrap(), digest_of(&b).unwrap());
        assert!(digest_of(&a).unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_round_trip_verifies_in_both_formats() {
        let resolved = composition(&["reflection", "collaboration"]);
        for format in [ManifestFormat::Yaml, ManifestFormat::Json] {
            let text = ManifestEmitter::new(format).emit(&resolved).unwrap();
            let manifest = Manifest::parse(&text).unwrap();
            assert_eq!(manifest.composition, resolved);
            assert_eq!(
                manifest.composition.capability("reflection").unwrap().config["depth"],
                ConfigValue::Float(0.5)
            );
        }
    }

    #[test]
    fn test_tampered_manifest_is_rejected() {
        let resolved = composition(&["reflection", "collaboration"]);
        let text = ManifestEmitter::new(ManifestFormat::Yaml).emit(&resolved).unwrap();
        let tampered = text.replace("a summary", "a different summary");
        assert_ne!(text, tampered);
        assert!(matches!(
            Manifest::parse(&tampered),
            Err(ManifestError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_manifest_version_is_rejected() {
        let resolved = composition(&["reflection", "collaboration"]);
        let text = ManifestEmitter::new(ManifestFormat::Yaml).emit(&resolved).unwrap();
        let future = text.replacen("manifest_version: 1", "manifest_version: 7", 1);
        let err = Manifest::parse(&future).unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedVersion(7)));
        assert_eq!(
            err.to_string(),
            format!("unsupported manifest_version 7 (expected {})", MANIFEST_VERSION)
        );

        let io: ManifestError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(io.to_string().starts_with("IO error"));
    }

    #[test]
    fn test_manifest_contents() {
        let resolved = composition(&["collaboration", "reflection"]);
        assert_eq!(resolved.materialization_order(), ["reflection", "collaboration"]);
        assert_eq!(resolved.requirements().len(), 1);
        assert_eq!(resolved.resolutions().len(), 1);

        let text = ManifestEmitter::new(ManifestFormat::Json).emit(&resolved).unwrap();
        assert!(text.contains("\"manifest_version\": 1"));
        assert!(text.contains("\"policy\": \"first_wins\""));
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yaml");
        let resolved = composition(&["reflection", "collaboration"]);
        let written = ManifestEmitter::default().write_to(&resolved, &path).unwrap();
        let read = Manifest::from_file(&path).unwrap();
        assert_eq!(written, read);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ManifestFormat>(), Ok(ManifestFormat::Json));
        assert_eq!("yml".parse::<ManifestFormat>(), Ok(ManifestFormat::Yaml));
        assert!("toml".parse::<ManifestFormat>().is_err());
    }
}
