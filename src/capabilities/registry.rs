//! Capability Registry: immutable, queryable snapshots of loaded specs.
//!
//! The registry loads capability and template documents from a directory
//! tree. Every YAML file may contain one of:
//!
//! ```yaml
//! capability: { ... }        # a single capability
//! capabilities: [ ... ]      # several capabilities
//! template: { ... }          # a base template
//! ```
//!
//! Loading is fail-partial: a malformed document becomes a [`SchemaError`] in
//! the [`LoadReport`] and every other document still loads. Files are read
//! and parsed concurrently, then sorted by path before the snapshot is built,
//! so the snapshot never depends on read completion order.
//!
//! A [`RegistrySnapshot`] never changes once built. [`SharedRegistry`] holds
//! the current snapshot behind an `Arc` and swaps in a new one on reload;
//! compositions that already hold the old `Arc` finish against it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use super::capability::{CapabilityDocument, CapabilitySpec};
use super::template::{Template, TemplateDocument};
use super::version::{Version, VersionReq};

/// Default number of spec files read concurrently.
pub const DEFAULT_LOAD_CONCURRENCY: usize = 16;

/// Errors that stop a registry load entirely. Per-document problems are
/// reported as [`SchemaError`]s instead.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry directory not found: {0}")]
    NotFound(PathBuf),

    #[error("registry load task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A malformed spec or request document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaError {
    /// File path, optionally suffixed with the entry (`caps.yaml#capabilities[2]`).
    pub source: String,
    pub messages: Vec<String>,
}

impl SchemaError {
    pub fn new(source: impl Into<String>, messages: Vec<String>) -> Self {
        Self {
            source: source.into(),
            messages,
        }
    }

    pub fn single(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, vec![message.into()])
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.messages.join("; "))
    }
}

/// Summary of one registry load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub files_scanned: usize,
    pub capabilities_loaded: usize,
    pub templates_loaded: usize,
    pub errors: Vec<SchemaError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// An immutable view of every loaded capability and template.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    specs: BTreeMap<String, BTreeMap<Version, Arc<CapabilitySpec>>>,
    templates: BTreeMap<String, Arc<Template>>,
    report: LoadReport,
}

impl RegistrySnapshot {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build a snapshot directly from specs (no files involved).
    pub fn from_specs(specs: impl IntoIterator<Item = CapabilitySpec>) -> Self {
        let mut builder = Self::builder();
        for (i, spec) in specs.into_iter().enumerate() {
            builder.add_spec(format!("<memory>#{}", i), spec);
        }
        builder.build()
    }

    /// Highest version of `name` satisfying `req`.
    pub fn resolve(&self, name: &str, req: &VersionReq) -> Option<&Arc<CapabilitySpec>> {
        self.specs
            .get(name)?
            .iter()
            .rev()
            .find(|(v, _)| req.matches(v))
            .map(|(_, spec)| spec)
    }

    /// Highest version of `name` satisfying every constraint in `reqs`.
    pub fn resolve_all<'a>(
        &self,
        name: &str,
        reqs: impl IntoIterator<Item = &'a VersionReq> + Clone,
    ) -> Option<&Arc<CapabilitySpec>> {
        self.specs
            .get(name)?
            .iter()
            .rev()
            .find(|(v, _)| reqs.clone().into_iter().all(|r| r.matches(v)))
            .map(|(_, spec)| spec)
    }

    pub fn get(&self, name: &str, version: &Version) -> Option<&Arc<CapabilitySpec>> {
        self.specs.get(name)?.get(version)
    }

    /// Known versions of `name`, highest first.
    pub fn versions(&self, name: &str) -> Vec<&Version> {
        self.specs
            .get(name)
            .map(|versions| versions.keys().rev().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Every spec, alphabetical by name and highest version first.
    pub fn specs(&self) -> impl Iterator<Item = &Arc<CapabilitySpec>> {
        self.specs.values().flat_map(|versions| versions.values().rev())
    }

    pub fn template(&self, name: &str) -> Option<&Arc<Template>> {
        self.templates.get(name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.templates.values()
    }

    /// Number of distinct `(name, version)` specs.
    pub fn len(&self) -> usize {
        self.specs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }
}

// ============================================================================
// Builder
// ============================================================================

enum Entry {
    Spec(CapabilitySpec),
    Template(Template),
}

/// Collects parsed documents and errors, then produces a snapshot.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<(String, Entry)>,
    errors: Vec<SchemaError>,
    files_scanned: usize,
}

impl RegistryBuilder {
    pub fn add_spec(&mut self, source: impl Into<String>, spec: CapabilitySpec) -> &mut Self {
        self.entries.push((source.into(), Entry::Spec(spec)));
        self
    }

    pub fn add_template(&mut self, source: impl Into<String>, template: Template) -> &mut Self {
        self.entries.push((source.into(), Entry::Template(template)));
        self
    }

    pub fn add_error(&mut self, error: SchemaError) -> &mut Self {
        self.errors.push(error);
        self
    }

    /// Parse one YAML file's contents and record what it holds.
    pub fn add_document(&mut self, source: &str, yaml: &str) -> &mut Self {
        self.files_scanned += 1;
        let parsed = parse_document(source, yaml);
        self.absorb(parsed);
        self
    }

    fn absorb(&mut self, parsed: ParsedFile) {
        for (source, result) in parsed.entries {
            match result {
                Ok(entry) => self.entries.push((source, entry)),
                Err(messages) => self.errors.push(SchemaError::new(source, messages)),
            }
        }
    }

    /// Build the snapshot. Inputs are ordered by source first, so the first
    /// document (by path) to declare a `(name, version)` wins and later ones
    /// are reported as duplicates.
    pub fn build(mut self) -> RegistrySnapshot {
        self.entries.sort_by(|a, b| source_order(&a.0).cmp(&source_order(&b.0)));
        self.errors
            .sort_by(|a, b| source_order(&a.source).cmp(&source_order(&b.source)));

        let mut specs: BTreeMap<String, BTreeMap<Version, Arc<CapabilitySpec>>> = BTreeMap::new();
        let mut templates: BTreeMap<String, Arc<Template>> = BTreeMap::new();
        let mut errors = self.errors;

        for (source, entry) in self.entries {
            match entry {
                Entry::Spec(spec) => {
                    let versions = specs.entry(spec.name.clone()).or_default();
                    if versions.contains_key(&spec.version) {
                        errors.push(SchemaError::single(
                            source,
                            format!("duplicate capability {}", spec.id()),
                        ));
                    } else {
                        versions.insert(spec.version.clone(), Arc::new(spec));
                    }
                }
                Entry::Template(template) => {
                    if templates.contains_key(&template.name) {
                        errors.push(SchemaError::single(
                            source,
                            format!("duplicate template '{}'", template.name),
                        ));
                    } else {
                        templates.insert(template.name.clone(), Arc::new(template));
                    }
                }
            }
        }

        let report = LoadReport {
            files_scanned: self.files_scanned,
            capabilities_loaded: specs.values().map(BTreeMap::len).sum(),
            templates_loaded: templates.len(),
            errors,
        };

        RegistrySnapshot {
            specs,
            templates,
            report,
        }
    }
}

/// Sort key for an entry source: file path, then position within the file,
/// with list indices compared numerically.
fn source_order(source: &str) -> (&str, u8, usize) {
    if let Some(path) = source.strip_suffix("#template") {
        return (path, 2, 0);
    }
    if let Some((path, rest)) = source.rsplit_once("#capabilities[") {
        if let Some(index) = rest.strip_suffix(']').and_then(|i| i.parse().ok()) {
            return (path, 1, index);
        }
    }
    (source, 0, 0)
}

/// Top-level shape of a registry YAML file.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    capability: Option<CapabilityDocument>,
    #[serde(default)]
    capabilities: Option<Vec<CapabilityDocument>>,
    #[serde(default)]
    template: Option<TemplateDocument>,
}

struct ParsedFile {
    entries: Vec<(String, Result<Entry, Vec<String>>)>,
}

fn parse_document(source: &str, yaml: &str) -> ParsedFile {
    let file: RegistryFile = match serde_yaml::from_str(yaml) {
        Ok(f) => f,
        Err(e) => {
            return ParsedFile {
                entries: vec![(source.to_string(), Err(vec![format!("YAML error: {}", e)]))],
            }
        }
    };

    let mut entries = Vec::new();
    if let Some(doc) = file.capability {
        entries.push((
            source.to_string(),
            CapabilitySpec::from_document(doc).map(Entry::Spec),
        ));
    }
    if let Some(docs) = file.capabilities {
        for (i, doc) in docs.into_iter().enumerate() {
            entries.push((
                format!("{}#capabilities[{}]", source, i),
                CapabilitySpec::from_document(doc).map(Entry::Spec),
            ));
        }
    }
    if let Some(doc) = file.template {
        entries.push((
            format!("{}#template", source),
            Template::from_document(doc).map(Entry::Template),
        ));
    }
    if entries.is_empty() {
        entries.push((
            source.to_string(),
            Err(vec![
                "expected a top-level 'capability', 'capabilities' or 'template' key".to_string(),
            ]),
        ));
    }
    ParsedFile { entries }
}

// ============================================================================
// Loader
// ============================================================================

/// Loads registry snapshots from a directory tree.
#[derive(Debug, Clone)]
pub struct RegistryLoader {
    concurrency: usize,
}

impl Default for RegistryLoader {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_LOAD_CONCURRENCY,
        }
    }
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of files read at once (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Load every `*.yaml`/`*.yml` file under `dir` (recursive).
    pub async fn load_dir(&self, dir: &Path) -> Result<RegistrySnapshot, RegistryError> {
        if !dir.is_dir() {
            return Err(RegistryError::NotFound(dir.to_path_buf()));
        }

        let root = dir.to_path_buf();
        let mut paths = tokio::task::spawn_blocking(move || collect_yaml_files(&root)).await??;
        paths.sort();
        log::debug!("Registry: reading {} files from {}", paths.len(), dir.display());

        let parsed: Vec<(String, Result<ParsedFile, std::io::Error>)> = stream::iter(paths)
            .map(|path| async move {
                let source = path.display().to_string();
                let result = tokio::fs::read_to_string(&path)
                    .await
                    .map(|text| parse_document(&source, &text));
                (source, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut builder = RegistrySnapshot::builder();
        for (source, result) in parsed {
            builder.files_scanned += 1;
            match result {
                Ok(file) => builder.absorb(file),
                Err(e) => {
                    builder.add_error(SchemaError::single(source, format!("unreadable: {}", e)));
                }
            }
        }
        let snapshot = builder.build();

        let report = snapshot.report();
        log::info!(
            "Registry: loaded {} capabilities and {} templates from {} files",
            report.capabilities_loaded,
            report.templates_loaded,
            report.files_scanned
        );
        for error in &report.errors {
            log::warn!("Registry: skipped {}", error);
        }
        Ok(snapshot)
    }
}

/// Every `.yaml`/`.yml` file under `dir`. Directory symlinks are not
/// descended, so a link back to an ancestor cannot repeat the tree.
fn collect_yaml_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml");
        if is_yaml && path.is_file() {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

// ============================================================================
// Shared handle
// ============================================================================

/// Holds the current snapshot and swaps it atomically on reload.
#[derive(Debug)]
pub struct SharedRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl SharedRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The snapshot to compose against. Holding the `Arc` pins that view.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Replace the current snapshot, returning the previous one.
    pub fn swap(&self, snapshot: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        std::mem::replace(&mut *self.current.write(), Arc::new(snapshot))
    }

    /// Load a fresh snapshot from `dir` and swap it in. The current snapshot
    /// stays in place if the load fails.
    pub async fn reload(
        &self,
        loader: &RegistryLoader,
        dir: &Path,
    ) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let snapshot = Arc::new(loader.load_dir(dir).await?);
        *self.current.write() = Arc::clone(&snapshot);
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_yaml(name: &str, version: &str) -> String {
        format!(
            r#"
capability:
  name: {name}
  version: "{version}"
  status: approved
  behaviors:
    - name: {name}-behavior
      protocol: ["do the thing"]
      output: "done"
  contracts:
    - name: has_dir
      assertion: directory_exists
      path: {name}/
"#
        )
    }

    #[test]
    fn test_resolve_highest_matching() {
        let mut builder = RegistrySnapshot::builder();
        builder.add_document("a.yaml", &spec_yaml("memory-management", "1.0.0"));
        builder.add_document("b.yaml", &spec_yaml("memory-management", "1.4.0"));
        builder.add_document("c.yaml", &spec_yaml("memory-management", "2.0.0"));
        let snapshot = builder.build();

        assert_eq!(snapshot.len(), 3);
        let any = snapshot.resolve("memory-management", &VersionReq::STAR).unwrap();
        assert_eq!(any.version, Version::new(2, 0, 0));

        let below_two = VersionReq::parse("<2.0.0").unwrap();
        let hit = snapshot.resolve("memory-management", &below_two).unwrap();
        assert_eq!(hit.version, Version::new(1, 4, 0));

        let exact = VersionReq::parse("1.0.0").unwrap();
        let both = snapshot
            .resolve_all("memory-management", [&below_two, &exact])
            .unwrap();
        assert_eq!(both.version, Version::new(1, 0, 0));

        assert!(snapshot
            .resolve("memory-management", &VersionReq::parse(">=3").unwrap())
            .is_none());
        assert!(snapshot.resolve("unknown", &VersionReq::STAR).is_none());
        assert_eq!(
            snapshot.versions("memory-management"),
            vec![
                &Version::new(2, 0, 0),
                &Version::new(1, 4, 0),
                &Version::new(1, 0, 0)
            ]
        );
    }

    #[test]
    fn test_resolve_skips_next_major_prerelease() {
        let mut builder = RegistrySnapshot::builder();
        builder.add_document("a.yaml", &spec_yaml("memory-management", "1.4.0"));
        builder.add_document("b.yaml", &spec_yaml("memory-management", "2.0.0-alpha.1"));
        let snapshot = builder.build();

        for constraint in ["^1.0.0", ">=1.0.0", "*"] {
            let hit = snapshot
                .resolve("memory-management", &VersionReq::parse(constraint).unwrap())
                .unwrap();
            assert_eq!(hit.version, Version::new(1, 4, 0), "{}", constraint);
        }
        let pre = VersionReq::parse(">=2.0.0-alpha").unwrap();
        let hit = snapshot.resolve("memory-management", &pre).unwrap();
        assert_eq!(hit.version.to_string(), "2.0.0-alpha.1");
    }

    #[test]
    fn test_bad_document_does_not_block_others() {
        let mut builder = RegistrySnapshot::builder();
        builder.add_document("good.yaml", &spec_yaml("collaboration", "1.0.0"));
        builder.add_document("broken.yaml", "capability: [not, a, map");
        builder.add_document("invalid.yaml", "capability:\n  name: Nope\n");
        builder.add_document("other.yaml", "something_else: true\n");
        let snapshot = builder.build();

        assert!(snapshot.contains("collaboration"));
        let report = snapshot.report();
        assert_eq!(report.files_scanned, 4);
        assert_eq!(report.capabilities_loaded, 1);
        assert_eq!(report.errors.len(), 3);
        // Sorted by source.
        let sources: Vec<&str> = report.errors.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(sources, vec!["broken.yaml", "invalid.yaml", "other.yaml"]);
        // Every problem in the invalid document is reported.
        assert!(report.errors[1].messages.len() >= 4);
    }

    #[test]
    fn test_duplicate_version_first_source_wins() {
        let mut builder = RegistrySnapshot::builder();
        builder.add_document("z.yaml", &spec_yaml("audit", "1.0.0"));
        builder.add_document("a.yaml", &spec_yaml("audit", "1.0.0"));
        let snapshot = builder.build();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.report().errors.len(), 1);
        assert_eq!(snapshot.report().errors[0].source, "z.yaml");
    }

    #[test]
    fn test_list_entries_keep_file_order() {
        let entries: Vec<String> = (0..12)
            .map(|i| {
                format!(
                    "  - {{ name: audit, version: '1.0.0', status: draft, behaviors: [{{ name: b{i}, protocol: [x], output: y }}], contracts: [{{ name: c, assertion: file_exists, path: a.md }}] }}"
                )
            })
            .collect();
        let yaml = format!("capabilities:\n{}\n", entries.join("\n"));
        let mut builder = RegistrySnapshot::builder();
        builder.add_document("x.yaml", &yaml);
        let snapshot = builder.build();

        let kept = snapshot.resolve("audit", &VersionReq::STAR).unwrap();
        assert_eq!(kept.behaviors[0].name, "b0");
        let sources: Vec<&str> = snapshot
            .report()
            .errors
            .iter()
            .map(|e| e.source.as_str())
            .collect();
        assert_eq!(sources[0], "x.yaml#capabilities[1]");
        assert_eq!(sources[1], "x.yaml#capabilities[2]");
        assert_eq!(sources[10], "x.yaml#capabilities[11]");
    }

    #[test]
    fn test_capabilities_list_and_template() {
        let yaml = format!(
            "capabilities:\n  - {}\n  - {{ name: broken }}\n",
            "{ name: alpha, version: '1.0.0', status: draft, behaviors: [{ name: a, protocol: [x], output: y }], contracts: [{ name: c, assertion: file_exists, path: a.md }] }"
        );
        let mut builder = RegistrySnapshot::builder();
        builder.add_document("list.yaml", &yaml);
        builder.add_document(
            "advisor.yaml",
            "template:\n  name: advisor\n  capabilities: [alpha]\n",
        );
        let snapshot = builder.build();

        assert!(snapshot.contains("alpha"));
        assert_eq!(snapshot.report().errors.len(), 1);
        assert_eq!(snapshot.report().errors[0].source, "list.yaml#capabilities[1]");
        let template = snapshot.template("advisor").unwrap();
        assert_eq!(template.capabilities[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_load_directory_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("core");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("memory.yaml"), spec_yaml("memory-management", "1.0.0"))
            .unwrap();
        std::fs::write(nested.join("collab.yml"), spec_yaml("collaboration", "1.0.0")).unwrap();
        std::fs::write(dir.path().join("readme.txt"), "not a spec").unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "capability: {}").unwrap();

        let snapshot = RegistryLoader::new()
            .with_concurrency(2)
            .load_dir(dir.path())
            .await
            .unwrap();

        let names: Vec<&str> = snapshot.names().collect();
        assert_eq!(names, vec!["collaboration", "memory-management"]);
        assert_eq!(snapshot.report().files_scanned, 3);
        assert_eq!(snapshot.report().errors.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_loop_loads_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.yaml"), spec_yaml("memory-management", "1.0.0"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let snapshot = RegistryLoader::new().load_dir(dir.path()).await.unwrap();
        let report = snapshot.report();
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.files_scanned, 1);
        assert_eq!(report.capabilities_loaded, 1);
    }

    #[tokio::test]
    async fn test_load_missing_directory() {
        let result = RegistryLoader::new()
            .load_dir(Path::new("/nonexistent/registry"))
            .await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reload_swaps_without_touching_held_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), spec_yaml("alpha", "1.0.0")).unwrap();

        let loader = RegistryLoader::new();
        let shared = SharedRegistry::new(loader.load_dir(dir.path()).await.unwrap());
        let pinned = shared.snapshot();

        std::fs::write(dir.path().join("a.yaml"), spec_yaml("alpha", "2.0.0")).unwrap();
        let fresh = shared.reload(&loader, dir.path()).await.unwrap();

        assert_eq!(pinned.versions("alpha"), vec![&Version::new(1, 0, 0)]);
        assert_eq!(fresh.versions("alpha"), vec![&Version::new(2, 0, 0)]);
        assert!(!Arc::ptr_eq(&pinned, &shared.snapshot()));
        assert!(Arc::ptr_eq(&fresh, &shared.snapshot()));

        let previous = shared.swap(RegistrySnapshot::builder().build());
        assert!(Arc::ptr_eq(&previous, &fresh));
        assert!(shared.snapshot().is_empty());
    }
}
