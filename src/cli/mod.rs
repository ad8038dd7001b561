//! Command-line driver for `capcompose`.
//!
//! ```bash
//! capcompose validate --registry capabilities/
//! capcompose compose request.yaml --registry capabilities/ --format json -o manifest.json
//! capcompose verify manifest.json --root ./instance --timeout-ms 2000
//! capcompose list --registry capabilities/
//! ```
//!
//! Manifests and reports go to stdout (or `--output`); logs go to stderr.
//! The exit code follows [`ExitStatus`].

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticReport, ExitStatus};
use crate::engine::Engine;
use crate::error::ComposeError;
use crate::manifest::{Manifest, ManifestFormat};

#[derive(Debug, Parser)]
#[command(
    name = "capcompose",
    about = "Compose versioned agent capabilities into deterministic manifests",
    version
)]
pub struct Cli {
    /// Engine configuration file (YAML)
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Registry directory (overrides config and CAPCOMPOSE_REGISTRY)
    #[arg(long, short = 'r', global = true, value_name = "DIR")]
    pub registry: Option<PathBuf>,

    /// Output format for manifests and reports (yaml or json)
    #[arg(long, short = 'f', global = true, value_name = "FORMAT")]
    pub format: Option<ManifestFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load the registry and report every malformed document
    Validate,

    /// Compose a request into a manifest
    ///
    /// On success the manifest is written to stdout or --output. On failure a
    /// diagnostic report listing every blocking conflict is written instead.
    Compose {
        /// Composition request document
        request: PathBuf,

        /// Write the manifest here instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Evaluate a manifest's contracts against a materialized instance
    Verify {
        /// Manifest produced by `compose`
        manifest: PathBuf,

        /// Instance root the contract paths are relative to
        #[arg(long)]
        root: PathBuf,

        /// Per-contract timeout in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// List every capability and template in the registry
    List,
}

impl Cli {
    /// Defaults, then the config file, then the environment, then flags. When
    /// `--format` is absent, a `compose --output` path ending in `.json`,
    /// `.yaml` or `.yml` picks the format.
    pub fn engine_config(&self) -> Result<EngineConfig, ComposeError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_yaml_file(path)?,
            None => EngineConfig::default(),
        };
        config.apply_env();
        if let Some(dir) = &self.registry {
            config.registry_dir = dir.clone();
        }
        let implied = match &self.command {
            Command::Compose {
                output: Some(path), ..
            } => format_for(path),
            _ => None,
        };
        if let Some(format) = self.format.or(implied) {
            config.manifest_format = format;
        }
        if let Command::Verify {
            timeout_ms: Some(ms),
            ..
        } = &self.command
        {
            config.contract_timeout_ms = *ms;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Run one command, writing its output to `out`.
pub async fn run(cli: Cli, out: &mut impl Write) -> ExitStatus {
    let source = match &cli.command {
        Command::Compose { request, .. } => request.display().to_string(),
        Command::Verify { manifest, .. } => manifest.display().to_string(),
        Command::Validate | Command::List => "registry".to_string(),
    };

    let config = match cli.engine_config() {
        Ok(config) => config,
        Err(error) => {
            return report_error(&error, &source, cli.format.unwrap_or_default(), out);
        }
    };
    let format = config.manifest_format;

    match dispatch(cli.command, config, out).await {
        Ok(status) => status,
        Err(error) => report_error(&error, &source, format, out),
    }
}

fn report_error(
    error: &ComposeError,
    source: &str,
    format: ManifestFormat,
    out: &mut impl Write,
) -> ExitStatus {
    log::error!("{}", error);
    let report = DiagnosticReport::from_error(error, source);
    if let Err(e) = write_report(&report, format, out) {
        log::error!("could not write report: {}", e);
    }
    report.status
}

async fn dispatch(
    command: Command,
    config: EngineConfig,
    out: &mut impl Write,
) -> Result<ExitStatus, ComposeError> {
    let format = config.manifest_format;

    match command {
        Command::Validate => {
            let engine = Engine::load(config).await?;
            let load = engine.load_report();
            let report = DiagnosticReport::from_load_report(&load);
            writeln!(
                out,
                "{} files, {} capabilities, {} templates, {} errors",
                load.files_scanned,
                load.capabilities_loaded,
                load.templates_loaded,
                load.errors.len()
            )?;
            if !report.is_success() {
                write_report(&report, format, out)?;
            }
            Ok(report.status)
        }

        Command::Compose { request, output } => {
            let engine = Engine::load(config).await?;
            match engine.compose_file(&request) {
                Ok(composition) => {
                    let report = DiagnosticReport::from_composition(&composition);
                    for line in report.lines() {
                        log::info!("{}", line);
                    }
                    match output {
                        Some(path) => {
                            engine.config().emitter().write_to(&composition, &path)?;
                        }
                        None => out.write_all(engine.render(&composition)?.as_bytes())?,
                    }
                    Ok(ExitStatus::Success)
                }
                Err(ComposeError::Failed(failed)) => {
                    let report = DiagnosticReport::from_failure(&failed);
                    write_report(&report, format, out)?;
                    Ok(report.status)
                }
                Err(other) => Err(other),
            }
        }

        Command::Verify { manifest, root, .. } => {
            let manifest = Manifest::from_file(&manifest)?;
            let engine = Engine::from_snapshot(config, Default::default());
            let results = engine.verify(&manifest, &root).await;
            let report =
                DiagnosticReport::from_composition(&manifest.composition).with_contract_results(results);
            write_report(&report, format, out)?;
            Ok(report.status)
        }

        Command::List => {
            let engine = Engine::load(config).await?;
            let registry = engine.registry();
            for name in registry.names() {
                let versions: Vec<String> =
                    registry.versions(name).iter().map(|v| v.to_string()).collect();
                writeln!(out, "{} {}", name, versions.join(", "))?;
            }
            for template in registry.templates() {
                let names: Vec<String> =
                    template.capabilities.iter().map(|c| c.to_string()).collect();
                writeln!(out, "template {}: {}", template.name, names.join(", "))?;
            }
            Ok(ExitStatus::Success)
        }
    }
}

fn write_report(
    report: &DiagnosticReport,
    format: ManifestFormat,
    out: &mut impl Write,
) -> Result<(), ComposeError> {
    out.write_all(report.render(format)?.as_bytes())?;
    Ok(())
}

/// The manifest format implied by `path`'s extension, if any.
pub fn format_for(path: &Path) -> Option<ManifestFormat> {
    match path.extension()?.to_str()? {
        "json" => Some(ManifestFormat::Json),
        "yaml" | "yml" => Some(ManifestFormat::Yaml),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLABORATION: &str = r#"
capability:
  name: collaboration
  version: "1.0.0"
  status: approved
  prerequisites: [domain-knowledge]
  behaviors:
    - { name: step_back, protocol: ["summarize"], output: "a summary" }
  contracts:
    - { name: has_governance, assertion: directory_exists, path: governance/ }
"#;

    const DOMAIN: &str = r#"
capability:
  name: domain-knowledge
  version: "1.0.0"
  status: approved
  behaviors:
    - { name: cite, protocol: ["cite a source"], output: "a citation" }
  contracts:
    - { name: has_sources, assertion: file_exists, path: SOURCES.md }
"#;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("capabilities");
        std::fs::create_dir(&registry).unwrap();
        std::fs::write(registry.join("collaboration.yaml"), COLLABORATION).unwrap();
        std::fs::write(registry.join("domain.yaml"), DOMAIN).unwrap();
        dir
    }

    async fn run_args(args: &[&str]) -> (ExitStatus, String) {
        let cli = Cli::try_parse_from(args).unwrap();
        let mut out = Vec::new();
        let status = run(cli, &mut out).await;
        (status, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_parse_compose() {
        let cli = Cli::try_parse_from([
            "capcompose",
            "compose",
            "request.yaml",
            "--registry",
            "specs",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.registry, Some(PathBuf::from("specs")));
        assert_eq!(cli.format, Some(ManifestFormat::Json));
        assert!(matches!(cli.command, Command::Compose { .. }));
        assert!(Cli::try_parse_from(["capcompose", "compose", "r.yaml", "-f", "toml"]).is_err());
    }

    #[tokio::test]
    async fn test_compose_then_verify() {
        let dir = workspace();
        let registry = dir.path().join("capabilities");
        let request = dir.path().join("request.yaml");
        std::fs::write(
            &request,
            "composition:\n  base_template: advisor\n  capabilities: [collaboration, domain-knowledge]\n",
        )
        .unwrap();
        let manifest = dir.path().join("manifest.json");

        let (status, _) = run_args(&[
            "capcompose",
            "compose",
            request.to_str().unwrap(),
            "-r",
            registry.to_str().unwrap(),
            "-o",
            manifest.to_str().unwrap(),
        ])
        .await;
        assert_eq!(status, ExitStatus::Success);
        let written = std::fs::read_to_string(&manifest).unwrap();
        assert!(written.starts_with('{'), "{}", written);
        let parsed: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["manifest_version"], 1);

        let instance = dir.path().join("instance");
        std::fs::create_dir(&instance).unwrap();
        std::fs::write(instance.join("SOURCES.md"), "- a book\n").unwrap();
        let (status, output) = run_args(&[
            "capcompose",
            "verify",
            manifest.to_str().unwrap(),
            "--root",
            instance.to_str().unwrap(),
        ])
        .await;
        assert_eq!(status, ExitStatus::CompositionFailed);
        assert!(output.contains("directory not found: governance/"));
    }

    #[tokio::test]
    async fn test_compose_failure_writes_report() {
        let dir = workspace();
        let request = dir.path().join("request.yaml");
        std::fs::write(
            &request,
            "composition:\n  base_template: advisor\n  capabilities: [collaboration]\n",
        )
        .unwrap();
        let (status, output) = run_args(&[
            "capcompose",
            "compose",
            request.to_str().unwrap(),
            "-r",
            dir.path().join("capabilities").to_str().unwrap(),
        ])
        .await;
        assert_eq!(status.code(), 1);
        assert!(output.contains("missing_prerequisite"));
    }

    #[tokio::test]
    async fn test_invalid_request_exits_two() {
        let dir = workspace();
        let request = dir.path().join("request.yaml");
        std::fs::write(
            &request,
            "composition:\n  base_template: advisor\n  composition_rules:\n    conflict_resolution: maybe\n",
        )
        .unwrap();
        let (status, output) = run_args(&[
            "capcompose",
            "compose",
            request.to_str().unwrap(),
            "-r",
            dir.path().join("capabilities").to_str().unwrap(),
        ])
        .await;
        assert_eq!(status, ExitStatus::InvalidInput);
        assert!(output.contains("maybe"));
    }

    #[tokio::test]
    async fn test_error_report_uses_configured_format() {
        let dir = workspace();
        let config = dir.path().join("capcompose.yaml");
        std::fs::write(
            &config,
            format!(
                "registry_dir: {}\nmanifest_format: json\n",
                dir.path().join("capabilities").display()
            ),
        )
        .unwrap();
        let request = dir.path().join("request.yaml");
        std::fs::write(
            &request,
            "composition:\n  base_template: advisor\n  composition_rules:\n    conflict_resolution: maybe\n",
        )
        .unwrap();

        let (status, output) = run_args(&[
            "capcompose",
            "compose",
            request.to_str().unwrap(),
            "-c",
            config.to_str().unwrap(),
        ])
        .await;
        assert_eq!(status, ExitStatus::InvalidInput);
        let report: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(report["status"], "invalid_input");
    }

    #[test]
    fn test_format_for_extension() {
        assert_eq!(format_for(Path::new("m.json")), Some(ManifestFormat::Json));
        assert_eq!(format_for(Path::new("m.yml")), Some(ManifestFormat::Yaml));
        assert_eq!(format_for(Path::new("manifest")), None);

        let cli = Cli::try_parse_from([
            "capcompose", "compose", "r.yaml", "-o", "m.json", "-f", "yaml",
        ])
        .unwrap();
        assert_eq!(cli.engine_config().unwrap().manifest_format, ManifestFormat::Yaml);
    }

    #[tokio::test]
    async fn test_validate_and_list() {
        let dir = workspace();
        let registry = dir.path().join("capabilities");
        std::fs::write(registry.join("broken.yaml"), "capability:\n  name: Broken\n").unwrap();

        let (status, output) =
            run_args(&["capcompose", "validate", "-r", registry.to_str().unwrap()]).await;
        assert_eq!(status, ExitStatus::InvalidInput);
        assert!(output.starts_with("3 files, 2 capabilities, 0 templates, 1 errors"));

        let (status, output) =
            run_args(&["capcompose", "list", "-r", registry.to_str().unwrap()]).await;
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, "collaboration 1.0.0\ndomain-knowledge 1.0.0\n");
    }
}
