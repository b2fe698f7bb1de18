//! One generation run: prompt in, materialized and verified project out.
//!
//! Stages run strictly in sequence. Every stage degrades instead of failing, so the
//! caller always gets a [`PipelineReport`] with a [`Verdict`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::build::{BuildAttempt, Toolchain};
use crate::config::Config;
use crate::llm::{extract_detailed, CompletionOptions, Strategy, StreamingCompletionClient};
use crate::project::materialize;
use crate::repair::deps::{AddedPackage, DependencyReconciler};
use crate::repair::exports::ExportContractFixer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    BuildFailed,
    /// Repairs ran but the build was skipped.
    Unverified,
    NoFilesRecovered,
    GenerationFailed,
    MaterializeFailed,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Passed | Verdict::Unverified)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub project: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub verdict: Verdict,
    pub generation_error: Option<String>,
    pub response_chars: usize,
    pub extraction_strategy: Option<Strategy>,
    pub files_written: Vec<String>,
    pub files_rejected: Vec<(String, String)>,
    pub packages_added: Vec<AddedPackage>,
    pub files_rewritten: usize,
    pub imports_rewritten: usize,
    /// Packages installed after the first build reported them missing.
    pub installed_after_failure: Vec<String>,
    pub builds: Vec<BuildAttempt>,
    /// Non-fatal stage problems, in the order they happened.
    pub notes: Vec<String>,
}

impl PipelineReport {
    fn new(project: &Path) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project: project.to_path_buf(),
            started_at: Utc::now(),
            finished_at: None,
            verdict: Verdict::Unverified,
            generation_error: None,
            response_chars: 0,
            extraction_strategy: None,
            files_written: Vec::new(),
            files_rejected: Vec::new(),
            packages_added: Vec::new(),
            files_rewritten: 0,
            imports_rewritten: 0,
            installed_after_failure: Vec::new(),
            builds: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn finish(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self.finished_at = Some(Utc::now());
        tracing::info!(
            run_id = %self.run_id,
            verdict = ?self.verdict,
            files = self.files_written.len(),
            packages_added = self.packages_added.len(),
            imports_rewritten = self.imports_rewritten,
            builds = self.builds.len(),
            "pipeline finished"
        );
        self
    }

    fn note(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.notes.push(message);
    }

    /// Output of the last failed build, if the run ended on one.
    pub fn residual_error(&self) -> Option<&str> {
        match self.builds.last() {
            Some(build) if !build.ok => Some(build.output_tail.as_str()),
            _ => None,
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{}: {:?} ({} files, {} packages added, {} imports fixed, {} builds)",
            self.project.display(),
            self.verdict,
            self.files_written.len(),
            self.packages_added.len(),
            self.imports_rewritten,
            self.builds.len()
        )
    }
}

/// A pipeline instance. Instances share no mutable state, so independent projects can
/// run on separate instances concurrently.
pub struct Pipeline {
    config: Arc<Config>,
    client: StreamingCompletionClient,
    run_build: bool,
}

impl Pipeline {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = StreamingCompletionClient::new(config.api.clone())?;
        Ok(Self {
            config: Arc::new(config),
            client,
            run_build: true,
        })
    }

    /// Skip install and build; only the source repairs run.
    pub fn without_build(mut self) -> Self {
        self.run_build = false;
        self
    }

    /// Generate a project from `prompt` into `project` and verify it.
    pub async fn run(&self, prompt: &str, project: &Path) -> PipelineReport {
        let mut report = PipelineReport::new(project);
        tracing::info!(run_id = %report.run_id, project = %project.display(), "pipeline started");

        let options = CompletionOptions::from(&self.config.generation);
        let text = match self.client.complete(prompt, &options).await {
            Ok(text) => text,
            Err(err) => {
                report.generation_error = Some(err.to_string());
                return report.finish(Verdict::GenerationFailed);
            }
        };
        report.response_chars = text.chars().count();

        let outcome = extract_detailed(&text);
        report.extraction_strategy = outcome.strategy;
        if outcome.files.is_empty() {
            tracing::warn!(response_chars = report.response_chars, "no files recovered from response");
            return report.finish(Verdict::NoFilesRecovered);
        }
        tracing::info!(
            strategy = outcome.strategy.map(|s| s.label()).unwrap_or("none"),
            files = outcome.files.len(),
            "recovered files"
        );

        match materialize(project, &outcome.files) {
            Ok(written) => {
                report.files_written = written.written;
                report.files_rejected = written.rejected;
            }
            Err(err) => {
                report.note(format!("Failed to prepare project directory: {:#}", err));
                return report.finish(Verdict::MaterializeFailed);
            }
        }
        if report.files_written.is_empty() {
            return report.finish(Verdict::MaterializeFailed);
        }

        self.repair_stages(report).await
    }

    /// Run the post-materialization stages on an existing tree.
    pub async fn repair(&self, project: &Path) -> PipelineReport {
        let report = PipelineReport::new(project);
        tracing::info!(run_id = %report.run_id, project = %project.display(), "repairing existing project");
        self.repair_stages(report).await
    }

    async fn repair_stages(&self, report: PipelineReport) -> PipelineReport {
        let config = Arc::clone(&self.config);
        let run_build = self.run_build;
        let run_id = report.run_id;
        let project = report.project.clone();

        match tokio::task::spawn_blocking(move || repair_tree(&config, run_build, report)).await {
            Ok(report) => report,
            Err(err) => {
                let mut report = PipelineReport::new(&project);
                report.run_id = run_id;
                report.note(format!("Repair stages aborted: {}", err));
                report.finish(Verdict::BuildFailed)
            }
        }
    }
}

/// Dependency and export repairs, then the bounded build cycle. Blocking.
fn repair_tree(config: &Config, run_build: bool, mut report: PipelineReport) -> PipelineReport {
    let project = report.project.clone();

    let reconciler = DependencyReconciler::new(config.packages.clone(), config.tree.clone());
    match reconciler.reconcile_project(&project) {
        Ok(outcome) => report.packages_added = outcome.added,
        Err(err) => report.note(format!("Dependency reconciliation skipped: {:#}", err)),
    }

    let fixer = ExportContractFixer::new(config.packages.clone(), config.tree.clone());
    match fixer.fix_exports(&project) {
        Ok(fixed) => {
            report.files_rewritten = fixed.files_rewritten;
            report.imports_rewritten = fixed.imports_rewritten;
        }
        Err(err) => report.note(format!("Export repair incomplete: {:#}", err)),
    }

    if !run_build {
        return report.finish(Verdict::Unverified);
    }

    let toolchain = Toolchain::new(config.toolchain.clone(), config.packages.clone());
    if !toolchain.install_all(&project) {
        report.note("Dependency install failed; building anyway".to_string());
    }
    let verdict = verify_with_one_repair(&toolchain, &project, &mut report);
    report.finish(verdict)
}

/// Build; if the build names missing packages, install them and build exactly once more.
fn verify_with_one_repair(
    toolchain: &Toolchain,
    project: &Path,
    report: &mut PipelineReport,
) -> Verdict {
    let first = toolchain.verify(project);
    let ok = first.ok;
    let missing: Vec<String> = first.missing_modules.iter().cloned().collect();
    report.builds.push(first);
    if ok {
        return Verdict::Passed;
    }
    if missing.is_empty() {
        return Verdict::BuildFailed;
    }

    if !toolchain.install_packages(project, &missing) {
        report.note(format!("Installing {} failed", missing.join(", ")));
    }
    report.installed_after_failure = missing;

    let second = toolchain.verify(project);
    let ok = second.ok;
    report.builds.push(second);
    if ok {
        Verdict::Passed
    } else {
        Verdict::BuildFailed
    }
}
