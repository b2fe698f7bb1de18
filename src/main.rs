use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

use genforge::config::Config;
use genforge::llm::extract_detailed;
use genforge::pipeline::{Pipeline, PipelineReport};
use genforge::project::manifest::PackageManifest;
use genforge::project::materialize;
use genforge::repair::DependencyReconciler;

#[derive(Parser, Debug)]
#[command(
    name = "genforge",
    version,
    about = "Generate a project with an LLM, repair it, and verify it builds"
)]
struct Cli {
    /// Config file (defaults to <config dir>/genforge/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a project from a prompt, then repair and build it
    Generate(GenerateArgs),
    /// Re-run dependency/export repair and the build on existing projects
    Repair(RepairArgs),
    /// Recover file records from a saved model response
    Extract(ExtractArgs),
    /// Report packages imported but missing from package.json (no writes)
    ScanDeps(ScanDepsArgs),
    /// Show or initialize the config file
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Directory the project is written to
    #[arg(long)]
    project: PathBuf,
    #[arg(long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
    prompt: Option<String>,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    temperature: Option<f32>,
    /// Total completion attempts
    #[arg(long)]
    retries: Option<u32>,
    /// Skip install and build
    #[arg(long)]
    no_build: bool,
    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RepairArgs {
    #[arg(required = true)]
    projects: Vec<PathBuf>,
    #[arg(long)]
    no_build: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// File holding the raw model response
    file: PathBuf,
    /// Write the recovered files here instead of printing them
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ScanDepsArgs {
    #[arg(required = true)]
    projects: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print where the config file is read from
    Path,
    /// Write the effective config there (the API key is never written)
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("GENFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref());
    config.validate()?;

    match cli.command {
        Commands::Generate(args) => run_generate(config, args).await,
        Commands::Repair(args) => run_repair(config, args).await,
        Commands::Extract(args) => run_extract(args),
        Commands::ScanDeps(args) => run_scan_deps(config, args),
        Commands::Config(args) => run_config(&config, cli.config.as_deref(), args),
    }
}

async fn run_generate(mut config: Config, args: GenerateArgs) -> Result<()> {
    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file {}", path.display()))?,
        (None, None) => anyhow::bail!("Either --prompt or --prompt-file is required"),
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("Prompt is empty");
    }
    if let Some(max_tokens) = args.max_tokens {
        config.generation.max_tokens = max_tokens;
    }
    if let Some(temperature) = args.temperature {
        config.generation.temperature = temperature;
    }
    if let Some(retries) = args.retries {
        config.generation.retries = retries.max(1);
    }
    if config.api.api_key.is_none() {
        tracing::warn!("no API key set; requests are sent unauthenticated");
    }

    let mut pipeline = Pipeline::new(config)?;
    if args.no_build {
        pipeline = pipeline.without_build();
    }
    let report = pipeline.run(&prompt, &args.project).await;
    print_reports(std::slice::from_ref(&report), args.json)?;
    finish(&[report])
}

async fn run_repair(config: Config, args: RepairArgs) -> Result<()> {
    let mut pipeline = Pipeline::new(config)?;
    if args.no_build {
        pipeline = pipeline.without_build();
    }
    let mut reports = Vec::with_capacity(args.projects.len());
    for project in &args.projects {
        if !project.is_dir() {
            tracing::warn!(project = %project.display(), "not a directory; skipping");
            continue;
        }
        reports.push(pipeline.repair(project).await);
    }
    print_reports(&reports, args.json)?;
    finish(&reports)
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let outcome = extract_detailed(&text);
    let Some(strategy) = outcome.strategy else {
        anyhow::bail!("No files recovered from {}", args.file.display());
    };
    eprintln!(
        "Recovered {} file(s) via {}",
        outcome.files.len(),
        strategy.label()
    );

    match args.out {
        Some(out) => {
            let report = materialize(&out, &outcome.files)?;
            for path in &report.written {
                println!("{}", out.join(path).display());
            }
            for (path, reason) in &report.rejected {
                eprintln!("  skipped {}: {}", path, reason);
            }
        }
        None => println!("{}", serde_json::to_string_pretty(&outcome.files)?),
    }
    Ok(())
}

fn run_scan_deps(config: Config, args: ScanDepsArgs) -> Result<()> {
    let reconciler = DependencyReconciler::new(config.packages, config.tree);
    let mut failures = 0usize;
    for project in &args.projects {
        match scan_project(&reconciler, project) {
            Ok(lines) if lines.is_empty() => println!("{}: ok", project.display()),
            Ok(lines) => {
                println!("{}: {} missing", project.display(), lines.len());
                for line in lines {
                    println!("  {}", line);
                }
            }
            Err(err) => {
                failures += 1;
                eprintln!("{}: {:#}", project.display(), err);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} project(s) could not be scanned", failures);
    }
    Ok(())
}

fn scan_project(reconciler: &DependencyReconciler, project: &Path) -> Result<Vec<String>> {
    let manifest = PackageManifest::load(project)?;
    Ok(reconciler
        .plan(project, &manifest)
        .into_iter()
        .map(|p| {
            let section = if p.dev { " (dev)" } else { "" };
            format!("{}@{}{}", p.name, p.version, section)
        })
        .collect())
}

fn run_config(config: &Config, path: Option<&Path>, args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Path => {
            let location = path
                .map(|p| p.display().to_string())
                .unwrap_or_else(Config::config_location);
            println!("{}", location);
        }
        ConfigAction::Init { force } => {
            let target = path
                .map(Path::to_path_buf)
                .or_else(Config::config_path)
                .context("Could not determine config directory")?;
            if target.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    target.display()
                );
            }
            config.save(&target)?;
            println!("{}", target.display());
        }
    }
    Ok(())
}

fn print_reports(reports: &[PipelineReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    for report in reports {
        println!("{}", report.summary_line());
        if let Some(err) = &report.generation_error {
            println!("  generation: {}", err);
        }
        for note in &report.notes {
            println!("  note: {}", note);
        }
        if let Some(residual) = report.residual_error() {
            println!("  last build output:\n{}", residual);
        }
    }
    Ok(())
}

fn finish(reports: &[PipelineReport]) -> Result<()> {
    let failed = reports.iter().filter(|r| !r.verdict.is_success()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} run(s) did not pass", failed, reports.len());
    }
    Ok(())
}
