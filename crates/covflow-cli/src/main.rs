//! covflow - code coverage pipeline CLI
//!
//! The `covflow` command builds and tests a Rust project under LLVM
//! instrumentation and publishes the resulting LCOV report.
//!
//! ## Commands
//!
//! - `run`: evaluate the trigger and run every stage
//! - `should-run`: print whether an event would start a run
//! - `provision`: install the toolchain, components and coverage tool
//! - `aggregate`: turn existing profiling artifacts into a report
//! - `publish`: upload an existing report
//! - `summary`: print the coverage percentages of a report

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use covflow_ci::{
    default_level, init_tracing, CodecovPublisher, CoverageAggregator, CoveragePipeline,
    CoverageReport, EventKind, PipelineConfig, PipelineError, PipelineResult, ProcessRunner,
    ProfileData, PublishCredential, Publisher, RunContext, RunEvent, ToolchainProvisioner,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "covflow")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Code coverage pipeline for Rust projects", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (JSON)
    #[arg(short, long, global = true, env = "COVFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Project directory
    #[arg(short = 'C', long, global = true, default_value = ".")]
    work_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline for one event
    Run {
        #[command(flatten)]
        event: EventArgs,

        #[command(flatten)]
        overrides: Overrides,

        #[command(flatten)]
        publish: PublishArgs,

        /// Timeout for the whole run in seconds
        #[arg(long)]
        run_timeout: Option<u64>,

        /// Write the run result as JSON to this path
        #[arg(long)]
        json_result: Option<PathBuf>,
    },

    /// Print `true` if the event would start a run, `false` otherwise
    ShouldRun {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Install the toolchain, components and coverage tool if missing
    Provision {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Aggregate existing profiling artifacts into a report
    Aggregate {
        #[command(flatten)]
        overrides: Overrides,

        /// Directory searched for *.profraw files (default: project directory)
        #[arg(long)]
        profile_dir: Option<PathBuf>,
    },

    /// Upload an existing report
    Publish {
        /// Report to upload
        #[arg(default_value = "lcov.info")]
        report: PathBuf,

        #[command(flatten)]
        publish: PublishArgs,
    },

    /// Print line, branch and function coverage of a report
    Summary {
        /// LCOV report
        #[arg(default_value = "lcov.info")]
        report: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
}

#[derive(Args, Debug)]
struct EventArgs {
    /// Triggering event (push, pull_request, ...)
    #[arg(long, env = "GITHUB_EVENT_NAME", default_value = "push")]
    event: String,

    /// Branch or git ref of the event
    #[arg(long = "ref", env = "GITHUB_REF")]
    git_ref: String,
}

impl EventArgs {
    fn to_event(&self) -> RunEvent {
        RunEvent::new(EventKind::parse(&self.event), self.git_ref.clone())
    }
}

/// Flags layered over the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Toolchain channel (e.g. nightly-2024-05-01)
    #[arg(long)]
    channel: Option<String>,

    /// Glob excluded from the report; repeatable, replaces the configured list
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Report output path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Per-command timeout in seconds
    #[arg(long)]
    stage_timeout: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(channel) = &self.channel {
            config.toolchain.channel = channel.clone();
        }
        if !self.excludes.is_empty() {
            config.aggregation.excludes = self.excludes.clone();
        }
        if let Some(report) = &self.report {
            config.aggregation.report_path = report.clone();
        }
        if let Some(secs) = self.stage_timeout {
            config.stage_timeout_secs = secs;
        }
    }
}

#[derive(Args, Debug, Default)]
struct PublishArgs {
    /// Upload token (falls back to the configured token variable)
    #[arg(long, env = "CODECOV_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base URL of the coverage service
    #[arg(long)]
    base_url: Option<String>,

    /// Commit SHA to report against (detected when omitted)
    #[arg(long)]
    commit: Option<String>,

    /// Upload flag; repeatable
    #[arg(long = "flag")]
    flags: Vec<String>,
}

impl PublishArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(url) = &self.base_url {
            config.publish.base_url = url.clone();
        }
        if !self.flags.is_empty() {
            config.publish.flags = self.flags.clone();
        }
    }

    fn credential(&self, config: &PipelineConfig) -> Result<PublishCredential> {
        let credential = match &self.token {
            Some(token) => PublishCredential::new(token.clone()),
            None => PublishCredential::from_env(&config.publish.token_env),
        };
        credential.context("No upload token available")
    }

    fn context(&self, work_dir: &Path) -> RunContext {
        let mut context = RunContext::detect(work_dir);
        if let Some(commit) = &self.commit {
            context.commit = commit.clone();
        }
        context
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json, default_level(cli.verbose));

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let config_path = cli.config.as_deref();
    let work_dir = cli.work_dir.as_path();

    match cli.command {
        Commands::Run {
            event,
            overrides,
            publish,
            run_timeout,
            json_result,
        } => {
            let mut config = load_config(config_path, &overrides)?;
            publish.apply(&mut config);
            if run_timeout.is_some() {
                config.run_timeout_secs = run_timeout;
            }
            cmd_run(
                work_dir,
                config,
                &event.to_event(),
                &publish,
                json_result.as_deref(),
            )
            .await
        }
        Commands::ShouldRun { event } => {
            let config = load_config(config_path, &Overrides::default())?;
            cmd_should_run(&config, &event.to_event())
        }
        Commands::Provision { overrides } => {
            let config = load_config(config_path, &overrides)?;
            cmd_provision(work_dir, &config).await
        }
        Commands::Aggregate {
            overrides,
            profile_dir,
        } => {
            let config = load_config(config_path, &overrides)?;
            cmd_aggregate(work_dir, &config, profile_dir.as_deref()).await
        }
        Commands::Publish { report, publish } => {
            let mut config = load_config(config_path, &Overrides::default())?;
            publish.apply(&mut config);
            cmd_publish(work_dir, &config, &report, &publish).await
        }
        Commands::Summary { report, format } => cmd_summary(work_dir, &report, format),
    }
}

/// Defaults, then the optional file, then flags.
fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    overrides.apply(&mut config);
    config
        .validate()
        .context("Invalid configuration after applying flags")?;
    Ok(config)
}

/// Exit status for an error: the pipeline's code when one is in the chain.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map_or(1, |e| exit_status(e.exit_code()))
}

fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

async fn cmd_run(
    work_dir: &Path,
    config: PipelineConfig,
    event: &RunEvent,
    publish: &PublishArgs,
    json_result: Option<&Path>,
) -> Result<u8> {
    let context = publish.context(work_dir);
    let publisher = CodecovPublisher::new(config.publish.clone())
        .context("Failed to create upload client")?;
    let pipeline = CoveragePipeline::new(
        config,
        work_dir,
        Arc::new(ProcessRunner),
        Arc::new(publisher),
    )?;

    // A skipped run never uploads, so it must not depend on the token.
    if let Some(result) = pipeline.skipped(event, &context) {
        print_result(&result);
        write_result(json_result, &result)?;
        return Ok(0);
    }
    let credential = publish.credential(pipeline.config())?;

    println!("Running coverage pipeline in {}", work_dir.display());
    println!("Event: {} {}", event.kind, event.git_ref);
    println!("Commit: {}", context.commit);
    println!();

    let result = pipeline.run(event, &context, credential).await;
    print_result(&result);
    write_result(json_result, &result)?;
    Ok(exit_status(result.exit_code()))
}

fn write_result(path: Option<&Path>, result: &PipelineResult) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Run result written");
    Ok(())
}

fn print_result(result: &PipelineResult) {
    println!("Run ID: {}", result.run_id);
    println!("Status: {}", result.final_state);
    println!("Duration: {}ms", result.duration_ms);

    if result.skipped() {
        println!("\nNo trigger rule matched; nothing to do.");
        return;
    }

    println!();
    for stage in &result.stages {
        let status = if stage.success { "✓" } else { "✗" };
        println!("  {} {} ({}ms)", status, stage.stage, stage.duration_ms);
    }
    println!();

    if let Some(summary) = &result.summary {
        println!("{summary}");
        println!();
    }
    if let Some(digest) = &result.report_digest {
        println!("Report digest: {digest}");
    }
    if let Some(url) = result.receipt.as_ref().and_then(|r| r.report_url.as_deref()) {
        println!("Report URL: {url}");
    }
    if let Some(failure) = &result.failure {
        let stage = failure.stage.map_or("run", |s| s.name());
        println!("✗ Failed in {stage}: {}", failure.message);
    } else {
        println!("✓ Coverage published");
    }
}

fn cmd_should_run(config: &PipelineConfig, event: &RunEvent) -> Result<u8> {
    let decision = config.trigger.should_run(event);
    info!(event = %event.kind, git_ref = %event.git_ref, decision, "Trigger evaluated");
    println!("{decision}");
    Ok(0)
}

async fn cmd_provision(work_dir: &Path, config: &PipelineConfig) -> Result<u8> {
    let runner = ProcessRunner;
    let provisioner = ToolchainProvisioner::new(&runner, work_dir, config.stage_timeout_secs);
    let report = provisioner.provision(&config.toolchain).await?;

    if !report.changed() {
        println!("Toolchain {} already provisioned", config.toolchain.channel);
        return Ok(0);
    }
    if report.installed_toolchain {
        println!("Installed toolchain {}", config.toolchain.channel);
    }
    for component in &report.installed_components {
        println!("Added component {component}");
    }
    if report.installed_tool {
        println!("Installed {}", config.toolchain.instrumentation_tool);
    }
    Ok(0)
}

async fn cmd_aggregate(
    work_dir: &Path,
    config: &PipelineConfig,
    profile_dir: Option<&Path>,
) -> Result<u8> {
    let search_root = profile_dir.unwrap_or(work_dir);
    let profile = ProfileData::discover(search_root)
        .with_context(|| format!("Failed to scan {}", search_root.display()))?;

    let runner = ProcessRunner;
    let aggregator = CoverageAggregator::new(
        &runner,
        config.toolchain.instrumentation_tool.as_str(),
        work_dir,
        &config.aggregation,
        config.stage_timeout_secs,
    )
    .with_channel(config.toolchain.channel.as_str());
    let report = aggregator.aggregate(profile).await?;

    println!("{}", report.summary());
    println!();
    println!("Report: {}", aggregator.report_path().display());
    println!("Digest: {}", report.digest());
    Ok(0)
}

fn read_report(path: &Path) -> Result<CoverageReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    let report = CoverageReport::parse(&content)
        .map_err(PipelineError::from)
        .with_context(|| format!("Failed to parse report {}", path.display()))?;
    Ok(report)
}

async fn cmd_publish(
    work_dir: &Path,
    config: &PipelineConfig,
    report_path: &Path,
    publish: &PublishArgs,
) -> Result<u8> {
    let report = read_report(&work_dir.join(report_path))?;
    let credential = publish.credential(config)?;
    let context = publish.context(work_dir);

    let publisher = CodecovPublisher::new(config.publish.clone())
        .context("Failed to create upload client")?;
    let receipt = publisher.publish(report, &credential, &context).await?;
    drop(credential);

    println!("✓ Uploaded {} bytes for commit {}", receipt.bytes, context.commit);
    if let Some(url) = &receipt.report_url {
        println!("Report URL: {url}");
    }
    Ok(0)
}

fn cmd_summary(work_dir: &Path, report_path: &Path, format: Format) -> Result<u8> {
    let summary = read_report(&work_dir.join(report_path))?.summary();
    match format {
        Format::Table => println!("{summary}"),
        Format::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(0)
}
