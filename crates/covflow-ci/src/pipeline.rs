//! Coverage pipeline orchestration.
//!
//! Stages run strictly in order. Every stage outcome is fed through
//! [`PipelineState::advance`], and the first failure ends the run.

use crate::build::{resolve, BuildTestOrchestrator};
use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::coverage::aggregator::discard_outputs;
use crate::coverage::{CoverageAggregator, CoverageSummary};
use crate::credential::PublishCredential;
use crate::error::{PipelineError, Result};
use crate::publish::{PublishReceipt, Publisher};
use crate::runner::{CommandOutput, CommandRunner};
use crate::stage::{CommandSpec, Stage};
use crate::state::{PipelineState, StepOutcome};
use crate::toolchain::ToolchainProvisioner;
use crate::trigger::RunEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What happened in one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Commands issued during the stage, in order.
    pub commands: Vec<String>,

    pub success: bool,
    pub error: Option<String>,
}

/// The stage that ended the run and why.
#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    /// `None` when the run failed between stages (e.g. run timeout).
    pub stage: Option<Stage>,
    pub message: String,
    pub exit_code: i32,
}

/// Result of a complete pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub event: RunEvent,
    pub final_state: PipelineState,

    /// Records of the stages that ran.
    pub stages: Vec<StageRecord>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// Location of the written report, once aggregation succeeded.
    pub report_path: Option<PathBuf>,

    /// SHA-256 of the written report.
    pub report_digest: Option<String>,

    pub summary: Option<CoverageSummary>,
    pub receipt: Option<PublishReceipt>,
    pub failure: Option<StageFailure>,
}

impl PipelineResult {
    pub fn succeeded(&self) -> bool {
        self.final_state == PipelineState::Succeeded
    }

    pub fn skipped(&self) -> bool {
        self.final_state == PipelineState::Skipped
    }

    /// Process exit status for this result.
    pub fn exit_code(&self) -> i32 {
        match self.final_state {
            PipelineState::Succeeded | PipelineState::Skipped => 0,
            _ => self.failure.as_ref().map_or(1, |f| f.exit_code),
        }
    }

    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.success).count()
    }

    /// Number of stages that failed.
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.success).count()
    }
}

/// Runs trigger evaluation and the five stages for one event.
pub struct CoveragePipeline {
    config: PipelineConfig,
    work_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    publisher: Arc<dyn Publisher>,
}

impl CoveragePipeline {
    /// Create a pipeline over `work_dir`. The configuration is validated here
    /// so a bad config never reaches a stage.
    pub fn new(
        config: PipelineConfig,
        work_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            work_dir: work_dir.into(),
            runner,
            publisher,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The `Skipped` result for `event` when no trigger rule matches it.
    ///
    /// Needs no credential, so callers can settle a skip before resolving one.
    pub fn skipped(&self, event: &RunEvent, context: &RunContext) -> Option<PipelineResult> {
        if self.config.trigger.should_run(event) {
            return None;
        }
        let mut progress = Progress::default();
        progress.state = progress.state.skip();
        info!(run_id = %context.run_id, "No trigger rule matched; run skipped");
        Some(progress.into_result(context, event, Instant::now()))
    }

    /// Execute one run for `event`.
    ///
    /// Never returns an error: every failure is captured in the returned
    /// [`PipelineResult`] with `final_state == Failed`. The credential is
    /// consumed and dropped once the publish stage ends, or as soon as the
    /// run stops before reaching it.
    pub async fn run(
        &self,
        event: &RunEvent,
        context: &RunContext,
        credential: PublishCredential,
    ) -> PipelineResult {
        let start = Instant::now();
        let mut progress = Progress::default();

        info!(
            run_id = %context.run_id,
            event = %event.kind,
            git_ref = %event.git_ref,
            "Evaluating trigger"
        );
        if let Some(result) = self.skipped(event, context) {
            drop(credential);
            return result;
        }
        progress.state = progress.state.advance(StepOutcome::Succeeded);

        let outcome = match self.config.run_timeout_secs {
            Some(secs) => {
                let drive = self.drive(&mut progress, context, credential);
                match tokio::time::timeout(Duration::from_secs(secs), drive).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PipelineError::Timeout {
                        what: "pipeline run".to_string(),
                        timeout_secs: secs,
                    }),
                }
            }
            None => self.drive(&mut progress, context, credential).await,
        };

        // Stage failures have already moved the state to Failed; anything
        // else (the run timeout) is charged to the stage in flight. A dropped
        // aggregation never got to clean up after the tool.
        if let Err(e) = outcome {
            if !progress.state.is_terminal() {
                if progress.state == PipelineState::Aggregating {
                    let report_path = &self.config.aggregation.report_path;
                    discard_outputs(&resolve(&self.work_dir, report_path));
                }
                progress.abort(e);
            }
        }

        let result = progress.into_result(context, event, start);
        match &result.failure {
            None => info!(
                run_id = %result.run_id,
                duration_ms = result.duration_ms,
                digest = result.report_digest.as_deref().unwrap_or("-"),
                "Coverage pipeline succeeded"
            ),
            Some(failure) => error!(
                run_id = %result.run_id,
                stage = failure.stage.map(|s| s.name()).unwrap_or("-"),
                exit_code = failure.exit_code,
                error = %failure.message,
                "Coverage pipeline failed"
            ),
        }
        result
    }

    async fn drive(
        &self,
        progress: &mut Progress,
        context: &RunContext,
        credential: PublishCredential,
    ) -> Result<()> {
        let logged = progress.tracker.attach(self.runner.clone());
        let runner: &dyn CommandRunner = &*logged;
        let timeout = self.config.stage_timeout_secs;
        let channel = self.config.toolchain.channel.as_str();

        progress.begin();
        let provisioner = ToolchainProvisioner::new(runner, &self.work_dir, timeout);
        let provisioned = provisioner.provision(&self.config.toolchain).await;
        progress.complete(provisioned)?;

        let orchestrator = BuildTestOrchestrator::new(
            runner,
            &self.work_dir,
            &self.config.instrumentation,
            timeout,
        )
        .with_channel(channel);

        progress.begin();
        let built = match orchestrator.prepare(&self.config.aggregation.report_path) {
            Ok(()) => orchestrator.build().await.map(|_| ()),
            Err(e) => Err(e),
        };
        progress.complete(built)?;

        progress.begin();
        let tested = orchestrator.test().await;
        let profile = progress.complete(tested)?;

        let aggregator = CoverageAggregator::new(
            runner,
            self.config.toolchain.instrumentation_tool.as_str(),
            &self.work_dir,
            &self.config.aggregation,
            timeout,
        )
        .with_channel(channel);

        progress.begin();
        let aggregated = aggregator.aggregate(profile).await;
        let report = progress.complete(aggregated)?;
        progress.report_path = Some(aggregator.report_path());
        progress.report_digest = Some(report.digest());
        progress.summary = Some(report.summary());

        progress.begin();
        let published = self.publisher.publish(report, &credential, context).await;
        drop(credential);
        debug!("Publish credential released");
        progress.receipt = Some(progress.complete(published)?);
        Ok(())
    }
}

/// Mutable state of one run: the state machine plus what it produced.
#[derive(Default)]
struct Progress {
    state: PipelineState,
    stage_start: Option<(DateTime<Utc>, Instant)>,
    tracker: CommandLog,
    records: Vec<StageRecord>,
    report_path: Option<PathBuf>,
    report_digest: Option<String>,
    summary: Option<CoverageSummary>,
    receipt: Option<PublishReceipt>,
    failure: Option<StageFailure>,
}

impl Progress {
    /// Mark the start of the stage the current state executes.
    fn begin(&mut self) {
        self.stage_start = Some((Utc::now(), Instant::now()));
        self.tracker.clear();
        if let Some(stage) = self.state.stage() {
            info!(stage = %stage, state = %self.state, "Stage started");
        }
    }

    /// Record the outcome of the current stage and take the transition.
    fn complete<T>(&mut self, result: Result<T>) -> Result<T> {
        let Some(stage) = self.state.stage() else {
            return result;
        };
        let (started_at, started) = self
            .stage_start
            .take()
            .unwrap_or_else(|| (Utc::now(), Instant::now()));
        let duration_ms = started.elapsed().as_millis() as u64;
        let commands = self.tracker.take();

        match &result {
            Ok(_) => {
                self.state = self.state.advance(StepOutcome::Succeeded);
                info!(stage = %stage, duration_ms, next = %self.state, "Stage passed");
                self.records.push(StageRecord {
                    stage,
                    started_at,
                    duration_ms,
                    commands,
                    success: true,
                    error: None,
                });
            }
            Err(e) => {
                self.state = self.state.advance(StepOutcome::Failed);
                warn!(stage = %stage, duration_ms, error = %e, "Stage failed");
                self.records.push(StageRecord {
                    stage,
                    started_at,
                    duration_ms,
                    commands,
                    success: false,
                    error: Some(e.to_string()),
                });
                self.failure = Some(StageFailure {
                    stage: Some(stage),
                    message: e.to_string(),
                    exit_code: e.exit_code(),
                });
            }
        }
        result
    }

    /// Fail the run with `err`, outside of a stage's own result.
    fn abort(&mut self, err: PipelineError) {
        if self.state.stage().is_some() {
            let _ = self.complete::<()>(Err(err));
        } else {
            self.state = self.state.advance(StepOutcome::Failed);
            self.failure = Some(StageFailure {
                stage: None,
                message: err.to_string(),
                exit_code: err.exit_code(),
            });
        }
    }

    fn into_result(self, context: &RunContext, event: &RunEvent, start: Instant) -> PipelineResult {
        PipelineResult {
            run_id: context.run_id.clone(),
            event: event.clone(),
            final_state: self.state,
            stages: self.records,
            duration_ms: start.elapsed().as_millis() as u64,
            report_path: self.report_path,
            report_digest: self.report_digest,
            summary: self.summary,
            receipt: self.receipt,
            failure: self.failure,
        }
    }
}

/// Shared log of the commands issued through a [`LoggingRunner`].
#[derive(Default, Clone)]
struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    fn attach(&self, inner: Arc<dyn CommandRunner>) -> Arc<LoggingRunner> {
        Arc::new(LoggingRunner {
            inner,
            log: self.clone(),
        })
    }

    fn push(&self, command: String) {
        if let Ok(mut log) = self.0.lock() {
            log.push(command);
        }
    }

    fn take(&self) -> Vec<String> {
        self.0
            .lock()
            .map(|mut log| std::mem::take(&mut *log))
            .unwrap_or_default()
    }

    fn clear(&self) {
        self.take();
    }
}

/// Forwards to another runner and notes every command line.
struct LoggingRunner {
    inner: Arc<dyn CommandRunner>,
    log: CommandLog,
}

#[async_trait]
impl CommandRunner for LoggingRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.log.push(spec.display());
        self.inner.run(spec).await
    }
}
