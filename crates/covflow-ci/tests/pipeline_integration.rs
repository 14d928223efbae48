//! Integration tests for the coverage pipeline with scripted commands and an
//! in-memory publisher.

use async_trait::async_trait;
use covflow_ci::fakes::{RecordingPublisher, Reply, ScriptedRunner};
use covflow_ci::{
    CommandOutput, CommandRunner, CommandSpec, CoveragePipeline, CoverageReport, PipelineConfig,
    PipelineState, ProcessRunner, PublishCredential, RunContext, RunEvent, Stage,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Tool output for a crate whose `classify` has one branch taken and one not.
const BRANCHY_LCOV: &str = "\
TN:
SF:src/lib.rs
FN:1,classify
FNDA:4,classify
DA:1,4
DA:2,4
DA:3,4
DA:4,0
DA:6,4
BRDA:2,0,0,4
BRDA:2,0,1,0
end_of_record
SF:tests/classify.rs
FN:3,positive
FNDA:4,positive
DA:3,4
DA:4,4
end_of_record
";

fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
    dir
}

/// A runner where the toolchain is present, tests pass and write profiles,
/// and the coverage tool emits `lcov`.
fn healthy_runner(lcov: &str) -> ScriptedRunner {
    ScriptedRunner::new()
        .on(
            &["rustup", "toolchain", "list"],
            Reply::ok().with_stdout(
                "stable-x86_64-unknown-linux-gnu (default)\nnightly-x86_64-unknown-linux-gnu\n",
            ),
        )
        .on(
            &["rustup", "component", "list"],
            Reply::ok()
                .with_stdout("cargo-x86_64-unknown-linux-gnu\nllvm-tools-x86_64-unknown-linux-gnu\n"),
        )
        .on(
            &["cargo", "test"],
            Reply::ok()
                .with_file("covflow-101-1a2b.profraw", "raw")
                .with_file("covflow-102-3c4d.profraw", "raw"),
        )
        .on(&["grcov"], Reply::ok().writes_output(lcov))
}

/// Aggregation runs, as opposed to `grcov --version` checks.
fn aggregations(runner: &ScriptedRunner) -> usize {
    runner
        .calls()
        .iter()
        .filter(|c| c.name == "aggregate")
        .count()
}

fn pipeline(
    dir: &Path,
    runner: Arc<dyn CommandRunner>,
    publisher: Arc<RecordingPublisher>,
) -> CoveragePipeline {
    CoveragePipeline::new(PipelineConfig::default(), dir, runner, publisher).unwrap()
}

fn context() -> RunContext {
    RunContext::new("0123abcd")
        .with_repository("octo/chain")
        .with_branch("feature/coverage")
        .with_run_id("42")
}

fn token() -> PublishCredential {
    PublishCredential::new("secret-token").unwrap()
}

/// Test: pull request on a feature branch runs every stage once and succeeds
#[tokio::test]
async fn test_pull_request_on_feature_branch_succeeds_once() {
    let dir = workspace();
    let runner = Arc::new(healthy_runner(BRANCHY_LCOV));
    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline = pipeline(dir.path(), runner.clone(), publisher.clone());

    let result = pipeline
        .run(&RunEvent::pull_request("feature/coverage"), &context(), token())
        .await;

    assert!(result.succeeded(), "run failed: {:?}", result.failure);
    assert_eq!(result.final_state, PipelineState::Succeeded);
    assert_eq!(result.exit_code(), 0);
    let stages: Vec<Stage> = result.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, Stage::ORDER.to_vec());
    assert_eq!(result.passed_count(), 5);

    assert_eq!(runner.count(&["cargo", "build"]), 1);
    assert_eq!(runner.count(&["cargo", "test"]), 1);
    assert_eq!(aggregations(&runner), 1);
    assert_eq!(runner.count(&["rustup", "toolchain", "install"]), 0);
    assert_eq!(runner.count(&["rustup", "component", "add"]), 0);

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(publisher.attempts(), 1);
    assert_eq!(published[0].context.commit, "0123abcd");

    let on_disk = std::fs::read_to_string(dir.path().join("lcov.info")).unwrap();
    assert_eq!(published[0].body, on_disk);
    assert_eq!(
        result.report_digest.as_deref(),
        Some(CoverageReport::parse(&on_disk).unwrap().digest().as_str())
    );
}

/// Test: build and test commands carry the instrumentation environment
#[tokio::test]
async fn test_instrumentation_environment() {
    let dir = workspace();
    let runner = Arc::new(healthy_runner(BRANCHY_LCOV));
    let pipeline = pipeline(dir.path(), runner.clone(), Arc::new(RecordingPublisher::new()));

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;
    assert!(result.succeeded());

    for call in runner
        .calls()
        .iter()
        .filter(|c| c.starts_with(&["cargo", "build"]) || c.starts_with(&["cargo", "test"]))
    {
        assert_eq!(
            call.env["RUSTFLAGS"],
            "-Cinstrument-coverage -Zcoverage-options=branch"
        );
        assert_eq!(call.env["LLVM_PROFILE_FILE"], "covflow-%p-%m.profraw");
        assert_eq!(call.env["RUSTUP_TOOLCHAIN"], "nightly");
        assert!(!call.env.values().any(|v| v.contains("secret-token")));
    }

    let build = &result.stages[1];
    assert_eq!(build.stage, Stage::Build);
    assert!(build.commands.iter().any(|c| c.starts_with("cargo build")));
}

/// Test: a failing test step ends the run and leaves no report file
#[tokio::test]
async fn test_failing_tests_leave_no_report() {
    let dir = workspace();
    std::fs::write(dir.path().join("lcov.info"), "SF:stale.rs\nend_of_record\n").unwrap();
    let runner = Arc::new(
        ScriptedRunner::new()
            .on(
                &["cargo", "test"],
                Reply::fail(101, "test tests::it_works ... FAILED")
                    .with_file("covflow-7-aa.profraw", "raw"),
            )
            .on(&["grcov"], Reply::ok().writes_output(BRANCHY_LCOV)),
    );
    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline = pipeline(dir.path(), runner.clone(), publisher.clone());

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;

    assert_eq!(result.final_state, PipelineState::Failed);
    assert_eq!(result.exit_code(), 30);
    let failure = result.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Some(Stage::Test));
    assert!(failure.message.contains("FAILED"));

    assert!(!dir.path().join("lcov.info").exists());
    assert_eq!(aggregations(&runner), 0);
    assert_eq!(publisher.attempts(), 0);
    assert!(result.report_digest.is_none());
}

/// Test: aggregating the same profiles twice yields byte-identical reports
#[tokio::test]
async fn test_aggregation_is_deterministic() {
    let dir = workspace();
    let runner = Arc::new(healthy_runner(BRANCHY_LCOV));
    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline = pipeline(dir.path(), runner, publisher);

    let first = pipeline.run(&RunEvent::push("main"), &context(), token()).await;
    let first_bytes = std::fs::read(dir.path().join("lcov.info")).unwrap();
    let second = pipeline.run(&RunEvent::push("main"), &context(), token()).await;
    let second_bytes = std::fs::read(dir.path().join("lcov.info")).unwrap();

    assert!(first.succeeded() && second.succeeded());
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.report_digest, second.report_digest);
}

/// Test: excluding `tests/*` removes test-fixture files from the report
#[tokio::test]
async fn test_tests_directory_excluded() {
    let dir = workspace();
    let runner = Arc::new(healthy_runner(BRANCHY_LCOV));
    let pipeline = pipeline(dir.path(), runner, Arc::new(RecordingPublisher::new()));

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;
    assert!(result.succeeded());

    let on_disk = std::fs::read_to_string(dir.path().join("lcov.info")).unwrap();
    assert!(on_disk.contains("SF:src/lib.rs"));
    assert!(!on_disk.contains("tests/classify.rs"));
    let summary = result.summary.unwrap();
    assert_eq!(summary.files.len(), 1);
    assert!(summary.file("tests/classify.rs").is_none());
}

/// Test: one branch always taken and one never taken gives 50% branch
/// coverage, with every line of the taken path executed
#[tokio::test]
async fn test_branch_coverage_end_to_end() {
    let dir = workspace();
    let runner = Arc::new(healthy_runner(BRANCHY_LCOV));
    let pipeline = pipeline(dir.path(), runner, Arc::new(RecordingPublisher::new()));

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;
    assert!(result.succeeded());

    let summary = result.summary.unwrap();
    let lib = summary.file("src/lib.rs").unwrap();
    assert_eq!(lib.branches_found, 2);
    assert_eq!(lib.branches_hit, 1);
    assert_eq!(lib.branch_percent(), Some(50.0));

    let report =
        CoverageReport::parse(&std::fs::read_to_string(dir.path().join("lcov.info")).unwrap())
            .unwrap();
    let lib = report.file("src/lib.rs").unwrap();
    let executed_path = [1u32, 2, 3, 6];
    assert!(executed_path.iter().all(|line| lib.lines[line] > 0));
    assert_eq!(lib.lines[&4], 0);
}

/// Test: a rejected upload fails the run once with the publish exit code
#[tokio::test]
async fn test_publish_failure_is_not_retried() {
    let dir = workspace();
    let runner = Arc::new(healthy_runner(BRANCHY_LCOV));
    let publisher = Arc::new(RecordingPublisher::failing("401 Unauthorized"));
    let pipeline = pipeline(dir.path(), runner, publisher.clone());

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;

    assert_eq!(result.final_state, PipelineState::Failed);
    assert_eq!(result.exit_code(), 50);
    assert_eq!(publisher.attempts(), 1);
    assert_eq!(result.failure.as_ref().unwrap().stage, Some(Stage::Publish));
    assert!(result.receipt.is_none());
    assert_eq!(result.passed_count(), 4);
}

/// Test: tests that leave no profiling artifacts fail aggregation
#[tokio::test]
async fn test_no_profile_data_fails_aggregation() {
    let dir = workspace();
    let runner = Arc::new(ScriptedRunner::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline = pipeline(dir.path(), runner.clone(), publisher.clone());

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;

    assert_eq!(result.final_state, PipelineState::Failed);
    assert_eq!(result.exit_code(), 40);
    let failure = result.failure.unwrap();
    assert_eq!(failure.stage, Some(Stage::Aggregate));
    assert!(failure.message.contains("no profiling artifacts"));
    assert_eq!(aggregations(&runner), 0);
    assert_eq!(publisher.attempts(), 0);
}

/// Test: an unavailable component fails provisioning before any build
#[tokio::test]
async fn test_unavailable_component_fails_provisioning() {
    let dir = workspace();
    let runner = Arc::new(
        ScriptedRunner::new()
            .on(
                &["rustup", "toolchain", "list"],
                Reply::ok().with_stdout("nightly-x86_64-unknown-linux-gnu\n"),
            )
            .on(
                &["rustup", "component", "add"],
                Reply::fail(1, "error: component 'llvm-tools' is unavailable"),
            ),
    );
    let pipeline = pipeline(dir.path(), runner.clone(), Arc::new(RecordingPublisher::new()));

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;

    assert_eq!(result.exit_code(), 10);
    assert_eq!(result.stages.len(), 1);
    assert_eq!(runner.count(&["rustup", "component", "add"]), 1);
    assert_eq!(runner.count(&["cargo", "build"]), 0);
}

/// Test: tag pushes and unknown events are skipped without running anything
#[tokio::test]
async fn test_tag_push_skipped() {
    let dir = workspace();
    let runner = Arc::new(healthy_runner(BRANCHY_LCOV));
    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline = pipeline(dir.path(), runner.clone(), publisher.clone());

    let result = pipeline
        .run(&RunEvent::push("refs/tags/v1.0.0"), &context(), token())
        .await;

    assert_eq!(result.final_state, PipelineState::Skipped);
    assert_eq!(result.exit_code(), 0);
    assert!(runner.calls().is_empty());
    assert_eq!(publisher.attempts(), 0);
}

/// A runner whose `cargo build` never finishes in time.
struct StalledBuild;

#[async_trait]
impl CommandRunner for StalledBuild {
    async fn run(&self, spec: &CommandSpec) -> covflow_ci::Result<CommandOutput> {
        if spec.starts_with(&["cargo", "build"]) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(CommandOutput {
            name: spec.name.clone(),
            exit_code: 0,
            stdout: "nightly-x86_64-unknown-linux-gnu\nllvm-tools-x86_64-unknown-linux-gnu\n"
                .to_string(),
            stderr: String::new(),
            duration_ms: 0,
            success: true,
        })
    }
}

/// Test: exceeding the run timeout fails the stage in flight
#[tokio::test(start_paused = true)]
async fn test_run_timeout_fails_in_flight_stage() {
    let dir = workspace();
    let config = PipelineConfig {
        run_timeout_secs: Some(60),
        ..PipelineConfig::default()
    };
    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline =
        CoveragePipeline::new(config, dir.path(), Arc::new(StalledBuild), publisher.clone())
            .unwrap();

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;

    assert_eq!(result.final_state, PipelineState::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.stage, Some(Stage::Build));
    assert!(failure.message.contains("timed out"));
    assert_eq!(publisher.attempts(), 0);
}

/// Lets the coverage tool write part of its output, then hangs.
struct StalledAggregation(ScriptedRunner);

#[async_trait]
impl CommandRunner for StalledAggregation {
    async fn run(&self, spec: &CommandSpec) -> covflow_ci::Result<CommandOutput> {
        let output = self.0.run(spec).await?;
        if spec.name == "aggregate" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(output)
    }
}

/// Test: a run timeout during aggregation leaves no partial report behind
#[tokio::test(start_paused = true)]
async fn test_run_timeout_during_aggregation_leaves_no_report() {
    let dir = workspace();
    let config = PipelineConfig {
        run_timeout_secs: Some(60),
        ..PipelineConfig::default()
    };
    let runner = StalledAggregation(healthy_runner("SF:src/lib.rs\nDA:1,"));
    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline =
        CoveragePipeline::new(config, dir.path(), Arc::new(runner), publisher.clone()).unwrap();

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;

    assert_eq!(result.final_state, PipelineState::Failed);
    let failure = result.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Some(Stage::Aggregate));
    assert!(failure.message.contains("timed out"));
    assert!(result.report_path.is_none());
    assert!(!dir.path().join("lcov.info").exists());
    assert!(!dir.path().join("lcov.info.raw").exists());
    assert_eq!(publisher.attempts(), 0);
}

fn copy_dir(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// Test: real toolchain run over the `branchy` fixture crate
///
/// Needs rustup, network access for the nightly toolchain and `grcov`.
#[tokio::test]
#[ignore]
async fn test_real_toolchain_branch_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/branchy");
    copy_dir(&fixture, dir.path());

    let publisher = Arc::new(RecordingPublisher::new());
    let pipeline = CoveragePipeline::new(
        PipelineConfig::default(),
        dir.path(),
        Arc::new(ProcessRunner),
        publisher.clone(),
    )
    .unwrap();

    let result = pipeline.run(&RunEvent::push("main"), &context(), token()).await;
    assert!(result.succeeded(), "run failed: {:?}", result.failure);

    let summary = result.summary.unwrap();
    let lib = summary.file("src/lib.rs").expect("src/lib.rs in report");
    assert_eq!(lib.branch_percent(), Some(50.0));
    assert_eq!(publisher.published().len(), 1);
}
