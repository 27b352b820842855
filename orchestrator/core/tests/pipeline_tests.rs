// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::Mutex;
use stagegate_core::domain::collaborators::{RiskAssessment, RiskEngine, RiskEngineError, RiskOutcomes, RiskScenario};
use stagegate_core::domain::config::PipelineSettings;
use stagegate_core::domain::events::{EventPublisher, PipelineEvent};
use stagegate_core::domain::repository::{RepositoryError, RunLock, RunRepository};
use stagegate_core::domain::results::{ArenaResult, JudgeResult};
use stagegate_core::domain::run::{RiskLevel, Run, RunId, RunRequest, RunStatus};
use stagegate_core::domain::stage::{StageName, StageOutput, StageStatus};
use stagegate_core::infrastructure::event_bus::EventBus;
use stagegate_core::infrastructure::repositories::InMemoryRunRepository;
use stagegate_core::{Approval, PipelineError, PipelineOptions, PipelineService};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mock risk engines
// ============================================================================

/// Returns a fixed confidence and remembers the scenarios it was asked about.
struct FixedRiskEngine {
    confidence: Option<f64>,
    seen: Mutex<Vec<(RiskScenario, u32)>>,
}

impl FixedRiskEngine {
    fn new(confidence: Option<f64>) -> Self {
        Self {
            confidence,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RiskEngine for FixedRiskEngine {
    async fn run_full_cycle(&self, scenario: &RiskScenario, sample_count: u32) -> Result<RiskAssessment, RiskEngineError> {
        self.seen.lock().push((scenario.clone(), sample_count));
        Ok(RiskAssessment {
            scenario: scenario.name.clone(),
            iterations: sample_count,
            seed: None,
            outcomes: RiskOutcomes {
                success: sample_count,
                partial: 0,
                failure: 0,
            },
            confidence: self.confidence,
            failure_rate: Some(0.0),
            risk_grade: Some("GREEN".to_string()),
        })
    }
}

struct BrokenRiskEngine;

#[async_trait]
impl RiskEngine for BrokenRiskEngine {
    async fn run_full_cycle(&self, _scenario: &RiskScenario, _sample_count: u32) -> Result<RiskAssessment, RiskEngineError> {
        Err(RiskEngineError::Unavailable("simulator offline".to_string()))
    }
}

/// Sleeps inside MONTE_CARLO and tracks how many calls overlap.
#[derive(Default)]
struct SlowRiskEngine {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl RiskEngine for SlowRiskEngine {
    async fn run_full_cycle(&self, scenario: &RiskScenario, sample_count: u32) -> Result<RiskAssessment, RiskEngineError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(RiskAssessment {
            scenario: scenario.name.clone(),
            iterations: sample_count,
            seed: None,
            outcomes: RiskOutcomes::default(),
            confidence: Some(90.0),
            failure_rate: None,
            risk_grade: None,
        })
    }
}

// ============================================================================
// Mock repository
// ============================================================================

/// In-memory registry that can fail one chosen save and keeps the latest
/// snapshot it accepted.
struct FlakyRepository {
    inner: InMemoryRunRepository,
    fail_on: Option<usize>,
    saves: AtomicUsize,
    last: Mutex<Option<Run>>,
}

impl FlakyRepository {
    fn failing_save(n: usize) -> Self {
        Self {
            fail_on: Some(n),
            ..Self::reliable()
        }
    }

    fn reliable() -> Self {
        Self {
            inner: InMemoryRunRepository::new(16),
            fail_on: None,
            saves: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RunRepository for FlakyRepository {
    async fn save(&self, run: &Run) -> Result<(), RepositoryError> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if Some(n) == self.fail_on {
            return Err(RepositoryError::Backend("blip".to_string()));
        }
        self.inner.save(run).await?;
        *self.last.lock() = Some(run.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn list_all(&self) -> Result<Vec<Run>, RepositoryError> {
        self.inner.list_all().await
    }

    async fn lock_for(&self, id: RunId) -> Result<Option<RunLock>, RepositoryError> {
        self.inner.lock_for(id).await
    }
}

/// Records, for every `stage:completed`, the stage status in the latest
/// stored snapshot at the moment the event is published.
struct SnapshotWatcher {
    repository: Arc<FlakyRepository>,
    observed: Mutex<Vec<(StageName, Option<StageStatus>)>>,
}

impl EventPublisher for SnapshotWatcher {
    fn publish(&self, event: PipelineEvent) {
        if let PipelineEvent::StageCompleted { stage, .. } = event {
            let stored = self.repository.last.lock().as_ref().map(|run| run.stage(stage).status());
            self.observed.lock().push((stage, stored));
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn pipeline_with_bus(options: PipelineOptions) -> (PipelineService, EventBus) {
    let bus = EventBus::new(256);
    let pipeline = PipelineService::new(options.with_publisher(Arc::new(bus.clone())));
    (pipeline, bus)
}

async fn run_to_end(pipeline: &PipelineService, request: RunRequest) -> Run {
    let run = pipeline.create_run(request).await.unwrap();
    pipeline.execute(run.id).await.unwrap()
}

fn arena_of(run: &Run) -> &ArenaResult {
    match run.output_of(StageName::Arena) {
        Some(StageOutput::Arena(arena)) => arena,
        other => panic!("no arena result: {:?}", other),
    }
}

fn judge_of(run: &Run) -> &JudgeResult {
    match run.output_of(StageName::Judge) {
        Some(StageOutput::Judge(judge)) => judge,
        other => panic!("no judge result: {:?}", other),
    }
}

fn statuses(run: &Run) -> Vec<StageStatus> {
    run.stages().iter().map(|s| s.status()).collect()
}

fn kinds(events: &[PipelineEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

// ============================================================================
// Determinism
// ============================================================================

#[tokio::test]
async fn test_same_seed_reproduces_arena_and_judge() {
    let pipeline = PipelineService::new(PipelineOptions::default());
    let request = RunRequest::task("refactor X").with_task_type("code").with_seed(42);

    let first = run_to_end(&pipeline, request.clone()).await;
    let second = run_to_end(&pipeline, request).await;

    assert_ne!(first.id, second.id);
    assert_eq!(arena_of(&first), arena_of(&second));
    assert_eq!(judge_of(&first), judge_of(&second));
}

#[tokio::test]
async fn test_different_seeds_change_arena_scores() {
    let pipeline = PipelineService::new(PipelineOptions::default());
    let a = run_to_end(&pipeline, RunRequest::task("t").with_task_type("code").with_seed(1)).await;
    let b = run_to_end(&pipeline, RunRequest::task("t").with_task_type("code").with_seed(2)).await;

    let scores = |run: &Run| arena_of(run).entries.iter().map(|e| e.score).collect::<Vec<_>>();
    assert_ne!(scores(&a), scores(&b));
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_low_risk_code_task_completes() {
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default());
    let mut events = bus.subscribe();

    let run = run_to_end(
        &pipeline,
        RunRequest::task("refactor X")
            .with_task_type("code")
            .with_risk_level(RiskLevel::Low),
    )
    .await;

    assert_eq!(run.status(), RunStatus::Completed);
    assert!(run.finished_at().is_some());

    let pool = ["HeadyCoder", "HeadyJules", "HeadyBuilder", "HeadyPythia"];
    match run.output_of(StageName::Triage) {
        Some(StageOutput::Triage(triage)) => assert_eq!(triage.node_pool, pool),
        other => panic!("no triage result: {:?}", other),
    }
    let arena = arena_of(&run);
    assert!(pool.contains(&arena.winner.node.as_str()));
    assert!((60.0..100.0).contains(&arena.winner.score));

    match run.output_of(StageName::Verify) {
        Some(StageOutput::Verification(verify)) => {
            assert!(verify.passed);
            assert_eq!(verify.confidence, 85.0);
        }
        other => panic!("no verification result: {:?}", other),
    }

    let receipt = run.result().expect("receipt");
    assert_eq!(receipt.run_id, run.id);
    assert_eq!(receipt.seed, run.seed());
    assert_eq!(receipt.winner, judge_of(&run).winner);
    assert_eq!(receipt.confidence, None);
    assert_eq!(receipt.stages.len(), 9);
    for (entry, stage) in receipt.stages.iter().zip(&run.stages()[..8]) {
        assert_eq!(entry.name, stage.name);
        assert_eq!(entry.status, StageStatus::Completed);
        assert_eq!(entry.duration_ms, stage.duration_ms());
    }
    // RECEIPT summarises itself while it is still running.
    assert_eq!(receipt.stages[8].status, StageStatus::Running);

    let events = events.drain();
    let mut expected = vec!["run:created", "run:started"];
    for _ in 0..9 {
        expected.extend(["stage:started", "stage:completed"]);
    }
    expected.push("run:completed");
    assert_eq!(kinds(&events), expected);
    assert!(events.iter().all(|e| e.run_id() == run.id));
}

#[tokio::test]
async fn test_empty_request_fails_validation_without_rollback() {
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default());
    let run = pipeline.create_run(RunRequest::default()).await.unwrap();
    let mut events = bus.subscribe_run(run.id);

    let run = pipeline.execute(run.id).await.unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(run.rollback_log().is_empty());
    let intake = run.stage(StageName::Intake);
    assert_eq!(intake.status(), StageStatus::Failed);
    assert_eq!(intake.error(), Some("Request must include task, prompt, or code"));
    assert!(run.stages()[1..].iter().all(|s| s.status() == StageStatus::Pending));
    assert!(run.result().is_none());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        kinds(&seen),
        vec![
            "run:started",
            "stage:started",
            "stage:failed",
            "rollback:started",
            "rollback:completed",
            "run:failed"
        ]
    );
}

#[tokio::test]
async fn test_high_risk_pauses_then_approved_resume_completes() {
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default());
    let mut events = bus.subscribe();

    let created = pipeline
        .create_run(RunRequest::code("x=1").with_risk_level(RiskLevel::High))
        .await
        .unwrap();
    let paused = pipeline.execute(created.id).await.unwrap();

    assert_eq!(paused.status(), RunStatus::Paused);
    assert_eq!(paused.current_stage_index(), StageName::Approve.index());
    match paused.output_of(StageName::Approve) {
        Some(StageOutput::Approval(approval)) => {
            assert!(!approval.approved);
            assert!(approval.pending);
            assert_eq!(approval.reason.as_deref(), Some("human_approval_required"));
        }
        other => panic!("no approval result: {:?}", other),
    }
    for name in [StageName::Execute, StageName::Verify, StageName::Receipt] {
        assert_eq!(paused.stage(name).status(), StageStatus::Pending);
    }
    assert_eq!(kinds(&events.drain()).last(), Some(&"run:paused"));

    let approve_duration = paused.stage(StageName::Approve).duration_ms();
    let done = pipeline.resume(created.id, Approval::approve("alice")).await.unwrap();

    assert_eq!(done.status(), RunStatus::Completed);
    assert_eq!(done.stage(StageName::Approve).duration_ms(), approve_duration);
    match done.output_of(StageName::Approve) {
        Some(StageOutput::Approval(approval)) => {
            assert!(approval.approved);
            assert!(!approval.pending);
            assert_eq!(approval.actor.as_deref(), Some("alice"));
        }
        other => panic!("no approval result: {:?}", other),
    }

    let started: Vec<StageName> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::StageStarted { stage, .. } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![StageName::Execute, StageName::Verify, StageName::Receipt]);

    let stored = pipeline.get_run(created.id).await.unwrap().unwrap();
    assert_eq!(stored, done);
}

#[tokio::test]
async fn test_denied_resume_fails_without_executing() {
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default());
    let created = pipeline
        .create_run(RunRequest::task("drop table").with_risk_level(RiskLevel::Critical))
        .await
        .unwrap();
    pipeline.execute(created.id).await.unwrap();
    let mut events = bus.subscribe();

    let run = pipeline.resume(created.id, Approval::deny("bob")).await.unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(run.finished_at().is_some());
    assert!(run.rollback_log().is_empty());
    for name in [StageName::Execute, StageName::Verify, StageName::Receipt] {
        assert_eq!(run.stage(name).status(), StageStatus::Pending);
    }
    match run.output_of(StageName::Approve) {
        Some(StageOutput::Approval(approval)) => {
            assert!(!approval.approved);
            assert_eq!(approval.actor.as_deref(), Some("bob"));
        }
        other => panic!("no approval result: {:?}", other),
    }

    match events.drain().as_slice() {
        [PipelineEvent::RunFailed { error, failed_stage, .. }] => {
            assert_eq!(error, "approval_denied");
            assert_eq!(*failed_stage, Some(StageName::Approve));
        }
        other => panic!("unexpected events {:?}", other),
    }

    let err = pipeline.resume(created.id, Approval::approve("bob")).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { actual: RunStatus::Failed, .. }));
}

// ============================================================================
// Failures and rollback
// ============================================================================

#[tokio::test]
async fn test_low_confidence_fails_verify_and_rolls_back_in_reverse() {
    let engine = Arc::new(FixedRiskEngine::new(Some(40.0)));
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default().with_risk_engine(engine));
    let mut events = bus.subscribe();

    let run = run_to_end(&pipeline, RunRequest::task("t")).await;

    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(
        run.stage(StageName::Verify).error(),
        Some("Verification failed: confidence 40% below 60% threshold")
    );
    let rolled: Vec<StageName> = run.rollback_log().iter().map(|e| e.stage).collect();
    assert_eq!(
        rolled,
        vec![
            StageName::Execute,
            StageName::Approve,
            StageName::Judge,
            StageName::Arena,
            StageName::MonteCarlo,
            StageName::Triage,
            StageName::Intake,
        ]
    );
    assert_eq!(
        statuses(&run),
        [
            vec![StageStatus::RolledBack; 7],
            vec![StageStatus::Failed, StageStatus::Pending]
        ]
        .concat()
    );

    let events = events.drain();
    let tail = kinds(&events[events.len() - 11..]);
    assert_eq!(
        tail,
        [
            vec!["stage:failed", "rollback:started"],
            vec!["stage:rolledback"; 7],
            vec!["rollback:completed", "run:failed"]
        ]
        .concat()
    );
}

#[tokio::test]
async fn test_risk_engine_error_fails_monte_carlo() {
    let pipeline = PipelineService::new(PipelineOptions::default().with_risk_engine(Arc::new(BrokenRiskEngine)));
    let run = run_to_end(&pipeline, RunRequest::task("t")).await;

    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(
        run.stage(StageName::MonteCarlo).error(),
        Some("Risk engine unavailable: simulator offline")
    );
    let rolled: Vec<StageName> = run.rollback_log().iter().map(|e| e.stage).collect();
    assert_eq!(rolled, vec![StageName::Triage, StageName::Intake]);
    assert_eq!(run.stage(StageName::Arena).status(), StageStatus::Pending);
}

#[tokio::test]
async fn test_risk_engine_receives_scenario_and_confidence_flows_to_receipt() {
    let engine = Arc::new(FixedRiskEngine::new(Some(92.5)));
    let pipeline = PipelineService::new(PipelineOptions::default().with_risk_engine(engine.clone()));
    let request = RunRequest {
        request_id: Some("req-9".to_string()),
        ..RunRequest::task("t")
    };

    let run = run_to_end(&pipeline, request).await;

    assert_eq!(run.status(), RunStatus::Completed);
    let seen = engine.seen.lock();
    assert_eq!(seen.len(), 1);
    let (scenario, samples) = &seen[0];
    assert_eq!(scenario.name, "req-9");
    assert_eq!(scenario.base_success_rate, 0.85);
    assert_eq!(*samples, 1000);
    assert_eq!(run.result().unwrap().confidence, Some(92.5));
}

#[tokio::test]
async fn test_missing_confidence_falls_back_to_default() {
    let engine = Arc::new(FixedRiskEngine::new(None));
    let pipeline = PipelineService::new(PipelineOptions::default().with_risk_engine(engine));
    let run = run_to_end(&pipeline, RunRequest::task("t")).await;

    match run.output_of(StageName::Verify) {
        Some(StageOutput::Verification(verify)) => assert_eq!(verify.confidence, 85.0),
        other => panic!("no verification result: {:?}", other),
    }
}

// ============================================================================
// Skips
// ============================================================================

#[tokio::test]
async fn test_request_skip_differs_from_handler_skip() {
    let pipeline = PipelineService::new(PipelineOptions::default());

    let requested = run_to_end(&pipeline, RunRequest::task("t").skipping(StageName::Arena)).await;
    assert_eq!(requested.status(), RunStatus::Completed);
    assert_eq!(requested.stage(StageName::Arena).status(), StageStatus::Skipped);
    assert!(requested.output_of(StageName::Arena).is_none());
    assert_eq!(requested.stage(StageName::Arena).duration_ms(), 0);
    assert_eq!(
        requested.output_of(StageName::Judge),
        Some(&StageOutput::skipped("no_arena"))
    );

    let disabled = run_to_end(&pipeline, RunRequest::task("t").with_arena(false)).await;
    assert_eq!(disabled.stage(StageName::Arena).status(), StageStatus::Completed);
    assert_eq!(
        disabled.output_of(StageName::Arena),
        Some(&StageOutput::skipped("arena_disabled"))
    );
    assert_eq!(disabled.result().unwrap().winner, "N/A");
    match disabled.output_of(StageName::Execute) {
        Some(StageOutput::Execution(execution)) => assert_eq!(execution.winner, "default"),
        other => panic!("no execution result: {:?}", other),
    }
}

#[tokio::test]
async fn test_skipped_approve_never_pauses() {
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default());
    let mut events = bus.subscribe();
    let run = run_to_end(
        &pipeline,
        RunRequest::task("t")
            .with_risk_level(RiskLevel::High)
            .skipping(StageName::Approve),
    )
    .await;

    assert_eq!(run.status(), RunStatus::Completed);
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, PipelineEvent::StageSkipped { stage: StageName::Approve, .. })));
}

// ============================================================================
// Concurrency and registry
// ============================================================================

#[tokio::test]
async fn test_concurrent_execute_on_one_run_reports_busy() {
    let pipeline = PipelineService::new(PipelineOptions::default().with_risk_engine(Arc::new(SlowRiskEngine::default())));
    let run = pipeline.create_run(RunRequest::task("t")).await.unwrap();

    let (first, second) = tokio::join!(pipeline.execute(run.id), pipeline.execute(run.id));

    assert_eq!(first.unwrap().status(), RunStatus::Completed);
    assert!(matches!(second, Err(PipelineError::RunBusy(id)) if id == run.id));
}

#[tokio::test]
async fn test_admission_bounds_concurrent_drivers() {
    let engine = Arc::new(SlowRiskEngine::default());
    let pipeline = PipelineService::new(
        PipelineOptions::default()
            .with_max_concurrent(1)
            .with_risk_engine(engine.clone()),
    );
    let a = pipeline.create_run(RunRequest::task("a")).await.unwrap();
    let b = pipeline.create_run(RunRequest::task("b")).await.unwrap();

    let (ra, rb) = tokio::join!(pipeline.execute(a.id), pipeline.execute(b.id));

    assert_eq!(ra.unwrap().status(), RunStatus::Completed);
    assert_eq!(rb.unwrap().status(), RunStatus::Completed);
    assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_list_and_status() {
    let pipeline = PipelineService::new(PipelineOptions::default());
    let idle = pipeline.create_run(RunRequest::task("idle")).await.unwrap();
    run_to_end(&pipeline, RunRequest::task("a")).await;
    run_to_end(&pipeline, RunRequest::default()).await;
    run_to_end(&pipeline, RunRequest::task("b").with_risk_level(RiskLevel::High)).await;

    let runs = pipeline.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 4);
    assert_eq!(runs.last().unwrap().id, idle.id);
    for pair in runs.windows(2) {
        assert!(pair[0].started_at() >= pair[1].started_at());
    }
    assert_eq!(pipeline.list_runs(Some(2)).await.unwrap().len(), 2);

    let summary = pipeline.status().await.unwrap();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.pending, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.paused, 1);
    assert_eq!(summary.running, 0);
}

#[tokio::test]
async fn test_registry_full_of_active_runs_rejects_create() {
    let settings = PipelineSettings {
        registry_capacity: 1,
        ..PipelineSettings::default()
    };
    let pipeline = PipelineService::new(PipelineOptions::default().with_settings(settings));
    pipeline.create_run(RunRequest::task("a")).await.unwrap();

    let err = pipeline.create_run(RunRequest::task("b")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Repository(RepositoryError::Full(1))));
}

#[tokio::test]
async fn test_finished_runs_make_room() {
    let settings = PipelineSettings {
        registry_capacity: 1,
        ..PipelineSettings::default()
    };
    let pipeline = PipelineService::new(PipelineOptions::default().with_settings(settings));
    let first = run_to_end(&pipeline, RunRequest::task("a")).await;

    let second = pipeline.create_run(RunRequest::task("b")).await.unwrap();
    assert!(pipeline.get_run(first.id).await.unwrap().is_none());
    assert!(pipeline.get_run(second.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_receipt_wire_shape() {
    let pipeline = PipelineService::new(PipelineOptions::default());
    let run = run_to_end(&pipeline, RunRequest::task("t").with_seed(7)).await;

    let json = serde_json::to_value(run.result().unwrap()).unwrap();
    for field in ["receiptId", "runId", "requestId", "seed", "stages", "winner", "ts"] {
        assert!(json.get(field).is_some(), "missing {field}");
    }
    assert_eq!(json["seed"], 7);
    assert_eq!(json["stages"][0]["name"], "INTAKE");
    assert!(json["stages"][0].get("durationMs").is_some());
}

#[tokio::test]
async fn test_approved_resume_can_still_fail_verify() {
    let engine = Arc::new(FixedRiskEngine::new(Some(40.0)));
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default().with_risk_engine(engine));

    let created = pipeline
        .create_run(RunRequest::code("x=1").with_risk_level(RiskLevel::High))
        .await
        .unwrap();
    let paused = pipeline.execute(created.id).await.unwrap();
    assert_eq!(paused.status(), RunStatus::Paused);

    let mut events = bus.subscribe();
    let run = pipeline.resume(created.id, Approval::approve("alice")).await.unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.stage(StageName::Verify).status(), StageStatus::Failed);
    assert_eq!(run.stage(StageName::Receipt).status(), StageStatus::Pending);
    assert!(run.result().is_none());
    let rolled: Vec<StageName> = run.rollback_log().iter().map(|e| e.stage).collect();
    assert_eq!(
        rolled,
        vec![
            StageName::Execute,
            StageName::Approve,
            StageName::Judge,
            StageName::Arena,
            StageName::MonteCarlo,
            StageName::Triage,
            StageName::Intake,
        ]
    );

    let events = events.drain();
    assert_eq!(
        kinds(&events),
        [
            vec!["stage:started", "stage:completed", "stage:started", "stage:failed", "rollback:started"],
            vec!["stage:rolledback"; 7],
            vec!["rollback:completed", "run:failed"]
        ]
        .concat()
    );
    match events.last() {
        Some(PipelineEvent::RunFailed { failed_stage, .. }) => assert_eq!(*failed_stage, Some(StageName::Verify)),
        other => panic!("unexpected final event {:?}", other),
    }

    let stored = pipeline.get_run(created.id).await.unwrap().unwrap();
    assert_eq!(stored, run);
}

// ============================================================================
// Storage faults
// ============================================================================

#[tokio::test]
async fn test_failed_save_fails_the_run_instead_of_leaving_it_running() {
    // Saves: create, start, INTAKE begin, INTAKE complete, TRIAGE begin.
    let repository = Arc::new(FlakyRepository::failing_save(5));
    let (pipeline, bus) = pipeline_with_bus(PipelineOptions::default().with_repository(repository.clone()));
    let mut events = bus.subscribe();

    let created = pipeline.create_run(RunRequest::task("t")).await.unwrap();
    let err = pipeline.execute(created.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Repository(RepositoryError::Backend(_))));

    let stored = pipeline.get_run(created.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), RunStatus::Failed);
    assert!(stored.finished_at().is_some());
    assert_eq!(stored.stage(StageName::Intake).status(), StageStatus::RolledBack);
    assert_eq!(stored.stage(StageName::Triage).status(), StageStatus::Failed);
    assert!(stored
        .stage(StageName::Triage)
        .error()
        .unwrap()
        .starts_with("Run state could not be saved"));
    let rolled: Vec<StageName> = stored.rollback_log().iter().map(|e| e.stage).collect();
    assert_eq!(rolled, vec![StageName::Intake]);

    assert_eq!(kinds(&events.drain()).last(), Some(&"run:failed"));

    let summary = pipeline.status().await.unwrap();
    assert_eq!(summary.running, 0);
    assert_eq!(summary.failed, 1);

    let err = pipeline.execute(created.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { actual: RunStatus::Failed, .. }));
}

#[tokio::test]
async fn test_failed_pause_save_does_not_leave_run_stuck() {
    // Six completed stages, the sixth save of which also pauses the run.
    let repository = Arc::new(FlakyRepository::failing_save(2 + 2 * 6));
    let pipeline = PipelineService::new(PipelineOptions::default().with_repository(repository.clone()));

    let created = pipeline
        .create_run(RunRequest::task("t").with_risk_level(RiskLevel::Critical))
        .await
        .unwrap();
    assert!(pipeline.execute(created.id).await.is_err());

    let stored = pipeline.get_run(created.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), RunStatus::Failed);
    assert_eq!(stored.rollback_log().len(), 6);
    assert_eq!(stored.rollback_log()[0].stage, StageName::Approve);
}

#[tokio::test]
async fn test_stage_completed_is_published_after_snapshot_is_saved() {
    let repository = Arc::new(FlakyRepository::reliable());
    let watcher = Arc::new(SnapshotWatcher {
        repository: repository.clone(),
        observed: Mutex::new(Vec::new()),
    });
    let pipeline = PipelineService::new(
        PipelineOptions::default()
            .with_repository(repository.clone())
            .with_publisher(watcher.clone()),
    );

    run_to_end(&pipeline, RunRequest::task("t")).await;

    let observed = watcher.observed.lock();
    assert_eq!(observed.len(), 9);
    for (stage, status) in observed.iter() {
        assert_eq!(*status, Some(StageStatus::Completed), "{} not saved before its event", stage);
    }
}
