// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pipeline Service
//!
//! Entry point of the core: creates runs, drives them through the nine stages,
//! suspends at the approval gate and resumes on a human decision.
//!
//! # Concurrency
//!
//! - Stages of one run execute strictly in order.
//! - `execute` and `resume` each hold the run's repository lock for their whole
//!   duration. A second caller finds the lock taken and gets `RunBusy`.
//! - The admission gate bounds how many runs are driven at once.
//!
//! Stage failures are not errors of this API: they fail the run, which is
//! returned in `Ok`. `PipelineError` is reserved for misuse (unknown run,
//! wrong state, busy run) and infrastructure faults.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::admission::{AdmissionError, AdmissionGate};
use crate::application::rollback;
use crate::application::stages::{self, StageContext, StageError};
use crate::domain::collaborators::{IncidentManager, PolicyEngine, RiskEngine};
use crate::domain::config::PipelineSettings;
use crate::domain::events::{EventPublisher, PipelineEvent};
use crate::domain::repository::{RepositoryError, RunRepository};
use crate::domain::results::ApprovalResult;
use crate::domain::run::{Run, RunError, RunId, RunRequest, RunStatus, RunSummary};
use crate::domain::stage::{StageName, StageOutput, StageStatus};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::repositories::InMemoryRunRepository;

const DEFAULT_ACTOR: &str = "system";
const APPROVAL_DENIED: &str = "approval_denied";
const AWAITING_APPROVAL: &str = "human_approval_required";
const TERMINAL_SAVE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {run_id} is {actual}, expected {expected}")]
    InvalidState {
        run_id: RunId,
        expected: RunStatus,
        actual: RunStatus,
    },

    #[error("Run {0} is already being driven")]
    RunBusy(RunId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Pipeline is not admitting new work")]
    AdmissionClosed,

    #[error(transparent)]
    Transition(#[from] RunError),
}

impl From<AdmissionError> for PipelineError {
    fn from(_: AdmissionError) -> Self {
        PipelineError::AdmissionClosed
    }
}

/// Human decision delivered to a paused run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub approved: bool,
    pub actor: Option<String>,
}

impl Approval {
    pub fn approve(actor: impl Into<String>) -> Self {
        Self {
            approved: true,
            actor: Some(actor.into()),
        }
    }

    pub fn deny(actor: impl Into<String>) -> Self {
        Self {
            approved: false,
            actor: Some(actor.into()),
        }
    }
}

/// Construction options. Everything left unset gets an in-memory default.
#[derive(Default)]
pub struct PipelineOptions {
    pub settings: PipelineSettings,
    pub monte_carlo: Option<Arc<dyn RiskEngine>>,
    pub policy_engine: Option<Arc<dyn PolicyEngine>>,
    pub incident_manager: Option<Arc<dyn IncidentManager>>,
    pub publisher: Option<Arc<dyn EventPublisher>>,
    pub repository: Option<Arc<dyn RunRepository>>,
}

impl PipelineOptions {
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.settings.max_concurrent = max_concurrent;
        self
    }

    pub fn with_risk_engine(mut self, engine: Arc<dyn RiskEngine>) -> Self {
        self.monte_carlo = Some(engine);
        self
    }

    pub fn with_policy_engine(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.policy_engine = Some(engine);
        self
    }

    pub fn with_incident_manager(mut self, manager: Arc<dyn IncidentManager>) -> Self {
        self.incident_manager = Some(manager);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.repository = Some(repository);
        self
    }
}

pub struct PipelineService {
    settings: PipelineSettings,
    risk_engine: Option<Arc<dyn RiskEngine>>,
    policy_engine: Option<Arc<dyn PolicyEngine>>,
    incident_manager: Option<Arc<dyn IncidentManager>>,
    publisher: Arc<dyn EventPublisher>,
    repository: Arc<dyn RunRepository>,
    admission: AdmissionGate,
}

impl PipelineService {
    pub fn new(options: PipelineOptions) -> Self {
        let settings = options.settings;
        let publisher: Arc<dyn EventPublisher> = match options.publisher {
            Some(publisher) => publisher,
            None => Arc::new(EventBus::new(settings.event_bus_capacity)),
        };
        let repository: Arc<dyn RunRepository> = match options.repository {
            Some(repository) => repository,
            None => Arc::new(InMemoryRunRepository::new(settings.registry_capacity)),
        };

        Self {
            admission: AdmissionGate::new(settings.max_concurrent),
            settings,
            risk_engine: options.monte_carlo,
            policy_engine: options.policy_engine,
            incident_manager: options.incident_manager,
            publisher,
            repository,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Policy engine supplied at construction. Not consulted by the stages.
    pub fn policy_engine(&self) -> Option<&Arc<dyn PolicyEngine>> {
        self.policy_engine.as_ref()
    }

    /// Incident manager supplied at construction. Not consulted by the stages.
    pub fn incident_manager(&self) -> Option<&Arc<dyn IncidentManager>> {
        self.incident_manager.as_ref()
    }

    pub fn admission(&self) -> &AdmissionGate {
        &self.admission
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub async fn create_run(&self, request: RunRequest) -> Result<Run, PipelineError> {
        let run = Run::new(request, Utc::now());
        self.repository.save(&run).await?;

        info!(run_id = %run.id, request_id = %run.request_id, seed = run.seed(), "Run created");
        self.publisher.publish(PipelineEvent::RunCreated {
            run_id: run.id,
            request_id: run.request_id.clone(),
            created_at: run.created_at,
        });
        Ok(run)
    }

    /// Drive a pending run from INTAKE until it completes, fails or pauses.
    pub async fn execute(&self, run_id: RunId) -> Result<Run, PipelineError> {
        let lock = self
            .repository
            .lock_for(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;
        let _guard = lock.try_lock_owned().map_err(|_| PipelineError::RunBusy(run_id))?;

        let mut run = self.load(run_id).await?;
        expect_status(&run, RunStatus::Pending)?;

        let _permit = self.admission.admit().await?;

        let now = Utc::now();
        run.start(now)?;
        self.repository.save(&run).await?;
        info!(run_id = %run_id, "Run started");
        self.publisher.publish(PipelineEvent::RunStarted {
            run_id,
            started_at: now,
        });

        self.drive(&mut run, StageName::Intake.index()).await?;
        Ok(run)
    }

    /// Deliver the human decision to a run paused at APPROVE.
    pub async fn resume(&self, run_id: RunId, approval: Approval) -> Result<Run, PipelineError> {
        let lock = self
            .repository
            .lock_for(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;
        let _guard = lock.try_lock_owned().map_err(|_| PipelineError::RunBusy(run_id))?;

        let mut run = self.load(run_id).await?;
        expect_status(&run, RunStatus::Paused)?;

        let _permit = self.admission.admit().await?;

        let actor = approval.actor.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
        let decision = ApprovalResult::decided(approval.approved, actor.clone());
        run.restamp_stage(StageName::Approve, StageOutput::Approval(decision), Utc::now())?;

        if !approval.approved {
            run.fail(Utc::now())?;
            self.repository.save(&run).await?;
            warn!(run_id = %run_id, actor = %actor, "Approval denied");
            self.publisher.publish(PipelineEvent::RunFailed {
                run_id,
                error: APPROVAL_DENIED.to_string(),
                failed_stage: Some(StageName::Approve),
            });
            return Ok(run);
        }

        run.resume()?;
        self.repository.save(&run).await?;
        info!(run_id = %run_id, actor = %actor, "Approval granted, resuming");

        self.drive(&mut run, StageName::Execute.index()).await?;
        Ok(run)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, PipelineError> {
        Ok(self.repository.find_by_id(run_id).await?)
    }

    /// Most recently started runs first; runs that never started come last.
    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>, PipelineError> {
        let mut runs = self.repository.list_all().await?;
        runs.sort_by(|a, b| b.started_at().cmp(&a.started_at()));
        runs.truncate(limit.unwrap_or(self.settings.default_list_limit));
        Ok(runs)
    }

    pub async fn status(&self) -> Result<RunSummary, PipelineError> {
        let runs = self.repository.list_all().await?;
        let mut summary = RunSummary::default();
        for run in &runs {
            summary.record(run.status());
        }
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Stage loop
    // ------------------------------------------------------------------

    async fn load(&self, run_id: RunId) -> Result<Run, PipelineError> {
        self.repository
            .find_by_id(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    /// Shared stage loop for `execute` and `resume`. Returns once the run is
    /// completed, failed or paused.
    ///
    /// A snapshot that cannot be saved fails the run: the in-memory run stays
    /// authoritative, is moved to `failed` and stored with a retried save
    /// before the storage error is returned.
    async fn drive(&self, run: &mut Run, start: usize) -> Result<(), PipelineError> {
        match self.advance(run, start).await {
            Err(PipelineError::Repository(err)) => self.abandon(run, err).await,
            other => other,
        }
    }

    async fn advance(&self, run: &mut Run, start: usize) -> Result<(), PipelineError> {
        for &name in &StageName::ALL[start..] {
            if run.config().skips(name) {
                run.skip_stage(name)?;
                self.repository.save(run).await?;
                debug!(run_id = %run.id, stage = %name, "Stage skipped by request");
                self.publisher.publish(PipelineEvent::StageSkipped { run_id: run.id, stage: name });
                continue;
            }

            run.begin_stage(name, Utc::now())?;
            self.repository.save(run).await?;
            debug!(run_id = %run.id, stage = %name, "Stage started");
            self.publisher.publish(PipelineEvent::StageStarted {
                run_id: run.id,
                stage: name,
                num: name.ordinal(),
            });

            let outcome = {
                let ctx = StageContext {
                    run: &*run,
                    settings: &self.settings,
                    risk_engine: self.risk_engine.as_deref(),
                };
                stages::run_stage(name, &ctx).await
            };

            let output = match outcome {
                Ok(output) => output,
                Err(err) => return self.fail_run(run, name, err).await,
            };

            let pause = stages::awaits_approval(&output);
            run.complete_stage(name, output, Utc::now())?;
            if pause {
                run.pause()?;
            }
            self.repository.save(run).await?;

            let duration_ms = run.stage(name).duration_ms();
            debug!(run_id = %run.id, stage = %name, duration_ms, "Stage completed");
            self.publisher.publish(PipelineEvent::StageCompleted {
                run_id: run.id,
                stage: name,
                duration_ms,
            });

            if pause {
                info!(run_id = %run.id, stage = %name, "Run paused for human approval");
                self.publisher.publish(PipelineEvent::RunPaused {
                    run_id: run.id,
                    stage: name,
                    reason: AWAITING_APPROVAL.to_string(),
                });
                return Ok(());
            }
        }

        let receipt = match run.output_of(StageName::Receipt) {
            Some(StageOutput::Receipt(receipt)) => Some(receipt.clone()),
            _ => None,
        };
        run.complete(receipt.clone(), Utc::now())?;
        self.repository.save(run).await?;
        info!(run_id = %run.id, "Run completed");
        self.publisher.publish(PipelineEvent::RunCompleted { run_id: run.id, receipt });
        Ok(())
    }

    async fn fail_run(&self, run: &mut Run, stage: StageName, err: StageError) -> Result<(), PipelineError> {
        let message = err.to_string();
        warn!(run_id = %run.id, stage = %stage, error = %message, "Stage failed");

        run.fail_stage(stage, message.clone(), Utc::now())?;
        self.repository.save(run).await?;
        self.publisher.publish(PipelineEvent::StageFailed {
            run_id: run.id,
            stage,
            error: message.clone(),
        });

        rollback::roll_back(run, stage, self.publisher.as_ref())?;

        run.fail(Utc::now())?;
        self.repository.save(run).await?;
        warn!(run_id = %run.id, "Run failed");
        self.publisher.publish(PipelineEvent::RunFailed {
            run_id: run.id,
            error: message,
            failed_stage: Some(stage),
        });
        Ok(())
    }

    /// Fail a run whose snapshot could not be saved, then hand back `err`.
    async fn abandon(&self, run: &mut Run, err: RepositoryError) -> Result<(), PipelineError> {
        error!(run_id = %run.id, error = %err, "Run snapshot not saved");

        if !run.is_terminal() {
            let stage = StageName::ALL[run.current_stage_index()];
            let message = format!("Run state could not be saved: {}", err);

            if run.stage(stage).status() == StageStatus::Running {
                run.fail_stage(stage, message.clone(), Utc::now())?;
                self.publisher.publish(PipelineEvent::StageFailed {
                    run_id: run.id,
                    stage,
                    error: message.clone(),
                });
            }
            rollback::roll_back(run, stage, self.publisher.as_ref())?;
            run.fail(Utc::now())?;

            self.save_terminal(run).await;
            self.publisher.publish(PipelineEvent::RunFailed {
                run_id: run.id,
                error: message,
                failed_stage: Some(stage),
            });
        } else {
            self.save_terminal(run).await;
        }

        Err(PipelineError::Repository(err))
    }

    async fn save_terminal(&self, run: &Run) {
        for attempt in 1..=TERMINAL_SAVE_ATTEMPTS {
            match self.repository.save(run).await {
                Ok(()) => return,
                Err(err) => warn!(run_id = %run.id, attempt, error = %err, "Terminal snapshot save failed"),
            }
        }
        error!(run_id = %run.id, "Giving up on terminal snapshot; stored run is stale");
    }
}

fn expect_status(run: &Run, expected: RunStatus) -> Result<(), PipelineError> {
    if run.status() != expected {
        return Err(PipelineError::InvalidState {
            run_id: run.id,
            expected,
            actual: run.status(),
        });
    }
    Ok(())
}
