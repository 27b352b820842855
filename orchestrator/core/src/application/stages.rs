// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stage Handlers
//!
//! One handler per `StageName`, dispatched through an exhaustive `match`.
//! Handlers read the run and return a `StageOutput`; they never mutate the run.
//! The only handler that awaits anything is MONTE_CARLO, which calls the
//! injected risk engine.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::collaborators::{RiskEngine, RiskEngineError, RiskScenario};
use crate::domain::config::PipelineSettings;
use crate::domain::node_pool::{self, DEFAULT_TASK_TYPE, FALLBACK_ARENA_POOL};
use crate::domain::results::{
    ApprovalResult, ArenaEntry, ArenaResult, ExecutionResult, IntakeResult, JudgeCriteria,
    JudgeResult, Receipt, ReceiptStage, TriageResult, VerificationResult,
};
use crate::domain::rng::SeededRng;
use crate::domain::run::Run;
use crate::domain::stage::{StageName, StageOutput};

const DEFAULT_PRIORITY: u8 = 5;

/// Failure raised by a stage handler. Every variant is terminal for the run.
#[derive(Debug, Error, PartialEq)]
pub enum StageError {
    #[error("Request must include task, prompt, or code")]
    Validation,

    #[error("Verification failed: confidence {confidence}% below {threshold}% threshold")]
    Verification { confidence: f64, threshold: f64 },

    #[error("{0}")]
    Handler(String),
}

impl From<RiskEngineError> for StageError {
    fn from(err: RiskEngineError) -> Self {
        StageError::Handler(err.to_string())
    }
}

/// Everything a handler may look at.
pub struct StageContext<'a> {
    pub run: &'a Run,
    pub settings: &'a PipelineSettings,
    pub risk_engine: Option<&'a dyn RiskEngine>,
}

pub async fn run_stage(name: StageName, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    match name {
        StageName::Intake => intake(ctx.run),
        StageName::Triage => Ok(triage(ctx.run)),
        StageName::MonteCarlo => monte_carlo(ctx).await,
        StageName::Arena => arena(ctx.run),
        StageName::Judge => Ok(judge(ctx.run)),
        StageName::Approve => Ok(approve(ctx.run)),
        StageName::Execute => Ok(execute(ctx.run)),
        StageName::Verify => verify(ctx.run, ctx.settings),
        StageName::Receipt => Ok(receipt(ctx.run)),
    }
}

/// True when the APPROVE output asks the executor to suspend the run.
pub fn awaits_approval(output: &StageOutput) -> bool {
    matches!(output, StageOutput::Approval(result) if result.pending)
}

fn intake(run: &Run) -> Result<StageOutput, StageError> {
    let request = &run.request;
    if !request.has_input() {
        return Err(StageError::Validation);
    }
    let input_size = serde_json::to_string(request)
        .map_err(|e| StageError::Handler(format!("Failed to measure request: {}", e)))?
        .len();

    Ok(StageOutput::Intake(IntakeResult {
        validated: true,
        task_type: request
            .task_type
            .clone()
            .unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string()),
        input_size,
    }))
}

fn triage(run: &Run) -> StageOutput {
    let request = &run.request;
    let task_type = request.task_type.as_deref().unwrap_or(DEFAULT_TASK_TYPE);
    StageOutput::Triage(TriageResult {
        priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
        risk_level: request.risk_level.unwrap_or_default(),
        node_pool: node_pool::pool_for(task_type).iter().map(|n| n.to_string()).collect(),
        triaged: true,
    })
}

async fn monte_carlo(ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    let Some(engine) = ctx.risk_engine else {
        return Ok(StageOutput::skipped("no_engine"));
    };

    let scenario = RiskScenario {
        name: ctx.run.request_id.clone(),
        base_success_rate: ctx.settings.base_success_rate,
        risk_factors: ctx.run.request.risk_factors.clone(),
        mitigations: ctx.run.request.mitigations.clone(),
    };
    let assessment = engine
        .run_full_cycle(&scenario, ctx.settings.monte_carlo_samples)
        .await?;
    Ok(StageOutput::RiskAssessment(assessment))
}

fn arena(run: &Run) -> Result<StageOutput, StageError> {
    if !run.config().arena_enabled {
        return Ok(StageOutput::skipped("arena_disabled"));
    }

    let pool: Vec<String> = match run.output_of(StageName::Triage) {
        Some(StageOutput::Triage(triage)) if !triage.node_pool.is_empty() => triage.node_pool.clone(),
        _ => FALLBACK_ARENA_POOL.iter().map(|n| n.to_string()).collect(),
    };

    let mut rng = SeededRng::for_arena(run.seed());
    let subject = run.request.subject();
    let mut entries: Vec<ArenaEntry> = pool
        .into_iter()
        .map(|node| {
            let score = rng.next_in(60.0, 40.0);
            let latency_ms = (rng.next_f64() * 3000.0).floor() as u64 + 500;
            ArenaEntry {
                output: format!("[{} output for: {}]", node, subject),
                node,
                score,
                latency_ms,
            }
        })
        .collect();
    entries.sort_by(|a, b| b.score.total_cmp(&a.score));

    let winner = entries
        .first()
        .cloned()
        .ok_or_else(|| StageError::Handler("Arena produced no entries".to_string()))?;

    Ok(StageOutput::Arena(ArenaResult {
        node_count: entries.len(),
        entries,
        winner,
        deterministic: true,
    }))
}

fn judge(run: &Run) -> StageOutput {
    // Covers both a handler-skipped arena and a request-skipped one.
    let Some(StageOutput::Arena(arena)) = run.output_of(StageName::Arena) else {
        return StageOutput::skipped("no_arena");
    };

    let mut rng = SeededRng::for_judge(run.seed());
    let criteria = JudgeCriteria {
        correctness: round1(rng.next_in(80.0, 20.0)),
        quality: round1(rng.next_in(75.0, 20.0)),
        performance: round1(rng.next_in(70.0, 25.0)),
        safety: round1(rng.next_in(85.0, 15.0)),
        creativity: round1(rng.next_in(65.0, 30.0)),
    };

    StageOutput::Judge(JudgeResult {
        winner: arena.winner.node.clone(),
        score: arena.winner.score,
        criteria,
        deterministic: true,
    })
}

fn approve(run: &Run) -> StageOutput {
    if run.config().approval_required {
        StageOutput::Approval(ApprovalResult::awaiting_human())
    } else {
        StageOutput::Approval(ApprovalResult::auto_approved())
    }
}

fn execute(run: &Run) -> StageOutput {
    StageOutput::Execution(ExecutionResult {
        executed: true,
        winner: judge_winner(run).unwrap_or("default").to_string(),
        ts: Utc::now(),
    })
}

fn verify(run: &Run, settings: &PipelineSettings) -> Result<StageOutput, StageError> {
    let confidence = assessed_confidence(run).unwrap_or(settings.default_confidence);
    if confidence < settings.verify_threshold {
        return Err(StageError::Verification {
            confidence,
            threshold: settings.verify_threshold,
        });
    }
    Ok(StageOutput::Verification(VerificationResult {
        passed: true,
        confidence,
        ts: Utc::now(),
    }))
}

fn receipt(run: &Run) -> StageOutput {
    StageOutput::Receipt(Receipt {
        receipt_id: Uuid::new_v4(),
        run_id: run.id,
        request_id: run.request_id.clone(),
        seed: run.seed(),
        stages: run
            .stages()
            .iter()
            .map(|stage| ReceiptStage {
                name: stage.name,
                status: stage.status(),
                duration_ms: stage.duration_ms(),
            })
            .collect(),
        winner: judge_winner(run).unwrap_or("N/A").to_string(),
        confidence: assessed_confidence(run),
        ts: Utc::now(),
    })
}

fn judge_winner(run: &Run) -> Option<&str> {
    match run.output_of(StageName::Judge) {
        Some(StageOutput::Judge(judge)) => Some(judge.winner.as_str()),
        _ => None,
    }
}

fn assessed_confidence(run: &Run) -> Option<f64> {
    match run.output_of(StageName::MonteCarlo) {
        Some(StageOutput::RiskAssessment(assessment)) => assessment.confidence,
        _ => None,
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
