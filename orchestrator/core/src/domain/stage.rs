// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stage Domain Model
//!
//! The nine fixed phases every run passes through, and the per-stage record
//! kept on the run.
//!
//! # Invariants
//!
//! - A stage moves `Pending → Skipped` or `Pending → Running → {Completed | Failed}`.
//! - Only a `Completed` stage can become `RolledBack`.
//! - The stage result (`StageOutput`) and the stage status are independent:
//!   a stage that *completed* may still carry a `StageOutput::Skipped` marker
//!   produced by its handler, while a stage the request asked to skip has
//!   status `Skipped` and no result at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::results::{
    ApprovalResult, ArenaResult, ExecutionResult, IntakeResult, JudgeResult, Receipt,
    SkipMarker, TriageResult, VerificationResult,
};
use crate::domain::collaborators::RiskAssessment;

// ============================================================================
// Value Objects
// ============================================================================

/// One of the nine pipeline stages, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageName {
    Intake,
    Triage,
    MonteCarlo,
    Arena,
    Judge,
    Approve,
    Execute,
    Verify,
    Receipt,
}

impl StageName {
    /// Canonical stage order.
    pub const ALL: [StageName; 9] = [
        StageName::Intake,
        StageName::Triage,
        StageName::MonteCarlo,
        StageName::Arena,
        StageName::Judge,
        StageName::Approve,
        StageName::Execute,
        StageName::Verify,
        StageName::Receipt,
    ];

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        self as usize
    }

    /// One-based stage number.
    pub fn ordinal(self) -> u8 {
        self as u8 + 1
    }

    /// Look a stage up by its wire name, e.g. `"MONTE_CARLO"`.
    pub fn parse(name: &str) -> Option<StageName> {
        StageName::ALL.into_iter().find(|stage| stage.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Intake => "INTAKE",
            StageName::Triage => "TRIAGE",
            StageName::MonteCarlo => "MONTE_CARLO",
            StageName::Arena => "ARENA",
            StageName::Judge => "JUDGE",
            StageName::Approve => "APPROVE",
            StageName::Execute => "EXECUTE",
            StageName::Verify => "VERIFY",
            StageName::Receipt => "RECEIPT",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Stage-specific result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Intake(IntakeResult),
    Triage(TriageResult),
    RiskAssessment(RiskAssessment),
    Arena(ArenaResult),
    Judge(JudgeResult),
    Approval(ApprovalResult),
    Execution(ExecutionResult),
    Verification(VerificationResult),
    Receipt(Receipt),
    /// The handler ran but chose not to do its work (no engine, arena disabled, ...).
    Skipped(SkipMarker),
}

impl StageOutput {
    pub fn skipped(reason: impl Into<String>) -> Self {
        StageOutput::Skipped(SkipMarker::new(reason))
    }

    /// True only for a handler-produced skip marker.
    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutput::Skipped(_))
    }
}

// ============================================================================
// Entity: Stage
// ============================================================================

#[derive(Debug, Error, PartialEq)]
#[error("Stage {stage} cannot move from {from} to {to}")]
pub struct StageTransitionError {
    pub stage: StageName,
    pub from: StageStatus,
    pub to: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub num: u8,
    pub name: StageName,
    status: StageStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metrics: StageMetrics,
    result: Option<StageOutput>,
    error: Option<String>,
}

impl Stage {
    pub fn new(name: StageName) -> Self {
        Self {
            num: name.ordinal(),
            name,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            metrics: StageMetrics::default(),
            result: None,
            error: None,
        }
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn result(&self) -> Option<&StageOutput> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Duration in milliseconds, zero when the stage never finished.
    pub fn duration_ms(&self) -> u64 {
        self.metrics.duration_ms.unwrap_or(0)
    }

    fn transition(&mut self, allowed_from: StageStatus, to: StageStatus) -> Result<(), StageTransitionError> {
        if self.status != allowed_from {
            return Err(StageTransitionError {
                stage: self.name,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn skip(&mut self) -> Result<(), StageTransitionError> {
        self.transition(StageStatus::Pending, StageStatus::Skipped)
    }

    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), StageTransitionError> {
        self.transition(StageStatus::Pending, StageStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, output: StageOutput, now: DateTime<Utc>) -> Result<(), StageTransitionError> {
        self.transition(StageStatus::Running, StageStatus::Completed)?;
        self.result = Some(output);
        self.finished_at = Some(now);
        self.metrics.duration_ms = Some(self.elapsed_ms(now));
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), StageTransitionError> {
        self.transition(StageStatus::Running, StageStatus::Failed)?;
        self.error = Some(message.into());
        self.finished_at = Some(now);
        self.metrics.duration_ms = Some(self.elapsed_ms(now));
        Ok(())
    }

    pub fn roll_back(&mut self) -> Result<(), StageTransitionError> {
        self.transition(StageStatus::Completed, StageStatus::RolledBack)
    }

    /// Replace the result of an already completed stage. Used by the approval
    /// gate to record the human decision on top of the pending marker.
    pub fn restamp(&mut self, output: StageOutput, now: DateTime<Utc>) -> Result<(), StageTransitionError> {
        if self.status != StageStatus::Completed {
            return Err(StageTransitionError {
                stage: self.name,
                from: self.status,
                to: StageStatus::Completed,
            });
        }
        self.result = Some(output);
        self.finished_at = Some(now);
        Ok(())
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}
