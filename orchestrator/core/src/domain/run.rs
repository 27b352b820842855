// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run Domain Model
//!
//! A `Run` is one task instance flowing through the nine-stage pipeline. It is
//! the aggregate root of the pipeline context: stages, rollback log and the
//! final receipt are only reachable through it.
//!
//! # Invariants
//!
//! - `stages` always holds the nine stages in canonical order.
//! - `seed` and `config` are fixed at creation.
//! - Status moves `Pending → Running → {Completed | Failed | Paused}`,
//!   `Paused → Running` or `Paused → Failed`. `Completed` and `Failed` are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::collaborators::{Mitigation, RiskFactor};
use crate::domain::results::Receipt;
use crate::domain::stage::{Stage, StageName, StageOutput, StageTransitionError};

// ============================================================================
// Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// HIGH and CRITICAL work must pass the human approval gate.
    pub fn requires_approval(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// Caller-supplied task description. Everything is optional; INTAKE decides
/// whether the request is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arena_enabled: Option<bool>,
    /// Unknown stage names are dropped when parsing.
    #[serde(default, deserialize_with = "known_stages", skip_serializing_if = "Vec::is_empty")]
    pub skip_stages: Vec<StageName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_factors: Vec<RiskFactor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mitigations: Vec<Mitigation>,
    /// Explicit seed for reproducing a previous run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn known_stages<'de, D>(deserializer: D) -> Result<Vec<StageName>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Vec::<String>::deserialize(deserializer)?;
    Ok(names.iter().filter_map(|name| StageName::parse(name)).collect())
}

impl RunRequest {
    pub fn task(task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            ..Self::default()
        }
    }

    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = Some(risk_level);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_arena(mut self, enabled: bool) -> Self {
        self.arena_enabled = Some(enabled);
        self
    }

    pub fn skipping(mut self, stage: StageName) -> Self {
        self.skip_stages.push(stage);
        self
    }

    /// Text the arena echoes back in candidate outputs.
    pub fn subject(&self) -> &str {
        non_empty(&self.task)
            .or_else(|| non_empty(&self.prompt))
            .unwrap_or("task")
    }

    /// True when at least one of task, prompt or code carries content.
    pub fn has_input(&self) -> bool {
        non_empty(&self.task).is_some() || non_empty(&self.prompt).is_some() || non_empty(&self.code).is_some()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Per-run settings derived once from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub arena_enabled: bool,
    pub approval_required: bool,
    pub skip_stages: BTreeSet<StageName>,
}

impl RunConfig {
    pub fn from_request(request: &RunRequest) -> Self {
        Self {
            arena_enabled: request.arena_enabled.unwrap_or(true),
            approval_required: request.risk_level.unwrap_or_default().requires_approval(),
            skip_stages: request.skip_stages.iter().copied().collect(),
        }
    }

    pub fn skips(&self, stage: StageName) -> bool {
        self.skip_stages.contains(&stage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackEntry {
    pub stage: StageName,
    pub rolled_back_at: DateTime<Utc>,
}

/// Aggregate counts over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn record(&mut self, status: RunStatus) {
        self.total += 1;
        match status {
            RunStatus::Pending => self.pending += 1,
            RunStatus::Running => self.running += 1,
            RunStatus::Paused => self.paused += 1,
            RunStatus::Completed => self.completed += 1,
            RunStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RunError {
    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error(transparent)]
    Stage(#[from] StageTransitionError),
}

// ============================================================================
// Aggregate Root: Run
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub request_id: String,
    pub request: RunRequest,
    pub created_at: DateTime<Utc>,
    seed: u64,
    status: RunStatus,
    current_stage_index: usize,
    stages: Vec<Stage>,
    config: RunConfig,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<Receipt>,
    rollback_log: Vec<RollbackEntry>,
}

impl Run {
    /// Build a pending run. The seed is the request's explicit seed, or the
    /// creation time in epoch milliseconds.
    pub fn new(request: RunRequest, now: DateTime<Utc>) -> Self {
        let id = RunId::new();
        let request_id = request.request_id.clone().unwrap_or_else(|| id.to_string());
        let seed = request
            .seed
            .unwrap_or_else(|| now.timestamp_millis().max(0) as u64);
        let config = RunConfig::from_request(&request);

        Self {
            id,
            request_id,
            request,
            created_at: now,
            seed,
            status: RunStatus::Pending,
            current_stage_index: 0,
            stages: StageName::ALL.iter().copied().map(Stage::new).collect(),
            config,
            started_at: None,
            finished_at: None,
            result: None,
            rollback_log: Vec::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_stage_index(&self) -> usize {
        self.current_stage_index
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: StageName) -> &Stage {
        &self.stages[name.index()]
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn result(&self) -> Option<&Receipt> {
        self.result.as_ref()
    }

    pub fn rollback_log(&self) -> &[RollbackEntry] {
        &self.rollback_log
    }

    /// Result recorded by `name`, if that stage produced one.
    pub fn output_of(&self, name: StageName) -> Option<&StageOutput> {
        self.stage(name).result()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, allowed_from: &[RunStatus], to: RunStatus) -> Result<(), RunError> {
        if !allowed_from.contains(&self.status) {
            return Err(RunError::InvalidTransition {
                run_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), RunError> {
        self.transition(&[RunStatus::Pending], RunStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), RunError> {
        self.transition(&[RunStatus::Running], RunStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<(), RunError> {
        self.transition(&[RunStatus::Paused], RunStatus::Running)
    }

    /// `receipt` is `None` only when RECEIPT itself was skipped by the request.
    pub fn complete(&mut self, receipt: Option<Receipt>, now: DateTime<Utc>) -> Result<(), RunError> {
        self.transition(&[RunStatus::Running], RunStatus::Completed)?;
        self.result = receipt;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<(), RunError> {
        self.transition(&[RunStatus::Running, RunStatus::Paused], RunStatus::Failed)?;
        self.finished_at = Some(now);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage mutations, driven by the executor
    // ------------------------------------------------------------------

    pub fn skip_stage(&mut self, name: StageName) -> Result<(), RunError> {
        self.current_stage_index = name.index();
        self.stages[name.index()].skip()?;
        Ok(())
    }

    pub fn begin_stage(&mut self, name: StageName, now: DateTime<Utc>) -> Result<(), RunError> {
        self.current_stage_index = name.index();
        self.stages[name.index()].begin(now)?;
        Ok(())
    }

    pub fn complete_stage(&mut self, name: StageName, output: StageOutput, now: DateTime<Utc>) -> Result<(), RunError> {
        self.stages[name.index()].complete(output, now)?;
        Ok(())
    }

    pub fn fail_stage(&mut self, name: StageName, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), RunError> {
        self.stages[name.index()].fail(message, now)?;
        Ok(())
    }

    pub fn restamp_stage(&mut self, name: StageName, output: StageOutput, now: DateTime<Utc>) -> Result<(), RunError> {
        self.stages[name.index()].restamp(output, now)?;
        Ok(())
    }

    /// Mark a completed stage rolled back and append it to the audit log.
    pub fn roll_back_stage(&mut self, name: StageName, now: DateTime<Utc>) -> Result<(), RunError> {
        self.stages[name.index()].roll_back()?;
        self.rollback_log.push(RollbackEntry {
            stage: name,
            rolled_back_at: now,
        });
        Ok(())
    }
}
