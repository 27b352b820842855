// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stage result payloads.
//!
//! Field names serialise in camelCase. `Receipt` is the external audit
//! contract; downstream storage and display layers rely on its shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{RiskLevel, RunId};
use crate::domain::stage::{StageName, StageStatus};

/// Marker a handler returns when it ran but had nothing to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipMarker {
    pub skipped: bool,
    pub reason: String,
}

impl SkipMarker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeResult {
    pub validated: bool,
    pub task_type: String,
    pub input_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageResult {
    pub priority: u8,
    pub risk_level: RiskLevel,
    pub node_pool: Vec<String>,
    pub triaged: bool,
}

/// One synthetic candidate scored in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaEntry {
    pub node: String,
    pub output: String,
    pub score: f64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaResult {
    /// Sorted by score, highest first.
    pub entries: Vec<ArenaEntry>,
    pub winner: ArenaEntry,
    pub node_count: usize,
    pub deterministic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeCriteria {
    pub correctness: f64,
    pub quality: f64,
    pub performance: f64,
    pub safety: f64,
    pub creativity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub winner: String,
    pub score: f64,
    pub criteria: JudgeCriteria,
    pub deterministic: bool,
}

/// Outcome of the approval gate, either automatic, pending or a recorded human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResult {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl ApprovalResult {
    pub fn auto_approved() -> Self {
        Self {
            approved: true,
            auto: true,
            pending: false,
            reason: Some("low_risk".to_string()),
            actor: None,
        }
    }

    pub fn awaiting_human() -> Self {
        Self {
            approved: false,
            auto: false,
            pending: true,
            reason: Some("human_approval_required".to_string()),
            actor: None,
        }
    }

    pub fn decided(approved: bool, actor: impl Into<String>) -> Self {
        Self {
            approved,
            auto: false,
            pending: false,
            reason: None,
            actor: Some(actor.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub executed: bool,
    pub winner: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub confidence: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptStage {
    pub name: StageName,
    pub status: StageStatus,
    pub duration_ms: u64,
}

/// Immutable audit summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub run_id: RunId,
    pub request_id: String,
    pub seed: u64,
    pub stages: Vec<ReceiptStage>,
    /// Judge winner, `"N/A"` when no judging happened.
    pub winner: String,
    /// Monte Carlo confidence; `None` when no assessment ran.
    pub confidence: Option<f64>,
    pub ts: DateTime<Utc>,
}
