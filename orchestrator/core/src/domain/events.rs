// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pipeline lifecycle events.
//!
//! Every event carries the run id. Events serialise with a `type` field holding
//! the wire name (`run:created`, `stage:completed`, ...) so transports can
//! forward them unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::results::Receipt;
use crate::domain::run::{RollbackEntry, RunId};
use crate::domain::stage::StageName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename = "run:created")]
    RunCreated {
        run_id: RunId,
        request_id: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename = "run:started")]
    RunStarted {
        run_id: RunId,
        started_at: DateTime<Utc>,
    },
    #[serde(rename = "run:paused")]
    RunPaused {
        run_id: RunId,
        stage: StageName,
        reason: String,
    },
    #[serde(rename = "run:completed")]
    RunCompleted {
        run_id: RunId,
        receipt: Option<Receipt>,
    },
    #[serde(rename = "run:failed")]
    RunFailed {
        run_id: RunId,
        error: String,
        failed_stage: Option<StageName>,
    },
    #[serde(rename = "stage:started")]
    StageStarted {
        run_id: RunId,
        stage: StageName,
        num: u8,
    },
    #[serde(rename = "stage:completed")]
    StageCompleted {
        run_id: RunId,
        stage: StageName,
        duration_ms: u64,
    },
    #[serde(rename = "stage:skipped")]
    StageSkipped {
        run_id: RunId,
        stage: StageName,
    },
    #[serde(rename = "stage:failed")]
    StageFailed {
        run_id: RunId,
        stage: StageName,
        error: String,
    },
    #[serde(rename = "stage:rolledback")]
    StageRolledBack {
        run_id: RunId,
        stage: StageName,
    },
    #[serde(rename = "rollback:started")]
    RollbackStarted {
        run_id: RunId,
        failed_stage: StageName,
    },
    #[serde(rename = "rollback:completed")]
    RollbackCompleted {
        run_id: RunId,
        log: Vec<RollbackEntry>,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            PipelineEvent::RunCreated { run_id, .. }
            | PipelineEvent::RunStarted { run_id, .. }
            | PipelineEvent::RunPaused { run_id, .. }
            | PipelineEvent::RunCompleted { run_id, .. }
            | PipelineEvent::RunFailed { run_id, .. }
            | PipelineEvent::StageStarted { run_id, .. }
            | PipelineEvent::StageCompleted { run_id, .. }
            | PipelineEvent::StageSkipped { run_id, .. }
            | PipelineEvent::StageFailed { run_id, .. }
            | PipelineEvent::StageRolledBack { run_id, .. }
            | PipelineEvent::RollbackStarted { run_id, .. }
            | PipelineEvent::RollbackCompleted { run_id, .. } => *run_id,
        }
    }

    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::RunCreated { .. } => "run:created",
            PipelineEvent::RunStarted { .. } => "run:started",
            PipelineEvent::RunPaused { .. } => "run:paused",
            PipelineEvent::RunCompleted { .. } => "run:completed",
            PipelineEvent::RunFailed { .. } => "run:failed",
            PipelineEvent::StageStarted { .. } => "stage:started",
            PipelineEvent::StageCompleted { .. } => "stage:completed",
            PipelineEvent::StageSkipped { .. } => "stage:skipped",
            PipelineEvent::StageFailed { .. } => "stage:failed",
            PipelineEvent::StageRolledBack { .. } => "stage:rolledback",
            PipelineEvent::RollbackStarted { .. } => "rollback:started",
            PipelineEvent::RollbackCompleted { .. } => "rollback:completed",
        }
    }
}

/// Sink for pipeline events. Publishing never blocks and never fails the run.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: PipelineEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_name_matches_serde_tag() {
        let event = PipelineEvent::StageRolledBack {
            run_id: RunId::new(),
            stage: StageName::Triage,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
        assert_eq!(json["stage"], "TRIAGE");
        assert!(json.get("runId").is_some());
    }

    #[test]
    fn test_run_failed_fields_are_camel_case() {
        let event = PipelineEvent::RunFailed {
            run_id: RunId::new(),
            error: "approval_denied".to_string(),
            failed_stage: Some(StageName::Approve),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run:failed");
        assert_eq!(json["failedStage"], "APPROVE");
    }
}
