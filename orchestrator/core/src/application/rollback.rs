// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Rollback Coordinator
//!
//! Walks the stages completed up to a failing stage in reverse order and
//! marks each one rolled back, recording it in the run's rollback log. This is
//! audit bookkeeping: no compensating action is executed.

use chrono::Utc;
use tracing::warn;

use crate::domain::events::{EventPublisher, PipelineEvent};
use crate::domain::run::{Run, RunError};
use crate::domain::stage::{StageName, StageStatus};

/// Roll back every completed stage up to and including `failed`. A stage
/// that failed itself is left as it is.
///
/// Publishes `rollback:started`, one `stage:rolledback` per stage and
/// `rollback:completed`. Returns the number of stages rolled back.
pub fn roll_back(run: &mut Run, failed: StageName, publisher: &dyn EventPublisher) -> Result<usize, RunError> {
    warn!(run_id = %run.id, failed_stage = %failed, "Rolling back completed stages");
    publisher.publish(PipelineEvent::RollbackStarted {
        run_id: run.id,
        failed_stage: failed,
    });

    let completed: Vec<StageName> = StageName::ALL[..=failed.index()]
        .iter()
        .rev()
        .copied()
        .filter(|&name| run.stage(name).status() == StageStatus::Completed)
        .collect();

    for &name in &completed {
        run.roll_back_stage(name, Utc::now())?;
        publisher.publish(PipelineEvent::StageRolledBack {
            run_id: run.id,
            stage: name,
        });
    }

    publisher.publish(PipelineEvent::RollbackCompleted {
        run_id: run.id,
        log: run.rollback_log().to_vec(),
    });
    Ok(completed.len())
}
