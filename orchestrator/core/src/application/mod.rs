// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod admission;
pub mod pipeline;
pub mod rollback;
pub mod stages;

// Re-export the service surface for convenience
pub use pipeline::{Approval, PipelineError, PipelineOptions, PipelineService};
pub use stages::StageError;
