// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Stagegate core
//!
//! Nine-stage pipeline every critical task flows through:
//! `INTAKE → TRIAGE → MONTE_CARLO → ARENA → JUDGE → APPROVE → EXECUTE → VERIFY → RECEIPT`.
//!
//! # Architecture
//!
//! - **Domain:** run aggregate, stages, deterministic PRNG, collaborator traits
//! - **Application:** stage handlers, executor, rollback, admission control
//! - **Infrastructure:** broadcast event bus, bounded in-memory run registry

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
pub use application::pipeline::{Approval, PipelineError, PipelineOptions, PipelineService};
