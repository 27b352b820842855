// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Static node-pool taxonomy used by TRIAGE to route a task type to its
//! ordered list of candidate workers.

pub const DEFAULT_TASK_TYPE: &str = "general";

/// Pool used by ARENA when no triage result is available.
pub const FALLBACK_ARENA_POOL: &[&str] = &["HeadyCoder", "HeadyJules"];

const CODE: &[&str] = &["HeadyCoder", "HeadyJules", "HeadyBuilder", "HeadyPythia"];
const RESEARCH: &[&str] = &["HeadyResearch", "HeadyJules", "HeadyPythia"];
const VISUAL: &[&str] = &["HeadyLens", "HeadyPythia", "HeadyCompute"];
const SPEED: &[&str] = &["HeadyFast", "HeadyEdgeAI", "HeadyCompute"];
const SECURITY: &[&str] = &["HeadyRisks", "HeadyAnalyze", "HeadyJules"];
const GENERAL: &[&str] = &["HeadyCoder", "HeadyJules", "HeadyPythia", "HeadyFast"];

/// Node pool for a task type. Unknown task types fall back to `general`.
pub fn pool_for(task_type: &str) -> &'static [&'static str] {
    match task_type {
        "code" => CODE,
        "research" => RESEARCH,
        "visual" => VISUAL,
        "speed" => SPEED,
        "security" => SECURITY,
        _ => GENERAL,
    }
}
