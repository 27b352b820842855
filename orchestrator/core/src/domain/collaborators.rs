// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # External Collaborator Interfaces
//!
//! Contracts for services the pipeline talks to but does not implement.
//!
//! | Trait | Consulted by | Notes |
//! |-------|--------------|-------|
//! | `RiskEngine` | MONTE_CARLO stage | awaited; errors fail the stage |
//! | `PolicyEngine` | nobody in the core | held for hosts that gate tool use |
//! | `IncidentManager` | nobody in the core | held for hosts that escalate failures |
//!
//! Implementations are injected through `PipelineOptions`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Risk Engine (Monte Carlo)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mitigation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost: Option<f64>,
}

/// Scenario handed to the risk engine by the MONTE_CARLO stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskScenario {
    pub name: String,
    pub base_success_rate: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub mitigations: Vec<Mitigation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskOutcomes {
    pub success: u32,
    pub partial: u32,
    pub failure: u32,
}

/// Result of a full simulation cycle. Percentages are on a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub scenario: String,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub outcomes: RiskOutcomes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_grade: Option<String>,
}

#[derive(Debug, Error)]
pub enum RiskEngineError {
    #[error("Risk simulation failed: {0}")]
    Simulation(String),

    #[error("Risk engine unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RiskEngine: Send + Sync {
    /// Run a full simulation of `scenario` with `sample_count` iterations.
    async fn run_full_cycle(
        &self,
        scenario: &RiskScenario,
        sample_count: u32,
    ) -> Result<RiskAssessment, RiskEngineError>;
}

// ============================================================================
// Policy Engine
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyContext {
    pub environment: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEvaluation {
    pub tool_id: String,
    pub allowed: bool,
    pub requires_approval: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, tool_id: &str, context: &PolicyContext) -> PolicyEvaluation;
}

// ============================================================================
// Incident Manager
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentReport {
    pub severity: IncidentSeverity,
    pub title: String,
    pub source: String,
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("Incident manager error: {0}")]
pub struct IncidentError(pub String);

#[async_trait]
pub trait IncidentManager: Send + Sync {
    /// Open an incident and return its identifier.
    async fn open_incident(&self, report: &IncidentReport) -> Result<String, IncidentError>;
}
