// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run command
//!
//! Creates a run from a JSON request file, drives it through the pipeline and
//! prints the stage table and receipt. A run that pauses at APPROVE is resumed
//! immediately when `--approve` or `--deny` is given.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Args;
use colored::{ColoredString, Colorize};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use stagegate_core::domain::config::PipelineSettings;
use stagegate_core::domain::events::PipelineEvent;
use stagegate_core::domain::run::{Run, RunRequest, RunStatus};
use stagegate_core::domain::stage::StageStatus;
use stagegate_core::infrastructure::EventBus;
use stagegate_core::{Approval, PipelineOptions, PipelineService};

#[derive(Args)]
pub struct RunArgs {
    /// Path to the JSON run request
    #[arg(value_name = "REQUEST")]
    request: PathBuf,

    /// Seed for ARENA/JUDGE scoring (overrides the request)
    #[arg(long)]
    seed: Option<u64>,

    /// Approve the run if it pauses at the approval gate
    #[arg(long, conflicts_with = "deny")]
    approve: bool,

    /// Deny the run if it pauses at the approval gate
    #[arg(long)]
    deny: bool,

    /// Name recorded as the approver
    #[arg(long, value_name = "NAME")]
    actor: Option<String>,

    /// Print the final run as JSON instead of a table
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn decision(&self) -> Option<Approval> {
        if !self.approve && !self.deny {
            return None;
        }
        Some(Approval {
            approved: self.approve,
            actor: self.actor.clone(),
        })
    }
}

pub async fn execute(args: RunArgs, config_override: Option<PathBuf>) -> Result<()> {
    let settings = PipelineSettings::load_or_default(config_override)
        .context("Failed to load configuration")?;
    settings.validate().context("Configuration validation failed")?;

    let mut request = load_request(&args.request)?;
    if let Some(seed) = args.seed {
        request.seed = Some(seed);
    }

    let bus = EventBus::new(settings.event_bus_capacity);
    let pipeline = PipelineService::new(
        PipelineOptions::default()
            .with_settings(settings)
            .with_publisher(Arc::new(bus.clone())),
    );

    let created = pipeline.create_run(request).await?;
    info!(run_id = %created.id, "Executing run from {:?}", args.request);

    let progress = (!args.json).then(|| tokio::spawn(print_progress(bus.subscribe_run(created.id).into_stream())));

    let mut run = pipeline.execute(created.id).await?;
    if run.status() == RunStatus::Paused {
        if let Some(approval) = args.decision() {
            run = pipeline.resume(run.id, approval).await?;
        }
    }

    // Closing the bus ends the progress stream once it has drained.
    drop(pipeline);
    drop(bus);
    if let Some(handle) = progress {
        handle.await.context("Progress printer panicked")?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_summary(&run);
    }

    if run.status() == RunStatus::Failed {
        anyhow::bail!("Run {} failed", run.id);
    }
    Ok(())
}

fn load_request(path: &Path) -> Result<RunRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid run request in {:?}", path))
}

async fn print_progress(events: impl Stream<Item = PipelineEvent>) {
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        if let Some(line) = describe(&event) {
            println!("{}", line);
        }
    }
}

fn describe(event: &PipelineEvent) -> Option<String> {
    let line = match event {
        PipelineEvent::RunStarted { run_id, .. } => format!("{} run {}", "▶".cyan(), run_id),
        PipelineEvent::StageCompleted { stage, duration_ms, .. } => {
            format!("  {} {} ({} ms)", "✓".green(), stage, duration_ms)
        }
        PipelineEvent::StageSkipped { stage, .. } => format!("  {} {} skipped", "○".dimmed(), stage),
        PipelineEvent::StageFailed { stage, error, .. } => format!("  {} {}: {}", "✗".red(), stage, error),
        PipelineEvent::StageRolledBack { stage, .. } => format!("  {} {} rolled back", "↺".yellow(), stage),
        PipelineEvent::RunPaused { stage, reason, .. } => {
            format!("{} paused at {} ({})", "⏸".yellow(), stage, reason)
        }
        PipelineEvent::RunFailed { error, .. } => format!("{} run failed: {}", "✗".red(), error),
        PipelineEvent::RunCompleted { .. } => format!("{} run completed", "✓".green()),
        _ => return None,
    };
    Some(line)
}

fn paint_status(status: StageStatus) -> ColoredString {
    match status {
        StageStatus::Completed => status.as_str().green(),
        StageStatus::Failed => status.as_str().red(),
        StageStatus::RolledBack => status.as_str().yellow(),
        StageStatus::Running => status.as_str().cyan(),
        StageStatus::Skipped | StageStatus::Pending => status.as_str().dimmed(),
    }
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| "-".to_string())
}

fn print_summary(run: &Run) {
    println!();
    let status = match run.status() {
        RunStatus::Completed => run.status().as_str().green(),
        RunStatus::Failed => run.status().as_str().red(),
        RunStatus::Paused => run.status().as_str().yellow(),
        _ => run.status().as_str().normal(),
    };
    println!("{} {} [{}]", "Run".bold(), run.id, status);
    println!("  Request: {}", run.request_id);
    println!("  Seed: {}", run.seed());
    println!("  Started: {}", timestamp(run.started_at()));
    println!("  Finished: {}", timestamp(run.finished_at()));
    println!();

    println!("{}", "Stages:".bold());
    for stage in run.stages() {
        println!(
            "  {:>2}. {:<12} {:<12} {:>6} ms",
            stage.num,
            stage.name.as_str(),
            paint_status(stage.status()),
            stage.duration_ms()
        );
    }

    if !run.rollback_log().is_empty() {
        println!();
        println!("{}", "Rollback log:".bold());
        for entry in run.rollback_log() {
            println!("  {} at {}", entry.stage, timestamp(Some(entry.rolled_back_at)));
        }
    }

    if let Some(receipt) = run.result() {
        println!();
        println!("{}", "Receipt:".bold());
        println!("  ID: {}", receipt.receipt_id);
        println!("  Winner: {}", receipt.winner);
        match receipt.confidence {
            Some(confidence) => println!("  Confidence: {}%", confidence),
            None => println!("  Confidence: {}", "N/A".dimmed()),
        }
    }

    if run.status() == RunStatus::Paused {
        println!();
        println!(
            "{}",
            "Run is waiting for approval. Re-run with --approve or --deny to decide.".yellow()
        );
    }
}
