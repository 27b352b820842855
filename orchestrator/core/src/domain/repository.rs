// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interface
//!
//! Persistence contract for the `Run` aggregate, following the DDD Repository
//! pattern: the interface lives in the domain layer, implementations in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `RunRepository` | `Run` | `InMemoryRunRepository` |
//!
//! Besides storage the repository owns one lock per run. The executor holds
//! that lock for the whole of `execute`/`resume`, which is what keeps two
//! concurrent drivers off the same run.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::run::{Run, RunId};

/// Per-run exclusive lock handed out by the repository.
pub type RunLock = Arc<Mutex<()>>;

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Save run (create or update)
    async fn save(&self, run: &Run) -> Result<(), RepositoryError>;

    /// Find run by ID
    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError>;

    /// All stored runs, in no particular order
    async fn list_all(&self) -> Result<Vec<Run>, RepositoryError>;

    /// Lock guarding mutation of `id`, or `None` when the run is unknown
    async fn lock_for(&self, id: RunId) -> Result<Option<RunLock>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Registry full: {0} active runs and nothing evictable")]
    Full(usize),

    #[error("Storage backend error: {0}")]
    Backend(String),
}
