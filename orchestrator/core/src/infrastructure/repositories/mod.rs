// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer, following the Repository pattern from DDD.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Store and retrieve `Run` aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # In-Memory Registry
//!
//! `InMemoryRunRepository` is bounded. Entries are kept in least-recently-saved
//! order and, once the registry is full, the oldest *finished* run that nobody
//! is holding is evicted. Pending, running and paused runs are never evicted;
//! if every entry is active the save is refused with `RepositoryError::Full`.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::repository::{RepositoryError, RunLock, RunRepository};
use crate::domain::run::{Run, RunId};

struct RunEntry {
    run: Run,
    lock: RunLock,
}

impl RunEntry {
    fn evictable(&self) -> bool {
        self.run.is_terminal() && self.lock.try_lock().is_ok()
    }
}

#[derive(Clone)]
pub struct InMemoryRunRepository {
    capacity: usize,
    entries: Arc<Mutex<LruCache<RunId, RunEntry>>>,
}

impl InMemoryRunRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(Mutex::new(LruCache::unbounded())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRunRepository {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&run.id) {
            entry.run = run.clone();
            return Ok(());
        }

        if entries.len() >= self.capacity {
            let victim = entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.evictable())
                .map(|(id, _)| *id);

            match victim {
                Some(id) => {
                    entries.pop(&id);
                    debug!(run_id = %id, "Evicted finished run from registry");
                }
                None => {
                    warn!(capacity = self.capacity, "Run registry full; refusing new run");
                    return Err(RepositoryError::Full(entries.len()));
                }
            }
        }

        entries.put(
            run.id,
            RunEntry {
                run: run.clone(),
                lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        Ok(())
    }

    async fn find_by_id(&self, id: RunId) -> Result<Option<Run>, RepositoryError> {
        let entries = self.entries.lock();
        Ok(entries.peek(&id).map(|entry| entry.run.clone()))
    }

    async fn list_all(&self) -> Result<Vec<Run>, RepositoryError> {
        let entries = self.entries.lock();
        Ok(entries.iter().map(|(_, entry)| entry.run.clone()).collect())
    }

    async fn lock_for(&self, id: RunId) -> Result<Option<RunLock>, RepositoryError> {
        let entries = self.entries.lock();
        Ok(entries.peek(&id).map(|entry| entry.lock.clone()))
    }
}
