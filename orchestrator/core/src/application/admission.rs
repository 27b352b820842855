// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Admission control for pipeline drivers.
//!
//! At most `limit` runs are driven at once. Callers beyond the limit wait for a
//! permit; they are not rejected. The permit is held for the whole of one
//! `execute` or `resume` call and released on drop, so a run parked at APPROVE
//! does not occupy a slot.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Admission gate is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, AdmissionError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        debug!(in_flight = self.in_flight(), limit = self.limit, "Admitted pipeline driver");
        Ok(permit)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Refuse every pending and future `admit`. Permits already handed out stay valid.
    pub fn close(&self) {
        self.permits.close();
    }
}
