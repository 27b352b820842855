// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Pipeline Events
//
// In-memory fan-out using tokio broadcast channels. Transports (SSE,
// WebSocket, message queues) subscribe here; the pipeline only publishes.
// Events are not persisted: a subscriber that falls behind by more than the
// channel capacity loses the oldest events.

use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{EventPublisher, PipelineEvent};
use crate::domain::run::RunId;

/// Event bus for publishing and subscribing to pipeline events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Subscribe to all pipeline events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single run
    pub fn subscribe_run(&self, run_id: RunId) -> RunEventReceiver {
        RunEventReceiver {
            receiver: self.sender.subscribe(),
            run_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: PipelineEvent) {
        debug!(run_id = %event.run_id(), kind = event.kind(), "Publishing event");

        // send() only fails when nobody is listening
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

fn map_try_recv_error(e: broadcast::error::TryRecvError) -> EventBusError {
    match e {
        broadcast::error::TryRecvError::Empty => EventBusError::Empty,
        broadcast::error::TryRecvError::Closed => EventBusError::Closed,
        broadcast::error::TryRecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all pipeline events
pub struct EventReceiver {
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        self.receiver.try_recv().map_err(map_try_recv_error)
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// Receiver for one run's events (filtered)
pub struct RunEventReceiver {
    receiver: broadcast::Receiver<PipelineEvent>,
    run_id: RunId,
}

impl RunEventReceiver {
    /// Receive the next event for the subscribed run
    pub async fn recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.run_id() == self.run_id {
                return Ok(event);
            }
        }
    }

    /// Try to receive the next event for the subscribed run without waiting
    pub fn try_recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(map_try_recv_error)?;
            if event.run_id() == self.run_id {
                return Ok(event);
            }
        }
    }

    /// Consume the receiver as a stream. Lagged gaps are skipped; the stream
    /// ends when the bus is dropped.
    pub fn into_stream(self) -> impl Stream<Item = PipelineEvent> + Send {
        stream::unfold(self, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            }
        })
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
