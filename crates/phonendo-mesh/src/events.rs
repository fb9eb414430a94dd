//! Observable pipeline events.
//!
//! The orchestrator publishes every transition, drop and replay decision on
//! a broadcast channel. Nothing in the pipeline depends on anyone listening.

use std::time::Duration;

use tokio::sync::broadcast;

use phonendo_network::PeerId;
use phonendo_protocol::Stage;

/// Capacity of the event channel. Slow subscribers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Storage confirmed a new capture.
    Captured { key: String },
    /// Storage recorded a verified envelope.
    Verified { key: String },
    /// Publisher accepted the record and storage returned the final status.
    Published { key: String, status: String },
    /// A step was abandoned. The item stays at `stage` in storage.
    Dropped {
        key: String,
        stage: Stage,
        reason: String,
    },
    /// The verifier's envelope did not check out against its key.
    VerificationRejected {
        key: String,
        verifier: PeerId,
        reason: String,
    },
    /// A verifier public key was fetched and cached.
    KeyCached { verifier: PeerId, fingerprint: String },
    Replay(ReplayEvent),
}

/// Progress of the reconnection replay loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEvent {
    /// A pass is starting. `attempt` counts from 1 within one loop run.
    Started { attempt: u32 },
    /// Nothing was left deferred. `replayed` is 0 when storage had no
    /// pending items.
    Completed { replayed: usize },
    /// Some items could not move because their next role is missing.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        deferred: usize,
    },
    /// The retry limit was reached with items still deferred.
    GaveUp { attempts: u32 },
}

/// Sender side shared by the orchestrator and its replay loop.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        tracing::trace!(event = ?event, "Pipeline event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
