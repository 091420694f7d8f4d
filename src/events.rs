//! Job events and the publisher interface observers are fed through.
//!
//! The engine calls [`EventPublisher::publish`] synchronously while it holds
//! the job's lock, so events for one job arrive in state order.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::jobs::{JobProgress, JobStatus, MessageStatus};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Events pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum JobEvent {
    /// Aggregate counts changed.
    JobProgress {
        job_id: Uuid,
        progress: JobProgress,
        /// Seconds, from recent throughput.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_time_remaining: Option<u64>,
    },
    /// One recipient's status changed.
    MessageStatus {
        job_id: Uuid,
        phone: String,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Lifecycle transition.
    #[serde(rename = "job-status")]
    StatusChanged { job_id: Uuid, status: JobStatus },
    JobCompleted { job_id: Uuid },
    JobFailed { job_id: Uuid, error: String },
}

impl JobEvent {
    /// Get the job ID from any variant.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::JobProgress { job_id, .. }
            | Self::MessageStatus { job_id, .. }
            | Self::StatusChanged { job_id, .. }
            | Self::JobCompleted { job_id }
            | Self::JobFailed { job_id, .. } => *job_id,
        }
    }
}

/// Push channel to external observers.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// Fan-out over a tokio broadcast channel. Each WS client subscribes.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastPublisher {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: JobEvent) {
        // Ok if no receivers are listening
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory, in publish order.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events_for(&self, job_id: Uuid) -> Vec<JobEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id() == job_id)
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: JobEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
