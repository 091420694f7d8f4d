//! Shared per-job state and the mutations that keep its counters honest.
//!
//! All changes to a job and its messages go through [`JobInner`] while the
//! owning [`JobHandle`]'s lock is held. Each mutation publishes its events
//! before the lock is released.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::model::{Job, JobStatusResponse, MessageStatus};
use super::queue::{MessageQueue, QueuePeek};
use super::state::JobStatus;
use crate::config::EngineConfig;
use crate::error::SendError;
use crate::events::{EventPublisher, JobEvent};
use crate::ratelimit::TokenBucket;

/// Failure reason recorded when a caller cancels a job.
pub const CANCELLED_REASON: &str = "job cancelled";

/// Completions kept for the throughput estimate.
const THROUGHPUT_WINDOW: usize = 20;

/// Signal from the control surface to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
}

/// What the dispatcher should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A message is eligible now.
    Send,
    /// Sleep until this instant (or until something changes).
    WaitUntil(DateTime<Utc>),
    /// Only in-flight work remains; wait for it.
    Idle,
    /// Queue drained and nothing in flight.
    Drained,
    /// Job already terminal.
    Finished,
}

/// A message handed to the transport.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub index: usize,
    pub phone: String,
    pub body: String,
}

/// Recent completion times, for estimating time remaining.
#[derive(Debug, Default)]
pub struct Throughput {
    completions: VecDeque<DateTime<Utc>>,
}

impl Throughput {
    pub fn record(&mut self, at: DateTime<Utc>) {
        self.completions.push_back(at);
        if self.completions.len() > THROUGHPUT_WINDOW {
            self.completions.pop_front();
        }
    }

    /// Seconds until `pending` more completions at the recent rate.
    pub fn estimate(&self, pending: usize) -> Option<u64> {
        if pending == 0 {
            return Some(0);
        }
        let (first, last) = (self.completions.front()?, self.completions.back()?);
        let span = last.signed_duration_since(*first).num_milliseconds();
        if self.completions.len() < 2 || span <= 0 {
            return None;
        }
        let per_ms = (self.completions.len() - 1) as f64 / span as f64;
        Some((pending as f64 / per_ms / 1000.0).ceil() as u64)
    }
}

/// Mutable state of one job.
pub struct JobInner {
    pub job: Job,
    pub queue: MessageQueue,
    pub throughput: Throughput,
}

impl JobInner {
    pub fn new(job: Job, queue: MessageQueue) -> Self {
        Self {
            job,
            queue,
            throughput: Throughput::default(),
        }
    }

    pub fn estimate(&self) -> Option<u64> {
        if self.job.status.is_terminal() {
            return None;
        }
        self.throughput.estimate(self.job.pending_count)
    }

    pub fn snapshot(&self) -> JobStatusResponse {
        JobStatusResponse {
            job_id: self.job.id,
            status: self.job.status,
            progress: self.job.progress(),
            results: self.queue.messages().iter().map(|m| m.result()).collect(),
            estimated_time_remaining: self.estimate(),
            error: self.job.error.clone(),
        }
    }

    pub fn next_step(&self, now: DateTime<Utc>) -> Step {
        if self.job.status.is_terminal() {
            return Step::Finished;
        }
        match self.queue.peek(now) {
            QueuePeek::Ready => Step::Send,
            QueuePeek::NotBefore(at) => Step::WaitUntil(at),
            QueuePeek::Blocked => Step::Idle,
            QueuePeek::Empty if self.queue.in_flight_count() > 0 => Step::Idle,
            QueuePeek::Empty => Step::Drained,
        }
    }

    /// Transition and announce it. Returns `false` if the transition is not allowed.
    pub fn transition(
        &mut self,
        target: JobStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
        publisher: &dyn EventPublisher,
    ) -> bool {
        let from = self.job.status;
        if let Err(e) = self.job.transition_to(target, reason, now) {
            warn!(job_id = %self.job.id, error = %e, "Rejected job transition");
            return false;
        }
        info!(job_id = %self.job.id, from = %from, to = %target, "Job transitioned");
        publisher.publish(JobEvent::StatusChanged {
            job_id: self.job.id,
            status: target,
        });
        true
    }

    fn publish_message(&self, index: usize, publisher: &dyn EventPublisher) {
        let msg = self.queue.get(index);
        publisher.publish(JobEvent::MessageStatus {
            job_id: self.job.id,
            phone: msg.phone.clone(),
            status: msg.status,
            error: msg.error.clone(),
            timestamp: msg.updated_at,
        });
    }

    pub fn publish_progress(&self, publisher: &dyn EventPublisher) {
        let progress = self.job.progress();
        debug_assert!(progress.is_consistent());
        publisher.publish(JobEvent::JobProgress {
            job_id: self.job.id,
            progress,
            estimated_time_remaining: self.estimate(),
        });
    }

    /// Take the next eligible message for sending.
    pub fn take_next(&mut self, now: DateTime<Utc>, publisher: &dyn EventPublisher) -> Option<Outgoing> {
        let index = self.queue.take_next(now)?;
        self.publish_message(index, publisher);
        let msg = self.queue.get(index);
        Some(Outgoing {
            index,
            phone: msg.phone.clone(),
            body: msg.message.clone(),
        })
    }

    /// Record what happened to an attempt.
    ///
    /// If the job turned terminal while the attempt was in flight, the
    /// outcome is final regardless of the retry budget.
    pub fn record_outcome(
        &mut self,
        index: usize,
        outcome: Result<(), SendError>,
        now: DateTime<Utc>,
        config: &EngineConfig,
        publisher: &dyn EventPublisher,
    ) {
        self.queue.finish(index);
        let job_id = self.job.id;
        let terminal = self.job.status.is_terminal();

        match outcome {
            Ok(()) => {
                let msg = self.queue.get_mut(index);
                msg.error = None;
                msg.record_attempt(MessageStatus::Sent, None, now);
                self.job.count_sent();
                self.throughput.record(now);
            }
            Err(err) if terminal => {
                let reason = self.job.error.clone().unwrap_or_else(|| CANCELLED_REASON.to_string());
                let msg = self.queue.get_mut(index);
                msg.error = Some(reason);
                msg.record_attempt(MessageStatus::Failed, Some(err.to_string()), now);
                self.job.count_failed();
            }
            Err(err) if err.is_retryable() && self.queue.get(index).retry_count < config.max_retries => {
                let msg = self.queue.get_mut(index);
                let delay = backoff_delay(config, msg.retry_count);
                msg.retry_count += 1;
                msg.error = Some(err.public_reason().to_string());
                msg.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
                msg.record_attempt(MessageStatus::Retry, Some(err.to_string()), now);
                info!(
                    job_id = %job_id,
                    phone = %msg.phone,
                    retry = msg.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Send failed, retry scheduled"
                );
                self.queue.requeue(index);
            }
            Err(err) => {
                let msg = self.queue.get_mut(index);
                msg.error = Some(err.public_reason().to_string());
                msg.record_attempt(MessageStatus::Failed, Some(err.to_string()), now);
                warn!(
                    job_id = %job_id,
                    phone = %msg.phone,
                    attempts = msg.attempts.len(),
                    error = %err,
                    "Message permanently failed"
                );
                self.job.count_failed();
                self.throughput.record(now);

                if err.is_fatal() {
                    self.publish_message(index, publisher);
                    self.fail(err.public_reason(), now, publisher);
                    return;
                }
            }
        }

        self.publish_message(index, publisher);
        self.publish_progress(publisher);
    }

    /// Fail the job: every waiting message fails with `reason`, in-flight
    /// ones settle when they return.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>, publisher: &dyn EventPublisher) -> bool {
        if self.job.status.is_terminal() {
            return false;
        }
        self.job.error = Some(reason.to_string());

        let drained = self.queue.drain_waiting();
        for &index in &drained {
            let msg = self.queue.get_mut(index);
            msg.status = MessageStatus::Failed;
            msg.error = Some(reason.to_string());
            msg.updated_at = now;
            self.job.count_failed();
            self.publish_message(index, publisher);
        }

        self.transition(JobStatus::Failed, Some(reason.to_string()), now, publisher);
        warn!(
            job_id = %self.job.id,
            reason = %reason,
            failed_waiting = drained.len(),
            in_flight = self.queue.in_flight_count(),
            "Job failed"
        );
        publisher.publish(JobEvent::JobFailed {
            job_id: self.job.id,
            error: reason.to_string(),
        });
        self.publish_progress(publisher);
        true
    }

    /// Complete the job if everything has settled.
    pub fn complete_if_drained(&mut self, now: DateTime<Utc>, publisher: &dyn EventPublisher) -> bool {
        if self.next_step(now) != Step::Drained || self.job.pending_count != 0 {
            return false;
        }
        if !self.transition(JobStatus::Completed, None, now, publisher) {
            return false;
        }
        info!(
            job_id = %self.job.id,
            sent = self.job.sent_count,
            failed = self.job.failed_count,
            "Job completed"
        );
        publisher.publish(JobEvent::JobCompleted { job_id: self.job.id });
        self.publish_progress(publisher);
        true
    }
}

/// `min(base × 2^retry_count, max)`.
pub fn backoff_delay(config: &EngineConfig, retry_count: u32) -> std::time::Duration {
    let factor = 2u32.saturating_pow(retry_count);
    config
        .retry_base_delay
        .checked_mul(factor)
        .unwrap_or(config.retry_max_delay)
        .min(config.retry_max_delay)
}

/// One job as seen by the manager and its dispatcher.
pub struct JobHandle {
    pub id: Uuid,
    pub inner: Mutex<JobInner>,
    pub control: watch::Sender<Control>,
    pub bucket: Option<TokenBucket>,
    pub(crate) dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JobHandle {
    pub fn new(inner: JobInner, bucket: Option<TokenBucket>) -> Arc<Self> {
        let (control, _rx) = watch::channel(Control::Run);
        Arc::new(Self {
            id: inner.job.id,
            inner: Mutex::new(inner),
            control,
            bucket,
            dispatcher: std::sync::Mutex::new(None),
        })
    }

    pub fn signal(&self, control: Control) {
        self.control.send_replace(control);
    }

    pub(crate) fn set_dispatcher(&self, handle: JoinHandle<()>) {
        *self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub(crate) fn take_dispatcher(&self) -> Option<JoinHandle<()>> {
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
