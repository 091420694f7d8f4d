//! Per-job dispatch loop.
//!
//! One dispatcher task runs per job. It pulls eligible messages in priority
//! order, waits for rate-limit tokens, and hands each send to a child task so
//! up to `max_in_flight_per_job` attempts can be outstanding at once. Every
//! outcome is written back through [`JobInner::record_outcome`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info};

use super::handle::{Control, JobHandle, Outgoing, Step};
use super::state::JobStatus;
use crate::clock::{Clock, until};
use crate::config::EngineConfig;
use crate::error::SendError;
use crate::events::EventPublisher;
use crate::ratelimit::RateLimiter;
use crate::transport::MessageSender;

/// Everything a dispatcher needs besides its job.
#[derive(Clone)]
pub struct DispatchContext {
    pub sender: Arc<dyn MessageSender>,
    pub limiter: Arc<RateLimiter>,
    pub publisher: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<EngineConfig>,
}

pub struct Dispatcher {
    job: Arc<JobHandle>,
    ctx: DispatchContext,
    control: watch::Receiver<Control>,
    tasks: JoinSet<()>,
    /// Child task → message index, so a panicked send can still be settled.
    sending: HashMap<Id, usize>,
}

impl Dispatcher {
    pub fn new(job: Arc<JobHandle>, ctx: DispatchContext) -> Self {
        let control = job.control.subscribe();
        Self {
            job,
            ctx,
            control,
            tasks: JoinSet::new(),
            sending: HashMap::new(),
        }
    }

    /// Drive the job until it is terminal.
    pub async fn run(mut self) {
        let job_id = self.job.id;
        let test_mode = {
            let mut inner = self.job.inner.lock().await;
            if inner.job.status == JobStatus::Queued {
                let now = self.ctx.clock.now();
                inner.transition(JobStatus::Running, None, now, self.ctx.publisher.as_ref());
                inner.publish_progress(self.ctx.publisher.as_ref());
            }
            inner.job.test_mode
        };
        info!(job_id = %job_id, test_mode, "Dispatcher started");

        loop {
            self.reap_finished().await;
            self.control.borrow_and_update();

            let now = self.ctx.clock.now();
            let (status, step) = {
                let inner = self.job.inner.lock().await;
                (inner.job.status, inner.next_step(now))
            };

            match status {
                JobStatus::Completed | JobStatus::Failed => break,
                JobStatus::Queued | JobStatus::Paused => {
                    self.wait_for_change().await;
                    continue;
                }
                JobStatus::Running => {}
            }

            if self.tasks.len() >= self.ctx.config.max_in_flight_per_job {
                self.join_one().await;
                continue;
            }

            match step {
                Step::Finished => break,
                Step::Drained => {
                    let mut inner = self.job.inner.lock().await;
                    let now = self.ctx.clock.now();
                    if inner.complete_if_drained(now, self.ctx.publisher.as_ref()) {
                        break;
                    }
                    drop(inner);
                    self.wait_for_change().await;
                }
                Step::Send => {
                    if !test_mode && !self.acquire_token().await {
                        continue;
                    }
                    let outgoing = {
                        let mut inner = self.job.inner.lock().await;
                        if inner.job.status == JobStatus::Running {
                            let now = self.ctx.clock.now();
                            inner.take_next(now, self.ctx.publisher.as_ref())
                        } else {
                            None
                        }
                    };
                    match outgoing {
                        Some(outgoing) => self.spawn_send(outgoing, test_mode),
                        // Paused or cancelled while waiting for the token.
                        None if !test_mode => {
                            self.ctx.limiter.release(self.job.bucket.as_ref());
                        }
                        None => {}
                    }
                }
                Step::WaitUntil(at) => {
                    let delay = until(now, at);
                    debug!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "Waiting for next due message");
                    let clock = self.ctx.clock.clone();
                    tokio::select! {
                        _ = clock.sleep(delay) => {}
                        _ = self.control.changed() => {}
                        Some(joined) = self.tasks.join_next_with_id() => self.settle(joined).await,
                    }
                }
                Step::Idle => self.wait_for_change().await,
            }
        }

        // Cancelled or aborted jobs still settle whatever is in flight.
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.settle(joined).await;
        }
        info!(job_id = %job_id, "Dispatcher stopped");
    }

    /// Wait for a token, giving up early if the job is paused or stopped.
    async fn acquire_token(&mut self) -> bool {
        let limiter = self.ctx.limiter.clone();
        let bucket = self.job.bucket.as_ref();
        tokio::select! {
            _ = limiter.acquire(bucket) => true,
            _ = self.control.changed() => false,
        }
    }

    fn spawn_send(&mut self, outgoing: Outgoing, test_mode: bool) {
        let job = self.job.clone();
        let ctx = self.ctx.clone();
        let index = outgoing.index;

        let handle = self.tasks.spawn(async move {
            let outcome = if test_mode {
                debug!(job_id = %job.id, phone = %outgoing.phone, "Test mode, skipping transport");
                Ok(())
            } else {
                let timeout = ctx.config.send_timeout;
                match tokio::time::timeout(timeout, ctx.sender.send(&outgoing.phone, &outgoing.body)).await {
                    Ok(result) => result,
                    Err(_) => Err(SendError::Timeout(timeout)),
                }
            };

            let mut inner = job.inner.lock().await;
            let now = ctx.clock.now();
            inner.record_outcome(outgoing.index, outcome, now, &ctx.config, ctx.publisher.as_ref());
        });
        self.sending.insert(handle.id(), index);
    }

    async fn settle(&mut self, joined: Result<(Id, ()), JoinError>) {
        match joined {
            Ok((id, ())) => {
                self.sending.remove(&id);
            }
            Err(e) => {
                let Some(index) = self.sending.remove(&e.id()) else {
                    return;
                };
                error!(job_id = %self.job.id, error = %e, "Send task panicked");
                let mut inner = self.job.inner.lock().await;
                let now = self.ctx.clock.now();
                inner.record_outcome(
                    index,
                    Err(SendError::Rejected(format!("send task aborted: {e}"))),
                    now,
                    &self.ctx.config,
                    self.ctx.publisher.as_ref(),
                );
            }
        }
    }

    async fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.settle(joined).await;
        }
    }

    async fn join_one(&mut self) {
        if let Some(joined) = self.tasks.join_next_with_id().await {
            self.settle(joined).await;
        }
    }

    /// Sleep until a control signal arrives or an in-flight send returns.
    async fn wait_for_change(&mut self) {
        if self.tasks.is_empty() {
            let _ = self.control.changed().await;
            return;
        }
        tokio::select! {
            _ = self.control.changed() => {}
            Some(joined) = self.tasks.join_next_with_id() => self.settle(joined).await,
        }
    }
}
