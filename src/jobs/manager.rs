//! Job lifecycle: creation, control requests, status queries, retention.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::dispatcher::{DispatchContext, Dispatcher};
use super::handle::{CANCELLED_REASON, Control, JobHandle, JobInner};
use super::model::{
    ControlOutcome, CreateJobRequest, CreateJobResponse, Job, JobSpec, JobStatusResponse,
    JobSummary, PlannedMessage, QueuedMessage,
};
use super::queue::MessageQueue;
use super::state::JobStatus;
use crate::clock::Clock;
use crate::conditions::evaluator::normalize_phone;
use crate::conditions::{Condition, MatchResult, match_sheet};
use crate::config::EngineConfig;
use crate::error::{JobError, Result, SheetError, ValidationError};
use crate::events::EventPublisher;
use crate::ratelimit::RateLimiter;
use crate::sheet::{Row, Sheet, SheetSource};
use crate::template::{self, Rendered};
use crate::transport::MessageSender;

/// Collaborators the engine is wired to.
#[derive(Clone)]
pub struct EngineDeps {
    pub sheets: Arc<dyn SheetSource>,
    pub sender: Arc<dyn MessageSender>,
    pub limiter: Arc<RateLimiter>,
    pub publisher: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
}

pub struct JobManager {
    deps: EngineDeps,
    config: Arc<EngineConfig>,
    jobs: RwLock<HashMap<Uuid, Arc<JobHandle>>>,
}

impl JobManager {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config: Arc::new(config),
            jobs: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn sheet(&self, file_id: Uuid) -> Result<Arc<Sheet>> {
        self.deps
            .sheets
            .get_sheet(file_id)
            .await
            .ok_or_else(|| SheetError::NotFound { id: file_id }.into())
    }

    async fn handle(&self, job_id: Uuid) -> Result<Arc<JobHandle>> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound { id: job_id }.into())
    }

    // ── Queries without side effects ────────────────────────────────

    /// Rows and phone numbers a condition set selects from a file.
    pub async fn evaluate(&self, file_id: Uuid, conditions: &[Condition]) -> Result<MatchResult> {
        let sheet = self.sheet(file_id).await?;
        Ok(match_sheet(&sheet, conditions)?)
    }

    /// Render a template against `row`, or against the file's first row.
    pub async fn preview_message(
        &self,
        template: &str,
        file_id: Option<Uuid>,
        row: Option<Row>,
    ) -> Result<Rendered> {
        if template.trim().is_empty() {
            return Err(ValidationError::EmptyTemplate.into());
        }
        let row = match (row, file_id) {
            (Some(row), _) => row,
            (None, Some(file_id)) => {
                let sheet = self.sheet(file_id).await?;
                sheet.rows.first().cloned().unwrap_or_default()
            }
            (None, None) => Row::new(),
        };
        Ok(template::render(template, &row))
    }

    // ── Creation ────────────────────────────────────────────────────

    /// Validate a send request, select its recipients and start the job.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<CreateJobResponse> {
        if request.template.trim().is_empty() {
            return Err(ValidationError::EmptyTemplate.into());
        }
        let sheet = self.sheet(request.file_id).await?;
        let phone_column = sheet
            .phone_column
            .clone()
            .ok_or(ValidationError::MissingPhoneColumn {
                file_id: request.file_id,
            })?;

        let matched = match_sheet(&sheet, &request.conditions)?;

        let subset: Option<HashSet<String>> = request
            .phone_numbers
            .as_ref()
            .map(|numbers| numbers.iter().map(|n| n.trim().to_string()).collect());

        let mut seen = HashSet::new();
        let plan: Vec<PlannedMessage> = matched
            .matches
            .into_iter()
            .filter_map(|row| {
                let phone = row.get(&phone_column).and_then(normalize_phone)?;
                Some((phone, row))
            })
            .filter(|(phone, _)| subset.as_ref().is_none_or(|s| s.contains(phone)))
            .filter(|(phone, _)| seen.insert(phone.clone()))
            .map(|(phone, row)| PlannedMessage::new(phone, row))
            .collect();

        let unresolved = template::unresolvable_variables(&request.template, &sheet.headers);
        if !unresolved.is_empty() {
            warn!(
                file_id = %request.file_id,
                variables = ?unresolved,
                "Template references columns the file does not have"
            );
        }

        let spec = JobSpec {
            file_id: request.file_id,
            template: request.template,
            conditions: request.conditions,
            test_mode: request.test_mode,
        };
        let mut response = self.submit_plan(spec, plan).await?;
        for variable in unresolved {
            if !response.warnings.contains(&variable) {
                response.warnings.push(variable);
            }
        }
        Ok(response)
    }

    /// Start a job from explicit planned messages.
    ///
    /// Bodies are rendered here, once. The message set is fixed from this
    /// point on: retries reuse their slot.
    pub async fn submit_plan(
        &self,
        spec: JobSpec,
        plan: Vec<PlannedMessage>,
    ) -> Result<CreateJobResponse> {
        if spec.template.trim().is_empty() {
            return Err(ValidationError::EmptyTemplate.into());
        }
        if plan.is_empty() {
            return Err(ValidationError::NoRecipients.into());
        }

        let now = self.deps.clock.now();
        let job = Job::new(&spec, plan.len(), now);
        let job_id = job.id;

        let mut warnings: Vec<String> = Vec::new();
        let messages: Vec<QueuedMessage> = plan
            .into_iter()
            .map(|planned| {
                let rendered = template::render(&spec.template, &planned.data);
                for name in rendered.unresolved {
                    if !warnings.contains(&name) {
                        warnings.push(name);
                    }
                }
                QueuedMessage::new(job_id, planned, rendered.text, now)
            })
            .collect();

        let total = messages.len();
        let handle = JobHandle::new(
            JobInner::new(job, MessageQueue::new(messages)),
            RateLimiter::job_bucket(&self.config),
        );

        {
            let mut jobs = self.jobs.write().await;
            let mut active = 0;
            for existing in jobs.values() {
                if existing.inner.lock().await.job.status.is_active() {
                    active += 1;
                }
            }
            if active >= self.config.max_concurrent_jobs {
                warn!(active, max = self.config.max_concurrent_jobs, "Rejecting job, too many active");
                return Err(JobError::MaxJobsExceeded {
                    max: self.config.max_concurrent_jobs,
                }
                .into());
            }
            jobs.insert(job_id, handle.clone());
        }

        info!(
            job_id = %job_id,
            file_id = %spec.file_id,
            total,
            test_mode = spec.test_mode,
            "Job created"
        );
        handle.inner.lock().await.publish_progress(self.deps.publisher.as_ref());

        let dispatcher = Dispatcher::new(handle.clone(), self.dispatch_context());
        handle.set_dispatcher(tokio::spawn(dispatcher.run()));

        Ok(CreateJobResponse {
            job_id,
            total_messages: total,
            status: JobStatus::Queued,
            warnings,
        })
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            sender: self.deps.sender.clone(),
            limiter: self.deps.limiter.clone(),
            publisher: self.deps.publisher.clone(),
            clock: self.deps.clock.clone(),
            config: self.config.clone(),
        }
    }

    // ── Status ──────────────────────────────────────────────────────

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusResponse> {
        let handle = self.handle(job_id).await?;
        let inner = handle.inner.lock().await;
        Ok(inner.snapshot())
    }

    /// Summaries of every retained job, newest first.
    pub async fn list_jobs(&self) -> Vec<JobSummary> {
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(JobSummary::from(&handle.inner.lock().await.job));
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Stop pulling new messages. In-flight sends still complete.
    pub async fn pause(&self, job_id: Uuid) -> Result<ControlOutcome> {
        let handle = self.handle(job_id).await?;
        let mut inner = handle.inner.lock().await;
        let status = inner.job.status;
        let outcome = match status {
            JobStatus::Completed | JobStatus::Failed => ControlOutcome::AlreadyTerminal { status },
            JobStatus::Paused => ControlOutcome::AlreadyInState { status },
            JobStatus::Queued | JobStatus::Running => {
                let now = self.deps.clock.now();
                inner.transition(JobStatus::Paused, Some("pause requested".into()), now, self.deps.publisher.as_ref());
                inner.publish_progress(self.deps.publisher.as_ref());
                handle.signal(Control::Pause);
                ControlOutcome::Applied {
                    status: JobStatus::Paused,
                }
            }
        };
        log_outcome(job_id, "pause", outcome);
        Ok(outcome)
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<ControlOutcome> {
        let handle = self.handle(job_id).await?;
        let mut inner = handle.inner.lock().await;
        let status = inner.job.status;
        let outcome = match status {
            JobStatus::Completed | JobStatus::Failed => ControlOutcome::AlreadyTerminal { status },
            JobStatus::Queued | JobStatus::Running => ControlOutcome::AlreadyInState { status },
            JobStatus::Paused => {
                let now = self.deps.clock.now();
                inner.transition(JobStatus::Running, Some("resume requested".into()), now, self.deps.publisher.as_ref());
                inner.publish_progress(self.deps.publisher.as_ref());
                handle.signal(Control::Run);
                ControlOutcome::Applied {
                    status: JobStatus::Running,
                }
            }
        };
        log_outcome(job_id, "resume", outcome);
        Ok(outcome)
    }

    /// Fail the job. Waiting messages fail now, in-flight ones when they return.
    pub async fn cancel(&self, job_id: Uuid) -> Result<ControlOutcome> {
        let outcome = self.abort(job_id, CANCELLED_REASON).await?;
        log_outcome(job_id, "cancel", outcome);
        Ok(outcome)
    }

    /// Fail the job with an arbitrary reason.
    pub async fn abort(&self, job_id: Uuid, reason: &str) -> Result<ControlOutcome> {
        let handle = self.handle(job_id).await?;
        let mut inner = handle.inner.lock().await;
        let status = inner.job.status;
        if status.is_terminal() {
            return Ok(ControlOutcome::AlreadyTerminal { status });
        }
        let now = self.deps.clock.now();
        inner.fail(reason, now, self.deps.publisher.as_ref());
        handle.signal(Control::Stop);
        Ok(ControlOutcome::Applied {
            status: JobStatus::Failed,
        })
    }

    /// Fail every active job.
    pub async fn abort_all(&self, reason: &str) -> usize {
        let ids: Vec<Uuid> = self.jobs.read().await.keys().copied().collect();
        let mut aborted = 0;
        for id in ids {
            if let Ok(ControlOutcome::Applied { .. }) = self.abort(id, reason).await {
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, reason = %reason, "Aborted active jobs");
        }
        aborted
    }

    // ── Retention ───────────────────────────────────────────────────

    /// Drop a terminal job and its messages.
    pub async fn purge(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let handle = jobs.get(&job_id).ok_or(JobError::NotFound { id: job_id })?;
        if handle.inner.lock().await.job.status.is_active() {
            return Err(JobError::StillActive { id: job_id }.into());
        }
        jobs.remove(&job_id);
        info!(job_id = %job_id, "Job purged");
        Ok(())
    }

    /// Wait for the job's dispatcher to exit, then return its final status.
    pub async fn wait(&self, job_id: Uuid) -> Result<JobStatusResponse> {
        let handle = self.handle(job_id).await?;
        if let Some(dispatcher) = handle.take_dispatcher() {
            if let Err(e) = dispatcher.await {
                error!(job_id = %job_id, error = %e, "Dispatcher task failed");
            }
        }
        self.status(job_id).await
    }

    /// Abort everything still running and wait for the dispatchers to exit.
    pub async fn shutdown(&self) {
        self.abort_all("server shutting down").await;
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        for handle in handles {
            if let Some(dispatcher) = handle.take_dispatcher() {
                let _ = dispatcher.await;
            }
        }
    }

    /// Periodically probe the transport. A fatal probe aborts every active job.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match manager.deps.sender.health_check().await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!(transport = manager.deps.sender.name(), error = %e, "Transport health check failed");
                        manager.abort_all(e.public_reason()).await;
                    }
                    Err(e) => {
                        warn!(transport = manager.deps.sender.name(), error = %e, "Transport health check degraded");
                    }
                }
            }
        })
    }
}

fn log_outcome(job_id: Uuid, action: &str, outcome: ControlOutcome) {
    match outcome {
        ControlOutcome::Applied { status } => {
            info!(job_id = %job_id, action, status = %status, "Control request applied");
        }
        ControlOutcome::AlreadyInState { status } => {
            info!(job_id = %job_id, action, status = %status, "Control request was a no-op");
        }
        ControlOutcome::AlreadyTerminal { status } => {
            warn!(job_id = %job_id, action, status = %status, "Control request rejected, job is terminal");
        }
    }
}
