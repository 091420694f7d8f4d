//! End-to-end tests for the job engine.
//!
//! Every test drives a real `JobManager` against a scripted transport and a
//! manual clock, so retry backoff and rate ceilings are measured in virtual
//! time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

use bulk_send::clock::{Clock, ManualClock};
use bulk_send::conditions::{Condition, ConditionOperator};
use bulk_send::config::EngineConfig;
use bulk_send::error::SendError;
use bulk_send::events::{JobEvent, RecordingPublisher};
use bulk_send::jobs::{
    CANCELLED_REASON, ControlOutcome, CreateJobRequest, EngineDeps, JobManager, JobSpec,
    JobStatus, MessageStatus, PlannedMessage,
};
use bulk_send::ratelimit::{RateLimiter, TokenBucket};
use bulk_send::sheet::{CellValue, InMemorySheetStore, Row, Sheet};
use bulk_send::transport::MessageSender;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Scripted transport ──────────────────────────────────────────────────

/// Decides the outcome of a send from the phone and its 0-based attempt.
type Script = Box<dyn Fn(&str, usize) -> Result<(), SendError> + Send + Sync>;

#[derive(Debug, Clone)]
struct Call {
    phone: String,
    body: String,
    at: DateTime<Utc>,
}

struct ScriptedSender {
    clock: Arc<ManualClock>,
    script: Script,
    calls: Mutex<Vec<Call>>,
    /// Call index that blocks until the notify fires.
    gate: Option<(usize, Arc<Notify>)>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight_per_phone: AtomicUsize,
}

impl ScriptedSender {
    fn new(
        clock: Arc<ManualClock>,
        script: impl Fn(&str, usize) -> Result<(), SendError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            clock,
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            gate: None,
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight_per_phone: AtomicUsize::new(0),
        }
    }

    fn succeeding(clock: Arc<ManualClock>) -> Self {
        Self::new(clock, |_, _| Ok(()))
    }

    fn gated(mut self, call_index: usize, notify: Arc<Notify>) -> Self {
        self.gate = Some((call_index, notify));
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, phone: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.phone == phone).collect()
    }
}

#[async_trait]
impl MessageSender for ScriptedSender {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, phone: &str, body: &str) -> Result<(), SendError> {
        let (index, attempt) = {
            let mut calls = self.calls.lock().unwrap();
            let attempt = calls.iter().filter(|c| c.phone == phone).count();
            calls.push(Call {
                phone: phone.to_string(),
                body: body.to_string(),
                at: self.clock.now(),
            });
            (calls.len() - 1, attempt)
        };

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(phone.to_string()).or_default();
            *count += 1;
            self.max_in_flight_per_phone.fetch_max(*count, Ordering::SeqCst);
        }

        if let Some((gate_index, notify)) = &self.gate {
            if *gate_index == index {
                notify.notified().await;
            }
        }
        tokio::task::yield_now().await;

        *self.in_flight.lock().unwrap().get_mut(phone).unwrap() -= 1;
        (self.script)(phone, attempt)
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    manager: Arc<JobManager>,
    store: Arc<InMemorySheetStore>,
    publisher: Arc<RecordingPublisher>,
    clock: Arc<ManualClock>,
    sender: Arc<ScriptedSender>,
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        max_retries: 3,
        retry_base_delay: Duration::from_secs(1),
        retry_max_delay: Duration::from_secs(3),
        ..EngineConfig::default()
    }
}

fn harness_with(
    clock: Arc<ManualClock>,
    config: EngineConfig,
    global: TokenBucket,
    sender: ScriptedSender,
) -> Harness {
    let store = InMemorySheetStore::new();
    let publisher = RecordingPublisher::new();
    let sender = Arc::new(sender);
    let manager = JobManager::new(
        config,
        EngineDeps {
            sheets: store.clone(),
            sender: sender.clone(),
            limiter: RateLimiter::new(global, clock.clone()),
            publisher: publisher.clone(),
            clock: clock.clone(),
        },
    );
    Harness {
        manager,
        store,
        publisher,
        clock,
        sender,
    }
}

/// Generous global bucket so throttling never interferes.
fn unthrottled() -> TokenBucket {
    TokenBucket::new(1000, 1000.0)
}

fn harness(config: EngineConfig, script: impl Fn(&str, usize) -> Result<(), SendError> + Send + Sync + 'static) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let sender = ScriptedSender::new(clock.clone(), script);
    harness_with(clock, config, unthrottled(), sender)
}

async fn upload_members(store: &InMemorySheetStore) -> Uuid {
    let sheet = Sheet::from_table(
        "members.csv",
        vec!["phone".into(), "tier".into()],
        vec![
            vec!["+1".into(), "gold".into()],
            vec!["+2".into(), "silver".into()],
            vec!["+3".into(), "gold".into()],
        ],
        None,
    )
    .unwrap();
    store.insert(sheet).await.file_id
}

async fn upload_numbers(store: &InMemorySheetStore, count: usize) -> Uuid {
    let rows = (0..count)
        .map(|i| vec![CellValue::from(format!("+{}", 100 + i)), CellValue::from(i as i64)])
        .collect();
    let sheet = Sheet::from_table("bulk.csv", vec!["phone".into(), "n".into()], rows, None).unwrap();
    store.insert(sheet).await.file_id
}

fn send_request(file_id: Uuid, template: &str) -> CreateJobRequest {
    CreateJobRequest {
        file_id,
        template: template.into(),
        conditions: vec![],
        test_mode: false,
        phone_numbers: None,
    }
}

fn spec(template: &str) -> JobSpec {
    JobSpec {
        file_id: Uuid::new_v4(),
        template: template.into(),
        conditions: vec![],
        test_mode: false,
    }
}

async fn wait_for_calls(sender: &ScriptedSender, count: usize) {
    while sender.calls().len() < count {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn transitions_to(events: &[JobEvent], target: JobStatus) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, JobEvent::StatusChanged { status, .. } if *status == target))
        .count()
}

fn assert_progress_consistent(events: &[JobEvent]) {
    let mut seen = 0;
    for event in events {
        if let JobEvent::JobProgress { progress, .. } = event {
            seen += 1;
            assert_eq!(
                progress.total,
                progress.sent + progress.failed + progress.pending,
                "inconsistent progress: {progress:?}"
            );
        }
    }
    assert!(seen > 0, "no progress events observed");
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn gold_members_receive_rendered_message() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(fast_config(), |_, _| Ok(()));
        let file_id = upload_members(&h.store).await;

        let mut request = send_request(file_id, "Hi {{tier}} member");
        request.conditions = vec![Condition::new("tier", ConditionOperator::Equals, "gold")];
        let created = h.manager.create_job(request).await.unwrap();
        assert_eq!(created.total_messages, 2);
        assert_eq!(created.status, JobStatus::Queued);

        let status = h.manager.wait(created.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.progress.total, 2);
        assert_eq!(status.progress.sent, 2);
        assert_eq!(status.progress.percentage, 100);

        let mut sent: Vec<(String, String)> = h
            .sender
            .calls()
            .into_iter()
            .map(|c| (c.phone, c.body))
            .collect();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                ("+1".to_string(), "Hi gold member".to_string()),
                ("+3".to_string(), "Hi gold member".to_string()),
            ]
        );

        let events = h.publisher.events_for(created.job_id);
        assert_progress_consistent(&events);
        assert!(matches!(events.last(), Some(JobEvent::JobProgress { .. })));
        assert_eq!(
            events.iter().filter(|e| matches!(e, JobEvent::JobCompleted { .. })).count(),
            1
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_mode_counts_sent_without_transport() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(fast_config(), |_, _| Ok(()));
        let file_id = upload_members(&h.store).await;

        let mut request = send_request(file_id, "Hi {{tier}}");
        request.conditions = vec![Condition::new("tier", ConditionOperator::Equals, "silver")];
        request.test_mode = true;
        let created = h.manager.create_job(request).await.unwrap();

        let status = h.manager.wait(created.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.progress.total, 1);
        assert_eq!(status.progress.sent, 1);
        assert_eq!(status.results[0].status, MessageStatus::Sent);
        assert!(h.sender.calls().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retries_are_bounded_and_backed_off() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(fast_config(), |_, _| Err(SendError::Transient("channel busy".into())));
        let file_id = upload_members(&h.store).await;

        let mut request = send_request(file_id, "Hello");
        request.conditions = vec![Condition::new("tier", ConditionOperator::Equals, "silver")];
        let created = h.manager.create_job(request).await.unwrap();
        let status = h.manager.wait(created.job_id).await.unwrap();

        // max_retries + 1 attempts, then a permanent failure.
        let calls = h.sender.calls_to("+2");
        assert_eq!(calls.len(), 4);
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.progress.failed, 1);
        assert_eq!(status.results[0].status, MessageStatus::Failed);
        assert_eq!(status.results[0].retry_count, 3);
        assert_eq!(status.results[0].error.as_deref(), Some("temporary delivery failure"));

        let gaps: Vec<i64> = calls
            .windows(2)
            .map(|w| (w[1].at - w[0].at).num_milliseconds())
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 3000]);
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]));

        let events = h.publisher.events_for(created.job_id);
        let retries = events
            .iter()
            .filter(|e| matches!(e, JobEvent::MessageStatus { status: MessageStatus::Retry, .. }))
            .count();
        assert_eq!(retries, 3);
        assert_progress_consistent(&events);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn recovered_retry_counts_as_sent() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(fast_config(), |phone, attempt| match (phone, attempt) {
            ("+101", 0) => Err(SendError::Timeout(Duration::from_secs(30))),
            ("+102", _) => Err(SendError::Rejected("not on network".into())),
            _ => Ok(()),
        });
        let file_id = upload_numbers(&h.store, 4).await;
        let created = h.manager.create_job(send_request(file_id, "n={{n}}")).await.unwrap();
        let status = h.manager.wait(created.job_id).await.unwrap();

        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.progress.sent, 3);
        assert_eq!(status.progress.failed, 1);
        assert_eq!(h.sender.calls_to("+101").len(), 2);
        // Rejections are not retried.
        assert_eq!(h.sender.calls_to("+102").len(), 1);

        let rejected = status.results.iter().find(|r| r.phone == "+102").unwrap();
        assert_eq!(rejected.error.as_deref(), Some("recipient rejected the message"));
        let recovered = status.results.iter().find(|r| r.phone == "+101").unwrap();
        assert_eq!(recovered.retry_count, 1);
        assert!(recovered.error.is_none());

        assert_progress_consistent(&h.publisher.events_for(created.job_id));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn global_rate_ceiling_holds() {
    timeout(TEST_TIMEOUT, async {
        // 2 sends per second, burst of 1.
        let clock = Arc::new(ManualClock::default());
        let sender = ScriptedSender::succeeding(clock.clone());
        let h = harness_with(clock, fast_config(), TokenBucket::new(1, 2.0), sender);

        let recipients = 20;
        let file_id = upload_numbers(&h.store, recipients).await;
        let start = h.clock.now();
        let created = h.manager.create_job(send_request(file_id, "hi")).await.unwrap();
        let status = h.manager.wait(created.job_id).await.unwrap();
        assert_eq!(status.progress.sent, recipients);

        let calls = h.sender.calls();
        let elapsed = (calls.last().unwrap().at - start).num_milliseconds();
        // (M - burst) / N seconds at minimum.
        assert!(elapsed >= 9_500 - 5, "dispatched too fast: {elapsed}ms");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn per_job_rate_ceiling_holds() {
    timeout(TEST_TIMEOUT, async {
        let config = EngineConfig {
            job_rate_per_minute: Some(60),
            job_burst: 1,
            ..fast_config()
        };
        let clock = Arc::new(ManualClock::default());
        let sender = ScriptedSender::succeeding(clock.clone());
        let h = harness_with(clock, config, unthrottled(), sender);

        let file_id = upload_numbers(&h.store, 5).await;
        let start = h.clock.now();
        let created = h.manager.create_job(send_request(file_id, "hi")).await.unwrap();
        h.manager.wait(created.job_id).await.unwrap();

        let elapsed = (h.sender.calls().last().unwrap().at - start).num_milliseconds();
        assert!(elapsed >= 4_000 - 5, "dispatched too fast: {elapsed}ms");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_mid_flight_fails_remaining() {
    timeout(TEST_TIMEOUT, async {
        let config = EngineConfig {
            max_in_flight_per_job: 1,
            ..fast_config()
        };
        let clock = Arc::new(ManualClock::default());
        let gate = Arc::new(Notify::new());
        let sender = ScriptedSender::succeeding(clock.clone()).gated(3, gate.clone());
        let h = harness_with(clock, config, unthrottled(), sender);

        let file_id = upload_numbers(&h.store, 10).await;
        let created = h.manager.create_job(send_request(file_id, "hi")).await.unwrap();

        // Three delivered, the fourth is stuck in the transport.
        wait_for_calls(&h.sender, 4).await;
        let outcome = h.manager.cancel(created.job_id).await.unwrap();
        assert_eq!(outcome, ControlOutcome::Applied { status: JobStatus::Failed });

        let during = h.manager.status(created.job_id).await.unwrap();
        assert_eq!(during.status, JobStatus::Failed);
        assert_eq!(during.progress.pending, 1);
        assert!(during.progress.is_consistent());

        // The in-flight attempt is not aborted; its result is recorded.
        gate.notify_one();
        let status = h.manager.wait(created.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.progress.pending, 0);
        assert_eq!(status.progress.sent, 4);
        assert_eq!(status.progress.failed, 6);
        assert_eq!(status.error.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(h.sender.calls().len(), 4);

        let again = h.manager.cancel(created.job_id).await.unwrap();
        assert_eq!(again, ControlOutcome::AlreadyTerminal { status: JobStatus::Failed });

        let events = h.publisher.events_for(created.job_id);
        assert_progress_consistent(&events);
        assert_eq!(
            events.iter().filter(|e| matches!(e, JobEvent::JobFailed { .. })).count(),
            1
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let config = EngineConfig {
            max_in_flight_per_job: 1,
            ..fast_config()
        };
        let clock = Arc::new(ManualClock::default());
        let gate = Arc::new(Notify::new());
        let sender = ScriptedSender::succeeding(clock.clone()).gated(0, gate.clone());
        let h = harness_with(clock, config, unthrottled(), sender);

        let file_id = upload_numbers(&h.store, 3).await;
        let job_id = h.manager.create_job(send_request(file_id, "hi")).await.unwrap().job_id;
        wait_for_calls(&h.sender, 1).await;

        let first = h.manager.pause(job_id).await.unwrap();
        assert_eq!(first, ControlOutcome::Applied { status: JobStatus::Paused });
        let before = h.manager.status(job_id).await.unwrap().progress;
        let second = h.manager.pause(job_id).await.unwrap();
        assert_eq!(second, ControlOutcome::AlreadyInState { status: JobStatus::Paused });
        assert_eq!(h.manager.status(job_id).await.unwrap().progress, before);

        // The in-flight send completes, nothing new is pulled while paused.
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused = h.manager.status(job_id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.progress.sent, 1);
        assert_eq!(h.sender.calls().len(), 1);

        let resumed = h.manager.resume(job_id).await.unwrap();
        assert_eq!(resumed, ControlOutcome::Applied { status: JobStatus::Running });
        let again = h.manager.resume(job_id).await.unwrap();
        assert_eq!(again.status(), JobStatus::Running);
        assert!(matches!(again, ControlOutcome::AlreadyInState { .. }));

        let status = h.manager.wait(job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.progress.sent, 3);

        let events = h.publisher.events_for(job_id);
        assert_eq!(transitions_to(&events, JobStatus::Paused), 1);
        // queued → running, then paused → running.
        assert_eq!(transitions_to(&events, JobStatus::Running), 2);
        assert_eq!(transitions_to(&events, JobStatus::Completed), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn fatal_transport_error_aborts_job() {
    timeout(TEST_TIMEOUT, async {
        let config = EngineConfig {
            max_in_flight_per_job: 1,
            ..fast_config()
        };
        let h = harness(config, |phone, _| {
            if phone == "+102" {
                Err(SendError::Fatal("session logged out".into()))
            } else {
                Ok(())
            }
        });
        let file_id = upload_numbers(&h.store, 6).await;
        let created = h.manager.create_job(send_request(file_id, "hi")).await.unwrap();
        let status = h.manager.wait(created.job_id).await.unwrap();

        let reason = "campaign aborted: messaging channel unavailable";
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.error.as_deref(), Some(reason));
        assert_eq!(status.progress.sent, 2);
        assert_eq!(status.progress.failed, 4);
        assert_eq!(status.progress.pending, 0);
        assert_eq!(h.sender.calls().len(), 3);
        assert!(
            status
                .results
                .iter()
                .filter(|r| r.status == MessageStatus::Failed)
                .all(|r| r.error.as_deref() == Some(reason))
        );

        let events = h.publisher.events_for(created.job_id);
        assert!(events.iter().any(|e| matches!(e, JobEvent::JobFailed { error, .. } if error == reason)));
        assert!(!events.iter().any(|e| matches!(e, JobEvent::JobCompleted { .. })));
        assert_progress_consistent(&events);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn at_most_one_send_in_flight_per_phone() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(fast_config(), |_, _| Ok(()));

        let plan: Vec<PlannedMessage> = (0..10)
            .map(|i| {
                let phone = if i % 2 == 0 { "+1" } else { "+2" };
                PlannedMessage::new(phone, Row::from_pairs([("i", CellValue::from(i as i64))]))
            })
            .collect();
        let created = h.manager.submit_plan(spec("#{{i}}"), plan).await.unwrap();
        let status = h.manager.wait(created.job_id).await.unwrap();

        assert_eq!(status.progress.sent, 10);
        assert_eq!(h.sender.max_in_flight_per_phone.load(Ordering::SeqCst), 1);
        let bodies: Vec<String> = h.sender.calls_to("+1").into_iter().map(|c| c.body).collect();
        assert_eq!(bodies, vec!["#0", "#2", "#4", "#6", "#8"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn priority_and_schedule_order() {
    timeout(TEST_TIMEOUT, async {
        let config = EngineConfig {
            max_in_flight_per_job: 1,
            ..fast_config()
        };
        let h = harness(config, |_, _| Ok(()));
        let start = h.clock.now();
        let later = start + chrono::Duration::seconds(60);

        let plan = vec![
            PlannedMessage::new("+a", Row::new()).with_priority(5),
            PlannedMessage::new("+b", Row::new()).with_priority(1),
            PlannedMessage::new("+c", Row::new()).scheduled_at(later),
            PlannedMessage::new("+d", Row::new()).with_priority(1),
        ];
        let created = h.manager.submit_plan(spec("hi"), plan).await.unwrap();
        h.manager.wait(created.job_id).await.unwrap();

        let calls = h.sender.calls();
        let order: Vec<&str> = calls.iter().map(|c| c.phone.as_str()).collect();
        assert_eq!(order, vec!["+b", "+d", "+a", "+c"]);
        assert!(calls[3].at >= later);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn slow_transport_times_out() {
    timeout(TEST_TIMEOUT, async {
        struct SlowSender;

        #[async_trait]
        impl MessageSender for SlowSender {
            fn name(&self) -> &str {
                "slow"
            }

            async fn send(&self, _phone: &str, _body: &str) -> Result<(), SendError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }

        let clock = Arc::new(ManualClock::default());
        let store = InMemorySheetStore::new();
        let publisher = RecordingPublisher::new();
        let manager = JobManager::new(
            EngineConfig {
                max_retries: 0,
                send_timeout: Duration::from_millis(20),
                ..fast_config()
            },
            EngineDeps {
                sheets: store.clone(),
                sender: Arc::new(SlowSender),
                limiter: RateLimiter::new(unthrottled(), clock.clone()),
                publisher,
                clock,
            },
        );

        let file_id = upload_members(&store).await;
        let mut request = send_request(file_id, "hi");
        request.conditions = vec![Condition::new("tier", ConditionOperator::Equals, "silver")];
        let created = manager.create_job(request).await.unwrap();
        let status = manager.wait(created.job_id).await.unwrap();

        assert_eq!(status.progress.failed, 1);
        assert_eq!(status.results[0].error.as_deref(), Some("delivery timed out"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_jobs_share_the_global_bucket() {
    timeout(TEST_TIMEOUT, async {
        // 2 sends per second across both jobs, burst of 1.
        let clock = Arc::new(ManualClock::default());
        let sender = ScriptedSender::succeeding(clock.clone());
        let h = harness_with(clock, fast_config(), TokenBucket::new(1, 2.0), sender);

        let first = upload_numbers(&h.store, 10).await;
        let second = upload_numbers(&h.store, 10).await;
        let start = h.clock.now();
        let a = h.manager.create_job(send_request(first, "a")).await.unwrap();
        let b = h.manager.create_job(send_request(second, "b")).await.unwrap();

        let (sa, sb) = tokio::join!(h.manager.wait(a.job_id), h.manager.wait(b.job_id));
        assert_eq!(sa.unwrap().progress.sent, 10);
        assert_eq!(sb.unwrap().progress.sent, 10);

        let calls = h.sender.calls();
        assert_eq!(calls.len(), 20);
        assert!(calls.iter().any(|c| c.body == "a"));
        assert!(calls.iter().any(|c| c.body == "b"));

        // The k-th send overall can go out no sooner than k / 2 seconds in.
        for (k, call) in calls.iter().enumerate() {
            let at = (call.at - start).num_milliseconds();
            assert!(at >= k as i64 * 500 - 5, "send {k} at {at}ms beats the shared ceiling");
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_jobs_complete_and_purge() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(fast_config(), |_, _| Ok(()));
        let first = upload_numbers(&h.store, 5).await;
        let second = upload_members(&h.store).await;

        let a = h.manager.create_job(send_request(first, "a")).await.unwrap();
        let b = h.manager.create_job(send_request(second, "b")).await.unwrap();

        let (sa, sb) = tokio::join!(h.manager.wait(a.job_id), h.manager.wait(b.job_id));
        assert_eq!(sa.unwrap().progress.sent, 5);
        assert_eq!(sb.unwrap().progress.sent, 3);

        let jobs = h.manager.list_jobs().await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));

        h.manager.purge(a.job_id).await.unwrap();
        assert_eq!(h.manager.list_jobs().await.len(), 1);
    })
    .await
    .expect("test timed out");
}
