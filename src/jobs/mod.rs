//! Bulk-send jobs: state machine, message queue, dispatcher and manager.

pub mod dispatcher;
pub mod handle;
pub mod manager;
pub mod model;
pub mod queue;
pub mod state;

pub use handle::CANCELLED_REASON;
pub use manager::{EngineDeps, JobManager};
pub use model::{
    ControlOutcome, CreateJobRequest, CreateJobResponse, Job, JobProgress, JobSpec,
    JobStatusResponse, JobSummary, MessageAttempt, MessageResult, MessageStatus, PlannedMessage,
    QueuedMessage,
};
pub use state::{JobStatus, StateTransition};
