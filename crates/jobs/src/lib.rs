//! Background jobs and the scheduler that supervises them.
//!
//! Each job decides its own trigger in `should_run` (idle time, queue
//! volume, session flags) and reports back through [`JobResult`]. The
//! scheduler never crashes on a failing job; it logs and moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use vestige_queue::{keys, Queue};

mod dlq;
mod merge;
mod mood;
mod profile;
mod scheduler;

pub use dlq::DlqReplayJob;
pub use merge::MergeDetectionJob;
pub use mood::MoodCheckpointJob;
pub use profile::ProfileRefinementJob;
pub use scheduler::Scheduler;

/// Context handed to every job method.
#[derive(Clone)]
pub struct JobContext {
    pub user_name: String,
    pub queue: Arc<dyn Queue>,
    /// Seconds since the last user activity.
    pub idle_seconds: f64,
    /// When this job last executed in this session, if at all.
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobResult {
    pub success: bool,
    pub summary: String,
    pub reschedule_seconds: Option<f64>,
}

impl JobResult {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            reschedule_seconds: None,
        }
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            reschedule_seconds: None,
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    async fn should_run(&self, ctx: &JobContext) -> bool;
    async fn execute(&self, ctx: &JobContext) -> JobResult;
    /// Cleanup hook; default no-op.
    async fn on_shutdown(&self, _ctx: &JobContext) {}
}

/// User-visible maintenance notice under a short-TTL key. The TTL is the
/// crash guard: a dead job's warning expires on its own.
pub(crate) async fn set_maintenance_notice(queue: &dyn Queue, message: &str, ttl: Duration) {
    if let Err(err) = queue.setex(keys::JOB_WARNING, ttl, message).await {
        warn!(error = %err, "failed to set maintenance notice");
    }
}

pub(crate) async fn clear_maintenance_notice(queue: &dyn Queue) {
    if let Err(err) = queue.delete(keys::JOB_WARNING).await {
        warn!(error = %err, "failed to clear maintenance notice");
    }
}
