//! Cooperative job supervisor.
//!
//! One monitor loop wakes every CHECK_INTERVAL, builds a [`JobContext`]
//! (idle seconds plus the job's own last run), and asks each registered job
//! whether it wants to fire. Pending flags left behind by a previous
//! session run immediately at startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vestige_queue::{keys, Queue};

use crate::{Job, JobContext};

/// Cheaply cloneable supervisor handle. Register jobs before calling
/// [`Scheduler::start`]; registration order is shutdown order.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedCore>,
}

struct SchedCore {
    user_name: String,
    queue: Arc<dyn Queue>,
    jobs: Vec<Arc<dyn Job>>,
    last_runs: StdMutex<HashMap<&'static str, DateTime<Utc>>>,
    check_interval: Duration,
    running: AtomicBool,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        user_name: impl Into<String>,
        queue: Arc<dyn Queue>,
        check_interval: Duration,
    ) -> Self {
        Self {
            core: Arc::new(SchedCore {
                user_name: user_name.into(),
                queue,
                jobs: Vec::new(),
                last_runs: StdMutex::new(HashMap::new()),
                check_interval,
                running: AtomicBool::new(false),
                monitor: StdMutex::new(None),
            }),
        }
    }

    /// Register a job; chainable. Only valid before `start`.
    pub fn register(mut self, job: Arc<dyn Job>) -> Self {
        info!(job = job.name(), "registered job");
        Arc::get_mut(&mut self.core)
            .expect("jobs must be registered before the scheduler starts")
            .jobs
            .push(job);
        self
    }

    /// Record user activity; idle time is measured from this.
    pub async fn record_activity(&self) {
        let _ = self
            .core
            .queue
            .set(
                &keys::last_activity(&self.core.user_name),
                &Utc::now().to_rfc3339(),
            )
            .await;
    }

    /// Start: replay pending work from the previous session, then spawn the
    /// monitor loop.
    pub async fn start(&self) {
        self.core.running.store(true, Ordering::SeqCst);
        SchedCore::run_pending_checks(&self.core).await;

        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            while core.running.load(Ordering::SeqCst) {
                tokio::time::sleep(core.check_interval).await;
                SchedCore::tick(&core).await;
            }
        });
        *self.core.monitor.lock().unwrap() = Some(handle);
        info!(jobs = self.core.jobs.len(), "scheduler started");
    }

    /// One supervision pass over every job. Exposed for tests and for
    /// interfaces that drive their own cadence.
    pub async fn tick(&self) {
        SchedCore::tick(&self.core).await;
    }

    /// Graceful shutdown: stop the monitor, then notify every job in
    /// registration order. A failing shutdown hook never blocks the rest.
    pub async fn stop(&self) {
        self.core.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.core.monitor.lock().unwrap().take() {
            handle.abort();
        }

        for job in &self.core.jobs {
            let ctx = self.core.build_context(job.name()).await;
            job.on_shutdown(&ctx).await;
        }
        info!("scheduler stopped");
    }

    #[cfg(test)]
    async fn idle_seconds(&self) -> f64 {
        self.core.idle_seconds().await
    }
}

impl SchedCore {
    async fn idle_seconds(&self) -> f64 {
        let raw = self
            .queue
            .get(&keys::last_activity(&self.user_name))
            .await
            .ok()
            .flatten();
        let Some(raw) = raw else {
            return 0.0;
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| (Utc::now() - ts.with_timezone(&Utc)).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    async fn build_context(&self, job_name: &str) -> JobContext {
        JobContext {
            user_name: self.user_name.clone(),
            queue: self.queue.clone(),
            idle_seconds: self.idle_seconds().await,
            last_run: self.last_runs.lock().unwrap().get(job_name).copied(),
        }
    }

    async fn run_pending_checks(core: &Arc<Self>) {
        for job in &core.jobs {
            let pending_key = keys::pending(&core.user_name, job.name());
            let pending = core.queue.get(&pending_key).await.ok().flatten();
            if pending.is_some() {
                info!(job = job.name(), "found pending work from previous session");
                let _ = core.queue.delete(&pending_key).await;
                let ctx = core.build_context(job.name()).await;
                Self::execute_job(core, job.clone(), ctx).await;
            }
        }
    }

    async fn tick(core: &Arc<Self>) {
        for job in &core.jobs {
            let ctx = core.build_context(job.name()).await;
            if job.should_run(&ctx).await {
                Self::execute_job(core, job.clone(), ctx).await;
            }
        }
    }

    async fn execute_job(core: &Arc<Self>, job: Arc<dyn Job>, ctx: JobContext) {
        info!(job = job.name(), "executing job");
        let result = job.execute(&ctx).await;
        core.last_runs.lock().unwrap().insert(job.name(), Utc::now());

        if !result.summary.is_empty() {
            if result.success {
                info!(job = job.name(), summary = %result.summary, "job finished");
            } else {
                warn!(job = job.name(), summary = %result.summary, "job reported failure");
            }
        }

        // A requested reschedule runs once after the delay; it does not
        // chain further reschedules.
        if let Some(delay) = result.reschedule_seconds {
            let core = core.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                if !core.running.load(Ordering::SeqCst) {
                    return;
                }
                let ctx = core.build_context(job.name()).await;
                let result = job.execute(&ctx).await;
                core.last_runs.lock().unwrap().insert(job.name(), Utc::now());
                info!(job = job.name(), summary = %result.summary, "rescheduled run finished");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use vestige_queue::MemoryQueue;

    use crate::JobResult;

    struct CountingJob {
        runs: AtomicUsize,
        shutdowns: AtomicUsize,
        fire: bool,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn should_run(&self, _ctx: &JobContext) -> bool {
            self.fire
        }

        async fn execute(&self, _ctx: &JobContext) -> JobResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            JobResult::ok("ran")
        }

        async fn on_shutdown(&self, ctx: &JobContext) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            let _ = ctx
                .queue
                .set(&keys::pending(&ctx.user_name, "counting"), "true")
                .await;
        }
    }

    fn job(fire: bool) -> Arc<CountingJob> {
        Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            fire,
        })
    }

    #[tokio::test]
    async fn tick_runs_only_willing_jobs() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
        let eager = job(true);
        let lazy = job(false);
        let scheduler = Scheduler::new("u", queue, Duration::from_secs(60))
            .register(eager.clone())
            .register(lazy.clone());

        scheduler.tick().await;
        assert_eq!(eager.runs.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_flag_replays_at_start_and_shutdown_notifies() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
        queue
            .set(&keys::pending("u", "counting"), "true")
            .await
            .unwrap();

        let j = job(false);
        let scheduler =
            Scheduler::new("u", queue.clone(), Duration::from_secs(3600)).register(j.clone());

        scheduler.start().await;
        // The pending flag fired the job once despite should_run being false.
        assert_eq!(j.runs.load(Ordering::SeqCst), 1);
        assert!(queue
            .get(&keys::pending("u", "counting"))
            .await
            .unwrap()
            .is_none());

        scheduler.stop().await;
        assert_eq!(j.shutdowns.load(Ordering::SeqCst), 1);
        // Shutdown re-set the pending flag for the next session.
        assert!(queue
            .get(&keys::pending("u", "counting"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn idle_seconds_come_from_last_activity() {
        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
        let scheduler = Scheduler::new("u", queue.clone(), Duration::from_secs(60));

        // No activity recorded yet: idle reads as zero.
        assert_eq!(scheduler.idle_seconds().await, 0.0);

        let past = Utc::now() - chrono::Duration::seconds(400);
        queue
            .set(&keys::last_activity("u"), &past.to_rfc3339())
            .await
            .unwrap();
        let idle = scheduler.idle_seconds().await;
        assert!(idle >= 399.0 && idle < 500.0, "idle={idle}");
    }
}
