//! Interval scheduling for the background cycles.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    RepositoryCheck,
    ServerCheck,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::RepositoryCheck => "repository-check",
            JobKind::ServerCheck => "server-check",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    Backend(#[from] JobSchedulerError),
    #[error("job {0} is not registered")]
    UnknownJob(JobKind),
    #[error("interval for {0} must be greater than zero")]
    ZeroInterval(JobKind),
}

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobTask = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Registered {
    id: Uuid,
    interval: Duration,
    task: JobTask,
}

struct Inner {
    scheduler: JobScheduler,
    jobs: HashMap<JobKind, Registered>,
}

/// Owns the job scheduler. The mutex doubles as the registration lock, so
/// a reschedule is never observed half-done.
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            inner: Mutex::new(Inner {
                scheduler,
                jobs: HashMap::new(),
            }),
        })
    }

    fn build_job(kind: JobKind, interval: Duration, task: JobTask) -> Result<Job, SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(kind));
        }
        Ok(Job::new_repeated_async(interval, move |_uuid, mut _l| {
            let task = task.clone();
            Box::pin(async move {
                info!("{} triggered", kind);
                task().await;
            })
        })?)
    }

    /// Register `task` to run every `interval`. Registering a kind twice
    /// replaces the earlier job.
    pub async fn register(
        &self,
        kind: JobKind,
        interval: Duration,
        task: JobTask,
    ) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let job = Self::build_job(kind, interval, task.clone())?;
        let id = inner.scheduler.add(job).await?;
        if let Some(old) = inner.jobs.insert(kind, Registered { id, interval, task }) {
            inner.scheduler.remove(&old.id).await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.inner.lock().await.scheduler.start().await?;
        Ok(())
    }

    pub async fn next_run(&self, kind: JobKind) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let mut inner = self.inner.lock().await;
        let id = inner
            .jobs
            .get(&kind)
            .map(|r| r.id)
            .ok_or(SchedulerError::UnknownJob(kind))?;
        Ok(inner.scheduler.next_tick_for_job(id).await?)
    }

    pub async fn interval(&self, kind: JobKind) -> Option<Duration> {
        self.inner.lock().await.jobs.get(&kind).map(|r| r.interval)
    }

    /// Swap in a job with the new interval. The replacement is added before
    /// the old job is removed.
    pub async fn reschedule(&self, kind: JobKind, interval: Duration) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let (old_id, old_interval, task) = match inner.jobs.get(&kind) {
            Some(r) => (r.id, r.interval, r.task.clone()),
            None => return Err(SchedulerError::UnknownJob(kind)),
        };
        if old_interval == interval {
            return Ok(());
        }
        let job = Self::build_job(kind, interval, task.clone())?;
        let id = inner.scheduler.add(job).await?;
        inner.jobs.insert(kind, Registered { id, interval, task });
        if let Err(e) = inner.scheduler.remove(&old_id).await {
            warn!("failed to remove previous {} job {}: {}", kind, old_id, e);
        }
        info!("{} rescheduled: every {:?} (was {:?})", kind, interval, old_interval);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.inner.lock().await.scheduler.shutdown().await?;
        Ok(())
    }
}

/// Wrap an async closure as a [`JobTask`].
pub fn task<F, Fut>(f: F) -> JobTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as JobFuture)
}
