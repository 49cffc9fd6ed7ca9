//! Durable job queue: triggers an opaque handler at a given time, once or on
//! a recurring (fixed-interval or cron) schedule. Mirrors the teacher's
//! `Periodically` in spirit (a polling loop racing a `CancellationToken`) but
//! backs state with `sled` instead of an in-memory/Postgres pairing, since
//! nothing here assumes an external database.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Cancelled,
    Failed,
}

/// A recurrence rule. `None` on a `Job` means one-shot: it fires once at
/// `run_at` and then terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Recurrence {
    Interval(#[serde(with = "duration_secs")] StdDuration),
    Cron(String),
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// A persisted unit of scheduled work. The scheduler never interprets
/// `payload` itself; the handler registered alongside the job does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub base_backoff: StdDuration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    /// Set by `cancel_job` on a job already `Running`; the in-flight handler
    /// is left to finish, this is advisory only.
    pub cancel_requested: bool,
}

impl Job {
    pub fn one_shot(payload: serde_json::Value, run_at: DateTime<Utc>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            status: JobStatus::Pending,
            run_at,
            recurrence: None,
            attempts: 0,
            max_attempts,
            base_backoff: StdDuration::from_secs(5),
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: run_at,
            cancel_requested: false,
        }
    }

    pub fn recurring(
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        recurrence: Recurrence,
        max_attempts: u32,
    ) -> Result<Self, SchedulerError> {
        if let Recurrence::Cron(ref expr) = recurrence {
            Schedule::from_str(expr).map_err(|source| SchedulerError::InvalidCron {
                expr: expr.clone(),
                source,
            })?;
        }
        let mut job = Self::one_shot(payload, run_at, max_attempts);
        job.recurrence = Some(recurrence);
        Ok(job)
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type Handler = Arc<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

/// Computes the next fire time strictly greater than `after`.
fn next_occurrence(recurrence: &Recurrence, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match recurrence {
        Recurrence::Interval(interval) => {
            chrono::Duration::from_std(*interval).ok().map(|d| after + d)
        }
        Recurrence::Cron(expr) => Schedule::from_str(expr).ok().and_then(|s| s.after(&after).next()),
    }
}

fn backoff_with_jitter(base: StdDuration, attempts: u32) -> StdDuration {
    let exp = base.as_secs_f64() * 2f64.powi(attempts.saturating_sub(1) as i32);
    let jitter = rand::rng().random_range(-0.1..=0.1);
    StdDuration::from_secs_f64((exp * (1.0 + jitter)).max(0.0))
}

/// Durable, pollable job queue backed by a `sled::Tree`.
pub struct Scheduler {
    tree: sled::Tree,
    tick: StdDuration,
    /// Caps concurrent handler invocations. Default 1, for predictable
    /// throughput; a job's own internal concurrency (e.g. a Dispatcher run)
    /// is unaffected by this ceiling.
    semaphore: Arc<Semaphore>,
    handlers: Mutex<HashMap<Uuid, Handler>>,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Opens (or creates) the job store at `path`. Any job left `Running`
    /// from a prior, crashed process is reverted to `Pending`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Arc<Self>, SchedulerError> {
        Self::open_with_concurrency(path, 1)
    }

    pub fn open_with_concurrency(
        path: impl AsRef<std::path::Path>,
        concurrency: usize,
    ) -> Result<Arc<Self>, SchedulerError> {
        let db = sled::open(path)?;
        let tree = db.open_tree("jobs")?;

        let scheduler = Arc::new(Self {
            tree,
            tick: StdDuration::from_secs(1),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            handlers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        });
        scheduler.recover_crashed_jobs()?;
        Ok(scheduler)
    }

    fn recover_crashed_jobs(&self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let mut job: Job = serde_json::from_slice(&value)?;
            if job.status == JobStatus::Running {
                warn!(job_id = %job.id, "reverting crashed job from Running to Pending");
                job.status = JobStatus::Pending;
                job.next_run_at = job.next_run_at.max(now).max(job.run_at);
                job.updated_at = now;
                let bytes = serde_json::to_vec(&job)?;
                self.tree.insert(key, bytes)?;
            }
        }
        self.tree.flush()?;
        Ok(())
    }

    /// Registers a job and its handler. The handler is invoked with the job
    /// record each time it becomes due; the scheduler is opaque to what it
    /// does (typically: build and run a `Dispatcher`).
    pub async fn add_job(&self, job: Job, handler: Handler) -> Result<(), SchedulerError> {
        let bytes = serde_json::to_vec(&job)?;
        self.tree.insert(job.id.as_bytes(), bytes)?;
        self.tree.flush()?;
        self.handlers.lock().await.insert(job.id, handler);
        debug!(job_id = %job.id, next_run_at = %job.next_run_at, "job registered");
        Ok(())
    }

    /// Moves a `Pending` job to `Cancelled`. A `Running` job is flagged for
    /// cancellation but left to finish; returns whether the job was found.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool, SchedulerError> {
        let Some(bytes) = self.tree.get(id.as_bytes())? else {
            return Ok(false);
        };
        let mut job: Job = serde_json::from_slice(&bytes)?;
        match job.status {
            JobStatus::Pending => job.status = JobStatus::Cancelled,
            JobStatus::Running => job.cancel_requested = true,
            _ => return Ok(true),
        }
        job.updated_at = Utc::now();
        self.tree.insert(id.as_bytes(), serde_json::to_vec(&job)?)?;
        self.tree.flush()?;
        Ok(true)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        let mut jobs = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            jobs.push(serde_json::from_slice(&value)?);
        }
        Ok(jobs)
    }

    /// Spawns the polling loop. Idempotent: calling `start` twice while
    /// already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = match self.loop_handle.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }
        let scheduler = self.clone();
        *guard = Some(tokio::spawn(async move { scheduler.run_loop().await }));
    }

    /// Cancels the polling loop and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }

    async fn run_loop(self: Arc<Self>) {
        info!(tick = ?self.tick, "scheduler loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("scheduler loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.tick) => {}
            }

            if let Err(err) = self.poll_due_jobs().await {
                error!(error = %err, "scheduler poll failed");
            }
        }
    }

    async fn poll_due_jobs(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let due: Vec<Job> = self
            .list_jobs()?
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending && job.next_run_at <= now)
            .collect();

        for job in due {
            let this = self.clone();
            tokio::spawn(async move {
                this.try_run_job(job).await;
            });
        }
        Ok(())
    }

    /// Claims a job via compare-and-swap, runs its handler, and writes back
    /// the resulting state transition.
    async fn try_run_job(self: Arc<Self>, mut job: Job) {
        let id = job.id;
        let before = match self.tree.get(id.as_bytes()) {
            Ok(Some(bytes)) => bytes,
            _ => return,
        };

        let mut claimed = job.clone();
        claimed.status = JobStatus::Running;
        claimed.updated_at = Utc::now();
        let after = match serde_json::to_vec(&claimed) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(job_id = %id, error = %err, "failed to serialize claimed job");
                return;
            }
        };

        match self.tree.compare_and_swap(id.as_bytes(), Some(before.as_ref()), Some(after)) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(job_id = %id, "job already claimed by another poll, skipping");
                return;
            }
            Err(err) => {
                error!(job_id = %id, error = %err, "job store CAS failed");
                return;
            }
        }
        self.tree.flush().ok();
        job = claimed;

        let handler = self.handlers.lock().await.get(&id).cloned();
        let Some(handler) = handler else {
            warn!(job_id = %id, "no handler registered for due job, leaving Running");
            return;
        };

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let outcome = tokio::spawn(handler(job.clone())).await;
        drop(permit);
        let now = Utc::now();

        match outcome {
            Ok(Ok(())) => self.on_success(job, now).await,
            Ok(Err(error)) => self.on_failure(job, error, now).await,
            Err(join_err) => self.on_failure(job, format!("handler panicked: {join_err}"), now).await,
        }
    }

    async fn on_success(&self, mut job: Job, now: DateTime<Utc>) {
        job.last_run_at = Some(now);
        job.attempts = 0;
        job.updated_at = now;

        if job.cancel_requested {
            job.status = JobStatus::Cancelled;
            self.persist(&job).await;
            return;
        }

        match job.recurrence.clone() {
            Some(recurrence) => {
                job.status = JobStatus::Pending;
                job.next_run_at = next_occurrence(&recurrence, now).unwrap_or(now);
            }
            None => job.status = JobStatus::Done,
        }

        self.persist(&job).await;
    }

    async fn on_failure(&self, mut job: Job, error: String, now: DateTime<Utc>) {
        warn!(job_id = %job.id, %error, "job handler failed");
        job.attempts += 1;
        job.last_run_at = Some(now);
        job.updated_at = now;

        if job.cancel_requested {
            job.status = JobStatus::Cancelled;
            self.persist(&job).await;
            return;
        }

        if job.attempts < job.max_attempts {
            job.status = JobStatus::Pending;
            job.next_run_at = now + chrono::Duration::from_std(backoff_with_jitter(job.base_backoff, job.attempts)).unwrap_or_default();
        } else if let Some(recurrence) = job.recurrence.clone() {
            warn!(job_id = %job.id, "exhausted retries for this occurrence, scheduling next recurrence");
            job.attempts = 0;
            job.status = JobStatus::Pending;
            job.next_run_at = next_occurrence(&recurrence, now).unwrap_or(now);
        } else {
            job.status = JobStatus::Failed;
        }

        self.persist(&job).await;
    }

    async fn persist(&self, job: &Job) {
        let bytes = match serde_json::to_vec(job) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to serialize job for persistence");
                return;
            }
        };
        if let Err(err) = self.tree.insert(job.id.as_bytes(), bytes) {
            error!(job_id = %job.id, error = %err, "failed to persist job state transition");
            return;
        }
        self.tree.flush().ok();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("tick", &self.tick).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_job: Job| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn one_shot_job_runs_once_and_completes() {
        let dir = tempdir().unwrap();
        let scheduler = Scheduler::open(dir.path().join("jobs.sled")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let job = Job::one_shot(serde_json::json!({}), Utc::now(), 3);
        let id = job.id;
        scheduler.add_job(job, counting_handler(counter.clone())).await.unwrap();

        scheduler.start();
        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        scheduler.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let jobs = scheduler.list_jobs().unwrap();
        let job = jobs.into_iter().find(|j| j.id == id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn crashed_running_job_is_recovered_to_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.sled");
        {
            let scheduler = Scheduler::open(&path).unwrap();
            let mut job = Job::one_shot(serde_json::json!({}), Utc::now(), 3);
            job.status = JobStatus::Running;
            scheduler
                .tree
                .insert(job.id.as_bytes(), serde_json::to_vec(&job).unwrap())
                .unwrap();
            scheduler.tree.flush().unwrap();
        }

        let recovered = Scheduler::open(&path).unwrap();
        let jobs = recovered.list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_pending_job_marks_cancelled() {
        let dir = tempdir().unwrap();
        let scheduler = Scheduler::open(dir.path().join("jobs.sled")).unwrap();
        let job = Job::one_shot(serde_json::json!({}), Utc::now() + chrono::Duration::hours(1), 3);
        let id = job.id;
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_job(job, counting_handler(counter)).await.unwrap();

        assert!(scheduler.cancel_job(id).await.unwrap());
        let jobs = scheduler.list_jobs().unwrap();
        assert_eq!(jobs[0].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        let dir = tempdir().unwrap();
        let scheduler = Scheduler::open(dir.path().join("jobs.sled")).unwrap();
        assert!(!scheduler.cancel_job(Uuid::new_v4()).await.unwrap());
    }

    #[test]
    fn invalid_cron_expression_is_rejected_at_construction() {
        let result = Job::recurring(
            serde_json::json!({}),
            Utc::now(),
            Recurrence::Cron("not a cron expression".to_string()),
            3,
        );
        assert!(result.is_err());
    }

    #[test]
    fn cron_next_occurrence_is_strictly_after_now() {
        let recurrence = Recurrence::Cron("0 * * * * *".to_string());
        let now = Utc::now();
        let next = next_occurrence(&recurrence, now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn interval_next_occurrence_adds_duration() {
        let recurrence = Recurrence::Interval(StdDuration::from_secs(60));
        let now = Utc::now();
        let next = next_occurrence(&recurrence, now).unwrap();
        assert_eq!((next - now).num_seconds(), 60);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let base = StdDuration::from_secs(1);
        let d1 = backoff_with_jitter(base, 1);
        let d3 = backoff_with_jitter(base, 3);
        assert!(d3 > d1);
    }

    #[tokio::test]
    async fn cancelled_recurring_job_stops_instead_of_rescheduling() {
        let dir = tempdir().unwrap();
        let scheduler = Scheduler::open(dir.path().join("jobs.sled")).unwrap();
        let mut job = Job::recurring(
            serde_json::json!({}),
            Utc::now(),
            Recurrence::Interval(StdDuration::from_secs(60)),
            3,
        )
        .unwrap();
        job.cancel_requested = true;

        scheduler.on_success(job.clone(), Utc::now()).await;

        let jobs = scheduler.list_jobs().unwrap();
        let stored = jobs.into_iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_one_shot_job_is_not_retried_after_a_failed_attempt() {
        let dir = tempdir().unwrap();
        let scheduler = Scheduler::open(dir.path().join("jobs.sled")).unwrap();
        let mut job = Job::one_shot(serde_json::json!({}), Utc::now(), 3);
        job.cancel_requested = true;

        scheduler.on_failure(job.clone(), "transient boom".to_string(), Utc::now()).await;

        let jobs = scheduler.list_jobs().unwrap();
        let stored = jobs.into_iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn recurring_job_overdue_at_startup_fires_once_then_aligns_to_the_future() {
        let dir = tempdir().unwrap();
        let scheduler = Scheduler::open(dir.path().join("jobs.sled")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut job = Job::recurring(
            serde_json::json!({}),
            Utc::now() - chrono::Duration::hours(2),
            Recurrence::Interval(StdDuration::from_secs(3600)),
            3,
        )
        .unwrap();
        job.next_run_at = Utc::now() - chrono::Duration::hours(2);
        let id = job.id;
        scheduler.add_job(job, counting_handler(counter.clone())).await.unwrap();

        scheduler.start();
        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        scheduler.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let jobs = scheduler.list_jobs().unwrap();
        let job = jobs.into_iter().find(|j| j.id == id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.next_run_at > Utc::now());
    }
}
