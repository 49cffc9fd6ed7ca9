//! Turns a list of per-recipient `Task`s into `Outcome`s with bounded
//! concurrency, rate limiting, retries and skip-on-resume.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mail_builder::MessageBuilder;
use mail_send::smtp::message::IntoMessage;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::boundary::{DispatchConfig, MetricsSink, Recipient, SmtpConfig};
use crate::error::DispatchError;
use crate::offset::OffsetTracker;
use crate::pool::ConnectionPool;
use crate::rate_limiter::{RateLimiter, WaitOutcome};

/// A concrete per-recipient work item. Built once per recipient; only the
/// retry pipeline mutates it afterwards (budget decrement, last-error
/// annotation).
#[derive(Debug, Clone)]
pub struct Task {
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachments: Vec<PathBuf>,
    retries_remaining: u32,
    attempts: u32,
    last_error: Option<String>,
}

impl Task {
    pub fn new(recipient: Recipient, subject: String, body: String, retry_budget: u32) -> Self {
        Self {
            recipient,
            subject,
            body,
            cc: Vec::new(),
            bcc: Vec::new(),
            attachments: Vec::new(),
            retries_remaining: retry_budget,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn primary(&self) -> &str {
        &self.recipient.email
    }
}

/// Classified result of a single send attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    Sent { primary: String, duration: Duration },
    FailedTransient { primary: String, error: String },
    FailedPermanent { primary: String, error: String },
    Skipped { primary: String },
}

/// Summary count triple handed back to the invoker at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum Classification {
    Sent,
    Transient(String),
    Permanent(String),
}

/// Mirrors the teacher's `mail_send::Error` -> temporary/permanent split: 4XX
/// replies and anything transport-level are retryable, 5XX replies and
/// protocol/config mistakes are not.
fn classify(result: Result<(), mail_send::Error>) -> Classification {
    use mail_send::Error as E;
    match result {
        Ok(()) => Classification::Sent,
        Err(err @ (E::Io(_)
        | E::Tls(_)
        | E::Base64(_)
        | E::Auth(_)
        | E::UnparseableReply
        | E::InvalidTLSName
        | E::Timeout)) => Classification::Transient(err.to_string()),
        Err(err @ (E::UnexpectedReply(ref response) | E::AuthenticationFailed(ref response))) => {
            if response.severity() == smtp_proto::Severity::TransientNegativeCompletion {
                Classification::Transient(err.to_string())
            } else {
                Classification::Permanent(err.to_string())
            }
        }
        Err(
            err @ (E::MissingCredentials
            | E::MissingMailFrom
            | E::MissingRcptTo
            | E::UnsupportedAuthMechanism
            | E::MissingStartTls),
        ) => Classification::Permanent(err.to_string()),
    }
}

/// Deduplicates CC/BCC against the primary and each other, case-insensitively,
/// preserving first-seen case for display. Empty/whitespace-only entries are
/// dropped before dedup.
fn dedup_recipients(primary: &str, cc: &[String], bcc: &[String]) -> (Vec<String>, Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    seen.insert(primary.to_lowercase());

    let mut dedup = |list: &[String]| -> Vec<String> {
        let mut out = Vec::new();
        for addr in list {
            let trimmed = addr.trim();
            if trimmed.is_empty() {
                continue;
            }
            let key = trimmed.to_lowercase();
            if seen.insert(key) {
                out.push(trimmed.to_string());
            }
        }
        out
    };

    let cc_out = dedup(&cc.to_vec());
    let bcc_out = dedup(&bcc.to_vec());
    (cc_out, bcc_out)
}

/// Builds the raw MIME bytes (headers never contain Bcc, matching RFC 5321
/// envelope-only semantics) and the full envelope RCPT list (primary + cc +
/// bcc) for a task. The MIME structure is assembled with `mail-builder`, the
/// same way the teacher composes outbound test fixtures, then serialized via
/// `IntoMessage` the way its production send path turns a built message into
/// raw bytes before attaching its own envelope.
fn build_envelope(from: &str, task: &Task) -> Result<(Vec<u8>, Vec<String>, Vec<String>), String> {
    let (cc, bcc) = dedup_recipients(task.primary(), &task.cc, &task.bcc);

    let mut builder = MessageBuilder::new()
        .from(from.to_string())
        .to(task.primary().to_string())
        .subject(task.subject.clone())
        .text_body(task.body.clone());

    if !cc.is_empty() {
        builder = builder.cc(cc.clone());
    }

    for path in &task.attachments {
        match std::fs::read(path) {
            Ok(bytes) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "attachment".to_string());
                builder = builder.attachment("application/octet-stream", name, bytes);
            }
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable attachment"),
        }
    }

    let built = builder.into_message().map_err(|err| err.to_string())?;
    let raw = built.body.to_vec();

    let mut rcpt_to = Vec::with_capacity(1 + cc.len() + bcc.len());
    rcpt_to.push(task.primary().to_string());
    rcpt_to.extend(cc.iter().cloned());
    rcpt_to.extend(bcc.iter().cloned());

    Ok((raw, rcpt_to, cc))
}

fn backoff_with_jitter(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let capped = exp.min(cap.as_secs_f64());
    let jitter = rand::rng().random_range(-0.1..=0.1);
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}

struct RetryItem {
    due: Instant,
    task: Task,
}

impl PartialEq for RetryItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for RetryItem {}
impl PartialOrd for RetryItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RetryItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

/// Fan-out of tasks to a bounded worker pool, with rate limiting, retries and
/// skip-on-resume via the offset tracker.
pub struct Dispatcher {
    from: String,
    dispatch: DispatchConfig,
    pool: Arc<ConnectionPool>,
    rate_limiter: Arc<RateLimiter>,
    offset: Arc<OffsetTracker>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(
        smtp: &SmtpConfig,
        dispatch: DispatchConfig,
        offset: Arc<OffsetTracker>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(smtp.clone(), dispatch.parallelism));
        let rate_limiter = Arc::new(RateLimiter::new(dispatch.rate_per_second, dispatch.burst));
        Self {
            from: smtp.from.clone(),
            dispatch,
            pool,
            rate_limiter,
            offset,
            metrics,
        }
    }

    #[instrument(skip(self, tasks, cancel), fields(n = tasks.len()))]
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<Summary, DispatchError> {
        if self.dispatch.parallelism == 0 {
            return Err(DispatchError::InvalidConfig(
                "parallelism must be at least 1".to_string(),
            ));
        }

        let queue_depth = self.dispatch.batch_size.max(self.dispatch.parallelism);
        let (work_tx, work_rx) = mpsc::channel::<Task>(queue_depth);
        let work_rx = Arc::new(AsyncMutex::new(work_rx));
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<RetryItem>();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<Outcome>();

        let sent_since_flush = Arc::new(AtomicUsize::new(0));
        let dial_failures = Arc::new(AtomicU32::new(0));
        let successes = Arc::new(AtomicU32::new(0));
        let pool_exhausted = Arc::new(AtomicBool::new(false));

        // Feed the work channel from the offset-filtered task list, skipping
        // anything already delivered in a previous attempt at this run.
        let feeder_tasks = tasks;
        let feeder_offset = self.offset.clone();
        let feeder_outcome_tx = outcome_tx.clone();
        let feeder_cancel = cancel.clone();
        let feeder_tx = work_tx.clone();
        let feeder = tokio::spawn(async move {
            for task in feeder_tasks {
                if feeder_cancel.is_cancelled() {
                    break;
                }
                if feeder_offset.is_sent(task.primary()) {
                    feeder_outcome_tx
                        .send(Outcome::Skipped {
                            primary: task.primary().to_string(),
                        })
                        .ok();
                    continue;
                }
                if feeder_tx.send(task).await.is_err() {
                    break;
                }
            }
        });

        let mut worker_handles = Vec::with_capacity(self.dispatch.parallelism);
        for worker_id in 0..self.dispatch.parallelism {
            let work_rx = work_rx.clone();
            let retry_tx = retry_tx.clone();
            let outcome_tx = outcome_tx.clone();
            let pool = self.pool.clone();
            let rate_limiter = self.rate_limiter.clone();
            let offset = self.offset.clone();
            let metrics = self.metrics.clone();
            let cancel = cancel.clone();
            let from = self.from.clone();
            let dispatch = self.dispatch.clone();
            let sent_since_flush = sent_since_flush.clone();
            let dial_failures = dial_failures.clone();
            let successes = successes.clone();
            let pool_exhausted = pool_exhausted.clone();

            let handle = tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(mut task) = task else { break };

                    if rate_limiter.wait(&cancel).await == WaitOutcome::Cancelled {
                        break;
                    }

                    task.attempts += 1;

                    let session = match pool.acquire(&cancel).await {
                        Ok(session) => session,
                        Err(err) => {
                            warn!(worker_id, error = %err, "failed to acquire pooled session");
                            metrics.record_connection(false);
                            let prior_successes = successes.load(Ordering::Relaxed);
                            let failures = dial_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            if prior_successes == 0 && failures as usize >= dispatch.parallelism {
                                pool_exhausted.store(true, Ordering::Relaxed);
                                cancel.cancel();
                            }
                            retry_or_fail(
                                task,
                                err.to_string(),
                                &dispatch,
                                &retry_tx,
                                &outcome_tx,
                                &metrics,
                            );
                            continue;
                        }
                    };
                    metrics.record_connection(true);

                    let (raw, rcpt_to, cc_display) = match build_envelope(&from, &task) {
                        Ok(v) => v,
                        Err(err) => {
                            pool.release(session, true).await;
                            outcome_tx
                                .send(Outcome::FailedPermanent {
                                    primary: task.primary().to_string(),
                                    error: format!("failed to build message: {err}"),
                                })
                                .ok();
                            continue;
                        }
                    };
                    let _ = cc_display;

                    let message = mail_send::smtp::message::Message {
                        mail_from: from.as_str().into(),
                        rcpt_to: rcpt_to.iter().map(|a| a.as_str().into()).collect(),
                        body: raw.as_slice().into(),
                    };

                    let start = Instant::now();
                    let mut session = session;
                    let result = session.send_one(message).await.map_err(|e| match e {
                        crate::error::SessionError::Smtp(inner) => inner,
                    });
                    let duration = start.elapsed();

                    match classify(result) {
                        Classification::Sent => {
                            pool.release(session, true).await;
                            successes.fetch_add(1, Ordering::Relaxed);
                            offset.mark_sent(task.primary());
                            metrics.record_sent(duration);
                            let count = sent_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
                            if count % dispatch.flush_every == 0 {
                                offset.flush();
                            }
                            outcome_tx
                                .send(Outcome::Sent {
                                    primary: task.primary().to_string(),
                                    duration,
                                })
                                .ok();
                        }
                        Classification::Transient(error) => {
                            pool.release(session, false).await;
                            metrics.record_retry(&error);
                            task.last_error = Some(error.clone());
                            retry_or_fail(
                                task,
                                error,
                                &dispatch,
                                &retry_tx,
                                &outcome_tx,
                                &metrics,
                            );
                        }
                        Classification::Permanent(error) => {
                            pool.release(session, true).await;
                            metrics.record_failed(&error);
                            outcome_tx
                                .send(Outcome::FailedPermanent {
                                    primary: task.primary().to_string(),
                                    error,
                                })
                                .ok();
                        }
                    }
                }
            });
            worker_handles.push(handle);
        }

        // Single retry scheduler: holds pending retries in a min-heap keyed
        // by due time and feeds them back onto the work channel as they
        // become due.
        let retry_work_tx = work_tx.clone();
        let retry_cancel = cancel.clone();
        let retry_handle = tokio::spawn(async move {
            let mut heap: BinaryHeap<Reverse<DueKey>> = BinaryHeap::new();
            let mut staged: std::collections::HashMap<u64, Task> = std::collections::HashMap::new();
            let mut next_id = 0u64;

            loop {
                let sleep = match heap.peek() {
                    Some(Reverse(key)) => {
                        let now = Instant::now();
                        if key.due <= now {
                            Duration::ZERO
                        } else {
                            key.due - now
                        }
                    }
                    None => Duration::from_secs(3600),
                };

                tokio::select! {
                    _ = retry_cancel.cancelled() => break,
                    item = retry_rx.recv() => {
                        match item {
                            Some(item) => {
                                let id = next_id;
                                next_id += 1;
                                heap.push(Reverse(DueKey { due: item.due, id }));
                                staged.insert(id, item.task);
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(sleep) => {}
                }

                while let Some(Reverse(key)) = heap.peek() {
                    if key.due > Instant::now() {
                        break;
                    }
                    let Reverse(key) = heap.pop().unwrap();
                    if let Some(task) = staged.remove(&key.id) {
                        if retry_work_tx.send(task).await.is_err() {
                            break;
                        }
                    }
                }
            }
            staged
        });

        feeder.await.ok();
        drop(work_tx);

        for handle in worker_handles {
            handle.await.ok();
        }

        cancel.cancel();
        let stranded = retry_handle.await.unwrap_or_default();
        for (_, task) in stranded {
            outcome_tx
                .send(Outcome::FailedPermanent {
                    primary: task.primary().to_string(),
                    error: "retry deadline exceeded during shutdown".to_string(),
                })
                .ok();
        }

        drop(outcome_tx);
        self.offset.flush();

        if pool_exhausted.load(Ordering::Relaxed) {
            return Err(DispatchError::PoolExhausted {
                attempts: dial_failures.load(Ordering::Relaxed),
            });
        }

        let mut summary = Summary::default();
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                Outcome::Sent { .. } => summary.sent += 1,
                Outcome::FailedTransient { .. } | Outcome::FailedPermanent { .. } => {
                    summary.failed += 1
                }
                Outcome::Skipped { .. } => summary.skipped += 1,
            }
        }

        info!(sent = summary.sent, failed = summary.failed, skipped = summary.skipped, "dispatch run complete");
        Ok(summary)
    }
}

#[derive(Clone, Copy)]
struct DueKey {
    due: Instant,
    id: u64,
}
impl PartialEq for DueKey {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}
impl Eq for DueKey {}
impl PartialOrd for DueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.id.cmp(&other.id))
    }
}

fn retry_or_fail(
    mut task: Task,
    error: String,
    dispatch: &DispatchConfig,
    retry_tx: &mpsc::UnboundedSender<RetryItem>,
    outcome_tx: &mpsc::UnboundedSender<Outcome>,
    metrics: &Arc<dyn MetricsSink>,
) {
    if task.retries_remaining > 0 {
        task.retries_remaining -= 1;
        task.last_error = Some(error.clone());
        let delay = backoff_with_jitter(
            dispatch.retry_base_backoff,
            task.attempts,
            dispatch.retry_max_backoff,
        );
        debug!(primary = task.primary(), ?delay, "scheduling retry");
        let due = Instant::now() + delay;
        retry_tx.send(RetryItem { due, task }).ok();
    } else {
        metrics.record_failed(&error);
        outcome_tx
            .send(Outcome::FailedPermanent {
                primary: task.primary().to_string(),
                error,
            })
            .ok();
    }
}
