//! Durable, ordered queue of review jobs.
//!
//! The queue enforces the dedupe invariant: at most one `Queued` or
//! `Running` job per `(repo, commit_sha)` key. A second enqueue for the
//! same key coalesces into the existing job (latest payload wins)
//! instead of creating a duplicate, so rapid successive pushes to the
//! same commit produce one review of the latest diff. Across distinct
//! keys, FIFO order is preserved.
//!
//! Safe for many concurrent producers (webhook handlers) and consumers
//! (workers): `dequeue` never hands the same job to two workers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// How many finished jobs to keep around for operator inspection.
const FINISHED_RETENTION: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier collapsing events into one logical unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub repo: String,
    pub commit_sha: String,
}

/// Where the worker gets the diff for a job.
#[derive(Debug, Clone)]
pub enum DiffSource {
    /// Fetch the comparison from the origin with the event's credentials.
    Fetch {
        installation_id: u64,
        pr_number: Option<u64>,
        base_sha: String,
    },
    /// The diff text was supplied directly (manual submission).
    Inline { diff: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReviewJob {
    pub id: JobId,
    pub repo: String,
    pub commit_sha: String,
    pub source: DiffSource,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Payload for `enqueue`.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub repo: String,
    pub commit_sha: String,
    pub source: DiffSource,
}

/// Whether an enqueue created a new job or coalesced into an existing
/// one for the same dedupe key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(JobId),
    Updated(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Updated(id) => *id,
        }
    }
}

/// Result a worker reports back through `complete`.
#[derive(Debug)]
pub enum JobOutcome {
    Success,
    RetryableFailure {
        error: String,
        /// Backoff hint from the origin (its Retry-After header). Can
        /// only push the retry later than the policy's own delay.
        retry_after: Option<Duration>,
    },
    TerminalFailure(String),
}

/// Exponential backoff policy for retryable failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before the given attempt number runs: `min(base * 2^attempts, cap)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Operator-facing view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub repo: String,
    pub commit_sha: String,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct JobEntry {
    job: ReviewJob,
    state: JobState,
    /// Earliest instant the job may be dequeued (retry backoff).
    not_before: Option<Instant>,
    /// Payload that arrived while the job was `Running`; applied on
    /// completion by re-queueing the job with attempts reset.
    pending_update: Option<DiffSource>,
    last_error: Option<String>,
}

struct QueueInner {
    fifo: VecDeque<JobId>,
    jobs: HashMap<JobId, JobEntry>,
    dedupe: HashMap<DedupeKey, JobId>,
    finished: VecDeque<JobId>,
}

pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    retry: RetryPolicy,
}

impl JobQueue {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                fifo: VecDeque::new(),
                jobs: HashMap::new(),
                dedupe: HashMap::new(),
                finished: VecDeque::new(),
            }),
            notify: Notify::new(),
            retry,
        }
    }

    /// Enqueue a job, coalescing into any live job for the same
    /// `(repo, commit_sha)` key.
    ///
    /// A `Queued` job has its payload replaced in place (it keeps its
    /// FIFO slot); a `Running` job records the newer payload and is
    /// re-queued when it completes. Anything else creates a fresh job.
    pub fn enqueue(&self, spec: JobSpec) -> EnqueueOutcome {
        let key = DedupeKey {
            repo: spec.repo.clone(),
            commit_sha: spec.commit_sha.clone(),
        };

        let mut inner = self.inner.lock().expect("queue mutex poisoned");

        if let Some(&existing) = inner.dedupe.get(&key) {
            if let Some(entry) = inner.jobs.get_mut(&existing) {
                match entry.state {
                    JobState::Queued => {
                        info!(job_id = %existing, repo = %spec.repo, "coalesced into queued job");
                        entry.job.source = spec.source;
                        return EnqueueOutcome::Updated(existing);
                    }
                    JobState::Running => {
                        info!(job_id = %existing, repo = %spec.repo, "recorded update for running job");
                        entry.pending_update = Some(spec.source);
                        return EnqueueOutcome::Updated(existing);
                    }
                    // Finished job still lingering in the dedupe table
                    // should not happen (completion removes it), but a
                    // fresh job is the right recovery either way.
                    JobState::Succeeded | JobState::Failed => {}
                }
            }
        }

        let id = JobId(Uuid::new_v4());
        let job = ReviewJob {
            id,
            repo: spec.repo,
            commit_sha: spec.commit_sha,
            source: spec.source,
            attempts: 0,
            created_at: Utc::now(),
        };
        info!(job_id = %id, repo = %job.repo, commit = %job.commit_sha, "enqueued review job");

        inner.jobs.insert(
            id,
            JobEntry {
                job,
                state: JobState::Queued,
                not_before: None,
                pending_update: None,
                last_error: None,
            },
        );
        inner.fifo.push_back(id);
        inner.dedupe.insert(key, id);
        drop(inner);

        self.notify.notify_one();
        EnqueueOutcome::Created(id)
    }

    /// Claim the oldest ready job, marking it `Running`.
    ///
    /// Returns the claimed job, or the earliest backoff deadline among
    /// queued-but-delayed jobs if nothing is ready yet.
    fn try_claim(&self) -> (Option<ReviewJob>, Option<Instant>) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue mutex poisoned");

        let mut earliest: Option<Instant> = None;
        let mut claim_idx: Option<usize> = None;
        for (idx, id) in inner.fifo.iter().enumerate() {
            let Some(entry) = inner.jobs.get(id) else {
                continue;
            };
            if entry.state != JobState::Queued {
                continue;
            }
            match entry.not_before {
                Some(nb) if nb > now => {
                    earliest = Some(earliest.map_or(nb, |e| e.min(nb)));
                }
                _ => {
                    claim_idx = Some(idx);
                    break;
                }
            }
        }

        let Some(idx) = claim_idx else {
            return (None, earliest);
        };

        let id = inner
            .fifo
            .remove(idx)
            .expect("claimed index must be in the fifo");
        let job = {
            let entry = inner
                .jobs
                .get_mut(&id)
                .expect("fifo id must have a job entry");
            entry.state = JobState::Running;
            entry.not_before = None;
            entry.job.clone()
        };

        // If more jobs are ready right now, pass the wakeup along so
        // another idle worker picks one up.
        let more_ready = inner.fifo.iter().any(|jid| {
            inner.jobs.get(jid).is_some_and(|e| {
                e.state == JobState::Queued && e.not_before.map_or(true, |nb| nb <= now)
            })
        });
        drop(inner);
        if more_ready {
            self.notify.notify_one();
        }

        (Some(job), None)
    }

    /// Take the next ready job, suspending until one is available.
    pub async fn dequeue(&self) -> ReviewJob {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking state, so an enqueue
            // racing with this check is not lost.
            notified.as_mut().enable();

            let (claimed, next_deadline) = self.try_claim();
            if let Some(job) = claimed {
                return job;
            }

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Record the outcome of a job a worker claimed via `dequeue`.
    pub fn complete(&self, id: JobId, outcome: JobOutcome) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");

        let Some(entry) = inner.jobs.get_mut(&id) else {
            warn!(job_id = %id, "completion for unknown job");
            return;
        };
        if entry.state != JobState::Running {
            warn!(job_id = %id, state = ?entry.state, "completion for job that is not running");
            return;
        }

        let requeue = match outcome {
            JobOutcome::Success => {
                entry.last_error = None;
                info!(job_id = %id, "job succeeded");
                Self::finish_or_apply_update(entry, JobState::Succeeded)
            }
            JobOutcome::RetryableFailure { error, retry_after } => {
                warn!(job_id = %id, error = %error, attempts = entry.job.attempts, "job failed (retryable)");
                entry.last_error = Some(error);
                if entry.pending_update.is_some() {
                    // The newer payload supersedes the failed attempt.
                    Self::finish_or_apply_update(entry, JobState::Failed)
                } else {
                    entry.job.attempts += 1;
                    if entry.job.attempts >= self.retry.max_attempts {
                        warn!(job_id = %id, "job exhausted retries, failing terminally");
                        entry.state = JobState::Failed;
                        false
                    } else {
                        let mut delay = self.retry.backoff(entry.job.attempts);
                        if let Some(hint) = retry_after {
                            delay = delay.max(hint);
                        }
                        entry.state = JobState::Queued;
                        entry.not_before = Some(Instant::now() + delay);
                        true
                    }
                }
            }
            JobOutcome::TerminalFailure(err) => {
                warn!(job_id = %id, error = %err, "job failed terminally");
                entry.last_error = Some(err);
                Self::finish_or_apply_update(entry, JobState::Failed)
            }
        };

        let key = DedupeKey {
            repo: entry.job.repo.clone(),
            commit_sha: entry.job.commit_sha.clone(),
        };
        let finished = entry.state == JobState::Succeeded || entry.state == JobState::Failed;

        if requeue {
            inner.fifo.push_back(id);
        }
        if finished {
            inner.dedupe.remove(&key);
            inner.finished.push_back(id);
            while inner.finished.len() > FINISHED_RETENTION {
                if let Some(old) = inner.finished.pop_front() {
                    inner.jobs.remove(&old);
                }
            }
        }
        drop(inner);

        if requeue {
            self.notify.notify_one();
        }
    }

    /// Apply a pending payload update by resetting the job to `Queued`,
    /// or settle it into `final_state` if no update arrived while it ran.
    ///
    /// Returns whether the job must be pushed back onto the FIFO.
    fn finish_or_apply_update(entry: &mut JobEntry, final_state: JobState) -> bool {
        if let Some(source) = entry.pending_update.take() {
            entry.job.source = source;
            entry.job.attempts = 0;
            entry.not_before = None;
            entry.state = JobState::Queued;
            true
        } else {
            entry.state = final_state;
            false
        }
    }

    /// Operator-facing snapshot of every known job, newest first.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        let mut jobs: Vec<JobSnapshot> = inner
            .jobs
            .values()
            .map(|entry| JobSnapshot {
                id: entry.job.id,
                repo: entry.job.repo.clone(),
                commit_sha: entry.job.commit_sha.clone(),
                state: entry.state,
                attempts: entry.job.attempts,
                last_error: entry.last_error.clone(),
                created_at: entry.job.created_at,
            })
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            max_attempts: 3,
        }
    }

    fn inline_spec(repo: &str, sha: &str, diff: &str) -> JobSpec {
        JobSpec {
            repo: repo.to_string(),
            commit_sha: sha.to_string(),
            source: DiffSource::Inline {
                diff: diff.to_string(),
            },
        }
    }

    fn retryable(msg: &str) -> JobOutcome {
        JobOutcome::RetryableFailure {
            error: msg.to_string(),
            retry_after: None,
        }
    }

    fn diff_text(job: &ReviewJob) -> &str {
        match &job.source {
            DiffSource::Inline { diff } => diff,
            DiffSource::Fetch { .. } => panic!("expected inline source"),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(10));
        assert_eq!(p.backoff(2), Duration::from_secs(20));
        assert_eq!(p.backoff(10), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo_across_keys() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "aaa", "d1"));
        queue.enqueue(inline_spec("o/r", "bbb", "d2"));
        queue.enqueue(inline_spec("o/other", "ccc", "d3"));

        assert_eq!(queue.dequeue().await.commit_sha, "aaa");
        assert_eq!(queue.dequeue().await.commit_sha, "bbb");
        assert_eq!(queue.dequeue().await.commit_sha, "ccc");
    }

    #[tokio::test]
    async fn test_coalesce_queued_job_keeps_latest_payload() {
        let queue = JobQueue::new(policy());
        let first = queue.enqueue(inline_spec("o/r", "abc123", "old diff"));
        let second = queue.enqueue(inline_spec("o/r", "abc123", "updated diff"));

        assert!(matches!(first, EnqueueOutcome::Created(_)));
        assert!(matches!(second, EnqueueOutcome::Updated(_)));
        assert_eq!(first.job_id(), second.job_id());

        // Only one job executes, with the updated diff.
        let job = queue.dequeue().await;
        assert_eq!(diff_text(&job), "updated diff");

        let pending = timeout(Duration::from_millis(50), queue.dequeue()).await;
        assert!(pending.is_err(), "no second job should exist");
    }

    #[tokio::test]
    async fn test_update_while_running_requeues_on_completion() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "abc", "v1"));

        let job = queue.dequeue().await;
        assert_eq!(diff_text(&job), "v1");

        // Newer event arrives while the job runs.
        let outcome = queue.enqueue(inline_spec("o/r", "abc", "v2"));
        assert!(matches!(outcome, EnqueueOutcome::Updated(_)));

        queue.complete(job.id, JobOutcome::Success);

        let rerun = queue.dequeue().await;
        assert_eq!(rerun.id, job.id);
        assert_eq!(diff_text(&rerun), "v2");
        assert_eq!(rerun.attempts, 0);
    }

    #[tokio::test]
    async fn test_dedupe_released_after_success() {
        let queue = JobQueue::new(policy());
        let first = queue.enqueue(inline_spec("o/r", "abc", "v1"));
        let job = queue.dequeue().await;
        queue.complete(job.id, JobOutcome::Success);

        let second = queue.enqueue(inline_spec("o/r", "abc", "v2"));
        assert!(matches!(second, EnqueueOutcome::Created(_)));
        assert_ne!(first.job_id(), second.job_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_backoff() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "abc", "d"));

        let job = queue.dequeue().await;
        queue.complete(job.id, retryable("boom"));

        // First retry is delayed by base * 2^1 = 10s.
        let start = Instant::now();
        let retried = queue.dequeue().await;
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.attempts, 1);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_origin_backoff_hint_extends_delay() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "abc", "d"));

        let job = queue.dequeue().await;
        queue.complete(
            job.id,
            JobOutcome::RetryableFailure {
                error: "rate limited".to_string(),
                retry_after: Some(Duration::from_secs(120)),
            },
        );

        // The policy alone would retry after 10s; the origin's hint
        // holds the job back for the full 120s.
        let early = timeout(Duration::from_secs(100), queue.dequeue()).await;
        assert!(early.is_err(), "retry must not run before the hint elapses");

        let start = Instant::now();
        let retried = queue.dequeue().await;
        assert_eq!(retried.id, job.id);
        assert!(start.elapsed() + Duration::from_secs(100) >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_hint_never_undercuts_policy_backoff() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "abc", "d"));

        let job = queue.dequeue().await;
        queue.complete(
            job.id,
            JobOutcome::RetryableFailure {
                error: "rate limited".to_string(),
                retry_after: Some(Duration::from_secs(1)),
            },
        );

        let early = timeout(Duration::from_secs(9), queue.dequeue()).await;
        assert!(early.is_err(), "policy backoff still applies");
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_after_max_attempts() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "abc", "d"));

        for _ in 0..policy().max_attempts {
            let job = queue.dequeue().await;
            queue.complete(job.id, retryable("boom"));
        }

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, JobState::Failed);
        assert_eq!(snapshot[0].last_error.as_deref(), Some("boom"));

        // Terminal failure releases the dedupe key.
        let again = queue.enqueue(inline_spec("o/r", "abc", "d2"));
        assert!(matches!(again, EnqueueOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_job_never_handed_to_two_workers() {
        let queue = Arc::new(JobQueue::new(policy()));
        queue.enqueue(inline_spec("o/r", "abc", "d"));

        let q1 = queue.clone();
        let q2 = queue.clone();
        let w1 = tokio::spawn(async move { timeout(Duration::from_millis(100), q1.dequeue()).await });
        let w2 = tokio::spawn(async move { timeout(Duration::from_millis(100), q2.dequeue()).await });

        let r1 = w1.await.unwrap();
        let r2 = w2.await.unwrap();

        // Exactly one worker claims the job; the other times out.
        assert!(r1.is_ok() ^ r2.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_reports_running_state() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "abc", "d"));

        let job = queue.dequeue().await;
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].id, job.id);
        assert_eq!(snapshot[0].state, JobState::Running);
    }

    #[tokio::test]
    async fn test_terminal_failure_with_pending_update_requeues() {
        let queue = JobQueue::new(policy());
        queue.enqueue(inline_spec("o/r", "abc", "v1"));
        let job = queue.dequeue().await;
        queue.enqueue(inline_spec("o/r", "abc", "v2"));
        queue.complete(job.id, JobOutcome::TerminalFailure("gone".to_string()));

        // The newer payload still gets its run.
        let rerun = queue.dequeue().await;
        assert_eq!(diff_text(&rerun), "v2");
    }
}
