//! Priority job queue with atomic claim.
//!
//! The durable record of every job lives in a [`JobRepository`]; this module
//! keeps the ordering index of `Queued` jobs: priority descending, then
//! submission time ascending (strict FIFO inside a priority band).
//!
//! Claiming is two-phase. The job is first removed from the index under the
//! queue lock, so no other dispatch pass can see it, then its `Queued ->
//! Assigned` transition is written with a compare-and-swap. If the swap
//! loses (the job was cancelled or expired meanwhile) the claim moves on to
//! the next candidate.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fleetflow_types::job::{Job, JobPriority, JobStatus};
use uuid::Uuid;

use crate::repository::job::JobRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("job {0} is already queued")]
    Duplicate(Uuid),

    #[error("job repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// Ordering index
// ---------------------------------------------------------------------------

/// Sort key: highest priority first, then oldest, then enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<JobPriority>,
    submitted_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

#[derive(Default)]
struct QueueState {
    order: BTreeSet<QueueKey>,
    jobs: HashMap<Uuid, (QueueKey, Job)>,
    /// Submissions holding a slot while their insert is in flight.
    reserved: HashSet<Uuid>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, job: Job) {
        self.next_seq += 1;
        let key = QueueKey {
            priority: Reverse(job.priority),
            submitted_at: job.submitted_at,
            seq: self.next_seq,
            id: job.id,
        };
        self.order.insert(key);
        self.jobs.insert(job.id, (key, job));
    }

    fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let (key, job) = self.jobs.remove(id)?;
        self.order.remove(&key);
        Some(job)
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Bounded priority queue backed by a job repository.
pub struct JobQueue<R: JobRepository> {
    repo: R,
    capacity: usize,
    state: Mutex<QueueState>,
}

impl<R: JobRepository> JobQueue<R> {
    pub fn new(repo: R, capacity: usize) -> Self {
        Self {
            repo,
            capacity,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.with_state(|s| s.jobs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.with_state(|s| s.jobs.contains_key(id))
    }

    /// Persist a new `Queued` job and index it. Fails with `Full` at capacity.
    ///
    /// The slot is reserved before the repository write, so concurrent
    /// submissions cannot overshoot the capacity between check and insert.
    pub async fn submit(&self, job: Job) -> Result<Uuid, QueueError> {
        let id = job.id;
        self.with_state(|s| {
            if s.jobs.contains_key(&id) || s.reserved.contains(&id) {
                Err(QueueError::Duplicate(id))
            } else if s.jobs.len() + s.reserved.len() >= self.capacity {
                Err(QueueError::Full {
                    capacity: self.capacity,
                })
            } else {
                s.reserved.insert(id);
                Ok(())
            }
        })?;
        if let Err(e) = self.repo.insert_job(&job).await {
            self.with_state(|s| s.reserved.remove(&id));
            return Err(QueueError::Repository(e.to_string()));
        }
        self.with_state(|s| {
            s.reserved.remove(&id);
            s.insert(job);
        });
        tracing::debug!(job_id = %id, "job queued");
        Ok(id)
    }

    /// Re-index a job already stored as `Queued` (rollback, requeue, restart).
    ///
    /// Not bounded by capacity: the job was admitted once already.
    pub fn requeue(&self, job: Job) {
        self.with_state(|s| {
            s.remove(&job.id);
            s.insert(job);
        });
    }

    /// Rebuild the index from the repository's `Queued` jobs.
    pub async fn restore(&self) -> Result<usize, QueueError> {
        let jobs = self
            .repo
            .list_unfinished_jobs()
            .await
            .map_err(|e| QueueError::Repository(e.to_string()))?;
        let queued: Vec<Job> = jobs
            .into_iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        let count = queued.len();
        self.with_state(|s| {
            for job in queued {
                s.remove(&job.id);
                s.insert(job);
            }
        });
        Ok(count)
    }

    /// Drop a job from the index without touching the repository.
    pub fn remove(&self, id: &Uuid) -> Option<Job> {
        self.with_state(|s| s.remove(id))
    }

    /// Queued jobs in dispatch order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.with_state(|s| {
            s.order
                .iter()
                .filter_map(|key| s.jobs.get(&key.id).map(|(_, job)| job.clone()))
                .collect()
        })
    }

    /// Remove and return every queued job whose deadline is before `now`.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<Job> {
        self.with_state(|s| {
            let expired: Vec<Uuid> = s
                .jobs
                .values()
                .filter(|(_, job)| job.deadline().is_some_and(|d| d <= now))
                .map(|(key, _)| key.id)
                .collect();
            expired.iter().filter_map(|id| s.remove(id)).collect()
        })
    }

    /// Claim the first job (in dispatch order) that `select` accepts, and
    /// mark it `Assigned` to `robot_of(&choice)`.
    ///
    /// `select` runs under the queue lock and must not block. Returns the
    /// assigned job together with the selector's choice.
    pub async fn claim_next<T>(
        &self,
        mut select: impl FnMut(&Job) -> Option<T>,
        robot_of: impl Fn(&T) -> String,
    ) -> Result<Option<(Job, T)>, QueueError> {
        loop {
            let claimed = self.with_state(|s| {
                let found = s.order.iter().find_map(|key| {
                    let (_, job) = s.jobs.get(&key.id)?;
                    select(job).map(|choice| (key.id, choice))
                });
                found.and_then(|(id, choice)| s.remove(&id).map(|job| (job, choice)))
            });
            let Some((queued, choice)) = claimed else {
                return Ok(None);
            };

            let mut job = queued.clone();
            job.status = JobStatus::Assigned;
            job.assigned_robot_id = Some(robot_of(&choice));
            job.assigned_at = Some(Utc::now());
            match self.repo.transition_job(&job, &[JobStatus::Queued]).await {
                Ok(true) => return Ok(Some((job, choice))),
                Ok(false) => {
                    tracing::debug!(job_id = %job.id, "claim lost to a concurrent transition");
                    continue;
                }
                Err(e) => {
                    self.requeue(queued);
                    return Err(QueueError::Repository(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use fleetflow_types::error::RepositoryError;

    use crate::repository::memory::InMemoryJobRepository;
    use crate::workflow::graph::tests::DocBuilder;

    pub(crate) fn job(priority: JobPriority) -> Job {
        Job {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "wf".into(),
            workflow: DocBuilder::new("wf").build(),
            priority,
            required_capabilities: BTreeSet::new(),
            environment: "default".into(),
            target_robot_id: None,
            timeout_secs: None,
            variables: Default::default(),
            status: JobStatus::Queued,
            assigned_robot_id: None,
            checkpoint_ref: None,
            requeue_count: 0,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    async fn claim_any(queue: &JobQueue<InMemoryJobRepository>) -> Option<Job> {
        queue
            .claim_next(|_| Some(()), |_| "r1".to_string())
            .await
            .unwrap()
            .map(|(job, _)| job)
    }

    /// Job store whose inserts yield first, so concurrent submits interleave.
    #[derive(Clone, Default)]
    struct SlowInserts {
        inner: InMemoryJobRepository,
        fail: bool,
    }

    impl JobRepository for SlowInserts {
        async fn insert_job(&self, job: &Job) -> Result<(), RepositoryError> {
            tokio::task::yield_now().await;
            if self.fail {
                return Err(RepositoryError::Unavailable);
            }
            self.inner.insert_job(job).await
        }
        async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
            self.inner.get_job(id).await
        }
        async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>, RepositoryError> {
            self.inner.list_jobs(status, limit).await
        }
        async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
            self.inner.list_unfinished_jobs().await
        }
        async fn transition_job(&self, job: &Job, expected: &[JobStatus]) -> Result<bool, RepositoryError> {
            self.inner.transition_job(job, expected).await
        }
        async fn purge_finished_jobs(&self, before: DateTime<Utc>) -> Result<u64, RepositoryError> {
            self.inner.purge_finished_jobs(before).await
        }
    }

    #[tokio::test]
    async fn concurrent_submits_never_exceed_capacity() {
        let repo = SlowInserts::default();
        let queue = JobQueue::new(repo.clone(), 3);
        let results = futures_util::future::join_all(
            (0..10).map(|_| queue.submit(job(JobPriority::Normal))),
        )
        .await;

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(QueueError::Full { capacity: 3 })))
            .count();
        assert_eq!(accepted, 3);
        assert_eq!(full, 7);
        assert_eq!(queue.len(), 3);
        assert_eq!(repo.list_unfinished_jobs().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_insert_releases_its_slot() {
        let failing = JobQueue::new(SlowInserts { fail: true, ..Default::default() }, 1);
        assert!(matches!(
            failing.submit(job(JobPriority::Normal)).await,
            Err(QueueError::Repository(_))
        ));
        assert!(failing.is_empty());
        assert!(failing.with_state(|s| s.reserved.is_empty()));
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let queue = JobQueue::new(InMemoryJobRepository::new(), 10);
        let p1 = queue.submit(job(JobPriority::Low)).await.unwrap();
        let p2 = queue.submit(job(JobPriority::High)).await.unwrap();
        let p3 = queue.submit(job(JobPriority::Low)).await.unwrap();

        let order: Vec<Uuid> = queue.snapshot().iter().map(|j| j.id).collect();
        assert_eq!(order, vec![p2, p1, p3]);

        assert_eq!(claim_any(&queue).await.unwrap().id, p2);
        assert_eq!(claim_any(&queue).await.unwrap().id, p1);
        assert_eq!(claim_any(&queue).await.unwrap().id, p3);
        assert!(claim_any(&queue).await.is_none());
    }

    #[tokio::test]
    async fn claim_marks_assigned_in_repository() {
        let queue = JobQueue::new(InMemoryJobRepository::new(), 10);
        let id = queue.submit(job(JobPriority::Normal)).await.unwrap();
        let claimed = claim_any(&queue).await.unwrap();
        assert_eq!(claimed.status, JobStatus::Assigned);

        let stored = queue.repo().get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Assigned);
        assert_eq!(stored.assigned_robot_id.as_deref(), Some("r1"));
        assert!(!queue.contains(&id));
    }

    #[tokio::test]
    async fn selector_skips_unmatched_jobs() {
        let queue = JobQueue::new(InMemoryJobRepository::new(), 10);
        let mut wants_gpu = job(JobPriority::Critical);
        wants_gpu.required_capabilities.insert("gpu".into());
        queue.submit(wants_gpu).await.unwrap();
        let plain = queue.submit(job(JobPriority::Low)).await.unwrap();

        let claimed = queue
            .claim_next(
                |j| j.required_capabilities.is_empty().then_some("cpu-robot"),
                |r| r.to_string(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.0.id, plain);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let queue = std::sync::Arc::new(JobQueue::new(InMemoryJobRepository::new(), 100));
        for _ in 0..20 {
            queue.submit(job(JobPriority::Normal)).await.unwrap();
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = claim_any(&queue).await {
                    mine.push(job.id);
                }
                mine
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn lost_cas_moves_to_next_candidate() {
        let queue = JobQueue::new(InMemoryJobRepository::new(), 10);
        let first = job(JobPriority::High);
        let first_id = first.id;
        queue.submit(first.clone()).await.unwrap();
        let second = queue.submit(job(JobPriority::Low)).await.unwrap();

        // Someone cancels the first job directly in storage.
        let mut cancelled = first;
        cancelled.status = JobStatus::Cancelled;
        assert!(queue.repo().transition_job(&cancelled, &[JobStatus::Queued]).await.unwrap());

        assert_eq!(claim_any(&queue).await.unwrap().id, second);
        assert!(!queue.contains(&first_id));
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let queue = JobQueue::new(InMemoryJobRepository::new(), 1);
        queue.submit(job(JobPriority::Normal)).await.unwrap();
        assert!(matches!(
            queue.submit(job(JobPriority::Normal)).await,
            Err(QueueError::Full { capacity: 1 })
        ));
    }

    #[tokio::test]
    async fn expired_jobs_are_taken_out() {
        let queue = JobQueue::new(InMemoryJobRepository::new(), 10);
        let mut old = job(JobPriority::Normal);
        old.timeout_secs = Some(5);
        old.submitted_at = Utc::now() - chrono::Duration::seconds(60);
        let old_id = queue.submit(old).await.unwrap();
        let fresh = queue.submit(job(JobPriority::Normal)).await.unwrap();

        let expired = queue.take_expired(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old_id);
        assert!(queue.contains(&fresh));
    }

    #[tokio::test]
    async fn restore_reindexes_queued_jobs() {
        let repo = InMemoryJobRepository::new();
        let queue = JobQueue::new(repo.clone(), 10);
        queue.submit(job(JobPriority::Normal)).await.unwrap();
        queue.submit(job(JobPriority::High)).await.unwrap();

        let fresh = JobQueue::new(repo, 10);
        assert_eq!(fresh.restore().await.unwrap(), 2);
        assert_eq!(fresh.snapshot()[0].priority, JobPriority::High);
    }
}
