//! In-process repository implementations.
//!
//! Backed by `DashMap` behind an `Arc`, so clones share state. Used by the
//! worker agent's local runs, the `fleetflow run` command and unit tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleetflow_types::error::RepositoryError;
use fleetflow_types::job::{Job, JobStatus};
use fleetflow_types::run::Checkpoint;
use fleetflow_types::workflow::WorkflowRecord;
use uuid::Uuid;

use super::{CheckpointRepository, JobRepository, WorkflowRepository};

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointRepository {
    latest: Arc<DashMap<Uuid, Checkpoint>>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let mut entry = self
            .latest
            .entry(checkpoint.run_id)
            .or_insert_with(|| checkpoint.clone());
        if checkpoint.sequence >= entry.sequence {
            *entry = checkpoint.clone();
        }
        Ok(())
    }

    async fn latest_checkpoint(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.latest.get(run_id).map(|c| c.clone()))
    }

    async fn delete_checkpoints(&self, run_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self.latest.remove(run_id).map_or(0, |_| 1))
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryJobRepository {
    jobs: Arc<DashMap<Uuid, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for InMemoryJobRepository {
    async fn insert_job(&self, job: &Job) -> Result<(), RepositoryError> {
        if self.jobs.contains_key(&job.id) {
            return Err(RepositoryError::Conflict(format!("job {} exists", job.id)));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self.jobs.get(id).map(|j| j.clone()))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>, RepositoryError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn transition_job(&self, job: &Job, expected: &[JobStatus]) -> Result<bool, RepositoryError> {
        // The entry guard holds the shard lock, so check-and-write is atomic.
        match self.jobs.get_mut(&job.id) {
            Some(mut stored) if expected.contains(&stored.status) => {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn purge_finished_jobs(&self, before: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let old = self.jobs.len();
        self.jobs.retain(|_, j| {
            !(j.status.is_terminal() && j.completed_at.is_some_and(|at| at < before))
        });
        Ok((old - self.jobs.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: Arc<DashMap<Uuid, WorkflowRecord>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        self.workflows.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowRecord>, RepositoryError> {
        Ok(self.workflows.get(id).map(|w| w.clone()))
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRecord>, RepositoryError> {
        Ok(self
            .workflows
            .iter()
            .filter(|w| w.name == name)
            .max_by_key(|w| w.updated_at)
            .map(|w| w.clone()))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        let mut all: Vec<WorkflowRecord> = self.workflows.iter().map(|w| w.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.workflows.remove(id).is_some())
    }
}
