//! In-memory job store for tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::model::{Job, JobState};
use super::status::JobStatus;
use super::store::{JobStore, SaveOutcome, StateChange, StateUpdateFn};
use crate::error::{CrawlStateError, Result};

/// Job store backed by a map; one write lock stands in for the row lock.
#[derive(Default)]
pub struct TestJobStore {
    jobs: RwLock<BTreeMap<i64, Job>>,
}

impl TestJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a job's runtime state directly, bypassing transitions.
    pub fn force_state(&self, job_id: i64, state: JobState) {
        if let Some(job) = self
            .jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&job_id)
        {
            job.state = state;
        }
    }
}

#[async_trait]
impl JobStore for TestJobStore {
    async fn save(&self, job: &Job) -> Result<SaveOutcome> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                let specs_changed = existing.specs_differ(job);
                let mut state = existing.state.clone();
                if specs_changed {
                    state.last_check_time = None;
                }
                *existing = Job {
                    state,
                    ..job.clone()
                };
                Ok(SaveOutcome::Updated { specs_changed })
            }
            None => {
                let state = JobState {
                    last_time: Some(Utc::now()),
                    ..JobState::default()
                };
                jobs.insert(
                    job.id,
                    Job {
                        state,
                        ..job.clone()
                    },
                );
                Ok(SaveOutcome::Inserted)
            }
        }
    }

    async fn load(&self, job_id: i64) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned())
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|job| job.status() != JobStatus::ReadyForDelete)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.description.cmp(&b.description));
        Ok(jobs)
    }

    async fn delete(&self, job_id: i64) -> Result<bool> {
        Ok(self
            .jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id)
            .is_some())
    }

    async fn modify_state(&self, job_id: i64, update: &StateUpdateFn<'_>) -> Result<StateChange> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(&job_id)
            .ok_or(CrawlStateError::JobNotFound(job_id))?;

        let before = job.state.clone();
        let change = update(&before)?;
        change.apply_to(&mut job.state);

        Ok(StateChange {
            job_id,
            before,
            after: job.state.clone(),
        })
    }

    async fn ids_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<i64>> {
        Ok(self.ids_where(|job| statuses.contains(&job.status())))
    }

    async fn ids_for_connection(&self, connection_name: &str) -> Result<Vec<i64>> {
        Ok(self.ids_where(|job| job.connection_name == connection_name))
    }

    async fn ids_for_output(&self, output_name: &str) -> Result<Vec<i64>> {
        Ok(self.ids_where(|job| job.output_name == output_name))
    }
}

impl TestJobStore {
    fn ids_where(&self, predicate: impl Fn(&Job) -> bool) -> Vec<i64> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|job| predicate(job))
            .map(|job| job.id)
            .collect()
    }
}
