//! Persistence seam for jobs.

use async_trait::async_trait;

use super::model::{Job, JobState, StatusUpdate};
use super::status::JobStatus;
use crate::error::Result;

/// Computes the update for a locked job; an `Err` aborts without writing.
pub type StateUpdateFn<'a> = dyn Fn(&JobState) -> Result<StatusUpdate> + Send + Sync + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// `specs_changed` means `last_check_time` was reset.
    Updated { specs_changed: bool },
}

/// Runtime state before and after a locked read-modify-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub job_id: i64,
    pub before: JobState,
    pub after: JobState,
}

impl StateChange {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }

    pub fn status_changed(&self) -> bool {
        self.before.status != self.after.status
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or update the definition and rewrite its child records.
    ///
    /// Runtime state is only written on insert (INACTIVE, `last_time = now`).
    async fn save(&self, job: &Job) -> Result<SaveOutcome>;

    async fn load(&self, job_id: i64) -> Result<Option<Job>>;

    /// Every job not marked for deletion, ordered by description.
    async fn load_all(&self) -> Result<Vec<Job>>;

    /// Delete a job and its child records; false if it did not exist.
    async fn delete(&self, job_id: i64) -> Result<bool>;

    /// Lock one job row, compute an update from its state, write it.
    async fn modify_state(&self, job_id: i64, update: &StateUpdateFn<'_>) -> Result<StateChange>;

    async fn ids_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<i64>>;

    async fn ids_for_connection(&self, connection_name: &str) -> Result<Vec<i64>>;

    async fn ids_for_output(&self, output_name: &str) -> Result<Vec<i64>>;
}
