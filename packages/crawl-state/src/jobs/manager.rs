//! Job lifecycle operations.
//!
//! Every status change is a single-job read-modify-write through
//! [`JobStore::modify_state`]: the row is locked, the pure transition in
//! [`JobStatus::apply`] decides the next status, and the caches naming the job
//! are invalidated once the write commits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::model::{Job, JobState, StatusUpdate};
use super::status::{JobEvent, JobStatus, Transition};
use super::store::{JobStore, SaveOutcome, StateChange};
use crate::error::{CrawlStateError, Result};
use crate::traits::{BaseCacheInvalidator, BaseConnectorRegistry, BaseIdGenerator, CacheKey};

/// States where a job is being crawled or wound down.
const RUNNING_STATES: [JobStatus; 11] = [
    JobStatus::Active,
    JobStatus::ActiveUninstalled,
    JobStatus::ActiveSeeding,
    JobStatus::ActiveSeedingUninstalled,
    JobStatus::ActiveWait,
    JobStatus::ActiveWaitSeeding,
    JobStatus::StartingUp,
    JobStatus::Aborting,
    JobStatus::AbortingSeeding,
    JobStatus::AbortingStartingUp,
    JobStatus::ShuttingDown,
];

pub struct JobManager {
    store: Arc<dyn JobStore>,
    ids: Arc<dyn BaseIdGenerator>,
    connectors: Arc<dyn BaseConnectorRegistry>,
    cache: Arc<dyn BaseCacheInvalidator>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        ids: Arc<dyn BaseIdGenerator>,
        connectors: Arc<dyn BaseConnectorRegistry>,
        cache: Arc<dyn BaseCacheInvalidator>,
    ) -> Self {
        Self {
            store,
            ids,
            connectors,
            cache,
        }
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// A fresh, unsaved job with a newly allocated id.
    pub async fn create(
        &self,
        connection_name: &str,
        output_name: &str,
        description: &str,
    ) -> Result<Job> {
        let id = self.ids.next_id().await?;
        Ok(Job::builder()
            .id(id)
            .description(description)
            .connection_name(connection_name)
            .output_name(output_name)
            .build())
    }

    pub async fn save(&self, job: &Job) -> Result<SaveOutcome> {
        let outcome = self.store.save(job).await?;
        if let SaveOutcome::Updated {
            specs_changed: true,
        } = outcome
        {
            debug!(job_id = job.id, "Job specification changed; incremental watermark reset");
        }
        self.cache.invalidate(&[
            CacheKey::AllJobs,
            CacheKey::JobStatus,
            CacheKey::Job(job.id),
        ]);
        Ok(outcome)
    }

    pub async fn load(&self, job_id: i64) -> Result<Job> {
        self.store
            .load(job_id)
            .await?
            .ok_or(CrawlStateError::JobNotFound(job_id))
    }

    pub async fn load_multiple(&self, job_ids: &[i64]) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            jobs.push(self.load(*job_id).await?);
        }
        Ok(jobs)
    }

    pub async fn get_all(&self) -> Result<Vec<Job>> {
        self.store.load_all().await
    }

    pub async fn delete(&self, job_id: i64) -> Result<()> {
        if !self.store.delete(job_id).await? {
            return Err(CrawlStateError::JobNotFound(job_id));
        }
        self.cache.invalidate(&[
            CacheKey::AllJobs,
            CacheKey::JobStatus,
            CacheKey::Job(job_id),
        ]);
        Ok(())
    }

    // ========================================================================
    // Lifecycle transitions
    // ========================================================================

    /// Queue a job for startup, clearing the previous run's error and end time.
    pub async fn start_job(&self, job_id: i64, window_end: Option<DateTime<Utc>>) -> Result<()> {
        self.transition(job_id, JobEvent::Start, move |_, next| {
            StatusUpdate::to(next)
                .end_time(None)
                .error(None)
                .window_end(window_end)
        })
        .await?;
        Ok(())
    }

    pub async fn note_job_starting_up(&self, job_id: i64) -> Result<()> {
        self.transition(job_id, JobEvent::BeginStartup, |_, next| StatusUpdate::to(next))
            .await?;
        Ok(())
    }

    /// The queue has been loaded; the job becomes ACTIVE (or an aborting state).
    pub async fn note_job_started(&self, job_id: i64, start_time: DateTime<Utc>) -> Result<()> {
        let installed = self.connectors_installed(job_id).await?;
        self.transition(job_id, JobEvent::Started { installed }, move |_, next| {
            let update = StatusUpdate::to(next).advance_last_check(start_time);
            if next.is_aborting() {
                update
            } else {
                update.start_time(start_time)
            }
        })
        .await?;
        Ok(())
    }

    pub async fn note_job_seeding_started(&self, job_id: i64) -> Result<()> {
        self.transition(job_id, JobEvent::BeginSeeding, |_, next| StatusUpdate::to(next))
            .await?;
        Ok(())
    }

    pub async fn note_job_seeded(&self, job_id: i64, seed_time: DateTime<Utc>) -> Result<()> {
        self.transition(job_id, JobEvent::Seeded, move |_, next| {
            StatusUpdate::to(next).advance_last_check(seed_time)
        })
        .await?;
        Ok(())
    }

    /// The job's execution window closed.
    pub async fn wait_job(&self, job_id: i64) -> Result<()> {
        self.transition(job_id, JobEvent::Wait, |_, next| {
            StatusUpdate::to(next).window_end(None)
        })
        .await?;
        Ok(())
    }

    /// A new execution window opened, ending at `window_end`.
    pub async fn unwait_job(&self, job_id: i64, window_end: Option<DateTime<Utc>>) -> Result<()> {
        let installed = self.connectors_installed(job_id).await?;
        self.transition(job_id, JobEvent::Unwait { installed }, move |_, next| {
            StatusUpdate::to(next).window_end(window_end)
        })
        .await?;
        Ok(())
    }

    pub async fn pause_job(&self, job_id: i64) -> Result<()> {
        self.transition(job_id, JobEvent::Pause, |_, next| StatusUpdate::to(next))
            .await?;
        Ok(())
    }

    /// Resume a paused job.
    pub async fn restart_job(&self, job_id: i64) -> Result<()> {
        let installed = self.connectors_installed(job_id).await?;
        self.transition(job_id, JobEvent::Resume { installed }, |_, next| {
            StatusUpdate::to(next)
        })
        .await?;
        Ok(())
    }

    /// Returns false if the job is already aborting.
    pub async fn abort_job(&self, job_id: i64, error_text: Option<&str>) -> Result<bool> {
        let error_text = error_text.map(str::to_string);
        let change = self
            .transition(job_id, JobEvent::Abort, move |_, next| {
                StatusUpdate::to(next).error(error_text.clone())
            })
            .await?;
        Ok(change.status_changed())
    }

    /// Returns false if the job is already aborting for restart.
    pub async fn abort_restart_job(&self, job_id: i64) -> Result<bool> {
        let change = self
            .transition(job_id, JobEvent::AbortForRestart, |_, next| {
                StatusUpdate::to(next)
            })
            .await?;
        Ok(change.status_changed())
    }

    pub async fn note_job_shutting_down(&self, job_id: i64) -> Result<()> {
        self.transition(job_id, JobEvent::BeginShutdown, |_, next| StatusUpdate::to(next))
            .await?;
        Ok(())
    }

    /// Normal completion: clears the error and records the end time.
    pub async fn finish_job(&self, job_id: i64, finish_time: DateTime<Utc>) -> Result<()> {
        self.transition(job_id, JobEvent::Finish, move |_, next| {
            StatusUpdate::to(next)
                .error(None)
                .end_time(Some(finish_time))
                .last_time(finish_time)
                .window_end(None)
                .reseed_time(None)
        })
        .await?;
        Ok(())
    }

    /// Abort completion: keeps the error text so the cause stays visible.
    pub async fn finish_abort_job(&self, job_id: i64, abort_time: DateTime<Utc>) -> Result<()> {
        self.transition(job_id, JobEvent::FinishAbort, move |_, next| {
            StatusUpdate::to(next)
                .end_time(None)
                .last_time(abort_time)
                .window_end(None)
                .reseed_time(None)
        })
        .await?;
        Ok(())
    }

    pub async fn mark_for_delete(&self, job_id: i64) -> Result<()> {
        self.transition(job_id, JobEvent::MarkForDelete, |_, next| StatusUpdate::to(next))
            .await?;
        Ok(())
    }

    pub async fn update_last_time(&self, job_id: i64, last_time: DateTime<Utc>) -> Result<()> {
        let change = self
            .store
            .modify_state(job_id, &move |_: &JobState| -> Result<StatusUpdate> {
                Ok(StatusUpdate::default().last_time(last_time))
            })
            .await?;
        self.note_change(&change, "update last time");
        Ok(())
    }

    // ========================================================================
    // Connector registration
    // ========================================================================

    /// Jobs using this repository connection lose their connector.
    pub async fn note_connector_deregistration(&self, connection_name: &str) -> Result<usize> {
        let job_ids = self.store.ids_for_connection(connection_name).await?;
        self.apply_to_all(&job_ids, |_| JobEvent::ConnectorDeregistered)
            .await
    }

    pub async fn note_output_connector_deregistration(&self, output_name: &str) -> Result<usize> {
        let job_ids = self.store.ids_for_output(output_name).await?;
        self.apply_to_all(&job_ids, |_| JobEvent::ConnectorDeregistered)
            .await
    }

    /// Jobs using this repository connection regain it, if their output is also installed.
    pub async fn note_connector_registration(&self, connection_name: &str) -> Result<usize> {
        let job_ids = self.store.ids_for_connection(connection_name).await?;
        self.note_registration(&job_ids).await
    }

    pub async fn note_output_connector_registration(&self, output_name: &str) -> Result<usize> {
        let job_ids = self.store.ids_for_output(output_name).await?;
        self.note_registration(&job_ids).await
    }

    async fn note_registration(&self, job_ids: &[i64]) -> Result<usize> {
        let mut changed = 0;
        for job_id in job_ids {
            let result: Result<StateChange> = async {
                let installed = self.connectors_installed(*job_id).await?;
                self.transition(*job_id, JobEvent::ConnectorRegistered { installed }, |_, next| {
                    StatusUpdate::to(next)
                })
                .await
            }
            .await;
            let Some(change) = skip_vanished(*job_id, result)? else {
                continue;
            };
            if change.status_changed() {
                changed += 1;
            }
        }
        Ok(changed)
    }

    // ========================================================================
    // Crash recovery
    // ========================================================================

    /// Collapse startup and seeding states that cannot survive a process restart.
    pub async fn restart(&self) -> Result<usize> {
        let job_ids = self
            .store
            .ids_with_status(&recoverable_states(JobEvent::ProcessRestart))
            .await?;
        let changed = self
            .apply_to_all(&job_ids, |_| JobEvent::ProcessRestart)
            .await?;
        if changed > 0 {
            info!(jobs = changed, "Recovered job statuses after restart");
        }
        Ok(changed)
    }

    pub async fn reset_startup_worker_status(&self) -> Result<usize> {
        let job_ids = self
            .store
            .ids_with_status(&recoverable_states(JobEvent::ResetStartupWorker))
            .await?;
        self.apply_to_all(&job_ids, |_| JobEvent::ResetStartupWorker)
            .await
    }

    pub async fn reset_seeding_worker_status(&self) -> Result<usize> {
        let job_ids = self
            .store
            .ids_with_status(&recoverable_states(JobEvent::ResetSeedingWorker))
            .await?;
        self.apply_to_all(&job_ids, |_| JobEvent::ResetSeedingWorker)
            .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_status(&self, job_id: i64) -> Result<JobStatus> {
        Ok(self.load(job_id).await?.status())
    }

    /// ACTIVE or ACTIVESEEDING: documents may be processed right now.
    pub async fn is_job_active(&self, job_id: i64) -> Result<bool> {
        Ok(self.get_status(job_id).await?.is_active())
    }

    pub async fn check_if_reference(&self, connection_name: &str) -> Result<bool> {
        Ok(!self.store.ids_for_connection(connection_name).await?.is_empty())
    }

    pub async fn check_if_output_reference(&self, output_name: &str) -> Result<bool> {
        Ok(!self.store.ids_for_output(output_name).await?.is_empty())
    }

    pub async fn find_jobs_for_connection(&self, connection_name: &str) -> Result<Vec<i64>> {
        self.store.ids_for_connection(connection_name).await
    }

    pub async fn deleting_jobs_present(&self) -> Result<bool> {
        Ok(!self
            .store
            .ids_with_status(&[JobStatus::ReadyForDelete])
            .await?
            .is_empty())
    }

    pub async fn active_jobs_present(&self) -> Result<bool> {
        Ok(!self.store.ids_with_status(&RUNNING_STATES).await?.is_empty())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn transition<F>(&self, job_id: i64, event: JobEvent, effects: F) -> Result<StateChange>
    where
        F: Fn(&JobState, JobStatus) -> StatusUpdate + Send + Sync,
    {
        let update = move |state: &JobState| -> Result<StatusUpdate> {
            match state.status.apply(event) {
                Ok(Transition::To(next)) => Ok(effects(state, next)),
                Ok(Transition::Unchanged) => Ok(StatusUpdate::default()),
                Err(e) => Err(e.for_job(job_id)),
            }
        };
        let change = self.store.modify_state(job_id, &update).await?;
        self.note_change(&change, event.name());
        Ok(change)
    }

    async fn apply_to_all<E>(&self, job_ids: &[i64], event_for: E) -> Result<usize>
    where
        E: Fn(i64) -> JobEvent,
    {
        let mut changed = 0;
        for job_id in job_ids {
            let result = self
                .transition(*job_id, event_for(*job_id), |_, next| StatusUpdate::to(next))
                .await;
            let Some(change) = skip_vanished(*job_id, result)? else {
                continue;
            };
            if change.status_changed() {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn note_change(&self, change: &StateChange, operation: &str) {
        if !change.changed() {
            return;
        }
        if change.status_changed() {
            debug!(
                job_id = change.job_id,
                from = %change.before.status,
                to = %change.after.status,
                operation,
                "Job status changed"
            );
        }
        self.cache
            .invalidate(&[CacheKey::JobStatus, CacheKey::Job(change.job_id)]);
    }

    async fn connectors_installed(&self, job_id: i64) -> Result<bool> {
        let job = self.load(job_id).await?;
        Ok(self.connectors.is_installed(&job.connection_name).await?
            && self.connectors.is_output_installed(&job.output_name).await?)
    }
}

/// A sweep lists ids before transitioning them; a job deleted in between is skipped.
fn skip_vanished<T>(job_id: i64, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(CrawlStateError::JobNotFound(_)) => {
            warn!(job_id, "Job deleted during sweep, skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Statuses a recovery event would change.
fn recoverable_states(event: JobEvent) -> Vec<JobStatus> {
    JobStatus::ALL
        .into_iter()
        .filter(|status| matches!(status.apply(event), Ok(Transition::To(_))))
        .collect()
}
