//! Process-level handle over the four stores.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::carrydown::{CarrydownStore, PostgresCarrydownStore};
use crate::config::Config;
use crate::error::{DbContext, Result};
use crate::hop_deps::{HopDeleteDepsStore, PostgresHopDeleteDepsStore};
use crate::jobs::{JobManager, PostgresJobStore};
use crate::prereq::{PostgresPrereqEventStore, PrereqEventStore};
use crate::traits::{BaseCacheInvalidator, BaseConnectorRegistry, SequenceIdGenerator};

/// Counts reported by [`CrawlState::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub jobs_recovered: usize,
}

pub struct CrawlState {
    pub jobs: JobManager,
    pub carrydown: Arc<dyn CarrydownStore>,
    pub hop_deps: Arc<dyn HopDeleteDepsStore>,
    pub prereq_events: Arc<dyn PrereqEventStore>,
}

impl CrawlState {
    /// Open a pool, apply pending migrations and build the Postgres-backed stores.
    pub async fn connect(
        config: &Config,
        connectors: Arc<dyn BaseConnectorRegistry>,
        cache: Arc<dyn BaseCacheInvalidator>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .db_context("Failed to connect to database")?;

        migrate(&pool).await?;
        Ok(Self::from_pool(pool, config, connectors, cache))
    }

    pub fn from_pool(
        pool: PgPool,
        config: &Config,
        connectors: Arc<dyn BaseConnectorRegistry>,
        cache: Arc<dyn BaseCacheInvalidator>,
    ) -> Self {
        let maintenance = &config.maintenance;
        Self {
            jobs: JobManager::new(
                Arc::new(PostgresJobStore::new(pool.clone())),
                Arc::new(SequenceIdGenerator::new(pool.clone())),
                connectors,
                cache,
            ),
            carrydown: Arc::new(PostgresCarrydownStore::new(
                pool.clone(),
                maintenance.carrydown_analyze,
            )),
            hop_deps: Arc::new(PostgresHopDeleteDepsStore::new(
                pool.clone(),
                maintenance.hop_deps_analyze,
                maintenance.hop_deps_reindex,
            )),
            prereq_events: Arc::new(PostgresPrereqEventStore::new(
                pool,
                maintenance.prereq_analyze,
                maintenance.prereq_reindex,
            )),
        }
    }

    /// Process-start recovery. Safe to repeat on a consistent store.
    ///
    /// Unconfirmed carrydown rows are rolled back before job statuses are
    /// collapsed, so no job resumes against a half-written pass.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.carrydown.reset().await?;
        let jobs_recovered = self.jobs.restart().await?;

        info!(jobs_recovered, "Crawl state recovered");
        Ok(RecoveryReport { jobs_recovered })
    }

    /// Give every table a chance to run due maintenance; the first failure is returned
    /// after all tables were attempted.
    pub async fn conditionally_maintain(&self) -> Result<()> {
        let results = [
            self.carrydown.conditionally_maintain().await,
            self.hop_deps.conditionally_maintain().await,
            self.prereq_events.conditionally_maintain().await,
        ];

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Conditional maintenance failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Apply the bundled migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[cfg(any(test, feature = "testing"))]
mod in_memory {
    use std::sync::Arc;

    use super::CrawlState;
    use crate::carrydown::testing::TestCarrydownStore;
    use crate::hop_deps::testing::TestHopDeleteDepsStore;
    use crate::jobs::testing::TestJobStore;
    use crate::jobs::JobManager;
    use crate::prereq::testing::TestPrereqEventStore;
    use crate::test_dependencies::{CountingIdGenerator, TestTables};
    use crate::traits::{BaseCacheInvalidator, BaseConnectorRegistry};

    impl CrawlState {
        /// Stores held in memory; `tables` backs owner queries.
        pub fn in_memory(
            connectors: Arc<dyn BaseConnectorRegistry>,
            cache: Arc<dyn BaseCacheInvalidator>,
            tables: Arc<TestTables>,
        ) -> Self {
            Self {
                jobs: JobManager::new(
                    Arc::new(TestJobStore::new()),
                    Arc::new(CountingIdGenerator::default()),
                    connectors,
                    cache,
                ),
                carrydown: Arc::new(TestCarrydownStore::default()),
                hop_deps: Arc::new(TestHopDeleteDepsStore::new(tables.clone())),
                prereq_events: Arc::new(TestPrereqEventStore::new(tables)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::carrydown::{CarrydownMark, CarrydownValue, ChildCarrydown};
    use crate::jobs::JobStatus;
    use crate::test_dependencies::{RecordingCacheInvalidator, TestTables};
    use crate::traits::StaticConnectorRegistry;

    #[tokio::test]
    async fn recover_rolls_back_interrupted_pass_and_seeding() {
        let connectors = Arc::new(StaticConnectorRegistry::new());
        connectors.register_connection("web").await;
        connectors.register_output("index").await;
        let state = CrawlState::in_memory(
            connectors,
            Arc::new(RecordingCacheInvalidator::new()),
            Arc::new(TestTables::new()),
        );

        let job = state.jobs.create("web", "index", "Intranet").await.unwrap();
        state.jobs.save(&job).await.unwrap();
        state.jobs.start_job(job.id, None).await.unwrap();
        state.jobs.note_job_starting_up(job.id).await.unwrap();
        state.jobs.note_job_started(job.id, Utc::now()).await.unwrap();
        state.jobs.note_job_seeding_started(job.id).await.unwrap();
        state
            .carrydown
            .record_carrydown_data(
                job.id,
                Some("parent"),
                &ChildCarrydown::new("child").with("acl", CarrydownValue::new("eng")),
            )
            .await
            .unwrap();

        let report = state.recover().await.unwrap();
        assert_eq!(report.jobs_recovered, 1);
        assert_eq!(state.jobs.get_status(job.id).await.unwrap(), JobStatus::Active);
        assert!(state
            .carrydown
            .records_for_parent(job.id, Some("parent"))
            .await
            .unwrap()
            .iter()
            .all(|r| r.mark != CarrydownMark::New));

        let again = state.recover().await.unwrap();
        assert_eq!(again.jobs_recovered, 0);
    }

    #[tokio::test]
    async fn maintain_with_nothing_due_is_quiet() {
        let state = CrawlState::in_memory(
            Arc::new(StaticConnectorRegistry::new()),
            Arc::new(RecordingCacheInvalidator::new()),
            Arc::new(TestTables::new()),
        );
        state.conditionally_maintain().await.unwrap();
    }
}
