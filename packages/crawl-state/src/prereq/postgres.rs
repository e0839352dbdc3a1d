use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use super::store::{distinct_events, PrereqEventStore};
use crate::error::{DbContext, Result};
use crate::maintenance::{MaintenanceKind, TableMaintenance, ThrottleSettings};
use crate::sql::{push_in_list, OwnerQuery, MAX_CLAUSE};

const TABLE: &str = "prereq_events";

pub struct PostgresPrereqEventStore {
    pool: PgPool,
    maintenance: TableMaintenance,
}

impl PostgresPrereqEventStore {
    pub fn new(pool: PgPool, analyze: ThrottleSettings, reindex: ThrottleSettings) -> Self {
        Self {
            pool,
            maintenance: TableMaintenance::new(TABLE, analyze).with_reindex(reindex),
        }
    }
}

#[async_trait]
impl PrereqEventStore for PostgresPrereqEventStore {
    async fn add_rows(&self, owner_id: i64, event_names: &[String]) -> Result<()> {
        let events = distinct_events(event_names);
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin transaction")?;
        let mut inserted = 0;

        for batch in events.chunks(MAX_CLAUSE) {
            let mut builder =
                QueryBuilder::<Postgres>::new("INSERT INTO prereq_events (owner, eventname) ");
            builder.push_values(batch, |mut row, event| {
                row.push_bind(owner_id).push_bind(*event);
            });
            builder.push(" ON CONFLICT (owner, eventname) DO NOTHING");
            // Every statement counts, even one that changed nothing.
            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .db_context("Failed to insert prerequisite events")?
                .rows_affected()
                .max(1);
        }

        tx.commit().await.db_context("Failed to commit transaction")?;

        self.maintenance.note(MaintenanceKind::Analyze, inserted);
        Ok(())
    }

    async fn delete_rows(&self, owner_id: i64) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM prereq_events WHERE owner = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .db_context("Failed to delete prerequisite events")?
            .rows_affected()
            .max(1);

        self.maintenance.note(MaintenanceKind::Reindex, deleted);
        Ok(())
    }

    async fn delete_rows_for_owners(&self, owner_ids: &[i64]) -> Result<()> {
        if owner_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin transaction")?;
        let mut deleted = 0;

        for batch in owner_ids.chunks(MAX_CLAUSE) {
            let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM prereq_events WHERE ");
            push_in_list(&mut builder, "owner", batch);
            deleted += builder
                .build()
                .execute(&mut *tx)
                .await
                .db_context("Failed to delete prerequisite events for owners")?
                .rows_affected()
                .max(1);
        }

        tx.commit().await.db_context("Failed to commit transaction")?;

        self.maintenance.note(MaintenanceKind::Reindex, deleted);
        Ok(())
    }

    async fn delete_rows_matching(&self, owners: &OwnerQuery) -> Result<()> {
        let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM prereq_events WHERE ");
        owners.push_exists(&mut builder, "prereq_events.owner");

        let deleted = builder
            .build()
            .execute(&self.pool)
            .await
            .db_context("Failed to delete matching prerequisite events")?
            .rows_affected();

        debug!(owner_table = owners.table(), deleted, "Deleted matching prerequisite events");
        self.maintenance.note(MaintenanceKind::Reindex, deleted.max(1));
        Ok(())
    }

    async fn owners_with_outstanding_events(&self, owner_ids: &[i64]) -> Result<HashSet<i64>> {
        let mut blocked = HashSet::new();

        for batch in owner_ids.chunks(MAX_CLAUSE) {
            let mut builder =
                QueryBuilder::<Postgres>::new("SELECT DISTINCT owner FROM prereq_events WHERE ");
            push_in_list(&mut builder, "owner", batch);
            let rows = builder
                .build()
                .fetch_all(&self.pool)
                .await
                .db_context("Failed to check prerequisite events")?;

            for row in rows {
                blocked.insert(row.try_get::<i64, _>("owner").db_context("Failed to decode owner")?);
            }
        }

        Ok(blocked)
    }

    async fn is_blocked(&self, owner_id: i64) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM prereq_events WHERE owner = $1)",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await
        .db_context("Failed to check prerequisite events")
    }

    async fn events_for_owner(&self, owner_id: i64) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT eventname FROM prereq_events WHERE owner = $1 ORDER BY eventname",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to list prerequisite events")
    }

    async fn conditionally_maintain(&self) -> Result<()> {
        self.maintenance.run_due(&self.pool).await.map(|_| ())
    }
}
