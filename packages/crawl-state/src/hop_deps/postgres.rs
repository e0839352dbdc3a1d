use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use super::model::DeleteDependency;
use super::store::HopDeleteDepsStore;
use crate::error::{DbContext, Result};
use crate::maintenance::{TableMaintenance, ThrottleSettings};
use crate::sql::{push_in_list, push_nullable_eq, OwnerQuery, MAX_CLAUSE};

const TABLE: &str = "hop_delete_deps";

pub struct PostgresHopDeleteDepsStore {
    pool: PgPool,
    maintenance: TableMaintenance,
}

impl PostgresHopDeleteDepsStore {
    pub fn new(pool: PgPool, analyze: ThrottleSettings, reindex: ThrottleSettings) -> Self {
        Self {
            pool,
            maintenance: TableMaintenance::new(TABLE, analyze).with_reindex(reindex),
        }
    }
}

#[async_trait]
impl HopDeleteDepsStore for PostgresHopDeleteDepsStore {
    async fn write_dependency(
        &self,
        job_id: i64,
        owner_id: i64,
        dependency: &DeleteDependency,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO hop_delete_deps (jobid, ownerid, linktype, parentidhash, childidhash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (ownerid, linktype, parentidhash, childidhash) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(owner_id)
        .bind(&dependency.link_type)
        .bind(&dependency.parent_hash)
        .bind(&dependency.child_hash)
        .execute(&self.pool)
        .await
        .db_context("Failed to write hop delete dependency")?;

        // Every statement counts, even one that changed nothing.
        self.maintenance.note_all(result.rows_affected().max(1));
        Ok(())
    }

    async fn get_delete_dependencies(&self, owner_id: i64) -> Result<Vec<DeleteDependency>> {
        let rows = sqlx::query(
            r#"
            SELECT linktype, parentidhash, childidhash
            FROM hop_delete_deps
            WHERE ownerid = $1
            ORDER BY linktype NULLS FIRST, parentidhash, childidhash NULLS FIRST
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to read hop delete dependencies")?;

        rows.iter()
            .map(|row| {
                Ok(DeleteDependency {
                    link_type: row.try_get("linktype").db_context("Failed to decode linktype")?,
                    parent_hash: row
                        .try_get("parentidhash")
                        .db_context("Failed to decode parentidhash")?,
                    child_hash: row
                        .try_get("childidhash")
                        .db_context("Failed to decode childidhash")?,
                })
            })
            .collect()
    }

    async fn delete_dependency(&self, owner_id: i64, dependency: &DeleteDependency) -> Result<()> {
        let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM hop_delete_deps WHERE ownerid = ");
        builder.push_bind(owner_id).push(" AND ");
        push_nullable_eq(&mut builder, "linktype", dependency.link_type.as_deref());
        builder
            .push(" AND parentidhash = ")
            .push_bind(dependency.parent_hash.clone())
            .push(" AND ");
        push_nullable_eq(&mut builder, "childidhash", dependency.child_hash.as_deref());

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .db_context("Failed to delete hop delete dependency")?;

        self.maintenance.note_all(result.rows_affected().max(1));
        Ok(())
    }

    async fn delete_owner_rows(&self, owner_ids: &[i64]) -> Result<()> {
        if owner_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin transaction")?;
        let mut deleted = 0;
        let mut events = 0;

        for batch in owner_ids.chunks(MAX_CLAUSE) {
            let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM hop_delete_deps WHERE ");
            push_in_list(&mut builder, "ownerid", batch);
            let affected = builder
                .build()
                .execute(&mut *tx)
                .await
                .db_context("Failed to delete hop delete dependencies for owners")?
                .rows_affected();
            deleted += affected;
            events += affected.max(1);
        }

        tx.commit().await.db_context("Failed to commit transaction")?;

        debug!(owners = owner_ids.len(), deleted, "Deleted hop dependencies for owners");
        self.maintenance.note_all(events);
        Ok(())
    }

    async fn remove_marked_rows(&self, owners: &OwnerQuery) -> Result<()> {
        let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM hop_delete_deps WHERE ownerid IN (");
        owners.push_subquery(&mut builder);
        builder.push(")");

        let deleted = builder
            .build()
            .execute(&self.pool)
            .await
            .db_context("Failed to remove marked hop delete dependencies")?
            .rows_affected();

        debug!(owner_table = owners.table(), deleted, "Removed marked hop dependencies");
        self.maintenance.note_all(deleted.max(1));
        Ok(())
    }

    async fn delete_job(&self, job_id: i64) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM hop_delete_deps WHERE jobid = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .db_context("Failed to delete hop delete dependencies for job")?
            .rows_affected();

        self.maintenance.note_all(deleted.max(1));
        Ok(())
    }

    async fn conditionally_maintain(&self) -> Result<()> {
        self.maintenance.run_due(&self.pool).await.map(|_| ())
    }
}
