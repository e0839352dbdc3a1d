use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt, TryStreamExt};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use super::model::{
    AdjacentDedup, CarrydownDataValue, CarrydownKey, CarrydownMark, CarrydownPlan,
    CarrydownRecord, ChildCarrydown,
};
use super::store::CarrydownStore;
use crate::error::{DbContext, Result};
use crate::maintenance::{MaintenanceKind, TableMaintenance, ThrottleSettings};
use crate::sql::{push_in_list, push_nullable_eq, MAX_CLAUSE};

const TABLE: &str = "carrydown";

pub struct PostgresCarrydownStore {
    pool: PgPool,
    maintenance: TableMaintenance,
}

impl PostgresCarrydownStore {
    pub fn new(pool: PgPool, analyze: ThrottleSettings) -> Self {
        Self {
            pool,
            maintenance: TableMaintenance::new(TABLE, analyze),
        }
    }

    pub fn maintenance(&self) -> &TableMaintenance {
        &self.maintenance
    }
}

/// `jobid = $ AND parentidhash <op> $`
fn push_parent_scope(builder: &mut QueryBuilder<'_, Postgres>, job_id: i64, parent: Option<&str>) {
    builder.push("jobid = ").push_bind(job_id).push(" AND ");
    push_nullable_eq(builder, "parentidhash", parent);
}

/// `parentidhash IN (...)` for a batch of hashes, `parentidhash IS NULL` for seeds.
fn push_parent_set<'args>(builder: &mut QueryBuilder<'args, Postgres>, parents: Option<&'args [String]>) {
    match parents {
        Some(batch) => push_in_list(builder, "parentidhash", batch),
        None => push_nullable_eq(builder, "parentidhash", None),
    }
}

/// `((childidhash = $ AND dataname = $ AND datavaluehash <op> $) OR ...)`
fn push_key_predicates(builder: &mut QueryBuilder<'_, Postgres>, keys: &[CarrydownKey]) {
    builder.push("(");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        builder
            .push("(childidhash = ")
            .push_bind(key.child_hash.clone())
            .push(" AND dataname = ")
            .push_bind(key.name.clone())
            .push(" AND ");
        push_nullable_eq(builder, "datavaluehash", key.value_hash.as_deref());
        builder.push(")");
    }
    builder.push(")");
}

#[async_trait]
impl CarrydownStore for PostgresCarrydownStore {
    async fn record_carrydown_data_multiple(
        &self,
        job_id: i64,
        parent_hash: Option<&str>,
        children: &[ChildCarrydown],
    ) -> Result<Vec<bool>> {
        let plan = CarrydownPlan::new(children);
        if plan.is_empty() {
            return Ok(vec![false; children.len()]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin carrydown write")?;

        // Lock whatever already exists; only presence matters, not the payload.
        let mut existing = HashSet::new();
        for batch in plan.keys().chunks(MAX_CLAUSE) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "SELECT childidhash, dataname, datavaluehash FROM carrydown WHERE ",
            );
            push_parent_scope(&mut builder, job_id, parent_hash);
            builder.push(" AND ");
            push_key_predicates(&mut builder, batch);
            builder.push(" FOR UPDATE");

            let rows = builder
                .build()
                .fetch_all(&mut *tx)
                .await
                .db_context("Failed to check existing carrydown rows")?;
            for row in &rows {
                existing.insert(CarrydownKey {
                    child_hash: row.try_get("childidhash").db_context("Failed to decode carrydown row")?,
                    name: row.try_get("dataname").db_context("Failed to decode carrydown row")?,
                    value_hash: row
                        .try_get("datavaluehash")
                        .db_context("Failed to decode carrydown row")?,
                });
            }
        }

        let outcome = plan.classify(&existing);
        let parent = parent_hash.map(str::to_string);

        for batch in outcome.inserts.chunks(MAX_CLAUSE) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO carrydown (jobid, parentidhash, childidhash, dataname, datavaluehash, datavalue, isnew) ",
            );
            builder.push_values(batch, |mut row, planned| {
                row.push_bind(job_id)
                    .push_bind(parent.clone())
                    .push_bind(planned.key.child_hash.clone())
                    .push_bind(planned.key.name.clone())
                    .push_bind(planned.key.value_hash.clone())
                    .push_bind(planned.value.clone())
                    .push_bind(CarrydownMark::New.code());
            });
            // A concurrent writer that committed first turns our insert into a re-declaration.
            builder
                .push(" ON CONFLICT (jobid, parentidhash, childidhash, dataname, datavaluehash) DO UPDATE SET isnew = ")
                .push_bind(CarrydownMark::Existing.code());

            builder
                .build()
                .execute(&mut *tx)
                .await
                .db_context("Failed to insert carrydown rows")?;
        }

        for batch in outcome.updates.chunks(MAX_CLAUSE) {
            let mut builder = QueryBuilder::<Postgres>::new("UPDATE carrydown SET isnew = ");
            builder.push_bind(CarrydownMark::Existing.code()).push(" WHERE ");
            push_parent_scope(&mut builder, job_id, parent_hash);
            builder.push(" AND ");
            push_key_predicates(&mut builder, batch);

            builder
                .build()
                .execute(&mut *tx)
                .await
                .db_context("Failed to mark carrydown rows existing")?;
        }

        tx.commit()
            .await
            .db_context("Failed to commit carrydown write")?;

        self.maintenance
            .note(MaintenanceKind::Analyze, outcome.inserts.len() as u64);
        debug!(
            job_id,
            inserted = outcome.inserts.len(),
            reconfirmed = outcome.updates.len(),
            "Recorded carrydown data"
        );

        Ok(outcome.new_children)
    }

    async fn restore_records(&self, job_id: i64, parent_hashes: &[Option<String>]) -> Result<()> {
        let named: Vec<String> = parent_hashes.iter().flatten().cloned().collect();
        let mut scopes: Vec<Option<&[String]>> = named.chunks(MAX_CLAUSE).map(Some).collect();
        if parent_hashes.iter().any(Option::is_none) {
            scopes.push(None);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin carrydown restore")?;
        let mut removed = 0;

        for scope in scopes {
            let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM carrydown WHERE jobid = ");
            builder
                .push_bind(job_id)
                .push(" AND isnew = ")
                .push_bind(CarrydownMark::Base.code())
                .push(" AND ");
            push_parent_set(&mut builder, scope);
            removed += builder
                .build()
                .execute(&mut *tx)
                .await
                .db_context("Failed to delete stale carrydown rows")?
                .rows_affected();

            let mut builder = QueryBuilder::<Postgres>::new("UPDATE carrydown SET isnew = ");
            builder
                .push_bind(CarrydownMark::Base.code())
                .push(" WHERE jobid = ")
                .push_bind(job_id)
                .push(" AND isnew <> ")
                .push_bind(CarrydownMark::Base.code())
                .push(" AND ");
            push_parent_set(&mut builder, scope);
            builder
                .build()
                .execute(&mut *tx)
                .await
                .db_context("Failed to restore carrydown rows")?;
        }

        tx.commit()
            .await
            .db_context("Failed to commit carrydown restore")?;

        debug!(job_id, parents = parent_hashes.len(), removed, "Restored carrydown records");
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin carrydown reset")?;

        let removed = sqlx::query("DELETE FROM carrydown WHERE isnew = $1")
            .bind(CarrydownMark::New.code())
            .execute(&mut *tx)
            .await
            .db_context("Failed to delete unconfirmed carrydown rows")?
            .rows_affected();

        let demoted = sqlx::query("UPDATE carrydown SET isnew = $1 WHERE isnew = $2")
            .bind(CarrydownMark::Base.code())
            .bind(CarrydownMark::Existing.code())
            .execute(&mut *tx)
            .await
            .db_context("Failed to demote carrydown rows")?
            .rows_affected();

        tx.commit()
            .await
            .db_context("Failed to commit carrydown reset")?;

        if removed > 0 || demoted > 0 {
            info!(removed, demoted, "Reset carrydown marks after restart");
        }
        Ok(())
    }

    async fn delete_records(&self, job_id: i64, document_hashes: &[String]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin carrydown delete")?;

        for column in ["childidhash", "parentidhash"] {
            for batch in document_hashes.chunks(MAX_CLAUSE) {
                let mut builder =
                    QueryBuilder::<Postgres>::new("DELETE FROM carrydown WHERE jobid = ");
                builder.push_bind(job_id).push(" AND ");
                push_in_list(&mut builder, column, batch);
                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .db_context("Failed to delete carrydown rows")?;
            }
        }

        tx.commit()
            .await
            .db_context("Failed to commit carrydown delete")?;
        Ok(())
    }

    async fn delete_owner(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM carrydown WHERE jobid = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .db_context("Failed to delete job carrydown rows")?;
        Ok(())
    }

    fn stream_data_values<'a>(
        &'a self,
        job_id: i64,
        child_hash: &'a str,
        name: &'a str,
    ) -> BoxStream<'a, Result<CarrydownDataValue>> {
        let mut dedup = AdjacentDedup::default();

        sqlx::query(
            r#"
            SELECT datavaluehash, datavalue
            FROM carrydown
            WHERE jobid = $1 AND childidhash = $2 AND dataname = $3
            ORDER BY datavaluehash ASC NULLS LAST
            "#,
        )
        .bind(job_id)
        .bind(child_hash)
        .bind(name)
        .fetch(&self.pool)
        .map(|row| {
            let row = row.db_context("Failed to read carrydown values")?;
            data_value_from_row(&row)
        })
        .try_filter(move |value| future::ready(dedup.admit(value.hash.as_deref())))
        .boxed()
    }

    async fn records_for_parent(
        &self,
        job_id: i64,
        parent_hash: Option<&str>,
    ) -> Result<Vec<CarrydownRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT parentidhash, childidhash, dataname, datavaluehash, datavalue, isnew FROM carrydown WHERE ",
        );
        push_parent_scope(&mut builder, job_id, parent_hash);
        builder.push(" ORDER BY childidhash, dataname, datavaluehash NULLS FIRST");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .db_context("Failed to load carrydown rows")?;

        rows.iter()
            .map(|row| record_from_row(job_id, row))
            .collect()
    }

    async fn conditionally_maintain(&self) -> Result<()> {
        self.maintenance.run_due(&self.pool).await?;
        Ok(())
    }
}

fn data_value_from_row(row: &PgRow) -> Result<CarrydownDataValue> {
    let value: Option<String> = row
        .try_get("datavalue")
        .db_context("Failed to decode carrydown value")?;
    Ok(CarrydownDataValue {
        hash: row
            .try_get("datavaluehash")
            .db_context("Failed to decode carrydown value")?,
        value: value.unwrap_or_default(),
    })
}

fn record_from_row(job_id: i64, row: &PgRow) -> Result<CarrydownRecord> {
    let mark: String = row.try_get("isnew").db_context("Failed to decode carrydown row")?;
    Ok(CarrydownRecord {
        job_id,
        parent_hash: row
            .try_get("parentidhash")
            .db_context("Failed to decode carrydown row")?,
        key: CarrydownKey {
            child_hash: row
                .try_get("childidhash")
                .db_context("Failed to decode carrydown row")?,
            name: row.try_get("dataname").db_context("Failed to decode carrydown row")?,
            value_hash: row
                .try_get("datavaluehash")
                .db_context("Failed to decode carrydown row")?,
        },
        value: row.try_get("datavalue").db_context("Failed to decode carrydown row")?,
        mark: CarrydownMark::from_code(mark.trim())?,
    })
}
