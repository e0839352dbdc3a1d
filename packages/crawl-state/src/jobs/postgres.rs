use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::model::{
    EnumeratedValues, HopcountMode, Job, JobState, JobType, ScheduleRecord, StartMethod,
};
use super::status::JobStatus;
use super::store::{JobStore, SaveOutcome, StateChange, StateUpdateFn};
use crate::error::{CrawlStateError, DbContext, Result};

const JOB_COLUMNS: &str = "id, description, status, lasttime, starttime, lastchecktime, \
     endtime, docspec, outputspec, connectionname, outputname, type, intervaltime, \
     expirationtime, windowend, priority, startmethod, errortext, reseedinterval, \
     reseedtime, hopcountmode";

const STATE_COLUMNS: &str = "status, errortext, lasttime, starttime, lastchecktime, \
     endtime, windowend, reseedtime";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_children(&self, job: &mut Job) -> Result<()> {
        let rows = sqlx::query(
            r#"
            SELECT dayofweek, dayofmonth, monthofyear, yearlist, hourofday, minutesofhour,
                   timezone, windowlength, requestminimum
            FROM job_schedules
            WHERE ownerid = $1
            ORDER BY ordinal
            "#,
        )
        .bind(job.id)
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to load job schedule")?;

        job.schedule = rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<Vec<_>>>()?;

        let rows = sqlx::query("SELECT linktype, maxhops FROM job_hop_filters WHERE ownerid = $1")
            .bind(job.id)
            .fetch_all(&self.pool)
            .await
            .db_context("Failed to load job hop filters")?;

        job.hop_filters = rows
            .iter()
            .map(|row| -> Result<(String, i64)> {
                Ok((
                    row.try_get("linktype").db_context("Failed to decode hop filter")?,
                    row.try_get("maxhops").db_context("Failed to decode hop filter")?,
                ))
            })
            .collect::<Result<_>>()?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn save(&self, job: &Job) -> Result<SaveOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin job save")?;

        let existing = sqlx::query("SELECT docspec, outputspec FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job.id)
            .fetch_optional(&mut *tx)
            .await
            .db_context("Failed to lock job for save")?;

        let outcome = match existing {
            Some(row) => {
                let docspec: String = row.try_get("docspec").db_context("Failed to decode job")?;
                let outputspec: String =
                    row.try_get("outputspec").db_context("Failed to decode job")?;
                let specs_changed = docspec != job.document_spec || outputspec != job.output_spec;

                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET description = $2,
                        docspec = $3,
                        outputspec = $4,
                        connectionname = $5,
                        outputname = $6,
                        type = $7,
                        intervaltime = $8,
                        expirationtime = $9,
                        priority = $10,
                        startmethod = $11,
                        reseedinterval = $12,
                        hopcountmode = $13,
                        lastchecktime = CASE WHEN $14 THEN NULL ELSE lastchecktime END
                    WHERE id = $1
                    "#,
                )
                .bind(job.id)
                .bind(&job.description)
                .bind(&job.document_spec)
                .bind(&job.output_spec)
                .bind(&job.connection_name)
                .bind(&job.output_name)
                .bind(job.job_type.code())
                .bind(job.interval)
                .bind(job.expiration)
                .bind(job.priority)
                .bind(job.start_method.code())
                .bind(job.reseed_interval)
                .bind(job.hopcount_mode.code())
                .bind(specs_changed)
                .execute(&mut *tx)
                .await
                .db_context("Failed to update job")?;

                SaveOutcome::Updated { specs_changed }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO jobs (
                        id, description, status, lasttime, docspec, outputspec,
                        connectionname, outputname, type, intervaltime, expirationtime,
                        priority, startmethod, reseedinterval, hopcountmode
                    ) VALUES ($1, $2, $3, NOW(), $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "#,
                )
                .bind(job.id)
                .bind(&job.description)
                .bind(JobStatus::Inactive.code())
                .bind(&job.document_spec)
                .bind(&job.output_spec)
                .bind(&job.connection_name)
                .bind(&job.output_name)
                .bind(job.job_type.code())
                .bind(job.interval)
                .bind(job.expiration)
                .bind(job.priority)
                .bind(job.start_method.code())
                .bind(job.reseed_interval)
                .bind(job.hopcount_mode.code())
                .execute(&mut *tx)
                .await
                .db_context("Failed to insert job")?;

                SaveOutcome::Inserted
            }
        };

        sqlx::query("DELETE FROM job_schedules WHERE ownerid = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await
            .db_context("Failed to clear job schedule")?;

        sqlx::query("DELETE FROM job_hop_filters WHERE ownerid = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await
            .db_context("Failed to clear job hop filters")?;

        for (ordinal, record) in job.schedule.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO job_schedules (
                    ownerid, ordinal, dayofweek, dayofmonth, monthofyear, yearlist,
                    hourofday, minutesofhour, timezone, windowlength, requestminimum
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(job.id)
            .bind(ordinal as i32)
            .bind(record.day_of_week.to_column())
            .bind(record.day_of_month.to_column())
            .bind(record.month_of_year.to_column())
            .bind(record.year.to_column())
            .bind(record.hour_of_day.to_column())
            .bind(record.minutes_of_hour.to_column())
            .bind(&record.timezone)
            .bind(record.window_length)
            .bind(record.request_minimum)
            .execute(&mut *tx)
            .await
            .db_context("Failed to write job schedule")?;
        }

        for (link_type, max_hops) in &job.hop_filters {
            sqlx::query("INSERT INTO job_hop_filters (ownerid, linktype, maxhops) VALUES ($1, $2, $3)")
                .bind(job.id)
                .bind(link_type)
                .bind(max_hops)
                .execute(&mut *tx)
                .await
                .db_context("Failed to write job hop filter")?;
        }

        tx.commit().await.db_context("Failed to commit job save")?;
        Ok(outcome)
    }

    async fn load(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .db_context("Failed to load job")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;
        self.load_children(&mut job).await?;
        Ok(Some(job))
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE status <> $1 ORDER BY description",
            JOB_COLUMNS
        ))
        .bind(JobStatus::ReadyForDelete.code())
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to load jobs")?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            self.load_children(&mut job).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn delete(&self, job_id: i64) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin job delete")?;

        sqlx::query("DELETE FROM job_schedules WHERE ownerid = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .db_context("Failed to delete job schedule")?;

        sqlx::query("DELETE FROM job_hop_filters WHERE ownerid = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .db_context("Failed to delete job hop filters")?;

        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .db_context("Failed to delete job")?;

        tx.commit().await.db_context("Failed to commit job delete")?;
        Ok(result.rows_affected() > 0)
    }

    async fn modify_state(&self, job_id: i64, update: &StateUpdateFn<'_>) -> Result<StateChange> {
        let mut tx = self
            .pool
            .begin()
            .await
            .db_context("Failed to begin job status change")?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE id = $1 FOR UPDATE",
            STATE_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .db_context("Failed to lock job")?
        .ok_or(CrawlStateError::JobNotFound(job_id))?;

        let before = state_from_row(&row)?;
        let change = update(&before)?;
        if change.is_empty() {
            // Dropping the transaction releases the row lock.
            return Ok(StateChange {
                job_id,
                after: before.clone(),
                before,
            });
        }

        let mut after = before.clone();
        change.apply_to(&mut after);

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                errortext = $3,
                lasttime = $4,
                starttime = $5,
                lastchecktime = $6,
                endtime = $7,
                windowend = $8,
                reseedtime = $9
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(after.status.code())
        .bind(&after.error_text)
        .bind(after.last_time)
        .bind(after.start_time)
        .bind(after.last_check_time)
        .bind(after.end_time)
        .bind(after.window_end)
        .bind(after.reseed_time)
        .execute(&mut *tx)
        .await
        .db_context("Failed to write job status")?;

        tx.commit()
            .await
            .db_context("Failed to commit job status change")?;

        Ok(StateChange {
            job_id,
            before,
            after,
        })
    }

    async fn ids_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<i64>> {
        let codes: Vec<String> = statuses.iter().map(|s| s.code().to_string()).collect();
        sqlx::query_scalar::<_, i64>("SELECT id FROM jobs WHERE status::text = ANY($1) ORDER BY id")
            .bind(codes)
            .fetch_all(&self.pool)
            .await
            .db_context("Failed to find jobs by status")
    }

    async fn ids_for_connection(&self, connection_name: &str) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM jobs WHERE connectionname = $1 ORDER BY id")
            .bind(connection_name)
            .fetch_all(&self.pool)
            .await
            .db_context("Failed to find jobs for connection")
    }

    async fn ids_for_output(&self, output_name: &str) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM jobs WHERE outputname = $1 ORDER BY id")
            .bind(output_name)
            .fetch_all(&self.pool)
            .await
            .db_context("Failed to find jobs for output connection")
    }
}

// ============================================================================
// Row decoding
// ============================================================================

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).db_context("Failed to decode job row")
}

fn state_from_row(row: &PgRow) -> Result<JobState> {
    let status: String = column(row, "status")?;
    Ok(JobState {
        status: JobStatus::from_code(status.trim())?,
        error_text: column(row, "errortext")?,
        last_time: column(row, "lasttime")?,
        start_time: column(row, "starttime")?,
        last_check_time: column(row, "lastchecktime")?,
        end_time: column(row, "endtime")?,
        window_end: column(row, "windowend")?,
        reseed_time: column(row, "reseedtime")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let job_type: String = column(row, "type")?;
    let start_method: String = column(row, "startmethod")?;
    let hopcount_mode: Option<String> = column(row, "hopcountmode")?;

    Ok(Job {
        id: column(row, "id")?,
        description: column(row, "description")?,
        connection_name: column(row, "connectionname")?,
        output_name: column(row, "outputname")?,
        document_spec: column(row, "docspec")?,
        output_spec: column(row, "outputspec")?,
        job_type: JobType::from_code(job_type.trim())?,
        start_method: StartMethod::from_code(start_method.trim())?,
        priority: column(row, "priority")?,
        interval: column(row, "intervaltime")?,
        expiration: column(row, "expirationtime")?,
        reseed_interval: column(row, "reseedinterval")?,
        hopcount_mode: HopcountMode::from_code(hopcount_mode.as_deref())?,
        schedule: Vec::new(),
        hop_filters: Default::default(),
        state: state_from_row(row)?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<ScheduleRecord> {
    let values = |name: &str| -> Result<EnumeratedValues> {
        let raw: Option<String> = column(row, name)?;
        EnumeratedValues::from_column(raw.as_deref())
    };

    Ok(ScheduleRecord {
        day_of_week: values("dayofweek")?,
        day_of_month: values("dayofmonth")?,
        month_of_year: values("monthofyear")?,
        year: values("yearlist")?,
        hour_of_day: values("hourofday")?,
        minutes_of_hour: values("minutesofhour")?,
        timezone: column(row, "timezone")?,
        window_length: column(row, "windowlength")?,
        request_minimum: column(row, "requestminimum")?,
    })
}
