use std::io::Write;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use tempfile::NamedTempFile;

use super::model::{CarrydownDataValue, CarrydownRecord, ChildCarrydown};
use crate::error::{DbContext, Result};

/// A distinct carrydown value spooled to disk.
#[derive(Debug)]
pub struct CarrydownFile {
    pub hash: Option<String>,
    pub file: NamedTempFile,
}

#[async_trait]
pub trait CarrydownStore: Send + Sync {
    /// Record what `parent_hash` declares for each child in this pass.
    ///
    /// Returns, per input child, whether any of its tuples was newly inserted.
    async fn record_carrydown_data_multiple(
        &self,
        job_id: i64,
        parent_hash: Option<&str>,
        children: &[ChildCarrydown],
    ) -> Result<Vec<bool>>;

    async fn record_carrydown_data(
        &self,
        job_id: i64,
        parent_hash: Option<&str>,
        child: &ChildCarrydown,
    ) -> Result<bool> {
        let flags = self
            .record_carrydown_data_multiple(job_id, parent_hash, std::slice::from_ref(child))
            .await?;
        Ok(flags.first().copied().unwrap_or(false))
    }

    /// End of pass for these parents: drop rows still BASE, demote the rest to BASE.
    ///
    /// `None` names the seed rows, which were recorded without a parent.
    async fn restore_records(&self, job_id: i64, parent_hashes: &[Option<String>]) -> Result<()>;

    /// Crash recovery: drop unconfirmed NEW rows, demote EXISTING to BASE.
    async fn reset(&self) -> Result<()>;

    /// Remove rows naming these documents as parent or child.
    async fn delete_records(&self, job_id: i64, document_hashes: &[String]) -> Result<()>;

    async fn delete_owner(&self, job_id: i64) -> Result<()>;

    /// Distinct values for a (job, child, name), ordered by value hash.
    fn stream_data_values<'a>(
        &'a self,
        job_id: i64,
        child_hash: &'a str,
        name: &'a str,
    ) -> BoxStream<'a, Result<CarrydownDataValue>>;

    async fn get_data_values(
        &self,
        job_id: i64,
        child_hash: &str,
        name: &str,
    ) -> Result<Vec<CarrydownDataValue>> {
        self.stream_data_values(job_id, child_hash, name)
            .try_collect()
            .await
    }

    async fn get_data_values_as_files(
        &self,
        job_id: i64,
        child_hash: &str,
        name: &str,
    ) -> Result<Vec<CarrydownFile>> {
        let mut values = self.stream_data_values(job_id, child_hash, name);
        let mut files = Vec::new();
        while let Some(value) = values.try_next().await? {
            let mut file = NamedTempFile::new().db_context("Failed to create carrydown spool file")?;
            file.write_all(value.value.as_bytes())
                .db_context("Failed to spool carrydown value")?;
            file.flush().db_context("Failed to spool carrydown value")?;
            files.push(CarrydownFile {
                hash: value.hash,
                file,
            });
        }
        Ok(files)
    }

    /// Rows recorded by one parent, for diagnostics.
    async fn records_for_parent(
        &self,
        job_id: i64,
        parent_hash: Option<&str>,
    ) -> Result<Vec<CarrydownRecord>>;

    async fn conditionally_maintain(&self) -> Result<()>;
}
