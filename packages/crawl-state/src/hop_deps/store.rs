use async_trait::async_trait;

use super::model::DeleteDependency;
use crate::error::Result;
use crate::sql::OwnerQuery;

#[async_trait]
pub trait HopDeleteDepsStore: Send + Sync {
    /// Record an edge for `owner_id`; writing the same edge twice is a no-op.
    async fn write_dependency(
        &self,
        job_id: i64,
        owner_id: i64,
        dependency: &DeleteDependency,
    ) -> Result<()>;

    async fn get_delete_dependencies(&self, owner_id: i64) -> Result<Vec<DeleteDependency>>;

    async fn delete_dependency(&self, owner_id: i64, dependency: &DeleteDependency) -> Result<()>;

    /// Drop every edge of these owners.
    async fn delete_owner_rows(&self, owner_ids: &[i64]) -> Result<()>;

    /// Drop every edge whose owner is selected by `owners`.
    async fn remove_marked_rows(&self, owners: &OwnerQuery) -> Result<()>;

    async fn delete_job(&self, job_id: i64) -> Result<()>;

    async fn conditionally_maintain(&self) -> Result<()>;
}
