//! In-memory hop dependency store for tests.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::model::DeleteDependency;
use super::store::HopDeleteDepsStore;
use crate::error::Result;
use crate::maintenance::{MaintenanceKind, TableMaintenance, ThrottleSettings};
use crate::sql::{OwnerQuery, MAX_CLAUSE};
use crate::test_dependencies::TestTables;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Row {
    owner_id: i64,
    job_id: i64,
    dependency: DeleteDependency,
}

pub struct TestHopDeleteDepsStore {
    rows: RwLock<BTreeSet<Row>>,
    tables: Arc<TestTables>,
    maintenance: TableMaintenance,
    maintenance_runs: RwLock<Vec<MaintenanceKind>>,
}

impl TestHopDeleteDepsStore {
    /// `tables` backs the owner queries given to `remove_marked_rows`.
    pub fn new(tables: Arc<TestTables>) -> Self {
        Self::with_throttles(
            tables,
            ThrottleSettings::new(1_000, 60_000),
            ThrottleSettings::new(1_000, 250_000),
        )
    }

    pub fn with_throttles(
        tables: Arc<TestTables>,
        analyze: ThrottleSettings,
        reindex: ThrottleSettings,
    ) -> Self {
        Self {
            rows: RwLock::new(BTreeSet::new()),
            tables,
            maintenance: TableMaintenance::new("hop_delete_deps", analyze).with_reindex(reindex),
            maintenance_runs: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn maintenance_runs(&self) -> Vec<MaintenanceKind> {
        self.maintenance_runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One delete statement; it counts as at least one maintenance event.
    fn delete_where(&self, predicate: impl Fn(&Row) -> bool) {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let before = rows.len();
        rows.retain(|row| !predicate(row));
        self.maintenance.note_all(((before - rows.len()) as u64).max(1));
    }
}

#[async_trait]
impl HopDeleteDepsStore for TestHopDeleteDepsStore {
    async fn write_dependency(
        &self,
        job_id: i64,
        owner_id: i64,
        dependency: &DeleteDependency,
    ) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let exists = rows
            .iter()
            .any(|row| row.owner_id == owner_id && &row.dependency == dependency);
        if !exists {
            rows.insert(Row {
                owner_id,
                job_id,
                dependency: dependency.clone(),
            });
        }
        self.maintenance.note_all(1);
        Ok(())
    }

    async fn get_delete_dependencies(&self, owner_id: i64) -> Result<Vec<DeleteDependency>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|row| row.owner_id == owner_id)
            .map(|row| row.dependency.clone())
            .collect())
    }

    async fn delete_dependency(&self, owner_id: i64, dependency: &DeleteDependency) -> Result<()> {
        self.delete_where(|row| row.owner_id == owner_id && &row.dependency == dependency);
        Ok(())
    }

    async fn delete_owner_rows(&self, owner_ids: &[i64]) -> Result<()> {
        for batch in owner_ids.chunks(MAX_CLAUSE) {
            self.delete_where(|row| batch.contains(&row.owner_id));
        }
        Ok(())
    }

    async fn remove_marked_rows(&self, owners: &OwnerQuery) -> Result<()> {
        let marked = self.tables.select_owners(owners);
        self.delete_where(|row| marked.contains(&row.owner_id));
        Ok(())
    }

    async fn delete_job(&self, job_id: i64) -> Result<()> {
        self.delete_where(|row| row.job_id == job_id);
        Ok(())
    }

    async fn conditionally_maintain(&self) -> Result<()> {
        for kind in self.maintenance.claim_due() {
            self.maintenance_runs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(kind);
            self.maintenance.complete(kind);
        }
        Ok(())
    }
}
