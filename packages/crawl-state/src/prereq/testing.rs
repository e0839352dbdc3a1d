//! In-memory prerequisite event store for tests.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::store::{distinct_events, PrereqEventStore};
use crate::error::Result;
use crate::maintenance::{MaintenanceKind, TableMaintenance, ThrottleSettings};
use crate::sql::{OwnerQuery, MAX_CLAUSE};
use crate::test_dependencies::TestTables;

pub struct TestPrereqEventStore {
    rows: RwLock<BTreeSet<(i64, String)>>,
    tables: Arc<TestTables>,
    maintenance: TableMaintenance,
    maintenance_runs: RwLock<Vec<MaintenanceKind>>,
}

impl TestPrereqEventStore {
    /// `tables` backs the owner queries given to `delete_rows_matching`.
    pub fn new(tables: Arc<TestTables>) -> Self {
        Self::with_throttles(
            tables,
            ThrottleSettings::new(25_000, 50_000),
            ThrottleSettings::new(125_000, 250_000),
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
            maintenance: TableMaintenance::new("prereq_events", analyze).with_reindex(reindex),
            maintenance_runs: RwLock::new(Vec::new()),
        }
    }

    pub fn maintenance_runs(&self) -> Vec<MaintenanceKind> {
        self.maintenance_runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One delete statement; it counts as at least one maintenance event.
    fn delete_where(&self, predicate: impl Fn(i64) -> bool) {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let before = rows.len();
        rows.retain(|(owner, _)| !predicate(*owner));
        self.maintenance
            .note(MaintenanceKind::Reindex, ((before - rows.len()) as u64).max(1));
    }
}

#[async_trait]
impl PrereqEventStore for TestPrereqEventStore {
    async fn add_rows(&self, owner_id: i64, event_names: &[String]) -> Result<()> {
        let events = distinct_events(event_names);
        if events.is_empty() {
            return Ok(());
        }

        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let mut inserted = 0;
        for batch in events.chunks(MAX_CLAUSE) {
            let added = batch
                .iter()
                .filter(|event| rows.insert((owner_id, event.to_string())))
                .count();
            inserted += (added as u64).max(1);
        }
        self.maintenance.note(MaintenanceKind::Analyze, inserted);
        Ok(())
    }

    async fn delete_rows(&self, owner_id: i64) -> Result<()> {
        self.delete_where(|owner| owner == owner_id);
        Ok(())
    }

    async fn delete_rows_for_owners(&self, owner_ids: &[i64]) -> Result<()> {
        for batch in owner_ids.chunks(MAX_CLAUSE) {
            self.delete_where(|owner| batch.contains(&owner));
        }
        Ok(())
    }

    async fn delete_rows_matching(&self, owners: &OwnerQuery) -> Result<()> {
        let marked = self.tables.select_owners(owners);
        self.delete_where(|owner| marked.contains(&owner));
        Ok(())
    }

    async fn owners_with_outstanding_events(&self, owner_ids: &[i64]) -> Result<HashSet<i64>> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .map(|(owner, _)| *owner)
            .filter(|owner| owner_ids.contains(owner))
            .collect())
    }

    async fn events_for_owner(&self, owner_id: i64) -> Result<Vec<String>> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .filter(|(owner, _)| *owner == owner_id)
            .map(|(_, event)| event.clone())
            .collect())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn events(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn owner_is_blocked_until_all_events_cleared() {
        let store = TestPrereqEventStore::new(Arc::new(TestTables::new()));
        store
            .add_rows(7, &events(&["fetch-parent", "fetch-parent", "login"]))
            .await
            .unwrap();
        store.add_rows(7, &events(&["login"])).await.unwrap();

        assert!(store.is_blocked(7).await.unwrap());
        assert!(!store.is_blocked(8).await.unwrap());
        assert_eq!(
            store.events_for_owner(7).await.unwrap(),
            events(&["fetch-parent", "login"])
        );

        store.delete_rows(7).await.unwrap();
        assert!(!store.is_blocked(7).await.unwrap());
    }

    #[tokio::test]
    async fn batched_check_returns_blocked_subset() {
        let store = TestPrereqEventStore::new(Arc::new(TestTables::new()));
        store.add_rows(1, &events(&["a"])).await.unwrap();
        store.add_rows(3, &events(&["b"])).await.unwrap();
        store.add_rows(99, &events(&["c"])).await.unwrap();

        let blocked = store
            .owners_with_outstanding_events(&[1, 2, 3, 4])
            .await
            .unwrap();
        assert_eq!(blocked, HashSet::from([1, 3]));

        store.delete_rows_for_owners(&[1, 3]).await.unwrap();
        assert!(store
            .owners_with_outstanding_events(&[1, 2, 3, 4])
            .await
            .unwrap()
            .is_empty());
        assert!(store.is_blocked(99).await.unwrap());
    }

    #[tokio::test]
    async fn delete_by_job_uses_queue_owner_query() {
        let tables = Arc::new(TestTables::new());
        tables.insert("jobqueue", [("id", 1i64), ("jobid", 50)]);
        tables.insert("jobqueue", [("id", 2i64), ("jobid", 51)]);
        let store = TestPrereqEventStore::new(tables);
        store.add_rows(1, &events(&["a"])).await.unwrap();
        store.add_rows(2, &events(&["a"])).await.unwrap();

        let owners = OwnerQuery::new("jobqueue", "id")
            .unwrap()
            .filter_eq("jobid", 50)
            .unwrap();
        store.delete_rows_matching(&owners).await.unwrap();

        assert!(!store.is_blocked(1).await.unwrap());
        assert!(store.is_blocked(2).await.unwrap());
    }

    #[tokio::test]
    async fn inserts_feed_analyze_and_deletes_feed_reindex() {
        let store = TestPrereqEventStore::with_throttles(
            Arc::new(TestTables::new()),
            ThrottleSettings::new(2, 100),
            ThrottleSettings::new(3, 100),
        );
        store.add_rows(1, &events(&["a", "b", "c"])).await.unwrap();
        store.conditionally_maintain().await.unwrap();
        assert_eq!(store.maintenance_runs(), vec![MaintenanceKind::Analyze]);

        store.delete_rows(1).await.unwrap();
        store.conditionally_maintain().await.unwrap();
        assert_eq!(
            store.maintenance_runs(),
            vec![MaintenanceKind::Analyze, MaintenanceKind::Reindex]
        );
    }

    #[tokio::test]
    async fn statements_that_change_nothing_still_count() {
        let store = TestPrereqEventStore::with_throttles(
            Arc::new(TestTables::new()),
            ThrottleSettings::new(2, 100),
            ThrottleSettings::new(1, 100),
        );
        store.add_rows(1, &events(&["a"])).await.unwrap();
        store.add_rows(1, &events(&["a"])).await.unwrap();
        store.conditionally_maintain().await.unwrap();
        assert_eq!(store.maintenance_runs(), vec![MaintenanceKind::Analyze]);

        store.delete_rows(99).await.unwrap();
        store.conditionally_maintain().await.unwrap();
        assert_eq!(
            store.maintenance_runs(),
            vec![MaintenanceKind::Analyze, MaintenanceKind::Reindex]
        );
    }
}
