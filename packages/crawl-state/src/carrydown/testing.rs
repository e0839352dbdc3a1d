//! In-memory carrydown store for tests.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use super::model::{
    AdjacentDedup, CarrydownDataValue, CarrydownMark, CarrydownPlan, CarrydownRecord,
    ChildCarrydown,
};
use super::store::CarrydownStore;
use crate::error::Result;
use crate::maintenance::{MaintenanceKind, TableMaintenance, ThrottleSettings};

pub struct TestCarrydownStore {
    rows: RwLock<Vec<CarrydownRecord>>,
    maintenance: TableMaintenance,
    maintenance_runs: RwLock<Vec<MaintenanceKind>>,
}

impl Default for TestCarrydownStore {
    fn default() -> Self {
        Self::new(ThrottleSettings::new(1_000, 30_000))
    }
}

impl TestCarrydownStore {
    pub fn new(analyze: ThrottleSettings) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            maintenance: TableMaintenance::new("carrydown", analyze),
            maintenance_runs: RwLock::new(Vec::new()),
        }
    }

    /// Every stored row, in insertion order.
    pub fn rows(&self) -> Vec<CarrydownRecord> {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn maintenance_runs(&self) -> Vec<MaintenanceKind> {
        self.maintenance_runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CarrydownStore for TestCarrydownStore {
    async fn record_carrydown_data_multiple(
        &self,
        job_id: i64,
        parent_hash: Option<&str>,
        children: &[ChildCarrydown],
    ) -> Result<Vec<bool>> {
        let plan = CarrydownPlan::new(children);
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let in_scope = |row: &CarrydownRecord| {
            row.job_id == job_id && row.parent_hash.as_deref() == parent_hash
        };

        let existing: HashSet<_> = rows
            .iter()
            .filter(|row| in_scope(row))
            .map(|row| row.key.clone())
            .collect();
        let outcome = plan.classify(&existing);

        for row in rows.iter_mut() {
            if in_scope(row) && outcome.updates.contains(&row.key) {
                row.mark = CarrydownMark::Existing;
            }
        }
        for planned in &outcome.inserts {
            rows.push(CarrydownRecord {
                job_id,
                parent_hash: parent_hash.map(str::to_string),
                key: planned.key.clone(),
                value: planned.value.clone(),
                mark: CarrydownMark::New,
            });
        }

        self.maintenance
            .note(MaintenanceKind::Analyze, outcome.inserts.len() as u64);
        Ok(outcome.new_children)
    }

    async fn restore_records(&self, job_id: i64, parent_hashes: &[Option<String>]) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let restoring =
            |row: &CarrydownRecord| row.job_id == job_id && parent_hashes.contains(&row.parent_hash);

        rows.retain(|row| !(restoring(row) && row.mark == CarrydownMark::Base));
        for row in rows.iter_mut().filter(|row| restoring(row)) {
            row.mark = CarrydownMark::Base;
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.retain(|row| row.mark != CarrydownMark::New);
        for row in rows.iter_mut() {
            row.mark = CarrydownMark::Base;
        }
        Ok(())
    }

    async fn delete_records(&self, job_id: i64, document_hashes: &[String]) -> Result<()> {
        self.rows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|row| {
                let named = document_hashes.contains(&row.key.child_hash)
                    || row
                        .parent_hash
                        .as_ref()
                        .is_some_and(|parent| document_hashes.contains(parent));
                !(row.job_id == job_id && named)
            });
        Ok(())
    }

    async fn delete_owner(&self, job_id: i64) -> Result<()> {
        self.rows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|row| row.job_id != job_id);
        Ok(())
    }

    fn stream_data_values<'a>(
        &'a self,
        job_id: i64,
        child_hash: &'a str,
        name: &'a str,
    ) -> BoxStream<'a, Result<CarrydownDataValue>> {
        let mut values: Vec<CarrydownDataValue> = self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|row| {
                row.job_id == job_id && row.key.child_hash == child_hash && row.key.name == name
            })
            .map(|row| CarrydownDataValue {
                hash: row.key.value_hash.clone(),
                value: row.value.clone().unwrap_or_default(),
            })
            .collect();

        // NULLS LAST, as the SQL query orders them.
        values.sort_by(|a, b| match (&a.hash, &b.hash) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let mut dedup = AdjacentDedup::default();
        values.retain(|value| dedup.admit(value.hash.as_deref()));
        stream::iter(values.into_iter().map(Ok)).boxed()
    }

    async fn records_for_parent(
        &self,
        job_id: i64,
        parent_hash: Option<&str>,
    ) -> Result<Vec<CarrydownRecord>> {
        let mut records: Vec<_> = self
            .rows()
            .into_iter()
            .filter(|row| row.job_id == job_id && row.parent_hash.as_deref() == parent_hash)
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
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
    use crate::carrydown::CarrydownValue;
    use std::io::Read;

    const JOB: i64 = 1;
    const PARENT: &str = "parent-p";

    fn declaration(child: &str, value: &str) -> ChildCarrydown {
        ChildCarrydown::new(child).with("n", CarrydownValue::new(value))
    }

    fn marks(store: &TestCarrydownStore) -> Vec<(String, CarrydownMark)> {
        let mut marks: Vec<_> = store
            .rows()
            .into_iter()
            .map(|row| (row.key.child_hash, row.mark))
            .collect();
        marks.sort_by(|a, b| a.0.cmp(&b.0));
        marks
    }

    #[tokio::test]
    async fn tri_state_pass_detects_stale_children() {
        let store = TestCarrydownStore::default();
        let both = vec![declaration("c1", "v1"), declaration("c2", "v2")];

        let flags = store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &both)
            .await
            .unwrap();
        assert_eq!(flags, vec![true, true]);
        assert_eq!(
            marks(&store),
            vec![
                ("c1".to_string(), CarrydownMark::New),
                ("c2".to_string(), CarrydownMark::New)
            ]
        );

        let flags = store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &both)
            .await
            .unwrap();
        assert_eq!(flags, vec![false, false]);
        assert!(marks(&store)
            .iter()
            .all(|(_, mark)| *mark == CarrydownMark::Existing));

        store
            .restore_records(JOB, &[Some(PARENT.to_string())])
            .await
            .unwrap();
        assert!(marks(&store)
            .iter()
            .all(|(_, mark)| *mark == CarrydownMark::Base));

        // Next pass re-declares only c1.
        let flags = store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &[declaration("c1", "v1")])
            .await
            .unwrap();
        assert_eq!(flags, vec![false]);
        assert_eq!(
            marks(&store),
            vec![
                ("c1".to_string(), CarrydownMark::Existing),
                ("c2".to_string(), CarrydownMark::Base)
            ]
        );

        store
            .restore_records(JOB, &[Some(PARENT.to_string())])
            .await
            .unwrap();
        assert_eq!(marks(&store), vec![("c1".to_string(), CarrydownMark::Base)]);
    }

    #[tokio::test]
    async fn reset_recovers_interrupted_pass_idempotently() {
        let store = TestCarrydownStore::default();
        store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &[declaration("c1", "v1")])
            .await
            .unwrap();
        store
            .restore_records(JOB, &[Some(PARENT.to_string())])
            .await
            .unwrap();

        // Interrupted pass: c1 re-declared, c2 new, no restore.
        store
            .record_carrydown_data_multiple(
                JOB,
                Some(PARENT),
                &[declaration("c1", "v1"), declaration("c2", "v2")],
            )
            .await
            .unwrap();

        store.reset().await.unwrap();
        let once = store.rows();
        assert_eq!(marks(&store), vec![("c1".to_string(), CarrydownMark::Base)]);

        store.reset().await.unwrap();
        assert_eq!(store.rows(), once);
    }

    #[tokio::test]
    async fn restore_is_scoped_to_named_parents() {
        let store = TestCarrydownStore::default();
        store
            .record_carrydown_data_multiple(JOB, Some("p1"), &[declaration("c1", "v")])
            .await
            .unwrap();
        store
            .record_carrydown_data_multiple(JOB, Some("p2"), &[declaration("c2", "v")])
            .await
            .unwrap();

        store.restore_records(JOB, &[Some("p1".to_string())]).await.unwrap();
        let p2 = store.records_for_parent(JOB, Some("p2")).await.unwrap();
        assert_eq!(p2[0].mark, CarrydownMark::New);
        let p1 = store.records_for_parent(JOB, Some("p1")).await.unwrap();
        assert_eq!(p1[0].mark, CarrydownMark::Base);
    }

    #[tokio::test]
    async fn seed_rows_survive_restore_and_reset() {
        let store = TestCarrydownStore::default();
        store
            .record_carrydown_data_multiple(JOB, None, &[declaration("c1", "v1")])
            .await
            .unwrap();
        store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &[declaration("c2", "v2")])
            .await
            .unwrap();

        store.restore_records(JOB, &[None]).await.unwrap();
        store.reset().await.unwrap();

        let seeds = store.records_for_parent(JOB, None).await.unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].key.child_hash, "c1");
        assert_eq!(seeds[0].mark, CarrydownMark::Base);
        assert!(store
            .records_for_parent(JOB, Some(PARENT))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn data_values_are_distinct_across_parents() {
        let store = TestCarrydownStore::default();
        for parent in ["p1", "p2", "p3"] {
            store
                .record_carrydown_data_multiple(
                    JOB,
                    Some(parent),
                    &[ChildCarrydown::new("c")
                        .with("acl", CarrydownValue::new("group:eng"))
                        .with("acl", CarrydownValue::new("group:ops"))],
                )
                .await
                .unwrap();
        }
        store
            .record_carrydown_data(JOB, None, &ChildCarrydown::new("c").with("acl", CarrydownValue::none()))
            .await
            .unwrap();

        let values = store.get_data_values(JOB, "c", "acl").await.unwrap();
        let payloads: Vec<_> = values.iter().map(|v| v.value.as_str()).collect();
        assert_eq!(values.len(), 3);
        assert!(payloads.contains(&"group:eng"));
        assert!(payloads.contains(&"group:ops"));
        assert_eq!(values.last().unwrap().hash, None);
        assert_eq!(values.last().unwrap().value, "");
    }

    #[tokio::test]
    async fn data_values_spool_to_files() {
        let store = TestCarrydownStore::default();
        store
            .record_carrydown_data(
                JOB,
                Some(PARENT),
                &ChildCarrydown::new("c").with("title", CarrydownValue::new("Quarterly report")),
            )
            .await
            .unwrap();

        let files = store
            .get_data_values_as_files(JOB, "c", "title")
            .await
            .unwrap();
        assert_eq!(files.len(), 1);

        let mut contents = String::new();
        files[0]
            .file
            .reopen()
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "Quarterly report");
    }

    #[tokio::test]
    async fn delete_records_matches_parent_or_child() {
        let store = TestCarrydownStore::default();
        store
            .record_carrydown_data_multiple(JOB, Some("a"), &[declaration("b", "v")])
            .await
            .unwrap();
        store
            .record_carrydown_data_multiple(JOB, Some("b"), &[declaration("c", "v")])
            .await
            .unwrap();
        store
            .record_carrydown_data_multiple(JOB, Some("x"), &[declaration("y", "v")])
            .await
            .unwrap();
        store
            .record_carrydown_data_multiple(2, Some("b"), &[declaration("c", "v")])
            .await
            .unwrap();

        store.delete_records(JOB, &["b".to_string()]).await.unwrap();
        let remaining: Vec<_> = store
            .rows()
            .into_iter()
            .map(|row| (row.job_id, row.key.child_hash))
            .collect();
        assert_eq!(remaining, vec![(JOB, "y".to_string()), (2, "c".to_string())]);

        store.delete_owner(JOB).await.unwrap();
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn inserts_drive_analyze_throttle() {
        let store = TestCarrydownStore::new(ThrottleSettings::new(2, 10));
        store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &[declaration("c1", "v")])
            .await
            .unwrap();
        store.conditionally_maintain().await.unwrap();
        assert!(store.maintenance_runs().is_empty());

        // Re-declarations are not inserts.
        store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &[declaration("c1", "v")])
            .await
            .unwrap();
        store.conditionally_maintain().await.unwrap();
        assert!(store.maintenance_runs().is_empty());

        store
            .record_carrydown_data_multiple(JOB, Some(PARENT), &[declaration("c2", "v")])
            .await
            .unwrap();
        store.conditionally_maintain().await.unwrap();
        store.conditionally_maintain().await.unwrap();
        assert_eq!(store.maintenance_runs(), vec![MaintenanceKind::Analyze]);
    }
}
