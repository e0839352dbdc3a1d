//! Carrydown tri-state bookkeeping against Postgres.
//!
//! `reset()` is process-wide, so crash recovery is covered by the in-memory
//! unit tests; everything here is scoped to a job id of its own.

mod common;

use std::io::Read;

use common::TestHarness;
use crawl_state::carrydown::{
    CarrydownMark, CarrydownStore, CarrydownValue, ChildCarrydown, PostgresCarrydownStore,
};
use crawl_state::maintenance::MaintenanceKind;
use test_context::test_context;

fn store(ctx: &TestHarness) -> PostgresCarrydownStore {
    PostgresCarrydownStore::new(ctx.db_pool.clone(), TestHarness::quiet_throttle())
}

fn declaration(child: &str, value: &str) -> ChildCarrydown {
    ChildCarrydown::new(child).with("n", CarrydownValue::new(value))
}

async fn marks(store: &PostgresCarrydownStore, job_id: i64, parent: &str) -> Vec<(String, CarrydownMark)> {
    store
        .records_for_parent(job_id, Some(parent))
        .await
        .unwrap()
        .into_iter()
        .map(|record| (record.key.child_hash, record.mark))
        .collect()
}

#[test_context(TestHarness)]
#[tokio::test]
async fn tri_state_pass_removes_undeclared_children(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    let both = vec![declaration("c1", "v1"), declaration("c2", "v2")];

    let flags = store
        .record_carrydown_data_multiple(job, Some("p"), &both)
        .await
        .unwrap();
    assert_eq!(flags, vec![true, true]);
    assert!(marks(&store, job, "p")
        .await
        .iter()
        .all(|(_, mark)| *mark == CarrydownMark::New));

    let flags = store
        .record_carrydown_data_multiple(job, Some("p"), &both)
        .await
        .unwrap();
    assert_eq!(flags, vec![false, false]);
    assert!(marks(&store, job, "p")
        .await
        .iter()
        .all(|(_, mark)| *mark == CarrydownMark::Existing));

    store.restore_records(job, &[Some("p".to_string())]).await.unwrap();
    assert!(marks(&store, job, "p")
        .await
        .iter()
        .all(|(_, mark)| *mark == CarrydownMark::Base));

    store
        .record_carrydown_data_multiple(job, Some("p"), &[declaration("c1", "v1")])
        .await
        .unwrap();
    store.restore_records(job, &[Some("p".to_string())]).await.unwrap();

    assert_eq!(
        marks(&store, job, "p").await,
        vec![("c1".to_string(), CarrydownMark::Base)]
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_and_null_valued_declarations_collapse(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    let child = ChildCarrydown::new("c")
        .with("acl", CarrydownValue::none())
        .with("acl", CarrydownValue::none())
        .with("acl", CarrydownValue::new("group:eng"));

    // Seed documents have no parent.
    assert!(store.record_carrydown_data(job, None, &child).await.unwrap());
    assert!(!store.record_carrydown_data(job, None, &child).await.unwrap());

    let records = store.records_for_parent(job, None).await.unwrap();
    assert_eq!(records.len(), 2);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn seed_rows_restore_through_null_parent(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    store
        .record_carrydown_data(job, None, &declaration("seed-child", "v"))
        .await
        .unwrap();
    store
        .record_carrydown_data(job, Some("p"), &declaration("c", "v"))
        .await
        .unwrap();

    store
        .restore_records(job, &[None, Some("p".to_string())])
        .await
        .unwrap();

    let seeds = store.records_for_parent(job, None).await.unwrap();
    assert_eq!(seeds.len(), 1);
    assert_eq!(seeds[0].key.child_hash, "seed-child");
    assert_eq!(seeds[0].mark, CarrydownMark::Base);
    assert_eq!(
        marks(&store, job, "p").await,
        vec![("c".to_string(), CarrydownMark::Base)]
    );

    // A second pass that re-declares nothing drops the seed's rows.
    store.restore_records(job, &[None]).await.unwrap();
    assert!(store.records_for_parent(job, None).await.unwrap().is_empty());
    assert_eq!(marks(&store, job, "p").await.len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_first_writers_leave_one_existing_row(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let first = store(ctx);
    let second = store(ctx);
    let job = ctx.unique_id().await;
    let child = declaration("c", "v");

    let (a, b) = tokio::join!(
        first.record_carrydown_data(job, Some("p"), &child),
        second.record_carrydown_data(job, Some("p"), &child),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a || b);

    assert_eq!(
        marks(&first, job, "p").await,
        vec![("c".to_string(), CarrydownMark::Existing)]
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn large_batches_span_clause_limit(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    let children: Vec<_> = (0..60)
        .map(|i| declaration(&format!("child-{i:02}"), "v"))
        .collect();

    let flags = store
        .record_carrydown_data_multiple(job, Some("hub"), &children)
        .await
        .unwrap();
    assert!(flags.iter().all(|new| *new));

    let mut extended = children.clone();
    extended.push(declaration("child-60", "v"));
    let flags = store
        .record_carrydown_data_multiple(job, Some("hub"), &extended)
        .await
        .unwrap();
    assert_eq!(flags.iter().filter(|new| **new).count(), 1);
    assert!(flags[60]);

    let parents = vec![Some("hub".to_string())];
    store.restore_records(job, &parents).await.unwrap();
    assert_eq!(store.records_for_parent(job, Some("hub")).await.unwrap().len(), 61);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn data_values_are_distinct_and_spoolable(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    for parent in ["p1", "p2"] {
        store
            .record_carrydown_data(
                job,
                Some(parent),
                &ChildCarrydown::new("c")
                    .with("title", CarrydownValue::new("Handbook"))
                    .with("title", CarrydownValue::new("Employee Handbook")),
            )
            .await
            .unwrap();
    }

    let values = store.get_data_values(job, "c", "title").await.unwrap();
    let mut payloads: Vec<_> = values.iter().map(|v| v.value.clone()).collect();
    payloads.sort();
    assert_eq!(payloads, vec!["Employee Handbook", "Handbook"]);

    let files = store.get_data_values_as_files(job, "c", "title").await.unwrap();
    assert_eq!(files.len(), 2);
    let mut contents = String::new();
    files[0]
        .file
        .reopen()
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert!(payloads.contains(&contents));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn deleting_documents_and_jobs(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    let other_job = ctx.unique_id().await;
    store
        .record_carrydown_data(job, Some("a"), &declaration("b", "v"))
        .await
        .unwrap();
    store
        .record_carrydown_data(job, Some("b"), &declaration("c", "v"))
        .await
        .unwrap();
    store
        .record_carrydown_data(job, Some("x"), &declaration("y", "v"))
        .await
        .unwrap();
    store
        .record_carrydown_data(other_job, Some("b"), &declaration("c", "v"))
        .await
        .unwrap();

    store.delete_records(job, &["b".to_string()]).await.unwrap();
    assert!(store.records_for_parent(job, Some("a")).await.unwrap().is_empty());
    assert!(store.records_for_parent(job, Some("b")).await.unwrap().is_empty());
    assert_eq!(store.records_for_parent(job, Some("x")).await.unwrap().len(), 1);
    assert_eq!(
        store.records_for_parent(other_job, Some("b")).await.unwrap().len(),
        1
    );

    store.delete_owner(job).await.unwrap();
    assert!(store.records_for_parent(job, Some("x")).await.unwrap().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn analyze_runs_once_throttle_fires(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = PostgresCarrydownStore::new(
        ctx.db_pool.clone(),
        crawl_state::maintenance::ThrottleSettings::new(2, 1_000),
    );
    let job = ctx.unique_id().await;
    store
        .record_carrydown_data_multiple(
            job,
            Some("p"),
            &[declaration("c1", "v"), declaration("c2", "v")],
        )
        .await
        .unwrap();

    store.conditionally_maintain().await.unwrap();
    assert_eq!(
        store.maintenance().remaining(MaintenanceKind::Analyze),
        Some(1_000)
    );
}
