//! Hop-count delete dependencies against Postgres.

mod common;

use common::TestHarness;
use crawl_state::hop_deps::{DeleteDependency, HopDeleteDepsStore, PostgresHopDeleteDepsStore};
use crawl_state::sql::OwnerQuery;
use test_context::test_context;

fn store(ctx: &TestHarness) -> PostgresHopDeleteDepsStore {
    PostgresHopDeleteDepsStore::new(
        ctx.db_pool.clone(),
        TestHarness::quiet_throttle(),
        TestHarness::quiet_throttle(),
    )
}

#[test_context(TestHarness)]
#[tokio::test]
async fn owner_batch_delete_spares_other_owners(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    let owner = ctx.unique_id().await;
    let neighbour = ctx.unique_id().await;

    for i in 0..30 {
        store
            .write_dependency(job, owner, &DeleteDependency::new(Some("link"), format!("p{i}"), Some("c")))
            .await
            .unwrap();
    }
    store
        .write_dependency(job, neighbour, &DeleteDependency::new(Some("link"), "p0", Some("c")))
        .await
        .unwrap();
    assert_eq!(store.get_delete_dependencies(owner).await.unwrap().len(), 30);

    store.delete_owner_rows(&[owner]).await.unwrap();

    assert!(store.get_delete_dependencies(owner).await.unwrap().is_empty());
    assert_eq!(store.get_delete_dependencies(neighbour).await.unwrap().len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn null_parts_are_part_of_edge_identity(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    let owner = ctx.unique_id().await;
    let bare = DeleteDependency::new(None, "p", None);
    let typed = DeleteDependency::new(Some("redirect"), "p", None);

    store.write_dependency(job, owner, &bare).await.unwrap();
    store.write_dependency(job, owner, &bare).await.unwrap();
    store.write_dependency(job, owner, &typed).await.unwrap();
    assert_eq!(store.get_delete_dependencies(owner).await.unwrap(), vec![bare.clone(), typed.clone()]);

    store.delete_dependency(owner, &bare).await.unwrap();
    assert_eq!(store.get_delete_dependencies(owner).await.unwrap(), vec![typed]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn remove_marked_rows_selects_owners_by_subquery(ctx: &TestHarness) {
    if !ctx.has_database() {
        return;
    }
    let store = store(ctx);
    let job = ctx.unique_id().await;
    let table = format!("hopcount_{job}");
    sqlx::query(&format!(
        "CREATE TABLE {table} (id BIGINT PRIMARY KEY, jobid BIGINT NOT NULL, distance INTEGER)"
    ))
    .execute(&ctx.db_pool)
    .await
    .unwrap();

    let stale = ctx.unique_id().await;
    let fresh = ctx.unique_id().await;
    sqlx::query(&format!(
        "INSERT INTO {table} (id, jobid, distance) VALUES ($1, $3, NULL), ($2, $3, 2)"
    ))
    .bind(stale)
    .bind(fresh)
    .bind(job)
    .execute(&ctx.db_pool)
    .await
    .unwrap();

    for owner in [stale, fresh] {
        store
            .write_dependency(job, owner, &DeleteDependency::new(None, "p", Some("c")))
            .await
            .unwrap();
    }

    let marked = OwnerQuery::new(&table, "id")
        .unwrap()
        .filter_eq("jobid", job)
        .unwrap()
        .filter_null("distance")
        .unwrap();
    store.remove_marked_rows(&marked).await.unwrap();

    assert!(store.get_delete_dependencies(stale).await.unwrap().is_empty());
    assert_eq!(store.get_delete_dependencies(fresh).await.unwrap().len(), 1);

    store.delete_job(job).await.unwrap();
    assert!(store.get_delete_dependencies(fresh).await.unwrap().is_empty());
}
