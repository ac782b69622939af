//! Integration tests for the dependency DAG: cycle rejection, batch
//! resolution, and the dependent index queries.

use uuid::Uuid;

use offload_db::models::{DependencyResolution, TaskStatus};
use offload_db::queries::dependencies::{self, DependencyInsertError};
use offload_db::queries::tasks;
use offload_test_utils::{create_test_db, sample_task};

#[tokio::test]
async fn insert_edges_and_summarize() {
    let db = create_test_db().await;

    let a = sample_task("a");
    let b = sample_task("b");
    let c = sample_task("c");
    for t in [&a, &b, &c] {
        tasks::insert_task(&db.pool, t).await.unwrap();
    }

    dependencies::insert_edges(&db.pool, c.id, &[a.id, b.id])
        .await
        .unwrap();

    let summary = dependencies::edge_summary(&db.pool, c.id).await.unwrap();
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.unresolved_failed, 0);

    let dependents = dependencies::dependents_of(&db.pool, a.id).await.unwrap();
    assert_eq!(dependents, vec![c.id]);
}

#[tokio::test]
async fn duplicate_edge_is_ignored() {
    let db = create_test_db().await;

    let a = sample_task("a");
    let b = sample_task("b");
    tasks::insert_task(&db.pool, &a).await.unwrap();
    tasks::insert_task(&db.pool, &b).await.unwrap();

    dependencies::insert_edges(&db.pool, b.id, &[a.id]).await.unwrap();
    dependencies::insert_edges(&db.pool, b.id, &[a.id]).await.unwrap();

    let edges = dependencies::edges_for_task(&db.pool, b.id).await.unwrap();
    assert_eq!(edges.len(), 1);
}

#[tokio::test]
async fn direct_cycle_is_rejected() {
    let db = create_test_db().await;

    let a = sample_task("a");
    let b = sample_task("b");
    tasks::insert_task(&db.pool, &a).await.unwrap();
    tasks::insert_task(&db.pool, &b).await.unwrap();

    dependencies::insert_edges(&db.pool, b.id, &[a.id]).await.unwrap();

    let result = dependencies::insert_edges(&db.pool, a.id, &[b.id]).await;
    assert!(matches!(result, Err(DependencyInsertError::Cycle { .. })));
}

#[tokio::test]
async fn transitive_cycle_is_rejected() {
    let db = create_test_db().await;

    let a = sample_task("a");
    let b = sample_task("b");
    let c = sample_task("c");
    for t in [&a, &b, &c] {
        tasks::insert_task(&db.pool, t).await.unwrap();
    }

    // b -> a, c -> b; adding a -> c closes the loop.
    dependencies::insert_edges(&db.pool, b.id, &[a.id]).await.unwrap();
    dependencies::insert_edges(&db.pool, c.id, &[b.id]).await.unwrap();

    let result = dependencies::insert_edges(&db.pool, a.id, &[c.id]).await;
    assert!(matches!(result, Err(DependencyInsertError::Cycle { .. })));
}

#[tokio::test]
async fn failed_batch_leaves_no_partial_edges() {
    let db = create_test_db().await;

    let a = sample_task("a");
    let b = sample_task("b");
    tasks::insert_task(&db.pool, &a).await.unwrap();
    tasks::insert_task(&db.pool, &b).await.unwrap();
    dependencies::insert_edges(&db.pool, b.id, &[a.id]).await.unwrap();

    // Batch of (valid edge, cycle edge): the whole batch must roll back.
    let c = sample_task("c");
    tasks::insert_task(&db.pool, &c).await.unwrap();
    let result = dependencies::insert_edges(&db.pool, a.id, &[c.id, b.id]).await;
    assert!(matches!(result, Err(DependencyInsertError::Cycle { .. })));

    let edges = dependencies::edges_for_task(&db.pool, a.id).await.unwrap();
    assert!(edges.is_empty(), "rolled-back batch left edges behind");
}

#[tokio::test]
async fn unknown_dependency_target_is_rejected() {
    let db = create_test_db().await;

    let a = sample_task("a");
    tasks::insert_task(&db.pool, &a).await.unwrap();

    let ghost = Uuid::new_v4();
    let result = dependencies::insert_edges(&db.pool, a.id, &[ghost]).await;
    assert!(matches!(result, Err(DependencyInsertError::UnknownTask(id)) if id == ghost));
}

#[tokio::test]
async fn resolve_batch_marks_every_pending_edge() {
    let db = create_test_db().await;

    let parent = sample_task("parent");
    let kids: Vec<_> = (0..3).map(|i| sample_task(&format!("kid {i}"))).collect();
    tasks::insert_task(&db.pool, &parent).await.unwrap();
    for kid in &kids {
        tasks::insert_task(&db.pool, kid).await.unwrap();
        dependencies::insert_edges(&db.pool, kid.id, &[parent.id])
            .await
            .unwrap();
    }

    let resolved =
        dependencies::resolve_batch(&db.pool, parent.id, DependencyResolution::Failed)
            .await
            .unwrap();
    assert_eq!(resolved, 3);

    for kid in &kids {
        let summary = dependencies::edge_summary(&db.pool, kid.id).await.unwrap();
        assert_eq!(summary.pending, 0);
        assert_eq!(summary.unresolved_failed, 1);
    }

    // Already-resolved edges are untouched by a second batch.
    let resolved =
        dependencies::resolve_batch(&db.pool, parent.id, DependencyResolution::Completed)
            .await
            .unwrap();
    assert_eq!(resolved, 0);
}

#[tokio::test]
async fn pending_edges_survive_terminal_parent_listing() {
    let db = create_test_db().await;

    let a = sample_task("a");
    let b = sample_task("b");
    tasks::insert_task(&db.pool, &a).await.unwrap();
    tasks::insert_task(&db.pool, &b).await.unwrap();
    dependencies::insert_edges(&db.pool, b.id, &[a.id]).await.unwrap();

    let pending = dependencies::all_pending_unbounded(&db.pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, b.id);
    assert_eq!(pending[0].depends_on_task_id, a.id);

    tasks::finish_task(
        &db.pool,
        a.id,
        TaskStatus::Completed,
        Some(0),
        None,
        chrono::Utc::now(),
    )
    .await
    .unwrap();

    let pending = dependencies::all_pending_unbounded(&db.pool).await.unwrap();
    assert!(pending.is_empty());
}
