use async_trait::async_trait;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;

use lume_sync::db::{self, Pool};
use lume_sync::migration::{MigrationError, MigrationHook, MigrationPlan, MigrationStage};
use lume_sync::model::{EventMetadata, EventStatus, RetryPolicy};
use lume_sync::outbox::OutboxRepository;

async fn empty_pool() -> Pool {
    db::init_pool("sqlite::memory:").await.unwrap()
}

#[tokio::test]
async fn migrate_applies_every_stage_once() {
    let pool = empty_pool().await;
    let plan = MigrationPlan::standard();
    assert_eq!(plan.current_version(&pool).await.unwrap(), 0);

    let report = plan.migrate(&pool).await.unwrap();
    assert_eq!(report.from, 0);
    assert_eq!(report.to, 3);
    assert_eq!(report.applied, vec![1, 2, 3]);

    let again = plan.migrate(&pool).await.unwrap();
    assert!(again.applied.is_empty());
    assert_eq!(plan.current_version(&pool).await.unwrap(), 3);
}

#[tokio::test]
async fn stages_apply_only_on_their_predecessor() {
    let pool = empty_pool().await;
    let plan = MigrationPlan::standard();
    plan.apply_stage(&pool, 1).await.unwrap();

    let err = plan.apply_stage(&pool, 3).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::OutOfSequence {
            current: 1,
            requested: 3
        }
    ));
    let err = plan.apply_stage(&pool, 1).await.unwrap_err();
    assert!(matches!(err, MigrationError::OutOfSequence { .. }));
    assert_eq!(plan.current_version(&pool).await.unwrap(), 1);

    plan.apply_stage(&pool, 2).await.unwrap();
    assert_eq!(plan.current_version(&pool).await.unwrap(), 2);
}

#[tokio::test]
async fn newer_store_is_refused() {
    let pool = empty_pool().await;
    let plan = MigrationPlan::standard();
    plan.migrate(&pool).await.unwrap();
    sqlx::query("UPDATE schema_version SET version = 9")
        .execute(&pool)
        .await
        .unwrap();

    let err = plan.migrate(&pool).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::StoreAhead {
            stamped: 9,
            latest: 3
        }
    ));
}

struct RejectingHook;

#[async_trait]
impl MigrationHook for RejectingHook {
    async fn run(&self, _conn: &mut SqliteConnection) -> anyhow::Result<()> {
        anyhow::bail!("source rows cannot be converted")
    }
}

#[tokio::test]
async fn failed_hook_leaves_prior_version() {
    let pool = empty_pool().await;
    let plan = MigrationPlan::new(vec![
        MigrationStage::lightweight(1, "notes", "CREATE TABLE notes (id TEXT PRIMARY KEY)"),
        MigrationStage::custom(
            2,
            "notes_body",
            "ALTER TABLE notes ADD COLUMN body TEXT",
            None,
            Some(Arc::new(RejectingHook)),
        ),
    ])
    .unwrap();

    let err = plan.migrate(&pool).await.unwrap_err();
    assert!(matches!(err, MigrationError::Hook { version: 2, .. }));
    assert_eq!(plan.current_version(&pool).await.unwrap(), 1);

    // the stage's DDL was rolled back with it
    assert!(sqlx::query("SELECT body FROM notes").fetch_all(&pool).await.is_err());
    sqlx::query("SELECT id FROM notes").fetch_all(&pool).await.unwrap();
}

#[tokio::test]
async fn legacy_statuses_are_normalized_and_metadata_backfilled() {
    let pool = empty_pool().await;
    let plan = MigrationPlan::standard();
    plan.apply_stage(&pool, 1).await.unwrap();
    plan.apply_stage(&pool, 2).await.unwrap();
    for (id, status) in [("e1", "DONE"), ("e2", "in_progress"), ("e3", "mystery"), ("e4", "failed")] {
        sqlx::query(
            "INSERT INTO outbox_events (id, event_type, entity_id, user_id, status, created_at) \
             VALUES (?, 'goal', ?, 'user-1', ?, 1717228800000)",
        )
        .bind(id)
        .bind(format!("goal-{id}"))
        .bind(status)
        .execute(&pool)
        .await
        .unwrap();
    }

    let report = plan.migrate(&pool).await.unwrap();
    assert_eq!(report.applied, vec![3]);

    let rows = sqlx::query("SELECT id, status FROM outbox_events ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    let statuses: Vec<String> = rows.iter().map(|r| r.get("status")).collect();
    assert_eq!(statuses, vec!["completed", "processing", "pending", "failed"]);

    let repo = OutboxRepository::new(pool, RetryPolicy::default());
    let ev = repo.fetch_event("e1").await.unwrap().unwrap();
    assert_eq!(ev.status, EventStatus::Completed);
    assert_eq!(ev.metadata, Some(EventMetadata::Generic(Default::default())));
}

#[tokio::test]
async fn deletes_after_upgrade_see_added_columns() {
    let pool = empty_pool().await;
    let plan = MigrationPlan::standard();
    plan.apply_stage(&pool, 1).await.unwrap();
    plan.apply_stage(&pool, 2).await.unwrap();
    for id in ["e1", "e2"] {
        sqlx::query(
            "INSERT INTO outbox_events (id, event_type, entity_id, user_id, status, created_at) \
             VALUES (?, 'goal', ?, 'user-1', 'pending', 1717228800000)",
        )
        .bind(id)
        .bind(format!("goal-{id}"))
        .execute(&pool)
        .await
        .unwrap();
    }
    // stage 3 scans the table before adding the metadata column
    plan.migrate(&pool).await.unwrap();

    let repo = OutboxRepository::new(pool, RetryPolicy::default());
    let limit = std::time::Duration::from_secs(5);
    for id in ["e1", "e2"] {
        let deleted = tokio::time::timeout(limit, repo.delete_event(id))
            .await
            .expect("delete stalled")
            .unwrap();
        assert_eq!(deleted, 1);
    }
    assert_eq!(repo.get_statistics(None).await.unwrap().total(), 0);
}
