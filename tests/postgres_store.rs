//! Postgres backend against a live database
//!
//! Run with: DATABASE_URL=postgresql://... cargo test --features database --test postgres_store
//! Skipped when DATABASE_URL is not set.

#![cfg(feature = "database")]

use std::time::Duration;

use ontology_engine::models::{
    CandidateStatus, DetectionMethod, EntityState, EntityStatus, EntityType, QueuedTaskStatus,
    RelationshipCandidate, TaskSnapshot, Workflow, WorkflowKind, WorkflowProgress, WorkflowState,
};
use ontology_engine::store::postgres::{DatabaseConfig, PgStore};
use ontology_engine::store::{CandidateRepository, EntityStateRepository, WorkflowRepository};
use ontology_engine::TransitionError;
use uuid::Uuid;

async fn store() -> Option<PgStore> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    }
    let pool = DatabaseConfig::from_env().connect().await.expect("connect");
    sqlx::raw_sql(include_str!("../migrations/001_ontology_workflow.sql"))
        .execute(&pool)
        .await
        .expect("migrate");
    Some(PgStore::new(pool))
}

#[tokio::test]
async fn test_workflow_lease_round_trip() {
    let Some(store) = store().await else { return };

    let workflow = Workflow::new(WorkflowKind::Extraction, Uuid::new_v4(), Some(Uuid::new_v4()));
    WorkflowRepository::create(&store, &workflow).await.unwrap();

    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let lease = Duration::from_secs(30);
    assert!(store.claim_ownership(workflow.id, a, lease).await.unwrap());
    assert!(!store.claim_ownership(workflow.id, b, lease).await.unwrap());
    assert!(store.claim_ownership(workflow.id, a, lease).await.unwrap());
    assert!(store.update_heartbeat(workflow.id, a).await.unwrap());
    assert!(!store.update_heartbeat(workflow.id, b).await.unwrap());

    // An expired lease can be taken over
    assert!(store
        .claim_ownership(workflow.id, b, Duration::ZERO)
        .await
        .unwrap());
    assert!(!store.update_heartbeat(workflow.id, a).await.unwrap());

    store
        .update_progress(workflow.id, &WorkflowProgress::new(1, 3, "Analyzed 1/3 tables"))
        .await
        .unwrap();
    store
        .update_task_queue(
            workflow.id,
            &[TaskSnapshot {
                task_id: Uuid::new_v4(),
                name: "scan public.users".to_string(),
                status: QueuedTaskStatus::Running,
                error: None,
            }],
        )
        .await
        .unwrap();
    store.release_ownership(workflow.id).await.unwrap();
    assert!(store
        .update_state_if(workflow.id, WorkflowState::Running, WorkflowState::Completed, None)
        .await
        .unwrap());
    assert!(!store
        .update_state_if(workflow.id, WorkflowState::Running, WorkflowState::Cancelled, None)
        .await
        .unwrap());

    let loaded = WorkflowRepository::get(&store, workflow.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.state, WorkflowState::Completed);
    assert_eq!(loaded.owner_id, None);
    assert_eq!(loaded.progress.current, 1);
    assert_eq!(loaded.task_queue.len(), 1);

    WorkflowRepository::delete(&store, workflow.id).await.unwrap();
}

#[tokio::test]
async fn test_entity_status_only_moves_forward() {
    let Some(store) = store().await else { return };

    let workflow = Workflow::new(WorkflowKind::Extraction, Uuid::new_v4(), None);
    WorkflowRepository::create(&store, &workflow).await.unwrap();
    let entity = EntityState::new(workflow.id, EntityType::Table, "public.users");
    store.create_batch(&[entity.clone()]).await.unwrap();

    EntityStateRepository::update_status(&store, entity.id, EntityStatus::Scanning, None)
        .await
        .unwrap();
    EntityStateRepository::update_status(&store, entity.id, EntityStatus::Scanning, None)
        .await
        .unwrap();

    let err = EntityStateRepository::update_status(&store, entity.id, EntityStatus::Pending, None)
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<TransitionError>().is_some());

    EntityStateRepository::update_status(&store, entity.id, EntityStatus::Failed, Some("boom"))
        .await
        .unwrap();
    store.reset_for_retry(entity.id).await.unwrap();
    let reset = EntityStateRepository::get(&store, entity.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reset.status, EntityStatus::Pending);
    assert_eq!(reset.last_error.as_deref(), Some("boom"));
    assert!(store.reset_for_retry(entity.id).await.is_err());

    WorkflowRepository::delete(&store, workflow.id).await.unwrap();
}

#[tokio::test]
async fn test_required_pending_count() {
    let Some(store) = store().await else { return };

    let workflow = Workflow::new(
        WorkflowKind::RelationshipDetection,
        Uuid::new_v4(),
        Some(Uuid::new_v4()),
    );
    WorkflowRepository::create(&store, &workflow).await.unwrap();

    for required in [true, true, false] {
        let mut candidate = RelationshipCandidate::new(
            workflow.id,
            Uuid::new_v4(),
            Uuid::new_v4(),
            DetectionMethod::Metadata,
            0.7,
        );
        candidate.is_required = required;
        CandidateRepository::create(&store, &candidate).await.unwrap();
    }
    assert_eq!(store.count_required_pending(workflow.id).await.unwrap(), 2);

    let required = store
        .get_by_workflow(workflow.id)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.is_required)
        .unwrap();
    CandidateRepository::update_status(&store, required.id, CandidateStatus::Rejected)
        .await
        .unwrap();
    assert_eq!(store.count_required_pending(workflow.id).await.unwrap(), 1);

    assert_eq!(
        CandidateRepository::delete_by_workflow(&store, workflow.id)
            .await
            .unwrap(),
        3
    );
    WorkflowRepository::delete(&store, workflow.id).await.unwrap();
}
