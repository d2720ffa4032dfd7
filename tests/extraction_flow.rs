//! End-to-end ontology extraction over the in-memory backend

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, Harness, StalledAnalyzer};
use ontology_engine::analyzer::HeuristicAnalyzer;
use ontology_engine::models::{
    ColumnRef, EntityStatus, EntityType, QuestionAnswer, WorkflowPhase, WorkflowState,
};
use ontology_engine::store::{EntityStateRepository, OntologyStore, WorkflowRepository};
use ontology_engine::WorkflowError;

fn seed_shop(h: &Harness) {
    let users = h.table("users");
    h.key(&users);
    h.column(&users, "email");
    h.values(&users, "id", &["u1", "u2"]);
    h.values(&users, "email", &["a@x.io", "b@x.io"]);

    let orders = h.table("orders");
    h.key(&orders);
    h.column(&orders, "user_id");
    h.values(&orders, "id", &["o1", "o2", "o3"]);
    h.values(&orders, "user_id", &["u1", "u1", "u2"]);
}

#[tokio::test]
async fn test_extraction_builds_ontology_after_every_table() {
    let h = Harness::new();
    seed_shop(&h);

    let id = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap();

    let workflow = h.wait_for_state(id, WorkflowState::Completed).await;
    assert_eq!(workflow.phase, WorkflowPhase::Completing);
    assert_eq!(workflow.progress.current, workflow.progress.total);
    assert_eq!(workflow.progress.total, 3);

    let entities = EntityStateRepository::list_by_workflow(h.store.as_ref(), id)
        .await
        .unwrap();
    assert_eq!(entities.len(), 3);
    assert!(entities.iter().all(|e| e.status == EntityStatus::Complete));

    let ontology = h
        .store
        .get_ontology(h.project_id)
        .await
        .unwrap()
        .expect("ontology saved");
    assert_eq!(ontology.entities.len(), 2);
    assert!(ontology.entities.contains_key("public.users"));
    assert!(ontology.entities.contains_key("public.orders"));
    assert_eq!(ontology.domain.as_ref().map(|d| d.table_count), Some(2));

    h.wait_until_idle(&h.engine, id).await;
    assert!(h.engine.runtime().heartbeats().is_empty());
    assert!(h.engine.runtime().writers().is_empty());
    assert_eq!(h.workflow(id).await.owner_id, None);
}

#[tokio::test]
async fn test_failed_table_blocks_synthesis_but_workflow_completes() {
    let h = Harness::new();
    seed_shop(&h);
    h.schema
        .fail_column(ColumnRef::new("public", "orders", "user_id"), 100);

    let id = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap();

    let workflow = h.wait_for_state(id, WorkflowState::Completed).await;
    assert!(workflow.progress.message.contains("2 entities failed"));

    let orders = h
        .store
        .get_by_key(id, EntityType::Table, "public.orders")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orders.status, EntityStatus::Failed);
    assert!(orders.retry_count >= 2);
    assert!(orders.last_error.is_some());

    let global = h
        .store
        .get_by_key(id, EntityType::Global, "global")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(global.status, EntityStatus::Failed);

    let ontology = h.store.get_ontology(h.project_id).await.unwrap().unwrap();
    assert_eq!(ontology.entities.len(), 1);
    assert!(ontology.domain.is_none());
}

#[tokio::test]
async fn test_questions_park_table_until_answered() {
    let h = Harness::with_analyzer(Arc::new(HeuristicAnalyzer::asking()));
    let users = h.table("users");
    h.key(&users);
    let events = h.table("events");
    h.column(&events, "payload");

    let id = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap();

    let store = h.store.clone();
    let parked = eventually(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .get_by_key(id, EntityType::Table, "public.events")
                .await
                .unwrap()
                .filter(|e| e.status == EntityStatus::NeedsInput)
        }
    })
    .await;
    assert!(parked.is_some(), "events table never asked for input");

    // The global entity must not start while a table waits on a human
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.workflow(id).await.state, WorkflowState::Running);
    let global = h
        .store
        .get_by_key(id, EntityType::Global, "global")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(global.status, EntityStatus::Pending);

    let err = h
        .engine
        .extraction()
        .answer_questions(id, "public.users", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState(_)));

    h.engine
        .extraction()
        .answer_questions(
            id,
            "public.events",
            vec![QuestionAnswer {
                question: "What uniquely identifies a event?".to_string(),
                answer: "The pair of source and sequence number".to_string(),
            }],
        )
        .await
        .unwrap();

    h.wait_for_state(id, WorkflowState::Completed).await;
    let ontology = h.store.get_ontology(h.project_id).await.unwrap().unwrap();
    let analysis = &ontology.entities["public.events"];
    assert!(analysis.description.contains("source and sequence number"));
    assert!(analysis.questions.is_empty());
    assert!(ontology.domain.is_some());
}

#[tokio::test]
async fn test_only_driving_instance_answers_questions() {
    let h = Harness::with_analyzer(Arc::new(HeuristicAnalyzer::asking()));
    let events = h.table("events");
    h.column(&events, "payload");

    let id = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap();

    let store = h.store.clone();
    let parked = eventually(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .get_by_key(id, EntityType::Table, "public.events")
                .await
                .unwrap()
                .filter(|e| e.status == EntityStatus::NeedsInput)
        }
    })
    .await
    .expect("events table asks for input");

    let peer = h.peer(Arc::new(HeuristicAnalyzer::new()));
    let err = peer
        .extraction()
        .answer_questions(
            id,
            "public.events",
            vec![QuestionAnswer {
                question: "What uniquely identifies a event?".to_string(),
                answer: "The event id".to_string(),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::NotOwner(w) if w == id));

    let unchanged = h
        .store
        .get_by_key(id, EntityType::Table, "public.events")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, EntityStatus::NeedsInput);
    assert_eq!(unchanged.state_data, parked.state_data);
    assert_eq!(h.workflow(id).await.owner_id, Some(h.engine.owner_id()));

    h.engine
        .extraction()
        .answer_questions(
            id,
            "public.events",
            vec![QuestionAnswer {
                question: "What uniquely identifies a event?".to_string(),
                answer: "The event id".to_string(),
            }],
        )
        .await
        .unwrap();
    h.wait_for_state(id, WorkflowState::Completed).await;
}

#[tokio::test]
async fn test_cancel_stops_driver_and_releases_lease() {
    let h = Harness::with_analyzer(Arc::new(StalledAnalyzer));
    seed_shop(&h);

    let id = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap();

    let err = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ExtractionInProgress));

    let store = h.store.clone();
    let analyzing = eventually(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            EntityStateRepository::list_by_workflow(store.as_ref(), id)
                .await
                .unwrap()
                .into_iter()
                .find(|e| e.status == EntityStatus::Analyzing)
        }
    })
    .await;
    assert!(analyzing.is_some());

    h.engine.extraction().cancel(id).await.unwrap();
    h.engine.extraction().cancel(id).await.unwrap();

    let workflow = h.workflow(id).await;
    assert_eq!(workflow.state, WorkflowState::Cancelled);
    assert_eq!(workflow.owner_id, None);

    h.wait_until_idle(&h.engine, id).await;
    assert!(h.engine.runtime().heartbeats().is_empty());
    assert_eq!(h.workflow(id).await.state, WorkflowState::Cancelled);
}

#[tokio::test]
async fn test_restart_replaces_previous_extraction() {
    let h = Harness::new();
    seed_shop(&h);

    let first = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap();
    h.wait_for_state(first, WorkflowState::Completed).await;
    h.wait_until_idle(&h.engine, first).await;

    let second = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap();
    assert_ne!(first, second);
    assert!(WorkflowRepository::get(h.store.as_ref(), first)
        .await
        .unwrap()
        .is_none());
    assert!(EntityStateRepository::list_by_workflow(h.store.as_ref(), first)
        .await
        .unwrap()
        .is_empty());

    h.wait_for_state(second, WorkflowState::Completed).await;
    let status = h
        .engine
        .extraction()
        .get_status(h.project_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.id, second);
}

#[tokio::test]
async fn test_listing_failure_creates_no_workflow() {
    let h = Harness::new();
    seed_shop(&h);
    h.schema.fail_listing(h.datasource_id);

    let err = h
        .engine
        .extraction()
        .start_extraction(h.project_id, h.datasource_id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Store(_)));
    assert!(h
        .engine
        .extraction()
        .get_status(h.project_id)
        .await
        .unwrap()
        .is_none());
}
