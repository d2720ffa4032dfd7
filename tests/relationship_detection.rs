//! Relationship detection, review and save over the in-memory backend

mod common;

use common::Harness;
use ontology_engine::models::{
    CandidateStatus, ColumnRef, DetectionMethod, EntityStatus, EntityType, SchemaColumn,
    SchemaTable, Workflow, WorkflowKind, WorkflowState,
};
use ontology_engine::store::{EntityStateRepository, WorkflowRepository};
use ontology_engine::WorkflowError;
use uuid::Uuid;

struct Shop {
    users: SchemaTable,
    orders: SchemaTable,
    user_id: SchemaColumn,
    buyer_id: SchemaColumn,
    shipping_ref: SchemaColumn,
}

fn seed_shop(h: &Harness) -> Shop {
    let users = h.table("users");
    h.key(&users);
    h.values(&users, "id", &["1", "2", "3", "4"]);

    let addresses = h.table("addresses");
    h.key(&addresses);
    h.values(&addresses, "id", &["a1", "a2"]);

    let orders = h.table("orders");
    h.key(&orders);
    let user_id = h.column(&orders, "user_id");
    let buyer_id = h.schema.add_column(
        h.datasource_id,
        SchemaColumn::new(orders.id, "buyer_id", "text").references("users", "id"),
    );
    let shipping_ref = h.schema.add_column(
        h.datasource_id,
        SchemaColumn::new(orders.id, "shipping_ref", "text").references("addresses", "id"),
    );
    h.column(&orders, "warehouse_id");
    h.values(&orders, "id", &["o1", "o2", "o3"]);
    h.values(&orders, "user_id", &["1", "2", "3"]);
    h.values(&orders, "buyer_id", &["1", "2"]);
    h.values(&orders, "shipping_ref", &["a1", "a2", "x", "y"]);

    // Column whose table is no longer in the schema
    h.schema.add_column(
        h.datasource_id,
        SchemaColumn::new(Uuid::new_v4(), "ghost_id", "text"),
    );

    Shop {
        users,
        orders,
        user_id,
        buyer_id,
        shipping_ref,
    }
}

#[tokio::test]
async fn test_detection_review_and_save() {
    let h = Harness::new();
    let shop = seed_shop(&h);
    let relationships = h.engine.relationships();

    let id = relationships
        .start_detection(h.project_id, h.datasource_id)
        .await
        .unwrap();
    let workflow = h.wait_for_state(id, WorkflowState::Completed).await;
    assert_eq!(
        workflow.progress.message,
        "3 candidates: 2 accepted, 0 rejected, 1 awaiting review"
    );

    let entities = EntityStateRepository::list_by_workflow(h.store.as_ref(), id)
        .await
        .unwrap();
    let columns = entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Column)
        .count();
    assert_eq!(columns, 7, "orphan column must not get an entity");
    assert!(entities.iter().all(|e| e.status == EntityStatus::Complete));

    let candidates = relationships.list_candidates(id).await.unwrap();
    assert_eq!(candidates.len(), 3);

    let by_source = |column: &SchemaColumn| {
        candidates
            .iter()
            .find(|c| c.source_column_id == column.id)
            .cloned()
            .expect("candidate for column")
    };
    let user = by_source(&shop.user_id);
    assert_eq!(user.detection_method, DetectionMethod::ValueMatch);
    assert_eq!(user.status, CandidateStatus::Accepted);
    assert_eq!(
        user.description.as_deref(),
        Some("orders.user_id references users.id")
    );
    let buyer = by_source(&shop.buyer_id);
    assert_eq!(buyer.detection_method, DetectionMethod::Metadata);
    assert_eq!(buyer.status, CandidateStatus::Accepted);
    let shipping = by_source(&shop.shipping_ref);
    assert_eq!(shipping.status, CandidateStatus::Pending);
    assert!(shipping.is_required);
    assert!((shipping.confidence - 0.8).abs() < 1e-9);

    let err = relationships.save_relationships(id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::ReviewRequired(1)));
    assert_eq!(
        err.to_string(),
        "cannot save: 1 relationships require user review"
    );
    assert!(h.schema.relationships().is_empty());

    let err = relationships
        .review_candidate(shipping.id, CandidateStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState(_)));

    let reviewed = relationships
        .review_candidate(shipping.id, CandidateStatus::Accepted)
        .await
        .unwrap();
    assert_eq!(reviewed.status, CandidateStatus::Accepted);

    let saved = relationships.save_relationships(id).await.unwrap();
    assert_eq!(saved, 2, "one relationship per table pair");

    let written = h.schema.relationships();
    assert_eq!(written.len(), 2);
    let to_users = written
        .iter()
        .find(|r| r.source_table_id == shop.orders.id && r.target_table_id == shop.users.id)
        .expect("orders -> users");
    assert_eq!(to_users.source_column_id, shop.buyer_id.id);
    assert_eq!(
        to_users.description.as_deref(),
        Some("orders.buyer_id references users.id")
    );
    assert!(written.iter().all(|r| r.datasource_id == h.datasource_id));
}

#[tokio::test]
async fn test_start_refused_while_detection_running() {
    let h = Harness::new();
    let running = Workflow::new(
        WorkflowKind::RelationshipDetection,
        h.project_id,
        Some(h.datasource_id),
    );
    WorkflowRepository::create(h.store.as_ref(), &running)
        .await
        .unwrap();

    let err = h
        .engine
        .relationships()
        .start_detection(h.project_id, h.datasource_id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DetectionInProgress));
}

#[tokio::test]
async fn test_save_requires_datasource() {
    let h = Harness::new();
    let workflow = Workflow::new(WorkflowKind::RelationshipDetection, h.project_id, None);
    WorkflowRepository::create(h.store.as_ref(), &workflow)
        .await
        .unwrap();

    let err = h
        .engine
        .relationships()
        .save_relationships(workflow.id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::MissingDatasource));
    assert_eq!(err.to_string(), "workflow has no datasource ID");
}

#[tokio::test]
async fn test_save_aborts_when_column_disappears() {
    let h = Harness::new();
    let users = h.table("users");
    h.key(&users);
    h.values(&users, "id", &["1", "2"]);
    let orders = h.table("orders");
    let user_id = h.column(&orders, "user_id");
    h.values(&orders, "user_id", &["1", "2"]);

    let id = h
        .engine
        .relationships()
        .start_detection(h.project_id, h.datasource_id)
        .await
        .unwrap();
    h.wait_for_state(id, WorkflowState::Completed).await;

    h.schema.remove_column(user_id.id);
    let err = h
        .engine
        .relationships()
        .save_relationships(id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ColumnNotFound(c) if c == user_id.id));
    assert!(h.schema.relationships().is_empty());
}

#[tokio::test]
async fn test_failed_column_scan_does_not_fail_detection() {
    let h = Harness::new();
    let shop = seed_shop(&h);
    h.schema.fail_column(
        ColumnRef::new("public", "orders", &shop.user_id.column_name),
        100,
    );

    let id = h
        .engine
        .relationships()
        .start_detection(h.project_id, h.datasource_id)
        .await
        .unwrap();
    h.wait_for_state(id, WorkflowState::Completed).await;

    let failed = h
        .store
        .get_by_key(id, EntityType::Column, "public.orders.user_id")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, EntityStatus::Failed);

    let candidates = h.engine.relationships().list_candidates(id).await.unwrap();
    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|c| c.source_column_id != shop.user_id.id));
}

#[tokio::test]
async fn test_restart_clears_previous_candidates() {
    let h = Harness::new();
    seed_shop(&h);
    let relationships = h.engine.relationships();

    let first = relationships
        .start_detection(h.project_id, h.datasource_id)
        .await
        .unwrap();
    h.wait_for_state(first, WorkflowState::Completed).await;
    assert_eq!(relationships.list_candidates(first).await.unwrap().len(), 3);

    let second = relationships
        .start_detection(h.project_id, h.datasource_id)
        .await
        .unwrap();
    assert!(relationships.list_candidates(first).await.unwrap().is_empty());

    h.wait_for_state(second, WorkflowState::Completed).await;
    assert_eq!(relationships.list_candidates(second).await.unwrap().len(), 3);
    let latest = relationships
        .get_status(h.datasource_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, second);
}
