//! Persistence and collaborator contracts.
//!
//! The driver loop, tasks and relationship service operate exclusively
//! through these traits, so backends are pluggable: `MemoryStore` for tests
//! and embedded use, Postgres (feature `database`) for production.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    CandidateStatus, ColumnRef, EntityState, EntityStatus, EntityType, OntologySnapshot,
    RelationshipCandidate, SchemaColumn, SchemaRelationship, SchemaTable, TaskSnapshot,
    ValueOverlap, Workflow, WorkflowKind, WorkflowPhase, WorkflowProgress, WorkflowState,
};

pub use memory::{MemorySchema, MemoryStore};

/// Workflow records, including the ownership lease columns
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    // ── Records ──

    async fn create(&self, workflow: &Workflow) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Workflow>>;
    async fn get_latest_by_project(
        &self,
        project_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Option<Workflow>>;
    async fn get_latest_by_datasource(
        &self,
        datasource_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Option<Workflow>>;
    async fn list_by_project(&self, project_id: Uuid, kind: WorkflowKind)
        -> Result<Vec<Workflow>>;
    async fn list_by_state(&self, state: WorkflowState) -> Result<Vec<Workflow>>;
    async fn delete(&self, id: Uuid) -> Result<()>;

    // ── Driver-owned fields ──

    async fn update_state(
        &self,
        id: Uuid,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> Result<()>;
    /// Compare-and-set on `state`. `false` when the row was no longer in
    /// `expected`, e.g. a cancel landed first.
    async fn update_state_if(
        &self,
        id: Uuid,
        expected: WorkflowState,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> Result<bool>;
    async fn update_phase(&self, id: Uuid, phase: WorkflowPhase) -> Result<()>;
    async fn update_progress(&self, id: Uuid, progress: &WorkflowProgress) -> Result<()>;
    async fn update_task_queue(&self, id: Uuid, tasks: &[TaskSnapshot]) -> Result<()>;

    // ── Ownership lease ──

    /// Atomically take ownership when the row is unowned, already ours, or
    /// its heartbeat is older than `lease_timeout`.
    async fn claim_ownership(&self, id: Uuid, owner_id: Uuid, lease_timeout: Duration)
        -> Result<bool>;
    /// Renew the heartbeat. `false` when `owner_id` is no longer the owner.
    async fn update_heartbeat(&self, id: Uuid, owner_id: Uuid) -> Result<bool>;
    /// Clear owner and heartbeat unconditionally.
    async fn release_ownership(&self, id: Uuid) -> Result<()>;
}

/// Per-unit-of-work state rows
#[async_trait]
pub trait EntityStateRepository: Send + Sync {
    async fn create_batch(&self, entities: &[EntityState]) -> Result<()>;
    async fn list_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<EntityState>>;
    async fn get(&self, id: Uuid) -> Result<Option<EntityState>>;
    async fn get_by_key(
        &self,
        workflow_id: Uuid,
        entity_type: EntityType,
        entity_key: &str,
    ) -> Result<Option<EntityState>>;

    /// Move to `status`. Re-applying the current status is a no-op; a
    /// backward move fails with [`crate::error::TransitionError`].
    async fn update_status(
        &self,
        id: Uuid,
        status: EntityStatus,
        last_error: Option<&str>,
    ) -> Result<()>;
    async fn update_state_data(&self, id: Uuid, state_data: &serde_json::Value) -> Result<()>;
    async fn increment_retry(&self, id: Uuid, last_error: &str) -> Result<i32>;
    /// Explicit retry path: `failed` back to `pending`.
    async fn reset_for_retry(&self, id: Uuid) -> Result<()>;
    async fn delete_by_workflow(&self, workflow_id: Uuid) -> Result<u64>;
}

/// Relationship candidate rows
#[async_trait]
pub trait CandidateRepository: Send + Sync {
    async fn create(&self, candidate: &RelationshipCandidate) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<RelationshipCandidate>>;
    async fn get_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<RelationshipCandidate>>;
    async fn get_by_workflow_and_status(
        &self,
        workflow_id: Uuid,
        status: CandidateStatus,
    ) -> Result<Vec<RelationshipCandidate>>;
    async fn count_required_pending(&self, workflow_id: Uuid) -> Result<usize>;
    async fn update(&self, candidate: &RelationshipCandidate) -> Result<()>;
    async fn update_status(&self, id: Uuid, status: CandidateStatus) -> Result<()>;
    async fn delete_by_workflow(&self, workflow_id: Uuid) -> Result<u64>;
}

/// Materialized ontology per project
#[async_trait]
pub trait OntologyStore: Send + Sync {
    async fn save_ontology(&self, project_id: Uuid, ontology: &OntologySnapshot) -> Result<()>;
    async fn get_ontology(&self, project_id: Uuid) -> Result<Option<OntologySnapshot>>;
}

/// Schema storage collaborator
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn list_tables(&self, datasource_id: Uuid) -> Result<Vec<SchemaTable>>;
    async fn list_columns(&self, datasource_id: Uuid) -> Result<Vec<SchemaColumn>>;
    async fn list_columns_by_table(&self, table_id: Uuid) -> Result<Vec<SchemaColumn>>;
    async fn get_table(&self, id: Uuid) -> Result<Option<SchemaTable>>;
    async fn get_column(&self, id: Uuid) -> Result<Option<SchemaColumn>>;
    /// Upsert a batch of relationships as one unit.
    async fn upsert_relationships(&self, relationships: &[SchemaRelationship]) -> Result<()>;
}

/// Datasource adapter collaborator
#[async_trait]
pub trait SchemaDiscoverer: Send + Sync {
    /// Up to `limit` distinct non-null values of a column
    async fn sample_values(&self, column: &ColumnRef, limit: usize) -> Result<Vec<String>>;
    /// Compare up to `sample_limit` source rows against the target column
    async fn check_value_overlap(
        &self,
        source: &ColumnRef,
        target: &ColumnRef,
        sample_limit: usize,
    ) -> Result<ValueOverlap>;
}
