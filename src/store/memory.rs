//! In-memory backends.
//!
//! `MemoryStore` implements the workflow, entity-state, candidate and
//! ontology repositories behind a single lock, so the ownership claim is a
//! real compare-and-set. `MemorySchema` stands in for schema storage and the
//! datasource adapter, computing value overlap from seeded column values.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CandidateRepository, EntityStateRepository, OntologyStore, SchemaDiscoverer, SchemaStore,
    WorkflowRepository,
};
use crate::error::TransitionError;
use crate::models::{
    CandidateStatus, ColumnRef, EntityState, EntityStatus, EntityType, OntologySnapshot,
    RelationshipCandidate, SchemaColumn, SchemaRelationship, SchemaTable, TaskSnapshot,
    ValueOverlap, Workflow, WorkflowKind, WorkflowPhase, WorkflowProgress, WorkflowState,
};

#[derive(Default)]
struct MemoryInner {
    /// Insertion order doubles as creation order for "latest" lookups
    workflows: Vec<Workflow>,
    entities: HashMap<Uuid, EntityState>,
    candidates: Vec<RelationshipCandidate>,
    ontologies: HashMap<Uuid, OntologySnapshot>,
}

impl MemoryInner {
    fn workflow_mut(&mut self, id: Uuid) -> Result<&mut Workflow> {
        self.workflows
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| anyhow!("workflow not found: {}", id))
    }

    fn entity_mut(&mut self, id: Uuid) -> Result<&mut EntityState> {
        self.entities
            .get_mut(&id)
            .ok_or_else(|| anyhow!("entity state not found: {}", id))
    }

    fn candidate_mut(&mut self, id: Uuid) -> Result<&mut RelationshipCandidate> {
        self.candidates
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow!("candidate not found: {}", id))
    }
}

/// In-memory workflow, entity-state, candidate and ontology store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn create(&self, workflow: &Workflow) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.workflows.iter().any(|w| w.id == workflow.id) {
            return Err(anyhow!("workflow already exists: {}", workflow.id));
        }
        inner.workflows.push(workflow.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>> {
        let inner = self.inner.read().await;
        Ok(inner.workflows.iter().find(|w| w.id == id).cloned())
    }

    async fn get_latest_by_project(
        &self,
        project_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Option<Workflow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflows
            .iter()
            .rev()
            .find(|w| w.project_id == project_id && w.kind == kind)
            .cloned())
    }

    async fn get_latest_by_datasource(
        &self,
        datasource_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Option<Workflow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflows
            .iter()
            .rev()
            .find(|w| w.datasource_id == Some(datasource_id) && w.kind == kind)
            .cloned())
    }

    async fn list_by_project(
        &self,
        project_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Vec<Workflow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflows
            .iter()
            .filter(|w| w.project_id == project_id && w.kind == kind)
            .cloned()
            .collect())
    }

    async fn list_by_state(&self, state: WorkflowState) -> Result<Vec<Workflow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflows
            .iter()
            .filter(|w| w.state == state)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.workflows.retain(|w| w.id != id);
        Ok(())
    }

    async fn update_state(
        &self,
        id: Uuid,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        wf.state = state;
        wf.error_message = error_message.map(str::to_string);
        wf.updated_at = Utc::now();
        Ok(())
    }

    async fn update_state_if(
        &self,
        id: Uuid,
        expected: WorkflowState,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        if wf.state != expected {
            return Ok(false);
        }
        wf.state = state;
        wf.error_message = error_message.map(str::to_string);
        wf.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_phase(&self, id: Uuid, phase: WorkflowPhase) -> Result<()> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        wf.phase = phase;
        wf.updated_at = Utc::now();
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, progress: &WorkflowProgress) -> Result<()> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        wf.progress = progress.clone();
        wf.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_queue(&self, id: Uuid, tasks: &[TaskSnapshot]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        wf.task_queue = tasks.to_vec();
        Ok(())
    }

    async fn claim_ownership(
        &self,
        id: Uuid,
        owner_id: Uuid,
        lease_timeout: Duration,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        let now = Utc::now();
        if wf.owner_id == Some(owner_id) || !wf.lease_is_live(now, lease_timeout) {
            wf.owner_id = Some(owner_id);
            wf.last_heartbeat = Some(now);
            return Ok(true);
        }
        Ok(false)
    }

    async fn update_heartbeat(&self, id: Uuid, owner_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        if wf.owner_id != Some(owner_id) {
            return Ok(false);
        }
        wf.last_heartbeat = Some(Utc::now());
        Ok(true)
    }

    async fn release_ownership(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let wf = inner.workflow_mut(id)?;
        wf.owner_id = None;
        wf.last_heartbeat = None;
        Ok(())
    }
}

#[async_trait]
impl EntityStateRepository for MemoryStore {
    async fn create_batch(&self, entities: &[EntityState]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for entity in entities {
            inner.entities.insert(entity.id, entity.clone());
        }
        Ok(())
    }

    async fn list_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<EntityState>> {
        let inner = self.inner.read().await;
        let mut entities: Vec<EntityState> = inner
            .entities
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        entities.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entity_key.cmp(&b.entity_key))
        });
        Ok(entities)
    }

    async fn get(&self, id: Uuid) -> Result<Option<EntityState>> {
        let inner = self.inner.read().await;
        Ok(inner.entities.get(&id).cloned())
    }

    async fn get_by_key(
        &self,
        workflow_id: Uuid,
        entity_type: EntityType,
        entity_key: &str,
    ) -> Result<Option<EntityState>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entities
            .values()
            .find(|e| {
                e.workflow_id == workflow_id
                    && e.entity_type == entity_type
                    && e.entity_key == entity_key
            })
            .cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: EntityStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entity = inner.entity_mut(id)?;
        if entity.status == status {
            return Ok(());
        }
        if !entity.status.can_transition(entity.entity_type, status) {
            return Err(TransitionError {
                entity_id: id,
                entity_type: entity.entity_type,
                from: entity.status,
                to: status,
            }
            .into());
        }
        entity.status = status;
        if last_error.is_some() {
            entity.last_error = last_error.map(str::to_string);
        }
        entity.updated_at = Utc::now();
        Ok(())
    }

    async fn update_state_data(&self, id: Uuid, state_data: &serde_json::Value) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entity = inner.entity_mut(id)?;
        entity.state_data = state_data.clone();
        entity.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid, last_error: &str) -> Result<i32> {
        let mut inner = self.inner.write().await;
        let entity = inner.entity_mut(id)?;
        entity.retry_count += 1;
        entity.last_error = Some(last_error.to_string());
        entity.updated_at = Utc::now();
        Ok(entity.retry_count)
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entity = inner.entity_mut(id)?;
        if entity.status != EntityStatus::Failed {
            return Err(anyhow!(
                "only failed entities can be retried, {} is {}",
                entity.entity_key,
                entity.status
            ));
        }
        entity.status = EntityStatus::Pending;
        entity.retry_count += 1;
        entity.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_by_workflow(&self, workflow_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.entities.len();
        inner.entities.retain(|_, e| e.workflow_id != workflow_id);
        Ok((before - inner.entities.len()) as u64)
    }
}

#[async_trait]
impl CandidateRepository for MemoryStore {
    async fn create(&self, candidate: &RelationshipCandidate) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.candidates.push(candidate.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RelationshipCandidate>> {
        let inner = self.inner.read().await;
        Ok(inner.candidates.iter().find(|c| c.id == id).cloned())
    }

    async fn get_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<RelationshipCandidate>> {
        let inner = self.inner.read().await;
        Ok(inner
            .candidates
            .iter()
            .filter(|c| c.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn get_by_workflow_and_status(
        &self,
        workflow_id: Uuid,
        status: CandidateStatus,
    ) -> Result<Vec<RelationshipCandidate>> {
        let inner = self.inner.read().await;
        Ok(inner
            .candidates
            .iter()
            .filter(|c| c.workflow_id == workflow_id && c.status == status)
            .cloned()
            .collect())
    }

    async fn count_required_pending(&self, workflow_id: Uuid) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .candidates
            .iter()
            .filter(|c| {
                c.workflow_id == workflow_id && c.is_required && c.status == CandidateStatus::Pending
            })
            .count())
    }

    async fn update(&self, candidate: &RelationshipCandidate) -> Result<()> {
        let mut inner = self.inner.write().await;
        let existing = inner.candidate_mut(candidate.id)?;
        *existing = candidate.clone();
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: CandidateStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let candidate = inner.candidate_mut(id)?;
        candidate.status = status;
        candidate.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_by_workflow(&self, workflow_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.candidates.len();
        inner.candidates.retain(|c| c.workflow_id != workflow_id);
        Ok((before - inner.candidates.len()) as u64)
    }
}

#[async_trait]
impl OntologyStore for MemoryStore {
    async fn save_ontology(&self, project_id: Uuid, ontology: &OntologySnapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.ontologies.insert(project_id, ontology.clone());
        Ok(())
    }

    async fn get_ontology(&self, project_id: Uuid) -> Result<Option<OntologySnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner.ontologies.get(&project_id).cloned())
    }
}

// ============================================================================
// Schema collaborator
// ============================================================================

#[derive(Default)]
struct SchemaInner {
    tables: Vec<SchemaTable>,
    /// Columns keyed by the datasource they were discovered in
    columns: Vec<(Uuid, SchemaColumn)>,
    values: HashMap<ColumnRef, Vec<String>>,
    relationships: Vec<SchemaRelationship>,
    /// Remaining injected failures per column (sampling and overlap)
    failures: HashMap<ColumnRef, u32>,
    failing_datasources: HashSet<Uuid>,
    overlap_calls: usize,
}

/// In-memory schema store and datasource adapter
#[derive(Default)]
pub struct MemorySchema {
    inner: StdRwLock<SchemaInner>,
}

impl MemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SchemaInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SchemaInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a table and return it
    pub fn add_table(&self, datasource_id: Uuid, schema_name: &str, table_name: &str) -> SchemaTable {
        let table = SchemaTable {
            id: Uuid::new_v4(),
            datasource_id,
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            row_count: None,
        };
        self.write().tables.push(table.clone());
        table
    }

    /// Register a column; its table does not have to exist (orphan)
    pub fn add_column(&self, datasource_id: Uuid, column: SchemaColumn) -> SchemaColumn {
        self.write().columns.push((datasource_id, column.clone()));
        column
    }

    /// Seed the row values of a column, used by sampling and overlap checks
    pub fn set_values<I, S>(&self, column: ColumnRef, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write()
            .values
            .insert(column, values.into_iter().map(Into::into).collect());
    }

    /// Make the next `times` calls touching `column` fail
    pub fn fail_column(&self, column: ColumnRef, times: u32) {
        self.write().failures.insert(column, times);
    }

    /// Make table and column listing fail for a datasource
    pub fn fail_listing(&self, datasource_id: Uuid) {
        self.write().failing_datasources.insert(datasource_id);
    }

    pub fn remove_table(&self, table_id: Uuid) {
        self.write().tables.retain(|t| t.id != table_id);
    }

    pub fn remove_column(&self, column_id: Uuid) {
        self.write().columns.retain(|(_, c)| c.id != column_id);
    }

    pub fn relationships(&self) -> Vec<SchemaRelationship> {
        self.read().relationships.clone()
    }

    pub fn overlap_calls(&self) -> usize {
        self.read().overlap_calls
    }

    fn take_failure(inner: &mut SchemaInner, column: &ColumnRef) -> Result<()> {
        if let Some(remaining) = inner.failures.get_mut(column) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow!("injected failure for {}", column));
            }
        }
        Ok(())
    }

    fn check_listing(inner: &SchemaInner, datasource_id: Uuid) -> Result<()> {
        if inner.failing_datasources.contains(&datasource_id) {
            return Err(anyhow!("cannot list schema for datasource {}", datasource_id));
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaStore for MemorySchema {
    async fn list_tables(&self, datasource_id: Uuid) -> Result<Vec<SchemaTable>> {
        let inner = self.read();
        Self::check_listing(&inner, datasource_id)?;
        Ok(inner
            .tables
            .iter()
            .filter(|t| t.datasource_id == datasource_id)
            .cloned()
            .collect())
    }

    async fn list_columns(&self, datasource_id: Uuid) -> Result<Vec<SchemaColumn>> {
        let inner = self.read();
        Self::check_listing(&inner, datasource_id)?;
        Ok(inner
            .columns
            .iter()
            .filter(|(ds, _)| *ds == datasource_id)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn list_columns_by_table(&self, table_id: Uuid) -> Result<Vec<SchemaColumn>> {
        let inner = self.read();
        Ok(inner
            .columns
            .iter()
            .filter(|(_, c)| c.table_id == table_id)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn get_table(&self, id: Uuid) -> Result<Option<SchemaTable>> {
        Ok(self.read().tables.iter().find(|t| t.id == id).cloned())
    }

    async fn get_column(&self, id: Uuid) -> Result<Option<SchemaColumn>> {
        Ok(self
            .read()
            .columns
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(_, c)| c.clone()))
    }

    async fn upsert_relationships(&self, relationships: &[SchemaRelationship]) -> Result<()> {
        let mut inner = self.write();
        for rel in relationships {
            match inner.relationships.iter_mut().find(|r| {
                r.source_column_id == rel.source_column_id
                    && r.target_column_id == rel.target_column_id
            }) {
                Some(existing) => *existing = rel.clone(),
                None => inner.relationships.push(rel.clone()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaDiscoverer for MemorySchema {
    async fn sample_values(&self, column: &ColumnRef, limit: usize) -> Result<Vec<String>> {
        let mut inner = self.write();
        Self::take_failure(&mut inner, column)?;
        let mut seen = HashSet::new();
        Ok(inner
            .values
            .get(column)
            .map(|values| {
                values
                    .iter()
                    .filter(|v| seen.insert(v.as_str()))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn check_value_overlap(
        &self,
        source: &ColumnRef,
        target: &ColumnRef,
        sample_limit: usize,
    ) -> Result<ValueOverlap> {
        let mut inner = self.write();
        inner.overlap_calls += 1;
        Self::take_failure(&mut inner, source)?;

        let empty = Vec::new();
        let source_values = inner.values.get(source).unwrap_or(&empty);
        let target_values = inner.values.get(target).unwrap_or(&empty);

        let target_set: HashSet<&str> = target_values.iter().map(String::as_str).collect();
        let source_set: HashSet<&str> = source_values.iter().map(String::as_str).collect();
        let sampled: Vec<&String> = source_values.iter().take(sample_limit).collect();
        let matched = sampled
            .iter()
            .filter(|v| target_set.contains(v.as_str()))
            .count();

        Ok(ValueOverlap {
            source_distinct: source_set.len() as i64,
            target_distinct: target_set.len() as i64,
            matched_rows: matched as i64,
            sampled_rows: sampled.len() as i64,
        })
    }
}
