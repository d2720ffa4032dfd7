//! Relationship detection
//!
//! A second run of the workflow engine, specialized for foreign keys:
//! 1. one column-scan task per column records candidates
//! 2. one test-join task per pending candidate settles what it can
//! 3. a human reviews the rest, then `save_relationships` commits
//!
//! Candidates are kept as raw evidence until the save, which collapses
//! duplicates per table pair.

pub mod detection;
mod save;

pub use save::{dedupe_by_table_pair, ResolvedCandidate};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::lease::DriveContext;
use crate::models::{
    CandidateStatus, ColumnRef, ColumnScanData, EntityState, EntityStatus, EntityType,
    RelationshipCandidate, TestJoinData, Workflow, WorkflowKind, WorkflowPhase, WorkflowProgress,
    WorkflowState,
};
use crate::queue::TaskQueue;
use crate::runtime::{settle_batch, DriveSession, WorkflowRuntime};
use crate::store::WorkflowRepository;
use crate::tasks::{ColumnScanTask, TaskDeps, TestJoinTask};

use detection::SchemaIndex;

#[derive(Clone)]
pub struct RelationshipService {
    runtime: Arc<WorkflowRuntime>,
    workflows: Arc<dyn WorkflowRepository>,
    deps: TaskDeps,
}

impl RelationshipService {
    pub fn new(
        runtime: Arc<WorkflowRuntime>,
        workflows: Arc<dyn WorkflowRepository>,
        deps: TaskDeps,
    ) -> Self {
        Self {
            runtime,
            workflows,
            deps,
        }
    }

    /// Start detecting relationships in `datasource_id`.
    ///
    /// Fails if a detection for the datasource is already running, or if
    /// ownership of the new workflow cannot be claimed. Candidates and
    /// entity rows of earlier detections are cleared.
    pub async fn start_detection(&self, project_id: Uuid, datasource_id: Uuid) -> Result<Uuid> {
        if let Some(latest) = self
            .workflows
            .get_latest_by_datasource(datasource_id, WorkflowKind::RelationshipDetection)
            .await?
        {
            if latest.state == WorkflowState::Running {
                return Err(WorkflowError::DetectionInProgress);
            }
            let candidates = self.deps.candidates.delete_by_workflow(latest.id).await?;
            let entities = self.deps.entities.delete_by_workflow(latest.id).await?;
            debug!(workflow_id = %latest.id, candidates, entities, "Cleared previous detection");
        }

        let workflow = Workflow::new(
            WorkflowKind::RelationshipDetection,
            project_id,
            Some(datasource_id),
        );
        self.workflows.create(&workflow).await?;

        let session = match self.runtime.begin(workflow.id).await {
            Ok(session) => session,
            Err(e) => {
                self.runtime
                    .mark_workflow_failed(workflow.id, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        info!(workflow_id = %workflow.id, %datasource_id, "Relationship detection started");
        self.drive(session, false);
        Ok(workflow.id)
    }

    /// Latest detection for a datasource
    pub async fn get_status(&self, datasource_id: Uuid) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .get_latest_by_datasource(datasource_id, WorkflowKind::RelationshipDetection)
            .await?)
    }

    pub async fn cancel(&self, workflow_id: Uuid) -> Result<()> {
        self.runtime.cancel(workflow_id).await
    }

    /// Every candidate recorded by a detection, in creation order
    pub async fn list_candidates(&self, workflow_id: Uuid) -> Result<Vec<RelationshipCandidate>> {
        Ok(self.deps.candidates.get_by_workflow(workflow_id).await?)
    }

    /// Human decision on one candidate
    pub async fn review_candidate(
        &self,
        candidate_id: Uuid,
        status: CandidateStatus,
    ) -> Result<RelationshipCandidate> {
        if status == CandidateStatus::Pending {
            return Err(WorkflowError::InvalidState(
                "review must accept or reject".to_string(),
            ));
        }
        let mut candidate = self
            .deps
            .candidates
            .get(candidate_id)
            .await?
            .ok_or_else(|| WorkflowError::EntityNotFound(candidate_id.to_string()))?;

        self.deps.candidates.update_status(candidate_id, status).await?;
        candidate.status = status;
        info!(%candidate_id, %status, "Candidate reviewed");
        Ok(candidate)
    }

    /// Create a column entity and submit a scan task for every column that
    /// still needs one. Columns whose table no longer exists are skipped.
    pub async fn enqueue_column_scans(
        &self,
        workflow: &Workflow,
        queue: &TaskQueue,
        ctx: &DriveContext,
    ) -> Result<usize> {
        let datasource_id = workflow
            .datasource_id
            .ok_or(WorkflowError::MissingDatasource)?;

        let tables = self.deps.schema.list_tables(datasource_id).await?;
        let columns = self.deps.schema.list_columns(datasource_id).await?;
        let index = Arc::new(SchemaIndex::new(tables, columns.clone()));

        let existing = self.existing_entities(workflow.id, EntityType::Column).await?;
        let mut created = Vec::new();
        let mut work = Vec::new();
        let mut orphans = 0usize;

        for column in columns {
            let Some(table) = index.table(column.table_id).cloned() else {
                debug!(
                    column = %column.column_name,
                    table_id = %column.table_id,
                    "Skipping column of unknown table"
                );
                orphans += 1;
                continue;
            };

            let key = ColumnRef::of(&table, &column).to_string();
            let entity = match existing.get(&key) {
                Some(entity) if entity.status == EntityStatus::Pending => entity.clone(),
                Some(_) => continue,
                None => {
                    let mut entity = EntityState::new(workflow.id, EntityType::Column, key);
                    entity.state_data = serde_json::to_value(ColumnScanData {
                        column_id: Some(column.id),
                        ..Default::default()
                    })?;
                    created.push(entity.clone());
                    entity
                }
            };
            work.push((entity.id, table, column));
        }

        ctx.check(workflow.id)?;
        if !created.is_empty() {
            self.deps.entities.create_batch(&created).await?;
        }

        let submitted = work.len();
        for (entity_id, table, column) in work {
            queue.enqueue(Arc::new(ColumnScanTask::new(
                self.deps.clone(),
                workflow.id,
                entity_id,
                table,
                column,
                index.clone(),
            )));
        }

        info!(workflow_id = %workflow.id, submitted, orphans, "Column scans enqueued");
        Ok(submitted)
    }

    /// Submit a join test for every pending candidate not yet tested
    pub async fn enqueue_test_joins(
        &self,
        workflow: &Workflow,
        queue: &TaskQueue,
        ctx: &DriveContext,
    ) -> Result<usize> {
        let pending = self
            .deps
            .candidates
            .get_by_workflow_and_status(workflow.id, CandidateStatus::Pending)
            .await?;
        let existing = self.existing_entities(workflow.id, EntityType::TestJoin).await?;

        let mut created = Vec::new();
        let mut work = Vec::new();
        for candidate in pending {
            let key = candidate.id.to_string();
            let entity_id = match existing.get(&key) {
                Some(entity) if entity.status == EntityStatus::Pending => entity.id,
                Some(_) => continue,
                None => {
                    let mut entity = EntityState::new(workflow.id, EntityType::TestJoin, key);
                    entity.state_data = serde_json::to_value(TestJoinData {
                        candidate_id: Some(candidate.id),
                        ..Default::default()
                    })?;
                    let id = entity.id;
                    created.push(entity);
                    id
                }
            };
            work.push((entity_id, candidate.id));
        }

        ctx.check(workflow.id)?;
        if !created.is_empty() {
            self.deps.entities.create_batch(&created).await?;
        }

        let submitted = work.len();
        for (entity_id, candidate_id) in work {
            queue.enqueue(Arc::new(TestJoinTask::new(
                self.deps.clone(),
                entity_id,
                candidate_id,
            )));
        }

        info!(workflow_id = %workflow.id, submitted, "Join tests enqueued");
        Ok(submitted)
    }

    /// Take over an abandoned detection. `false` when a peer won the claim.
    pub async fn resume(&self, workflow_id: Uuid) -> Result<bool> {
        let session = match self.runtime.begin(workflow_id).await {
            Ok(session) => session,
            Err(WorkflowError::OwnershipClaimFailed) => return Ok(false),
            Err(e) => return Err(e),
        };
        info!(%workflow_id, "Resuming relationship detection");
        self.drive(session, true);
        Ok(true)
    }

    fn drive(&self, session: DriveSession, resumed: bool) {
        let service = self.clone();
        self.runtime.spawn(session, move |session| async move {
            if resumed {
                service.runtime.reset_in_flight(session.workflow_id).await?;
            }
            service
                .run_detection(session.workflow_id, &session.queue, &session.ctx)
                .await
        });
    }

    async fn run_detection(
        &self,
        workflow_id: Uuid,
        queue: &TaskQueue,
        ctx: &DriveContext,
    ) -> Result<()> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(workflow_id))?;
        self.workflows
            .update_phase(workflow_id, WorkflowPhase::Relationships)
            .await?;

        ctx.check(workflow_id)?;
        let columns = self.enqueue_column_scans(&workflow, queue, ctx).await?;
        self.report(workflow_id, format!("Scanning {} columns", columns))
            .await;
        settle_batch(queue.wait(ctx.token()).await, workflow_id, ctx)?;

        ctx.check(workflow_id)?;
        let joins = self.enqueue_test_joins(&workflow, queue, ctx).await?;
        self.report(workflow_id, format!("Testing {} candidate joins", joins))
            .await;
        settle_batch(queue.wait(ctx.token()).await, workflow_id, ctx)?;

        ctx.check(workflow_id)?;
        self.workflows
            .update_phase(workflow_id, WorkflowPhase::Completing)
            .await?;

        let candidates = self.deps.candidates.get_by_workflow(workflow_id).await?;
        let count = |status| candidates.iter().filter(|c| c.status == status).count();
        let summary = format!(
            "{} candidates: {} accepted, {} rejected, {} awaiting review",
            candidates.len(),
            count(CandidateStatus::Accepted),
            count(CandidateStatus::Rejected),
            count(CandidateStatus::Pending)
        );
        let entities = self.deps.entities.list_by_workflow(workflow_id).await?;
        let total = entities.len() as u32;
        self.workflows
            .update_progress(workflow_id, &WorkflowProgress::new(total, total, summary.clone()))
            .await?;

        ctx.check(workflow_id)?;
        if !self
            .workflows
            .update_state_if(workflow_id, WorkflowState::Running, WorkflowState::Completed, None)
            .await?
        {
            warn!(%workflow_id, "Workflow left running before completion, keeping its state");
            return Err(WorkflowError::Cancelled);
        }
        info!(%workflow_id, %summary, "Relationship detection complete");
        Ok(())
    }

    async fn existing_entities(
        &self,
        workflow_id: Uuid,
        entity_type: EntityType,
    ) -> Result<HashMap<String, EntityState>> {
        Ok(self
            .deps
            .entities
            .list_by_workflow(workflow_id)
            .await?
            .into_iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| (e.entity_key.clone(), e))
            .collect())
    }

    async fn report(&self, workflow_id: Uuid, message: String) {
        let progress = match self.deps.entities.list_by_workflow(workflow_id).await {
            Ok(entities) => {
                let done = entities.iter().filter(|e| e.status.is_terminal()).count();
                WorkflowProgress::new(done as u32, entities.len() as u32, message)
            }
            Err(e) => {
                warn!(%workflow_id, error = %e, "Failed to read progress");
                return;
            }
        };
        if let Err(e) = self.workflows.update_progress(workflow_id, &progress).await {
            warn!(%workflow_id, error = %e, "Failed to update progress");
        }
    }
}
