//! Ontology extraction commands
//!
//! Entry points used by the API layer: start, status, cancel, answering
//! analysis questions, and resuming a workflow reclaimed from a dead peer.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::models::{
    EntityState, EntityStatus, EntityType, QuestionAnswer, TableStateData, Workflow,
    WorkflowKind, WorkflowProgress, WorkflowState,
};
use crate::orchestrator::Orchestrator;
use crate::queue::Task;
use crate::runtime::{DriveSession, WorkflowRuntime};
use crate::store::{OntologyStore, WorkflowRepository};
use crate::tasks::{AnalyzeTableTask, TaskDeps};

#[derive(Clone)]
pub struct ExtractionService {
    runtime: Arc<WorkflowRuntime>,
    orchestrator: Arc<Orchestrator>,
    workflows: Arc<dyn WorkflowRepository>,
    deps: TaskDeps,
}

impl ExtractionService {
    pub fn new(
        runtime: Arc<WorkflowRuntime>,
        workflows: Arc<dyn WorkflowRepository>,
        ontology: Arc<dyn OntologyStore>,
        deps: TaskDeps,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(workflows.clone(), ontology, deps.clone()));
        Self {
            runtime,
            orchestrator,
            workflows,
            deps,
        }
    }

    /// Start extracting the ontology of `datasource_id` for `project_id`.
    ///
    /// Fails while another extraction for the project is running under a
    /// live lease. Rows of earlier extractions are cleared first.
    pub async fn start_extraction(&self, project_id: Uuid, datasource_id: Uuid) -> Result<Uuid> {
        if let Some(latest) = self
            .workflows
            .get_latest_by_project(project_id, WorkflowKind::Extraction)
            .await?
        {
            if latest.state == WorkflowState::Running
                && latest.lease_is_live(Utc::now(), self.runtime.config().lease_timeout)
            {
                return Err(WorkflowError::ExtractionInProgress);
            }
        }

        let tables = self.deps.schema.list_tables(datasource_id).await?;

        for previous in self
            .workflows
            .list_by_project(project_id, WorkflowKind::Extraction)
            .await?
        {
            let removed = self.deps.entities.delete_by_workflow(previous.id).await?;
            self.workflows.delete(previous.id).await?;
            info!(workflow_id = %previous.id, removed, "Cleared previous extraction");
        }

        let workflow = Workflow::new(WorkflowKind::Extraction, project_id, Some(datasource_id));
        self.workflows.create(&workflow).await?;

        let mut entities = Vec::with_capacity(tables.len() + 1);
        for table in &tables {
            let mut entity = EntityState::new(workflow.id, EntityType::Table, table.qualified_name());
            entity.state_data = serde_json::to_value(TableStateData {
                table_id: Some(table.id),
                ..Default::default()
            })?;
            entities.push(entity);
        }
        entities.push(EntityState::global(workflow.id));
        self.deps.entities.create_batch(&entities).await?;

        self.workflows
            .update_progress(
                workflow.id,
                &WorkflowProgress::new(
                    0,
                    entities.len() as u32,
                    format!("Queued {} tables", tables.len()),
                ),
            )
            .await?;

        let session = match self.runtime.begin(workflow.id).await {
            Ok(session) => session,
            Err(e) => {
                self.runtime
                    .mark_workflow_failed(workflow.id, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        info!(
            workflow_id = %workflow.id,
            %project_id,
            %datasource_id,
            tables = tables.len(),
            "Extraction started"
        );
        self.drive(session, false);
        Ok(workflow.id)
    }

    /// Latest extraction of a project
    pub async fn get_status(&self, project_id: Uuid) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .get_latest_by_project(project_id, WorkflowKind::Extraction)
            .await?)
    }

    pub async fn cancel(&self, workflow_id: Uuid) -> Result<()> {
        self.runtime.cancel(workflow_id).await
    }

    /// Record answers for a table parked in `needs-input` and re-run its
    /// analysis. The driver picks up the completed table on its next poll.
    ///
    /// Only the instance driving the workflow may answer; any other instance
    /// gets `NotOwner` and nothing is written.
    pub async fn answer_questions(
        &self,
        workflow_id: Uuid,
        entity_key: &str,
        answers: Vec<QuestionAnswer>,
    ) -> Result<()> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(workflow_id))?;
        if workflow.state.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "workflow {} is {}",
                workflow_id, workflow.state
            )));
        }

        let ctx = self
            .runtime
            .context(workflow_id)
            .ok_or(WorkflowError::NotOwner(workflow_id))?;
        ctx.check(workflow_id)?;

        let entity = self
            .deps
            .entities
            .get_by_key(workflow_id, EntityType::Table, entity_key)
            .await?
            .ok_or_else(|| WorkflowError::EntityNotFound(entity_key.to_string()))?;
        if entity.status != EntityStatus::NeedsInput {
            return Err(WorkflowError::InvalidState(format!(
                "{} is {}, not awaiting input",
                entity_key, entity.status
            )));
        }

        let mut data: TableStateData = entity.data()?;
        data.answers.extend(answers);
        self.deps
            .entities
            .update_state_data(entity.id, &serde_json::to_value(&data)?)
            .await?;
        self.deps
            .entities
            .update_status(entity.id, EntityStatus::Analyzing, None)
            .await?;

        ctx.check(workflow_id)?;
        AnalyzeTableTask::new(self.deps.clone(), entity.id, entity_key)
            .execute(ctx.token().child_token())
            .await?;

        info!(%workflow_id, table = entity_key, "Answers recorded, table re-analyzed");
        Ok(())
    }

    /// Take over an abandoned extraction. `false` when a peer won the claim.
    pub async fn resume(&self, workflow_id: Uuid) -> Result<bool> {
        let session = match self.runtime.begin(workflow_id).await {
            Ok(session) => session,
            Err(WorkflowError::OwnershipClaimFailed) => return Ok(false),
            Err(e) => return Err(e),
        };
        info!(%workflow_id, "Resuming extraction");
        self.drive(session, true);
        Ok(true)
    }

    fn drive(&self, session: DriveSession, resumed: bool) {
        let orchestrator = self.orchestrator.clone();
        let runtime = self.runtime.clone();
        self.runtime.spawn(session, move |session| async move {
            if resumed {
                runtime.reset_in_flight(session.workflow_id).await?;
            }
            orchestrator
                .run(session.workflow_id, &session.queue, &session.ctx)
                .await
        });
    }
}
