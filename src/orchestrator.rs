//! Extraction driver loop
//!
//! Each iteration re-derives all work from persisted entity state:
//! - `pending` tables get a scan task, `scanned` tables an analyze task
//! - the global entity starts once every table is complete (fan-in barrier)
//! - with nothing to submit, the loop either finalizes (all entities
//!   terminal) or sleeps for `poll_interval`
//!
//! The loop never retries failed entities and never touches an entity
//! another task is working on. Because nothing lives only in memory, a new
//! owner can pick up where a previous one stopped.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::lease::DriveContext;
use crate::models::{
    EntityState, EntityStatus, EntityType, GlobalStateData, OntologySnapshot, TableStateData,
    Workflow, WorkflowPhase, WorkflowProgress, WorkflowState,
};
use crate::queue::TaskQueue;
use crate::runtime::settle_batch;
use crate::store::{OntologyStore, WorkflowRepository};
use crate::tasks::{AnalyzeTableTask, GlobalSynthesisTask, ScanTableTask, TaskDeps};

/// Classification of one iteration's entity list
#[derive(Debug, Default)]
pub struct WorkPlan<'a> {
    pub scan: Vec<&'a EntityState>,
    pub analyze: Vec<&'a EntityState>,
    pub global: Option<&'a EntityState>,
    pub tables_total: usize,
    pub tables_complete: usize,
    pub tables_failed: usize,
    pub tables_terminal: usize,
    pub awaiting_input: usize,
    pub complete: usize,
    pub terminal: usize,
    pub total: usize,
}

impl<'a> WorkPlan<'a> {
    pub fn classify(entities: &'a [EntityState]) -> Self {
        let mut plan = Self {
            total: entities.len(),
            ..Default::default()
        };

        for entity in entities {
            if entity.status == EntityStatus::Complete {
                plan.complete += 1;
            }
            if entity.status.is_terminal() {
                plan.terminal += 1;
            }

            match entity.entity_type {
                EntityType::Table => {
                    plan.tables_total += 1;
                    match entity.status {
                        EntityStatus::Pending => plan.scan.push(entity),
                        EntityStatus::Scanned => plan.analyze.push(entity),
                        EntityStatus::NeedsInput => plan.awaiting_input += 1,
                        EntityStatus::Complete => plan.tables_complete += 1,
                        EntityStatus::Failed => plan.tables_failed += 1,
                        _ => {}
                    }
                    if entity.status.is_terminal() {
                        plan.tables_terminal += 1;
                    }
                }
                EntityType::Global => plan.global = Some(entity),
                _ => {}
            }
        }

        plan
    }

    fn global_waiting(&self) -> Option<&'a EntityState> {
        self.global
            .filter(|g| matches!(g.status, EntityStatus::Pending | EntityStatus::Scanned))
    }

    /// Global entity, once every table is complete
    pub fn ready_global(&self) -> Option<&'a EntityState> {
        self.global_waiting()
            .filter(|_| self.tables_complete == self.tables_total)
    }

    /// Global entity that can never start: every table is done but some did
    /// not complete
    pub fn blocked_global(&self) -> Option<&'a EntityState> {
        self.global_waiting().filter(|_| {
            self.tables_terminal == self.tables_total && self.tables_complete < self.tables_total
        })
    }

    pub fn all_terminal(&self) -> bool {
        self.terminal == self.total
    }

    pub fn progress(&self) -> WorkflowProgress {
        let global_running = self
            .global
            .is_some_and(|g| g.status == EntityStatus::Analyzing);

        let mut message = if global_running {
            "Synthesizing domain summary".to_string()
        } else if self.awaiting_input > 0 {
            format!(
                "Analyzed {}/{} tables, {} awaiting input",
                self.tables_complete, self.tables_total, self.awaiting_input
            )
        } else {
            format!(
                "Analyzed {}/{} tables",
                self.tables_complete, self.tables_total
            )
        };
        if self.tables_failed > 0 {
            message.push_str(&format!(", {} failed", self.tables_failed));
        }

        WorkflowProgress::new(self.complete as u32, self.total as u32, message)
    }
}

/// Build the published ontology from finished entities, dropping samples,
/// questions and other working data
pub fn build_snapshot(entities: &[EntityState]) -> OntologySnapshot {
    let mut snapshot = OntologySnapshot::default();

    for entity in entities
        .iter()
        .filter(|e| e.status == EntityStatus::Complete)
    {
        match entity.entity_type {
            EntityType::Table => match entity.data::<TableStateData>() {
                Ok(TableStateData {
                    analysis: Some(mut analysis),
                    ..
                }) => {
                    analysis.questions.clear();
                    snapshot.entities.insert(entity.entity_key.clone(), analysis);
                }
                Ok(_) => {}
                Err(e) => warn!(entity = %entity.entity_key, error = %e, "Unreadable table state"),
            },
            EntityType::Global => match entity.data::<GlobalStateData>() {
                Ok(data) => snapshot.domain = data.summary,
                Err(e) => warn!(error = %e, "Unreadable global state"),
            },
            _ => {}
        }
    }

    snapshot
}

pub struct Orchestrator {
    workflows: Arc<dyn WorkflowRepository>,
    ontology: Arc<dyn OntologyStore>,
    deps: TaskDeps,
}

impl Orchestrator {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        ontology: Arc<dyn OntologyStore>,
        deps: TaskDeps,
    ) -> Self {
        Self {
            workflows,
            ontology,
            deps,
        }
    }

    /// Drive an extraction workflow until every entity is terminal
    pub async fn run(&self, workflow_id: Uuid, queue: &TaskQueue, ctx: &DriveContext) -> Result<()> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(workflow_id))?;
        info!(%workflow_id, project_id = %workflow.project_id, "Extraction driver started");

        loop {
            ctx.check(workflow_id)?;

            let entities = self.deps.entities.list_by_workflow(workflow_id).await?;
            let plan = WorkPlan::classify(&entities);
            self.report(workflow_id, &plan).await;

            let mut submitted = 0usize;
            for entity in &plan.scan {
                queue.enqueue(Arc::new(ScanTableTask::new(
                    self.deps.clone(),
                    entity.id,
                    &entity.entity_key,
                )));
                submitted += 1;
            }
            for entity in &plan.analyze {
                queue.enqueue(Arc::new(AnalyzeTableTask::new(
                    self.deps.clone(),
                    entity.id,
                    &entity.entity_key,
                )));
                submitted += 1;
            }

            if let Some(global) = plan.ready_global() {
                self.start_global(workflow_id, global, queue, ctx).await?;
                submitted += 1;
            } else if let Some(global) = plan.blocked_global() {
                let message = format!(
                    "{} of {} tables did not complete",
                    plan.tables_total - plan.tables_complete,
                    plan.tables_total
                );
                warn!(%workflow_id, %message, "Skipping domain synthesis");
                ctx.check(workflow_id)?;
                self.deps
                    .entities
                    .update_status(global.id, EntityStatus::Failed, Some(&message))
                    .await?;
                continue;
            }

            if submitted == 0 {
                if plan.all_terminal() {
                    return self.finalize(&workflow, &entities, ctx).await;
                }
                debug!(%workflow_id, "Nothing ready, waiting");
                tokio::select! {
                    _ = ctx.token().cancelled() => {}
                    _ = tokio::time::sleep(self.deps.config.poll_interval) => {}
                }
                continue;
            }

            debug!(%workflow_id, submitted, "Batch submitted");
            settle_batch(queue.wait(ctx.token()).await, workflow_id, ctx)?;

            let entities = self.deps.entities.list_by_workflow(workflow_id).await?;
            self.report(workflow_id, &WorkPlan::classify(&entities)).await;
        }
    }

    async fn start_global(
        &self,
        workflow_id: Uuid,
        global: &EntityState,
        queue: &TaskQueue,
        ctx: &DriveContext,
    ) -> Result<()> {
        ctx.check(workflow_id)?;
        info!(%workflow_id, "All tables complete, starting domain synthesis");
        for status in [EntityStatus::Scanned, EntityStatus::Analyzing] {
            self.deps.entities.update_status(global.id, status, None).await?;
        }
        queue.enqueue(Arc::new(GlobalSynthesisTask::new(
            self.deps.clone(),
            workflow_id,
            global.id,
        )));
        Ok(())
    }

    async fn report(&self, workflow_id: Uuid, plan: &WorkPlan<'_>) {
        if let Err(e) = self
            .workflows
            .update_progress(workflow_id, &plan.progress())
            .await
        {
            warn!(%workflow_id, error = %e, "Failed to update progress");
        }
    }

    async fn finalize(
        &self,
        workflow: &Workflow,
        entities: &[EntityState],
        ctx: &DriveContext,
    ) -> Result<()> {
        let workflow_id = workflow.id;
        let total = entities.len() as u32;
        let failed = entities
            .iter()
            .filter(|e| e.status == EntityStatus::Failed)
            .count();

        self.workflows
            .update_phase(workflow_id, WorkflowPhase::Completing)
            .await?;

        let snapshot = build_snapshot(entities);
        self.ontology
            .save_ontology(workflow.project_id, &snapshot)
            .await?;

        let message = if failed > 0 {
            format!("Ontology extraction complete, {} entities failed", failed)
        } else {
            "Ontology extraction complete".to_string()
        };
        self.workflows
            .update_progress(workflow_id, &WorkflowProgress::new(total, total, message))
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

        info!(
            %workflow_id,
            tables = snapshot.entities.len(),
            failed,
            "Extraction complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::HeuristicAnalyzer;
    use crate::config::EngineConfig;
    use crate::models::{TableAnalysis, WorkflowKind};
    use crate::store::{EntityStateRepository, MemorySchema, MemoryStore};

    fn entity(wf: Uuid, entity_type: EntityType, key: &str, status: EntityStatus) -> EntityState {
        let mut e = EntityState::new(wf, entity_type, key);
        e.status = status;
        e
    }

    #[test]
    fn test_global_waits_for_every_table() {
        let wf = Uuid::new_v4();
        let entities = vec![
            entity(wf, EntityType::Table, "public.a", EntityStatus::Complete),
            entity(wf, EntityType::Table, "public.b", EntityStatus::Analyzing),
            entity(wf, EntityType::Global, "global", EntityStatus::Pending),
        ];
        let plan = WorkPlan::classify(&entities);
        assert!(plan.ready_global().is_none());
        assert!(plan.blocked_global().is_none());
        assert!(plan.scan.is_empty() && plan.analyze.is_empty());
        assert!(!plan.all_terminal());
    }

    #[test]
    fn test_classify_routes_by_status() {
        let wf = Uuid::new_v4();
        let entities = vec![
            entity(wf, EntityType::Table, "public.a", EntityStatus::Pending),
            entity(wf, EntityType::Table, "public.b", EntityStatus::Scanned),
            entity(wf, EntityType::Table, "public.c", EntityStatus::NeedsInput),
            entity(wf, EntityType::Table, "public.d", EntityStatus::Failed),
            entity(wf, EntityType::Global, "global", EntityStatus::Pending),
        ];
        let plan = WorkPlan::classify(&entities);
        assert_eq!(plan.scan.len(), 1);
        assert_eq!(plan.analyze.len(), 1);
        assert_eq!(plan.awaiting_input, 1);
        assert_eq!(plan.tables_failed, 1);

        let progress = plan.progress();
        assert_eq!(progress.total, 5);
        assert_eq!(progress.current, 0);
        assert!(progress.message.contains("1 awaiting input"));
        assert!(progress.message.contains("1 failed"));
    }

    #[test]
    fn test_failed_table_blocks_global() {
        let wf = Uuid::new_v4();
        let entities = vec![
            entity(wf, EntityType::Table, "public.a", EntityStatus::Complete),
            entity(wf, EntityType::Table, "public.b", EntityStatus::Failed),
            entity(wf, EntityType::Global, "global", EntityStatus::Pending),
        ];
        let plan = WorkPlan::classify(&entities);
        assert!(plan.ready_global().is_none());
        assert!(plan.blocked_global().is_some());
    }

    #[test]
    fn test_no_tables_is_ready_for_synthesis() {
        let wf = Uuid::new_v4();
        let entities = vec![entity(wf, EntityType::Global, "global", EntityStatus::Pending)];
        assert!(WorkPlan::classify(&entities).ready_global().is_some());
    }

    #[test]
    fn test_snapshot_strips_working_data() {
        let wf = Uuid::new_v4();
        let mut table = entity(wf, EntityType::Table, "public.orders", EntityStatus::Complete);
        table.state_data = serde_json::to_value(TableStateData {
            table_id: Some(Uuid::new_v4()),
            samples: vec![Default::default()],
            analysis: Some(TableAnalysis {
                business_name: "Order".into(),
                questions: vec!["left over".into()],
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        let failed = entity(wf, EntityType::Table, "public.broken", EntityStatus::Failed);

        let snapshot = build_snapshot(&[table, failed]);
        assert_eq!(snapshot.entities.len(), 1);
        let analysis = &snapshot.entities["public.orders"];
        assert_eq!(analysis.business_name, "Order");
        assert!(analysis.questions.is_empty());
        assert!(snapshot.domain.is_none());
    }

    fn memory_orchestrator() -> (Arc<MemoryStore>, Orchestrator) {
        let store = Arc::new(MemoryStore::new());
        let schema = Arc::new(MemorySchema::new());
        let deps = TaskDeps {
            entities: store.clone(),
            candidates: store.clone(),
            schema: schema.clone(),
            discoverer: schema,
            analyzer: Arc::new(HeuristicAnalyzer::new()),
            config: EngineConfig::default(),
        };
        let orchestrator = Orchestrator::new(store.clone(), store.clone(), deps);
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_completion_does_not_overwrite_cancellation() {
        let (store, orchestrator) = memory_orchestrator();
        let wf = Workflow::new(WorkflowKind::Extraction, Uuid::new_v4(), None);
        WorkflowRepository::create(store.as_ref(), &wf).await.unwrap();
        let mut global = EntityState::global(wf.id);
        global.status = EntityStatus::Complete;
        store.create_batch(&[global]).await.unwrap();

        // Cancelled elsewhere; this driver's context never fired
        store
            .update_state(wf.id, WorkflowState::Cancelled, None)
            .await
            .unwrap();

        let ctx = DriveContext::new();
        let queue = TaskQueue::new(1, ctx.token().child_token());
        let err = orchestrator.run(wf.id, &queue, &ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));

        let stored = WorkflowRepository::get(store.as_ref(), wf.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, WorkflowState::Cancelled);
    }

    #[tokio::test]
    async fn test_lost_lease_submits_nothing() {
        let (store, orchestrator) = memory_orchestrator();
        let wf = Workflow::new(WorkflowKind::Extraction, Uuid::new_v4(), None);
        WorkflowRepository::create(store.as_ref(), &wf).await.unwrap();
        let table = EntityState::new(wf.id, EntityType::Table, "public.users");
        store
            .create_batch(&[table.clone(), EntityState::global(wf.id)])
            .await
            .unwrap();

        let ctx = DriveContext::new();
        let queue = TaskQueue::new(2, ctx.token().child_token());
        ctx.mark_lease_lost();

        let err = orchestrator.run(wf.id, &queue, &ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::OwnershipLost(id) if id == wf.id));
        assert!(queue.is_empty());
        assert!(queue.snapshot().is_empty());

        let untouched = EntityStateRepository::get(store.as_ref(), table.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, EntityStatus::Pending);
    }
}
