use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::TaskDeps;
use crate::error::TaskError;
use crate::models::{EntityStatus, EntityType, GlobalStateData, TableStateData};
use crate::queue::Task;

/// Summarize the project once every table is complete.
///
/// The driver moves the global entity to `analyzing` before submitting this
/// task; the task only completes it.
pub struct GlobalSynthesisTask {
    deps: TaskDeps,
    workflow_id: Uuid,
    entity_id: Uuid,
}

impl GlobalSynthesisTask {
    pub fn new(deps: TaskDeps, workflow_id: Uuid, entity_id: Uuid) -> Self {
        Self {
            deps,
            workflow_id,
            entity_id,
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        let entities = self.deps.entities.list_by_workflow(self.workflow_id).await?;

        let mut tables = Vec::new();
        for entity in entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Table && e.status == EntityStatus::Complete)
        {
            let data: TableStateData = entity.data()?;
            if let Some(analysis) = data.analysis {
                tables.push((entity.entity_key.clone(), analysis));
            }
        }
        tables.sort_by(|a, b| a.0.cmp(&b.0));

        let summary = self
            .deps
            .retrying(self.entity_id, cancel, "synthesize domain", || {
                self.deps.analyzer.synthesize_domain(&tables)
            })
            .await?;

        info!(
            workflow_id = %self.workflow_id,
            tables = tables.len(),
            domains = summary.domains.len(),
            "Domain synthesized"
        );
        self.deps
            .save_data(self.entity_id, &GlobalStateData { summary: Some(summary) })
            .await?;
        self.deps.transition(self.entity_id, EntityStatus::Complete).await
    }
}

#[async_trait]
impl Task for GlobalSynthesisTask {
    fn name(&self) -> String {
        "global synthesis".to_string()
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        let result = self.run(&cancel).await;
        self.deps.record_outcome(self.entity_id, &result).await;
        result
    }
}
