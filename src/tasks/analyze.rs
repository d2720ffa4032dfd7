use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::TaskDeps;
use crate::analyzer::TableContext;
use crate::error::TaskError;
use crate::models::{EntityStatus, TableStateData};
use crate::queue::Task;

/// Describe one scanned table.
///
/// Ends in `complete`, or in `needs-input` when the analyzer asks questions
/// that have not been answered yet. Re-running after answers are recorded
/// always completes.
pub struct AnalyzeTableTask {
    deps: TaskDeps,
    entity_id: Uuid,
    entity_key: String,
}

impl AnalyzeTableTask {
    pub fn new(deps: TaskDeps, entity_id: Uuid, entity_key: impl Into<String>) -> Self {
        Self {
            deps,
            entity_id,
            entity_key: entity_key.into(),
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        self.deps.transition(self.entity_id, EntityStatus::Analyzing).await?;

        let entity = self.deps.load_entity(self.entity_id).await?;
        let mut data: TableStateData = entity.data()?;
        let table_id = data
            .table_id
            .ok_or_else(|| TaskError::InvalidState(format!("{} has no table id", self.entity_key)))?;

        let table = self
            .deps
            .retrying(self.entity_id, cancel, "load table", || self.deps.schema.get_table(table_id))
            .await?
            .ok_or_else(|| TaskError::InvalidState(format!("table {} no longer exists", table_id)))?;
        let columns = self
            .deps
            .retrying(self.entity_id, cancel, "list columns", || {
                self.deps.schema.list_columns_by_table(table_id)
            })
            .await?;

        let ctx = TableContext {
            table,
            columns,
            samples: data.samples.clone(),
            answers: data.answers.clone(),
        };
        let mut analysis = self
            .deps
            .retrying(self.entity_id, cancel, "analyze table", || {
                self.deps.analyzer.analyze_table(&ctx)
            })
            .await?;

        if !analysis.questions.is_empty() && data.answers.is_empty() {
            info!(
                table = %self.entity_key,
                questions = analysis.questions.len(),
                "Table analysis needs input"
            );
            data.questions = std::mem::take(&mut analysis.questions);
            data.analysis = Some(analysis);
            self.deps.save_data(self.entity_id, &data).await?;
            return self.deps.transition(self.entity_id, EntityStatus::NeedsInput).await;
        }

        analysis.questions.clear();
        data.questions.clear();
        data.analysis = Some(analysis);
        self.deps.save_data(self.entity_id, &data).await?;
        debug!(table = %self.entity_key, "Table analyzed");
        self.deps.transition(self.entity_id, EntityStatus::Complete).await
    }
}

#[async_trait]
impl Task for AnalyzeTableTask {
    fn name(&self) -> String {
        format!("analyze {}", self.entity_key)
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        let result = self.run(&cancel).await;
        self.deps.record_outcome(self.entity_id, &result).await;
        result
    }
}
