use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{checkpoint, TaskDeps};
use crate::error::TaskError;
use crate::models::{ColumnRef, ColumnSample, EntityStatus, TableStateData};
use crate::queue::Task;

/// Sample every column of one table: `pending` -> `scanning` -> `scanned`
pub struct ScanTableTask {
    deps: TaskDeps,
    entity_id: Uuid,
    entity_key: String,
}

impl ScanTableTask {
    pub fn new(deps: TaskDeps, entity_id: Uuid, entity_key: impl Into<String>) -> Self {
        Self {
            deps,
            entity_id,
            entity_key: entity_key.into(),
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        let entity = self.deps.load_entity(self.entity_id).await?;
        let mut data: TableStateData = entity.data()?;
        let table_id = data
            .table_id
            .ok_or_else(|| TaskError::InvalidState(format!("{} has no table id", self.entity_key)))?;

        self.deps.transition(self.entity_id, EntityStatus::Scanning).await?;

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

        let limit = self.deps.config.table_sample_limit;
        let mut samples = Vec::with_capacity(columns.len());
        for column in &columns {
            checkpoint(cancel)?;
            let column_ref = ColumnRef::of(&table, column);
            let values = self
                .deps
                .retrying(self.entity_id, cancel, "sample values", || {
                    self.deps.discoverer.sample_values(&column_ref, limit)
                })
                .await?;
            samples.push(ColumnSample {
                column_name: column.column_name.clone(),
                data_type: column.data_type.clone(),
                values,
            });
        }

        debug!(table = %self.entity_key, columns = samples.len(), "Table scanned");
        data.samples = samples;
        self.deps.save_data(self.entity_id, &data).await?;
        self.deps.transition(self.entity_id, EntityStatus::Scanned).await
    }
}

#[async_trait]
impl Task for ScanTableTask {
    fn name(&self) -> String {
        format!("scan {}", self.entity_key)
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        let result = self.run(&cancel).await;
        self.deps.record_outcome(self.entity_id, &result).await;
        result
    }
}
