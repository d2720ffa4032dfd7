use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{checkpoint, TaskDeps};
use crate::error::TaskError;
use crate::models::{
    ColumnRef, ColumnScanData, DetectionMethod, EntityStatus, RelationshipCandidate, SchemaColumn,
    SchemaTable,
};
use crate::queue::Task;
use crate::relationships::detection::{detect_fk_target, refine_method, score, SchemaIndex};

/// Look for the table one column references and record a candidate:
/// `pending` -> `scanning` -> `complete`.
///
/// A column with no plausible target, or a naming match whose values never
/// appear in the target, completes without a candidate.
pub struct ColumnScanTask {
    deps: TaskDeps,
    workflow_id: Uuid,
    entity_id: Uuid,
    table: SchemaTable,
    column: SchemaColumn,
    index: Arc<SchemaIndex>,
}

impl ColumnScanTask {
    pub fn new(
        deps: TaskDeps,
        workflow_id: Uuid,
        entity_id: Uuid,
        table: SchemaTable,
        column: SchemaColumn,
        index: Arc<SchemaIndex>,
    ) -> Self {
        Self {
            deps,
            workflow_id,
            entity_id,
            table,
            column,
            index,
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        self.deps.transition(self.entity_id, EntityStatus::Scanning).await?;

        let mut data = ColumnScanData {
            column_id: Some(self.column.id),
            ..Default::default()
        };

        let Some(target) = detect_fk_target(&self.index, &self.table, &self.column) else {
            self.deps.save_data(self.entity_id, &data).await?;
            return self.deps.transition(self.entity_id, EntityStatus::Complete).await;
        };

        checkpoint(cancel)?;
        let source_ref = ColumnRef::of(&self.table, &self.column);
        let target_ref = ColumnRef::of(&target.table, &target.column);
        let limit = self.deps.config.scan_sample_limit;
        let overlap = self
            .deps
            .retrying(self.entity_id, cancel, "check value overlap", || {
                self.deps
                    .discoverer
                    .check_value_overlap(&source_ref, &target_ref, limit)
            })
            .await?;

        data.target = Some(target_ref.to_string());
        data.match_ratio = Some(overlap.match_ratio());

        let method = refine_method(target.method, &overlap);
        if method == DetectionMethod::NameHeuristic && overlap.matched_rows == 0 {
            debug!(column = %source_ref, target = %target_ref, "Name match without shared values");
            self.deps.save_data(self.entity_id, &data).await?;
            return self.deps.transition(self.entity_id, EntityStatus::Complete).await;
        }

        checkpoint(cancel)?;
        let existing = self
            .deps
            .candidates
            .get_by_workflow(self.workflow_id)
            .await?
            .into_iter()
            .find(|c| c.source_column_id == self.column.id && c.target_column_id == target.column.id);

        let candidate_id = match existing {
            Some(candidate) => candidate.id,
            None => {
                let candidate = RelationshipCandidate::new(
                    self.workflow_id,
                    self.column.id,
                    target.column.id,
                    method,
                    score(method, &overlap),
                )
                .with_description(format!(
                    "{}.{} references {}.{}",
                    self.table.table_name,
                    self.column.column_name,
                    target.table.table_name,
                    target.column.column_name
                ));
                self.deps.candidates.create(&candidate).await?;
                debug!(
                    column = %source_ref,
                    target = %target_ref,
                    method = %method,
                    confidence = candidate.confidence,
                    "Relationship candidate recorded"
                );
                candidate.id
            }
        };

        data.candidate_id = Some(candidate_id);
        self.deps.save_data(self.entity_id, &data).await?;
        self.deps.transition(self.entity_id, EntityStatus::Complete).await
    }
}

#[async_trait]
impl Task for ColumnScanTask {
    fn name(&self) -> String {
        format!(
            "scan column {}.{}",
            self.table.qualified_name(),
            self.column.column_name
        )
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        let result = self.run(&cancel).await;
        self.deps.record_outcome(self.entity_id, &result).await;
        result
    }
}
