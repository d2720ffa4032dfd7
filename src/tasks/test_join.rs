use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::{checkpoint, TaskDeps};
use crate::error::TaskError;
use crate::models::{ColumnRef, EntityStatus, SchemaColumn, SchemaTable, TestJoinData};
use crate::queue::Task;
use crate::relationships::detection::{review_decision, score};

/// Re-measure a candidate on a larger sample and settle it where possible:
/// `pending` -> `testing` -> `complete`.
///
/// High-confidence candidates are accepted, low-confidence ones rejected;
/// anything in between stays pending and becomes required for review.
pub struct TestJoinTask {
    deps: TaskDeps,
    entity_id: Uuid,
    candidate_id: Uuid,
}

impl TestJoinTask {
    pub fn new(deps: TaskDeps, entity_id: Uuid, candidate_id: Uuid) -> Self {
        Self {
            deps,
            entity_id,
            candidate_id,
        }
    }

    async fn resolve(&self, column_id: Uuid) -> Result<(SchemaTable, SchemaColumn), TaskError> {
        let column = self
            .deps
            .schema
            .get_column(column_id)
            .await?
            .ok_or_else(|| TaskError::InvalidState(format!("column {} no longer exists", column_id)))?;
        let table = self
            .deps
            .schema
            .get_table(column.table_id)
            .await?
            .ok_or_else(|| {
                TaskError::InvalidState(format!("table {} no longer exists", column.table_id))
            })?;
        Ok((table, column))
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        self.deps.transition(self.entity_id, EntityStatus::Testing).await?;

        let mut candidate = self
            .deps
            .candidates
            .get(self.candidate_id)
            .await?
            .ok_or_else(|| {
                TaskError::InvalidState(format!("candidate {} not found", self.candidate_id))
            })?;

        let (source_table, source_column) = self.resolve(candidate.source_column_id).await?;
        let (target_table, target_column) = self.resolve(candidate.target_column_id).await?;
        checkpoint(cancel)?;

        let source_ref = ColumnRef::of(&source_table, &source_column);
        let target_ref = ColumnRef::of(&target_table, &target_column);
        let limit = self.deps.config.join_sample_limit;
        let overlap = self
            .deps
            .retrying(self.entity_id, cancel, "test join", || {
                self.deps
                    .discoverer
                    .check_value_overlap(&source_ref, &target_ref, limit)
            })
            .await?;

        let confidence = score(candidate.detection_method, &overlap);
        let (status, is_required) = review_decision(confidence, &self.deps.config);
        candidate.confidence = confidence;
        candidate.status = status;
        candidate.is_required = is_required;
        candidate.updated_at = Utc::now();
        self.deps.candidates.update(&candidate).await?;

        info!(
            source = %source_ref,
            target = %target_ref,
            confidence,
            status = %status,
            is_required,
            "Join tested"
        );

        let data = TestJoinData {
            candidate_id: Some(candidate.id),
            confidence: Some(confidence),
            matched_rows: overlap.matched_rows,
            sampled_rows: overlap.sampled_rows,
        };
        self.deps.save_data(self.entity_id, &data).await?;
        self.deps.transition(self.entity_id, EntityStatus::Complete).await
    }
}

#[async_trait]
impl Task for TestJoinTask {
    fn name(&self) -> String {
        format!("test join {}", self.candidate_id)
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        let result = self.run(&cancel).await;
        self.deps.record_outcome(self.entity_id, &result).await;
        result
    }
}
