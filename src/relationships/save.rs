//! Committing reviewed relationships
//!
//! The save is all-or-nothing. It is refused while required candidates await
//! review, it fails on the first candidate whose columns no longer resolve,
//! and only then upserts the whole batch.

use std::collections::HashMap;

use tracing::info;
use uuid::Uuid;

use super::RelationshipService;
use crate::error::{Result, WorkflowError};
use crate::models::{CandidateStatus, RelationshipCandidate, SchemaRelationship};

/// An accepted candidate with both columns resolved to their tables
#[derive(Debug, Clone)]
pub struct ResolvedCandidate {
    pub candidate: RelationshipCandidate,
    pub source_table_id: Uuid,
    pub target_table_id: Uuid,
}

/// Keep one candidate per (source table, target table) pair.
///
/// The longest description wins; on equal length (including both empty)
/// the earliest candidate is kept. Survivors stay in first-seen order.
pub fn dedupe_by_table_pair(candidates: Vec<ResolvedCandidate>) -> Vec<ResolvedCandidate> {
    let mut survivors: Vec<ResolvedCandidate> = Vec::with_capacity(candidates.len());
    let mut slots: HashMap<(Uuid, Uuid), usize> = HashMap::new();

    for resolved in candidates {
        let key = (resolved.source_table_id, resolved.target_table_id);
        match slots.get(&key) {
            Some(&slot) => {
                if resolved.candidate.description_len() > survivors[slot].candidate.description_len() {
                    survivors[slot] = resolved;
                }
            }
            None => {
                slots.insert(key, survivors.len());
                survivors.push(resolved);
            }
        }
    }

    survivors
}

impl RelationshipService {
    /// Commit the accepted candidates of a detection; returns how many
    /// relationships were written
    pub async fn save_relationships(&self, workflow_id: Uuid) -> Result<usize> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(workflow_id))?;

        let required = self.deps.candidates.count_required_pending(workflow_id).await?;
        if required > 0 {
            return Err(WorkflowError::ReviewRequired(required));
        }

        let datasource_id = workflow
            .datasource_id
            .ok_or(WorkflowError::MissingDatasource)?;

        let accepted = self
            .deps
            .candidates
            .get_by_workflow_and_status(workflow_id, CandidateStatus::Accepted)
            .await?;

        let mut resolved = Vec::with_capacity(accepted.len());
        for candidate in accepted {
            let source = self
                .deps
                .schema
                .get_column(candidate.source_column_id)
                .await?
                .ok_or(WorkflowError::ColumnNotFound(candidate.source_column_id))?;
            let target = self
                .deps
                .schema
                .get_column(candidate.target_column_id)
                .await?
                .ok_or(WorkflowError::ColumnNotFound(candidate.target_column_id))?;
            resolved.push(ResolvedCandidate {
                source_table_id: source.table_id,
                target_table_id: target.table_id,
                candidate,
            });
        }

        let considered = resolved.len();
        let relationships: Vec<SchemaRelationship> = dedupe_by_table_pair(resolved)
            .into_iter()
            .map(|r| SchemaRelationship {
                datasource_id,
                source_table_id: r.source_table_id,
                source_column_id: r.candidate.source_column_id,
                target_table_id: r.target_table_id,
                target_column_id: r.candidate.target_column_id,
                detection_method: r.candidate.detection_method.to_string(),
                confidence: r.candidate.confidence,
                description: r.candidate.description,
            })
            .collect();

        self.deps.schema.upsert_relationships(&relationships).await?;

        info!(
            %workflow_id,
            accepted = considered,
            saved = relationships.len(),
            "Relationships saved"
        );
        Ok(relationships.len())
    }
}
