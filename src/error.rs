//! Error types for the ontology workflow engine
//!
//! `WorkflowError` is what callers of the engine see. `TaskError` stays
//! inside the scheduler: a task failure is recorded on its entity and only
//! logged by the driver loop.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{EntityStatus, EntityType};

/// Engine-level errors
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("lost ownership of workflow {0}")]
    OwnershipLost(Uuid),

    #[error("failed to claim workflow ownership")]
    OwnershipClaimFailed,

    #[error("workflow {0} is not driven by this instance")]
    NotOwner(Uuid),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("relationship detection already in progress for this datasource")]
    DetectionInProgress,

    #[error("ontology extraction already in progress for this project")]
    ExtractionInProgress,

    #[error("cannot save: {0} relationships require user review")]
    ReviewRequired(usize),

    #[error("workflow has no datasource ID")]
    MissingDatasource,

    #[error("column not found: {0}")]
    ColumnNotFound(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("State data error: {0}")]
    StateData(#[from] serde_json::Error),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

impl WorkflowError {
    /// Errors that end the driver loop without touching the workflow record
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::OwnershipLost(_) | Self::Task(TaskError::Cancelled)
        )
    }
}

/// Per-task errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),

    #[error("task cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("State data error: {0}")]
    StateData(#[from] serde_json::Error),

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// A status write that would move an entity backward
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {entity_type} transition for {entity_id}: {from} -> {to}")]
pub struct TransitionError {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub from: EntityStatus,
    pub to: EntityStatus,
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_visible_messages() {
        assert_eq!(
            WorkflowError::ReviewRequired(5).to_string(),
            "cannot save: 5 relationships require user review"
        );
        assert_eq!(
            WorkflowError::MissingDatasource.to_string(),
            "workflow has no datasource ID"
        );
        assert_eq!(
            WorkflowError::DetectionInProgress.to_string(),
            "relationship detection already in progress for this datasource"
        );
    }

    #[test]
    fn test_interruptions() {
        assert!(WorkflowError::Cancelled.is_interruption());
        assert!(WorkflowError::OwnershipLost(Uuid::new_v4()).is_interruption());
        assert!(!WorkflowError::MissingDatasource.is_interruption());
        assert!(!WorkflowError::NotOwner(Uuid::new_v4()).is_interruption());
    }
}
