//! Persisted and exchanged data types

pub mod candidate;
pub mod entity_state;
pub mod ontology;
pub mod schema;
pub mod workflow;

pub use candidate::{
    CandidateStatus, ColumnScanData, DetectionMethod, RelationshipCandidate, TestJoinData,
};
pub use entity_state::{EntityState, EntityStatus, EntityType, GLOBAL_ENTITY_KEY};
pub use ontology::{
    ColumnSample, DomainSummary, GlobalStateData, OntologySnapshot, QuestionAnswer,
    TableAnalysis, TableStateData,
};
pub use schema::{ColumnRef, SchemaColumn, SchemaRelationship, SchemaTable, ValueOverlap};
pub use workflow::{
    QueuedTaskStatus, TaskSnapshot, Workflow, WorkflowKind, WorkflowPhase, WorkflowProgress,
    WorkflowState,
};
