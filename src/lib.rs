//! Ontology workflow engine
//!
//! Drives two long-running, resumable jobs over a relational datasource:
//!
//! - **Extraction**: sample and describe every table, then synthesize a
//!   domain summary once all tables are done.
//! - **Relationship detection**: find foreign-key candidates per column,
//!   test them against real values, and commit reviewed relationships.
//!
//! All progress lives in entity-state rows, so any instance holding the
//! workflow lease can continue a run another instance started.
//!
//! ```ignore
//! let engine = OntologyEngine::new(parts, EngineConfig::from_env());
//! let workflow_id = engine
//!     .extraction()
//!     .start_extraction(project_id, datasource_id)
//!     .await?;
//! ```

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod lease;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod relationships;
pub mod runtime;
pub mod store;
pub mod tasks;
pub mod telemetry;

pub use analyzer::{HeuristicAnalyzer, TableAnalyzer, TableContext};
pub use config::EngineConfig;
pub use engine::{EngineParts, OntologyEngine};
pub use error::{Result, TaskError, TransitionError, WorkflowError};
pub use extraction::ExtractionService;
pub use lease::{DriveContext, OwnershipManager};
pub use orchestrator::Orchestrator;
pub use queue::{Task, TaskQueue};
pub use recovery::WorkflowRecovery;
pub use registry::WorkerRegistry;
pub use relationships::RelationshipService;
pub use runtime::WorkflowRuntime;
