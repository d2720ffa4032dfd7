//! Wiring
//!
//! `OntologyEngine` assembles the runtime and command services over one set
//! of stores and collaborators. One engine per process; every engine gets
//! its own owner id for the lease protocol.

use std::sync::Arc;

use uuid::Uuid;

use crate::analyzer::TableAnalyzer;
use crate::config::EngineConfig;
use crate::extraction::ExtractionService;
use crate::recovery::WorkflowRecovery;
use crate::relationships::RelationshipService;
use crate::runtime::WorkflowRuntime;
use crate::store::{
    CandidateRepository, EntityStateRepository, MemorySchema, MemoryStore, OntologyStore,
    SchemaDiscoverer, SchemaStore, WorkflowRepository,
};
use crate::tasks::TaskDeps;

/// Stores and collaborators an engine runs on
#[derive(Clone)]
pub struct EngineParts {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub entities: Arc<dyn EntityStateRepository>,
    pub candidates: Arc<dyn CandidateRepository>,
    pub ontology: Arc<dyn OntologyStore>,
    pub schema: Arc<dyn SchemaStore>,
    pub discoverer: Arc<dyn SchemaDiscoverer>,
    pub analyzer: Arc<dyn TableAnalyzer>,
}

impl EngineParts {
    /// Everything in memory; `schema` doubles as the datasource adapter
    pub fn in_memory(
        store: Arc<MemoryStore>,
        schema: Arc<MemorySchema>,
        analyzer: Arc<dyn TableAnalyzer>,
    ) -> Self {
        Self {
            workflows: store.clone(),
            entities: store.clone(),
            candidates: store.clone(),
            ontology: store,
            schema: schema.clone(),
            discoverer: schema,
            analyzer,
        }
    }
}

pub struct OntologyEngine {
    runtime: Arc<WorkflowRuntime>,
    extraction: ExtractionService,
    relationships: RelationshipService,
    recovery: Arc<WorkflowRecovery>,
    config: EngineConfig,
}

impl OntologyEngine {
    pub fn new(parts: EngineParts, config: EngineConfig) -> Self {
        Self::with_owner(parts, config, Uuid::new_v4())
    }

    pub fn with_owner(parts: EngineParts, config: EngineConfig, owner_id: Uuid) -> Self {
        let runtime = Arc::new(WorkflowRuntime::new(
            parts.workflows.clone(),
            parts.entities.clone(),
            owner_id,
            config.clone(),
        ));
        let deps = TaskDeps {
            entities: parts.entities,
            candidates: parts.candidates,
            schema: parts.schema,
            discoverer: parts.discoverer,
            analyzer: parts.analyzer,
            config: config.clone(),
        };
        let extraction = ExtractionService::new(
            runtime.clone(),
            parts.workflows.clone(),
            parts.ontology,
            deps.clone(),
        );
        let relationships =
            RelationshipService::new(runtime.clone(), parts.workflows.clone(), deps);
        let recovery = Arc::new(WorkflowRecovery::new(
            parts.workflows,
            extraction.clone(),
            relationships.clone(),
            config.lease_timeout,
        ));

        Self {
            runtime,
            extraction,
            relationships,
            recovery,
            config,
        }
    }

    pub fn owner_id(&self) -> Uuid {
        self.runtime.owner_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<WorkflowRuntime> {
        &self.runtime
    }

    pub fn extraction(&self) -> &ExtractionService {
        &self.extraction
    }

    pub fn relationships(&self) -> &RelationshipService {
        &self.relationships
    }

    pub fn recovery(&self) -> &Arc<WorkflowRecovery> {
        &self.recovery
    }

    /// Cancel local drivers and stop background workers
    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
    }
}
