//! Shared harness for engine integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ontology_engine::analyzer::{HeuristicAnalyzer, TableAnalyzer, TableContext};
use ontology_engine::models::{
    ColumnRef, DomainSummary, SchemaColumn, SchemaTable, TableAnalysis, Workflow, WorkflowState,
};
use ontology_engine::store::{MemorySchema, MemoryStore, WorkflowRepository};
use ontology_engine::{EngineConfig, EngineParts, OntologyEngine};
use uuid::Uuid;

/// Short timings so whole workflows finish in milliseconds
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(10),
        lease_timeout: Duration::from_millis(400),
        heartbeat_interval: Duration::from_millis(50),
        max_concurrency: 4,
        task_max_retries: 2,
        task_retry_backoff: Duration::from_millis(5),
        worker_stop_timeout: Duration::from_millis(200),
        task_queue_flush_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub schema: Arc<MemorySchema>,
    pub engine: OntologyEngine,
    pub project_id: Uuid,
    pub datasource_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_analyzer(Arc::new(HeuristicAnalyzer::new()))
    }

    pub fn with_analyzer(analyzer: Arc<dyn TableAnalyzer>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let schema = Arc::new(MemorySchema::new());
        let engine = OntologyEngine::new(
            EngineParts::in_memory(store.clone(), schema.clone(), analyzer),
            fast_config(),
        );
        Self {
            store,
            schema,
            engine,
            project_id: Uuid::new_v4(),
            datasource_id: Uuid::new_v4(),
        }
    }

    /// A second engine instance sharing this harness's stores
    pub fn peer(&self, analyzer: Arc<dyn TableAnalyzer>) -> OntologyEngine {
        OntologyEngine::new(
            EngineParts::in_memory(self.store.clone(), self.schema.clone(), analyzer),
            fast_config(),
        )
    }

    pub fn table(&self, name: &str) -> SchemaTable {
        self.schema.add_table(self.datasource_id, "public", name)
    }

    pub fn key(&self, table: &SchemaTable) -> SchemaColumn {
        self.schema.add_column(
            self.datasource_id,
            SchemaColumn::new(table.id, "id", "uuid").primary_key(),
        )
    }

    pub fn column(&self, table: &SchemaTable, name: &str) -> SchemaColumn {
        self.schema
            .add_column(self.datasource_id, SchemaColumn::new(table.id, name, "text"))
    }

    pub fn values(&self, table: &SchemaTable, column: &str, values: &[&str]) {
        self.schema.set_values(
            ColumnRef::new(&table.schema_name, &table.table_name, column),
            values.iter().copied(),
        );
    }

    pub async fn workflow(&self, id: Uuid) -> Workflow {
        WorkflowRepository::get(self.store.as_ref(), id)
            .await
            .unwrap()
            .expect("workflow exists")
    }

    /// Poll until the workflow reaches `state`
    pub async fn wait_for_state(&self, id: Uuid, state: WorkflowState) -> Workflow {
        let store = self.store.clone();
        eventually(Duration::from_secs(5), || {
            let store = store.clone();
            async move {
                WorkflowRepository::get(store.as_ref(), id)
                    .await
                    .unwrap()
                    .filter(|w| w.state == state)
            }
        })
        .await
        .unwrap_or_else(|| panic!("workflow {} never reached {}", id, state))
    }

    /// Poll until this engine stops driving the workflow
    pub async fn wait_until_idle(&self, engine: &OntologyEngine, id: Uuid) {
        let runtime = engine.runtime().clone();
        let idle = eventually(Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move { (!runtime.is_driving(id)).then_some(()) }
        })
        .await;
        assert!(idle.is_some(), "engine still driving {}", id);
    }
}

/// Call `poll` every 10ms until it yields a value or `timeout` elapses
pub async fn eventually<T, F, Fut>(timeout: Duration, mut poll: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = poll().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Analyzer that never returns, for holding a workflow mid-task
pub struct StalledAnalyzer;

#[async_trait]
impl TableAnalyzer for StalledAnalyzer {
    async fn analyze_table(&self, _ctx: &TableContext) -> anyhow::Result<TableAnalysis> {
        std::future::pending().await
    }

    async fn synthesize_domain(
        &self,
        _tables: &[(String, TableAnalysis)],
    ) -> anyhow::Result<DomainSummary> {
        std::future::pending().await
    }
}
