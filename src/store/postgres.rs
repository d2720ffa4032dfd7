//! Postgres backend
//!
//! Engine tables live in the `ontology` schema (see `migrations/`). Enums are
//! stored as their string forms; progress, task queue and entity payloads as
//! JSONB. The lease claim is a single conditional `UPDATE ... RETURNING`, so
//! concurrent claimants serialize on the row lock.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    CandidateRepository, EntityStateRepository, OntologyStore, SchemaDiscoverer, SchemaStore,
    WorkflowRepository,
};
use crate::error::TransitionError;
use crate::models::{
    CandidateStatus, ColumnRef, EntityState, EntityStatus, EntityType, OntologySnapshot,
    RelationshipCandidate, SchemaColumn, SchemaRelationship, SchemaTable, TaskSnapshot,
    ValueOverlap, Workflow, WorkflowKind, WorkflowPhase, WorkflowProgress, WorkflowState,
};

/// Pool settings, read from `DATABASE_URL` / `DATABASE_POOL_SIZE`
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/ontology".to_string()),
            max_connections: std::env::var("DATABASE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

impl DatabaseConfig {
    /// Like `default`, but loads a `.env` file first when one exists
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::default()
    }

    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        info!(
            "Connecting to database: {}",
            mask_database_url(&self.database_url)
        );

        let mut pool_options = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connection_timeout);

        if let Some(idle_timeout) = self.idle_timeout {
            pool_options = pool_options.idle_timeout(idle_timeout);
        }
        if let Some(max_lifetime) = self.max_lifetime {
            pool_options = pool_options.max_lifetime(max_lifetime);
        }

        pool_options
            .connect(&self.database_url)
            .await
            .map_err(|e| {
                warn!("Failed to connect to database: {}", e);
                e
            })
    }
}

fn mask_database_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let mut masked = parsed.clone();
        if parsed.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else {
        match (url.get(..10), url.get(url.len().saturating_sub(10)..)) {
            (Some(head), Some(tail)) if url.len() > 20 => format!("{}***{}", head, tail),
            _ => "***".to_string(),
        }
    }
}

fn parse_enum<T>(column: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| anyhow!("bad {} value: {}", column, e))
}

fn lease_millis(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, FromRow)]
struct WorkflowRow {
    workflow_id: Uuid,
    kind: String,
    project_id: Uuid,
    datasource_id: Option<Uuid>,
    phase: String,
    state: String,
    progress: JsonValue,
    task_queue: JsonValue,
    owner_id: Option<Uuid>,
    last_heartbeat: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = anyhow::Error;

    fn try_from(row: WorkflowRow) -> Result<Self> {
        Ok(Self {
            id: row.workflow_id,
            kind: parse_enum("kind", &row.kind)?,
            project_id: row.project_id,
            datasource_id: row.datasource_id,
            phase: parse_enum("phase", &row.phase)?,
            state: parse_enum("state", &row.state)?,
            progress: serde_json::from_value(row.progress).unwrap_or_default(),
            task_queue: serde_json::from_value(row.task_queue).unwrap_or_default(),
            owner_id: row.owner_id,
            last_heartbeat: row.last_heartbeat,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EntityRow {
    entity_state_id: Uuid,
    workflow_id: Uuid,
    entity_type: String,
    entity_key: String,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    state_data: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntityRow> for EntityState {
    type Error = anyhow::Error;

    fn try_from(row: EntityRow) -> Result<Self> {
        Ok(Self {
            id: row.entity_state_id,
            workflow_id: row.workflow_id,
            entity_type: parse_enum("entity_type", &row.entity_type)?,
            entity_key: row.entity_key,
            status: parse_enum("status", &row.status)?,
            retry_count: row.retry_count,
            last_error: row.last_error,
            state_data: row.state_data,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CandidateRow {
    candidate_id: Uuid,
    workflow_id: Uuid,
    source_column_id: Uuid,
    target_column_id: Uuid,
    detection_method: String,
    confidence: f64,
    is_required: bool,
    status: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CandidateRow> for RelationshipCandidate {
    type Error = anyhow::Error;

    fn try_from(row: CandidateRow) -> Result<Self> {
        Ok(Self {
            id: row.candidate_id,
            workflow_id: row.workflow_id,
            source_column_id: row.source_column_id,
            target_column_id: row.target_column_id,
            detection_method: parse_enum("detection_method", &row.detection_method)?,
            confidence: row.confidence,
            is_required: row.is_required,
            status: parse_enum("status", &row.status)?,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TableRow {
    table_id: Uuid,
    datasource_id: Uuid,
    schema_name: String,
    table_name: String,
    row_count: Option<i64>,
}

impl From<TableRow> for SchemaTable {
    fn from(row: TableRow) -> Self {
        Self {
            id: row.table_id,
            datasource_id: row.datasource_id,
            schema_name: row.schema_name,
            table_name: row.table_name,
            row_count: row.row_count,
        }
    }
}

#[derive(Debug, FromRow)]
struct ColumnRow {
    column_id: Uuid,
    table_id: Uuid,
    column_name: String,
    data_type: String,
    is_primary_key: bool,
    fk_table: Option<String>,
    fk_column: Option<String>,
}

impl From<ColumnRow> for SchemaColumn {
    fn from(row: ColumnRow) -> Self {
        Self {
            id: row.column_id,
            table_id: row.table_id,
            column_name: row.column_name,
            data_type: row.data_type,
            is_primary_key: row.is_primary_key,
            fk_table: row.fk_table,
            fk_column: row.fk_column,
        }
    }
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

const WORKFLOW_COLUMNS: &str = "workflow_id, kind, project_id, datasource_id, phase, state, \
     progress, task_queue, owner_id, last_heartbeat, error_message, created_at, updated_at";

const ENTITY_COLUMNS: &str = "entity_state_id, workflow_id, entity_type, entity_key, status, \
     retry_count, last_error, state_data, created_at, updated_at";

const CANDIDATE_COLUMNS: &str = "candidate_id, workflow_id, source_column_id, target_column_id, \
     detection_method, confidence, is_required, status, description, created_at, updated_at";

// ============================================================================
// Engine store
// ============================================================================

/// Workflow, entity, candidate and ontology persistence
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_workflows(&self, sql: &str, binds: WorkflowFilter) -> Result<Vec<Workflow>> {
        let query = sqlx::query_as::<_, WorkflowRow>(sql);
        let rows = match binds {
            WorkflowFilter::ProjectKind(project_id, kind) => {
                query.bind(project_id).bind(kind.as_str())
            }
            WorkflowFilter::DatasourceKind(datasource_id, kind) => {
                query.bind(datasource_id).bind(kind.as_str())
            }
            WorkflowFilter::State(state) => query.bind(state.as_str()),
        }
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workflows")?;
        collect(rows)
    }
}

enum WorkflowFilter {
    ProjectKind(Uuid, WorkflowKind),
    DatasourceKind(Uuid, WorkflowKind),
    State(WorkflowState),
}

#[async_trait]
impl WorkflowRepository for PgStore {
    async fn create(&self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ontology.workflows
                (workflow_id, kind, project_id, datasource_id, phase, state,
                 progress, task_queue, owner_id, last_heartbeat, error_message,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.kind.as_str())
        .bind(workflow.project_id)
        .bind(workflow.datasource_id)
        .bind(workflow.phase.as_str())
        .bind(workflow.state.as_str())
        .bind(serde_json::to_value(&workflow.progress)?)
        .bind(serde_json::to_value(&workflow.task_queue)?)
        .bind(workflow.owner_id)
        .bind(workflow.last_heartbeat)
        .bind(&workflow.error_message)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create workflow")?;

        debug!(workflow_id = %workflow.id, kind = %workflow.kind, "Created workflow");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workflow>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflows WHERE workflow_id = $1",
            WORKFLOW_COLUMNS
        );
        let row = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get workflow")?;
        row.map(Workflow::try_from).transpose()
    }

    async fn get_latest_by_project(
        &self,
        project_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Option<Workflow>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflows WHERE project_id = $1 AND kind = $2 \
             ORDER BY created_at DESC LIMIT 1",
            WORKFLOW_COLUMNS
        );
        Ok(self
            .fetch_workflows(&sql, WorkflowFilter::ProjectKind(project_id, kind))
            .await?
            .into_iter()
            .next())
    }

    async fn get_latest_by_datasource(
        &self,
        datasource_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Option<Workflow>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflows WHERE datasource_id = $1 AND kind = $2 \
             ORDER BY created_at DESC LIMIT 1",
            WORKFLOW_COLUMNS
        );
        Ok(self
            .fetch_workflows(&sql, WorkflowFilter::DatasourceKind(datasource_id, kind))
            .await?
            .into_iter()
            .next())
    }

    async fn list_by_project(
        &self,
        project_id: Uuid,
        kind: WorkflowKind,
    ) -> Result<Vec<Workflow>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflows WHERE project_id = $1 AND kind = $2 \
             ORDER BY created_at",
            WORKFLOW_COLUMNS
        );
        self.fetch_workflows(&sql, WorkflowFilter::ProjectKind(project_id, kind))
            .await
    }

    async fn list_by_state(&self, state: WorkflowState) -> Result<Vec<Workflow>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflows WHERE state = $1 ORDER BY created_at",
            WORKFLOW_COLUMNS
        );
        self.fetch_workflows(&sql, WorkflowFilter::State(state))
            .await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM ontology.workflows WHERE workflow_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete workflow")?;
        Ok(())
    }

    async fn update_state(
        &self,
        id: Uuid,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ontology.workflows
            SET state = $2, error_message = COALESCE($3, error_message), updated_at = NOW()
            WHERE workflow_id = $1
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .context("Failed to update workflow state")?;
        Ok(())
    }

    async fn update_state_if(
        &self,
        id: Uuid,
        expected: WorkflowState,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ontology.workflows
            SET state = $3, error_message = COALESCE($4, error_message), updated_at = NOW()
            WHERE workflow_id = $1 AND state = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(state.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .context("Failed to update workflow state")?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_phase(&self, id: Uuid, phase: WorkflowPhase) -> Result<()> {
        sqlx::query(
            "UPDATE ontology.workflows SET phase = $2, updated_at = NOW() WHERE workflow_id = $1",
        )
        .bind(id)
        .bind(phase.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update workflow phase")?;
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, progress: &WorkflowProgress) -> Result<()> {
        sqlx::query(
            "UPDATE ontology.workflows SET progress = $2, updated_at = NOW() WHERE workflow_id = $1",
        )
        .bind(id)
        .bind(serde_json::to_value(progress)?)
        .execute(&self.pool)
        .await
        .context("Failed to update workflow progress")?;
        Ok(())
    }

    async fn update_task_queue(&self, id: Uuid, tasks: &[TaskSnapshot]) -> Result<()> {
        sqlx::query(
            "UPDATE ontology.workflows SET task_queue = $2, updated_at = NOW() WHERE workflow_id = $1",
        )
        .bind(id)
        .bind(serde_json::to_value(tasks)?)
        .execute(&self.pool)
        .await
        .context("Failed to update task queue")?;
        Ok(())
    }

    async fn claim_ownership(
        &self,
        id: Uuid,
        owner_id: Uuid,
        lease_timeout: Duration,
    ) -> Result<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE ontology.workflows
            SET owner_id = $2, last_heartbeat = NOW()
            WHERE workflow_id = $1
              AND (owner_id IS NULL
                   OR owner_id = $2
                   OR last_heartbeat IS NULL
                   OR last_heartbeat < NOW() - make_interval(secs => $3::float8 / 1000))
            RETURNING workflow_id
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(lease_millis(lease_timeout))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim workflow ownership")?;
        Ok(claimed.is_some())
    }

    async fn update_heartbeat(&self, id: Uuid, owner_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ontology.workflows
            SET last_heartbeat = NOW()
            WHERE workflow_id = $1 AND owner_id = $2
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .context("Failed to update heartbeat")?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_ownership(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE ontology.workflows SET owner_id = NULL, last_heartbeat = NULL WHERE workflow_id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to release workflow ownership")?;
        Ok(())
    }
}

#[async_trait]
impl EntityStateRepository for PgStore {
    async fn create_batch(&self, entities: &[EntityState]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entity in entities {
            sqlx::query(
                r#"
                INSERT INTO ontology.workflow_entity_states
                    (entity_state_id, workflow_id, entity_type, entity_key, status,
                     retry_count, last_error, state_data, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(entity.id)
            .bind(entity.workflow_id)
            .bind(entity.entity_type.as_str())
            .bind(&entity.entity_key)
            .bind(entity.status.as_str())
            .bind(entity.retry_count)
            .bind(&entity.last_error)
            .bind(&entity.state_data)
            .bind(entity.created_at)
            .bind(entity.updated_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create entity {}", entity.entity_key))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<EntityState>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflow_entity_states WHERE workflow_id = $1 \
             ORDER BY created_at, entity_key",
            ENTITY_COLUMNS
        );
        let rows = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entity states")?;
        collect(rows)
    }

    async fn get(&self, id: Uuid) -> Result<Option<EntityState>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflow_entity_states WHERE entity_state_id = $1",
            ENTITY_COLUMNS
        );
        let row = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get entity state")?;
        row.map(EntityState::try_from).transpose()
    }

    async fn get_by_key(
        &self,
        workflow_id: Uuid,
        entity_type: EntityType,
        entity_key: &str,
    ) -> Result<Option<EntityState>> {
        let sql = format!(
            "SELECT {} FROM ontology.workflow_entity_states \
             WHERE workflow_id = $1 AND entity_type = $2 AND entity_key = $3",
            ENTITY_COLUMNS
        );
        let row = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(workflow_id)
            .bind(entity_type.as_str())
            .bind(entity_key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get entity state by key")?;
        row.map(EntityState::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: EntityStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT entity_type, status FROM ontology.workflow_entity_states \
             WHERE entity_state_id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock entity state")?
        .ok_or_else(|| anyhow!("entity not found: {}", id))?;

        let entity_type: EntityType = parse_enum("entity_type", row.try_get("entity_type")?)?;
        let current: EntityStatus = parse_enum("status", row.try_get("status")?)?;

        if current == status {
            return Ok(());
        }
        if !current.can_transition(entity_type, status) {
            return Err(TransitionError {
                entity_id: id,
                entity_type,
                from: current,
                to: status,
            }
            .into());
        }

        sqlx::query(
            r#"
            UPDATE ontology.workflow_entity_states
            SET status = $2, last_error = COALESCE($3, last_error), updated_at = NOW()
            WHERE entity_state_id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&mut *tx)
        .await
        .context("Failed to update entity status")?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_state_data(&self, id: Uuid, state_data: &JsonValue) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ontology.workflow_entity_states
            SET state_data = $2, updated_at = NOW()
            WHERE entity_state_id = $1
            "#,
        )
        .bind(id)
        .bind(state_data)
        .execute(&self.pool)
        .await
        .context("Failed to update entity state data")?;
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid, last_error: &str) -> Result<i32> {
        let row = sqlx::query(
            r#"
            UPDATE ontology.workflow_entity_states
            SET retry_count = retry_count + 1, last_error = $2, updated_at = NOW()
            WHERE entity_state_id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to increment retry count")?
        .ok_or_else(|| anyhow!("entity not found: {}", id))?;
        Ok(row.try_get("retry_count")?)
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ontology.workflow_entity_states
            SET status = 'pending', retry_count = retry_count + 1, updated_at = NOW()
            WHERE entity_state_id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to reset entity for retry")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("only failed entities can be retried, {} is not failed", id));
        }
        Ok(())
    }

    async fn delete_by_workflow(&self, workflow_id: Uuid) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM ontology.workflow_entity_states WHERE workflow_id = $1")
                .bind(workflow_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete entity states")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CandidateRepository for PgStore {
    async fn create(&self, candidate: &RelationshipCandidate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ontology.relationship_candidates
                (candidate_id, workflow_id, source_column_id, target_column_id,
                 detection_method, confidence, is_required, status, description,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(candidate.id)
        .bind(candidate.workflow_id)
        .bind(candidate.source_column_id)
        .bind(candidate.target_column_id)
        .bind(candidate.detection_method.as_str())
        .bind(candidate.confidence)
        .bind(candidate.is_required)
        .bind(candidate.status.as_str())
        .bind(&candidate.description)
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create relationship candidate")?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RelationshipCandidate>> {
        let sql = format!(
            "SELECT {} FROM ontology.relationship_candidates WHERE candidate_id = $1",
            CANDIDATE_COLUMNS
        );
        let row = sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get relationship candidate")?;
        row.map(RelationshipCandidate::try_from).transpose()
    }

    async fn get_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<RelationshipCandidate>> {
        let sql = format!(
            "SELECT {} FROM ontology.relationship_candidates WHERE workflow_id = $1 \
             ORDER BY created_at",
            CANDIDATE_COLUMNS
        );
        let rows = sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list relationship candidates")?;
        collect(rows)
    }

    async fn get_by_workflow_and_status(
        &self,
        workflow_id: Uuid,
        status: CandidateStatus,
    ) -> Result<Vec<RelationshipCandidate>> {
        let sql = format!(
            "SELECT {} FROM ontology.relationship_candidates \
             WHERE workflow_id = $1 AND status = $2 ORDER BY created_at",
            CANDIDATE_COLUMNS
        );
        let rows = sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(workflow_id)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list relationship candidates by status")?;
        collect(rows)
    }

    async fn count_required_pending(&self, workflow_id: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM ontology.relationship_candidates
            WHERE workflow_id = $1 AND is_required AND status = 'pending'
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count required candidates")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn update(&self, candidate: &RelationshipCandidate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ontology.relationship_candidates
            SET detection_method = $2, confidence = $3, is_required = $4, status = $5,
                description = $6, updated_at = NOW()
            WHERE candidate_id = $1
            "#,
        )
        .bind(candidate.id)
        .bind(candidate.detection_method.as_str())
        .bind(candidate.confidence)
        .bind(candidate.is_required)
        .bind(candidate.status.as_str())
        .bind(&candidate.description)
        .execute(&self.pool)
        .await
        .context("Failed to update relationship candidate")?;
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: CandidateStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ontology.relationship_candidates
            SET status = $2, updated_at = NOW()
            WHERE candidate_id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update candidate status")?;
        Ok(())
    }

    async fn delete_by_workflow(&self, workflow_id: Uuid) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM ontology.relationship_candidates WHERE workflow_id = $1")
                .bind(workflow_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete relationship candidates")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OntologyStore for PgStore {
    async fn save_ontology(&self, project_id: Uuid, ontology: &OntologySnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ontology.ontologies (project_id, snapshot, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (project_id)
            DO UPDATE SET snapshot = EXCLUDED.snapshot, updated_at = NOW()
            "#,
        )
        .bind(project_id)
        .bind(serde_json::to_value(ontology)?)
        .execute(&self.pool)
        .await
        .context("Failed to save ontology")?;

        info!(%project_id, entities = ontology.entities.len(), "Saved ontology");
        Ok(())
    }

    async fn get_ontology(&self, project_id: Uuid) -> Result<Option<OntologySnapshot>> {
        let snapshot: Option<JsonValue> =
            sqlx::query_scalar("SELECT snapshot FROM ontology.ontologies WHERE project_id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to get ontology")?;
        snapshot
            .map(|value| serde_json::from_value(value).context("Corrupt ontology snapshot"))
            .transpose()
    }
}

// ============================================================================
// Schema store
// ============================================================================

/// Reads discovered schema metadata and writes committed relationships
#[derive(Clone, Debug)]
pub struct PgSchemaStore {
    pool: PgPool,
}

impl PgSchemaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TABLE_COLUMNS: &str = "table_id, datasource_id, schema_name, table_name, row_count";

const COLUMN_COLUMNS: &str =
    "c.column_id, c.table_id, c.column_name, c.data_type, c.is_primary_key, c.fk_table, c.fk_column";

#[async_trait]
impl SchemaStore for PgSchemaStore {
    async fn list_tables(&self, datasource_id: Uuid) -> Result<Vec<SchemaTable>> {
        let sql = format!(
            "SELECT {} FROM ontology.schema_tables WHERE datasource_id = $1 \
             ORDER BY schema_name, table_name",
            TABLE_COLUMNS
        );
        let rows = sqlx::query_as::<_, TableRow>(&sql)
            .bind(datasource_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list tables")?;
        Ok(rows.into_iter().map(SchemaTable::from).collect())
    }

    async fn list_columns(&self, datasource_id: Uuid) -> Result<Vec<SchemaColumn>> {
        let sql = format!(
            "SELECT {} FROM ontology.schema_columns c \
             JOIN ontology.schema_tables t ON t.table_id = c.table_id \
             WHERE t.datasource_id = $1 ORDER BY t.schema_name, t.table_name, c.ordinal_position",
            COLUMN_COLUMNS
        );
        let rows = sqlx::query_as::<_, ColumnRow>(&sql)
            .bind(datasource_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list columns")?;
        Ok(rows.into_iter().map(SchemaColumn::from).collect())
    }

    async fn list_columns_by_table(&self, table_id: Uuid) -> Result<Vec<SchemaColumn>> {
        let sql = format!(
            "SELECT {} FROM ontology.schema_columns c WHERE c.table_id = $1 \
             ORDER BY c.ordinal_position",
            COLUMN_COLUMNS
        );
        let rows = sqlx::query_as::<_, ColumnRow>(&sql)
            .bind(table_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list table columns")?;
        Ok(rows.into_iter().map(SchemaColumn::from).collect())
    }

    async fn get_table(&self, id: Uuid) -> Result<Option<SchemaTable>> {
        let sql = format!(
            "SELECT {} FROM ontology.schema_tables WHERE table_id = $1",
            TABLE_COLUMNS
        );
        let row = sqlx::query_as::<_, TableRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get table")?;
        Ok(row.map(SchemaTable::from))
    }

    async fn get_column(&self, id: Uuid) -> Result<Option<SchemaColumn>> {
        let sql = format!(
            "SELECT {} FROM ontology.schema_columns c WHERE c.column_id = $1",
            COLUMN_COLUMNS
        );
        let row = sqlx::query_as::<_, ColumnRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get column")?;
        Ok(row.map(SchemaColumn::from))
    }

    async fn upsert_relationships(&self, relationships: &[SchemaRelationship]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for rel in relationships {
            sqlx::query(
                r#"
                INSERT INTO ontology.schema_relationships
                    (relationship_id, datasource_id, source_table_id, source_column_id,
                     target_table_id, target_column_id, detection_method, confidence,
                     description, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                ON CONFLICT (source_column_id, target_column_id)
                DO UPDATE SET detection_method = EXCLUDED.detection_method,
                              confidence = EXCLUDED.confidence,
                              description = EXCLUDED.description,
                              updated_at = NOW()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(rel.datasource_id)
            .bind(rel.source_table_id)
            .bind(rel.source_column_id)
            .bind(rel.target_table_id)
            .bind(rel.target_column_id)
            .bind(&rel.detection_method)
            .bind(rel.confidence)
            .bind(&rel.description)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert relationship")?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Datasource adapter
// ============================================================================

/// Samples values straight from a Postgres datasource
#[derive(Clone, Debug)]
pub struct PgDiscoverer {
    pool: PgPool,
}

impl PgDiscoverer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Double-quote an identifier, doubling embedded quotes
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified_table(column: &ColumnRef) -> String {
    format!("{}.{}", quote_ident(&column.schema), quote_ident(&column.table))
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl SchemaDiscoverer for PgDiscoverer {
    async fn sample_values(&self, column: &ColumnRef, limit: usize) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {col}::text AS value FROM {table} WHERE {col} IS NOT NULL LIMIT $1",
            col = quote_ident(&column.column),
            table = qualified_table(column),
        );
        sqlx::query_scalar::<_, String>(&sql)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to sample {}", column))
    }

    async fn check_value_overlap(
        &self,
        source: &ColumnRef,
        target: &ColumnRef,
        sample_limit: usize,
    ) -> Result<ValueOverlap> {
        let sql = format!(
            r#"
            WITH sampled AS (
                SELECT {src}::text AS value FROM {src_table}
                WHERE {src} IS NOT NULL LIMIT $1
            )
            SELECT
                (SELECT COUNT(DISTINCT {src}) FROM {src_table}) AS source_distinct,
                (SELECT COUNT(DISTINCT {tgt}) FROM {tgt_table}) AS target_distinct,
                (SELECT COUNT(*) FROM sampled s
                 WHERE EXISTS (SELECT 1 FROM {tgt_table} t WHERE t.{tgt}::text = s.value)) AS matched_rows,
                (SELECT COUNT(*) FROM sampled) AS sampled_rows
            "#,
            src = quote_ident(&source.column),
            src_table = qualified_table(source),
            tgt = quote_ident(&target.column),
            tgt_table = qualified_table(target),
        );

        let row = sqlx::query(&sql)
            .bind(clamp_limit(sample_limit))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to compare {} with {}", source, target))?;

        Ok(ValueOverlap {
            source_distinct: row.try_get("source_distinct")?,
            target_distinct: row.try_get("target_distinct")?,
            matched_rows: row.try_get("matched_rows")?,
            sampled_rows: row.try_get("sampled_rows")?,
        })
    }
}
