//! Scheduler tasks
//!
//! One task per unit of work. Every task:
//! - moves its own entity forward and records `failed` on error
//! - retries collaborator calls up to `task_max_retries` times
//! - checks its cancellation token between I/O calls
//!
//! The driver loop only decides *what* to submit; everything about an
//! individual entity's progress happens here.

mod analyze;
mod column_scan;
mod global;
mod scan;
mod test_join;

pub use analyze::AnalyzeTableTask;
pub use column_scan::ColumnScanTask;
pub use global::GlobalSynthesisTask;
pub use scan::ScanTableTask;
pub use test_join::TestJoinTask;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::analyzer::TableAnalyzer;
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::models::{EntityState, EntityStatus};
use crate::store::{CandidateRepository, EntityStateRepository, SchemaDiscoverer, SchemaStore};

/// Collaborators shared by every task
#[derive(Clone)]
pub struct TaskDeps {
    pub entities: Arc<dyn EntityStateRepository>,
    pub candidates: Arc<dyn CandidateRepository>,
    pub schema: Arc<dyn SchemaStore>,
    pub discoverer: Arc<dyn SchemaDiscoverer>,
    pub analyzer: Arc<dyn TableAnalyzer>,
    pub config: EngineConfig,
}

impl TaskDeps {
    pub(crate) async fn load_entity(&self, id: Uuid) -> Result<EntityState, TaskError> {
        self.entities
            .get(id)
            .await?
            .ok_or_else(|| TaskError::InvalidState(format!("entity {} not found", id)))
    }

    pub(crate) async fn transition(&self, id: Uuid, status: EntityStatus) -> Result<(), TaskError> {
        self.entities.update_status(id, status, None).await?;
        Ok(())
    }

    pub(crate) async fn save_data<T: serde::Serialize>(
        &self,
        id: Uuid,
        data: &T,
    ) -> Result<(), TaskError> {
        let value = serde_json::to_value(data)?;
        self.entities.update_state_data(id, &value).await?;
        Ok(())
    }

    /// Run a collaborator call with the per-task retry budget.
    ///
    /// Each failed attempt bumps the entity's retry counter; the last error
    /// is returned once the budget is spent.
    pub(crate) async fn retrying<T, F, Fut>(
        &self,
        entity_id: Uuid,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            checkpoint(cancel)?;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.task_max_retries => {
                    attempt += 1;
                    warn!(%entity_id, attempt, error = %e, "{} failed, retrying", what);
                    self.entities
                        .increment_retry(entity_id, &format!("{}: {}", what, e))
                        .await?;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                        _ = tokio::time::sleep(self.config.task_retry_backoff) => {}
                    }
                }
                Err(e) => return Err(TaskError::Collaborator(e.context(what.to_string()))),
            }
        }
    }

    /// Record a task error on its entity. Cancellation leaves the entity
    /// untouched so a later owner can pick it up.
    pub(crate) async fn record_outcome(&self, entity_id: Uuid, result: &Result<(), TaskError>) {
        let Err(e) = result else { return };
        if matches!(e, TaskError::Cancelled) {
            debug!(%entity_id, "Task cancelled");
            return;
        }
        let message = e.to_string();
        if let Err(write_err) = self
            .entities
            .update_status(entity_id, EntityStatus::Failed, Some(&message))
            .await
        {
            warn!(%entity_id, error = %write_err, "Failed to record entity failure");
        }
    }
}

pub(crate) fn checkpoint(cancel: &CancellationToken) -> Result<(), TaskError> {
    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}
