//! Driving a workflow inside this process
//!
//! `WorkflowRuntime` ties together the pieces every driven workflow needs:
//! the ownership lease, the heartbeat and task-queue writer workers, the
//! cancellation context, and the cleanup that runs when a driver ends.
//!
//! Driver outcomes:
//! - `Ok` releases ownership
//! - lease loss only stops workers; the new owner carries on
//! - cancellation only stops workers; `cancel` does its own bookkeeping
//! - any other error marks the workflow failed and releases ownership

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, TaskError, WorkflowError};
use crate::lease::{run_heartbeat, DriveContext, OwnershipManager};
use crate::models::{EntityStatus, WorkflowState};
use crate::queue::{run_task_queue_writer, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::store::{EntityStateRepository, WorkflowRepository};

/// Everything a driver needs for one workflow run
pub struct DriveSession {
    pub workflow_id: Uuid,
    pub ctx: DriveContext,
    pub queue: Arc<TaskQueue>,
}

pub struct WorkflowRuntime {
    workflows: Arc<dyn WorkflowRepository>,
    entities: Arc<dyn EntityStateRepository>,
    ownership: Arc<OwnershipManager>,
    heartbeats: WorkerRegistry,
    writers: WorkerRegistry,
    active: Mutex<HashMap<Uuid, DriveContext>>,
    config: EngineConfig,
}

impl WorkflowRuntime {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        entities: Arc<dyn EntityStateRepository>,
        owner_id: Uuid,
        config: EngineConfig,
    ) -> Self {
        let ownership = Arc::new(OwnershipManager::new(
            workflows.clone(),
            owner_id,
            config.lease_timeout,
        ));
        Self {
            workflows,
            entities,
            ownership,
            heartbeats: WorkerRegistry::new("heartbeat"),
            writers: WorkerRegistry::new("task-queue-writer"),
            active: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, DriveContext>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn owner_id(&self) -> Uuid {
        self.ownership.owner_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn heartbeats(&self) -> &WorkerRegistry {
        &self.heartbeats
    }

    pub fn writers(&self) -> &WorkerRegistry {
        &self.writers
    }

    /// Whether this process is currently driving `workflow_id`
    pub fn is_driving(&self, workflow_id: Uuid) -> bool {
        self.active().contains_key(&workflow_id)
    }

    /// Context of a workflow driven by this process
    pub fn context(&self, workflow_id: Uuid) -> Option<DriveContext> {
        self.active().get(&workflow_id).cloned()
    }

    /// Claim the lease and start the per-workflow workers
    pub async fn begin(&self, workflow_id: Uuid) -> Result<DriveSession> {
        if !self.ownership.claim(workflow_id).await? {
            return Err(WorkflowError::OwnershipClaimFailed);
        }

        let ctx = DriveContext::new();
        let queue = Arc::new(TaskQueue::new(
            self.config.max_concurrency,
            ctx.token().child_token(),
        ));

        let manager = self.ownership.clone();
        let interval = self.config.heartbeat_interval;
        let heartbeat_ctx = ctx.clone();
        self.heartbeats.start(workflow_id, move |shutdown| {
            run_heartbeat(manager, workflow_id, interval, heartbeat_ctx, shutdown)
        });

        let workflows = self.workflows.clone();
        let tasks = queue.subscribe();
        let flush = self.config.task_queue_flush_interval;
        self.writers.start(workflow_id, move |shutdown| {
            run_task_queue_writer(workflows, workflow_id, tasks, flush, shutdown)
        });

        self.active().insert(workflow_id, ctx.clone());
        Ok(DriveSession {
            workflow_id,
            ctx,
            queue,
        })
    }

    /// Run `drive` in the background and clean up after it
    pub fn spawn<F, Fut>(self: &Arc<Self>, session: DriveSession, drive: F) -> JoinHandle<()>
    where
        F: FnOnce(DriveSession) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let runtime = self.clone();
        let workflow_id = session.workflow_id;
        let ctx = session.ctx.clone();
        let driver = drive(session);

        tokio::spawn(async move {
            let outcome = driver.await;
            runtime.finish(workflow_id, &ctx, outcome).await;
        })
    }

    async fn finish(&self, workflow_id: Uuid, ctx: &DriveContext, outcome: Result<()>) {
        self.stop_workers(workflow_id).await;
        self.active().remove(&workflow_id);

        match outcome {
            Ok(()) => {
                info!(%workflow_id, "Workflow driver finished");
                self.release(workflow_id).await;
            }
            Err(e) if ctx.lease_lost() || matches!(e, WorkflowError::OwnershipLost(_)) => {
                warn!(%workflow_id, "Lost workflow ownership, leaving it to the new owner");
            }
            Err(e) if e.is_interruption() => {
                info!(%workflow_id, "Workflow driver cancelled");
            }
            Err(e) => {
                error!(%workflow_id, error = %e, "Workflow driver failed");
                self.mark_workflow_failed(workflow_id, &e.to_string()).await;
                self.release(workflow_id).await;
            }
        }
    }

    /// Stop driving a workflow and record it as cancelled. Idempotent.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<()> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(workflow_id))?;
        if workflow.state.is_terminal() {
            return Ok(());
        }

        if !self
            .workflows
            .update_state_if(workflow_id, workflow.state, WorkflowState::Cancelled, None)
            .await?
        {
            // Reached a terminal state concurrently
            return Ok(());
        }
        if let Some(ctx) = self.context(workflow_id) {
            ctx.cancel();
        }
        self.stop_workers(workflow_id).await;
        self.ownership.release(workflow_id).await?;
        info!(%workflow_id, "Workflow cancelled");
        Ok(())
    }

    /// Record a workflow failure unless it already left `running`. Entity
    /// rows are left as they are.
    pub async fn mark_workflow_failed(&self, workflow_id: Uuid, message: &str) {
        match self
            .workflows
            .update_state_if(
                workflow_id,
                WorkflowState::Running,
                WorkflowState::Failed,
                Some(message),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(%workflow_id, "Workflow no longer running, failure not recorded"),
            Err(e) => error!(%workflow_id, error = %e, "Failed to mark workflow failed"),
        }
    }

    /// Send entities a previous owner left mid-task back to `pending` through
    /// the retry path. Entities waiting on a human are left alone.
    pub async fn reset_in_flight(&self, workflow_id: Uuid) -> Result<usize> {
        let entities = self.entities.list_by_workflow(workflow_id).await?;
        let mut reset = 0;
        for entity in entities.iter().filter(|e| {
            matches!(
                e.status,
                EntityStatus::Scanning | EntityStatus::Analyzing | EntityStatus::Testing
            )
        }) {
            self.entities
                .update_status(entity.id, EntityStatus::Failed, Some("abandoned by previous owner"))
                .await?;
            self.entities.reset_for_retry(entity.id).await?;
            reset += 1;
        }
        if reset > 0 {
            info!(%workflow_id, reset, "Requeued entities abandoned mid-task");
        }
        Ok(reset)
    }

    async fn stop_workers(&self, workflow_id: Uuid) {
        let timeout = self.config.worker_stop_timeout;
        tokio::join!(
            self.heartbeats.stop(workflow_id, timeout),
            self.writers.stop(workflow_id, timeout),
        );
    }

    async fn release(&self, workflow_id: Uuid) {
        if let Err(e) = self.ownership.release(workflow_id).await {
            warn!(%workflow_id, error = %e, "Failed to release ownership");
        }
    }

    /// Cancel every local driver and stop all workers. Leases are left to
    /// expire so peers can reclaim the workflows.
    pub async fn shutdown(&self) {
        let contexts: Vec<DriveContext> = self.active().values().cloned().collect();
        for ctx in contexts {
            ctx.cancel();
        }
        let timeout = self.config.worker_stop_timeout;
        tokio::join!(
            self.heartbeats.stop_all(timeout),
            self.writers.stop_all(timeout),
        );
    }
}

/// Fold a batch result into the driver's control flow.
///
/// Task failures are already recorded on their entities and only logged
/// here; cancellation ends the driver.
pub(crate) fn settle_batch(
    result: std::result::Result<(), TaskError>,
    workflow_id: Uuid,
    ctx: &DriveContext,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(TaskError::Cancelled) => Err(ctx.interruption(workflow_id)),
        Err(e) => {
            warn!(%workflow_id, error = %e, "Batch finished with task failures");
            ctx.check(workflow_id)
        }
    }
}
