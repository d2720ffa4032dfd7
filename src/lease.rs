//! Ownership lease for workflows.
//!
//! A workflow row carries `owner_id` + `last_heartbeat`. The lease is live
//! while `now - last_heartbeat < lease_timeout`; after that any instance may
//! claim it. Only the holder of a live lease drives the workflow.
//!
//! Losing the lease is cooperative self-cancellation: the heartbeat worker
//! flags the [`DriveContext`] and the driver stops before its next
//! submission, because another owner may already be mutating the same
//! entities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::store::WorkflowRepository;

/// Cancellation handle shared by everything driving one workflow
#[derive(Debug, Clone, Default)]
pub struct DriveContext {
    token: CancellationToken,
    lease_lost: Arc<AtomicBool>,
}

impl DriveContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// External cancellation (shutdown or an explicit cancel command)
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Heartbeat renewal failed; stop driving immediately
    pub fn mark_lease_lost(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// The error that explains why driving stopped
    pub fn interruption(&self, workflow_id: Uuid) -> WorkflowError {
        if self.lease_lost() {
            WorkflowError::OwnershipLost(workflow_id)
        } else {
            WorkflowError::Cancelled
        }
    }

    /// Fail fast when the driver must not continue
    pub fn check(&self, workflow_id: Uuid) -> Result<()> {
        if self.is_cancelled() {
            return Err(self.interruption(workflow_id));
        }
        Ok(())
    }
}

/// Claims, renews and releases workflow leases for this process
pub struct OwnershipManager {
    workflows: Arc<dyn WorkflowRepository>,
    owner_id: Uuid,
    lease_timeout: Duration,
}

impl OwnershipManager {
    pub fn new(workflows: Arc<dyn WorkflowRepository>, owner_id: Uuid, lease_timeout: Duration) -> Self {
        Self {
            workflows,
            owner_id,
            lease_timeout,
        }
    }

    /// Identifier this process records as the owner
    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Take the lease if it is free, ours, or expired
    pub async fn claim(&self, workflow_id: Uuid) -> Result<bool> {
        let claimed = self
            .workflows
            .claim_ownership(workflow_id, self.owner_id, self.lease_timeout)
            .await?;
        if claimed {
            info!(%workflow_id, owner_id = %self.owner_id, "Claimed workflow ownership");
        } else {
            debug!(%workflow_id, owner_id = %self.owner_id, "Workflow owned by a live peer");
        }
        Ok(claimed)
    }

    /// Extend the lease, failing with `OwnershipLost` if a peer took it
    pub async fn heartbeat(&self, workflow_id: Uuid) -> Result<()> {
        if self
            .workflows
            .update_heartbeat(workflow_id, self.owner_id)
            .await?
        {
            Ok(())
        } else {
            Err(WorkflowError::OwnershipLost(workflow_id))
        }
    }

    /// Clear the lease unconditionally
    pub async fn release(&self, workflow_id: Uuid) -> Result<()> {
        self.workflows.release_ownership(workflow_id).await?;
        info!(%workflow_id, "Released workflow ownership");
        Ok(())
    }
}

/// Renew the lease every `interval` until shutdown or loss.
///
/// Runs as a registry worker keyed by workflow id. A failed renewal flags
/// `ctx` as lease-lost and ends the loop.
pub async fn run_heartbeat(
    manager: Arc<OwnershipManager>,
    workflow_id: Uuid,
    interval: Duration,
    ctx: DriveContext,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%workflow_id, ?interval, "Heartbeat started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!(%workflow_id, "Heartbeat stopping");
                return;
            }
        }

        if *shutdown.borrow() {
            return;
        }

        match manager.heartbeat(workflow_id).await {
            Ok(()) => debug!(%workflow_id, "Heartbeat renewed"),
            Err(e) => {
                warn!(%workflow_id, error = %e, "Heartbeat failed, abandoning workflow");
                ctx.mark_lease_lost();
                return;
            }
        }
    }
}
