//! Takeover of workflows abandoned by dead peers
//!
//! A running workflow whose heartbeat is older than the lease timeout has no
//! live owner. Any instance may claim it; the claim is atomic, so exactly
//! one sweeper wins and resumes driving from persisted state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::extraction::ExtractionService;
use crate::models::{WorkflowKind, WorkflowState};
use crate::relationships::RelationshipService;
use crate::store::WorkflowRepository;

pub struct WorkflowRecovery {
    workflows: Arc<dyn WorkflowRepository>,
    extraction: ExtractionService,
    relationships: RelationshipService,
    lease_timeout: Duration,
}

impl WorkflowRecovery {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        extraction: ExtractionService,
        relationships: RelationshipService,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            workflows,
            extraction,
            relationships,
            lease_timeout,
        }
    }

    /// Claim and resume every abandoned running workflow; returns the ids
    /// this instance took over
    pub async fn reclaim_abandoned(&self) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let abandoned: Vec<_> = self
            .workflows
            .list_by_state(WorkflowState::Running)
            .await?
            .into_iter()
            .filter(|w| w.is_abandoned(now, self.lease_timeout))
            .collect();

        let mut reclaimed = Vec::new();
        for workflow in abandoned {
            let resumed = match workflow.kind {
                WorkflowKind::Extraction => self.extraction.resume(workflow.id).await,
                WorkflowKind::RelationshipDetection => {
                    self.relationships.resume(workflow.id).await
                }
            };
            match resumed {
                Ok(true) => reclaimed.push(workflow.id),
                Ok(false) => debug!(workflow_id = %workflow.id, "Peer reclaimed first"),
                Err(e) => warn!(workflow_id = %workflow.id, error = %e, "Failed to reclaim workflow"),
            }
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed abandoned workflows");
        }
        Ok(reclaimed)
    }

    /// Sweep every `interval` until the shutdown signal is received
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Workflow recovery started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.reclaim_abandoned().await {
                error!(error = %e, "Recovery sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Workflow recovery stopped");
    }
}
