//! Workflow Types
//!
//! One `Workflow` row exists per extraction or relationship-detection job.
//! The owner/heartbeat pair on the row is the ownership lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Phase of work a workflow is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowPhase {
    /// Per-table scan/analyze plus global synthesis
    Tier1Building,
    /// Column scans and join tests
    Relationships,
    /// Final bookkeeping before the workflow is marked complete
    Completing,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier1Building => "tier1-building",
            Self::Relationships => "relationships",
            Self::Completing => "completing",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tier1-building" => Ok(Self::Tier1Building),
            "relationships" => Ok(Self::Relationships),
            "completing" => Ok(Self::Completing),
            _ => Err(format!("Unknown workflow phase: {}", s)),
        }
    }
}

/// Which job a workflow runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    /// Table scan/analyze and global synthesis
    Extraction,
    /// Column scans, join tests and candidate review
    RelationshipDetection,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::RelationshipDetection => "relationship-detection",
        }
    }

    /// Phase a freshly started workflow of this kind begins in
    pub fn initial_phase(&self) -> WorkflowPhase {
        match self {
            Self::Extraction => WorkflowPhase::Tier1Building,
            Self::RelationshipDetection => WorkflowPhase::Relationships,
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(Self::Extraction),
            "relationship-detection" => Ok(Self::RelationshipDetection),
            _ => Err(format!("Unknown workflow kind: {}", s)),
        }
    }
}

/// Lifecycle state of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown workflow state: {}", s)),
        }
    }
}

/// Progress snapshot shown to external observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub current: u32,
    pub total: u32,
    pub message: String,
}

impl WorkflowProgress {
    pub fn new(current: u32, total: u32, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
        }
    }

    /// Percentage complete, 0 when there is nothing to do yet
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f32 / self.total as f32) * 100.0
    }
}

/// Status of one task in the scheduler snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedTaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One entry of the task list persisted by the task-queue writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub name: String,
    pub status: QueuedTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A single extraction or relationship-detection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub kind: WorkflowKind,
    pub project_id: Uuid,
    pub datasource_id: Option<Uuid>,
    pub phase: WorkflowPhase,
    pub state: WorkflowState,
    pub progress: WorkflowProgress,
    /// Last task list written by the task-queue writer
    #[serde(default)]
    pub task_queue: Vec<TaskSnapshot>,
    pub owner_id: Option<Uuid>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a new running workflow with no owner
    pub fn new(kind: WorkflowKind, project_id: Uuid, datasource_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            project_id,
            datasource_id,
            phase: kind.initial_phase(),
            state: WorkflowState::Running,
            progress: WorkflowProgress::default(),
            task_queue: Vec::new(),
            owner_id: None,
            last_heartbeat: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the recorded lease is still live at `now`
    pub fn lease_is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (self.owner_id, self.last_heartbeat) {
            (Some(_), Some(heartbeat)) => {
                let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
                now - heartbeat < timeout
            }
            _ => false,
        }
    }

    /// Running, but nobody has renewed the lease within `timeout`
    pub fn is_abandoned(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.state == WorkflowState::Running && !self.lease_is_live(now, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip_strings() {
        for phase in [
            WorkflowPhase::Tier1Building,
            WorkflowPhase::Relationships,
            WorkflowPhase::Completing,
        ] {
            assert_eq!(phase.as_str().parse::<WorkflowPhase>(), Ok(phase));
        }
        assert!("bogus".parse::<WorkflowPhase>().is_err());
    }

    #[test]
    fn test_lease_liveness() {
        let mut wf = Workflow::new(WorkflowKind::Extraction, Uuid::new_v4(), None);
        assert_eq!(wf.phase, WorkflowPhase::Tier1Building);
        let now = Utc::now();
        assert!(!wf.lease_is_live(now, Duration::from_secs(30)));

        wf.owner_id = Some(Uuid::new_v4());
        wf.last_heartbeat = Some(now - chrono::Duration::seconds(10));
        assert!(wf.lease_is_live(now, Duration::from_secs(30)));
        assert!(!wf.lease_is_live(now, Duration::from_secs(5)));
        assert!(wf.is_abandoned(now, Duration::from_secs(5)));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(WorkflowProgress::default().percent(), 0.0);
        assert_eq!(WorkflowProgress::new(1, 4, "").percent(), 25.0);
    }
}
