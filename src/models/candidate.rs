//! Relationship Candidate Types
//!
//! Candidates are raw evidence. Several rows may describe the same logical
//! relationship; they are collapsed only when relationships are saved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a candidate was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    /// Values of the source column were found in the target column
    ValueMatch,
    /// Column metadata carried an explicit foreign-key target
    Metadata,
    /// `<table>_id` naming convention
    NameHeuristic,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValueMatch => "value-match",
            Self::Metadata => "metadata",
            Self::NameHeuristic => "name-heuristic",
        }
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "value-match" => Ok(Self::ValueMatch),
            "metadata" => Ok(Self::Metadata),
            "name-heuristic" => Ok(Self::NameHeuristic),
            _ => Err(format!("Unknown detection method: {}", s)),
        }
    }
}

/// Review status of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Accepted,
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CandidateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown candidate status: {}", s)),
        }
    }
}

/// A detected, not yet committed join between two columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub source_column_id: Uuid,
    pub target_column_id: Uuid,
    pub detection_method: DetectionMethod,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    /// Must be accepted or rejected by a human before saving
    pub is_required: bool,
    pub status: CandidateStatus,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelationshipCandidate {
    pub fn new(
        workflow_id: Uuid,
        source_column_id: Uuid,
        target_column_id: Uuid,
        detection_method: DetectionMethod,
        confidence: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            source_column_id,
            target_column_id,
            detection_method,
            confidence: confidence.clamp(0.0, 1.0),
            is_required: false,
            status: CandidateStatus::Pending,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Length used to pick the most informative duplicate; `None` counts as 0
    pub fn description_len(&self) -> usize {
        self.description.as_deref().map(str::len).unwrap_or(0)
    }
}

/// Working payload of a column entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnScanData {
    pub column_id: Option<Uuid>,
    /// `schema.table.column` the column appears to reference
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub candidate_id: Option<Uuid>,
    #[serde(default)]
    pub match_ratio: Option<f64>,
}

/// Working payload of a test-join entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestJoinData {
    pub candidate_id: Option<Uuid>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub matched_rows: i64,
    #[serde(default)]
    pub sampled_rows: i64,
}
