//! Ontology payloads
//!
//! `TableStateData` and `GlobalStateData` are the working payloads stored on
//! entity state rows. `OntologySnapshot` is the clean result written at
//! finalization, with workflow bookkeeping stripped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sampled distinct values for one column
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSample {
    pub column_name: String,
    pub data_type: String,
    pub values: Vec<String>,
}

/// Business meaning of one table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableAnalysis {
    pub business_name: String,
    pub description: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub column_notes: BTreeMap<String, String>,
    /// Questions for a human; non-empty means the analysis is not final
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
}

/// Answer to one analysis question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub question: String,
    pub answer: String,
}

/// Project-wide summary produced by global synthesis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSummary {
    pub description: String,
    pub domains: Vec<String>,
    pub table_count: usize,
}

/// Working payload of a table entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStateData {
    pub table_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub samples: Vec<ColumnSample>,
    #[serde(default)]
    pub analysis: Option<TableAnalysis>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub answers: Vec<QuestionAnswer>,
}

/// Working payload of the global entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStateData {
    #[serde(default)]
    pub summary: Option<DomainSummary>,
}

/// Materialized ontology for a project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OntologySnapshot {
    pub domain: Option<DomainSummary>,
    /// Keyed by `schema.table`
    pub entities: BTreeMap<String, TableAnalysis>,
}
