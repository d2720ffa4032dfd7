//! Foreign-key target detection and confidence scoring
//!
//! Metadata wins: a column that declares an FK target is only ever matched
//! against that target. Columns without metadata fall back to the
//! `<table>_id` naming convention.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::models::{CandidateStatus, DetectionMethod, SchemaColumn, SchemaTable, ValueOverlap};

/// Heuristic candidates whose values match at least this well are reported
/// as value matches
pub const VALUE_MATCH_RATIO: f64 = 0.95;

/// Lookup tables over one datasource's schema
#[derive(Debug, Default)]
pub struct SchemaIndex {
    tables: HashMap<Uuid, SchemaTable>,
    by_name: HashMap<String, Vec<Uuid>>,
    columns: HashMap<Uuid, Vec<SchemaColumn>>,
}

impl SchemaIndex {
    /// Columns whose table is not in `tables` are left out
    pub fn new(tables: Vec<SchemaTable>, columns: Vec<SchemaColumn>) -> Self {
        let mut index = Self::default();
        for table in tables {
            index
                .by_name
                .entry(table.table_name.to_lowercase())
                .or_default()
                .push(table.id);
            index.tables.insert(table.id, table);
        }
        for column in columns {
            if index.tables.contains_key(&column.table_id) {
                index.columns.entry(column.table_id).or_default().push(column);
            }
        }
        index
    }

    pub fn table(&self, id: Uuid) -> Option<&SchemaTable> {
        self.tables.get(&id)
    }

    pub fn columns_of(&self, table_id: Uuid) -> &[SchemaColumn] {
        self.columns.get(&table_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Case-insensitive lookup, preferring a table in `schema` when several
    /// share the name
    fn find_table(&self, name: &str, schema: Option<&str>) -> Option<&SchemaTable> {
        let ids = self.by_name.get(&name.to_lowercase())?;
        let mut matches = ids.iter().filter_map(|id| self.tables.get(id));
        match schema {
            Some(schema) => ids
                .iter()
                .filter_map(|id| self.tables.get(id))
                .find(|t| t.schema_name.eq_ignore_ascii_case(schema))
                .or_else(|| matches.next()),
            None => matches.next(),
        }
    }

    fn column_named(&self, table_id: Uuid, name: &str) -> Option<&SchemaColumn> {
        self.columns_of(table_id)
            .iter()
            .find(|c| c.column_name.eq_ignore_ascii_case(name))
    }

    /// Primary key, else a column literally named `id`
    fn key_column(&self, table_id: Uuid) -> Option<&SchemaColumn> {
        self.columns_of(table_id)
            .iter()
            .find(|c| c.is_primary_key)
            .or_else(|| self.column_named(table_id, "id"))
    }
}

/// Where a column appears to point
#[derive(Debug, Clone, PartialEq)]
pub struct FkTarget {
    pub table: SchemaTable,
    pub column: SchemaColumn,
    pub method: DetectionMethod,
}

/// Find the FK target of `column` (which lives in `table`), if any
pub fn detect_fk_target(
    index: &SchemaIndex,
    table: &SchemaTable,
    column: &SchemaColumn,
) -> Option<FkTarget> {
    let target = match column.fk_table.as_deref() {
        Some(fk_table) => metadata_target(index, table, column, fk_table)?,
        None => name_target(index, table, column)?,
    };

    if target.column.id == column.id {
        return None;
    }
    Some(target)
}

fn metadata_target(
    index: &SchemaIndex,
    table: &SchemaTable,
    column: &SchemaColumn,
    fk_table: &str,
) -> Option<FkTarget> {
    let (schema, name) = match fk_table.rsplit_once('.') {
        Some((schema, name)) => (schema.trim_matches('"'), name),
        None => (table.schema_name.as_str(), fk_table),
    };
    let target_table = index.find_table(name.trim_matches('"'), Some(schema))?;
    let target_column = match column.fk_column.as_deref() {
        Some(name) => index.column_named(target_table.id, name)?,
        None => index.key_column(target_table.id)?,
    };

    Some(FkTarget {
        table: target_table.clone(),
        column: target_column.clone(),
        method: DetectionMethod::Metadata,
    })
}

fn name_target(index: &SchemaIndex, table: &SchemaTable, column: &SchemaColumn) -> Option<FkTarget> {
    if column.is_primary_key {
        return None;
    }
    let name = column.column_name.to_lowercase();
    let stem = name.strip_suffix("_id").filter(|s| !s.is_empty())?;

    let target_table = table_names_for(stem)
        .iter()
        .find_map(|candidate| index.find_table(candidate, Some(&table.schema_name)))?;
    let target_column = index.key_column(target_table.id)?;

    Some(FkTarget {
        table: target_table.clone(),
        column: target_column.clone(),
        method: DetectionMethod::NameHeuristic,
    })
}

/// Table names a `<stem>_id` column may refer to
fn table_names_for(stem: &str) -> Vec<String> {
    let mut names = vec![
        stem.to_string(),
        format!("{}s", stem),
        format!("{}es", stem),
    ];
    if let Some(base) = stem.strip_suffix('y') {
        names.push(format!("{}ies", base));
    }
    names
}

/// Heuristic matches with near-total value overlap become value matches
pub fn refine_method(method: DetectionMethod, overlap: &ValueOverlap) -> DetectionMethod {
    match method {
        DetectionMethod::NameHeuristic if overlap.match_ratio() >= VALUE_MATCH_RATIO => {
            DetectionMethod::ValueMatch
        }
        other => other,
    }
}

/// Confidence for a detection method given observed value overlap
pub fn score(method: DetectionMethod, overlap: &ValueOverlap) -> f64 {
    let ratio = overlap.match_ratio();
    let confidence = match method {
        DetectionMethod::Metadata => 0.6 + 0.4 * ratio,
        DetectionMethod::ValueMatch => 0.5 + 0.5 * ratio,
        DetectionMethod::NameHeuristic => 0.85 * ratio,
    };
    confidence.clamp(0.0, 1.0)
}

/// Review outcome after a join test: status plus whether a human must decide
pub fn review_decision(confidence: f64, config: &EngineConfig) -> (CandidateStatus, bool) {
    if confidence >= config.auto_accept_threshold {
        (CandidateStatus::Accepted, false)
    } else if confidence < config.auto_reject_threshold {
        (CandidateStatus::Rejected, false)
    } else {
        (CandidateStatus::Pending, true)
    }
}
