//! Schema collaborator types
//!
//! The engine never discovers schema itself; these are the shapes it reads
//! from the schema store and writes back as committed relationships.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A table known to schema storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTable {
    pub id: Uuid,
    pub datasource_id: Uuid,
    pub schema_name: String,
    pub table_name: String,
    pub row_count: Option<i64>,
}

impl SchemaTable {
    /// `schema.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

/// A column known to schema storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub id: Uuid,
    pub table_id: Uuid,
    pub column_name: String,
    pub data_type: String,
    pub is_primary_key: bool,
    /// Explicit FK target table from metadata, possibly `schema.table`
    pub fk_table: Option<String>,
    /// Explicit FK target column from metadata
    pub fk_column: Option<String>,
}

impl SchemaColumn {
    pub fn new(table_id: Uuid, column_name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            table_id,
            column_name: column_name.into(),
            data_type: data_type.into(),
            is_primary_key: false,
            fk_table: None,
            fk_column: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.fk_table = Some(table.into());
        self.fk_column = Some(column.into());
        self
    }
}

/// A committed relationship between two tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRelationship {
    pub datasource_id: Uuid,
    pub source_table_id: Uuid,
    pub source_column_id: Uuid,
    pub target_table_id: Uuid,
    pub target_column_id: Uuid,
    pub detection_method: String,
    pub confidence: f64,
    pub description: Option<String>,
}

/// Fully qualified column reference handed to the datasource adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub schema: String,
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn of(table: &SchemaTable, column: &SchemaColumn) -> Self {
        Self::new(&table.schema_name, &table.table_name, &column.column_name)
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.table, self.column)
    }
}

/// Result of the value-overlap check between two columns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueOverlap {
    pub source_distinct: i64,
    pub target_distinct: i64,
    /// Sampled source rows whose value exists in the target column
    pub matched_rows: i64,
    /// Source rows examined (bounded by the sample limit)
    pub sampled_rows: i64,
}

impl ValueOverlap {
    /// Fraction of sampled source rows found in the target, 0 when nothing sampled
    pub fn match_ratio(&self) -> f64 {
        if self.sampled_rows <= 0 {
            return 0.0;
        }
        (self.matched_rows as f64 / self.sampled_rows as f64).clamp(0.0, 1.0)
    }
}
