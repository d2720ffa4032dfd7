//! Table analysis collaborator
//!
//! The driver never interprets tables itself. Analysis goes through
//! [`TableAnalyzer`]; production deployments plug in a model-backed
//! implementation, while [`HeuristicAnalyzer`] derives names and notes from
//! schema shape alone and works offline.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::models::{
    ColumnSample, DomainSummary, QuestionAnswer, SchemaColumn, SchemaTable, TableAnalysis,
};

/// Everything known about one table when it is analyzed
#[derive(Debug, Clone)]
pub struct TableContext {
    pub table: SchemaTable,
    pub columns: Vec<SchemaColumn>,
    pub samples: Vec<ColumnSample>,
    /// Answers to questions raised by an earlier analysis pass
    pub answers: Vec<QuestionAnswer>,
}

#[async_trait]
pub trait TableAnalyzer: Send + Sync {
    /// Describe one table. Returned questions park the entity in
    /// `needs-input` until they are answered.
    async fn analyze_table(&self, ctx: &TableContext) -> anyhow::Result<TableAnalysis>;

    /// Summarize the project from every completed table analysis, keyed by
    /// qualified table name.
    async fn synthesize_domain(
        &self,
        tables: &[(String, TableAnalysis)],
    ) -> anyhow::Result<DomainSummary>;
}

/// Schema-shape analyzer
#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer {
    /// Ask for the identifying column of tables without a primary key
    pub ask_when_ambiguous: bool,
}

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asking() -> Self {
        Self {
            ask_when_ambiguous: true,
        }
    }
}

#[async_trait]
impl TableAnalyzer for HeuristicAnalyzer {
    async fn analyze_table(&self, ctx: &TableContext) -> anyhow::Result<TableAnalysis> {
        let business_name = business_name(&ctx.table.table_name);

        let mut description = format!(
            "{} records with {} columns",
            business_name,
            ctx.columns.len()
        );
        for answer in &ctx.answers {
            description.push_str(&format!(". {}", answer.answer.trim()));
        }

        let column_notes: BTreeMap<String, String> = ctx
            .columns
            .iter()
            .filter_map(|column| {
                column_note(column, ctx.samples.iter().find(|s| s.column_name == column.column_name))
                    .map(|note| (column.column_name.clone(), note))
            })
            .collect();

        let mut questions = Vec::new();
        let has_key = ctx.columns.iter().any(|c| c.is_primary_key);
        if self.ask_when_ambiguous && !has_key && ctx.answers.is_empty() {
            questions.push(format!("What uniquely identifies a {}?", business_name));
        }

        Ok(TableAnalysis {
            business_name,
            description,
            domain: domain_of(&ctx.table),
            column_notes,
            questions,
        })
    }

    async fn synthesize_domain(
        &self,
        tables: &[(String, TableAnalysis)],
    ) -> anyhow::Result<DomainSummary> {
        let domains: BTreeSet<String> = tables
            .iter()
            .filter_map(|(_, analysis)| analysis.domain.clone())
            .collect();
        let domains: Vec<String> = domains.into_iter().collect();

        let description = if domains.is_empty() {
            format!("{} tables", tables.len())
        } else {
            format!("{} tables across {}", tables.len(), domains.join(", "))
        };

        Ok(DomainSummary {
            description,
            domains,
            table_count: tables.len(),
        })
    }
}

/// `order_items` -> `Order Item`
fn business_name(table_name: &str) -> String {
    let words: Vec<&str> = table_name
        .split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, word)| {
            if i == last {
                capitalize(&singularize(word))
            } else {
                capitalize(word)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Best-effort English singular of a table name, lowercased
fn singularize(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some(base) = lower.strip_suffix("ies").filter(|b| !b.is_empty()) {
        return format!("{}y", base);
    }
    for suffix in ["sses", "shes", "ches", "xes"] {
        if lower.ends_with(suffix) {
            return lower[..lower.len() - 2].to_string();
        }
    }
    match lower.strip_suffix('s') {
        Some(base) if !base.is_empty() && !base.ends_with('s') => base.to_string(),
        _ => lower,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn domain_of(table: &SchemaTable) -> Option<String> {
    if !table.schema_name.is_empty() && table.schema_name != "public" {
        return Some(table.schema_name.clone());
    }
    table
        .table_name
        .split('_')
        .find(|w| !w.is_empty())
        .map(|w| singularize(&w.to_lowercase()))
}

fn column_note(column: &SchemaColumn, sample: Option<&ColumnSample>) -> Option<String> {
    let name = column.column_name.to_lowercase();
    let mut note = if column.is_primary_key {
        "Primary key".to_string()
    } else if let Some(target) = &column.fk_table {
        format!("References {}", target)
    } else if let Some(stem) = name.strip_suffix("_id").filter(|s| !s.is_empty()) {
        format!("Reference to {}", stem)
    } else if name.ends_with("_at") || column.data_type.to_lowercase().contains("timestamp") {
        "Timestamp".to_string()
    } else {
        String::new()
    };

    if let Some(sample) = sample.filter(|s| !s.values.is_empty()) {
        let shown: Vec<&str> = sample.values.iter().take(3).map(String::as_str).collect();
        if !note.is_empty() {
            note.push_str("; ");
        }
        note.push_str(&format!("e.g. {}", shown.join(", ")));
    }

    (!note.is_empty()).then_some(note)
}
