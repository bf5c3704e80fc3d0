use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionProfile;

/// A single result row, keyed by column name. `BTreeMap` keeps column order
/// deterministic across invocations.
pub type Row = BTreeMap<String, Value>;

/// Host-visible schema of one table. This is the part of a table definition
/// the host is allowed to cache.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TableSchema {
    pub name: String,
    pub description: Option<String>,
    pub columns: Vec<Column>,
    /// Overrides the plugin-wide default transform when set.
    pub transform: Option<TransformPolicy>,
    /// Overrides the plugin-wide default cache TTL when set.
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub description: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    String,
    Integer,
    Double,
    Bool,
    Timestamp,
    Json,
}

/// Cell rewriting applied by the dispatch layer after rows come back from a
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformPolicy {
    /// Empty string cells become JSON null.
    NullIfEmpty,
    /// String cells are trimmed of surrounding whitespace.
    TrimStrings,
}

impl TransformPolicy {
    pub fn apply(&self, row: &mut Row) {
        for cell in row.values_mut() {
            if let Value::String(s) = cell {
                match self {
                    TransformPolicy::NullIfEmpty => {
                        if s.is_empty() {
                            *cell = Value::Null;
                        }
                    }
                    TransformPolicy::TrimStrings => {
                        let trimmed = s.trim();
                        if trimmed.len() != s.len() {
                            *cell = Value::String(trimmed.to_string());
                        }
                    }
                }
            }
        }
    }
}

/// Context handed to a provider for one listing call.
///
/// Quals and limits are applied by the dispatch layer after the fetch, so a
/// cached listing stays independent of any particular query.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub connection: ConnectionProfile,
}

impl QueryContext {
    pub fn new(connection: ConnectionProfile) -> Self {
        Self { connection }
    }
}

/// Fetches and maps one resource type into rows. Implementations run on the
/// harness's blocking pool and may perform synchronous I/O.
pub trait TableProvider: Send + Sync + 'static {
    fn list(&self, ctx: &QueryContext) -> anyhow::Result<Vec<Row>>;
}
