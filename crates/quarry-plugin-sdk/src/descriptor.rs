use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::{
    connection::{AttributeKind, ConnectionSchema},
    table::{ColumnKind, TableProvider, TableSchema, TransformPolicy},
};

/// Immutable description of a plugin: identity, tables, connection schema,
/// and plugin-wide defaults. Built once per factory invocation and owned by
/// the serve harness for the process lifetime.
pub struct PluginDescriptor {
    pub name: String,
    pub version: semver::Version,
    pub tables: BTreeMap<String, Table>,
    pub connection: ConnectionSchema,
    pub defaults: PluginDefaults,
}

pub struct Table {
    pub schema: TableSchema,
    pub provider: Arc<dyn TableProvider>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("schema", &self.schema).finish()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tables", &self.tables)
            .field("connection", &self.connection)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Plugin-wide fallbacks for per-table policy hooks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginDefaults {
    pub transform: Option<TransformPolicy>,
    pub cache_ttl_secs: Option<u64>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            name: name.into(),
            version,
            tables: BTreeMap::new(),
            connection: ConnectionSchema::default(),
            defaults: PluginDefaults::default(),
        }
    }

    pub fn table(mut self, schema: TableSchema, provider: Arc<dyn TableProvider>) -> Self {
        self.tables
            .insert(schema.name.clone(), Table { schema, provider });
        self
    }

    pub fn connection(mut self, schema: ConnectionSchema) -> Self {
        self.connection = schema;
        self
    }

    pub fn defaults(mut self, defaults: PluginDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Validates structural invariants and provides actionable error messages.
    /// A descriptor that fails here must never reach the serving state.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("plugin name must not be empty");
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            bail!(
                "plugin name `{}` may only contain lowercase letters, digits and underscores",
                self.name
            );
        }
        if self.tables.is_empty() {
            bail!("plugin `{}` must define at least one table", self.name);
        }
        for (key, table) in &self.tables {
            table.validate()?;
            if key != &table.schema.name {
                bail!(
                    "table registered as `{key}` declares schema name `{}`",
                    table.schema.name
                );
            }
        }
        for name in self.connection.attributes.keys() {
            if name.trim().is_empty() {
                bail!("connection attribute names must not be empty");
            }
        }
        Ok(())
    }

    /// Structural projection used to check factory purity: two descriptors
    /// from the same factory must always compare equal here.
    pub fn shape(&self) -> DescriptorShape {
        DescriptorShape {
            name: self.name.clone(),
            tables: self
                .tables
                .values()
                .map(|table| {
                    (
                        table.schema.name.clone(),
                        table
                            .schema
                            .columns
                            .iter()
                            .map(|col| (col.name.clone(), col.kind))
                            .collect(),
                    )
                })
                .collect(),
            connection: self
                .connection
                .attributes
                .iter()
                .map(|(name, spec)| (name.clone(), (spec.kind, spec.required)))
                .collect(),
        }
    }
}

impl Table {
    fn validate(&self) -> Result<()> {
        let schema = &self.schema;
        if schema.name.trim().is_empty() {
            bail!("table name must not be empty");
        }
        if schema.columns.is_empty() {
            bail!("table `{}` must declare at least one column", schema.name);
        }
        let mut seen = std::collections::HashSet::new();
        for column in &schema.columns {
            if column.name.trim().is_empty() {
                bail!("table `{}` has a column with an empty name", schema.name);
            }
            if !seen.insert(column.name.as_str()) {
                bail!(
                    "duplicate column `{}` in table `{}`",
                    column.name,
                    schema.name
                );
            }
        }
        Ok(())
    }
}

/// The host-cacheable part of a descriptor, reduced to comparable structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorShape {
    pub name: String,
    pub tables: BTreeMap<String, Vec<(String, ColumnKind)>>,
    pub connection: BTreeMap<String, (AttributeKind, bool)>,
}
