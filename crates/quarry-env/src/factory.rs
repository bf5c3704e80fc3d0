use std::sync::Arc;

use anyhow::{Context, Result};
use quarry_plugin_sdk::{
    AttributeKind, AttributeSpec, Column, ColumnKind, ConnectionSchema, PluginDefaults,
    PluginDescriptor, PluginFactory, TableSchema, TransformPolicy,
};

use crate::tables::{EnvironmentVariableTable, PluginInfoTable};

pub const PLUGIN_NAME: &str = "env";

/// Factory for the `env` plugin descriptor. Pure: every invocation yields
/// the same table set and schema regardless of the environment's contents.
pub struct EnvPlugin;

impl PluginFactory for EnvPlugin {
    fn build(&self) -> Result<PluginDescriptor> {
        let version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
            .context("crate version is not valid semver")?;
        Ok(PluginDescriptor::new(PLUGIN_NAME, version)
            .table(environment_variable_schema(), Arc::new(EnvironmentVariableTable))
            .table(plugin_info_schema(), Arc::new(PluginInfoTable))
            .connection(connection_schema())
            .defaults(PluginDefaults {
                transform: Some(TransformPolicy::TrimStrings),
                cache_ttl_secs: Some(30),
            }))
    }
}

pub fn connection_schema() -> ConnectionSchema {
    ConnectionSchema::default()
        .attribute(
            "prefix",
            AttributeSpec::optional(AttributeKind::String)
                .describe("only expose variables whose name starts with this prefix"),
        )
        .attribute(
            "redact",
            AttributeSpec::optional(AttributeKind::Bool)
                .describe("mask variable values, exposing names only"),
        )
}

fn environment_variable_schema() -> TableSchema {
    TableSchema {
        name: "environment_variable".into(),
        description: Some("Environment variables of the plugin process".into()),
        columns: vec![
            Column::new("name", ColumnKind::String).describe("variable name"),
            Column::new("value", ColumnKind::String)
                .describe("variable value; null when the connection sets redact"),
        ],
        ..TableSchema::default()
    }
}

fn plugin_info_schema() -> TableSchema {
    TableSchema {
        name: "plugin_info".into(),
        description: Some("Identity of the running plugin".into()),
        columns: vec![
            Column::new("name", ColumnKind::String),
            Column::new("version", ColumnKind::String),
            Column::new("protocol_version", ColumnKind::Integer),
            Column::new("pid", ColumnKind::Integer),
        ],
        // identity never changes within a process; cache practically forever
        cache_ttl_secs: Some(3600),
        ..TableSchema::default()
    }
}
