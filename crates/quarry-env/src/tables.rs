use anyhow::Result;
use quarry_plugin_sdk::{QueryContext, Row, TableProvider};
use serde_json::{json, Value};

/// Lists the process environment, honoring the `prefix` and `redact`
/// connection attributes.
pub struct EnvironmentVariableTable;

impl TableProvider for EnvironmentVariableTable {
    fn list(&self, ctx: &QueryContext) -> Result<Vec<Row>> {
        let prefix = ctx.connection.get_str("prefix").unwrap_or("");
        let redact = ctx.connection.get_bool("redact").unwrap_or(false);
        let mut rows = Vec::new();
        // vars_os, not vars: a non-Unicode entry is a legal process state and
        // must degrade to replacement characters, not a panic.
        for (name, value) in std::env::vars_os() {
            let name = name.to_string_lossy().into_owned();
            if !name.starts_with(prefix) {
                continue;
            }
            let mut row = Row::new();
            row.insert("name".into(), Value::String(name));
            row.insert(
                "value".into(),
                if redact {
                    Value::Null
                } else {
                    Value::String(value.to_string_lossy().into_owned())
                },
            );
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Single-row identity table: who this plugin is and how to talk to it.
pub struct PluginInfoTable;

impl TableProvider for PluginInfoTable {
    fn list(&self, _ctx: &QueryContext) -> Result<Vec<Row>> {
        let mut row = Row::new();
        row.insert("name".into(), json!(crate::factory::PLUGIN_NAME));
        row.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
        row.insert(
            "protocol_version".into(),
            json!(quarry_plugin_sdk::PROTOCOL_VERSION),
        );
        row.insert("pid".into(), json!(std::process::id()));
        Ok(vec![row])
    }
}
