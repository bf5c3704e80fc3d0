use std::{collections::BTreeMap, sync::OnceLock};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attributes a plugin expects in its connection configuration (credentials,
/// regions, filters). Declared by the descriptor, enforced at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionSchema {
    pub attributes: BTreeMap<String, AttributeSpec>,
}

impl ConnectionSchema {
    pub fn attribute(mut self, name: impl Into<String>, spec: AttributeSpec) -> Self {
        self.attributes.insert(name.into(), spec);
        self
    }

    pub fn has_required_attributes(&self) -> bool {
        self.attributes.values().any(|spec| spec.required)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub kind: AttributeKind,
    #[serde(default)]
    pub required: bool,
    /// Secret attributes must never be echoed back in schema-document
    /// defaults or logged by providers.
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl AttributeSpec {
    pub fn optional(kind: AttributeKind) -> Self {
        Self {
            kind,
            required: false,
            secret: false,
            description: None,
        }
    }

    pub fn required(kind: AttributeKind) -> Self {
        Self {
            required: true,
            ..Self::optional(kind)
        }
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    String,
    Bool,
    Integer,
    StringList,
}

impl AttributeKind {
    fn matches(&self, value: &toml::Value) -> bool {
        match self {
            AttributeKind::String => value.is_str(),
            AttributeKind::Bool => value.is_bool(),
            AttributeKind::Integer => value.is_integer(),
            AttributeKind::StringList => value
                .as_array()
                .map(|items| items.iter().all(|item| item.is_str()))
                .unwrap_or(false),
        }
    }
}

/// Resolved, schema-checked connection values. Read-only after resolution.
#[derive(Debug, Clone, Default)]
pub struct ConnectionProfile {
    values: BTreeMap<String, Value>,
}

impl ConnectionProfile {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_str_list(&self, key: &str) -> Option<Vec<&str>> {
        self.values.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .collect()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parses raw connection TOML against the declared schema.
///
/// `${VAR}` and `${VAR:default}` references are substituted from the process
/// environment before parsing, so credentials can be supplied without
/// writing them into the file.
pub fn resolve_connection(schema: &ConnectionSchema, raw: &str) -> Result<ConnectionProfile> {
    let expanded = interpolate_env(raw);
    let parsed: toml::Table =
        toml::from_str(&expanded).context("failed to parse connection configuration")?;

    let mut values = BTreeMap::new();
    for (key, value) in parsed {
        let spec = match schema.attributes.get(&key) {
            Some(spec) => spec,
            None => bail!("unknown connection attribute `{key}`"),
        };
        if !spec.kind.matches(&value) {
            bail!(
                "connection attribute `{key}` must be of kind {:?}",
                spec.kind
            );
        }
        values.insert(key, toml_to_json(value));
    }

    for (name, spec) in &schema.attributes {
        if spec.required && !values.contains_key(name) {
            bail!("missing required connection attribute `{name}`");
        }
    }

    Ok(ConnectionProfile { values })
}

fn interpolate_env(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}").unwrap());
    regex
        .replace_all(input, |caps: &regex::Captures| {
            let key = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ConnectionSchema {
        ConnectionSchema::default()
            .attribute("token", AttributeSpec::required(AttributeKind::String).secret())
            .attribute("regions", AttributeSpec::optional(AttributeKind::StringList))
            .attribute("verbose", AttributeSpec::optional(AttributeKind::Bool))
    }

    #[test]
    fn resolves_typed_attributes() {
        let profile = resolve_connection(
            &schema(),
            "token = \"abc\"\nregions = [\"eu-1\", \"us-2\"]\nverbose = true\n",
        )
        .unwrap();
        assert_eq!(profile.get_str("token"), Some("abc"));
        assert_eq!(profile.get_str_list("regions"), Some(vec!["eu-1", "us-2"]));
        assert_eq!(profile.get_bool("verbose"), Some(true));
    }

    #[test]
    fn rejects_unknown_attribute() {
        let err = resolve_connection(&schema(), "token = \"abc\"\nbogus = 1\n").unwrap_err();
        assert!(err.to_string().contains("unknown connection attribute"));
    }

    #[test]
    fn rejects_missing_required_attribute() {
        let err = resolve_connection(&schema(), "verbose = false\n").unwrap_err();
        assert!(err.to_string().contains("missing required"));
    }

    #[test]
    fn rejects_kind_mismatch() {
        let err = resolve_connection(&schema(), "token = 7\n").unwrap_err();
        assert!(err.to_string().contains("must be of kind"));
    }

    #[test]
    fn interpolates_environment_with_defaults() {
        std::env::set_var("QUARRY_TEST_TOKEN", "from-env");
        let profile = resolve_connection(
            &schema(),
            "token = \"${QUARRY_TEST_TOKEN}\"\nregions = [\"${QUARRY_TEST_UNSET:eu-1}\"]\n",
        )
        .unwrap();
        assert_eq!(profile.get_str("token"), Some("from-env"));
        assert_eq!(profile.get_str_list("regions"), Some(vec!["eu-1"]));
    }
}
