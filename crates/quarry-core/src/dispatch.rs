use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use quarry_plugin_sdk::{
    ConnectionProfile, ConnectionSchema, PluginDescriptor, QueryContext, Row, TableProvider,
    TableSchema, TransformPolicy, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::RowCache;

/// Descriptor-derived state prepared once at bootstrap and shared by every
/// connection for the process lifetime. Never mutated after construction;
/// in particular the serialized schema document is byte-identical for every
/// `/schema` request, which is what permits host-side schema caching.
pub struct PluginRuntime {
    name: String,
    version: String,
    schema_json: Bytes,
    catalog: TableCatalog,
    context: QueryContext,
    cache: RowCache,
}

impl PluginRuntime {
    /// Builds the runtime from a validated descriptor and a resolved
    /// connection profile. Pure construction; no I/O.
    pub fn new(descriptor: PluginDescriptor, connection: ConnectionProfile) -> Result<Self> {
        let schema_json = render_schema_document(&descriptor)?;
        let name = descriptor.name.clone();
        let version = descriptor.version.to_string();
        let catalog = TableCatalog::build(descriptor);
        Ok(Self {
            name,
            version,
            schema_json,
            catalog,
            context: QueryContext::new(connection),
            cache: RowCache::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn schema_json(&self) -> Bytes {
        self.schema_json.clone()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.catalog.tables.keys().map(String::as_str).collect()
    }

    /// Executes one listing request. `Ok(None)` means the table is unknown;
    /// provider failures surface as `Err`.
    pub async fn list(&self, table: &str, request: ListRequest) -> Result<Option<Vec<Row>>> {
        let handle = match self.catalog.tables.get(table) {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let listing = self.fetch(handle).await?;
        let limit = request.limit.unwrap_or(usize::MAX);
        let mut rows: Vec<Row> = listing
            .iter()
            .filter(|row| request.quals.iter().all(|qual| qual.matches(row)))
            .take(limit)
            .cloned()
            .collect();
        if let Some(transform) = handle.transform {
            for row in &mut rows {
                transform.apply(row);
            }
        }
        Ok(Some(rows))
    }

    async fn fetch(&self, handle: &TableHandle) -> Result<Arc<Vec<Row>>> {
        let ttl = match handle.cache_ttl {
            Some(ttl) => ttl,
            None => return self.run_provider(handle).await,
        };
        if let Some(rows) = self.cache.lookup(&handle.schema.name, ttl).await {
            tracing::debug!(table = %handle.schema.name, "serving listing from cache");
            return Ok(rows);
        }
        // Single-flight: concurrent misses on one table queue behind the
        // first fetch instead of each hitting the provider.
        let _refresh = handle.fetch_lock.lock().await;
        if let Some(rows) = self.cache.lookup(&handle.schema.name, ttl).await {
            tracing::debug!(table = %handle.schema.name, "listing refreshed while waiting");
            return Ok(rows);
        }
        let rows = self.run_provider(handle).await?;
        self.cache.store(&handle.schema.name, rows.clone()).await;
        Ok(rows)
    }

    async fn run_provider(&self, handle: &TableHandle) -> Result<Arc<Vec<Row>>> {
        let provider = handle.provider.clone();
        let ctx = self.context.clone();
        let table = handle.schema.name.clone();
        let rows = tokio::task::spawn_blocking(move || provider.list(&ctx))
            .await
            .with_context(|| format!("provider task for table `{table}` panicked"))?
            .with_context(|| format!("provider for table `{}` failed", handle.schema.name))?;
        Ok(Arc::new(rows))
    }
}

struct TableCatalog {
    tables: BTreeMap<String, TableHandle>,
}

struct TableHandle {
    schema: TableSchema,
    provider: Arc<dyn TableProvider>,
    transform: Option<TransformPolicy>,
    cache_ttl: Option<Duration>,
    /// Serializes cache refreshes for this table.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl TableCatalog {
    fn build(descriptor: PluginDescriptor) -> Self {
        let defaults = descriptor.defaults;
        let tables = descriptor
            .tables
            .into_iter()
            .map(|(name, table)| {
                let transform = table.schema.transform.or(defaults.transform);
                let cache_ttl = table
                    .schema
                    .cache_ttl_secs
                    .or(defaults.cache_ttl_secs)
                    .map(Duration::from_secs);
                (
                    name,
                    TableHandle {
                        schema: table.schema,
                        provider: table.provider,
                        transform,
                        cache_ttl,
                        fetch_lock: tokio::sync::Mutex::new(()),
                    },
                )
            })
            .collect();
        Self { tables }
    }
}

/// Body of a `/list/<table>` request.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ListRequest {
    pub quals: Vec<Qual>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Qual {
    pub column: String,
    pub op: QualOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum QualOp {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = "!=")]
    NotEquals,
}

impl Qual {
    fn matches(&self, row: &Row) -> bool {
        let cell = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            QualOp::Equals => cell == &self.value,
            QualOp::NotEquals => cell != &self.value,
        }
    }
}

#[derive(Serialize)]
struct SchemaDocument<'a> {
    protocol: u32,
    name: &'a str,
    version: String,
    tables: BTreeMap<&'a str, &'a TableSchema>,
    connection: &'a ConnectionSchema,
}

fn render_schema_document(descriptor: &PluginDescriptor) -> Result<Bytes> {
    let document = SchemaDocument {
        protocol: PROTOCOL_VERSION,
        name: &descriptor.name,
        version: descriptor.version.to_string(),
        tables: descriptor
            .tables
            .values()
            .map(|table| (table.schema.name.as_str(), &table.schema))
            .collect(),
        connection: &descriptor.connection,
    };
    let bytes = serde_json::to_vec(&document).context("failed to serialize schema document")?;
    Ok(Bytes::from(bytes))
}
