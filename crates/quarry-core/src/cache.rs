use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use quarry_plugin_sdk::Row;
use tokio::sync::Mutex;

/// Per-table listing cache. Entries store the full unfiltered listing so a
/// cached result can serve any combination of quals and limits.
#[derive(Default)]
pub struct RowCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    stored_at: Instant,
    rows: Arc<Vec<Row>>,
}

impl RowCache {
    /// Returns the cached listing for `table` if it is younger than `ttl`.
    pub async fn lookup(&self, table: &str, ttl: Duration) -> Option<Arc<Vec<Row>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(table) {
            Some(entry) if entry.stored_at.elapsed() < ttl => Some(entry.rows.clone()),
            Some(_) => {
                entries.remove(table);
                None
            }
            None => None,
        }
    }

    pub async fn store(&self, table: &str, rows: Arc<Vec<Row>>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            table.to_string(),
            CacheEntry {
                stored_at: Instant::now(),
                rows,
            },
        );
    }
}
