// TestDependencies - collaborator doubles for testing
//
// Provides in-memory stand-ins for the identifier factory, cache
// invalidation and the "other tables" that owner queries select from.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::sql::{OwnerFilter, OwnerQuery, SqlValue};
use crate::traits::{BaseCacheInvalidator, BaseIdGenerator, CacheKey};

// =============================================================================
// Identifier Factory
// =============================================================================

pub struct CountingIdGenerator {
    next: AtomicI64,
}

impl Default for CountingIdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl BaseIdGenerator for CountingIdGenerator {
    async fn next_id(&self) -> Result<i64> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

// =============================================================================
// Cache Invalidation
// =============================================================================

/// Records every invalidated key, in order.
#[derive(Default)]
pub struct RecordingCacheInvalidator {
    keys: RwLock<Vec<CacheKey>>,
}

impl RecordingCacheInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn was_invalidated(&self, key: CacheKey) -> bool {
        self.keys().contains(&key)
    }

    pub fn clear(&self) {
        self.keys.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl BaseCacheInvalidator for RecordingCacheInvalidator {
    fn invalidate(&self, keys: &[CacheKey]) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(keys);
    }
}

// =============================================================================
// Owner Tables
// =============================================================================

pub type TestRow = HashMap<String, SqlValue>;

/// Rows of external tables (hop-count cache, queue) that owner queries read.
#[derive(Default)]
pub struct TestTables {
    tables: RwLock<HashMap<String, Vec<TestRow>>>,
}

impl TestTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, K, V>(&self, table: &str, columns: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        let row = columns
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Owner ids selected by the query; rows whose owner column is not an integer are skipped.
    pub fn select_owners(&self, query: &OwnerQuery) -> HashSet<i64> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let Some(rows) = tables.get(query.table()) else {
            return HashSet::new();
        };

        rows.iter()
            .filter(|row| query.filters().iter().all(|filter| matches(row, filter)))
            .filter_map(|row| match row.get(query.column()) {
                Some(SqlValue::BigInt(id)) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

fn matches(row: &TestRow, filter: &OwnerFilter) -> bool {
    match filter {
        OwnerFilter::Eq(column, value) => row.get(column) == Some(value),
        OwnerFilter::IsNull(column) => !row.contains_key(column),
        OwnerFilter::NotNull(column) => row.contains_key(column),
    }
}
