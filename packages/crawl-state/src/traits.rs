// Collaborator traits for dependency injection
//
// These are INFRASTRUCTURE seams only: the connector registry, cache
// invalidation and identifier allocation live outside this crate.
//
// Naming convention: Base* for trait names (e.g., BaseConnectorRegistry)

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{DbContext, Result};

// =============================================================================
// Connector Registry
// =============================================================================

#[async_trait]
pub trait BaseConnectorRegistry: Send + Sync {
    /// Whether the repository connector behind this connection is installed
    async fn is_installed(&self, connection_name: &str) -> Result<bool>;

    /// Whether the output connector behind this output connection is installed
    async fn is_output_installed(&self, output_name: &str) -> Result<bool>;
}

/// Registry backed by in-process sets, populated as connectors register.
#[derive(Default)]
pub struct StaticConnectorRegistry {
    connections: RwLock<HashSet<String>>,
    outputs: RwLock<HashSet<String>>,
}

impl StaticConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_connection(&self, name: &str) {
        self.connections.write().await.insert(name.to_string());
    }

    pub async fn deregister_connection(&self, name: &str) {
        self.connections.write().await.remove(name);
    }

    pub async fn register_output(&self, name: &str) {
        self.outputs.write().await.insert(name.to_string());
    }

    pub async fn deregister_output(&self, name: &str) {
        self.outputs.write().await.remove(name);
    }
}

#[async_trait]
impl BaseConnectorRegistry for StaticConnectorRegistry {
    async fn is_installed(&self, connection_name: &str) -> Result<bool> {
        Ok(self.connections.read().await.contains(connection_name))
    }

    async fn is_output_installed(&self, output_name: &str) -> Result<bool> {
        Ok(self.outputs.read().await.contains(output_name))
    }
}

// =============================================================================
// Cache Invalidation
// =============================================================================

/// Cache keys made stale by job writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    AllJobs,
    JobStatus,
    Job(i64),
}

pub trait BaseCacheInvalidator: Send + Sync {
    fn invalidate(&self, keys: &[CacheKey]);
}

/// For deployments without a shared cache.
pub struct NoopCacheInvalidator;

impl BaseCacheInvalidator for NoopCacheInvalidator {
    fn invalidate(&self, _keys: &[CacheKey]) {}
}

// =============================================================================
// Identifier Factory
// =============================================================================

#[async_trait]
pub trait BaseIdGenerator: Send + Sync {
    async fn next_id(&self) -> Result<i64>;
}

/// Allocates job ids from the `job_id_seq` sequence.
pub struct SequenceIdGenerator {
    pool: PgPool,
}

impl SequenceIdGenerator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BaseIdGenerator for SequenceIdGenerator {
    async fn next_id(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT nextval('job_id_seq')")
            .fetch_one(&self.pool)
            .await
            .db_context("Failed to allocate job id")
    }
}
