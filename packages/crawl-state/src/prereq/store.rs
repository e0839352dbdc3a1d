use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;

use crate::error::Result;
use crate::sql::OwnerQuery;

/// Distinct, non-empty event names in first-seen order.
pub(crate) fn distinct_events(event_names: &[String]) -> Vec<&str> {
    let mut seen = BTreeSet::new();
    event_names
        .iter()
        .map(String::as_str)
        .filter(|name| !name.is_empty() && seen.insert(*name))
        .collect()
}

/// Existence gate: an owner record is dequeue-eligible only while it has no rows here.
#[async_trait]
pub trait PrereqEventStore: Send + Sync {
    /// Block `owner_id` on each event. Names already present are ignored.
    async fn add_rows(&self, owner_id: i64, event_names: &[String]) -> Result<()>;

    async fn delete_rows(&self, owner_id: i64) -> Result<()>;

    async fn delete_rows_for_owners(&self, owner_ids: &[i64]) -> Result<()>;

    /// Delete the events of every owner selected by `owners`.
    async fn delete_rows_matching(&self, owners: &OwnerQuery) -> Result<()>;

    /// The subset of `owner_ids` that still has at least one outstanding event.
    async fn owners_with_outstanding_events(&self, owner_ids: &[i64]) -> Result<HashSet<i64>>;

    async fn is_blocked(&self, owner_id: i64) -> Result<bool> {
        Ok(!self
            .owners_with_outstanding_events(&[owner_id])
            .await?
            .is_empty())
    }

    async fn events_for_owner(&self, owner_id: i64) -> Result<Vec<String>>;

    async fn conditionally_maintain(&self) -> Result<()>;
}
