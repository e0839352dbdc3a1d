//! Carrydown records and the per-call write plan.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CrawlStateError, Result};

// ============================================================================
// Marks
// ============================================================================

/// Per-row pass state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CarrydownMark {
    /// Confirmed by a completed pass
    Base,
    /// First seen in the current pass
    New,
    /// Re-declared in the current pass
    Existing,
}

impl CarrydownMark {
    pub fn code(self) -> &'static str {
        match self {
            CarrydownMark::Base => "B",
            CarrydownMark::New => "N",
            CarrydownMark::Existing => "E",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "B" => Ok(CarrydownMark::Base),
            "N" => Ok(CarrydownMark::New),
            "E" => Ok(CarrydownMark::Existing),
            other => Err(CrawlStateError::CorruptRow {
                kind: "carrydown mark",
                code: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// A propagated value and the hash that identifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrydownValue {
    pub hash: Option<String>,
    pub value: Option<String>,
}

impl CarrydownValue {
    /// Hash the value with SHA-256.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let hash = hex::encode(Sha256::digest(value.as_bytes()));
        Self {
            hash: Some(hash),
            value: Some(value),
        }
    }

    /// Caller-supplied hash; a blank hash means "no value".
    pub fn with_hash(hash: Option<String>, value: Option<String>) -> Self {
        Self {
            hash: hash.filter(|h| !h.trim().is_empty()),
            value,
        }
    }

    /// The "no value" variant of a data name.
    pub fn none() -> Self {
        Self {
            hash: None,
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrydownEntry {
    pub name: String,
    pub value: CarrydownValue,
}

/// Everything one parent declares for one child in this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCarrydown {
    pub child_hash: String,
    pub entries: Vec<CarrydownEntry>,
}

impl ChildCarrydown {
    pub fn new(child_hash: impl Into<String>) -> Self {
        Self {
            child_hash: child_hash.into(),
            entries: Vec::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: CarrydownValue) -> Self {
        self.entries.push(CarrydownEntry {
            name: name.into(),
            value,
        });
        self
    }
}

/// Row identity below (job, parent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CarrydownKey {
    pub child_hash: String,
    pub name: String,
    pub value_hash: Option<String>,
}

/// A stored row, as returned for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrydownRecord {
    pub job_id: i64,
    pub parent_hash: Option<String>,
    pub key: CarrydownKey,
    pub value: Option<String>,
    pub mark: CarrydownMark,
}

/// A distinct value recorded for a (job, child, name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrydownDataValue {
    pub hash: Option<String>,
    /// Empty when stored without a payload
    pub value: String,
}

// ============================================================================
// Write plan
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRow {
    pub key: CarrydownKey,
    pub value: Option<String>,
}

/// Deduplicated tuples for one `record_carrydown_data_multiple` call.
#[derive(Debug, Clone)]
pub struct CarrydownPlan {
    rows: Vec<PlannedRow>,
    child_hashes: Vec<String>,
}

/// Rows to insert as NEW, keys to mark EXISTING, and the per-child "new" flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrydownOutcome {
    pub inserts: Vec<PlannedRow>,
    pub updates: Vec<CarrydownKey>,
    pub new_children: Vec<bool>,
}

impl CarrydownPlan {
    /// Flatten declarations; the first occurrence of a key wins.
    pub fn new(children: &[ChildCarrydown]) -> Self {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();

        for child in children {
            for entry in &child.entries {
                let key = CarrydownKey {
                    child_hash: child.child_hash.clone(),
                    name: entry.name.clone(),
                    value_hash: entry.value.hash.clone(),
                };
                if seen.insert(key.clone()) {
                    // A value without a hash is never stored.
                    let value = entry.value.hash.as_ref().and_then(|_| entry.value.value.clone());
                    rows.push(PlannedRow { key, value });
                }
            }
        }

        Self {
            rows,
            child_hashes: children.iter().map(|c| c.child_hash.clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<CarrydownKey> {
        self.rows.iter().map(|row| row.key.clone()).collect()
    }

    /// Split against the keys that existed before this call's transaction.
    pub fn classify(self, existing: &HashSet<CarrydownKey>) -> CarrydownOutcome {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut inserted_children = HashSet::new();

        for row in self.rows {
            if existing.contains(&row.key) {
                updates.push(row.key);
            } else {
                inserted_children.insert(row.key.child_hash.clone());
                inserts.push(row);
            }
        }

        let new_children = self
            .child_hashes
            .iter()
            .map(|child| inserted_children.contains(child))
            .collect();

        CarrydownOutcome {
            inserts,
            updates,
            new_children,
        }
    }
}

// ============================================================================
// Value streaming
// ============================================================================

/// Drops values whose hash equals the previous one in a hash-sorted stream.
/// A missing hash compares as the empty string.
#[derive(Debug, Default)]
pub struct AdjacentDedup {
    last: Option<String>,
}

impl AdjacentDedup {
    pub fn admit(&mut self, hash: Option<&str>) -> bool {
        let hash = hash.unwrap_or("");
        if self.last.as_deref() == Some(hash) {
            return false;
        }
        self.last = Some(hash.to_string());
        true
    }
}
