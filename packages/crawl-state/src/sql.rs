//! Shared SQL building blocks: bounded predicate batches and owner subqueries.

use sqlx::{Postgres, QueryBuilder};

use crate::error::{CrawlStateError, Result};

/// Upper bound on OR/IN clauses in a single statement.
pub const MAX_CLAUSE: usize = 25;

/// Append `column IN ($1, $2, ...)` for a non-empty slice of values.
pub fn push_in_list<'args, T>(
    builder: &mut QueryBuilder<'args, Postgres>,
    column: &str,
    values: &'args [T],
) where
    T: sqlx::Encode<'args, Postgres> + sqlx::Type<Postgres> + Sync + 'args,
{
    builder.push(column).push(" IN (");
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

/// Append `column = $n`, or `column IS NULL` when there is no value.
pub fn push_nullable_eq<'args>(
    builder: &mut QueryBuilder<'args, Postgres>,
    column: &str,
    value: Option<&str>,
) {
    builder.push(column);
    match value {
        Some(value) => {
            builder.push(" = ").push_bind(value.to_string());
        }
        None => {
            builder.push(" IS NULL");
        }
    }
}

/// A scalar bound into an owner query filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    BigInt(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    Eq(String, SqlValue),
    IsNull(String),
    NotNull(String),
}

/// Selects owner ids from another table, e.g. the hop-count cache rows being
/// invalidated or the queue rows of one job.
///
/// Identifiers are validated on construction; values are always bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerQuery {
    table: String,
    column: String,
    filters: Vec<OwnerFilter>,
}

impl OwnerQuery {
    pub fn new(table: &str, column: &str) -> Result<Self> {
        Ok(Self {
            table: identifier(table)?,
            column: identifier(column)?,
            filters: Vec::new(),
        })
    }

    pub fn filter_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Result<Self> {
        self.filters
            .push(OwnerFilter::Eq(identifier(column)?, value.into()));
        Ok(self)
    }

    pub fn filter_null(mut self, column: &str) -> Result<Self> {
        self.filters.push(OwnerFilter::IsNull(identifier(column)?));
        Ok(self)
    }

    pub fn filter_not_null(mut self, column: &str) -> Result<Self> {
        self.filters.push(OwnerFilter::NotNull(identifier(column)?));
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn filters(&self) -> &[OwnerFilter] {
        &self.filters
    }

    /// `SELECT <column> FROM <table> WHERE <filters>`, for use inside `IN (...)`.
    pub fn push_subquery(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        builder
            .push("SELECT ")
            .push(&self.column)
            .push(" FROM ")
            .push(&self.table);
        self.push_filters(builder, " WHERE ", None);
    }

    /// `EXISTS (SELECT 'x' FROM <table> WHERE <column> = <outer> AND <filters>)`.
    pub fn push_exists(&self, builder: &mut QueryBuilder<'_, Postgres>, outer_column: &str) {
        builder
            .push("EXISTS (SELECT 'x' FROM ")
            .push(&self.table)
            .push(" p WHERE p.")
            .push(&self.column)
            .push(" = ")
            .push(outer_column);
        self.push_filters(builder, " AND ", Some("p."));
        builder.push(")");
    }

    fn push_filters(
        &self,
        builder: &mut QueryBuilder<'_, Postgres>,
        first_joiner: &str,
        qualifier: Option<&str>,
    ) {
        let qualifier = qualifier.unwrap_or("");
        for (i, filter) in self.filters.iter().enumerate() {
            builder.push(if i == 0 { first_joiner } else { " AND " });
            match filter {
                OwnerFilter::Eq(column, value) => {
                    builder.push(qualifier).push(column).push(" = ");
                    match value {
                        SqlValue::BigInt(v) => builder.push_bind(*v),
                        SqlValue::Text(v) => builder.push_bind(v.clone()),
                    };
                }
                OwnerFilter::IsNull(column) => {
                    builder.push(qualifier).push(column).push(" IS NULL");
                }
                OwnerFilter::NotNull(column) => {
                    builder.push(qualifier).push(column).push(" IS NOT NULL");
                }
            }
        }
    }
}

fn identifier(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid && name.len() <= 63 {
        Ok(name.to_ascii_lowercase())
    } else {
        Err(CrawlStateError::InvalidIdentifier(name.to_string()))
    }
}
