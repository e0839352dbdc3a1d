//! Error types for crawl-state stores and the job lifecycle.

use thiserror::Error;

use crate::jobs::JobStatus;

/// Errors surfaced by the crawl-state stores.
#[derive(Debug, Error)]
pub enum CrawlStateError {
    /// The job's current status has no transition for the requested operation.
    #[error("job {job_id} cannot {operation} while {status}")]
    InvalidState {
        job_id: i64,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("job {0} not found")]
    JobNotFound(i64),

    /// Table or column name rejected while building an owner query.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A persisted single-character code did not map to a known value.
    #[error("unrecognized {kind} code {code:?} in stored row")]
    CorruptRow { kind: &'static str, code: String },

    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl CrawlStateError {
    /// Storage failures are the only transient class; everything else is a caller bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, CrawlStateError::Storage { .. })
    }
}

pub type Result<T> = std::result::Result<T, CrawlStateError>;

/// Attach a static description to a database failure, in the manner of `anyhow::Context`.
pub trait DbContext<T> {
    fn db_context(self, context: &'static str) -> Result<T>;
}

impl<T> DbContext<T> for std::result::Result<T, sqlx::Error> {
    fn db_context(self, context: &'static str) -> Result<T> {
        self.map_err(|source| CrawlStateError::Storage { context, source })
    }
}

impl<T> DbContext<T> for std::io::Result<T> {
    fn db_context(self, context: &'static str) -> Result<T> {
        self.map_err(|source| CrawlStateError::Io { context, source })
    }
}
