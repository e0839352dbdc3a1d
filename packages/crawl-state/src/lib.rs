// Crawl State - consistency core of an incremental crawler
//
// Owns the job lifecycle state machine and the bookkeeping tables the crawl
// driver writes while it discovers documents: carrydown propagation, hop-count
// delete dependencies and prerequisite events. Each table store throttles its
// own statistics and index maintenance.

pub mod carrydown;
pub mod config;
pub mod error;
pub mod hop_deps;
pub mod jobs;
pub mod maintenance;
pub mod prereq;
pub mod sql;
pub mod state;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod test_dependencies;

pub use config::*;
pub use error::{CrawlStateError, DbContext, Result};
pub use state::{migrate, CrawlState, RecoveryReport};
