//! Events that must clear before a queued record may be dequeued.

mod postgres;
mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use postgres::PostgresPrereqEventStore;
pub use store::PrereqEventStore;
