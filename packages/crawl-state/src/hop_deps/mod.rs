//! Which graph edges each cached hop count was derived from, so that removing
//! an edge invalidates exactly the caches that used it.

mod model;
mod postgres;
mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use model::DeleteDependency;
pub use postgres::PostgresHopDeleteDepsStore;
pub use store::HopDeleteDepsStore;
