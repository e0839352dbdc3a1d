//! Parent -> child metadata propagation with pass-level change detection.
//!
//! Each row carries a tri-state mark:
//!
//! ```text
//! record (absent)  ──► NEW
//! record (present) ──► EXISTING
//! restore_records  ──► BASE rows deleted (not re-declared), NEW/EXISTING ──► BASE
//! reset            ──► NEW rows deleted, EXISTING ──► BASE
//! ```

mod model;
mod postgres;
mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use model::{
    AdjacentDedup, CarrydownDataValue, CarrydownEntry, CarrydownKey, CarrydownMark,
    CarrydownOutcome, CarrydownPlan, CarrydownRecord, CarrydownValue, ChildCarrydown, PlannedRow,
};
pub use postgres::PostgresCarrydownStore;
pub use store::{CarrydownFile, CarrydownStore};
