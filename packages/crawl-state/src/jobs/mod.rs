//! Job definitions and the lifecycle status machine.
//!
//! ```text
//!   INACTIVE ──start──► READYFORSTARTUP ──► STARTINGUP ──started──► ACTIVE[_UNINSTALLED]
//!      ▲                                                         │  ▲   │
//!      │ finish / finishAbort                            seeding │  │   │ pause / wait
//!      │                                                         ▼  │   ▼
//!   SHUTTINGDOWN / ABORTING*  ◄──abort──  ACTIVESEEDING ...     PAUSED / ACTIVEWAIT ...
//! ```
//!
//! Transitions are computed by [`JobStatus::apply`]; [`JobManager`] runs them
//! through a [`JobStore`] under a row lock.

mod manager;
mod model;
mod postgres;
mod status;
mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use manager::JobManager;
pub use model::{
    EnumeratedValues, HopcountMode, Job, JobState, JobType, ScheduleRecord, StartMethod,
    StatusUpdate,
};
pub use postgres::PostgresJobStore;
pub use status::{JobEvent, JobStatus, Transition, TransitionError};
pub use store::{JobStore, SaveOutcome, StateChange, StateUpdateFn};
