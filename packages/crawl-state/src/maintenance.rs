//! Advisory counters that decide when a table's statistics or indexes need upkeep.
//!
//! Each store owns one [`TableMaintenance`] per table handle. Mutations note
//! row events against it; the driver periodically calls
//! `conditionally_maintain`, which runs `ANALYZE` / `REINDEX` only for the
//! throttles that have counted down to zero.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use sqlx::PgPool;
use tracing::{debug, warn};

use crate::error::{DbContext, Result};

/// Starting countdown and the count to re-arm with after each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSettings {
    pub initial: u64,
    pub repeat: u64,
}

impl ThrottleSettings {
    pub const fn new(initial: u64, repeat: u64) -> Self {
        Self { initial, repeat }
    }
}

/// Counting latch with a busy flag.
///
/// At most one caller observes `check_action() == true` per arming. The
/// counter is best-effort under concurrency; it never gates correctness.
#[derive(Debug)]
pub struct MaintenanceThrottle {
    remaining: AtomicU64,
    busy: AtomicBool,
}

impl MaintenanceThrottle {
    pub fn new(initial: u64) -> Self {
        Self {
            remaining: AtomicU64::new(initial),
            busy: AtomicBool::new(false),
        }
    }

    /// Count `n` events toward the next action, flooring at zero.
    pub fn note_event(&self, n: u64) {
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            });
    }

    /// True exactly once when the countdown has reached zero, until `note_action`.
    pub fn check_action(&self) -> bool {
        if self.busy.load(Ordering::Acquire) {
            return false;
        }
        if self.remaining.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Re-arm after an action ran.
    pub fn note_action(&self, repeat: u64) {
        self.remaining.store(repeat, Ordering::Release);
        self.busy.store(false, Ordering::Release);
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    Analyze,
    Reindex,
}

#[derive(Debug)]
struct Throttled {
    throttle: MaintenanceThrottle,
    repeat: u64,
}

impl Throttled {
    fn new(settings: ThrottleSettings) -> Self {
        Self {
            throttle: MaintenanceThrottle::new(settings.initial),
            repeat: settings.repeat,
        }
    }
}

/// Analyze (and optionally reindex) throttles for one table.
#[derive(Debug)]
pub struct TableMaintenance {
    table: &'static str,
    analyze: Throttled,
    reindex: Option<Throttled>,
}

impl TableMaintenance {
    pub fn new(table: &'static str, analyze: ThrottleSettings) -> Self {
        Self {
            table,
            analyze: Throttled::new(analyze),
            reindex: None,
        }
    }

    pub fn with_reindex(mut self, reindex: ThrottleSettings) -> Self {
        self.reindex = Some(Throttled::new(reindex));
        self
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn note(&self, kind: MaintenanceKind, n: u64) {
        if let Some(throttled) = self.throttled(kind) {
            throttled.throttle.note_event(n);
        }
    }

    /// Note `n` events against every throttle this table has.
    pub fn note_all(&self, n: u64) {
        self.note(MaintenanceKind::Analyze, n);
        self.note(MaintenanceKind::Reindex, n);
    }

    /// Claim every throttle that has fired. Claimed throttles stay busy until `complete`.
    pub fn claim_due(&self) -> Vec<MaintenanceKind> {
        [MaintenanceKind::Analyze, MaintenanceKind::Reindex]
            .into_iter()
            .filter(|kind| {
                self.throttled(*kind)
                    .is_some_and(|throttled| throttled.throttle.check_action())
            })
            .collect()
    }

    pub fn complete(&self, kind: MaintenanceKind) {
        if let Some(throttled) = self.throttled(kind) {
            throttled.throttle.note_action(throttled.repeat);
        }
    }

    pub fn remaining(&self, kind: MaintenanceKind) -> Option<u64> {
        self.throttled(kind).map(|t| t.throttle.remaining())
    }

    /// Run whichever of `ANALYZE` / `REINDEX TABLE` is due.
    ///
    /// A claimed throttle is re-armed even when its statement fails, so one
    /// failure cannot wedge it busy forever.
    pub async fn run_due(&self, pool: &PgPool) -> Result<Vec<MaintenanceKind>> {
        let due = self.claim_due();
        let mut first_error = None;

        for kind in &due {
            let statement = match kind {
                MaintenanceKind::Analyze => format!("ANALYZE {}", self.table),
                MaintenanceKind::Reindex => format!("REINDEX TABLE {}", self.table),
            };
            let started = Instant::now();
            let result = sqlx::query(&statement)
                .execute(pool)
                .await
                .db_context("Failed to run table maintenance");
            self.complete(*kind);

            match result {
                Ok(_) => debug!(
                    table = self.table,
                    ?kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Table maintenance complete"
                ),
                Err(e) => {
                    warn!(table = self.table, ?kind, error = %e, "Table maintenance failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(due),
        }
    }

    fn throttled(&self, kind: MaintenanceKind) -> Option<&Throttled> {
        match kind {
            MaintenanceKind::Analyze => Some(&self.analyze),
            MaintenanceKind::Reindex => self.reindex.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_only_after_repeat_events() {
        let throttle = MaintenanceThrottle::new(5);
        throttle.note_action(10);

        for _ in 0..9 {
            throttle.note_event(1);
            assert!(!throttle.check_action());
        }
        throttle.note_event(1);
        assert!(throttle.check_action());
    }

    #[test]
    fn fires_exactly_once_until_rearmed() {
        let throttle = MaintenanceThrottle::new(3);
        throttle.note_event(3);

        assert!(throttle.check_action());
        assert!(!throttle.check_action());
        throttle.note_event(100);
        assert!(!throttle.check_action());

        throttle.note_action(2);
        assert!(!throttle.check_action());
        throttle.note_event(2);
        assert!(throttle.check_action());
    }

    #[test]
    fn counter_floors_at_zero() {
        let throttle = MaintenanceThrottle::new(2);
        throttle.note_event(50);
        assert_eq!(throttle.remaining(), 0);
    }

    #[test]
    fn zero_initial_fires_immediately() {
        let throttle = MaintenanceThrottle::new(0);
        assert!(throttle.check_action());
    }

    #[test]
    fn concurrent_checkers_claim_once() {
        let throttle = std::sync::Arc::new(MaintenanceThrottle::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = throttle.clone();
                std::thread::spawn(move || throttle.check_action())
            })
            .collect();

        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fired| *fired)
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn table_without_reindex_ignores_reindex_events() {
        let table = TableMaintenance::new("carrydown", ThrottleSettings::new(2, 4));
        table.note(MaintenanceKind::Reindex, 10);
        assert_eq!(table.remaining(MaintenanceKind::Reindex), None);
        assert!(table.claim_due().is_empty());

        table.note_all(2);
        assert_eq!(table.claim_due(), vec![MaintenanceKind::Analyze]);
        table.complete(MaintenanceKind::Analyze);
        assert_eq!(table.remaining(MaintenanceKind::Analyze), Some(4));
    }

    #[test]
    fn reindex_counts_independently() {
        let table = TableMaintenance::new("hop_delete_deps", ThrottleSettings::new(1, 10))
            .with_reindex(ThrottleSettings::new(3, 30));

        table.note(MaintenanceKind::Reindex, 3);
        assert_eq!(table.claim_due(), vec![MaintenanceKind::Reindex]);
        table.complete(MaintenanceKind::Reindex);
        assert_eq!(table.remaining(MaintenanceKind::Analyze), Some(1));
        assert_eq!(table.remaining(MaintenanceKind::Reindex), Some(30));
    }
}
