//! Job status machine.
//!
//! Status is an explicit enum; the single-character codes exist only for the
//! `jobs.status` column. All transitions go through [`JobStatus::apply`], a
//! pure function the stores call while holding the job's row lock.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CrawlStateError, Result};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Inactive,
    ReadyForStartup,
    StartingUp,
    Active,
    ActiveUninstalled,
    ActiveWait,
    Paused,
    PausedWait,
    Aborting,
    AbortingStartingUp,
    AbortingForRestart,
    AbortingStartingUpForRestart,
    ShuttingDown,
    ReadyForDelete,
    ActiveSeeding,
    ActiveSeedingUninstalled,
    ActiveWaitSeeding,
    PausedSeeding,
    PausedWaitSeeding,
    AbortingSeeding,
    AbortingForRestartSeeding,
}

impl JobStatus {
    pub const ALL: [JobStatus; 21] = [
        JobStatus::Inactive,
        JobStatus::ReadyForStartup,
        JobStatus::StartingUp,
        JobStatus::Active,
        JobStatus::ActiveUninstalled,
        JobStatus::ActiveWait,
        JobStatus::Paused,
        JobStatus::PausedWait,
        JobStatus::Aborting,
        JobStatus::AbortingStartingUp,
        JobStatus::AbortingForRestart,
        JobStatus::AbortingStartingUpForRestart,
        JobStatus::ShuttingDown,
        JobStatus::ReadyForDelete,
        JobStatus::ActiveSeeding,
        JobStatus::ActiveSeedingUninstalled,
        JobStatus::ActiveWaitSeeding,
        JobStatus::PausedSeeding,
        JobStatus::PausedWaitSeeding,
        JobStatus::AbortingSeeding,
        JobStatus::AbortingForRestartSeeding,
    ];

    /// Code persisted in `jobs.status`.
    pub fn code(self) -> &'static str {
        match self {
            JobStatus::Inactive => "N",
            JobStatus::ReadyForStartup => "C",
            JobStatus::StartingUp => "B",
            JobStatus::Active => "A",
            JobStatus::ActiveUninstalled => "R",
            JobStatus::ActiveWait => "W",
            JobStatus::Paused => "P",
            JobStatus::PausedWait => "Z",
            JobStatus::Aborting => "X",
            JobStatus::AbortingStartingUp => "Q",
            JobStatus::AbortingForRestart => "Y",
            JobStatus::AbortingStartingUpForRestart => "T",
            JobStatus::ShuttingDown => "S",
            JobStatus::ReadyForDelete => "E",
            JobStatus::ActiveSeeding => "a",
            JobStatus::ActiveSeedingUninstalled => "r",
            JobStatus::ActiveWaitSeeding => "w",
            JobStatus::PausedSeeding => "p",
            JobStatus::PausedWaitSeeding => "z",
            JobStatus::AbortingSeeding => "x",
            JobStatus::AbortingForRestartSeeding => "y",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.code() == code)
            .ok_or_else(|| CrawlStateError::CorruptRow {
                kind: "job status",
                code: code.to_string(),
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Inactive => "INACTIVE",
            JobStatus::ReadyForStartup => "READYFORSTARTUP",
            JobStatus::StartingUp => "STARTINGUP",
            JobStatus::Active => "ACTIVE",
            JobStatus::ActiveUninstalled => "ACTIVE_UNINSTALLED",
            JobStatus::ActiveWait => "ACTIVEWAIT",
            JobStatus::Paused => "PAUSED",
            JobStatus::PausedWait => "PAUSEDWAIT",
            JobStatus::Aborting => "ABORTING",
            JobStatus::AbortingStartingUp => "ABORTINGSTARTINGUP",
            JobStatus::AbortingForRestart => "ABORTINGFORRESTART",
            JobStatus::AbortingStartingUpForRestart => "ABORTINGSTARTINGUPFORRESTART",
            JobStatus::ShuttingDown => "SHUTTINGDOWN",
            JobStatus::ReadyForDelete => "READYFORDELETE",
            JobStatus::ActiveSeeding => "ACTIVESEEDING",
            JobStatus::ActiveSeedingUninstalled => "ACTIVESEEDING_UNINSTALLED",
            JobStatus::ActiveWaitSeeding => "ACTIVEWAITSEEDING",
            JobStatus::PausedSeeding => "PAUSEDSEEDING",
            JobStatus::PausedWaitSeeding => "PAUSEDWAITSEEDING",
            JobStatus::AbortingSeeding => "ABORTINGSEEDING",
            JobStatus::AbortingForRestartSeeding => "ABORTINGFORRESTARTSEEDING",
        }
    }

    pub fn is_seeding(self) -> bool {
        self.without_seeding() != self
    }

    /// Non-seeding counterpart; identity for non-seeding states.
    pub fn without_seeding(self) -> JobStatus {
        match self {
            JobStatus::ActiveSeeding => JobStatus::Active,
            JobStatus::ActiveSeedingUninstalled => JobStatus::ActiveUninstalled,
            JobStatus::ActiveWaitSeeding => JobStatus::ActiveWait,
            JobStatus::PausedSeeding => JobStatus::Paused,
            JobStatus::PausedWaitSeeding => JobStatus::PausedWait,
            JobStatus::AbortingSeeding => JobStatus::Aborting,
            JobStatus::AbortingForRestartSeeding => JobStatus::AbortingForRestart,
            other => other,
        }
    }

    /// Seeding counterpart, for states where seeding can begin.
    pub fn with_seeding(self) -> Option<JobStatus> {
        match self {
            JobStatus::Active => Some(JobStatus::ActiveSeeding),
            JobStatus::ActiveUninstalled => Some(JobStatus::ActiveSeedingUninstalled),
            JobStatus::ActiveWait => Some(JobStatus::ActiveWaitSeeding),
            JobStatus::Paused => Some(JobStatus::PausedSeeding),
            JobStatus::PausedWait => Some(JobStatus::PausedWaitSeeding),
            JobStatus::Aborting => Some(JobStatus::AbortingSeeding),
            JobStatus::AbortingForRestart => Some(JobStatus::AbortingForRestartSeeding),
            _ => None,
        }
    }

    /// States the crawl driver treats as "documents may be processed".
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Active | JobStatus::ActiveSeeding)
    }

    pub fn is_aborting(self) -> bool {
        matches!(
            self,
            JobStatus::Aborting
                | JobStatus::AbortingSeeding
                | JobStatus::AbortingStartingUp
                | JobStatus::AbortingForRestart
                | JobStatus::AbortingForRestartSeeding
                | JobStatus::AbortingStartingUpForRestart
        )
    }

    /// Apply a lifecycle event to this status.
    pub fn apply(self, event: JobEvent) -> std::result::Result<Transition, TransitionError> {
        use JobStatus::*;
        use Transition::{To, Unchanged};

        let invalid = Err(TransitionError {
            from: self,
            operation: event.name(),
        });
        let active = |installed: bool| if installed { Active } else { ActiveUninstalled };
        let active_seeding = |installed: bool| {
            if installed {
                ActiveSeeding
            } else {
                ActiveSeedingUninstalled
            }
        };

        match event {
            JobEvent::Start => Ok(To(ReadyForStartup)),

            JobEvent::BeginStartup => match self {
                ReadyForStartup => Ok(To(StartingUp)),
                _ => invalid,
            },

            JobEvent::Started { installed } => match self {
                StartingUp => Ok(To(active(installed))),
                AbortingStartingUp => Ok(To(Aborting)),
                AbortingStartingUpForRestart => Ok(To(AbortingForRestart)),
                _ => invalid,
            },

            JobEvent::BeginSeeding => match self.with_seeding() {
                Some(seeding) => Ok(To(seeding)),
                None => invalid,
            },

            JobEvent::Seeded => {
                if self.is_seeding() {
                    Ok(To(self.without_seeding()))
                } else {
                    invalid
                }
            }

            JobEvent::Wait => match self {
                Active | ActiveUninstalled => Ok(To(ActiveWait)),
                Paused => Ok(To(PausedWait)),
                ActiveSeeding | ActiveSeedingUninstalled => Ok(To(ActiveWaitSeeding)),
                PausedSeeding => Ok(To(PausedWaitSeeding)),
                _ => invalid,
            },

            JobEvent::Unwait { installed } => match self {
                ActiveWait => Ok(To(active(installed))),
                PausedWait => Ok(To(Paused)),
                ActiveWaitSeeding => Ok(To(active_seeding(installed))),
                PausedWaitSeeding => Ok(To(PausedSeeding)),
                _ => invalid,
            },

            JobEvent::Pause => match self {
                Active | ActiveUninstalled => Ok(To(Paused)),
                ActiveWait => Ok(To(PausedWait)),
                ActiveSeeding | ActiveSeedingUninstalled => Ok(To(PausedSeeding)),
                ActiveWaitSeeding => Ok(To(PausedWaitSeeding)),
                _ => invalid,
            },

            JobEvent::Resume { installed } => match self {
                Paused => Ok(To(active(installed))),
                PausedWait => Ok(To(ActiveWait)),
                PausedSeeding => Ok(To(active_seeding(installed))),
                PausedWaitSeeding => Ok(To(ActiveWaitSeeding)),
                _ => invalid,
            },

            JobEvent::Abort => match self {
                Aborting | AbortingSeeding | AbortingStartingUp => Ok(Unchanged),
                StartingUp | AbortingStartingUpForRestart => Ok(To(AbortingStartingUp)),
                ReadyForStartup | Active | ActiveUninstalled | ActiveWait | Paused
                | PausedWait | AbortingForRestart => Ok(To(Aborting)),
                ActiveSeeding | ActiveSeedingUninstalled | ActiveWaitSeeding | PausedSeeding
                | PausedWaitSeeding | AbortingForRestartSeeding => Ok(To(AbortingSeeding)),
                Inactive | ShuttingDown | ReadyForDelete => invalid,
            },

            JobEvent::AbortForRestart => match self {
                AbortingForRestart | AbortingForRestartSeeding | AbortingStartingUpForRestart => {
                    Ok(Unchanged)
                }
                StartingUp => Ok(To(AbortingStartingUpForRestart)),
                ReadyForStartup | Active | ActiveUninstalled | ActiveWait | Paused
                | PausedWait => Ok(To(AbortingForRestart)),
                ActiveSeeding | ActiveSeedingUninstalled | ActiveWaitSeeding | PausedSeeding
                | PausedWaitSeeding => Ok(To(AbortingForRestartSeeding)),
                _ => invalid,
            },

            JobEvent::BeginShutdown => match self {
                Active | ActiveUninstalled => Ok(To(ShuttingDown)),
                _ => invalid,
            },

            JobEvent::Finish | JobEvent::FinishAbort => Ok(To(Inactive)),

            JobEvent::MarkForDelete => match self {
                Inactive => Ok(To(ReadyForDelete)),
                _ => invalid,
            },

            JobEvent::ConnectorDeregistered => match self {
                Active => Ok(To(ActiveUninstalled)),
                ActiveSeeding => Ok(To(ActiveSeedingUninstalled)),
                _ => Ok(Unchanged),
            },

            JobEvent::ConnectorRegistered { installed } => match self {
                ActiveUninstalled if installed => Ok(To(Active)),
                ActiveSeedingUninstalled if installed => Ok(To(ActiveSeeding)),
                _ => Ok(Unchanged),
            },

            JobEvent::ProcessRestart => {
                let startup = self.apply(JobEvent::ResetStartupWorker)?;
                match startup {
                    To(next) => Ok(To(next)),
                    Unchanged => self.apply(JobEvent::ResetSeedingWorker),
                }
            }

            JobEvent::ResetStartupWorker => match self {
                StartingUp => Ok(To(ReadyForStartup)),
                AbortingStartingUp => Ok(To(Aborting)),
                AbortingStartingUpForRestart => Ok(To(AbortingForRestart)),
                _ => Ok(Unchanged),
            },

            JobEvent::ResetSeedingWorker => {
                if self.is_seeding() {
                    Ok(To(self.without_seeding()))
                } else {
                    Ok(Unchanged)
                }
            }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Lifecycle events. `installed` is whether both the job's repository and
/// output connectors are registered at the time of the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    BeginStartup,
    Started { installed: bool },
    BeginSeeding,
    Seeded,
    Wait,
    Unwait { installed: bool },
    Pause,
    Resume { installed: bool },
    Abort,
    AbortForRestart,
    BeginShutdown,
    Finish,
    FinishAbort,
    MarkForDelete,
    ConnectorDeregistered,
    ConnectorRegistered { installed: bool },
    ProcessRestart,
    ResetStartupWorker,
    ResetSeedingWorker,
}

impl JobEvent {
    pub fn name(self) -> &'static str {
        match self {
            JobEvent::Start => "start",
            JobEvent::BeginStartup => "begin startup",
            JobEvent::Started { .. } => "note started",
            JobEvent::BeginSeeding => "begin seeding",
            JobEvent::Seeded => "note seeded",
            JobEvent::Wait => "wait",
            JobEvent::Unwait { .. } => "unwait",
            JobEvent::Pause => "pause",
            JobEvent::Resume { .. } => "resume",
            JobEvent::Abort => "abort",
            JobEvent::AbortForRestart => "abort for restart",
            JobEvent::BeginShutdown => "shut down",
            JobEvent::Finish => "finish",
            JobEvent::FinishAbort => "finish abort",
            JobEvent::MarkForDelete => "mark for delete",
            JobEvent::ConnectorDeregistered => "note connector deregistration",
            JobEvent::ConnectorRegistered { .. } => "note connector registration",
            JobEvent::ProcessRestart => "recover after restart",
            JobEvent::ResetStartupWorker => "reset startup worker",
            JobEvent::ResetSeedingWorker => "reset seeding worker",
        }
    }

    /// Events that report `Unchanged` instead of failing when nothing applies.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            JobEvent::Abort
                | JobEvent::AbortForRestart
                | JobEvent::ConnectorDeregistered
                | JobEvent::ConnectorRegistered { .. }
                | JobEvent::ProcessRestart
                | JobEvent::ResetStartupWorker
                | JobEvent::ResetSeedingWorker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(JobStatus),
    Unchanged,
}

impl Transition {
    pub fn target(self, current: JobStatus) -> JobStatus {
        match self {
            Transition::To(next) => next,
            Transition::Unchanged => current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: JobStatus,
    pub operation: &'static str,
}

impl TransitionError {
    pub fn for_job(self, job_id: i64) -> CrawlStateError {
        CrawlStateError::InvalidState {
            job_id,
            status: self.from,
            operation: self.operation,
        }
    }
}
