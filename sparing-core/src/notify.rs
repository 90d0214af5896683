// vim: tw=80
//! Notifications sent to the external event log

#[cfg(test)] use mockall::automock;

use crate::{
    copy::{AbortReason, CopyKind, CopyPhase},
    types::*,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Notification {
    CopyStarted {
        group: RaidGroupId,
        position: PositionT,
        kind: CopyKind,
        source: DriveId,
        destination: DriveId,
    },
    PhaseChanged {
        group: RaidGroupId,
        position: PositionT,
        phase: CopyPhase,
    },
    /// Sent whenever the whole-number percent complete changes
    Progress {
        group: RaidGroupId,
        position: PositionT,
        percent: u8,
    },
    CopyCompleted {
        group: RaidGroupId,
        position: PositionT,
        drive: DriveId,
    },
    CopyAborted {
        group: RaidGroupId,
        position: PositionT,
        reason: AbortReason,
    },
    /// A source went away.  It may come back within the grace window.
    SourceGlitch {
        group: RaidGroupId,
        position: PositionT,
    },
    /// A position's drive is considered failed
    SourceFailed {
        group: RaidGroupId,
        position: PositionT,
    },
    /// Progress on a position has stopped rather than risk corruption
    ForcedRebuildRequired {
        group: RaidGroupId,
        position: PositionT,
        error: Error,
    },
}

impl Notification {
    pub fn position(&self) -> PositionT {
        match self {
            Notification::CopyStarted{position, ..} |
            Notification::PhaseChanged{position, ..} |
            Notification::Progress{position, ..} |
            Notification::CopyCompleted{position, ..} |
            Notification::CopyAborted{position, ..} |
            Notification::SourceGlitch{position, ..} |
            Notification::SourceFailed{position, ..} |
            Notification::ForcedRebuildRequired{position, ..} => *position
        }
    }
}

/// The system's event log
#[cfg_attr(test, automock)]
pub trait EventLog: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// An `EventLog` that only emits trace events
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::Progress{..} | Notification::PhaseChanged{..} =>
                tracing::debug!(?notification),
            Notification::SourceGlitch{..} |
            Notification::SourceFailed{..} |
            Notification::CopyAborted{..} =>
                tracing::warn!(?notification),
            Notification::ForcedRebuildRequired{..} =>
                tracing::error!(?notification),
            Notification::CopyStarted{..} | Notification::CopyCompleted{..} =>
                tracing::info!(?notification),
        }
    }
}
