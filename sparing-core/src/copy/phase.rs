// vim: tw=80
//! Copy phases and the pure transition function between them

use std::fmt;

use tokio::time::Instant;

use crate::{
    edge::{EdgeStatus, Leg},
    types::*,
};

/// Why a copy was requested
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyKind {
    /// The source drive is nearing the end of its life
    Proactive,
    /// An administrator asked for a copy onto any suitable spare
    User,
    /// An administrator asked for a copy onto a specific spare
    UserTo(DriveId),
}

impl CopyKind {
    /// The spare this copy insists on, if any
    pub fn wanted(&self) -> Option<DriveId> {
        match self {
            CopyKind::UserTo(drive) => Some(*drive),
            CopyKind::Proactive | CopyKind::User => None
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortReason {
    Cancelled,
    DestinationFailed,
    /// The source went away and the copy wasn't far enough along to finish
    /// without it
    SourceFailed,
}

/// Where a copy picks up after its source glitches and comes back
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Redo the metadata rebuild
    Mirror,
    MetadataRebuilt,
    DataCopy,
}

impl Resume {
    pub fn phase(self) -> CopyPhase {
        match self {
            Resume::Mirror => CopyPhase::ModeSetToMirror,
            Resume::MetadataRebuilt => CopyPhase::MetadataRebuildDone,
            Resume::DataCopy => CopyPhase::DataCopyInProgress,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyPhase {
    Requested,
    /// The destination is attached as the edge's second leg
    ModeSetToMirror,
    MetadataRebuildStart,
    MetadataRebuildDone,
    DataCopyInProgress,
    /// The source is temporarily unavailable
    SourceGlitch {
        deadline: Instant,
        resume: Resume
    },
    /// Every chunk is on the destination.  Waiting for the swap.
    CopyOperationComplete,
    SwappedOut,
    Aborted(AbortReason),
    /// Stopped by an internal consistency violation.  Only cancellation can
    /// move it on.
    Halted(Error),
}

impl CopyPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CopyPhase::SwappedOut | CopyPhase::Aborted(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CopyPhase::Requested => "Requested",
            CopyPhase::ModeSetToMirror => "ModeSetToMirror",
            CopyPhase::MetadataRebuildStart => "MetadataRebuildStart",
            CopyPhase::MetadataRebuildDone => "MetadataRebuildDone",
            CopyPhase::DataCopyInProgress => "DataCopyInProgress",
            CopyPhase::SourceGlitch{..} => "SourceGlitch",
            CopyPhase::CopyOperationComplete => "CopyOperationComplete",
            CopyPhase::SwappedOut => "SwappedOut",
            CopyPhase::Aborted(_) => "Aborted",
            CopyPhase::Halted(_) => "Halted",
        }
    }
}

impl fmt::Display for CopyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyPhase::Aborted(reason) => write!(f, "Aborted({reason:?})"),
            CopyPhase::Halted(e) => write!(f, "Halted({e})"),
            _ => self.name().fmt(f)
        }
    }
}

/// Everything that can happen to a copy from the outside
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyInput {
    SourceDisabled,
    SourceEnabled,
    SourceGone,
    DestinationEnabled,
    /// The destination was disabled or removed
    DestinationFailed,
    Cancel,
    /// The grace timer fired at the given instant
    GraceExpired(Instant),
}

impl CopyInput {
    pub fn from_edge(which: Leg, status: EdgeStatus) -> Self {
        match (which, status) {
            (Leg::Source, EdgeStatus::Enabled) => CopyInput::SourceEnabled,
            (Leg::Source, EdgeStatus::Disabled) => CopyInput::SourceDisabled,
            (Leg::Source, EdgeStatus::Gone) => CopyInput::SourceGone,
            (Leg::Destination, EdgeStatus::Enabled) =>
                CopyInput::DestinationEnabled,
            (Leg::Destination, EdgeStatus::Disabled) |
            (Leg::Destination, EdgeStatus::Gone) =>
                CopyInput::DestinationFailed,
        }
    }
}

/// What the state machine must do in response to an input
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    Ignore,
    Reject(Error),
    /// Start the grace timer
    BeginGlitch(Resume),
    /// The source came back in time
    Resume(Resume),
    /// The source is gone for good.  With `recheck`, look at the edge once
    /// more before committing to that.
    SourceLost {
        resume: Resume,
        recheck: bool
    },
    Abort {
        reason: AbortReason,
        /// The source was down at the time, so the position must be degraded
        source_down: bool
    },
}

impl Step {
    /// Does carrying out this step touch the group's bitmaps?  If so the
    /// caller must hold an exclusive lock over the whole position.
    pub fn needs_position_lock(&self) -> bool {
        match self {
            Step::Ignore | Step::Reject(_) | Step::BeginGlitch(_) => false,
            Step::Resume(_) | Step::SourceLost{..} | Step::Abort{..} => true,
        }
    }
}

/// Decide what an input means for a copy in the given phase.
///
/// This doesn't change anything.  The machine carries out the returned
/// [`Step`].
pub fn transition(phase: &CopyPhase, input: CopyInput) -> Step {
    let resume = match phase {
        CopyPhase::Requested |
        CopyPhase::ModeSetToMirror |
        CopyPhase::MetadataRebuildStart => Resume::Mirror,
        CopyPhase::MetadataRebuildDone => Resume::MetadataRebuilt,
        CopyPhase::DataCopyInProgress => Resume::DataCopy,
        CopyPhase::SourceGlitch{deadline, resume} => {
            return match input {
                CopyInput::SourceDisabled |
                CopyInput::DestinationEnabled => Step::Ignore,
                CopyInput::SourceEnabled => Step::Resume(*resume),
                CopyInput::SourceGone => Step::SourceLost {
                    resume: *resume,
                    recheck: false
                },
                CopyInput::DestinationFailed => Step::Abort {
                    reason: AbortReason::DestinationFailed,
                    source_down: true
                },
                CopyInput::Cancel => Step::Abort {
                    reason: AbortReason::Cancelled,
                    source_down: true
                },
                CopyInput::GraceExpired(now) if now >= *deadline =>
                    Step::SourceLost { resume: *resume, recheck: true },
                CopyInput::GraceExpired(_) => Step::Ignore,
            };
        }
        CopyPhase::CopyOperationComplete => {
            return match input {
                CopyInput::SourceDisabled |
                CopyInput::SourceEnabled |
                CopyInput::SourceGone |
                CopyInput::DestinationEnabled |
                CopyInput::GraceExpired(_) => Step::Ignore,
                CopyInput::DestinationFailed => Step::Abort {
                    reason: AbortReason::DestinationFailed,
                    source_down: false
                },
                CopyInput::Cancel => Step::Abort {
                    reason: AbortReason::Cancelled,
                    source_down: false
                },
            };
        }
        CopyPhase::Halted(_) => {
            return match input {
                CopyInput::Cancel => Step::Abort {
                    reason: AbortReason::Cancelled,
                    source_down: false
                },
                CopyInput::SourceDisabled |
                CopyInput::SourceEnabled |
                CopyInput::SourceGone |
                CopyInput::DestinationEnabled |
                CopyInput::DestinationFailed |
                CopyInput::GraceExpired(_) => Step::Ignore,
            };
        }
        CopyPhase::SwappedOut | CopyPhase::Aborted(_) => {
            return match input {
                CopyInput::Cancel =>
                    Step::Reject(Error::InvalidPhase(phase.name())),
                CopyInput::SourceDisabled |
                CopyInput::SourceEnabled |
                CopyInput::SourceGone |
                CopyInput::DestinationEnabled |
                CopyInput::DestinationFailed |
                CopyInput::GraceExpired(_) => Step::Ignore,
            };
        }
    };
    match input {
        CopyInput::SourceDisabled => Step::BeginGlitch(resume),
        CopyInput::SourceEnabled |
        CopyInput::DestinationEnabled |
        CopyInput::GraceExpired(_) => Step::Ignore,
        CopyInput::SourceGone => Step::SourceLost { resume, recheck: false },
        CopyInput::DestinationFailed => Step::Abort {
            reason: AbortReason::DestinationFailed,
            source_down: false
        },
        CopyInput::Cancel => Step::Abort {
            reason: AbortReason::Cancelled,
            source_down: false
        },
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(CopyPhase::ModeSetToMirror, Resume::Mirror)]
    #[case(CopyPhase::MetadataRebuildStart, Resume::Mirror)]
    #[case(CopyPhase::MetadataRebuildDone, Resume::MetadataRebuilt)]
    #[case(CopyPhase::DataCopyInProgress, Resume::DataCopy)]
    fn glitch_remembers_resume_point(#[case] phase: CopyPhase,
                                     #[case] resume: Resume)
    {
        assert_eq!(transition(&phase, CopyInput::SourceDisabled),
                   Step::BeginGlitch(resume));
        assert_eq!(transition(&phase, CopyInput::SourceGone),
                   Step::SourceLost { resume, recheck: false });
    }

    #[test]
    fn glitch_recovers() {
        let phase = CopyPhase::SourceGlitch {
            deadline: Instant::now() + Duration::from_secs(5),
            resume: Resume::DataCopy
        };
        assert_eq!(transition(&phase, CopyInput::SourceEnabled),
                   Step::Resume(Resume::DataCopy));
        assert_eq!(transition(&phase, CopyInput::SourceDisabled), Step::Ignore);
    }

    /// The timer only counts once the deadline has really passed
    #[test]
    fn grace_expiry() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(5);
        let phase = CopyPhase::SourceGlitch {
            deadline,
            resume: Resume::MetadataRebuilt
        };
        assert_eq!(transition(&phase, CopyInput::GraceExpired(now)),
                   Step::Ignore);
        assert_eq!(transition(&phase, CopyInput::GraceExpired(deadline)),
                   Step::SourceLost {
                       resume: Resume::MetadataRebuilt,
                       recheck: true
                   });
    }

    #[rstest]
    #[case(CopyPhase::ModeSetToMirror, false)]
    #[case(CopyPhase::DataCopyInProgress, false)]
    #[case(CopyPhase::CopyOperationComplete, false)]
    #[case(CopyPhase::SourceGlitch {
        deadline: Instant::now(),
        resume: Resume::DataCopy
    }, true)]
    fn destination_failure_aborts(#[case] phase: CopyPhase,
                                  #[case] source_down: bool)
    {
        let step = transition(&phase, CopyInput::DestinationFailed);
        assert_eq!(step, Step::Abort {
            reason: AbortReason::DestinationFailed,
            source_down
        });
        assert!(step.needs_position_lock());
    }

    /// Once every chunk is on the destination, losing the source no longer
    /// matters.
    #[rstest]
    #[case(CopyInput::SourceDisabled)]
    #[case(CopyInput::SourceGone)]
    fn source_loss_after_copy(#[case] input: CopyInput) {
        assert_eq!(transition(&CopyPhase::CopyOperationComplete, input),
                   Step::Ignore);
    }

    #[test]
    fn halted_only_cancels() {
        let phase = CopyPhase::Halted(Error::LockOrdering);
        assert_eq!(transition(&phase, CopyInput::SourceDisabled), Step::Ignore);
        assert_eq!(transition(&phase, CopyInput::Cancel), Step::Abort {
            reason: AbortReason::Cancelled,
            source_down: false
        });
    }

    #[rstest]
    #[case(CopyPhase::SwappedOut)]
    #[case(CopyPhase::Aborted(AbortReason::Cancelled))]
    fn terminal(#[case] phase: CopyPhase) {
        assert!(phase.is_terminal());
        assert_eq!(transition(&phase, CopyInput::SourceGone), Step::Ignore);
        assert!(matches!(transition(&phase, CopyInput::Cancel),
                         Step::Reject(Error::InvalidPhase(_))));
    }

    #[test]
    fn display() {
        assert_eq!(CopyPhase::DataCopyInProgress.to_string(),
                   "DataCopyInProgress");
        assert_eq!(CopyPhase::Aborted(AbortReason::SourceFailed).to_string(),
                   "Aborted(SourceFailed)");
    }

    #[test]
    fn edge_inputs() {
        assert_eq!(CopyInput::from_edge(Leg::Destination, EdgeStatus::Disabled),
                   CopyInput::DestinationFailed);
        assert_eq!(CopyInput::from_edge(Leg::Source, EdgeStatus::Gone),
                   CopyInput::SourceGone);
    }
}
// LCOV_EXCL_STOP
