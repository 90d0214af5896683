// vim: tw=80
//! Virtual drive edges
//!
//! Each raid-group position is one logical edge.  Normally it passes straight
//! through to a single drive.  While a copy is in progress it is a mirror of the
//! source and the destination, and while its drive is missing it is broken.

use std::sync::{Arc, Mutex};

#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

use crate::types::*;

/// What the physical drive layer says about one leg of an edge
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EdgeStatus {
    Enabled,
    /// Temporarily unreachable.  May come back.
    Disabled,
    /// Removed or dead
    Gone,
}

/// One leg of a mirrored edge
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Leg {
    Source,
    Destination,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BrokenReason {
    /// The drive went away and did not come back within the grace window
    SourceFailed,
    /// The drive went away while no copy was running
    Unavailable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EdgeState {
    PassThrough {
        drive: DriveId
    },
    Mirror {
        source: DriveId,
        destination: DriveId,
        /// The leg reads are served from by default
        primary: Leg
    },
    Broken {
        /// The drive that used to back this edge
        drive: DriveId,
        since: Instant,
        reason: BrokenReason
    }
}

impl EdgeState {
    /// The drive that will back this edge once any copy is resolved
    pub fn drive(&self) -> DriveId {
        match self {
            EdgeState::PassThrough{drive} => *drive,
            EdgeState::Mirror{source, ..} => *source,
            EdgeState::Broken{drive, ..} => *drive,
        }
    }
}

/// Interface to the physical drive layer
#[cfg_attr(test, automock)]
pub trait DriveEdges: Send + Sync {
    /// Attach `drive` to `position`, either as a mirror's second leg or as the
    /// replacement for a broken edge.
    fn attach_destination_edge(&self, position: PositionT, drive: DriveId)
        -> Result<()>;

    /// Detach one leg of `position`'s edge
    fn detach_edge(&self, position: PositionT, which: Leg) -> Result<()>;

    fn edge_status(&self, position: PositionT, which: Leg) -> EdgeStatus;
}

/// Tracks the [`EdgeState`] of every position in one raid group.
///
/// Only the copy state machine for a position changes that position's state.
/// Everybody else gets a snapshot, which may be stale as soon as it's returned.
pub struct EdgeManager {
    drives: Arc<dyn DriveEdges>,
    states: Mutex<Vec<EdgeState>>,
}

impl EdgeManager {
    /// Replace a broken edge with a new drive
    pub fn attach_replacement(&self, position: PositionT, drive: DriveId)
        -> Result<()>
    {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(usize::from(position))
            .ok_or(Error::InvalidPosition(position))?;
        if !matches!(state, EdgeState::Broken{..}) {
            return Err(Error::InvalidPhase("edge is not broken"));
        }
        self.drives.attach_destination_edge(position, drive)?;
        tracing::info!(position, %drive, "replacement drive attached");
        *state = EdgeState::PassThrough{drive};
        Ok(())
    }

    /// Attach `destination` as the second leg of a pass-through edge.
    ///
    /// On failure the edge is left as it was.
    pub fn enter_mirror(&self, position: PositionT, destination: DriveId)
        -> Result<()>
    {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(usize::from(position))
            .ok_or(Error::InvalidPosition(position))?;
        let EdgeState::PassThrough{drive: source} = *state else {
            return Err(Error::InvalidPhase("edge is not pass-through"));
        };
        self.drives.attach_destination_edge(position, destination)
            .inspect_err(|e| tracing::warn!(position, %destination,
                "failed to attach destination: {e}"))?;
        *state = EdgeState::Mirror {
            source,
            destination,
            primary: Leg::Source
        };
        Ok(())
    }

    /// Mark a pass-through edge as broken.  Returns the drive it had.
    pub fn mark_broken(&self, position: PositionT, reason: BrokenReason)
        -> Result<DriveId>
    {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(usize::from(position))
            .ok_or(Error::InvalidPosition(position))?;
        let EdgeState::PassThrough{drive} = *state else {
            return Err(Error::InvalidPhase("edge is not pass-through"));
        };
        *state = EdgeState::Broken{drive, since: Instant::now(), reason};
        Ok(drive)
    }

    pub fn new(drives: Arc<dyn DriveEdges>, members: &[DriveId]) -> Self {
        let states = members.iter()
            .map(|&drive| EdgeState::PassThrough{drive})
            .collect();
        EdgeManager { drives, states: Mutex::new(states) }
    }

    /// A broken edge's original drive has come back
    pub fn restore(&self, position: PositionT) -> Result<DriveId> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(usize::from(position))
            .ok_or(Error::InvalidPosition(position))?;
        let EdgeState::Broken{drive, ..} = *state else {
            return Err(Error::InvalidPhase("edge is not broken"));
        };
        *state = EdgeState::PassThrough{drive};
        Ok(drive)
    }

    /// Snapshot of one position's edge
    pub fn state(&self, position: PositionT) -> Result<EdgeState> {
        self.states.lock().unwrap()
            .get(usize::from(position))
            .copied()
            .ok_or(Error::InvalidPosition(position))
    }

    /// Ask the drive layer about one leg of an edge
    pub fn status(&self, position: PositionT, which: Leg) -> EdgeStatus {
        self.drives.edge_status(position, which)
    }

    /// Finish a copy: the destination becomes the position's only drive.
    ///
    /// Returns the former source.  The source is usually failing, so failure
    /// to detach it cleanly is only logged.
    pub fn swap_in_destination(&self, position: PositionT) -> Result<DriveId> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(usize::from(position))
            .ok_or(Error::InvalidPosition(position))?;
        let EdgeState::Mirror{source, destination, ..} = *state else {
            return Err(Error::InvalidPhase("edge is not a mirror"));
        };
        if let Err(e) = self.drives.detach_edge(position, Leg::Source) {
            tracing::warn!(position, %source, "failed to detach source: {e}");
        }
        *state = EdgeState::PassThrough{drive: destination};
        Ok(source)
    }

    /// Abandon a copy: the source goes back to being the only drive.
    ///
    /// Returns the discarded destination.
    pub fn tear_down_mirror(&self, position: PositionT) -> Result<DriveId> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(usize::from(position))
            .ok_or(Error::InvalidPosition(position))?;
        let EdgeState::Mirror{source, destination, ..} = *state else {
            return Err(Error::InvalidPhase("edge is not a mirror"));
        };
        if let Err(e) = self.drives.detach_edge(position, Leg::Destination) {
            tracing::warn!(position, %destination,
                "failed to detach destination: {e}");
        }
        *state = EdgeState::PassThrough{drive: source};
        Ok(destination)
    }

    pub fn width(&self) -> PositionT {
        self.states.lock().unwrap().len() as PositionT
    }
}

// LCOV_EXCL_STOP
