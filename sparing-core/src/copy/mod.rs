// vim: tw=80
//! The copy state machine
//!
//! Moves every chunk of a raid-group position from its source drive onto a
//! spare while the group keeps serving I/O, then swaps the spare in.

use std::pin::Pin;

use futures::Future;
#[cfg(test)] use mockall::automock;

use crate::types::*;

mod machine;
mod phase;

pub use self::machine::CopyStateMachine;
pub use self::phase::{
    AbortReason,
    CopyInput,
    CopyKind,
    CopyPhase,
    Resume,
    Step,
    transition
};

/// Future representing one chunk's worth of data movement
pub type BoxChunkFut = Pin<Box<dyn Future<Output = Result<()>> + Send + Sync>>;

/// Interface to whatever actually moves data between drives
#[cfg_attr(test, automock)]
pub trait ChunkMover: Send + Sync {
    /// Copy `lbas` of `position` from `source` onto `destination`
    fn copy_chunk(&self, position: PositionT, source: DriveId,
                  destination: DriveId, lbas: LbaRange) -> BoxChunkFut;

    /// Reconstruct `lbas` of `position` onto `drive` from the rest of the
    /// raid group
    fn reconstruct_chunk(&self, position: PositionT, drive: DriveId,
                         lbas: LbaRange) -> BoxChunkFut;
}
