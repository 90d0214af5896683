// vim: tw=80
//! Common type definitions used throughout the sparing core

use std::{
    fmt::{self, Display, Formatter},
    ops::Range,
    str::FromStr,
};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Indexes a block.  The size of a block is the drive's sector size; the
/// sparing core never looks inside one.
pub type LbaT = u64;

/// Indexes a stripe-aligned chunk within one raid-group position.
pub type ChunkT = u64;

/// Indexes a drive slot within a raid group.
pub type PositionT = u16;

/// Identifies a raid group.  Stable for the lifetime of the group.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct RaidGroupId(pub u32);

impl Display for RaidGroupId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "rg{}", self.0)
    }
}

/// Identifies a physical drive, whether it is a raid-group member or a spare.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct DriveId(uuid::Uuid);

impl DriveId {
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        DriveId(uuid)
    }

    pub fn new_v4() -> Self {
        DriveId(uuid::Uuid::new_v4())
    }
}

impl Display for DriveId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DriveId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(DriveId)
    }
}

/// A half-open range of blocks on one position, as the I/O path reports it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct LbaRange {
    pub start: LbaT,
    pub end: LbaT
}

impl LbaRange {
    pub fn new(start: LbaT, end: LbaT) -> Self {
        assert!(start <= end, "Backwards LBA range {start}..{end}");
        LbaRange { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn len(&self) -> LbaT {
        self.end - self.start
    }
}

impl From<Range<LbaT>> for LbaRange {
    fn from(r: Range<LbaT>) -> Self {
        LbaRange::new(r.start, r.end)
    }
}

/// A half-open range of chunk indices.  Stripe locks, cursors, and the copy
/// pass all work in chunks.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct ChunkRange {
    pub start: ChunkT,
    pub end: ChunkT
}

impl ChunkRange {
    pub fn new(start: ChunkT, end: ChunkT) -> Self {
        assert!(start <= end, "Backwards chunk range {start}..{end}");
        ChunkRange { start, end }
    }

    /// A range covering exactly one chunk
    pub fn single(chunk: ChunkT) -> Self {
        ChunkRange { start: chunk, end: chunk + 1 }
    }

    /// Does `self` entirely contain `other`?
    pub fn contains(&self, other: &ChunkRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn iter(&self) -> Range<ChunkT> {
        self.start..self.end
    }

    pub fn len(&self) -> ChunkT {
        self.end - self.start
    }

    /// Do the two ranges share any chunk?  An empty range overlaps nothing.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        !self.is_empty() && !other.is_empty() &&
            self.start < other.end && other.start < self.end
    }
}

impl Display for ChunkRange {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl From<Range<ChunkT>> for ChunkRange {
    fn from(r: Range<ChunkT>) -> Self {
        ChunkRange::new(r.start, r.end)
    }
}

/// Coarse classification of an [`Error`], used to decide how it propagates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The request was refused before any state changed.
    Rejected,
    /// A drive glitch.  Absorbed locally by the grace window.
    Transient,
    /// A drive is gone for good.  Surfaced as a state transition.
    Permanent,
    /// An invariant was about to be broken.  Never absorbed.
    InternalConsistency,
    /// Nothing to copy onto.
    ResourceExhausted,
}

/// The sparing core's error type
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("Copy is not allowed on a non-redundant raid group")]
    CopyNotAllowedNonRedundant,
    #[error("Position {0} already has a copy in progress")]
    CopyInProgress(PositionT),
    #[error("Position {0} is not a member of the raid group")]
    InvalidPosition(PositionT),
    #[error("Position {0} is degraded")]
    PositionDegraded(PositionT),
    #[error("No copy is in progress on position {0}")]
    NoCopyInProgress(PositionT),
    #[error("Operation is not valid in copy phase {0}")]
    InvalidPhase(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Range ends at {end}, beyond the limit of {limit}")]
    OutOfRange { end: u64, limit: u64 },

    #[error("Stripe lock wait was aborted")]
    LockAborted,
    #[error("Edge for position {0} is not enabled")]
    EdgeNotEnabled(PositionT),

    #[error("Edge operation failed on position {0}")]
    EdgeFailed(PositionT),
    #[error("Chunk {chunk} could not be moved on position {position}")]
    ChunkIo { position: PositionT, chunk: ChunkT },
    #[error("Copy on position {0} was aborted")]
    CopyAborted(PositionT),

    #[error("Clear would mask still-dirty chunk {0}")]
    PartialRange(ChunkT),
    #[error("Cursor may not move backwards from {current} to {requested}")]
    CursorRegression { current: ChunkT, requested: ChunkT },
    #[error("Cursor may not pass the last chunk {total} (requested {requested})")]
    CursorOverrun { total: ChunkT, requested: ChunkT },
    #[error("Caller already holds or awaits a stripe lock")]
    LockOrdering,
    #[error("Mutation attempted without a covering exclusive stripe lock")]
    LockNotHeld,
    #[error("Position {0} is halted pending a forced rebuild")]
    PositionHalted(PositionT),

    #[error("No spare drive is available")]
    NoSpareAvailable,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::CopyNotAllowedNonRedundant |
            Error::CopyInProgress(_) |
            Error::InvalidPosition(_) |
            Error::PositionDegraded(_) |
            Error::NoCopyInProgress(_) |
            Error::InvalidPhase(_) |
            Error::InvalidConfig(_) |
            Error::OutOfRange{..} => ErrorClass::Rejected,
            Error::LockAborted |
            Error::EdgeNotEnabled(_) => ErrorClass::Transient,
            Error::EdgeFailed(_) |
            Error::ChunkIo{..} |
            Error::CopyAborted(_) => ErrorClass::Permanent,
            Error::PartialRange(_) |
            Error::CursorRegression{..} |
            Error::CursorOverrun{..} |
            Error::LockOrdering |
            Error::LockNotHeld |
            Error::PositionHalted(_) => ErrorClass::InternalConsistency,
            Error::NoSpareAvailable => ErrorClass::ResourceExhausted,
        }
    }

    /// Must progress on the affected position stop?
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::InternalConsistency
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

// LCOV_EXCL_STOP
