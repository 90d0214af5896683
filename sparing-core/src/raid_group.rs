// vim: tw=80
//! The raid-group aggregate
//!
//! A `RaidGroup` owns everything the I/O path and the copy state machine
//! share: the needs-rebuild bitmaps, the per-position cursors, the stripe lock
//! table, and the edge manager.  Every bitmap mutation must present an
//! exclusive [`StripeLockHandle`] covering the chunks it touches.

use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    bitmap::ChunkBitmap,
    config::CopyConfig,
    cursor::RebuildCursor,
    edge::{DriveEdges, EdgeManager},
    spare::DriveProfile,
    stripe_lock::{LockMode, LockOwner, StripeLockHandle, StripeLockTable},
    types::*,
};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RaidType {
    Raid0,
    Raid1,
    Raid10,
    Raid3,
    Raid5,
    Raid6,
}

impl RaidType {
    /// Can the group survive the loss of a position?
    pub fn is_redundant(self) -> bool {
        self != RaidType::Raid0
    }

    /// Fewest positions a group of this type may have
    pub fn min_width(self) -> PositionT {
        match self {
            RaidType::Raid0 => 1,
            RaidType::Raid1 => 2,
            RaidType::Raid3 | RaidType::Raid5 => 3,
            RaidType::Raid10 | RaidType::Raid6 => 4,
        }
    }
}

/// Health of one position
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PositionHealth {
    Online,
    /// The source of a copy is temporarily unreachable.  Writes are recorded
    /// in the glitch footprint.
    Glitching,
    /// The drive is missing.  Every write touching this position is recorded
    /// as needing rebuild.
    Degraded {
        since: Instant
    },
    /// The drive is present, but some chunks still need rebuild
    Rebuilding,
}

/// Result of a foreground write, as reported by the I/O path
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Success,
    /// The write did not reach these positions
    Failed(Vec<PositionT>),
}

impl WriteOutcome {
    fn failed(&self, position: PositionT) -> bool {
        match self {
            WriteOutcome::Success => false,
            WriteOutcome::Failed(v) => v.contains(&position)
        }
    }
}

/// Which leg of a position should serve a read
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadTarget {
    Source,
    Destination,
}

#[derive(Clone, Copy, Debug)]
struct PositionState {
    health: PositionHealth,
    cursor: RebuildCursor,
    /// A copy owns this position's `copy_pending` row and its cursor
    copying: bool,
    forced_rebuild: bool,
    /// What any replacement for this position's drive must match
    profile: DriveProfile,
}

#[derive(Debug)]
struct Inner {
    /// Group-level needs-rebuild bits
    needs_rebuild: ChunkBitmap,
    /// Chunks not yet copied onto each copying position's destination
    copy_pending: ChunkBitmap,
    /// Chunks written while each position's source was glitching
    footprint: ChunkBitmap,
    positions: Vec<PositionState>,
}

impl Inner {
    fn position(&self, position: PositionT) -> Result<&PositionState> {
        self.positions.get(usize::from(position))
            .ok_or(Error::InvalidPosition(position))
    }

    fn position_mut(&mut self, position: PositionT)
        -> Result<&mut PositionState>
    {
        self.positions.get_mut(usize::from(position))
            .ok_or(Error::InvalidPosition(position))
    }
}

pub struct RaidGroup {
    id: RaidGroupId,
    raid_type: RaidType,
    chunk_size: LbaT,
    /// Size of every position in blocks.  The last chunk may be partial.
    capacity: LbaT,
    chunks: ChunkT,
    edges: EdgeManager,
    locks: StripeLockTable,
    inner: Mutex<Inner>,
}

impl RaidGroup {
    fn check_lbas(&self, range: LbaRange) -> Result<()> {
        if range.end <= self.capacity {
            Ok(())
        } else {
            Err(Error::OutOfRange{end: range.end, limit: self.capacity})
        }
    }

    fn check_lock(handle: &StripeLockHandle, range: ChunkRange) -> Result<()> {
        if handle.covers_exclusive(&range) {
            Ok(())
        } else {
            tracing::error!(owner = ?handle.owner(), held = %handle.range(),
                wanted = %range, "bitmap mutation without a covering lock");
            Err(Error::LockNotHeld)
        }
    }

    fn check_position(&self, position: PositionT) -> Result<()> {
        if position < self.width() {
            Ok(())
        } else {
            Err(Error::InvalidPosition(position))
        }
    }

    /// Drive size in blocks, of every position
    pub fn capacity(&self) -> LbaT {
        self.capacity
    }

    /// The blocks that make up a range of chunks.  The last chunk stops at
    /// the end of the drive.
    pub fn chunk_lbas(&self, range: ChunkRange) -> LbaRange {
        LbaRange::new((range.start * self.chunk_size).min(self.capacity),
                      (range.end * self.chunk_size).min(self.capacity))
    }

    pub fn chunk_size(&self) -> LbaT {
        self.chunk_size
    }

    /// Number of chunks on each position
    pub fn chunks(&self) -> ChunkT {
        self.chunks
    }

    /// Clear NR on `range`.  Fails with `PartialRange` if that would leave part
    /// of a dirty chunk unaccounted for.
    pub fn clear_needs_rebuild(&self, handle: &StripeLockHandle,
                               position: PositionT, range: LbaRange)
        -> Result<()>
    {
        self.check_position(position)?;
        self.check_lbas(range)?;
        Self::check_lock(handle, self.covering_chunks(range))?;
        // A range reaching the end of the drive covers all of a partial last
        // chunk
        let range = if range.end == self.capacity {
            LbaRange::new(range.start, self.chunks * self.chunk_size)
        } else {
            range
        };
        self.inner.lock().unwrap().needs_rebuild
            .clear_needs_rebuild(position, range)
            .inspect_err(|e| tracing::error!(position, "refused NR clear: {e}"))
    }

    pub fn clear_forced_rebuild(&self, position: PositionT) -> Result<()> {
        self.inner.lock().unwrap().position_mut(position)?.forced_rebuild =
            false;
        Ok(())
    }

    /// Number of chunks still to be copied onto `position`'s destination
    pub fn copy_pending_count(&self, position: PositionT) -> Result<ChunkT> {
        self.check_position(position)?;
        Ok(self.inner.lock().unwrap().copy_pending.marked_count(position))
    }

    /// The smallest range of chunks that covers every block of `range`
    pub fn covering_chunks(&self, range: LbaRange) -> ChunkRange {
        if range.is_empty() {
            let c = range.start / self.chunk_size;
            return ChunkRange::new(c, c);
        }
        ChunkRange::new(range.start / self.chunk_size,
                        (range.end - 1) / self.chunk_size + 1)
    }

    /// The cursor of any copy or rebuild running on `position`
    pub fn current_cursor(&self, position: PositionT) -> Result<Option<ChunkT>>
    {
        Ok(self.inner.lock().unwrap().position(position)?.cursor.value())
    }

    pub fn edges(&self) -> &EdgeManager {
        &self.edges
    }

    pub fn health(&self, position: PositionT) -> Result<PositionHealth> {
        Ok(self.inner.lock().unwrap().position(position)?.health)
    }

    pub fn id(&self) -> RaidGroupId {
        self.id
    }

    /// Is `chunk` still to be copied onto `position`'s destination?
    pub fn is_copy_pending(&self, position: PositionT, chunk: ChunkT)
        -> Result<bool>
    {
        self.check_position(position)?;
        let range = ChunkRange::single(chunk);
        Ok(!self.inner.lock().unwrap().copy_pending
            .is_chunk_range_clean(position, range)?)
    }

    pub fn is_forced_rebuild(&self, position: PositionT) -> Result<bool> {
        Ok(self.inner.lock().unwrap().position(position)?.forced_rebuild)
    }

    /// Lock the chunks covering some blocks
    pub async fn lock(&self, owner: LockOwner, range: LbaRange, mode: LockMode)
        -> Result<StripeLockHandle>
    {
        self.check_lbas(range)?;
        self.locks.acquire(owner, self.covering_chunks(range), mode).await
    }

    pub fn locks(&self) -> &StripeLockTable {
        &self.locks
    }

    /// Mark NR on every chunk that `range` touches
    pub fn mark_needs_rebuild(&self, handle: &StripeLockHandle,
                              position: PositionT, range: LbaRange)
        -> Result<()>
    {
        self.check_position(position)?;
        self.check_lbas(range)?;
        Self::check_lock(handle, self.covering_chunks(range))?;
        self.inner.lock().unwrap().needs_rebuild
            .mark_needs_rebuild(position, range)
    }

    /// Does a read of `range` on `position` need to be reconstructed from the
    /// rest of the group?
    pub fn needs_degraded_read(&self, position: PositionT, range: LbaRange)
        -> Result<bool>
    {
        self.check_lbas(range)?;
        let inner = self.inner.lock().unwrap();
        match inner.position(position)?.health {
            PositionHealth::Glitching | PositionHealth::Degraded{..} =>
                Ok(true),
            PositionHealth::Online | PositionHealth::Rebuilding =>
                Ok(!inner.needs_rebuild.is_clean(position, range)?)
        }
    }

    /// Create a new raid group with every position online and clean
    ///
    /// * `capacity`:   Size of each member drive, in blocks
    pub fn new(id: RaidGroupId, raid_type: RaidType, members: &[DriveId],
               capacity: LbaT, config: &CopyConfig, drives: Arc<dyn DriveEdges>)
        -> Result<Self>
    {
        config.validate()?;
        let width = PositionT::try_from(members.len())
            .map_err(|_| Error::InvalidConfig("raid group is too wide"))?;
        if width < raid_type.min_width() {
            return Err(Error::InvalidConfig("raid group is too narrow"));
        }
        let chunk_size = config.chunk_size;
        let chunks = capacity.div_ceil(chunk_size);
        let positions = vec![PositionState {
            health: PositionHealth::Online,
            cursor: RebuildCursor::new(chunks),
            copying: false,
            forced_rebuild: false,
            profile: DriveProfile::default()
        }; members.len()];
        let inner = Inner {
            needs_rebuild: ChunkBitmap::new(width, chunks, chunk_size),
            copy_pending: ChunkBitmap::new(width, chunks, chunk_size),
            footprint: ChunkBitmap::new(width, chunks, chunk_size),
            positions
        };
        Ok(RaidGroup {
            id,
            raid_type,
            chunk_size,
            capacity,
            chunks,
            edges: EdgeManager::new(drives, members),
            locks: StripeLockTable::default(),
            inner: Mutex::new(inner)
        })
    }

    /// Number of chunks marked NR on `position`
    pub fn nr_count(&self, position: PositionT) -> Result<ChunkT> {
        self.check_position(position)?;
        Ok(self.inner.lock().unwrap().needs_rebuild.marked_count(position))
    }

    /// Record the completion of a foreground write.
    ///
    /// The caller must still hold the exclusive lock it wrote under.
    /// Positions the write could not reach, and degraded positions, get their
    /// chunks marked NR.  A glitching position gets them added to its glitch
    /// footprint instead.
    pub fn on_write_complete(&self, handle: &StripeLockHandle,
                             affected: &[PositionT], range: LbaRange,
                             outcome: &WriteOutcome) -> Result<()>
    {
        self.check_lbas(range)?;
        let chunks = self.covering_chunks(range);
        Self::check_lock(handle, chunks)?;
        for &position in affected {
            self.check_position(position)?;
        }
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for &position in affected {
            let health = inner.position(position)?.health;
            match health {
                PositionHealth::Glitching => {
                    inner.footprint.mark_chunks(position, chunks)?;
                }
                PositionHealth::Degraded{..} => {
                    inner.needs_rebuild.mark_chunks(position, chunks)?;
                }
                PositionHealth::Online | PositionHealth::Rebuilding => {
                    if outcome.failed(position) {
                        tracing::warn!(group = %self.id, position,
                            %chunks, "write failed; marking NR");
                        inner.needs_rebuild.mark_chunks(position, chunks)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn percent_complete(&self, position: PositionT) -> Result<f64> {
        Ok(self.inner.lock().unwrap().position(position)?
           .cursor.percent_complete())
    }

    /// What a replacement for `position`'s drive must match
    pub fn profile(&self, position: PositionT) -> Result<DriveProfile> {
        Ok(self.inner.lock().unwrap().position(position)?.profile)
    }

    pub fn raid_type(&self) -> RaidType {
        self.raid_type
    }

    /// Which leg should serve a read of `chunk`?
    ///
    /// During a copy, chunks already on the destination may be read from it.
    /// This is only a snapshot.  Callers must ask again for every read.
    pub fn read_target(&self, position: PositionT, chunk: ChunkT)
        -> Result<ReadTarget>
    {
        let inner = self.inner.lock().unwrap();
        let ps = inner.position(position)?;
        let range = ChunkRange::single(chunk);
        let pending = !inner.copy_pending
            .is_chunk_range_clean(position, range)?;
        let copied = ps.copying && !pending &&
            ps.cursor.value().is_some_and(|v| chunk < v);
        Ok(if copied { ReadTarget::Destination } else { ReadTarget::Source })
    }

    /// Describe the drive now backing `position`
    pub fn set_profile(&self, position: PositionT, profile: DriveProfile)
        -> Result<()>
    {
        self.inner.lock().unwrap().position_mut(position)?.profile = profile;
        Ok(())
    }

    pub fn width(&self) -> PositionT {
        self.edges.width()
    }

    /// A copy on `position` is starting.  It now owns the position's cursor.
    pub(crate) fn begin_copy(&self, position: PositionT) {
        self.inner.lock().unwrap().positions[usize::from(position)].copying =
            true;
    }

    /// The source of a copy has gone away
    pub(crate) fn begin_glitch(&self, position: PositionT) {
        let mut inner = self.inner.lock().unwrap();
        inner.footprint.clear_position(position);
        inner.positions[usize::from(position)].health =
            PositionHealth::Glitching;
    }

    /// Record that `chunk` is on the destination, and move the cursor past it.
    ///
    /// Both happen under one lock of the group state, bitmap first, so
    /// nobody can see the cursor pass a chunk that is still pending.
    pub(crate) fn complete_copy_chunk(&self, handle: &StripeLockHandle,
                                      position: PositionT, chunk: ChunkT)
        -> Result<ChunkT>
    {
        let range = ChunkRange::single(chunk);
        Self::check_lock(handle, range)?;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let ps = &mut inner.positions[usize::from(position)];
        let current = match ps.cursor.value() {
            Some(v) if ps.copying => v,
            _ => return Err(Error::CopyAborted(position))
        };
        if chunk > current {
            let skipped = ChunkRange::new(current, chunk);
            if let Some(c) = inner.copy_pending.marked(position)
                .find(|&c| skipped.contains(&ChunkRange::single(c)))
            {
                tracing::error!(position, chunk, "cursor would skip chunk {c}");
                return Err(Error::PartialRange(c));
            }
        }
        inner.copy_pending.clear_chunks(position, range)?;
        ps.cursor.advance(chunk + 1)?;
        Ok(chunk + 1)
    }

    /// Record that `chunk` has been reconstructed, and move the rebuild
    /// cursor past it.
    pub(crate) fn complete_rebuild_chunk(&self, handle: &StripeLockHandle,
                                         position: PositionT, chunk: ChunkT)
        -> Result<()>
    {
        let range = ChunkRange::single(chunk);
        Self::check_lock(handle, range)?;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let ps = &mut inner.positions[usize::from(position)];
        if !ps.cursor.is_active() || ps.copying {
            return Err(Error::InvalidPhase("no rebuild in progress"));
        }
        inner.needs_rebuild.clear_chunks(position, range)?;
        ps.cursor.advance(chunk + 1)
    }

    /// Forget everything about `position`'s copy destination
    pub(crate) fn end_copy(&self, position: PositionT) {
        let mut inner = self.inner.lock().unwrap();
        inner.copy_pending.clear_position(position);
        let ps = &mut inner.positions[usize::from(position)];
        ps.cursor.deactivate();
        ps.copying = false;
    }

    /// The glitch on `position` is over, one way or another.
    ///
    /// Every chunk written during the glitch is marked NR, and the position
    /// moves to `health`.  Requires an exclusive lock over the whole position.
    /// Returns the number of chunks marked.
    pub(crate) fn end_glitch(&self, handle: &StripeLockHandle,
                             position: PositionT, health: PositionHealth)
        -> Result<ChunkT>
    {
        Self::check_lock(handle, ChunkRange::new(0, self.chunks))?;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut marked = 0;
        for c in inner.footprint.marked(position) {
            inner.needs_rebuild.mark_chunks(position, ChunkRange::single(c))?;
            marked += 1;
        }
        inner.footprint.clear_position(position);
        inner.positions[usize::from(position)].health = health;
        Ok(marked)
    }

    /// The position's drive is missing.  Start recording writes as NR.
    pub(crate) fn enter_rebuild_logging(&self, position: PositionT) {
        let mut inner = self.inner.lock().unwrap();
        let ps = &mut inner.positions[usize::from(position)];
        if !ps.copying {
            ps.cursor.deactivate();
        }
        ps.health = PositionHealth::Degraded{since: Instant::now()};
    }

    /// Stop any rebuild and report whether `position` is now fully clean
    pub(crate) fn finish_rebuild(&self, position: PositionT) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let clean = !inner.needs_rebuild.any_marked(position);
        let ps = &mut inner.positions[usize::from(position)];
        ps.cursor.deactivate();
        if ps.health == PositionHealth::Rebuilding && clean {
            ps.health = PositionHealth::Online;
        }
        clean
    }

    /// Stop all progress on `position` until an operator intervenes
    pub(crate) fn flag_forced_rebuild(&self, position: PositionT) {
        tracing::error!(group = %self.id, position,
            "position flagged for forced rebuild");
        self.inner.lock().unwrap()
            .positions[usize::from(position)].forced_rebuild = true;
    }

    /// The position's drive is back.  Its NR chunks now need rebuilding.
    pub(crate) fn leave_rebuild_logging(&self, position: PositionT) {
        let mut inner = self.inner.lock().unwrap();
        let ps = &mut inner.positions[usize::from(position)];
        if matches!(ps.health, PositionHealth::Degraded{..}) {
            ps.health = PositionHealth::Rebuilding;
        }
    }

    pub(crate) fn mark_chunks_needs_rebuild(&self, handle: &StripeLockHandle,
                                            position: PositionT,
                                            range: ChunkRange)
        -> Result<()>
    {
        Self::check_lock(handle, range)?;
        self.inner.lock().unwrap().needs_rebuild.mark_chunks(position, range)
    }

    /// Mark NR on every chunk not yet copied onto `position`'s destination.
    /// Requires an exclusive lock over the whole position.
    pub(crate) fn mark_uncopied_needs_rebuild(&self,
                                              handle: &StripeLockHandle,
                                              position: PositionT)
        -> Result<ChunkT>
    {
        Self::check_lock(handle, ChunkRange::new(0, self.chunks))?;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut marked = 0;
        for c in inner.copy_pending.marked(position) {
            inner.needs_rebuild.mark_chunks(position, ChunkRange::single(c))?;
            marked += 1;
        }
        Ok(marked)
    }

    /// The first NR chunk on `position` at or after its rebuild cursor
    pub(crate) fn next_nr_chunk(&self, position: PositionT) -> Option<ChunkT> {
        let inner = self.inner.lock().unwrap();
        let from = inner.positions[usize::from(position)].cursor.value()
            .unwrap_or(0);
        let next = inner.needs_rebuild.marked(position).find(|&c| c >= from);
        next
    }

    /// Mark chunks as still to be copied onto `position`'s destination
    pub(crate) fn seed_copy_pending(&self, handle: &StripeLockHandle,
                                    position: PositionT, range: ChunkRange)
        -> Result<()>
    {
        Self::check_lock(handle, range)?;
        self.inner.lock().unwrap().copy_pending.mark_chunks(position, range)
    }

    pub(crate) fn set_health(&self, position: PositionT,
                             health: PositionHealth)
    {
        self.inner.lock().unwrap()
            .positions[usize::from(position)].health = health;
    }

    /// Start `position`'s cursor at the beginning of the drive
    pub(crate) fn start_cursor(&self, position: PositionT) {
        self.inner.lock().unwrap()
            .positions[usize::from(position)].cursor.reset();
    }

    /// Start a rebuild pass on `position`
    pub(crate) fn start_rebuild(&self, position: PositionT) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ps = inner.position_mut(position)?;
        if ps.copying {
            return Err(Error::CopyInProgress(position));
        }
        match ps.health {
            PositionHealth::Glitching | PositionHealth::Degraded{..} => {
                return Err(Error::PositionDegraded(position));
            }
            PositionHealth::Online | PositionHealth::Rebuilding => ()
        }
        ps.cursor.reset();
        ps.health = PositionHealth::Rebuilding;
        Ok(())
    }
}

// LCOV_EXCL_STOP
