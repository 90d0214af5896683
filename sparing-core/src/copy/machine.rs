// vim: tw=80

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tokio::{
    sync::Notify,
    time::{Instant, sleep_until, timeout_at},
};

use crate::{
    config::CopyConfig,
    edge::{BrokenReason, EdgeState, EdgeStatus, Leg},
    emeh::EmehController,
    notify::{EventLog, Notification},
    raid_group::{PositionHealth, RaidGroup},
    spare::{Spare, SparePool},
    stripe_lock::{LockMode, LockOwner, StripeLockHandle},
    types::*,
};
use super::{ChunkMover, phase::*};

/// Chunks marked per stripe lock when marking a whole position
const MARK_BATCH: ChunkT = 64;

/// Chunks copied per call to `copy_chunks` from `run`
const RUN_BATCH: ChunkT = 32;

struct CopyOperation {
    kind: CopyKind,
    phase: CopyPhase,
    source: DriveId,
    destination: Spare,
    /// Last whole percent reported to the event log
    last_percent: u8,
    /// Wakes `run` when the phase changes
    wake: Arc<Notify>,
}

/// Look up a copy that may still make progress
fn active(op: Option<&mut CopyOperation>, position: PositionT)
    -> Result<&mut CopyOperation>
{
    match op {
        None => Err(Error::NoCopyInProgress(position)),
        Some(op) => match op.phase {
            CopyPhase::Halted(_) => Err(Error::PositionHalted(position)),
            CopyPhase::Aborted(_) => Err(Error::CopyAborted(position)),
            CopyPhase::SwappedOut => Err(Error::NoCopyInProgress(position)),
            _ => Ok(op)
        }
    }
}

/// Runs the copies of every position in one raid group.
///
/// Each method may be called from any task, but a given position's progress
/// (`metadata_rebuild`, `copy_chunks`, `complete`, or `run`, which calls them
/// all) should be driven by only one task at a time.
///
/// Transitions on any one position happen one at a time, in arrival order.
///
/// The [`EventLog`] is notified while internal state is locked, so it must
/// not call back into the machine.
pub struct CopyStateMachine {
    config: CopyConfig,
    group: Arc<RaidGroup>,
    mover: Arc<dyn ChunkMover>,
    spares: Arc<SparePool>,
    emeh: Arc<EmehController>,
    log: Arc<dyn EventLog>,
    /// Current or most recent copy of each position
    ops: Mutex<BTreeMap<PositionT, CopyOperation>>,
    /// Held for the whole of each transition, one per position
    transitions: Vec<futures_locks::Mutex<()>>,
}

impl CopyStateMachine {
    /// Abandon a copy.  The source is once again the position's only drive.
    fn abort(&self, op: &mut CopyOperation, position: PositionT,
             reason: AbortReason, source_down: bool,
             handle: &StripeLockHandle) -> Result<()>
    {
        let group = self.group.id();
        let source_down = source_down ||
            self.group.health(position)? == PositionHealth::Glitching;
        self.group.end_copy(position);
        let destination = self.group.edges().tear_down_mirror(position)?;
        if source_down {
            self.group.edges().mark_broken(position, BrokenReason::SourceFailed)?;
            let since = Instant::now();
            let marked = self.group.end_glitch(handle, position,
                PositionHealth::Degraded{since})
                .map_err(|e| self.halt(op, position, e))?;
            tracing::warn!(%group, position, marked,
                "source is down; position degraded");
            self.log.notify(Notification::SourceFailed{group, position});
        }
        if reason == AbortReason::DestinationFailed {
            tracing::warn!(%group, position, %destination,
                "copy destination failed");
        } else {
            self.spares.give_back(op.destination);
        }
        self.finish(op, position, CopyPhase::Aborted(reason));
        self.log.notify(Notification::CopyAborted{group, position, reason});
        Ok(())
    }

    /// Carry out one step of the transition function
    fn apply(&self, op: &mut CopyOperation, position: PositionT, step: Step,
             handle: Option<&StripeLockHandle>) -> Result<()>
    {
        let group = self.group.id();
        match step {
            Step::Ignore => Ok(()),
            Step::Reject(e) => Err(e),
            Step::BeginGlitch(resume) => {
                let deadline = Instant::now() + self.config.grace_window;
                tracing::warn!(%group, position, "copy source glitched");
                self.group.begin_glitch(position);
                self.group.locks().abort_waiting(LockOwner::Copy(position));
                self.log.notify(Notification::SourceGlitch{group, position});
                self.set_phase(op, position,
                               CopyPhase::SourceGlitch{deadline, resume});
                Ok(())
            }
            Step::Resume(resume) => {
                let handle = handle.ok_or(Error::LockNotHeld)?;
                self.resume(op, position, resume, handle)
            }
            Step::SourceLost{resume, recheck} => {
                let handle = handle.ok_or(Error::LockNotHeld)?;
                if recheck && self.group.edges().status(position, Leg::Source)
                    == EdgeStatus::Enabled
                {
                    tracing::info!(%group, position,
                        "source returned as the grace window closed");
                    return self.resume(op, position, resume, handle);
                }
                self.source_lost(op, position, resume, handle)
            }
            Step::Abort{reason, source_down} => {
                let handle = handle.ok_or(Error::LockNotHeld)?;
                self.abort(op, position, reason, source_down, handle)
            }
        }
    }

    /// Wait, if necessary, until the position has been degraded for the
    /// permanent-spare trigger time, then swap in a spare.
    ///
    /// Returns `None` if the position stops being degraded first.
    #[tracing::instrument(skip(self))]
    pub async fn await_permanent_spare(&self, position: PositionT)
        -> Result<Option<DriveId>>
    {
        loop {
            let Some(deadline) = self.permanent_spare_deadline(position)? else {
                return Ok(None);
            };
            sleep_until(deadline).await;
            if self.permanent_spare_deadline(position)? == Some(deadline) {
                return self.swap_in_permanent_spare(position).await.map(Some);
            }
        }
    }

    /// Cancel the copy on `position`.
    ///
    /// The mirror is torn down and the destination discarded.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, position: PositionT) -> Result<()> {
        self.handle(position, CopyInput::Cancel).await
    }

    /// Swap the destination in, once every chunk has been copied.
    ///
    /// Returns the new drive.
    #[tracing::instrument(skip(self))]
    pub fn complete(&self, position: PositionT) -> Result<DriveId> {
        let group = self.group.id();
        let mut ops = self.ops.lock().unwrap();
        let op = active(ops.get_mut(&position), position)?;
        if op.phase != CopyPhase::CopyOperationComplete {
            return Err(Error::InvalidPhase(op.phase.name()));
        }
        let source = self.group.edges().swap_in_destination(position)?;
        self.group.end_copy(position);
        self.group.set_profile(position, op.destination.profile)?;
        let drive = op.destination.drive;
        tracing::info!(%group, position, kind = ?op.kind, %source, %drive,
            "copy complete");
        self.finish(op, position, CopyPhase::SwappedOut);
        self.log.notify(Notification::CopyCompleted{group, position, drive});
        Ok(drive)
    }

    /// What the position's copy is doing, or last did
    pub fn copy_phase(&self, position: PositionT) -> Option<CopyPhase> {
        self.ops.lock().unwrap().get(&position).map(|op| op.phase)
    }

    /// Copy up to `max_chunks` chunks, starting from the cursor.
    ///
    /// Stops early, without error, if the source glitches.  Returns the
    /// number of chunks copied.
    #[tracing::instrument(skip(self))]
    pub async fn copy_chunks(&self, position: PositionT, max_chunks: ChunkT)
        -> Result<ChunkT>
    {
        let (source, destination) = {
            let mut ops = self.ops.lock().unwrap();
            let op = active(ops.get_mut(&position), position)?;
            match op.phase {
                CopyPhase::MetadataRebuildDone => self.set_phase(op, position,
                    CopyPhase::DataCopyInProgress),
                CopyPhase::DataCopyInProgress => (),
                CopyPhase::SourceGlitch{..} => return Ok(0),
                phase => return Err(Error::InvalidPhase(phase.name()))
            }
            (op.source, op.destination.drive)
        };
        let total = self.group.chunks();
        let mut copied = 0;
        while copied < max_chunks {
            let Some(chunk) = self.group.current_cursor(position)? else {
                return Err(Error::CopyAborted(position));
            };
            if chunk >= total {
                break;
            }
            if !self.in_phase(position, CopyPhase::DataCopyInProgress) {
                return Ok(copied);
            }
            let range = ChunkRange::single(chunk);
            let handle = match self.group.locks()
                .acquire(LockOwner::Copy(position), range, LockMode::Exclusive)
                .await
            {
                Ok(h) => h,
                Err(Error::LockAborted) => return Ok(copied),
                Err(e) => return Err(self.fail(position, e))
            };
            let pending = self.group.is_copy_pending(position, chunk)
                .map_err(|e| self.fail(position, e))?;
            if pending {
                let lbas = self.group.chunk_lbas(range);
                let r = self.mover
                    .copy_chunk(position, source, destination, lbas)
                    .await;
                if let Err(e) = r {
                    drop(handle);
                    self.copy_failed(position, chunk, e).await?;
                    return Ok(copied);
                }
            }
            self.group.complete_copy_chunk(&handle, position, chunk)
                .map_err(|e| self.fail(position, e))?;
            drop(handle);
            copied += 1;
            tracing::trace!(position, chunk, "chunk copied");
            self.report_progress(position);
        }
        let mut ops = self.ops.lock().unwrap();
        if let Some(op) = ops.get_mut(&position) {
            if op.phase == CopyPhase::DataCopyInProgress &&
                self.group.current_cursor(position) == Ok(Some(total))
            {
                self.set_phase(op, position, CopyPhase::CopyOperationComplete);
            }
        }
        Ok(copied)
    }

    /// A chunk couldn't be copied.  Find out which drive is to blame.
    async fn copy_failed(&self, position: PositionT, chunk: ChunkT, e: Error)
        -> Result<()>
    {
        let edges = self.group.edges();
        let src = edges.status(position, Leg::Source);
        let dst = edges.status(position, Leg::Destination);
        tracing::warn!(position, chunk, ?src, ?dst, "chunk copy failed: {e}");
        if dst != EdgeStatus::Enabled {
            self.handle(position, CopyInput::DestinationFailed).await
        } else if src != EdgeStatus::Enabled {
            self.handle(position, CopyInput::from_edge(Leg::Source, src)).await
        } else {
            Err(Error::ChunkIo{position, chunk})
        }
    }

    /// React to a change in one of `position`'s edges
    #[tracing::instrument(skip(self))]
    pub async fn edge_state_changed(&self, position: PositionT, which: Leg,
                                    status: EdgeStatus) -> Result<()>
    {
        self.group.edges().state(position)?;
        let copying = self.ops.lock().unwrap()
            .get(&position)
            .is_some_and(|op| !op.phase.is_terminal());
        if copying {
            self.handle(position, CopyInput::from_edge(which, status)).await
        } else {
            self.idle_edge_changed(position, which, status)
        }
    }

    /// Check an error from a progress call.  Fatal ones halt the position.
    fn fail(&self, position: PositionT, e: Error) -> Error {
        if e.is_fatal() {
            let mut ops = self.ops.lock().unwrap();
            match ops.get_mut(&position) {
                Some(op) if !op.phase.is_terminal() => {
                    self.halt(op, position, e);
                }
                _ => {
                    let group = self.group.id();
                    self.group.flag_forced_rebuild(position);
                    self.log.notify(Notification::ForcedRebuildRequired {
                        group,
                        position,
                        error: e
                    });
                }
            }
        }
        e
    }

    /// Move to a terminal phase
    fn finish(&self, op: &mut CopyOperation, position: PositionT,
              phase: CopyPhase)
    {
        self.group.locks().abort_waiting(LockOwner::Copy(position));
        self.set_phase(op, position, phase);
        self.emeh.copy_finished(self.group.id(), position);
    }

    /// The grace timer for `position` has fired.
    ///
    /// If the source is still down, it is treated as failed.
    #[tracing::instrument(skip(self))]
    pub async fn grace_expired(&self, position: PositionT) -> Result<()> {
        self.handle(position, CopyInput::GraceExpired(Instant::now())).await
    }

    pub fn group(&self) -> &Arc<RaidGroup> {
        &self.group
    }

    /// Stop all progress on `position` because of an internal consistency
    /// violation.  Returns the violation.
    fn halt(&self, op: &mut CopyOperation, position: PositionT, e: Error)
        -> Error
    {
        if !matches!(op.phase, CopyPhase::Halted(_)) {
            let group = self.group.id();
            tracing::error!(%group, position, "halting copy: {e}");
            self.group.flag_forced_rebuild(position);
            self.group.locks().abort_waiting(LockOwner::Copy(position));
            self.log.notify(Notification::ForcedRebuildRequired {
                group,
                position,
                error: e
            });
            self.set_phase(op, position, CopyPhase::Halted(e));
        }
        e
    }

    /// Feed an input to the transition function and carry out the result.
    async fn handle(&self, position: PositionT, input: CopyInput) -> Result<()>
    {
        let _serial = self.transitions.get(usize::from(position))
            .ok_or(Error::InvalidPosition(position))?
            .lock()
            .await;
        let mut handle = None;
        loop {
            {
                let mut ops = self.ops.lock().unwrap();
                let Some(op) = ops.get_mut(&position) else {
                    return match input {
                        CopyInput::Cancel =>
                            Err(Error::NoCopyInProgress(position)),
                        _ => Ok(())
                    };
                };
                let step = transition(&op.phase, input);
                if !step.needs_position_lock() || handle.is_some() {
                    return self.apply(op, position, step, handle.as_ref());
                }
            }
            // The phase may change while we wait, so decide again afterwards
            let range = ChunkRange::new(0, self.group.chunks());
            let h = self.group.locks()
                .acquire(LockOwner::Control(position), range,
                         LockMode::Exclusive)
                .await
                .map_err(|e| self.fail(position, e))?;
            handle = Some(h);
        }
    }

    /// An edge changed on a position with no copy in progress
    fn idle_edge_changed(&self, position: PositionT, which: Leg,
                         status: EdgeStatus) -> Result<()>
    {
        if which == Leg::Destination {
            return Ok(());
        }
        let group = self.group.id();
        match (status, self.group.edges().state(position)?) {
            (EdgeStatus::Disabled | EdgeStatus::Gone,
             EdgeState::PassThrough{drive}) =>
            {
                self.group.edges()
                    .mark_broken(position, BrokenReason::Unavailable)?;
                self.group.enter_rebuild_logging(position);
                self.group.locks().abort_waiting(LockOwner::Rebuild(position));
                tracing::warn!(%group, position, %drive, ?status,
                    "position degraded");
                self.log.notify(Notification::SourceFailed{group, position});
            }
            (EdgeStatus::Enabled, EdgeState::Broken{drive, ..}) => {
                self.group.edges().restore(position)?;
                self.group.leave_rebuild_logging(position);
                tracing::info!(%group, position, %drive,
                    "drive returned; rebuild required");
            }
            _ => ()
        }
        Ok(())
    }

    fn in_phase(&self, position: PositionT, phase: CopyPhase) -> bool {
        self.copy_phase(position) == Some(phase)
    }

    /// Seed the destination's bitmap: every chunk must be copied.
    #[tracing::instrument(skip(self))]
    pub async fn metadata_rebuild(&self, position: PositionT) -> Result<()> {
        {
            let mut ops = self.ops.lock().unwrap();
            let op = active(ops.get_mut(&position), position)?;
            if op.phase != CopyPhase::ModeSetToMirror {
                return Err(Error::InvalidPhase(op.phase.name()));
            }
            self.set_phase(op, position, CopyPhase::MetadataRebuildStart);
        }
        let chunks = self.group.chunks();
        let mut start = 0;
        while start < chunks {
            if !self.in_phase(position, CopyPhase::MetadataRebuildStart) {
                // Glitched or aborted.  A resumed copy starts this over.
                return Ok(());
            }
            let range = ChunkRange::new(start, (start + MARK_BATCH).min(chunks));
            let handle = match self.group.locks()
                .acquire(LockOwner::Copy(position), range, LockMode::Exclusive)
                .await
            {
                Ok(h) => h,
                Err(Error::LockAborted) => return Ok(()),
                Err(e) => return Err(self.fail(position, e))
            };
            self.group.seed_copy_pending(&handle, position, range)
                .map_err(|e| self.fail(position, e))?;
            start = range.end;
        }
        let mut ops = self.ops.lock().unwrap();
        let op = active(ops.get_mut(&position), position)?;
        if op.phase == CopyPhase::MetadataRebuildStart {
            self.group.start_cursor(position);
            self.set_phase(op, position, CopyPhase::MetadataRebuildDone);
        }
        Ok(())
    }

    /// Create a state machine for one raid group.
    ///
    /// `config.chunk_size` must match the group's.
    pub fn new(config: CopyConfig, group: Arc<RaidGroup>,
               mover: Arc<dyn ChunkMover>, spares: Arc<SparePool>,
               emeh: Arc<EmehController>, log: Arc<dyn EventLog>)
        -> Result<Self>
    {
        config.validate()?;
        if config.chunk_size != group.chunk_size() {
            return Err(Error::InvalidConfig(
                "chunk size differs from the raid group's"));
        }
        let transitions = (0..group.width())
            .map(|_| futures_locks::Mutex::new(()))
            .collect();
        Ok(CopyStateMachine {
            config,
            group,
            mover,
            spares,
            emeh,
            log,
            ops: Mutex::default(),
            transitions
        })
    }

    /// How far along the position's copy is
    pub fn percent_complete(&self, position: PositionT) -> f64 {
        match self.copy_phase(position) {
            Some(CopyPhase::SwappedOut) => 100.0,
            Some(CopyPhase::Aborted(_)) | None => 0.0,
            Some(_) => self.group.percent_complete(position).unwrap_or(0.0)
        }
    }

    /// When will a degraded position get a permanent spare?
    pub fn permanent_spare_deadline(&self, position: PositionT)
        -> Result<Option<Instant>>
    {
        self.group.edges().state(position)?;
        Ok(match self.group.health(position)? {
            PositionHealth::Degraded{since} =>
                Some(since + self.config.permanent_spare_trigger),
            PositionHealth::Online |
            PositionHealth::Glitching |
            PositionHealth::Rebuilding => None
        })
    }

    /// Repair every NR chunk on `position`, in order.
    ///
    /// Each chunk is reconstructed, then its bit cleared, then the rebuild
    /// cursor advanced, all under an exclusive lock on that chunk.  Returns
    /// the number of chunks repaired.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_position(&self, position: PositionT) -> Result<ChunkT>
    {
        let group = self.group.id();
        let drive = self.group.edges().state(position)?.drive();
        if self.group.is_forced_rebuild(position)? {
            return Err(Error::PositionHalted(position));
        }
        self.group.start_rebuild(position)?;
        let mut repaired = 0;
        while let Some(chunk) = self.group.next_nr_chunk(position) {
            if self.group.health(position)? != PositionHealth::Rebuilding {
                return Err(Error::PositionDegraded(position));
            }
            let range = ChunkRange::single(chunk);
            let handle = match self.group.locks()
                .acquire(LockOwner::Rebuild(position), range,
                         LockMode::Exclusive)
                .await
            {
                Ok(h) => h,
                Err(Error::LockAborted) =>
                    return Err(Error::PositionDegraded(position)),
                Err(e) => {
                    self.group.finish_rebuild(position);
                    return Err(self.fail(position, e));
                }
            };
            if self.group.next_nr_chunk(position) != Some(chunk) {
                // An earlier chunk was marked while we waited
                continue;
            }
            let lbas = self.group.chunk_lbas(range);
            if let Err(e) = self.mover.reconstruct_chunk(position, drive, lbas)
                .await
            {
                tracing::warn!(%group, position, chunk,
                    "chunk reconstruction failed: {e}");
                self.group.finish_rebuild(position);
                return Err(Error::ChunkIo{position, chunk});
            }
            if let Err(e) = self.group.complete_rebuild_chunk(&handle, position,
                                                              chunk)
            {
                self.group.finish_rebuild(position);
                return Err(self.fail(position, e));
            }
            repaired += 1;
            tracing::trace!(position, chunk, "chunk rebuilt");
        }
        let clean = self.group.finish_rebuild(position);
        tracing::info!(%group, position, repaired, clean,
            "rebuild pass finished");
        Ok(repaired)
    }

    /// Send a progress notification if the whole percent has changed
    fn report_progress(&self, position: PositionT) {
        let Ok(percent) = self.group.percent_complete(position) else {
            return;
        };
        let percent = percent.floor() as u8;
        let mut ops = self.ops.lock().unwrap();
        if let Some(op) = ops.get_mut(&position) {
            if percent > op.last_percent {
                op.last_percent = percent;
                tracing::debug!(position, percent, "copy progress");
                self.log.notify(Notification::Progress {
                    group: self.group.id(),
                    position,
                    percent
                });
            }
        }
    }

    /// The source came back.  Chunks written while it was away get marked NR
    /// for re-verification.
    fn resume(&self, op: &mut CopyOperation, position: PositionT,
              resume: Resume, handle: &StripeLockHandle) -> Result<()>
    {
        let marked = self.group.end_glitch(handle, position,
                                           PositionHealth::Online)
            .map_err(|e| self.halt(op, position, e))?;
        tracing::info!(group = %self.group.id(), position, marked,
            "copy source returned");
        self.set_phase(op, position, resume.phase());
        Ok(())
    }

    /// Drive a copy all the way through, waiting out any source glitches.
    ///
    /// Returns the drive that now backs the position.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, position: PositionT) -> Result<DriveId> {
        loop {
            let (phase, wake) = {
                let ops = self.ops.lock().unwrap();
                let op = ops.get(&position)
                    .ok_or(Error::NoCopyInProgress(position))?;
                (op.phase, op.wake.clone())
            };
            match phase {
                CopyPhase::Requested | CopyPhase::ModeSetToMirror => {
                    self.metadata_rebuild(position).await?;
                }
                CopyPhase::MetadataRebuildStart => {
                    return Err(Error::InvalidPhase(phase.name()));
                }
                CopyPhase::MetadataRebuildDone |
                CopyPhase::DataCopyInProgress => {
                    self.copy_chunks(position, RUN_BATCH).await?;
                }
                CopyPhase::SourceGlitch{deadline, ..} => {
                    if timeout_at(deadline, wake.notified()).await.is_err() {
                        self.grace_expired(position).await?;
                    }
                }
                CopyPhase::CopyOperationComplete => {
                    return self.complete(position);
                }
                CopyPhase::SwappedOut => {
                    return Ok(self.group.edges().state(position)?.drive());
                }
                CopyPhase::Aborted(_) => {
                    return Err(Error::CopyAborted(position));
                }
                CopyPhase::Halted(_) => {
                    return Err(Error::PositionHalted(position));
                }
            }
        }
    }

    fn set_phase(&self, op: &mut CopyOperation, position: PositionT,
                 phase: CopyPhase)
    {
        op.phase = phase;
        tracing::info!(group = %self.group.id(), position, %phase,
            "copy phase changed");
        self.log.notify(Notification::PhaseChanged {
            group: self.group.id(),
            position,
            phase
        });
        op.wake.notify_one();
    }

    /// The source is gone for good.
    ///
    /// A copy that is far enough along finishes onto the destination, with
    /// the uncopied chunks marked NR.  Otherwise it is abandoned and the
    /// position degraded.
    fn source_lost(&self, op: &mut CopyOperation, position: PositionT,
                   resume: Resume, handle: &StripeLockHandle) -> Result<()>
    {
        let group = self.group.id();
        let percent = self.group.percent_complete(position)?;
        let threshold = f64::from(self.config.complete_onto_destination_percent);
        if resume != Resume::DataCopy || percent < threshold {
            tracing::warn!(%group, position, percent,
                "copy source failed; aborting");
            return self.abort(op, position, AbortReason::SourceFailed, true,
                              handle);
        }
        let marked = self.group.mark_uncopied_needs_rebuild(handle, position)
            .map_err(|e| self.halt(op, position, e))?;
        self.group.end_glitch(handle, position, PositionHealth::Rebuilding)
            .map_err(|e| self.halt(op, position, e))?;
        if self.group.nr_count(position)? == 0 {
            self.group.set_health(position, PositionHealth::Online);
        }
        let source = self.group.edges().swap_in_destination(position)?;
        self.group.end_copy(position);
        self.group.set_profile(position, op.destination.profile)?;
        let drive = op.destination.drive;
        tracing::warn!(%group, position, percent, marked, %source, %drive,
            "copy source failed; completing onto destination");
        self.log.notify(Notification::SourceFailed{group, position});
        self.finish(op, position, CopyPhase::SwappedOut);
        self.log.notify(Notification::CopyCompleted{group, position, drive});
        Ok(())
    }

    /// Start copying `position` onto a spare.
    ///
    /// On success the destination is attached in mirror mode and the copy is
    /// in `ModeSetToMirror`.  On failure nothing has changed.
    #[tracing::instrument(skip(self))]
    pub fn start_copy(&self, position: PositionT, kind: CopyKind) -> Result<()>
    {
        let group = self.group.id();
        if !self.group.raid_type().is_redundant() {
            return Err(Error::CopyNotAllowedNonRedundant);
        }
        let state = self.group.edges().state(position)?;
        let mut ops = self.ops.lock().unwrap();
        if ops.get(&position).is_some_and(|op| !op.phase.is_terminal()) {
            return Err(Error::CopyInProgress(position));
        }
        if self.group.is_forced_rebuild(position)? {
            return Err(Error::PositionHalted(position));
        }
        if self.group.health(position)? != PositionHealth::Online {
            return Err(Error::PositionDegraded(position));
        }
        let EdgeState::PassThrough{drive: source} = state else {
            return Err(Error::PositionDegraded(position));
        };
        if self.group.edges().status(position, Leg::Source) !=
            EdgeStatus::Enabled
        {
            return Err(Error::EdgeNotEnabled(position));
        }
        let profile = self.group.profile(position)?;
        let destination = self.spares.take(kind.wanted(),
                                           self.group.capacity(), &profile)?;
        self.emeh.copy_started(group, position);
        if let Err(e) = self.group.edges()
            .enter_mirror(position, destination.drive)
        {
            self.spares.give_back(destination);
            self.emeh.copy_finished(group, position);
            return Err(e);
        }
        self.group.begin_copy(position);
        tracing::info!(%group, position, ?kind, %source,
            destination = %destination.drive, "copy started");
        self.log.notify(Notification::CopyStarted {
            group,
            position,
            kind,
            source,
            destination: destination.drive
        });
        let mut op = CopyOperation {
            kind,
            phase: CopyPhase::Requested,
            source,
            destination,
            last_percent: 0,
            wake: Arc::default()
        };
        self.set_phase(&mut op, position, CopyPhase::Requested);
        self.set_phase(&mut op, position, CopyPhase::ModeSetToMirror);
        ops.insert(position, op);
        Ok(())
    }

    /// Replace a long-degraded position's drive with a spare.
    ///
    /// Every chunk of the new drive is marked NR; follow up with
    /// [`rebuild_position`](Self::rebuild_position).
    #[tracing::instrument(skip(self))]
    pub async fn swap_in_permanent_spare(&self, position: PositionT)
        -> Result<DriveId>
    {
        let group = self.group.id();
        let deadline = self.permanent_spare_deadline(position)?
            .ok_or(Error::InvalidPhase("position is not degraded"))?;
        if Instant::now() < deadline {
            return Err(Error::InvalidPhase(
                "permanent spare trigger has not fired"));
        }
        let profile = self.group.profile(position)?;
        let spare = self.spares.take(None, self.group.capacity(), &profile)?;
        let chunks = self.group.chunks();
        let mut start = 0;
        while start < chunks {
            let range = ChunkRange::new(start, (start + MARK_BATCH).min(chunks));
            let r = match self.group.locks()
                .acquire(LockOwner::Rebuild(position), range,
                         LockMode::Exclusive)
                .await
            {
                Ok(handle) => self.group
                    .mark_chunks_needs_rebuild(&handle, position, range),
                Err(e) => Err(e)
            };
            if let Err(e) = r {
                self.spares.give_back(spare);
                return Err(self.fail(position, e));
            }
            start = range.end;
        }
        if let Err(e) = self.group.edges()
            .attach_replacement(position, spare.drive)
        {
            self.spares.give_back(spare);
            return Err(e);
        }
        self.group.set_profile(position, spare.profile)?;
        self.group.leave_rebuild_logging(position);
        tracing::info!(%group, position, drive = %spare.drive,
            "permanent spare swapped in");
        Ok(spare.drive)
    }
}
