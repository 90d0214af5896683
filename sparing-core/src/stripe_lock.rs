// vim: tw=80
//! Stripe locks
//!
//! Every mutation of a stripe's data or of its needs-rebuild bits happens
//! under an exclusive lock on that stripe's chunk range.  Locks are granted
//! strictly first-come first-served among requests that overlap, so neither
//! foreground I/O nor the background copy can starve the other.
//!
//! To avoid deadlock a caller may hold, or wait for, at most one lock at a
//! time.  Work that spans several ranges must lock, mutate, and release each
//! one in turn.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, Weak},
};

use futures::channel::oneshot;

use crate::types::*;

/// Who is asking for a lock
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LockOwner {
    /// A foreground I/O, identified by the I/O path's own tag
    Io(u64),
    /// The background copy of one position
    Copy(PositionT),
    /// The background rebuild of one position
    Rebuild(PositionT),
    /// A copy state machine reacting to an edge event on one position
    Control(PositionT),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Good enough for read-only verification
    Shared,
    /// Required to write data or to touch the bitmap
    Exclusive,
}

#[derive(Debug)]
struct Holder {
    owner: LockOwner,
    range: ChunkRange,
    mode: LockMode,
}

#[derive(Debug)]
struct Sleeper {
    id: u64,
    owner: LockOwner,
    range: ChunkRange,
    mode: LockMode,
    tx: oneshot::Sender<()>,
}

fn conflicts(r0: &ChunkRange, m0: LockMode, r1: &ChunkRange, m1: LockMode)
    -> bool
{
    r0.overlaps(r1) && (m0 == LockMode::Exclusive || m1 == LockMode::Exclusive)
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    holders: BTreeMap<u64, Holder>,
    sleepers: VecDeque<Sleeper>,
}

impl Inner {
    /// Wake every sleeper that no longer conflicts with anything ahead of it.
    fn awaken(&mut self) {
        let mut i = 0;
        while i < self.sleepers.len() {
            let s = &self.sleepers[i];
            let blocked = self.holders.values()
                .any(|h| conflicts(&h.range, h.mode, &s.range, s.mode)) ||
                self.sleepers.iter().take(i)
                .any(|e| conflicts(&e.range, e.mode, &s.range, s.mode));
            if blocked {
                i += 1;
                continue;
            }
            let sleeper = self.sleepers.remove(i).unwrap();
            self.holders.insert(sleeper.id, Holder {
                owner: sleeper.owner,
                range: sleeper.range,
                mode: sleeper.mode
            });
            // If the waiter has gone away, its handle's Drop will release the
            // lock we just granted.
            let _ = sleeper.tx.send(());
        }
    }

    /// Could a new request be granted immediately?
    fn grantable(&self, range: &ChunkRange, mode: LockMode) -> bool {
        !self.holders.values()
            .any(|h| conflicts(&h.range, h.mode, range, mode)) &&
        !self.sleepers.iter()
            .any(|s| conflicts(&s.range, s.mode, range, mode))
    }

    fn owns_any(&self, owner: LockOwner) -> bool {
        self.holders.values().any(|h| h.owner == owner) ||
            self.sleepers.iter().any(|s| s.owner == owner)
    }

    fn release(&mut self, id: u64) {
        if self.holders.remove(&id).is_none() {
            self.sleepers.retain(|s| s.id != id);
        }
        self.awaken();
    }
}

/// Proof that a stripe lock is held.  Dropping it releases the lock.
#[derive(Debug)]
pub struct StripeLockHandle {
    id: u64,
    owner: LockOwner,
    range: ChunkRange,
    mode: LockMode,
    table: Weak<Mutex<Inner>>,
}

impl StripeLockHandle {
    /// Does this handle authorize mutating `range`?
    pub fn covers_exclusive(&self, range: &ChunkRange) -> bool {
        self.mode == LockMode::Exclusive && self.range.contains(range)
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    pub fn range(&self) -> ChunkRange {
        self.range
    }
}

impl Drop for StripeLockHandle {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().unwrap().release(self.id);
        }
    }
}

/// The stripe lock table for one raid group
#[derive(Debug, Default)]
pub struct StripeLockTable {
    inner: Arc<Mutex<Inner>>,
}

impl StripeLockTable {
    /// Fail every queued wait belonging to `owner` with `LockAborted`.
    ///
    /// Locks already granted are unaffected.  Returns the number of waits
    /// aborted.
    pub fn abort_waiting(&self, owner: LockOwner) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.sleepers.len();
        inner.sleepers.retain(|s| s.owner != owner);
        let aborted = before - inner.sleepers.len();
        if aborted > 0 {
            tracing::debug!(?owner, aborted, "aborted stripe lock waits");
            // Requests queued behind the aborted ones may now be grantable
            inner.awaken();
        }
        aborted
    }

    /// Lock `range` in the given mode.
    ///
    /// Waits behind any earlier overlapping request that conflicts.  Fails
    /// immediately with `LockOrdering` if `owner` already holds or awaits a
    /// lock in this table.
    pub async fn acquire(&self, owner: LockOwner, range: ChunkRange,
                         mode: LockMode) -> Result<StripeLockHandle>
    {
        let (handle, rx) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.owns_any(owner) {
                tracing::error!(?owner, %range, "nested stripe lock refused");
                return Err(Error::LockOrdering);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let handle = StripeLockHandle {
                id,
                owner,
                range,
                mode,
                table: Arc::downgrade(&self.inner)
            };
            if inner.grantable(&range, mode) {
                inner.holders.insert(id, Holder { owner, range, mode });
                return Ok(handle);
            }
            let (tx, rx) = oneshot::channel();
            inner.sleepers.push_back(Sleeper { id, owner, range, mode, tx });
            tracing::trace!(?owner, %range, ?mode, "waiting for stripe lock");
            (handle, rx)
        };
        match rx.await {
            Ok(()) => Ok(handle),
            Err(_) => Err(Error::LockAborted)
        }
    }

    /// Does anybody hold a lock overlapping `range`?
    pub fn is_locked(&self, range: &ChunkRange) -> bool {
        self.inner.lock().unwrap().holders.values()
            .any(|h| h.range.overlaps(range))
    }

    pub fn release(&self, handle: StripeLockHandle) {
        drop(handle)
    }

    /// Number of requests still waiting
    pub fn waiting(&self) -> usize {
        self.inner.lock().unwrap().sleepers.len()
    }
}

// LCOV_EXCL_STOP
