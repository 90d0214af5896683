// vim: tw=80
//! Extended media error handling
//!
//! A drive that is being copied off of tends to report more media errors than
//! usual.  While any copy is outstanding in a raid group, that group's
//! media-error thresholds are relaxed so the drive layer doesn't eject drives
//! that are about to be replaced anyway.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

#[cfg(test)] use mockall::automock;

use crate::{
    config::EmehMode,
    types::*,
};

/// Interface to the drive-health subsystem
#[cfg_attr(test, automock)]
pub trait ErrorThresholds: Send + Sync {
    /// Raise `group`'s media-error thresholds by `increase_percent`
    fn relax(&self, group: RaidGroupId, increase_percent: u32);

    /// Put `group`'s thresholds back the way they were
    fn restore(&self, group: RaidGroupId);
}

/// Tracks copy epochs per raid group.
///
/// An epoch starts when the first copy in a group starts and ends when the
/// last one reaches a terminal phase.  Thresholds are relaxed exactly once at
/// the start of each epoch and restored exactly once at its end.
pub struct EmehController {
    thresholds: Arc<dyn ErrorThresholds>,
    mode: EmehMode,
    increase_percent: u32,
    /// Positions with an outstanding copy, for each group in an epoch
    active: Mutex<BTreeMap<RaidGroupId, BTreeSet<PositionT>>>,
}

impl EmehController {
    /// A copy on `position` has reached a terminal phase
    pub fn copy_finished(&self, group: RaidGroupId, position: PositionT) {
        let mut active = self.active.lock().unwrap();
        let Some(copying) = active.get_mut(&group) else {
            return;
        };
        if copying.remove(&position) && copying.is_empty() {
            active.remove(&group);
            if self.mode == EmehMode::Enabled {
                tracing::info!(%group, "restoring media error thresholds");
                self.thresholds.restore(group);
            }
        }
    }

    /// A copy on `position` is about to enter mirror mode
    pub fn copy_started(&self, group: RaidGroupId, position: PositionT) {
        let mut active = self.active.lock().unwrap();
        let copying = active.entry(group).or_default();
        let first = copying.is_empty();
        copying.insert(position);
        if first && self.mode == EmehMode::Enabled {
            tracing::info!(%group, increase = self.increase_percent,
                "relaxing media error thresholds");
            self.thresholds.relax(group, self.increase_percent);
        }
    }

    /// Are `group`'s thresholds currently relaxed?
    pub fn is_relaxed(&self, group: RaidGroupId) -> bool {
        self.mode == EmehMode::Enabled &&
            self.active.lock().unwrap().contains_key(&group)
    }

    pub fn new(thresholds: Arc<dyn ErrorThresholds>, mode: EmehMode,
               increase_percent: u32) -> Self
    {
        EmehController {
            thresholds,
            mode,
            increase_percent,
            active: Mutex::default()
        }
    }
}

// LCOV_EXCL_STOP
