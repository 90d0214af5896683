// vim: tw=80
//! Hot spares available as copy destinations
//!
//! A spare is only eligible if it is healthy, unreserved, in the same
//! performance tier as the drive it replaces, and formatted with the same
//! block size.  Among eligible spares the pool prefers, in order: the same
//! drive type, the same back-end port, the smallest sufficient capacity, and
//! the same enclosure.

use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum DriveType {
    #[default]
    SasHdd,
    NlSasHdd,
    SataHdd,
    SasFlash,
    SataFlash,
}

impl DriveType {
    pub fn tier(self) -> PerformanceTier {
        match self {
            DriveType::SasHdd => PerformanceTier::Performance,
            DriveType::NlSasHdd | DriveType::SataHdd =>
                PerformanceTier::Capacity,
            DriveType::SasFlash | DriveType::SataFlash =>
                PerformanceTier::Flash,
        }
    }
}

/// Drives in one tier may stand in for each other
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PerformanceTier {
    Capacity,
    Performance,
    Flash,
}

/// Where a drive is attached
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct DriveLocation {
    /// Back-end bus
    pub port: u32,
    pub enclosure: u32,
}

/// The properties of a drive that decide what may replace it
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct DriveProfile {
    /// Physical block size in bytes
    pub block_size: u32,
    pub drive_type: DriveType,
    pub location: DriveLocation,
}

impl Default for DriveProfile {
    fn default() -> Self {
        DriveProfile {
            block_size: 512,
            drive_type: DriveType::default(),
            location: DriveLocation::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Spare {
    pub drive: DriveId,
    /// Usable size in blocks
    pub capacity: LbaT,
    pub profile: DriveProfile,
    /// Cleared when the drive reaches end of life or its edge goes away
    pub healthy: bool,
    /// Set aside for some other purpose
    pub reserved: bool,
}

impl Spare {
    /// A healthy, unreserved spare with the default profile
    pub fn new(drive: DriveId, capacity: LbaT) -> Self {
        Spare {
            drive,
            capacity,
            profile: DriveProfile::default(),
            healthy: true,
            reserved: false
        }
    }

    /// Could this spare replace a drive of `capacity` blocks and `profile`?
    fn eligible(&self, capacity: LbaT, profile: &DriveProfile) -> bool {
        self.healthy &&
            !self.reserved &&
            self.profile.drive_type.tier() == profile.drive_type.tier() &&
            self.profile.block_size == profile.block_size &&
            self.capacity >= capacity
    }

    /// Sort key among eligible spares.  Smaller is better.
    fn preference(&self, profile: &DriveProfile) -> (bool, bool, LbaT, bool) {
        (self.profile.drive_type != profile.drive_type,
         self.profile.location.port != profile.location.port,
         self.capacity,
         self.profile.location.enclosure != profile.location.enclosure)
    }
}

/// Drives not currently in any raid group
#[derive(Debug, Default)]
pub struct SparePool {
    spares: Mutex<Vec<Spare>>,
}

impl SparePool {
    pub fn add(&self, spare: Spare) {
        tracing::debug!(drive = %spare.drive, "spare added");
        self.spares.lock().unwrap().push(spare);
    }

    /// Put a destination from an abandoned copy back in the pool
    pub fn give_back(&self, spare: Spare) {
        self.add(spare)
    }

    pub fn is_empty(&self) -> bool {
        self.spares.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.spares.lock().unwrap().len()
    }

    /// Record a change in a spare's health.  Returns false if the drive is
    /// not in the pool.
    pub fn set_healthy(&self, drive: DriveId, healthy: bool) -> bool {
        let mut spares = self.spares.lock().unwrap();
        match spares.iter_mut().find(|s| s.drive == drive) {
            Some(s) => {
                s.healthy = healthy;
                true
            }
            None => false
        }
    }

    /// Remove a spare from the pool, to replace a drive of `capacity` blocks
    /// described by `profile`.
    ///
    /// With `wanted`, only that drive will do, and it must still be eligible.
    pub fn take(&self, wanted: Option<DriveId>, capacity: LbaT,
                profile: &DriveProfile) -> Result<Spare>
    {
        let mut spares = self.spares.lock().unwrap();
        let idx = spares.iter()
            .enumerate()
            .filter(|(_, s)| wanted.map_or(true, |w| w == s.drive))
            .filter(|(_, s)| s.eligible(capacity, profile))
            .min_by_key(|(_, s)| s.preference(profile))
            .map(|(i, _)| i);
        match idx {
            Some(i) => Ok(spares.swap_remove(i)),
            None => {
                tracing::warn!(?wanted, capacity, ?profile,
                    "no suitable spare");
                Err(Error::NoSpareAvailable)
            }
        }
    }
}

impl FromIterator<Spare> for SparePool {
    fn from_iter<I: IntoIterator<Item=Spare>>(iter: I) -> Self {
        SparePool { spares: Mutex::new(iter.into_iter().collect()) }
    }
}

// LCOV_EXCL_STOP
