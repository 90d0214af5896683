// vim: tw=80
//! End-to-end tests of the sparing core, against simulated drives
//!
//! Every simulated drive stores a version number for each chunk.  Foreground
//! writes bump the expected version and store it on whichever legs of the
//! position's edge are reachable, so after any sequence of copies, glitches,
//! and rebuilds we can check that every chunk not marked needs-rebuild holds
//! the latest data.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future;
use pretty_assertions::assert_eq;

use sparing_core::{
    config::CopyConfig,
    copy::{BoxChunkFut, ChunkMover, CopyKind, CopyStateMachine},
    edge::{DriveEdges, EdgeState, EdgeStatus, Leg},
    emeh::{EmehController, ErrorThresholds},
    notify::{EventLog, Notification},
    raid_group::{RaidGroup, RaidType, WriteOutcome},
    spare::{Spare, SparePool},
    stripe_lock::{LockMode, LockOwner},
    *
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

mod copy;
mod emeh;

const CS: LbaT = 8;
const CHUNKS: ChunkT = 20;
const GRACE: Duration = Duration::from_secs(5);
const RG: RaidGroupId = RaidGroupId(3);

/// Contents of every simulated drive, plus what they ought to contain
#[derive(Default)]
struct Disks {
    /// Version of each chunk on each drive
    contents: Mutex<HashMap<DriveId, Vec<u64>>>,
    /// Latest version of each chunk of each position
    expected: Mutex<Vec<Vec<u64>>>,
}

impl Disks {
    fn new(members: &[DriveId], spares: &[DriveId]) -> Self {
        let contents = members.iter()
            .chain(spares.iter())
            .map(|d| (*d, vec![0; CHUNKS as usize]))
            .collect();
        let expected = vec![vec![0; CHUNKS as usize]; members.len()];
        Disks {
            contents: Mutex::new(contents),
            expected: Mutex::new(expected)
        }
    }

    /// A new version of `chunk` has been written to `position`
    fn bump(&self, position: PositionT, chunk: ChunkT) -> u64 {
        let mut expected = self.expected.lock().unwrap();
        let v = &mut expected[usize::from(position)][chunk as usize];
        *v += 1;
        *v
    }

    fn expected(&self, position: PositionT, chunk: ChunkT) -> u64 {
        self.expected.lock().unwrap()[usize::from(position)][chunk as usize]
    }

    fn get(&self, drive: DriveId, chunk: ChunkT) -> u64 {
        self.contents.lock().unwrap()[&drive][chunk as usize]
    }

    fn put(&self, drive: DriveId, chunk: ChunkT, version: u64) {
        self.contents.lock().unwrap()
            .get_mut(&drive)
            .unwrap()[chunk as usize] = version;
    }
}

/// The drive layer, with edge statuses controlled by the test
struct FakeDrives {
    statuses: Mutex<Vec<(EdgeStatus, EdgeStatus)>>,
    refuse_attach: AtomicBool,
}

impl FakeDrives {
    fn new(width: usize) -> Self {
        let statuses = vec![(EdgeStatus::Enabled, EdgeStatus::Enabled); width];
        FakeDrives {
            statuses: Mutex::new(statuses),
            refuse_attach: AtomicBool::new(false)
        }
    }

    fn set(&self, position: PositionT, which: Leg, status: EdgeStatus) {
        let mut statuses = self.statuses.lock().unwrap();
        let s = &mut statuses[usize::from(position)];
        match which {
            Leg::Source => s.0 = status,
            Leg::Destination => s.1 = status,
        }
    }
}

impl DriveEdges for FakeDrives {
    fn attach_destination_edge(&self, position: PositionT, _drive: DriveId)
        -> Result<()>
    {
        if self.refuse_attach.load(Ordering::Relaxed) {
            Err(Error::EdgeFailed(position))
        } else {
            // A newly attached drive is always healthy
            self.set(position, Leg::Destination, EdgeStatus::Enabled);
            Ok(())
        }
    }

    fn detach_edge(&self, _position: PositionT, _which: Leg) -> Result<()> {
        Ok(())
    }

    fn edge_status(&self, position: PositionT, which: Leg) -> EdgeStatus {
        let s = self.statuses.lock().unwrap()[usize::from(position)];
        match which {
            Leg::Source => s.0,
            Leg::Destination => s.1,
        }
    }
}

/// Moves versions between simulated drives, yielding once per chunk so that
/// foreground writes get a chance to interleave.
struct FakeMover {
    disks: Arc<Disks>,
    drives: Arc<FakeDrives>,
}

impl ChunkMover for FakeMover {
    fn copy_chunk(&self, position: PositionT, source: DriveId,
                  destination: DriveId, lbas: LbaRange) -> BoxChunkFut
    {
        let disks = self.disks.clone();
        let drives = self.drives.clone();
        Box::pin(async move {
            tokio::task::yield_now().await;
            if drives.edge_status(position, Leg::Source) != EdgeStatus::Enabled
            {
                return Err(Error::EdgeFailed(position));
            }
            for chunk in lbas.start / CS..lbas.end / CS {
                disks.put(destination, chunk, disks.get(source, chunk));
            }
            Ok(())
        })
    }

    fn reconstruct_chunk(&self, position: PositionT, drive: DriveId,
                         lbas: LbaRange) -> BoxChunkFut
    {
        for chunk in lbas.start / CS..lbas.end / CS {
            self.disks.put(drive, chunk, self.disks.expected(position, chunk));
        }
        Box::pin(future::ok(()))
    }
}

#[derive(Default)]
struct CountingThresholds {
    relaxed: AtomicUsize,
    restored: AtomicUsize,
}

impl CountingThresholds {
    fn counts(&self) -> (usize, usize) {
        (self.relaxed.load(Ordering::Relaxed),
         self.restored.load(Ordering::Relaxed))
    }
}

impl ErrorThresholds for CountingThresholds {
    fn relax(&self, _group: RaidGroupId, _increase_percent: u32) {
        self.relaxed.fetch_add(1, Ordering::Relaxed);
    }

    fn restore(&self, _group: RaidGroupId) {
        self.restored.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct RecordingLog(Mutex<Vec<Notification>>);

impl RecordingLog {
    fn events(&self) -> Vec<Notification> {
        self.0.lock().unwrap().clone()
    }
}

impl EventLog for RecordingLog {
    fn notify(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

struct Fixture {
    machine: CopyStateMachine,
    members: Vec<DriveId>,
    spares: Vec<DriveId>,
    pool: Arc<SparePool>,
    disks: Arc<Disks>,
    drives: Arc<FakeDrives>,
    thresholds: Arc<CountingThresholds>,
    log: Arc<RecordingLog>,
}

impl Fixture {
    fn new(raid_type: RaidType, width: usize, nspares: usize) -> Self {
        let config = CopyConfig {
            chunk_size: CS,
            grace_window: GRACE,
            ..Default::default()
        };
        let members = (0..width).map(|_| DriveId::new_v4())
            .collect::<Vec<_>>();
        let spares = (0..nspares).map(|_| DriveId::new_v4())
            .collect::<Vec<_>>();
        let disks = Arc::new(Disks::new(&members, &spares));
        let drives = Arc::new(FakeDrives::new(width));
        let group = t!(RaidGroup::new(RG, raid_type, &members, CHUNKS * CS,
                                      &config, drives.clone()));
        let pool = Arc::new(spares.iter()
            .map(|&drive| Spare::new(drive, CHUNKS * CS))
            .collect::<SparePool>());
        let thresholds = Arc::new(CountingThresholds::default());
        let emeh = Arc::new(EmehController::new(thresholds.clone(),
            config.emeh_mode, config.emeh_threshold_increase));
        let log = Arc::new(RecordingLog::default());
        let mover = Arc::new(FakeMover {
            disks: disks.clone(),
            drives: drives.clone()
        });
        let machine = t!(CopyStateMachine::new(config, Arc::new(group), mover,
            pool.clone(), emeh, log.clone()));
        Fixture {
            machine,
            members,
            spares,
            pool,
            disks,
            drives,
            thresholds,
            log
        }
    }

    /// Report a change in a source edge, as the drive layer would
    async fn source_event(&self, position: PositionT, status: EdgeStatus) {
        self.drives.set(position, Leg::Source, status);
        t!(self.machine.edge_state_changed(position, Leg::Source, status)
           .await);
    }

    /// Check that the drive now backing `position` holds the latest version
    /// of every chunk that isn't marked needs-rebuild
    fn verify(&self, position: PositionT) {
        let g = self.machine.group();
        let drive = t!(g.edges().state(position)).drive();
        for chunk in 0..CHUNKS {
            let lbas = g.chunk_lbas(ChunkRange::single(chunk));
            if !t!(g.needs_degraded_read(position, lbas)) {
                assert_eq!(self.disks.get(drive, chunk),
                           self.disks.expected(position, chunk),
                           "stale chunk {chunk} on position {position}");
            }
        }
    }

    /// Write one chunk of `position` through its edge
    async fn write(&self, position: PositionT, chunk: ChunkT) {
        let g = self.machine.group();
        let lbas = g.chunk_lbas(ChunkRange::single(chunk));
        let h = t!(g.lock(LockOwner::Io(chunk), lbas, LockMode::Exclusive)
                   .await);
        let version = self.disks.bump(position, chunk);
        let legs = match t!(g.edges().state(position)) {
            EdgeState::PassThrough{drive} => vec![(drive, Leg::Source)],
            EdgeState::Mirror{source, destination, ..} =>
                vec![(source, Leg::Source), (destination, Leg::Destination)],
            EdgeState::Broken{..} => Vec::new(),
        };
        let mut missed = legs.is_empty();
        for (drive, leg) in legs {
            if self.drives.edge_status(position, leg) == EdgeStatus::Enabled {
                self.disks.put(drive, chunk, version);
            } else {
                missed = true;
            }
        }
        let outcome = if missed {
            WriteOutcome::Failed(vec![position])
        } else {
            WriteOutcome::Success
        };
        t!(g.on_write_complete(&h, &[position], lbas, &outcome));
    }
}
