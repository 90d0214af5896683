// vim: tw=80
//! Whole copies, with foreground writes, glitches, and failures along the way

use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rstest::rstest;

use sparing_core::{
    copy::{AbortReason, CopyPhase},
    edge::BrokenReason,
    raid_group::PositionHealth,
};

use super::*;

/// Randomly interleave foreground writes with a complete copy.  Nothing
/// written during the copy may be lost, and nothing should need rebuild.
#[rstest]
#[case(0)]
#[case(0x1234)]
#[case(0xdead_beef)]
#[tokio::test(start_paused = true)]
async fn concurrent_writes(#[case] seed: u64) {
    let f = Fixture::new(RaidType::Raid5, 4, 1);
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let writes = (0..64)
        .map(|_| rng.gen_range(0..CHUNKS))
        .collect::<Vec<_>>();
    t!(f.machine.start_copy(2, CopyKind::Proactive));
    let writer = async {
        for chunk in writes {
            f.write(2, chunk).await;
            tokio::task::yield_now().await;
        }
    };
    let (r, ()) = futures::join!(f.machine.run(2), writer);
    assert_eq!(r, Ok(f.spares[0]));
    assert_eq!(t!(f.machine.group().edges().state(2)),
               EdgeState::PassThrough{drive: f.spares[0]});
    assert_eq!(f.machine.group().nr_count(2), Ok(0));
    f.verify(2);
}

/// A copy with no writes at all
#[test_log::test(tokio::test(start_paused = true))]
async fn read_only() {
    let f = Fixture::new(RaidType::Raid1, 2, 1);
    for chunk in 0..CHUNKS {
        f.write(0, chunk).await;
    }
    t!(f.machine.start_copy(0, CopyKind::User));
    assert_eq!(f.machine.run(0).await, Ok(f.spares[0]));
    f.verify(0);
    let events = f.log.events();
    assert_eq!(events.last(), Some(&Notification::CopyCompleted {
        group: RG,
        position: 0,
        drive: f.spares[0]
    }));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn non_redundant() {
    let f = Fixture::new(RaidType::Raid0, 2, 1);
    assert_eq!(f.machine.start_copy(0, CopyKind::User),
               Err(Error::CopyNotAllowedNonRedundant));
    assert_eq!(f.pool.len(), 1);
    assert!(f.log.events().is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn destination_refused() {
    let f = Fixture::new(RaidType::Raid6, 4, 1);
    f.drives.refuse_attach.store(true, Ordering::Relaxed);
    assert_eq!(f.machine.start_copy(3, CopyKind::User),
               Err(Error::EdgeFailed(3)));
    assert_eq!(f.pool.len(), 1);
    assert_eq!(f.thresholds.counts(), (1, 1));
}

/// Cancel a copy halfway through.  The source is left exactly as it was,
/// needs-rebuild bits and all.
#[test_log::test(tokio::test(start_paused = true))]
async fn cancel_halfway() {
    let f = Fixture::new(RaidType::Raid5, 3, 1);
    let g = f.machine.group();
    let lbas = g.chunk_lbas(ChunkRange::new(6, 8));
    let h = t!(g.lock(LockOwner::Io(0), lbas, LockMode::Exclusive).await);
    t!(g.mark_needs_rebuild(&h, 1, lbas));
    drop(h);

    t!(f.machine.start_copy(1, CopyKind::User));
    t!(f.machine.metadata_rebuild(1).await);
    assert_eq!(f.machine.copy_chunks(1, CHUNKS / 2).await, Ok(CHUNKS / 2));
    f.write(1, 4).await;
    f.write(1, 15).await;
    assert_eq!(f.machine.percent_complete(1), 50.0);
    t!(f.machine.cancel(1).await);

    assert_eq!(f.machine.copy_phase(1),
               Some(CopyPhase::Aborted(AbortReason::Cancelled)));
    assert_eq!(t!(g.edges().state(1)),
               EdgeState::PassThrough{drive: f.members[1]});
    assert_eq!(g.nr_count(1), Ok(2));
    assert_eq!(g.health(1), Ok(PositionHealth::Online));
    assert_eq!(g.current_cursor(1), Ok(None));
    assert_eq!(f.pool.len(), 1);
    assert_eq!(f.thresholds.counts(), (1, 1));
    f.verify(1);
}

mod glitch {
    use pretty_assertions::assert_eq;

    use super::*;

    /// The source comes back within the grace window.  Only the chunks
    /// written meanwhile need rebuild.
    #[test_log::test(tokio::test(start_paused = true))]
    async fn within_grace() {
        let f = Fixture::new(RaidType::Raid5, 4, 1);
        t!(f.machine.start_copy(1, CopyKind::User));
        t!(f.machine.metadata_rebuild(1).await);
        assert_eq!(f.machine.copy_chunks(1, 8).await, Ok(8));
        f.source_event(1, EdgeStatus::Disabled).await;
        f.write(1, 3).await;
        f.write(1, 12).await;
        tokio::time::advance(GRACE / 2).await;
        f.source_event(1, EdgeStatus::Enabled).await;
        assert_eq!(f.machine.copy_phase(1),
                   Some(CopyPhase::DataCopyInProgress));

        assert_eq!(f.machine.run(1).await, Ok(f.spares[0]));
        let g = f.machine.group();
        assert_eq!(g.nr_count(1), Ok(2));
        f.verify(1);
        assert_eq!(f.machine.rebuild_position(1).await, Ok(2));
        assert_eq!(g.nr_count(1), Ok(0));
        assert_eq!(g.health(1), Ok(PositionHealth::Online));
        f.verify(1);
    }

    /// The source stays away.  The copy is abandoned, the position degraded,
    /// and when the drive finally returns only the chunks written while it
    /// was gone are rebuilt.
    #[test_log::test(tokio::test(start_paused = true))]
    async fn after_grace() {
        let f = Fixture::new(RaidType::Raid5, 4, 1);
        t!(f.machine.start_copy(1, CopyKind::User));
        t!(f.machine.metadata_rebuild(1).await);
        assert_eq!(f.machine.copy_chunks(1, 8).await, Ok(8));
        f.source_event(1, EdgeStatus::Disabled).await;
        f.write(1, 3).await;

        assert_eq!(f.machine.run(1).await, Err(Error::CopyAborted(1)));
        let g = f.machine.group();
        assert!(matches!(t!(g.edges().state(1)),
            EdgeState::Broken{reason: BrokenReason::SourceFailed, ..}));
        assert!(matches!(g.health(1), Ok(PositionHealth::Degraded{..})));
        assert_eq!(g.nr_count(1), Ok(1));
        assert_eq!(f.pool.len(), 1);
        assert_eq!(f.thresholds.counts(), (1, 1));

        f.write(1, 5).await;
        assert_eq!(g.nr_count(1), Ok(2));
        f.source_event(1, EdgeStatus::Enabled).await;
        assert_eq!(g.health(1), Ok(PositionHealth::Rebuilding));
        assert_eq!(f.machine.rebuild_position(1).await, Ok(2));
        assert_eq!(g.health(1), Ok(PositionHealth::Online));
        f.verify(1);
    }

    /// Losing the source once nearly everything is copied finishes the copy
    /// onto the destination instead.
    #[test_log::test(tokio::test(start_paused = true))]
    async fn nearly_done() {
        let f = Fixture::new(RaidType::Raid10, 4, 1);
        for chunk in 0..CHUNKS {
            f.write(0, chunk).await;
        }
        t!(f.machine.start_copy(0, CopyKind::Proactive));
        t!(f.machine.metadata_rebuild(0).await);
        assert_eq!(f.machine.copy_chunks(0, CHUNKS - 1).await, Ok(CHUNKS - 1));
        f.source_event(0, EdgeStatus::Gone).await;

        let g = f.machine.group();
        assert_eq!(f.machine.copy_phase(0), Some(CopyPhase::SwappedOut));
        assert_eq!(t!(g.edges().state(0)),
                   EdgeState::PassThrough{drive: f.spares[0]});
        assert_eq!(g.nr_count(0), Ok(1));
        assert_eq!(g.health(0), Ok(PositionHealth::Rebuilding));
        f.verify(0);
        assert_eq!(f.machine.rebuild_position(0).await, Ok(1));
        f.verify(0);
        assert!(f.log.events().contains(&Notification::SourceFailed {
            group: RG,
            position: 0
        }));
    }
}

/// A position that stays degraded long enough gets a permanent spare
#[test_log::test(tokio::test(start_paused = true))]
async fn permanent_spare() {
    let f = Fixture::new(RaidType::Raid6, 5, 1);
    f.source_event(4, EdgeStatus::Gone).await;
    f.write(4, 9).await;
    assert_eq!(f.machine.await_permanent_spare(4).await, Ok(Some(f.spares[0])));
    let g = f.machine.group();
    assert_eq!(g.nr_count(4), Ok(CHUNKS));
    assert_eq!(f.machine.rebuild_position(4).await, Ok(CHUNKS));
    assert_eq!(g.health(4), Ok(PositionHealth::Online));
    f.verify(4);
}
