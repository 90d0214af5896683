// vim: tw=80
//! Media-error thresholds across overlapping copies

use pretty_assertions::assert_eq;

use super::*;

/// Overlapping copies share one relaxation of the thresholds
#[test_log::test(tokio::test(start_paused = true))]
async fn overlapping_copies() {
    let f = Fixture::new(RaidType::Raid6, 6, 3);
    t!(f.machine.start_copy(1, CopyKind::User));
    t!(f.machine.start_copy(4, CopyKind::Proactive));
    assert_eq!(f.thresholds.counts(), (1, 0));
    let (r1, r4) = futures::join!(f.machine.run(1), f.machine.run(4));
    t!(r1);
    t!(r4);
    assert_eq!(f.thresholds.counts(), (1, 1));

    // A later copy starts a new epoch
    t!(f.machine.start_copy(2, CopyKind::User));
    t!(f.machine.cancel(2).await);
    assert_eq!(f.thresholds.counts(), (2, 2));
    assert_eq!(f.pool.len(), 1);
}

/// An epoch spans copies that don't overlap with each other, as long as
/// some copy is always outstanding
#[test_log::test(tokio::test(start_paused = true))]
async fn chained_copies() {
    let f = Fixture::new(RaidType::Raid5, 3, 2);
    t!(f.machine.start_copy(0, CopyKind::User));
    t!(f.machine.metadata_rebuild(0).await);
    t!(f.machine.copy_chunks(0, CHUNKS).await);
    t!(f.machine.start_copy(2, CopyKind::User));
    t!(f.machine.complete(0));
    assert_eq!(f.thresholds.counts(), (1, 0));
    t!(f.machine.run(2).await);
    assert_eq!(f.thresholds.counts(), (1, 1));
}
