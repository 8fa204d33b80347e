#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use mount0::fs::multi::{MultiProvider, Strategy};
use mount0::fs::{DynProvider, FsError, OpenFlags, Provider as _, ROOT_INO};

use common::{FaultyProvider, dyn_of, names, page_plus, read_at, write_file};

fn replicas(n: usize) -> Vec<Arc<FaultyProvider>> {
    (0..n).map(|_| FaultyProvider::new()).collect()
}

fn group(strategy: Strategy, replicas: &[Arc<FaultyProvider>]) -> MultiProvider {
    let members: Vec<DynProvider> = replicas.iter().map(dyn_of).collect();
    MultiProvider::new(strategy, members).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_reach_every_replica() {
    let disks = replicas(3);
    let multi = group(Strategy::First, &disks);

    write_file(&multi, ROOT_INO, "f", b"copied").await;

    for disk in &disks {
        let stat = disk.lookup(ROOT_INO, OsStr::new("f")).await.unwrap();
        let data = read_at(disk.as_ref(), stat.ino, 0, 16).await.unwrap();
        assert_eq!(&data[..], b"copied");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_fails_over_to_the_next_replica() {
    let disks = replicas(2);
    let multi = group(Strategy::First, &disks);
    let stat = write_file(&multi, ROOT_INO, "f", b"either").await;

    disks[0].fail_reads(true);
    let data = read_at(&multi, stat.ino, 0, 16).await.unwrap();
    assert_eq!(&data[..], b"either");

    disks[1].fail_reads(true);
    assert!(read_at(&multi, stat.ino, 0, 16).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn majority_tolerates_a_minority_of_failures() {
    let disks = replicas(3);
    let multi = group(Strategy::Majority, &disks);
    assert_eq!(multi.required(), 2);

    disks[2].fail_writes(true);
    let dir = multi.mkdir(ROOT_INO, OsStr::new("d"), 0o755).await.unwrap();
    assert!(dir.is_dir());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn majority_rejects_when_most_replicas_fail() {
    let disks = replicas(3);
    let multi = group(Strategy::Majority, &disks);

    disks[1].fail_writes(true);
    disks[2].fail_writes(true);
    let err = multi
        .create(ROOT_INO, OsStr::new("f"), 0o644, OpenFlags::RDWR)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            FsError::QuorumNotReached {
                successes: 1,
                required: 2
            }
        ),
        "got {err:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn majority_agreeing_on_a_missing_name_reports_it_missing() {
    let disks = replicas(3);
    let multi = group(Strategy::Majority, &disks);

    let err = multi
        .lookup(ROOT_INO, OsStr::new("absent"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NotFound), "got {err:?}");
    assert_eq!(err.errno().0, libc::ENOENT);

    let err = multi
        .unlink(ROOT_INO, OsStr::new("absent"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NotFound), "got {err:?}");

    // A create after the miss goes through, as it would after the kernel's own lookup.
    let created = multi
        .create(ROOT_INO, OsStr::new("absent"), 0o644, OpenFlags::RDWR)
        .await
        .unwrap();
    multi.release(created.stat.ino, created.fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn majority_reads_hold_until_most_replicas_fail() {
    let disks = replicas(3);
    let multi = group(Strategy::Majority, &disks);
    let stat = write_file(&multi, ROOT_INO, "f", b"quorum").await;

    disks[0].fail_reads(true);
    disks[0].fail_metadata(true);
    let data = read_at(&multi, stat.ino, 0, 16).await.unwrap();
    assert_eq!(&data[..], b"quorum");
    assert_eq!(multi.getattr(stat.ino, None).await.unwrap().size, 6);

    disks[1].fail_reads(true);
    disks[1].fail_metadata(true);
    let lost = |err: &FsError| {
        matches!(
            err,
            FsError::QuorumNotReached {
                successes: 1,
                required: 2
            }
        )
    };
    let err = read_at(&multi, stat.ino, 0, 16).await.unwrap_err();
    assert!(lost(&err), "got {err:?}");
    let err = multi.getattr(stat.ino, None).await.unwrap_err();
    assert!(lost(&err), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn all_needs_every_replica() {
    let disks = replicas(2);
    let multi = group(Strategy::All, &disks);

    disks[1].fail_writes(true);
    let err = multi
        .mkdir(ROOT_INO, OsStr::new("d"), 0o755)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::AllMembersFailed), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_is_the_union_of_replicas() {
    let disks = replicas(2);
    write_file(disks[0].as_ref(), ROOT_INO, "only-a", b"a").await;
    write_file(disks[1].as_ref(), ROOT_INO, "only-b", b"b").await;
    write_file(disks[0].as_ref(), ROOT_INO, "both", b"1").await;
    write_file(disks[1].as_ref(), ROOT_INO, "both", b"2").await;
    let multi = group(Strategy::First, &disks);

    assert_eq!(
        names(&multi, ROOT_INO).await,
        vec![
            OsString::from("both"),
            OsString::from("only-a"),
            OsString::from("only-b")
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paged_readdirplus_hands_back_skipped_lookups() {
    let disks = replicas(3);
    let multi = group(Strategy::Majority, &disks);
    for name in ["a", "b", "c"] {
        let stat = write_file(&multi, ROOT_INO, name, b"x").await;
        multi.forget(stat.ino, 1).await;
    }

    assert_eq!(page_plus(&multi, ROOT_INO, 2).await, vec![OsString::from("c")]);
    for disk in &disks {
        assert_eq!(disk.outstanding_lookups(), 0);
    }
}

#[test]
fn empty_group_is_rejected() {
    assert!(matches!(
        MultiProvider::new(Strategy::First, Vec::new()),
        Err(FsError::InvalidArgument)
    ));
}
