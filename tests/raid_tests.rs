#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use bytes::Bytes;
use mount0::fs::memory::MemoryProvider;
use mount0::fs::raid::RaidProvider;
use mount0::fs::raid::geometry::{Level, xor_blocks};
use mount0::fs::{DynProvider, FsError, OpenFlags, Provider as _, ROOT_INO};

use common::{FaultyProvider, dyn_of, memory, page_plus, read_at, write_file};

const STRIPE: u64 = 4;

fn members(n: usize) -> Vec<Arc<MemoryProvider>> {
    (0..n).map(|_| memory()).collect()
}

fn as_dyn(members: &[Arc<MemoryProvider>]) -> Vec<DynProvider> {
    members.iter().map(dyn_of).collect()
}

/// Raw bytes of `name` on one member, bypassing the RAID layer.
async fn member_bytes(member: &MemoryProvider, name: &str) -> Vec<u8> {
    let stat = member.lookup(ROOT_INO, OsStr::new(name)).await.unwrap();
    let size = u32::try_from(stat.size).unwrap();
    read_at(member, stat.ino, 0, size).await.unwrap().to_vec()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid0_deals_stripes_round_robin() {
    let disks = members(3);
    let raid = RaidProvider::new(Level::Raid0, as_dyn(&disks), STRIPE).unwrap();

    let data = b"AAAABBBBCCCCDDDDEE";
    let stat = write_file(&raid, ROOT_INO, "f", data).await;

    assert_eq!(member_bytes(&disks[0], "f").await, b"AAAADDDD");
    assert_eq!(member_bytes(&disks[1], "f").await, b"BBBBEE");
    assert_eq!(member_bytes(&disks[2], "f").await, b"CCCC");

    let attr = raid.getattr(stat.ino, None).await.unwrap();
    assert_eq!(attr.size, data.len() as u64, "logical size spans every member");

    let back = read_at(&raid, stat.ino, 0, 64).await.unwrap();
    assert_eq!(&back[..], data);
    let middle = read_at(&raid, stat.ino, 6, 8).await.unwrap();
    assert_eq!(&middle[..], b"BBCCCCDD");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid1_survives_a_member_that_stops_writing() {
    let healthy = memory();
    let broken = FaultyProvider::new();
    let raid = RaidProvider::new(
        Level::Raid1,
        vec![dyn_of(&healthy), dyn_of(&broken)],
        STRIPE,
    )
    .unwrap();

    let created = raid
        .create(ROOT_INO, OsStr::new("mirror"), 0o644, OpenFlags::RDWR)
        .await
        .unwrap();
    broken.fail_writes(true);
    let written = raid
        .write(created.stat.ino, created.fh, 0, Bytes::from_static(b"kept"))
        .await
        .unwrap();
    assert_eq!(written, 4);
    raid.release(created.stat.ino, created.fh).await.unwrap();

    assert_eq!(member_bytes(&healthy, "mirror").await, b"kept");
    let back = read_at(&raid, created.stat.ino, 0, 16).await.unwrap();
    assert_eq!(&back[..], b"kept");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid1_write_fails_when_every_member_fails() {
    let a = FaultyProvider::new();
    let b = FaultyProvider::new();
    let raid = RaidProvider::new(Level::Raid1, vec![dyn_of(&a), dyn_of(&b)], STRIPE).unwrap();

    let created = raid
        .create(ROOT_INO, OsStr::new("f"), 0o644, OpenFlags::RDWR)
        .await
        .unwrap();
    a.fail_writes(true);
    b.fail_writes(true);
    let err = raid
        .write(created.stat.ino, created.fh, 0, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::AllMembersFailed), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid1_reads_survive_while_one_member_answers() {
    let disks = [FaultyProvider::new(), FaultyProvider::new()];
    let raid = RaidProvider::new(Level::Raid1, disks.iter().map(dyn_of).collect(), STRIPE).unwrap();
    let stat = write_file(&raid, ROOT_INO, "m", b"mirrored").await;

    disks[0].go_dark();
    let found = raid.lookup(ROOT_INO, OsStr::new("m")).await.unwrap();
    assert_eq!(found.size, 8);
    assert_eq!(raid.getattr(stat.ino, None).await.unwrap().size, 8);
    let back = read_at(&raid, stat.ino, 0, 16).await.unwrap();
    assert_eq!(&back[..], b"mirrored");

    disks[1].go_dark();
    let err = read_at(&raid, stat.ino, 0, 16).await.unwrap_err();
    assert!(matches!(err, FsError::AllMembersFailed), "got {err:?}");
    let err = raid.getattr(stat.ino, None).await.unwrap_err();
    assert!(matches!(err, FsError::AllMembersFailed), "got {err:?}");
    let err = raid.lookup(ROOT_INO, OsStr::new("m")).await.unwrap_err();
    assert!(matches!(err, FsError::AllMembersFailed), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid5_parity_is_xor_of_the_group() {
    let disks = members(3);
    let raid = RaidProvider::new(Level::Raid5, as_dyn(&disks), STRIPE).unwrap();

    write_file(&raid, ROOT_INO, "p", b"AAAABBBB").await;

    // Group 0: data on members 0 and 1 in their data slot, parity on member 2 in its parity slot.
    let m0 = member_bytes(&disks[0], "p").await;
    let m1 = member_bytes(&disks[1], "p").await;
    let m2 = member_bytes(&disks[2], "p").await;
    assert_eq!(&m0[4..8], b"AAAA");
    assert_eq!(&m1[4..8], b"BBBB");
    assert_eq!(&m2[0..4], xor_blocks(&[b"AAAA".as_slice(), b"BBBB".as_slice()]).as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid5_rebuilds_a_lost_stripe_from_parity() {
    let good_a = memory();
    let lost = FaultyProvider::new();
    let good_b = memory();
    let raid = RaidProvider::new(
        Level::Raid5,
        vec![dyn_of(&good_a), dyn_of(&lost), dyn_of(&good_b)],
        STRIPE,
    )
    .unwrap();

    let stat = write_file(&raid, ROOT_INO, "d", b"AAAABBBB").await;
    lost.fail_reads(true);

    let back = read_at(&raid, stat.ino, 0, 8).await.unwrap();
    assert_eq!(&back[..], b"AAAABBBB", "stripe 1 comes back from parity");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid5_cannot_rebuild_a_stripe_sharing_a_member_with_its_parity() {
    let lost = FaultyProvider::new();
    let (a, c, d) = (memory(), memory(), memory());
    let raid = RaidProvider::new(
        Level::Raid5,
        vec![dyn_of(&a), dyn_of(&lost), dyn_of(&c), dyn_of(&d)],
        STRIPE,
    )
    .unwrap();
    let data = b"AAAABBBBCCCCDDDDEEEEFFFFGGGGHHHH";
    let stat = write_file(&raid, ROOT_INO, "g", data).await;
    // Stripe 7 lives on member 1, which also holds the parity of its group.
    assert_eq!(raid.geometry().data_member(7), 1);
    assert_eq!(raid.geometry().parity_members(raid.geometry().group(7)), vec![1]);

    lost.fail_reads(true);
    for stripe in 0..7_u64 {
        let off = stripe * STRIPE;
        let back = read_at(&raid, stat.ino, off, 4).await.unwrap();
        let start = usize::try_from(off).unwrap();
        assert_eq!(&back[..], &data[start..start + 4], "stripe {stripe}");
    }

    let err = read_at(&raid, stat.ino, 7 * STRIPE, 4).await.unwrap_err();
    assert!(matches!(err, FsError::AllMembersFailed), "got {err:?}");
    let err = read_at(&raid, stat.ino, 0, 64).await.unwrap_err();
    assert!(matches!(err, FsError::AllMembersFailed), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raid6_parity_members_hold_both_blocks() {
    let disks = members(4);
    let raid = RaidProvider::new(Level::Raid6, as_dyn(&disks), STRIPE).unwrap();

    write_file(&raid, ROOT_INO, "q", b"AAAABBBB").await;

    let p1 = xor_blocks(&[b"AAAA".as_slice(), b"BBBB".as_slice()]);
    let p2 = xor_blocks(&[b"AAAA".as_slice(), b"BBBB".as_slice(), p1.as_slice()]);
    assert_eq!(&member_bytes(&disks[2], "q").await[0..4], p1.as_slice());
    assert_eq!(&member_bytes(&disks[3], "q").await[0..4], p2.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paged_readdirplus_hands_back_skipped_lookups() {
    let disks = [FaultyProvider::new(), FaultyProvider::new()];
    let raid = RaidProvider::new(Level::Raid1, disks.iter().map(dyn_of).collect(), STRIPE).unwrap();
    for name in ["a", "b", "c"] {
        let stat = write_file(&raid, ROOT_INO, name, b"x").await;
        raid.forget(stat.ino, 1).await;
    }

    assert_eq!(page_plus(&raid, ROOT_INO, 2).await, vec![OsString::from("c")]);
    for disk in &disks {
        assert_eq!(disk.outstanding_lookups(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metadata_is_mirrored_to_every_member() {
    let disks = members(2);
    let raid = RaidProvider::new(Level::Raid0, as_dyn(&disks), STRIPE).unwrap();

    let dir = raid.mkdir(ROOT_INO, OsStr::new("dir"), 0o755).await.unwrap();
    assert!(dir.is_dir());
    for disk in &disks {
        assert!(disk.lookup(ROOT_INO, OsStr::new("dir")).await.unwrap().is_dir());
    }

    raid.rmdir(ROOT_INO, OsStr::new("dir")).await.unwrap();
    for disk in &disks {
        assert!(matches!(
            disk.lookup(ROOT_INO, OsStr::new("dir")).await,
            Err(FsError::NotFound)
        ));
    }
}

#[test]
fn too_few_members_are_rejected() {
    let two = as_dyn(&members(2));
    assert!(matches!(
        RaidProvider::new(Level::Raid5, two, STRIPE),
        Err(FsError::InvalidArgument)
    ));
}
