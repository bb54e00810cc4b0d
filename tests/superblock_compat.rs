//! Superblock compatibility: format with explicit options, unmount
//! cleanly, and parse the raw superblock bytes back — options, journal
//! bucket list, members and clean section must round-trip bit-exactly.

use std::sync::Arc;

use bforest::codec::{ChecksumType, CompressionType, StrHashType};
use bforest::config::{SB_BACKUP_SECTOR, SB_MAX_SECTORS, SB_SECTOR, SECTOR_SIZE};
use bforest::key::bkey::BkeyVal;
use bforest::superblock::{decode_superblock, encode_superblock, read_superblock};
use bforest::{BlockDev, BtreeId, Fs, FsOpts, MemDev};

fn scenario_opts() -> FsOpts {
    FsOpts {
        block_size: 4096,
        btree_node_size: 262144,
        bucket_size: 524288,
        csum_type: ChecksumType::Crc64,
        compression: CompressionType::Lz4,
        str_hash: StrHashType::Siphash,
        replicas: 2,
    }
}

fn format_and_unmount() -> (Arc<MemDev>, Arc<MemDev>) {
    // Two devices, ~16 MiB each (32 buckets of 512 KiB).
    let dev_a = MemDev::new(32 * 1024);
    let dev_b = MemDev::new(32 * 1024);
    let fs = Fs::format(
        vec![
            dev_a.clone() as Arc<dyn BlockDev>,
            dev_b.clone() as Arc<dyn BlockDev>,
        ],
        scenario_opts(),
    )
    .unwrap();
    fs.unmount().unwrap();
    (dev_a, dev_b)
}

#[test]
fn options_round_trip_through_raw_bytes() {
    let (dev_a, _dev_b) = format_and_unmount();

    let sb = read_superblock(&*dev_a).unwrap();
    let opts = sb.opts;
    assert_eq!(opts.block_size, 4096);
    assert_eq!(opts.bucket_size, 524288);
    assert_eq!(opts.btree_node_size, 262144);
    assert_eq!(opts.compression, CompressionType::Lz4);
    assert_eq!(opts.str_hash, StrHashType::Siphash);
    assert_eq!(opts.replicas, 2);
    assert_eq!(opts.csum_type, ChecksumType::Crc64);

    // Bit-exact: decode(encode(sb)) == sb, and re-encoding reproduces the
    // identical byte image.
    let bytes = encode_superblock(&sb).unwrap();
    let again = decode_superblock(&bytes).unwrap();
    assert_eq!(again, sb);
    assert_eq!(encode_superblock(&again).unwrap(), bytes);
}

#[test]
fn members_and_journal_list_round_trip() {
    let (dev_a, _dev_b) = format_and_unmount();
    let sb = read_superblock(&*dev_a).unwrap();

    assert_eq!(sb.members.len(), 2);
    for member in &sb.members {
        assert_eq!(member.bucket_sectors, 1024);
        assert_eq!(member.first_bucket, 1);
        assert_eq!(member.nbuckets, 32);
        assert_ne!(member.uuid, [0u8; 16]);
    }

    // Journal buckets are contiguous from the first allocatable bucket.
    assert!(!sb.journal.is_empty());
    for (i, jb) in sb.journal.iter().enumerate() {
        assert_eq!(jb.dev, 0);
        assert_eq!(jb.bucket, 1 + i as u64);
    }
}

#[test]
fn clean_section_carries_all_roots() {
    let (dev_a, _dev_b) = format_and_unmount();
    let sb = read_superblock(&*dev_a).unwrap();

    let clean = sb.clean.as_ref().expect("clean unmount recorded");
    assert_eq!(clean.roots.len(), bforest::key::NR_BTREES);

    let mut seen = Vec::new();
    for root in &clean.roots {
        seen.push(root.btree_id);
        match &root.ptr.val {
            BkeyVal::BtreePtr(ptr) => {
                assert!(ptr.bucket > 0, "{} root in a reserved bucket", root.btree_id);
            }
            other => panic!("root for {} is {:?}", root.btree_id, other),
        }
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), bforest::key::NR_BTREES);

    // A clean reopen accepts the section and skips replay.
    let (fs, recovery) = Fs::open(vec![
        dev_a as Arc<dyn BlockDev>,
        _dev_b as Arc<dyn BlockDev>,
    ])
    .unwrap();
    assert!(recovery.clean);
    assert!(recovery.replayed.is_none());
    let _ = fs.main_snapshot().unwrap();
}

#[test]
fn backup_superblock_matches_primary() {
    let (dev_a, _dev_b) = format_and_unmount();

    let mut primary = vec![0u8; SB_MAX_SECTORS as usize * SECTOR_SIZE];
    let mut backup = vec![0u8; SB_MAX_SECTORS as usize * SECTOR_SIZE];
    dev_a.read(SB_SECTOR, &mut primary).unwrap();
    dev_a.read(SB_BACKUP_SECTOR, &mut backup).unwrap();
    assert_eq!(primary, backup);

    let sb = decode_superblock(&primary).unwrap();
    assert!(sb.seq >= 1);
    assert_eq!(sb.opts, scenario_opts());
}

#[test]
fn all_trees_usable_after_clean_reopen() {
    let (dev_a, dev_b) = format_and_unmount();
    let (fs, _) = Fs::open(vec![
        dev_a as Arc<dyn BlockDev>,
        dev_b as Arc<dyn BlockDev>,
    ])
    .unwrap();
    let snap = fs.main_snapshot().unwrap();

    // One write into a snapshotted tree and one into a plain tree.
    bforest::Trans::run(&fs, |trans| {
        trans.btree_insert(
            BtreeId::Inodes,
            bforest::Bkey::new(
                bforest::Bpos::new(9000, 0, snap),
                BkeyVal::Inode(bforest::key::bkey::Inode {
                    mode: 0o100644,
                    nlink: 1,
                    ..bforest::key::bkey::Inode::default()
                }),
            ),
        )?;
        trans.commit(None, None, bforest::CommitFlags::default())
    })
    .unwrap();
    fs.unmount().unwrap();
}
