//! Core engine round trips: create/lookup/delete through peek-slot,
//! empty-tree boundaries, and split behavior under load.

use std::sync::Arc;

use bforest::key::bkey::Inode;
use bforest::{
    Bkey, BkeyVal, BlockDev, Bpos, BtreeId, CommitFlags, Fs, FsOpts, IterFlags, MemDev, Trans,
    POS_MIN,
};

fn small_opts() -> FsOpts {
    FsOpts {
        block_size: 4096,
        btree_node_size: 8192,
        bucket_size: 16384,
        ..FsOpts::default()
    }
}

fn make_fs() -> Fs {
    let dev = MemDev::new(8192);
    Fs::format(vec![dev as Arc<dyn BlockDev>], small_opts()).unwrap()
}

fn inode_key(inode: u64, snapshot: u32, size: u64) -> Bkey {
    Bkey::new(
        Bpos::new(inode, 0, snapshot),
        BkeyVal::Inode(Inode {
            mode: 0o100644,
            size,
            nlink: 1,
            ..Inode::default()
        }),
    )
}

#[test]
fn create_lookup_delete_round_trip() {
    let fs = make_fs();
    let snap = fs.main_snapshot().unwrap();
    let pos = Bpos::new(42, 0, snap);
    let key = inode_key(42, snap, 0);

    // Insert, then peek-slot returns the exact key.
    Trans::run(&fs, |trans| {
        trans.btree_insert(BtreeId::Inodes, key.clone())?;
        trans.commit(None, None, CommitFlags::default())
    })
    .unwrap();

    let got = Trans::run(&fs, |trans| {
        let mut iter = trans.iter_init(BtreeId::Inodes, pos, IterFlags::default())?;
        let got = iter.peek_slot(trans);
        trans.iter_exit(iter);
        got
    })
    .unwrap();
    assert_eq!(got, key);

    // Tombstone the slot; peek-slot now yields a synthetic deleted key.
    Trans::run(&fs, |trans| {
        trans.btree_delete(BtreeId::Inodes, pos)?;
        trans.commit(None, None, CommitFlags::default())
    })
    .unwrap();

    let got = Trans::run(&fs, |trans| {
        let mut iter = trans.iter_init(BtreeId::Inodes, pos, IterFlags::default())?;
        let got = iter.peek_slot(trans);
        trans.iter_exit(iter);
        got
    })
    .unwrap();
    assert!(got.is_deleted());
    assert_eq!(got.pos, pos);

    let found = Trans::run(&fs, |trans| trans.btree_lookup(BtreeId::Inodes, pos)).unwrap();
    assert!(found.is_none());
}

#[test]
fn empty_tree_boundaries() {
    let fs = make_fs();
    let snap = fs.main_snapshot().unwrap();

    let found = Trans::run(&fs, |trans| {
        trans.btree_lookup(BtreeId::Inodes, Bpos::new(7, 7, snap))
    })
    .unwrap();
    assert!(found.is_none());

    let peeked = Trans::run(&fs, |trans| {
        let mut iter = trans.iter_init(BtreeId::Inodes, POS_MIN, IterFlags::default())?;
        let got = iter.peek(trans);
        trans.iter_exit(iter);
        got
    })
    .unwrap();
    assert!(peeked.is_none());
}

#[test]
fn single_key_at_pos_min() {
    let fs = make_fs();
    // The inodes tree filters snapshots; use snapshot 0 keys via the
    // subvolumes tree, which is unfiltered, for exact POS_MIN semantics.
    let key = Bkey::new(
        POS_MIN,
        BkeyVal::Subvolume(bforest::key::bkey::Subvolume {
            root_inode: 1,
            snapshot: 1,
            flags: 0,
        }),
    );
    Trans::run(&fs, |trans| {
        trans.btree_insert(BtreeId::Subvolumes, key.clone())?;
        trans.commit(None, None, CommitFlags::default())
    })
    .unwrap();

    let (forward, backward) = Trans::run(&fs, |trans| {
        let mut iter = trans.iter_init(BtreeId::Subvolumes, POS_MIN, IterFlags::default())?;
        let forward = iter.peek(trans)?;
        iter.rewind(trans, POS_MIN);
        let backward = iter.peek_prev(trans)?;
        trans.iter_exit(iter);
        Ok((forward, backward))
    })
    .unwrap();

    assert_eq!(forward.as_ref(), Some(&key));
    assert!(backward.is_none(), "nothing sorts before POS_MIN");
}

#[test]
fn inserts_across_splits_keep_every_key() {
    let fs = make_fs();
    let snap = fs.main_snapshot().unwrap();
    let count = 600u64;

    for inode in 0..count {
        Trans::run(&fs, |trans| {
            trans.btree_insert(BtreeId::Inodes, inode_key(inode, snap, inode * 10))?;
            trans.commit(None, None, CommitFlags::default())
        })
        .unwrap();
    }

    assert!(
        fs.counters.splits.load(std::sync::atomic::Ordering::Relaxed) > 0,
        "600 keys must overflow an 8 KiB leaf"
    );

    // Every key, in order, with the right contents.
    let keys = Trans::run(&fs, |trans| {
        let mut iter = trans.iter_init(
            BtreeId::Inodes,
            Bpos::new(0, 0, snap),
            IterFlags::default(),
        )?;
        let mut out = Vec::new();
        while let Some(key) = iter.next(trans)? {
            out.push(key);
        }
        trans.iter_exit(iter);
        Ok(out)
    })
    .unwrap();

    assert_eq!(keys.len(), count as usize);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key.pos.inode, i as u64);
        match &key.val {
            BkeyVal::Inode(inode) => assert_eq!(inode.size, i as u64 * 10),
            other => panic!("unexpected value {other:?}"),
        }
    }
}

#[test]
fn overwrite_is_latest_wins() {
    let fs = make_fs();
    let snap = fs.main_snapshot().unwrap();
    let pos = Bpos::new(5, 0, snap);

    for size in [10u64, 20, 30] {
        Trans::run(&fs, |trans| {
            trans.btree_insert(BtreeId::Inodes, inode_key(5, snap, size))?;
            trans.commit(None, None, CommitFlags::default())
        })
        .unwrap();
    }

    let got = Trans::run(&fs, |trans| trans.btree_lookup(BtreeId::Inodes, pos))
        .unwrap()
        .unwrap();
    match got.val {
        BkeyVal::Inode(inode) => assert_eq!(inode.size, 30),
        other => panic!("unexpected value {other:?}"),
    }
}

#[test]
fn multi_key_commit_is_atomic_in_memory() {
    let fs = make_fs();
    let snap = fs.main_snapshot().unwrap();

    // Stage three keys, commit once; all three visible afterwards and a
    // failed commit (schema violation) leaves nothing behind.
    Trans::run(&fs, |trans| {
        for inode in [100, 200, 300] {
            trans.btree_insert(BtreeId::Inodes, inode_key(inode, snap, 1))?;
        }
        trans.commit(None, None, CommitFlags::default())
    })
    .unwrap();
    for inode in [100u64, 200, 300] {
        let found = Trans::run(&fs, |trans| {
            trans.btree_lookup(BtreeId::Inodes, Bpos::new(inode, 0, snap))
        })
        .unwrap();
        assert!(found.is_some(), "inode {inode} missing");
    }

    // A dirent key is not permitted in the inodes tree.
    let err = Trans::run(&fs, |trans| {
        trans.btree_insert(
            BtreeId::Inodes,
            Bkey::new(
                Bpos::new(400, 0, snap),
                BkeyVal::Dirent(bforest::key::bkey::Dirent {
                    target_inum: 1,
                    d_type: 4,
                    name: b"x".to_vec(),
                }),
            ),
        )
    })
    .unwrap_err();
    assert!(matches!(err, bforest::Error::KeyTypeMismatch { .. }));
}
