//! Snapshot overlay semantics: child snapshots inherit ancestor keys,
//! overwrites stay confined to their snapshot line, and deletions in a
//! child expose the ancestor's key again.

use std::sync::Arc;

use bforest::key::bkey::Xattr;
use bforest::{
    Bkey, BkeyVal, BlockDev, Bpos, BtreeId, CommitFlags, Fs, FsOpts, MemDev, Trans,
};

fn make_fs() -> (Arc<MemDev>, Fs) {
    let dev = MemDev::new(16384);
    let fs = Fs::format(
        vec![dev.clone() as Arc<dyn BlockDev>],
        FsOpts {
            block_size: 4096,
            btree_node_size: 8192,
            bucket_size: 16384,
            ..FsOpts::default()
        },
    )
    .unwrap();
    (dev, fs)
}

fn xattr_key(pos: Bpos, value: &[u8]) -> Bkey {
    Bkey::new(
        pos,
        BkeyVal::Xattr(Xattr {
            name: b"user.tag".to_vec(),
            value: value.to_vec(),
        }),
    )
}

fn put(fs: &Fs, key: Bkey) {
    Trans::run(fs, |trans| {
        trans.btree_insert(BtreeId::Xattrs, key.clone())?;
        trans.commit(None, None, CommitFlags::default())
    })
    .unwrap();
}

fn del(fs: &Fs, pos: Bpos) {
    Trans::run(fs, |trans| {
        trans.btree_delete(BtreeId::Xattrs, pos)?;
        trans.commit(None, None, CommitFlags::default())
    })
    .unwrap();
}

fn get_value(fs: &Fs, pos: Bpos) -> Option<Vec<u8>> {
    Trans::run(fs, |trans| trans.btree_lookup(BtreeId::Xattrs, pos))
        .unwrap()
        .map(|key| match key.val {
            BkeyVal::Xattr(x) => x.value,
            other => panic!("unexpected value {other:?}"),
        })
}

#[test]
fn overwrite_and_delete_walk_the_ancestor_chain() {
    let (_dev, fs) = make_fs();
    let s1 = fs.main_snapshot().unwrap();

    // Before the snapshot: K at (10, 10, S1).
    put(&fs, xattr_key(Bpos::new(10, 10, s1), b"K"));

    let s2 = fs.create_snapshot(s1).unwrap();
    assert!(s2 < s1, "children get smaller ids");
    assert!(fs.snapshots.is_ancestor(s1, s2));

    // The child inherits the ancestor's key.
    assert_eq!(get_value(&fs, Bpos::new(10, 10, s2)), Some(b"K".to_vec()));

    // Overwrite in S2.
    put(&fs, xattr_key(Bpos::new(10, 10, s2), b"K'"));
    assert_eq!(get_value(&fs, Bpos::new(10, 10, s1)), Some(b"K".to_vec()));
    assert_eq!(get_value(&fs, Bpos::new(10, 10, s2)), Some(b"K'".to_vec()));

    // Deleting the override exposes the inherited key again.
    del(&fs, Bpos::new(10, 10, s2));
    assert_eq!(get_value(&fs, Bpos::new(10, 10, s2)), Some(b"K".to_vec()));
    assert_eq!(get_value(&fs, Bpos::new(10, 10, s1)), Some(b"K".to_vec()));
}

#[test]
fn deleting_an_inherited_key_shadows_without_touching_the_parent() {
    let (_dev, fs) = make_fs();
    let s1 = fs.main_snapshot().unwrap();

    put(&fs, xattr_key(Bpos::new(7, 0, s1), b"inherited"));
    let s2 = fs.create_snapshot(s1).unwrap();

    // Deleting in S2 a key that physically lives in S1 must not remove the
    // S1 copy; it plants a whiteout in S2.
    del(&fs, Bpos::new(7, 0, s2));
    assert_eq!(get_value(&fs, Bpos::new(7, 0, s2)), None);
    assert_eq!(
        get_value(&fs, Bpos::new(7, 0, s1)),
        Some(b"inherited".to_vec())
    );
}

#[test]
fn sibling_snapshots_are_isolated() {
    let (_dev, fs) = make_fs();
    let s1 = fs.main_snapshot().unwrap();
    put(&fs, xattr_key(Bpos::new(1, 1, s1), b"base"));

    let a = fs.create_snapshot(s1).unwrap();
    let b = fs.create_snapshot(s1).unwrap();

    put(&fs, xattr_key(Bpos::new(1, 1, a), b"in-a"));

    assert_eq!(get_value(&fs, Bpos::new(1, 1, a)), Some(b"in-a".to_vec()));
    assert_eq!(get_value(&fs, Bpos::new(1, 1, b)), Some(b"base".to_vec()));
    assert_eq!(get_value(&fs, Bpos::new(1, 1, s1)), Some(b"base".to_vec()));
}

#[test]
fn snapshot_table_survives_remount() {
    let (dev, fs) = make_fs();
    let s1 = fs.main_snapshot().unwrap();
    put(&fs, xattr_key(Bpos::new(3, 3, s1), b"v1"));
    let s2 = fs.create_snapshot(s1).unwrap();
    put(&fs, xattr_key(Bpos::new(3, 3, s2), b"v2"));
    fs.unmount().unwrap();

    let (fs2, recovery) = Fs::open(vec![dev as Arc<dyn BlockDev>]).unwrap();
    assert!(recovery.clean);
    assert!(fs2.snapshots.is_ancestor(s1, s2));
    assert_eq!(get_value(&fs2, Bpos::new(3, 3, s1)), Some(b"v1".to_vec()));
    assert_eq!(get_value(&fs2, Bpos::new(3, 3, s2)), Some(b"v2".to_vec()));

    // New snapshots keep descending below the rebuilt table.
    let s3 = fs2.create_snapshot(s2).unwrap();
    assert!(s3 < s2);
    assert!(fs2.snapshots.is_ancestor(s1, s3));
}
