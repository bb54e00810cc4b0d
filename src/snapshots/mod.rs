//! # Snapshot Table
//!
//! Snapshots form a binary tree in which IDs strictly decrease going deeper:
//! a parent's ID is always greater than its children's. Keys carry the
//! snapshot ID they were written in, and a lookup at snapshot `S` must see
//! keys written in `S` or any ancestor of `S` — so the hot operation here is
//! `is_ancestor`, called for every key an iterator considers.
//!
//! Ancestor lookups use a three-tier strategy:
//!
//! 1. **Bitmap**: each entry records, as one bit per ID, which of the 128
//!    IDs directly above it are ancestors. Most queries resolve with a
//!    single bit test.
//! 2. **Skiplist**: three ancestor IDs at increasing distances, sorted
//!    ascending. Queries outside the bitmap jump to the largest skip entry
//!    not above the target and repeat.
//! 3. **Parent walk**: degenerate fallback when the skiplist cannot jump.
//!
//! Readers never take a lock: the whole table lives behind an
//! [`ArcSwap`] and writers publish a new table wholesale. A reader holding
//! the old table sees a consistent (if slightly stale) ancestry, which is
//! safe because snapshot creation only adds leaves and commits against a new
//! snapshot always happen after its creation published.

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::{IS_ANCESTOR_BITMAP, SNAPSHOT_SKIP_ENTRIES};
use crate::errors::{Error, Result};
use crate::key::bkey::SnapshotRecord;

/// Lifecycle of a snapshot table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotState {
    #[default]
    Live,
    Deleted,
}

/// In-memory snapshot table entry, indexed by snapshot ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotEntry {
    pub state: SnapshotState,
    pub parent: u32,
    pub children: [u32; 2],
    pub subvol: u32,
    pub depth: u32,
    /// Ancestors at increasing distance, sorted ascending; try the last
    /// first when jumping.
    pub skip: [u32; SNAPSHOT_SKIP_ENTRIES],
    /// Bit `(ancestor - id - 1)` set for ancestors within
    /// [`IS_ANCESTOR_BITMAP`] IDs.
    bitmap: [u64; 2],
}

impl SnapshotEntry {
    fn bitmap_test(&self, delta: u32) -> bool {
        debug_assert!(delta >= 1 && delta <= IS_ANCESTOR_BITMAP);
        let bit = delta - 1;
        self.bitmap[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
    }

    fn bitmap_set(&mut self, delta: u32) {
        let bit = delta - 1;
        self.bitmap[(bit / 64) as usize] |= 1u64 << (bit % 64);
    }

    pub fn record(&self) -> SnapshotRecord {
        SnapshotRecord {
            parent: self.parent,
            children: self.children,
            subvol: self.subvol,
            depth: self.depth,
            skip: self.skip,
            flags: match self.state {
                SnapshotState::Live => 0,
                SnapshotState::Deleted => 1,
            },
        }
    }
}

type Table = HashMap<u32, SnapshotEntry>;

/// Highest snapshot ID ever allocated; the root of the first tree.
const FIRST_SNAPSHOT_ID: u32 = u32::MAX - 1;

struct AllocState {
    next_id: u32,
}

/// Process-wide snapshot table: lock-free readers, serialized writers.
pub struct Snapshots {
    table: ArcSwap<Table>,
    write_lock: Mutex<AllocState>,
}

impl Default for Snapshots {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshots {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(Table::new()),
            write_lock: Mutex::new(AllocState {
                next_id: FIRST_SNAPSHOT_ID,
            }),
        }
    }

    pub fn entry(&self, id: u32) -> Option<SnapshotEntry> {
        self.table.load().get(&id).copied()
    }

    pub fn is_live(&self, id: u32) -> bool {
        matches!(
            self.entry(id),
            Some(SnapshotEntry {
                state: SnapshotState::Live,
                ..
            })
        )
    }

    fn publish(&self, table: Table) {
        self.table.store(Arc::new(table));
    }

    /// Fill in skiplist, depth and bitmap for a fresh child of `parent`.
    fn init_child(table: &Table, id: u32, parent: u32, subvol: u32) -> SnapshotEntry {
        let mut entry = SnapshotEntry {
            parent,
            subvol,
            ..SnapshotEntry::default()
        };

        if parent == 0 {
            return entry;
        }
        let pent = table.get(&parent).copied().unwrap_or_default();
        entry.depth = pent.depth + 1;

        // Ascending distances: the parent, an ancestor roughly half way up,
        // and the tree root.
        let mut mid = parent;
        for _ in 0..entry.depth / 2 {
            match table.get(&mid) {
                Some(e) if e.parent != 0 => mid = e.parent,
                _ => break,
            }
        }
        let mut root = parent;
        while let Some(e) = table.get(&root) {
            if e.parent == 0 {
                break;
            }
            root = e.parent;
        }
        entry.skip = [parent, mid, root];

        // Bitmap over every ancestor within reach; partial information here
        // is harmless, readers fall back to the skiplist.
        let mut anc = parent;
        loop {
            let delta = anc - id;
            if delta <= IS_ANCESTOR_BITMAP {
                entry.bitmap_set(delta);
            }
            match table.get(&anc) {
                Some(e) if e.parent != 0 => anc = e.parent,
                _ => break,
            }
        }
        entry
    }

    /// Create the root of a new snapshot tree. Returns its ID.
    pub fn create_root(&self, subvol: u32) -> u32 {
        let mut alloc = self.write_lock.lock();
        let id = alloc.next_id;
        alloc.next_id -= 1;

        let mut table: Table = (**self.table.load()).clone();
        table.insert(id, Snapshots::init_child(&table, id, 0, subvol));
        self.publish(table);
        id
    }

    /// Create a child of `parent`. Children always receive smaller IDs than
    /// every existing snapshot, preserving the parent-above-child order.
    pub fn create_child(&self, parent: u32, subvol: u32) -> Result<u32> {
        let mut alloc = self.write_lock.lock();
        let mut table: Table = (**self.table.load()).clone();

        let pent = table
            .get_mut(&parent)
            .ok_or_else(|| Error::FatalCorruption(format!("snapshot {parent} does not exist")))?;

        let slot = if pent.children[0] == 0 {
            0
        } else if pent.children[1] == 0 {
            1
        } else {
            return Err(Error::UnsupportedFeature(format!(
                "snapshot {parent} already has two children"
            )));
        };

        let id = alloc.next_id;
        alloc.next_id -= 1;
        pent.children[slot] = id;
        // Normalize: children[0] >= children[1].
        if pent.children[1] > pent.children[0] {
            pent.children.swap(0, 1);
        }

        let entry = Snapshots::init_child(&table, id, parent, subvol);
        table.insert(id, entry);
        self.publish(table);
        Ok(id)
    }

    pub fn delete(&self, id: u32) -> Result<()> {
        let _alloc = self.write_lock.lock();
        let mut table: Table = (**self.table.load()).clone();
        match table.get_mut(&id) {
            Some(entry) => entry.state = SnapshotState::Deleted,
            None => return Err(Error::Enoent),
        }
        self.publish(table);
        Ok(())
    }

    /// Reflexive-transitive ancestor test: is `ancestor` equal to or above
    /// `descendant` in its snapshot tree?
    pub fn is_ancestor(&self, ancestor: u32, descendant: u32) -> bool {
        let table = self.table.load();
        let mut id = descendant;

        while id != 0 && id < ancestor {
            let Some(entry) = table.get(&id) else {
                return false;
            };
            let delta = ancestor - id;
            if delta <= IS_ANCESTOR_BITMAP {
                return entry.bitmap_test(delta);
            }
            // Jump as far up as possible without overshooting the target.
            let mut next = entry.parent;
            for &skip in entry.skip.iter().rev() {
                if skip != 0 && skip <= ancestor && skip > next {
                    next = skip;
                    break;
                }
            }
            if next == 0 || next <= id {
                return false;
            }
            id = next;
        }
        id == ancestor
    }

    /// Replace the table wholesale from persisted snapshot records, as the
    /// mount path does after replay. Bitmaps are recomputed; depth and
    /// skiplists are trusted from disk.
    pub fn rebuild(&self, records: Vec<(u32, SnapshotRecord)>) {
        let mut alloc = self.write_lock.lock();
        let mut table = Table::new();
        let mut min_id = FIRST_SNAPSHOT_ID;

        for (id, rec) in &records {
            min_id = min_id.min(*id);
            table.insert(
                *id,
                SnapshotEntry {
                    state: if rec.flags & 1 != 0 {
                        SnapshotState::Deleted
                    } else {
                        SnapshotState::Live
                    },
                    parent: rec.parent,
                    children: rec.children,
                    subvol: rec.subvol,
                    depth: rec.depth,
                    skip: rec.skip,
                    bitmap: [0; 2],
                },
            );
        }

        // Recompute bitmaps from the parent chains.
        let parents: Vec<(u32, u32)> = table.iter().map(|(&id, e)| (id, e.parent)).collect();
        for (id, _) in parents {
            let mut anc = table.get(&id).map(|e| e.parent).unwrap_or(0);
            let mut bits: Vec<u32> = Vec::new();
            while anc != 0 {
                let delta = anc - id;
                if delta <= IS_ANCESTOR_BITMAP {
                    bits.push(delta);
                }
                anc = table.get(&anc).map(|e| e.parent).unwrap_or(0);
            }
            if let Some(entry) = table.get_mut(&id) {
                for delta in bits {
                    entry.bitmap_set(delta);
                }
            }
        }

        alloc.next_id = min_id.saturating_sub(1);
        self.publish(table);
    }

    /// All live records, for persisting into the snapshots tree.
    pub fn records(&self) -> Vec<(u32, SnapshotRecord)> {
        let table = self.table.load();
        let mut out: Vec<(u32, SnapshotRecord)> = table
            .iter()
            .map(|(&id, entry)| (id, entry.record()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_its_own_ancestor() {
        let snaps = Snapshots::new();
        let root = snaps.create_root(1);
        assert!(snaps.is_ancestor(root, root));
        assert!(!snaps.is_ancestor(root, root + 1));
    }

    #[test]
    fn parent_chain_is_ancestry() {
        let snaps = Snapshots::new();
        let root = snaps.create_root(1);
        let a = snaps.create_child(root, 1).unwrap();
        let b = snaps.create_child(a, 1).unwrap();

        assert!(a < root && b < a, "children must get smaller ids");
        assert!(snaps.is_ancestor(root, b));
        assert!(snaps.is_ancestor(a, b));
        assert!(snaps.is_ancestor(b, b));
        assert!(!snaps.is_ancestor(b, a));
        assert!(!snaps.is_ancestor(b, root));
    }

    #[test]
    fn siblings_are_not_ancestors() {
        let snaps = Snapshots::new();
        let root = snaps.create_root(1);
        let a = snaps.create_child(root, 1).unwrap();
        let b = snaps.create_child(root, 1).unwrap();
        assert!(!snaps.is_ancestor(a, b));
        assert!(!snaps.is_ancestor(b, a));
        assert!(snaps.is_ancestor(root, a));
        assert!(snaps.is_ancestor(root, b));
    }

    #[test]
    fn third_child_is_rejected() {
        let snaps = Snapshots::new();
        let root = snaps.create_root(1);
        snaps.create_child(root, 1).unwrap();
        snaps.create_child(root, 1).unwrap();
        assert!(snaps.create_child(root, 1).is_err());
    }

    #[test]
    fn ancestor_equivalence_matches_parent_closure() {
        // Build a chain deep enough to exercise the skiplist beyond the
        // bitmap, by spacing IDs with throwaway roots.
        let snaps = Snapshots::new();
        let mut chain = vec![snaps.create_root(1)];
        for _ in 0..8 {
            // Burn ~40 IDs so deltas along the chain exceed the bitmap for
            // distant pairs.
            for _ in 0..40 {
                snaps.create_root(99);
            }
            let child = snaps.create_child(*chain.last().unwrap(), 1).unwrap();
            chain.push(child);
        }

        for (i, &a) in chain.iter().enumerate() {
            for (j, &d) in chain.iter().enumerate() {
                let expect = i <= j;
                assert_eq!(
                    snaps.is_ancestor(a, d),
                    expect,
                    "is_ancestor({a}, {d}) for chain indices {i} -> {j}"
                );
            }
        }
    }

    #[test]
    fn rebuild_preserves_ancestry() {
        let snaps = Snapshots::new();
        let root = snaps.create_root(1);
        let a = snaps.create_child(root, 1).unwrap();
        let b = snaps.create_child(a, 1).unwrap();

        let records = snaps.records();
        let rebuilt = Snapshots::new();
        rebuilt.rebuild(records);

        assert!(rebuilt.is_ancestor(root, b));
        assert!(rebuilt.is_ancestor(a, b));
        assert!(!rebuilt.is_ancestor(b, a));

        // New IDs continue below everything rebuilt.
        let c = rebuilt.create_child(b, 1).unwrap();
        assert!(c < b);
        assert!(rebuilt.is_ancestor(root, c));
    }

    #[test]
    fn deleted_snapshots_keep_ancestry_but_lose_liveness() {
        let snaps = Snapshots::new();
        let root = snaps.create_root(1);
        let a = snaps.create_child(root, 1).unwrap();
        snaps.delete(a).unwrap();
        assert!(!snaps.is_live(a));
        assert!(snaps.is_ancestor(root, a));
    }
}
