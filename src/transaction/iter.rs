//! # Iterators
//!
//! An iterator is a thin overlay on a path: a direction, a position, and
//! filters. Movement is constant work against the merged view of the
//! current leaf and crosses leaves transparently by re-aiming the path.
//!
//! ## Filters
//!
//! - **Snapshots.** With `filter_snapshots` (default on snapshotted trees),
//!   a key is visible when its snapshot is the iterator's target or an
//!   ancestor of it. Within one `(inode, offset)` cell keys sort by
//!   ascending snapshot ID and children have smaller IDs than parents, so
//!   the first visible key is the most specific override — it wins. A
//!   visible `deleted` ends its own snapshot line but lets ancestors show
//!   through; a visible `whiteout` shadows the entire cell.
//! - **Extents.** Extent keys are addressed by their end position, so a
//!   range scan naturally advances by extent size; `peek_slot` returns the
//!   extent whose `(start, end]` interval contains the position.
//! - **Slots.** `peek_slot` never returns "nothing": a missing or dead
//!   cell comes back as a synthetic tombstone at the requested position,
//!   letting inode and dirent lookups distinguish absent from deleted.
//! - **Key cache.** On cached trees point reads consult the write-back
//!   key cache before the tree and prime it after a tree hit.
//!
//! Iterators are not restartable on their own: a restart unwinds to the
//! transaction's run loop, which re-executes the closure that created them.

use crate::errors::Result;
use crate::key::{Bkey, Bpos, BtreeId, POS_MAX, POS_MIN};
use crate::transaction::Trans;

/// Iterator behavior flags; zero-value defaults are right for plain
/// forward scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterFlags {
    /// Take intent locks at the leaf (required to stage updates).
    pub intent: bool,
    /// Return raw keys from every snapshot, tombstones included.
    pub all_snapshots: bool,
    /// Ancestor-filter keys against the position's snapshot. Set
    /// automatically for snapshotted trees unless `all_snapshots`.
    pub filter_snapshots: bool,
    /// Consult the btree key cache first. Set automatically for cached
    /// trees.
    pub with_key_cache: bool,
}

/// Outcome of scanning one leaf.
enum LeafScan {
    Found(Bkey),
    /// Nothing visible here; the leaf covers up to this position.
    EndOfLeaf(Bpos),
}

/// A forward/backward cursor over one btree.
#[derive(Debug)]
pub struct BtreeIter {
    btree_id: BtreeId,
    pos: Bpos,
    flags: IterFlags,
    path: usize,
}

impl BtreeIter {
    pub(crate) fn new(btree_id: BtreeId, pos: Bpos, flags: IterFlags, path: usize) -> Self {
        Self {
            btree_id,
            pos,
            flags,
            path,
        }
    }

    pub fn btree_id(&self) -> BtreeId {
        self.btree_id
    }

    pub fn pos(&self) -> Bpos {
        self.pos
    }

    pub(crate) fn path_idx(&self) -> usize {
        self.path
    }

    /// Re-aim the iterator.
    pub fn set_pos(&mut self, trans: &mut Trans<'_>, pos: Bpos) {
        self.pos = pos;
        trans.path_set_pos(self.path, pos);
    }

    /// Step past the most recently peeked key.
    pub fn advance(&mut self, trans: &mut Trans<'_>) {
        let next = self.pos.successor();
        self.set_pos(trans, next);
    }

    /// Step to the next slot in the same snapshot line.
    pub fn advance_slot(&mut self, trans: &mut Trans<'_>) {
        let next = self.pos.successor_same_snapshot();
        self.set_pos(trans, next);
    }

    /// Rewind to an earlier position.
    pub fn rewind(&mut self, trans: &mut Trans<'_>, pos: Bpos) {
        self.set_pos(trans, pos);
    }

    fn visible(&self, trans: &Trans<'_>, key: &Bkey, snapshot: u32) -> bool {
        let ks = key.pos.snapshot;
        ks == snapshot || trans.fs.snapshots.is_ancestor(ks, snapshot)
    }

    /// Scan the current leaf from `from`, applying filters.
    fn scan_leaf(&self, trans: &mut Trans<'_>, from: Bpos, upto: Bpos) -> Result<LeafScan> {
        trans.path_traverse(self.path)?;
        let leaf_id = trans.path_leaf(self.path)?;
        let node = trans.fs.cache.node(leaf_id)?;
        let data = node.data.read();

        let snapshot = self.pos.snapshot;
        let mut merge = data.merge_iter(from)?;
        // A whiteout shadows its whole cell for this snapshot.
        let mut shadowed_cell: Option<(u64, u64)> = None;

        while let Some(key) = merge.next()? {
            if key.pos > upto {
                break;
            }
            if self.flags.all_snapshots || !self.flags.filter_snapshots {
                if !self.flags.all_snapshots && (key.is_deleted() || key.is_whiteout()) {
                    continue;
                }
                return Ok(LeafScan::Found(key));
            }

            if shadowed_cell == Some((key.pos.inode, key.pos.offset)) {
                continue;
            }
            if !self.visible(trans, &key, snapshot) {
                continue;
            }
            if key.is_whiteout() {
                shadowed_cell = Some((key.pos.inode, key.pos.offset));
                continue;
            }
            if key.is_deleted() {
                // This snapshot line is dead; ancestors may still show.
                continue;
            }
            return Ok(LeafScan::Found(key));
        }
        Ok(LeafScan::EndOfLeaf(data.max_key))
    }

    /// The next visible key at or after the current position, up to `upto`.
    pub fn peek_upto(&mut self, trans: &mut Trans<'_>, upto: Bpos) -> Result<Option<Bkey>> {
        let mut from = self.pos;
        loop {
            match self.scan_leaf(trans, from, upto)? {
                LeafScan::Found(key) => {
                    self.pos = key.pos;
                    trans.path_set_pos(self.path, key.pos);
                    return Ok(Some(key));
                }
                LeafScan::EndOfLeaf(leaf_max) => {
                    if leaf_max >= upto || leaf_max == POS_MAX {
                        return Ok(None);
                    }
                    from = leaf_max.successor();
                    self.set_pos(trans, from);
                }
            }
        }
    }

    pub fn peek(&mut self, trans: &mut Trans<'_>) -> Result<Option<Bkey>> {
        self.peek_upto(trans, POS_MAX)
    }

    /// `peek` followed by a step past the returned key.
    pub fn next(&mut self, trans: &mut Trans<'_>) -> Result<Option<Bkey>> {
        match self.peek(trans)? {
            Some(key) => {
                self.advance(trans);
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// `peek_prev` followed by a step before the returned key.
    pub fn prev(&mut self, trans: &mut Trans<'_>) -> Result<Option<Bkey>> {
        match self.peek_prev(trans)? {
            Some(key) => {
                let before = key.pos.predecessor();
                self.set_pos(trans, before);
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// The nearest visible key strictly before the current position.
    pub fn peek_prev(&mut self, trans: &mut Trans<'_>) -> Result<Option<Bkey>> {
        let mut cursor = self.pos;
        loop {
            trans.path_set_pos(self.path, cursor);
            trans.path_traverse(self.path)?;
            let leaf_id = trans.path_leaf(self.path)?;
            let node = trans.fs.cache.node(leaf_id)?;
            let data = node.data.read();
            let leaf_min = data.min_key;

            let prev_pos = {
                let merge = data.merge_iter(leaf_min)?;
                merge.peek_prev(cursor)?.map(|k| k.pos)
            };

            match prev_pos {
                Some(p) => {
                    if !self.flags.filter_snapshots {
                        let merge = data.merge_iter(leaf_min)?;
                        let key = merge.peek_prev(cursor)?.unwrap();
                        if key.is_deleted() || key.is_whiteout() {
                            cursor = p;
                            continue;
                        }
                        self.pos = key.pos;
                        drop(data);
                        trans.path_set_pos(self.path, self.pos);
                        return Ok(Some(key));
                    }
                    // Snapshot filtering is cell-wise: resolve the whole
                    // cell forward so the most specific override wins.
                    let cell_start = Bpos::new(p.inode, p.offset, 0);
                    drop(data);
                    trans.path_set_pos(self.path, cell_start);
                    match self.scan_leaf(
                        trans,
                        cell_start,
                        Bpos::new(p.inode, p.offset, u32::MAX),
                    )? {
                        LeafScan::Found(key) => {
                            self.pos = key.pos;
                            trans.path_set_pos(self.path, self.pos);
                            return Ok(Some(key));
                        }
                        LeafScan::EndOfLeaf(_) => {
                            cursor = cell_start;
                            continue;
                        }
                    }
                }
                None => {
                    if leaf_min == POS_MIN {
                        return Ok(None);
                    }
                    cursor = leaf_min.predecessor();
                    drop(data);
                    self.set_pos(trans, cursor);
                }
            }
        }
    }

    /// Exact-position read: the visible key at this slot, or a synthetic
    /// tombstone — never "nothing".
    pub fn peek_slot(&mut self, trans: &mut Trans<'_>) -> Result<Bkey> {
        let pos = self.pos;

        if self.flags.with_key_cache {
            if let Some(key) = trans.fs.key_cache.get(self.btree_id, pos) {
                return Ok(key);
            }
        }

        let found = if self.btree_id.is_extents() {
            self.extent_slot(trans, pos)?
        } else {
            self.cell_slot(trans, pos)?
        };

        match found {
            Some(key) => {
                if self.flags.with_key_cache {
                    trans.fs.key_cache.insert_clean(self.btree_id, key.clone());
                }
                Ok(key)
            }
            None => Ok(Bkey::deleted(pos)),
        }
    }

    /// Visible key in the `(inode, offset)` cell of `pos`.
    fn cell_slot(&mut self, trans: &mut Trans<'_>, pos: Bpos) -> Result<Option<Bkey>> {
        let from = Bpos::new(pos.inode, pos.offset, 0);
        let upto = Bpos::new(pos.inode, pos.offset, u32::MAX);
        let saved = self.pos;
        self.pos = pos;
        trans.path_set_pos(self.path, pos);
        let result = match self.scan_leaf(trans, from, upto)? {
            LeafScan::Found(key) => Some(key),
            LeafScan::EndOfLeaf(_) => None,
        };
        self.pos = saved;
        Ok(result)
    }

    /// Visible extent whose `(start, end]` interval contains `pos`.
    fn extent_slot(&mut self, trans: &mut Trans<'_>, pos: Bpos) -> Result<Option<Bkey>> {
        let from = Bpos::new(pos.inode, pos.offset, 0);
        let upto = Bpos::new(pos.inode, u64::MAX, u32::MAX);
        let saved = self.pos;
        self.pos = pos;
        trans.path_set_pos(self.path, pos);

        let mut cursor = from;
        let result = loop {
            match self.scan_leaf(trans, cursor, upto)? {
                LeafScan::Found(key) => {
                    if key.pos.inode != pos.inode {
                        break None;
                    }
                    if key.size != 0 && key.start().offset < pos.offset {
                        break Some(key);
                    }
                    if key.start().offset >= pos.offset && key.pos.offset > pos.offset {
                        // First extent begins past us: a hole.
                        break None;
                    }
                    cursor = key.pos.successor();
                }
                LeafScan::EndOfLeaf(_) => break None,
            }
        };
        self.pos = saved;
        Ok(result)
    }
}
