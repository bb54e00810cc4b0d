//! # Btree Nodes
//!
//! A node is the unit of btree I/O: a fixed-size on-disk block holding a
//! header plus one or more bsets. Nodes are log-structured in memory — the
//! first bset is the sorted result of the last compaction, later bsets
//! collect appended updates — and immutable on disk: writing a dirty node
//! always targets a fresh bucket with a new node sequence, after which the
//! parent is repointed and the old bucket retired.
//!
//! Level 0 nodes are leaves holding data keys. Interior nodes hold
//! `btree_ptr` keys, each positioned at the *maximum* key covered by its
//! child, with the child's minimum bound carried in the pointer value; the
//! children of an interior node partition its range contiguously.
//!
//! - [`format`]: the on-disk encoding (zerocopy headers, per-bset checksums)
//! - [`cache`]: the resident node table with SIEVE eviction and locks

pub mod cache;
pub mod format;

use crate::config::{
    DEFAULT_BTREE_NODE_SIZE, MAX_BSETS_BEFORE_COMPACT, NODE_SPLIT_DENOMINATOR,
    NODE_SPLIT_NUMERATOR,
};
use crate::errors::{Error, Result};
use crate::key::bkey::{BkeyVal, BtreePtr};
use crate::key::{Bkey, BkeyFormat, Bpos, Bset, BtreeId, MergeIter, POS_MAX};
use format::{BSET_DISK_HEADER_SIZE, NODE_DISK_HEADER_SIZE};

/// In-memory btree node.
#[derive(Debug)]
pub struct Node {
    pub btree_id: BtreeId,
    pub level: u8,
    /// Node sequence: assigned at creation, replaced on every COW write.
    pub seq: u64,
    /// Inclusive coverage bounds.
    pub min_key: Bpos,
    pub max_key: Bpos,
    pub format: BkeyFormat,
    pub bsets: Vec<Bset>,
    /// Set when the node holds bsets not yet written out.
    pub dirty: bool,
}

/// Payload capacity of a node in u64 words.
pub fn max_payload_u64s(node_size: usize) -> usize {
    (node_size - NODE_DISK_HEADER_SIZE - MAX_BSETS_BEFORE_COMPACT * BSET_DISK_HEADER_SIZE) / 8
}

impl Node {
    pub fn new(btree_id: BtreeId, level: u8, seq: u64, min_key: Bpos, max_key: Bpos) -> Self {
        Self {
            btree_id,
            level,
            seq,
            min_key,
            max_key,
            format: BkeyFormat::default(),
            bsets: Vec::new(),
            dirty: true,
        }
    }

    /// An empty root leaf covering the whole keyspace.
    pub fn empty_root(btree_id: BtreeId, seq: u64) -> Self {
        Self::new(btree_id, 0, seq, Bpos::default(), POS_MAX)
    }

    pub fn covers(&self, pos: Bpos) -> bool {
        self.min_key <= pos && pos <= self.max_key
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Total encoded key payload across bsets, in u64 words.
    pub fn keys_u64s(&self) -> usize {
        self.bsets.iter().map(|b| b.u64s()).sum()
    }

    pub fn nr_keys(&self) -> usize {
        self.bsets.iter().map(|b| b.len()).sum()
    }

    pub fn merge_iter(&self, from: Bpos) -> Result<MergeIter<'_>> {
        MergeIter::new(&self.bsets, from)
    }

    /// Append `key` to the newest bset, opening a new one when the append
    /// would violate bset ordering.
    pub fn insert(&mut self, key: &Bkey) -> Result<()> {
        if !self.covers(key.pos) {
            return Err(Error::FatalCorruption(format!(
                "insert of {} outside node range {}..{}",
                key.pos, self.min_key, self.max_key
            )));
        }

        let needs_new = match self.bsets.last() {
            None => true,
            Some(bset) => match bset.last_key()? {
                None => false,
                Some(last) => (key.pos, key.version) <= (last.pos, last.version),
            },
        };
        if needs_new {
            self.bsets.push(Bset::new(self.format));
        }
        self.bsets.last_mut().unwrap().append(key)?;
        self.dirty = true;
        Ok(())
    }

    pub fn should_compact(&self) -> bool {
        self.bsets.len() > MAX_BSETS_BEFORE_COMPACT
    }

    /// Merge all bsets into one sorted run under a freshly fitted format.
    /// Superseded keys and plain tombstones are dropped; whiteouts survive
    /// because they shadow ancestor snapshots.
    pub fn compact(&mut self) -> Result<()> {
        let mut keys: Vec<Bkey> = Vec::with_capacity(self.nr_keys());
        {
            let mut iter = self.merge_iter(self.min_key)?;
            while let Some(key) = iter.next()? {
                if key.is_deleted() {
                    continue;
                }
                keys.push(key);
            }
        }

        let max_version = keys.iter().map(|k| k.version).max().unwrap_or(0);
        self.format = if keys.is_empty() {
            BkeyFormat::default()
        } else {
            BkeyFormat::for_range(
                keys.first().unwrap().pos,
                keys.last().unwrap().pos,
                max_version,
            )
        };
        self.bsets = vec![Bset::from_sorted(self.format, keys)?];
        self.dirty = true;
        Ok(())
    }

    /// Whether inserting `incoming_u64s` more key words should trigger a
    /// split first.
    pub fn should_split(&self, incoming_u64s: usize, node_size: usize) -> bool {
        let budget = max_payload_u64s(node_size) * NODE_SPLIT_NUMERATOR / NODE_SPLIT_DENOMINATOR;
        self.keys_u64s() + incoming_u64s > budget
    }

    /// Split the merged contents into two fresh nodes around the encoded
    /// midpoint. Returns `(left, right)`; the caller assigns disk locations
    /// and repoints the parent. The pivot is `left.max_key`.
    pub fn split(&self, left_seq: u64, right_seq: u64) -> Result<(Node, Node)> {
        let mut keys: Vec<Bkey> = Vec::with_capacity(self.nr_keys());
        {
            let mut iter = self.merge_iter(self.min_key)?;
            while let Some(key) = iter.next()? {
                if key.is_deleted() {
                    continue;
                }
                keys.push(key);
            }
        }
        if keys.len() < 2 {
            return Err(Error::FatalCorruption(format!(
                "splitting {} node with {} live keys",
                self.btree_id,
                keys.len()
            )));
        }

        // Balance by the size the keys actually occupy under this node's
        // packed format, not an unpacked estimate.
        let total: usize = keys
            .iter()
            .map(|k| crate::key::packed::encoded_u64s(k, &self.format))
            .sum();
        let mut acc = 0usize;
        let mut mid = 0usize;
        for (i, k) in keys.iter().enumerate() {
            acc += crate::key::packed::encoded_u64s(k, &self.format);
            if acc * 2 >= total {
                mid = i + 1;
                break;
            }
        }
        mid = mid.clamp(1, keys.len() - 1);

        let pivot = keys[mid - 1].pos;
        let right_min = pivot.successor();

        let mut left = Node::new(self.btree_id, self.level, left_seq, self.min_key, pivot);
        let mut right = Node::new(self.btree_id, self.level, right_seq, right_min, self.max_key);

        let right_keys = keys.split_off(mid);
        for k in &keys {
            left.insert(k)?;
        }
        for k in &right_keys {
            right.insert(k)?;
        }
        left.compact()?;
        right.compact()?;
        Ok((left, right))
    }

    /// Rejoin two adjacent siblings into one node: the inverse of a split,
    /// run when neighboring nodes shrink below useful occupancy. The
    /// caller supplies the fresh sequence and repoints the parent.
    pub fn merge_siblings(left: &Node, right: &Node, seq: u64) -> Result<Node> {
        if left.btree_id != right.btree_id
            || left.level != right.level
            || right.min_key != left.max_key.successor()
        {
            return Err(Error::FatalCorruption(format!(
                "merging non-adjacent nodes {}..{} and {}..{}",
                left.min_key, left.max_key, right.min_key, right.max_key
            )));
        }
        let mut merged = Node::new(
            left.btree_id,
            left.level,
            seq,
            left.min_key,
            right.max_key,
        );
        for node in [left, right] {
            let mut iter = node.merge_iter(node.min_key)?;
            while let Some(key) = iter.next()? {
                if !key.is_deleted() {
                    merged.insert(&key)?;
                }
            }
        }
        merged.compact()?;
        Ok(merged)
    }

    /// For interior nodes: the pointer to the child covering `pos`.
    pub fn find_child(&self, pos: Bpos) -> Result<(Bpos, BtreePtr)> {
        debug_assert!(self.level > 0);
        let iter = self.merge_iter(pos)?;
        match iter.peek()? {
            Some(key) => match key.val {
                BkeyVal::BtreePtr(ptr) => Ok((key.pos, ptr)),
                _ => Err(Error::FatalCorruption(format!(
                    "interior node holds {} at {}",
                    key.val.type_name(),
                    key.pos
                ))),
            },
            None => Err(Error::FatalCorruption(format!(
                "{} interior node {}..{} has no child covering {}",
                self.btree_id, self.min_key, self.max_key, pos
            ))),
        }
    }

    /// Structural invariants checked by tests and the read path: bounds,
    /// interior child contiguity, extent exclusivity.
    pub fn check_invariants(&self) -> Result<()> {
        let mut iter = self.merge_iter(self.min_key)?;
        let mut prev: Option<Bkey> = None;

        while let Some(key) = iter.next()? {
            if !self.covers(key.pos) {
                return Err(Error::FatalCorruption(format!(
                    "key {} outside node range {}..{}",
                    key.pos, self.min_key, self.max_key
                )));
            }

            if self.level > 0 {
                let BkeyVal::BtreePtr(ptr) = &key.val else {
                    return Err(Error::FatalCorruption(format!(
                        "interior node holds {} at {}",
                        key.val.type_name(),
                        key.pos
                    )));
                };
                let expected_min = match &prev {
                    None => self.min_key,
                    Some(p) => p.pos.successor(),
                };
                if ptr.min_key != expected_min {
                    return Err(Error::FatalCorruption(format!(
                        "child ranges not contiguous at {}: child min {} expected {}",
                        key.pos, ptr.min_key, expected_min
                    )));
                }
            } else if self.btree_id.is_extents() {
                if let Some(p) = &prev {
                    if key.overlaps(p) {
                        return Err(Error::FatalCorruption(format!(
                            "overlapping extents at {} and {}",
                            p.pos, key.pos
                        )));
                    }
                }
            }

            prev = Some(key);
        }

        if self.level > 0 {
            match prev {
                Some(last) if last.pos == self.max_key => {}
                Some(last) => {
                    return Err(Error::FatalCorruption(format!(
                        "last child ends at {} short of node max {}",
                        last.pos, self.max_key
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Convenience: the default node size until the superblock overrides it.
pub fn default_node_size() -> usize {
    DEFAULT_BTREE_NODE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::bkey::Inode;
    use crate::key::POS_MIN;

    fn inode_key(inode: u64, mode: u32) -> Bkey {
        Bkey::new(
            Bpos::new(inode, 0, 0),
            BkeyVal::Inode(Inode {
                mode,
                ..Inode::default()
            }),
        )
    }

    #[test]
    fn insert_opens_bsets_as_needed() {
        let mut node = Node::empty_root(BtreeId::Inodes, 1);
        node.insert(&inode_key(5, 1)).unwrap();
        node.insert(&inode_key(9, 1)).unwrap();
        assert_eq!(node.bsets.len(), 1);

        // Out-of-order insert starts a new bset.
        node.insert(&inode_key(2, 1)).unwrap();
        assert_eq!(node.bsets.len(), 2);
        assert_eq!(node.nr_keys(), 3);
    }

    #[test]
    fn compaction_merges_and_drops_tombstones() {
        let mut node = Node::empty_root(BtreeId::Inodes, 1);
        node.insert(&inode_key(5, 1)).unwrap();
        node.insert(&inode_key(2, 1)).unwrap();
        node.insert(&Bkey::deleted(Bpos::new(5, 0, 0))).unwrap();
        assert!(node.bsets.len() > 1);

        node.compact().unwrap();
        assert_eq!(node.bsets.len(), 1);
        assert_eq!(node.nr_keys(), 1);
        let only = node.merge_iter(POS_MIN).unwrap().peek().unwrap().unwrap();
        assert_eq!(only.pos.inode, 2);
    }

    #[test]
    fn split_preserves_order_and_partition() {
        let mut node = Node::empty_root(BtreeId::Inodes, 1);
        for i in 0..100 {
            node.insert(&inode_key(i, 1)).unwrap();
        }

        let (left, right) = node.split(2, 3).unwrap();
        assert_eq!(left.min_key, node.min_key);
        assert_eq!(right.max_key, node.max_key);
        assert_eq!(right.min_key, left.max_key.successor());
        assert!(left.nr_keys() > 0 && right.nr_keys() > 0);
        assert_eq!(left.nr_keys() + right.nr_keys(), 100);

        left.check_invariants().unwrap();
        right.check_invariants().unwrap();
    }

    #[test]
    fn interior_contiguity_is_checked() {
        let mut node = Node::new(BtreeId::Inodes, 1, 5, POS_MIN, POS_MAX);
        let mid = Bpos::new(50, 0, 0);
        node.insert(&Bkey::new(
            mid,
            BkeyVal::BtreePtr(BtreePtr {
                dev: 0,
                bucket: 1,
                seq: 1,
                sectors_written: 0,
                min_key: POS_MIN,
            }),
        ))
        .unwrap();
        node.insert(&Bkey::new(
            POS_MAX,
            BkeyVal::BtreePtr(BtreePtr {
                dev: 0,
                bucket: 2,
                seq: 2,
                sectors_written: 0,
                min_key: mid.successor(),
            }),
        ))
        .unwrap();
        node.check_invariants().unwrap();

        // A gap between children is corruption.
        let mut broken = Node::new(BtreeId::Inodes, 1, 6, POS_MIN, POS_MAX);
        broken
            .insert(&Bkey::new(
                POS_MAX,
                BkeyVal::BtreePtr(BtreePtr {
                    dev: 0,
                    bucket: 2,
                    seq: 2,
                    sectors_written: 0,
                    min_key: Bpos::new(1, 0, 0),
                }),
            ))
            .unwrap();
        assert!(broken.check_invariants().is_err());
    }

    #[test]
    fn find_child_selects_covering_range() {
        let mut node = Node::new(BtreeId::Inodes, 1, 5, POS_MIN, POS_MAX);
        let mid = Bpos::new(50, 0, 0);
        for (pos, bucket, min) in [(mid, 1u64, POS_MIN), (POS_MAX, 2, mid.successor())] {
            node.insert(&Bkey::new(
                pos,
                BkeyVal::BtreePtr(BtreePtr {
                    dev: 0,
                    bucket,
                    seq: bucket,
                    sectors_written: 0,
                    min_key: min,
                }),
            ))
            .unwrap();
        }

        let (_, ptr) = node.find_child(Bpos::new(10, 0, 0)).unwrap();
        assert_eq!(ptr.bucket, 1);
        let (_, ptr) = node.find_child(Bpos::new(50, 0, 1)).unwrap();
        assert_eq!(ptr.bucket, 2);
        let (_, ptr) = node.find_child(mid).unwrap();
        assert_eq!(ptr.bucket, 1);
    }

    #[test]
    fn split_then_merge_is_identity_modulo_seq() {
        let mut node = Node::empty_root(BtreeId::Inodes, 1);
        for i in 0..80 {
            node.insert(&inode_key(i, 1)).unwrap();
        }
        node.insert(&Bkey::deleted(Bpos::new(5, 0, 0))).unwrap();

        let (left, right) = node.split(2, 3).unwrap();
        let merged = Node::merge_siblings(&left, &right, 4).unwrap();

        assert_eq!(merged.min_key, node.min_key);
        assert_eq!(merged.max_key, node.max_key);
        assert_eq!(merged.nr_keys(), 79, "tombstoned key stays gone");

        let live = |n: &Node| {
            let mut out = Vec::new();
            let mut iter = n.merge_iter(POS_MIN).unwrap();
            while let Some(key) = iter.next().unwrap() {
                if !key.is_deleted() {
                    out.push(key);
                }
            }
            out
        };
        assert_eq!(live(&node), live(&merged));
        merged.check_invariants().unwrap();
    }

    #[test]
    fn merge_rejects_non_adjacent_nodes() {
        let mut a = Node::new(BtreeId::Inodes, 0, 1, POS_MIN, Bpos::new(10, 0, 0));
        let mut b = Node::new(BtreeId::Inodes, 0, 2, Bpos::new(20, 0, 0), POS_MAX);
        a.insert(&inode_key(1, 1)).unwrap();
        b.insert(&inode_key(30, 1)).unwrap();
        assert!(Node::merge_siblings(&a, &b, 3).is_err());
    }

    #[test]
    fn split_needs_two_keys() {
        let mut node = Node::empty_root(BtreeId::Inodes, 1);
        node.insert(&inode_key(1, 1)).unwrap();
        assert!(node.split(2, 3).is_err());
    }
}
