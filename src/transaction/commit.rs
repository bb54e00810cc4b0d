//! # Commit Path
//!
//! Publishing a transaction's staged updates is a fixed sequence:
//!
//! 1. validate every update and make sure its leaf is intent-locked;
//! 2. split any leaf that could not absorb the updates (finishing the
//!    split, then restarting so the retry sees the new topology);
//! 3. reserve journal space; 4. cover added sectors with a disk
//!    reservation;
//! 5. upgrade the involved leaves to write locks, in tree order;
//! 6. write the journal entry — the commit's atomicity point;
//! 7. apply the keys to the leaves (cached trees: to the key cache),
//!    compacting nodes that accumulated too many bsets;
//! 8. publish the seq on every touched node and drop the write locks.
//!
//! Steps 1–6 may fail with a restart and leave no trace: the journal entry
//! is all-or-nothing and nothing mutates before it exists. From step 7 on,
//! nothing can fail except a broken invariant, which flips the filesystem
//! into emergency read-only rather than half-applying a commit.

use smallvec::SmallVec;
use tracing::{debug, error};

use crate::errors::{Error, RestartReason, Result};
use crate::journal::entry::JEntry;
use crate::key::bkey::{BkeyVal, BtreePtr};
use crate::key::{packed, Bkey, BkeyFormat, BtreeId, POS_MAX, POS_MIN};
use crate::node::cache::NodeId;
use crate::transaction::Trans;

/// Commit behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitFlags {
    /// Make this commit a durability boundary (fsync semantics).
    pub flush_journal: bool,
}

impl Trans<'_> {
    /// Add a reference to a path on behalf of a staged update.
    pub(crate) fn path_ref(&mut self, idx: usize) {
        if let Some(path) = self.paths.get_mut(idx).and_then(|p| p.as_mut()) {
            path.refs += 1;
        }
    }

    /// Execute the commit sequence over the staged updates.
    pub fn commit(
        &mut self,
        mut disk_res: Option<&mut crate::alloc::DiskReservation>,
        journal_seq_out: Option<&mut u64>,
        flags: CommitFlags,
    ) -> Result<()> {
        if self.fs.is_emergency_ro() {
            return Err(Error::EmergencyReadonly);
        }
        if self.updates.is_empty() {
            return Ok(());
        }

        // Step 1: every tree-bound update needs an up-to-date intent path,
        // and its leaf must still cover the key.
        let mut leaves: SmallVec<[NodeId; 4]> = SmallVec::new();
        for i in 0..self.updates.len() {
            let Some(idx) = self.updates[i].path else {
                continue;
            };
            self.path_make_intent(idx)?;
            self.path_set_pos(idx, self.updates[i].key.pos);
            self.path_traverse(idx)?;
            let leaf = self.path_leaf(idx)?;
            if !leaves.contains(&leaf) {
                leaves.push(leaf);
            }
        }

        // Step 2: pre-size the leaves; splits restart the transaction.
        let fmt = BkeyFormat::default();
        for &leaf in &leaves {
            let node = self.fs.cache.node(leaf)?;
            let needs_split = {
                let data = node.data.read();
                let incoming: usize = self
                    .updates
                    .iter()
                    .filter(|u| {
                        u.path.is_some() && u.btree_id == data.btree_id && data.covers(u.key.pos)
                    })
                    .map(|u| packed::encoded_u64s(&u.key, &fmt))
                    .sum();
                data.should_split(incoming, self.fs.node_size())
            };
            if needs_split {
                self.split_leaf(leaf)?;
                return Err(Error::Restart(RestartReason::Split));
            }
        }

        // Step 3: journal reservation.
        let entries = self.build_journal_entries();
        let u64s: usize = entries.iter().map(|e| e.u64s()).sum();
        let res = self.fs.journal.reserve(u64s)?;

        // Step 4: disk reservation for sectors the updates add.
        let new_sectors: u64 = self
            .updates
            .iter()
            .filter(|u| matches!(u.key.val, BkeyVal::Extent(_) | BkeyVal::ReflinkV(_)))
            .map(|u| u.key.size as u64)
            .sum();
        if new_sectors > 0 {
            match disk_res.as_deref_mut() {
                Some(res) => res.consume(new_sectors)?,
                None => {
                    let mut own = self
                        .fs
                        .alloc
                        .reservation_get(new_sectors, self.fs.replicas())?;
                    own.consume(new_sectors.min(own.sectors()))?;
                }
            }
        }

        // Step 5: escalate to write locks, in tree order (`leaves` follows
        // the sorted update list). Our own lookup paths may hold read
        // locks on these leaves; those must go first or the upgrade would
        // wait on ourselves.
        let mut locked: SmallVec<[NodeId; 4]> = SmallVec::new();
        for &leaf in &leaves {
            self.drop_own_read_locks(leaf);
        }
        for &leaf in &leaves {
            match self.fs.cache.node(leaf) {
                Ok(node) => {
                    node.lock.lock_write();
                    locked.push(leaf);
                }
                Err(err) => {
                    self.unlock_writes(&locked);
                    return Err(err);
                }
            }
        }

        // Step 6: the atomicity point.
        let seq = match self
            .fs
            .journal
            .append_and_write(res, entries, flags.flush_journal)
        {
            Ok(seq) => seq,
            Err(err) => {
                self.unlock_writes(&locked);
                if let Error::IoWrite(ref ctx) = err {
                    error!(%ctx, "journal write failed; going read-only");
                    self.fs.set_emergency_ro();
                }
                return Err(err);
            }
        };

        // Step 7: apply. Failure past this point is a broken invariant.
        let mut apply_error = None;
        for i in 0..self.updates.len() {
            let key = self.updates[i].key.clone();
            let btree_id = self.updates[i].btree_id;
            match self.updates[i].path {
                None => {
                    self.fs.key_cache.insert_dirty(btree_id, key, seq);
                }
                Some(idx) => {
                    let node = match self.path_leaf(idx).and_then(|l| self.fs.cache.node(l)) {
                        Ok(node) => node,
                        Err(err) => {
                            apply_error = Some(err);
                            break;
                        }
                    };
                    let mut data = node.data.write();
                    if let Err(err) = data.insert(&key) {
                        apply_error = Some(err);
                        break;
                    }
                    if data.should_compact() {
                        if let Err(err) = data.compact() {
                            apply_error = Some(err);
                            break;
                        }
                        self.fs
                            .counters
                            .compactions
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
        }
        if let Some(err) = apply_error {
            error!(%err, "commit failed after its journal write; going read-only");
            self.fs.set_emergency_ro();
            self.unlock_writes(&locked);
            return Err(err);
        }

        // Step 8: publish and release.
        for &leaf in &locked {
            if let Ok(node) = self.fs.cache.node(leaf) {
                node.journal_seq
                    .store(seq, std::sync::atomic::Ordering::Release);
            }
        }
        self.unlock_writes(&locked);

        self.journal_seq = seq;
        if let Some(out) = journal_seq_out {
            *out = seq;
        }
        self.fs
            .counters
            .commits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(seq, updates = self.updates.len(), "commit published");

        // Release the update references; the staged list is consumed.
        let paths: SmallVec<[usize; 8]> =
            self.updates.iter().filter_map(|u| u.path).collect();
        self.updates.clear();
        for idx in paths {
            self.path_put(idx);
        }
        Ok(())
    }

    fn unlock_writes(&self, leaves: &[NodeId]) {
        for &leaf in leaves {
            if let Ok(node) = self.fs.cache.node(leaf) {
                node.lock.unlock_write();
            }
        }
    }

    fn build_journal_entries(&self) -> Vec<JEntry> {
        let mut entries: Vec<JEntry> = Vec::new();
        for update in &self.updates {
            match entries.iter_mut().find(|e| {
                matches!(e, JEntry::BtreeKeys { btree_id, level, .. }
                    if *btree_id == update.btree_id && *level == 0)
            }) {
                Some(JEntry::BtreeKeys { keys, .. }) => keys.push(update.key.clone()),
                _ => entries.push(JEntry::BtreeKeys {
                    btree_id: update.btree_id,
                    level: 0,
                    keys: vec![update.key.clone()],
                }),
            }
        }
        entries
    }

    /// Split a full leaf: write both halves COW, repoint the parent (or
    /// grow a new root), journal the structural change, and retire the old
    /// bucket. The caller restarts afterwards.
    pub(crate) fn split_leaf(&mut self, leaf: NodeId) -> Result<()> {
        let node = self.fs.cache.node(leaf)?;
        let (btree_id, level, old_seq) = {
            let data = node.data.read();
            (data.btree_id, data.level, data.seq)
        };
        let old_loc = node.loc();

        let root = self.fs.root(btree_id);
        let is_root = root.level == level
            && root.ptr.dev == old_loc.dev
            && root.ptr.bucket == old_loc.bucket;

        // Parent intent comes first when there is a parent; it is an
        // out-of-order acquisition, so trylock-or-restart.
        let parent = if is_root {
            None
        } else {
            let parent_id = self.find_parent(btree_id, level, leaf)?;
            let pnode = self.fs.cache.node(parent_id)?;
            if !pnode.lock.try_lock_intent() {
                return Err(Error::Restart(RestartReason::WouldBlock));
            }
            Some((parent_id, pnode))
        };

        let result = self.split_locked(btree_id, level, leaf, old_seq, is_root, &parent);

        if let Some((_, pnode)) = &parent {
            pnode.lock.unlock_intent();
        }
        let parent_overfull = result?;

        self.fs
            .counters
            .splits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // A split can fill the parent in turn; split upward with the
        // intent lock released, before anyone piles more pointers in.
        if parent_overfull {
            if let Some((parent_id, _)) = parent {
                self.split_leaf(parent_id)?;
            }
        }
        Ok(())
    }

    fn find_parent(&mut self, btree_id: BtreeId, level: u8, leaf: NodeId) -> Result<NodeId> {
        // Any of our paths resting on this leaf recorded the parent during
        // descent.
        for path in self.paths.iter().flatten() {
            if path.btree_id != btree_id {
                continue;
            }
            if path.nodes[level as usize].map(|r| r.id) == Some(leaf) {
                if let Some(parent_ref) = path.nodes[level as usize + 1] {
                    return Ok(parent_ref.id);
                }
            }
        }
        Err(Error::Restart(RestartReason::RelockFail))
    }

    fn split_locked(
        &mut self,
        btree_id: BtreeId,
        level: u8,
        leaf: NodeId,
        old_seq: u64,
        is_root: bool,
        parent: &Option<(NodeId, std::sync::Arc<crate::node::cache::CachedNode>)>,
    ) -> Result<bool> {
        let node = self.fs.cache.node(leaf)?;
        let old_loc = node.loc();

        // Build both halves from the merged contents.
        let (mut left, mut right) = {
            let data = node.data.read();
            if data.seq != old_seq {
                return Err(Error::Restart(RestartReason::RelockFail));
            }
            data.split(self.fs.next_node_seq(), self.fs.next_node_seq())?
        };

        let (left_loc, left_sectors) = self.fs.write_node(&mut left)?;
        let (right_loc, right_sectors) = self.fs.write_node(&mut right)?;

        let ptr_left = Bkey::new(
            left.max_key,
            BkeyVal::BtreePtr(BtreePtr {
                dev: left_loc.dev,
                bucket: left_loc.bucket,
                seq: left.seq,
                sectors_written: left_sectors,
                min_key: left.min_key,
            }),
        );
        let ptr_right = Bkey::new(
            right.max_key,
            BkeyVal::BtreePtr(BtreePtr {
                dev: right_loc.dev,
                bucket: right_loc.bucket,
                seq: right.seq,
                sectors_written: right_sectors,
                min_key: right.min_key,
            }),
        );

        let mut entries: Vec<JEntry> = Vec::new();
        let parent_level = level + 1;
        let mut parent_overfull = false;

        if is_root {
            // Grow the tree: a fresh interior root holding both halves.
            let mut new_root = crate::node::Node::new(
                btree_id,
                parent_level,
                self.fs.next_node_seq(),
                POS_MIN,
                POS_MAX,
            );
            new_root.insert(&ptr_left)?;
            new_root.insert(&ptr_right)?;
            let (root_loc, root_sectors) = self.fs.write_node(&mut new_root)?;
            let root_ptr = BtreePtr {
                dev: root_loc.dev,
                bucket: root_loc.bucket,
                seq: new_root.seq,
                sectors_written: root_sectors,
                min_key: POS_MIN,
            };
            self.fs.cache.insert(new_root, root_loc, root_sectors)?;
            self.fs.set_root(btree_id, root_ptr, parent_level);
            entries.push(JEntry::BtreeRoot {
                btree_id,
                level: parent_level,
                ptr: Bkey::new(POS_MAX, BkeyVal::BtreePtr(root_ptr)),
            });
        } else {
            let (_, pnode) = parent.as_ref().expect("non-root split has a parent");
            pnode.lock.lock_write();
            let apply = {
                let mut pdata = pnode.data.write();
                if !pdata.covers(left.min_key) || pdata.level != parent_level {
                    Err(Error::Restart(RestartReason::RelockFail))
                } else {
                    let res = pdata
                        .insert(&ptr_left)
                        .and_then(|_| pdata.insert(&ptr_right));
                    parent_overfull = pdata.should_split(0, self.fs.node_size());
                    res
                }
            };
            pnode.lock.unlock_write();
            if let Err(err) = apply {
                // The parent moved; hand the halves' buckets back before
                // restarting.
                self.fs.alloc.bucket_release(
                    left_loc.dev,
                    left_loc.bucket,
                    crate::alloc::ReleaseReason::Aborted,
                );
                self.fs.alloc.bucket_release(
                    right_loc.dev,
                    right_loc.bucket,
                    crate::alloc::ReleaseReason::Aborted,
                );
                return Err(err);
            }
            entries.push(JEntry::BtreeKeys {
                btree_id,
                level: parent_level,
                keys: vec![ptr_left, ptr_right],
            });
        }

        self.fs.cache.insert(left, left_loc, left_sectors)?;
        self.fs.cache.insert(right, right_loc, right_sectors)?;

        // Journal the structural change. If the ring is momentarily full
        // the split stays memory-only: the old leaf remains reachable on
        // disk until the retire seq flushes, so replay stays correct.
        let u64s: usize = entries.iter().map(|e| e.u64s()).sum();
        let retire_seq = match self
            .fs
            .journal
            .reserve(u64s)
            .and_then(|res| self.fs.journal.append_and_write(res, entries, false))
        {
            Ok(seq) => seq,
            Err(Error::Restart(_)) => self.fs.journal.next_seq(),
            Err(err) => return Err(err),
        };

        self.fs.cache.remove(old_loc);
        self.fs
            .alloc
            .retire_bucket(old_loc.dev, old_loc.bucket, retire_seq);
        debug!(
            %btree_id,
            level,
            ?old_loc,
            "split btree node"
        );
        Ok(parent_overfull)
    }
}
