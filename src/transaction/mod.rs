//! # Transactions
//!
//! Every logical operation against the trees — lookup, scan, multi-key
//! atomic change — happens inside a [`Trans`]. A transaction owns:
//!
//! - a bounded array of **paths** (cursors from a tree root down to a leaf,
//!   carrying lock state per level);
//! - an **arena** for scratch memory, reset wholesale on every `begin`;
//! - the list of **staged updates** that `commit` will publish atomically;
//! - restart accounting.
//!
//! ## The restart discipline
//!
//! Nothing inside a transaction blocks on another transaction. Any lock
//! that cannot be taken in tree order, any stale sequence, any journal or
//! cache resource that would require waiting surfaces as
//! `Error::Restart(_)`: the [`Trans::run`] loop drops every lock, resets
//! the transaction with [`Trans::begin`], optionally performs the work the
//! restart asked for (journal reclaim), and re-executes the closure. The
//! loop also applies a configurable backoff once a transaction has
//! restarted many times in a row, and feeds per-reason counters on the
//! filesystem handle.
//!
//! Submodules: [`path`] (traversal and locking), [`iter`] (the iterator
//! API), [`commit`] (the commit path), [`key_cache`] (write-back cache for
//! cached trees).

pub mod commit;
pub mod iter;
pub mod key_cache;
pub mod path;

use bumpalo::Bump;
use smallvec::SmallVec;

use crate::config::{RESTART_BACKOFF_MAX_US, RESTART_BACKOFF_THRESHOLD};
use crate::errors::{Error, RestartReason, Result};
use crate::fs::Fs;
use crate::key::bkey::BkeyVal;
use crate::key::{Bkey, Bpos, BtreeId};
use iter::{BtreeIter, IterFlags};
use path::Path;

/// One staged update: `(tree, key)`, bound to the path that will apply it.
/// Updates to cached trees carry no path; they go through the key cache.
#[derive(Debug)]
pub(crate) struct Update {
    pub btree_id: BtreeId,
    pub key: Bkey,
    pub path: Option<usize>,
}

/// A transaction over the btrees of one filesystem.
pub struct Trans<'f> {
    pub fs: &'f Fs,
    pub(crate) paths: Vec<Option<Path>>,
    pub(crate) arena: Bump,
    pub(crate) updates: SmallVec<[Update; 8]>,
    pub(crate) restart_count: u32,
    pub(crate) restarted: Option<RestartReason>,
    /// Seq of this transaction's last successful commit.
    pub(crate) journal_seq: u64,
    /// Set by internal flush transactions so cached-tree updates hit the
    /// leaves instead of cycling back into the key cache.
    pub(crate) bypass_key_cache: bool,
}

impl<'f> Trans<'f> {
    pub fn new(fs: &'f Fs) -> Self {
        fs.counters
            .trans_created
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            fs,
            paths: Vec::new(),
            arena: Bump::new(),
            updates: SmallVec::new(),
            restart_count: 0,
            restarted: None,
            journal_seq: 0,
            bypass_key_cache: false,
        }
    }

    /// Reset for (re)execution: all locks dropped, non-preserved paths
    /// freed, staged updates discarded, arena memory reclaimed.
    pub fn begin(&mut self) -> u32 {
        for idx in 0..self.paths.len() {
            self.path_drop_locks(idx);
            if let Some(path) = &self.paths[idx] {
                if !path.preserve {
                    self.paths[idx] = None;
                } else if let Some(path) = self.paths[idx].as_mut() {
                    path.uptodate = false;
                }
            }
        }
        self.updates.clear();
        self.arena.reset();
        if self.restarted.take().is_some() {
            self.restart_count += 1;
        }
        self.restart_count
    }

    /// Release every path and lock. Called on drop; harmless to repeat.
    pub fn put(&mut self) {
        for idx in 0..self.paths.len() {
            self.path_drop_locks(idx);
            self.paths[idx] = None;
        }
        self.updates.clear();
    }

    pub fn journal_seq(&self) -> u64 {
        self.journal_seq
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Run `f` under the restart loop: restarts re-execute the closure in
    /// this thread, everything else propagates.
    pub fn run<T>(fs: &Fs, mut f: impl FnMut(&mut Trans<'_>) -> Result<T>) -> Result<T> {
        let mut trans = Trans::new(fs);
        loop {
            match f(&mut trans) {
                Ok(value) => return Ok(value),
                Err(Error::Restart(reason)) => {
                    fs.counters.note_restart(reason);
                    trans.restarted = Some(reason);
                    trans.begin();

                    // The waits a restart asked for happen here, with no
                    // locks held.
                    if reason == RestartReason::JournalReclaim {
                        fs.journal_reclaim()?;
                    }
                    if trans.restart_count > RESTART_BACKOFF_THRESHOLD {
                        let over = (trans.restart_count - RESTART_BACKOFF_THRESHOLD) as u64;
                        let us = over.min(RESTART_BACKOFF_MAX_US);
                        std::thread::sleep(std::time::Duration::from_micros(us));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run `f` as a nested scope: its restarts propagate to the outer loop
    /// tagged as nested so instrumentation can tell them apart.
    pub fn nested<T>(&mut self, f: impl FnOnce(&mut Trans<'f>) -> Result<T>) -> Result<T> {
        f(self).map_err(Error::into_nested)
    }

    /// Open an iterator. Flags are normalized against the tree: snapshot
    /// filtering defaults on for snapshotted trees, the key cache for
    /// cached trees.
    pub fn iter_init(
        &mut self,
        btree_id: BtreeId,
        pos: Bpos,
        mut flags: IterFlags,
    ) -> Result<BtreeIter> {
        if btree_id.has_snapshots() && !flags.all_snapshots {
            flags.filter_snapshots = true;
        }
        if btree_id.is_cached() && !self.bypass_key_cache {
            flags.with_key_cache = true;
        }
        let path = self.path_get(btree_id, pos, flags.intent)?;
        Ok(BtreeIter::new(btree_id, pos, flags, path))
    }

    /// Close an iterator, releasing its path reference.
    pub fn iter_exit(&mut self, iter: BtreeIter) {
        self.path_put(iter.path_idx());
    }

    /// Stage an insert/overwrite/delete through `iter`'s position. Deletes
    /// are tombstone inserts; on snapshotted trees deleting a key that
    /// lives in an ancestor snapshot stages a whiteout so the ancestor's
    /// key stays visible to the ancestor.
    pub fn update(&mut self, iter: &mut BtreeIter, mut key: Bkey) -> Result<()> {
        key.validate()?;
        let btree_id = iter.btree_id();
        if !btree_id.permits(key.val.tag()) {
            return Err(Error::KeyTypeMismatch {
                expected: btree_id.as_str(),
                found: key.val.type_name(),
            });
        }
        if matches!(key.val, BkeyVal::Unknown { .. }) {
            return Err(Error::UnsupportedFeature(
                "cannot create keys with unknown type tags".into(),
            ));
        }

        if btree_id.is_cached() && !self.bypass_key_cache {
            self.stage(Update {
                btree_id,
                key,
                path: None,
            });
            return Ok(());
        }

        let idx = iter.path_idx();
        self.path_make_intent(idx)?;
        self.path_set_pos(idx, key.pos);
        self.path_traverse(idx)?;

        if key.is_deleted() && btree_id.has_snapshots() {
            if let Some(visible) = self.lookup_cell(btree_id, key.pos)? {
                // A key living in an ancestor snapshot cannot be removed
                // from here; shadow it instead. An existing whiteout stays
                // a whiteout.
                if visible.is_whiteout() || visible.pos.snapshot != key.pos.snapshot {
                    key = Bkey::whiteout(key.pos);
                }
            }
        }

        if btree_id.is_extents() && key.size > 0 && !key.is_deleted() && !key.is_whiteout() {
            self.extent_stage_overwrites(btree_id, &key)?;
        }

        self.path_ref(idx);
        self.stage(Update {
            btree_id,
            key,
            path: Some(idx),
        });
        Ok(())
    }

    /// Keep `updates` sorted by `(tree, pos)`; a later update at the same
    /// position supersedes the earlier one.
    pub(crate) fn stage(&mut self, update: Update) {
        let key = (update.btree_id, update.key.pos);
        match self
            .updates
            .binary_search_by_key(&key, |u| (u.btree_id, u.key.pos))
        {
            Ok(i) => {
                let old = std::mem::replace(&mut self.updates[i], update);
                if let Some(idx) = old.path {
                    self.path_put(idx);
                }
            }
            Err(i) => self.updates.insert(i, update),
        }
    }

    /// Convenience: stage an insert at `key.pos`, creating the iterator.
    pub fn btree_insert(&mut self, btree_id: BtreeId, key: Bkey) -> Result<()> {
        let mut iter = self.iter_init(
            btree_id,
            key.pos,
            IterFlags {
                intent: true,
                ..IterFlags::default()
            },
        )?;
        let res = self.update(&mut iter, key);
        self.iter_exit(iter);
        res
    }

    /// Convenience: stage a delete at `pos`.
    pub fn btree_delete(&mut self, btree_id: BtreeId, pos: Bpos) -> Result<()> {
        self.btree_insert(btree_id, Bkey::deleted(pos))
    }

    /// Stage a key exactly as given: no whiteout conversion, no extent
    /// replacement. Journal replay and key-cache write-back use this —
    /// their keys were already transformed when first staged.
    pub(crate) fn btree_insert_raw(&mut self, btree_id: BtreeId, key: Bkey) -> Result<()> {
        let iter = self.iter_init(
            btree_id,
            key.pos,
            IterFlags {
                intent: true,
                all_snapshots: true,
                ..IterFlags::default()
            },
        )?;
        let idx = iter.path_idx();
        self.path_set_pos(idx, key.pos);
        let res = self.path_traverse(idx);
        if res.is_ok() {
            self.path_ref(idx);
            self.stage(Update {
                btree_id,
                key,
                path: Some(idx),
            });
        }
        self.iter_exit(iter);
        res
    }

    /// Point lookup: the visible key at `pos`, or `None`.
    pub fn btree_lookup(&mut self, btree_id: BtreeId, pos: Bpos) -> Result<Option<Bkey>> {
        let mut iter = self.iter_init(btree_id, pos, IterFlags::default())?;
        let got = iter.peek_slot(self);
        self.iter_exit(iter);
        let key = got?;
        Ok(if key.is_deleted() || key.is_whiteout() {
            None
        } else {
            Some(key)
        })
    }

    /// The visible key in the `(inode, offset)` cell of `pos`, walking the
    /// snapshot ancestry. Ignores staged updates.
    pub(crate) fn lookup_cell(&mut self, btree_id: BtreeId, pos: Bpos) -> Result<Option<Bkey>> {
        let mut iter = self.iter_init(
            btree_id,
            Bpos::new(pos.inode, pos.offset, 0),
            IterFlags {
                all_snapshots: true,
                ..IterFlags::default()
            },
        )?;
        let mut found = None;
        loop {
            match iter.peek_upto(self, Bpos::new(pos.inode, pos.offset, u32::MAX)) {
                Ok(Some(key)) => {
                    let ks = key.pos.snapshot;
                    if ks == pos.snapshot || self.fs.snapshots.is_ancestor(ks, pos.snapshot) {
                        found = Some(key);
                        break;
                    }
                    iter.advance(self);
                }
                Ok(None) => break,
                Err(err) => {
                    self.iter_exit(iter);
                    return Err(err);
                }
            }
        }
        self.iter_exit(iter);
        match found {
            Some(k) if k.is_deleted() => Ok(None),
            other => Ok(other),
        }
    }

    /// Replace-by-range for extent inserts: every live extent in the same
    /// snapshot line overlapping `[new.start, new.pos)` is deleted or
    /// trimmed in the same commit, so live extents never overlap outside
    /// the commit that replaces them.
    fn extent_stage_overwrites(&mut self, btree_id: BtreeId, new: &Bkey) -> Result<()> {
        let start = new.start();
        let end = new.pos;

        let mut iter = self.iter_init(
            btree_id,
            Bpos::new(start.inode, start.offset, start.snapshot).successor(),
            IterFlags {
                all_snapshots: true,
                ..IterFlags::default()
            },
        )?;

        let mut staged: Vec<Bkey> = Vec::new();
        loop {
            let key = match iter.peek_upto(self, Bpos::new(end.inode, u64::MAX, end.snapshot)) {
                Ok(Some(k)) => k,
                Ok(None) => break,
                Err(err) => {
                    self.iter_exit(iter);
                    return Err(err);
                }
            };
            if key.pos.inode != end.inode {
                break;
            }
            iter.advance(self);

            if key.pos.snapshot != new.pos.snapshot || key.size == 0 || key.is_deleted() {
                continue;
            }
            let (k_start, k_end) = (key.start().offset, key.pos.offset);
            if k_start >= end.offset {
                break;
            }
            if k_end <= start.offset {
                continue;
            }

            let front = k_start < start.offset;
            let back = k_end > end.offset;
            // The old end-position key always goes away unless only its
            // tail survives in place.
            if front {
                staged.push(trim_extent_back(&key, start.offset));
                if !back {
                    staged.push(Bkey::deleted(key.pos));
                }
            } else if !back {
                staged.push(Bkey::deleted(key.pos));
            }
            if back {
                staged.push(trim_extent_front(&key, end.offset));
            }
        }
        self.iter_exit(iter);

        for key in staged {
            let path = {
                let it = self.iter_init(
                    btree_id,
                    key.pos,
                    IterFlags {
                        intent: true,
                        ..IterFlags::default()
                    },
                )?;
                let idx = it.path_idx();
                self.path_traverse(idx)?;
                // The staged update keeps the path (and its intent lock)
                // alive past the iterator.
                self.path_ref(idx);
                self.iter_exit(it);
                idx
            };
            self.stage(Update {
                btree_id,
                key,
                path: Some(path),
            });
        }
        Ok(())
    }
}

/// Keep the head of `key`, ending at `new_end` (exclusive of the removed
/// tail). The result lives at a new, earlier end position.
fn trim_extent_back(key: &Bkey, new_end: u64) -> Bkey {
    let start = key.start().offset;
    let mut out = key.clone();
    out.pos = Bpos::new(key.pos.inode, new_end, key.pos.snapshot);
    out.size = (new_end - start) as u32;
    if let BkeyVal::Extent(e) = &mut out.val {
        for ptr in &mut e.ptrs {
            ptr.sectors = out.size;
        }
    }
    out
}

/// Keep the tail of `key`, starting at `new_start`. Position is unchanged
/// (extent keys are addressed by their end).
fn trim_extent_front(key: &Bkey, new_start: u64) -> Bkey {
    let cut = new_start - key.start().offset;
    let mut out = key.clone();
    out.size = (key.pos.offset - new_start) as u32;
    if let BkeyVal::Extent(e) = &mut out.val {
        for ptr in &mut e.ptrs {
            ptr.bucket_offset += cut as u32;
            ptr.sectors = out.size;
        }
    }
    out
}

impl Drop for Trans<'_> {
    fn drop(&mut self) {
        self.put();
    }
}

/// Full-range scan helper used by tests and the flush paths: collect every
/// visible key in `btree_id` within `[from, to]`.
pub fn collect_range(
    trans: &mut Trans<'_>,
    btree_id: BtreeId,
    from: Bpos,
    to: Bpos,
) -> Result<Vec<Bkey>> {
    let mut iter = trans.iter_init(
        btree_id,
        from,
        IterFlags {
            all_snapshots: true,
            ..IterFlags::default()
        },
    )?;
    let mut out = Vec::new();
    loop {
        match iter.peek_upto(trans, to) {
            Ok(Some(key)) => {
                if !key.is_deleted() && !key.is_whiteout() {
                    out.push(key);
                }
                iter.advance(trans);
            }
            Ok(None) => break,
            Err(err) => {
                trans.iter_exit(iter);
                return Err(err);
            }
        }
    }
    trans.iter_exit(iter);
    Ok(out)
}
