//! # Paths
//!
//! A path is a cursor from a tree root down to the leaf covering one
//! position, carrying per-level node handles and lock state. Paths store
//! [`NodeId`]s, never pointers: the cache validates the id's generation on
//! every resolution, so a path whose node was cannibalized finds out via a
//! `lock_node_reused` restart instead of a dangling reference.
//!
//! ## Locking during traversal
//!
//! Descent read-locks each interior node just long enough to find the
//! child pointer, then records the node's lock sequence and unlocks. Only
//! the leaf lock is retained: shared for lookups, intent for paths that
//! will update. Retained upper-level sequences let a later traversal
//! revalidate cheaply — a leaf whose sequence still matches is relocked in
//! place without walking from the root.
//!
//! ## Lock ordering
//!
//! The global acquisition order is `(btree id, level descending, position
//! ascending)`. An acquisition that is in order with everything the
//! transaction already holds may block; anything else is trylock-only and
//! a failure restarts the transaction (`would_block`). That asymmetry is
//! what makes the protocol deadlock-free: every cycle would need at least
//! one out-of-order blocking edge, and those do not exist.

use crate::config::{BTREE_ITER_MAX_HARD, BTREE_ITER_MAX_SOFT, BTREE_MAX_DEPTH};
use crate::errors::{Error, RestartReason, Result};
use crate::key::{Bpos, BtreeId};
use crate::locking::LockType;
use crate::node::cache::{DiskLoc, NodeId};
use crate::transaction::Trans;

/// Per-level node reference with lock state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeRef {
    pub id: NodeId,
    pub lock: Option<LockType>,
    /// Lock sequence observed at acquisition; compared on relock.
    pub seq: u32,
}

/// A cursor into one tree.
#[derive(Debug)]
pub(crate) struct Path {
    pub btree_id: BtreeId,
    pub pos: Bpos,
    /// Take intent (rather than read) at the leaf.
    pub intent: bool,
    /// Survive `begin`; plain paths are freed there.
    pub preserve: bool,
    pub uptodate: bool,
    pub refs: u32,
    pub nodes: [Option<NodeRef>; BTREE_MAX_DEPTH],
}

impl Path {
    fn new(btree_id: BtreeId, pos: Bpos, intent: bool) -> Self {
        Self {
            btree_id,
            pos,
            intent,
            preserve: false,
            uptodate: false,
            refs: 1,
            nodes: [None; BTREE_MAX_DEPTH],
        }
    }

    /// Ordering key per the lock protocol: higher levels sort first.
    fn order_key(btree_id: BtreeId, level: usize, pos: Bpos) -> (u8, usize, Bpos) {
        (btree_id as u8, BTREE_MAX_DEPTH - level, pos)
    }
}

impl Trans<'_> {
    /// Allocate (or reuse) a path slot. Bounded: past the soft limit the
    /// transaction is told to commit and restart; the hard limit is the
    /// allocation bound.
    pub(crate) fn path_get(&mut self, btree_id: BtreeId, pos: Bpos, intent: bool) -> Result<usize> {
        let live = self.paths.iter().flatten().count();
        if live >= BTREE_ITER_MAX_SOFT {
            return Err(Error::TooManyIters);
        }

        let path = Path::new(btree_id, pos, intent);
        if let Some(idx) = self.paths.iter().position(|p| p.is_none()) {
            self.paths[idx] = Some(path);
            return Ok(idx);
        }
        if self.paths.len() >= BTREE_ITER_MAX_HARD {
            return Err(Error::TooManyIters);
        }
        self.paths.push(Some(path));
        Ok(self.paths.len() - 1)
    }

    pub(crate) fn path_put(&mut self, idx: usize) {
        let free = match self.paths.get_mut(idx).and_then(|p| p.as_mut()) {
            Some(path) => {
                path.refs = path.refs.saturating_sub(1);
                path.refs == 0 && !path.preserve
            }
            None => false,
        };
        if free {
            self.path_drop_locks(idx);
            self.paths[idx] = None;
        }
    }

    /// Release every lock `idx` holds, keeping sequences for relock.
    pub(crate) fn path_drop_locks(&mut self, idx: usize) {
        let Some(path) = self.paths.get_mut(idx).and_then(|p| p.as_mut()) else {
            return;
        };
        for level in 0..BTREE_MAX_DEPTH {
            let Some(mut node_ref) = path.nodes[level] else {
                continue;
            };
            if let Some(lock) = node_ref.lock.take() {
                if let Ok(node) = self.fs.cache.node(node_ref.id) {
                    match lock {
                        LockType::Read => node.lock.unlock_read(),
                        LockType::Intent => node.lock.unlock_intent(),
                        LockType::Write => {
                            node.lock.unlock_write();
                            node.lock.unlock_intent();
                        }
                    }
                    node_ref.seq = node.lock.seq();
                }
            }
            path.nodes[level] = Some(node_ref);
        }
        path.uptodate = false;
    }

    /// Re-aim a path. Keeps the traversal when the held leaf still covers
    /// the new position.
    pub(crate) fn path_set_pos(&mut self, idx: usize, pos: Bpos) {
        let Some(path) = self.paths.get_mut(idx).and_then(|p| p.as_mut()) else {
            return;
        };
        if path.pos == pos {
            return;
        }
        path.pos = pos;
        if !path.uptodate {
            return;
        }
        let still_covered = path.nodes[0]
            .and_then(|node_ref| self.fs.cache.node(node_ref.id).ok())
            .map(|node| node.data.read().covers(pos))
            .unwrap_or(false);
        if !still_covered {
            self.path_drop_locks(idx);
        }
    }

    /// Promote a read path to intent. Takes effect on the next traversal.
    pub(crate) fn path_make_intent(&mut self, idx: usize) -> Result<()> {
        let Some(path) = self.paths.get_mut(idx).and_then(|p| p.as_mut()) else {
            return Err(Error::Restart(RestartReason::LockNodeReused));
        };
        if !path.intent {
            path.intent = true;
            self.path_drop_locks(idx);
        }
        Ok(())
    }

    /// Whether some path of this transaction owns an intent (or write)
    /// lock on `id`.
    pub(crate) fn path_holds_intent(&self, id: NodeId) -> bool {
        self.paths.iter().flatten().any(|path| {
            path.nodes.iter().flatten().any(|node_ref| {
                node_ref.id == id
                    && matches!(node_ref.lock, Some(LockType::Intent) | Some(LockType::Write))
            })
        })
    }

    /// Whether acquiring a lock at `(btree_id, level, pos)` keeps the
    /// transaction's acquisitions in global order, permitting a blocking
    /// acquisition.
    pub(crate) fn lock_in_order(&self, btree_id: BtreeId, level: usize, pos: Bpos) -> bool {
        let candidate = Path::order_key(btree_id, level, pos);
        for path in self.paths.iter().flatten() {
            for (lvl, node_ref) in path.nodes.iter().enumerate() {
                if let Some(node_ref) = node_ref {
                    if node_ref.lock.is_some()
                        && Path::order_key(path.btree_id, lvl, path.pos) > candidate
                    {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Walk from the root to the leaf covering the path's position,
    /// acquiring locks per the protocol. Idempotent for up-to-date paths.
    pub(crate) fn path_traverse(&mut self, idx: usize) -> Result<()> {
        let (btree_id, pos, intent, uptodate, leaf_ref) = {
            let Some(path) = self.paths.get(idx).and_then(|p| p.as_ref()) else {
                return Err(Error::Restart(RestartReason::LockNodeReused));
            };
            (
                path.btree_id,
                path.pos,
                path.intent,
                path.uptodate,
                path.nodes[0],
            )
        };
        if uptodate {
            return Ok(());
        }
        self.path_drop_locks(idx);

        // Fast path: relock the previous leaf if nothing moved.
        if !intent {
            if let Some(node_ref) = leaf_ref {
                if let Ok(node) = self.fs.cache.node(node_ref.id) {
                    if node.lock.relock_read(node_ref.seq) {
                        if node.data.read().covers(pos) {
                            let path = self.paths[idx].as_mut().unwrap();
                            path.nodes[0] = Some(NodeRef {
                                id: node_ref.id,
                                lock: Some(LockType::Read),
                                seq: node.lock.seq(),
                            });
                            path.uptodate = true;
                            return Ok(());
                        }
                        node.lock.unlock_read();
                    }
                }
            }
        }

        let root = self.fs.root(btree_id);
        let mut ptr = root.ptr;
        let mut level = root.level as usize;
        if level >= BTREE_MAX_DEPTH {
            return Err(Error::FatalCorruption(format!(
                "{btree_id} root at level {level} exceeds the depth bound"
            )));
        }

        loop {
            let loc = DiskLoc {
                dev: ptr.dev,
                bucket: ptr.bucket,
            };
            let id = self.fs.cache.get_or_read(
                self.fs.dev(ptr.dev),
                loc,
                self.fs.bucket_to_sector(ptr.dev, ptr.bucket),
                (btree_id, level as u8, ptr.seq),
                self.fs.csum_type(),
                self.fs.node_size(),
            )?;
            let node = self.fs.cache.node(id)?;

            if level == 0 {
                // Two paths of one transaction may rest on the same leaf;
                // the second borrows the first's intent instead of
                // deadlocking against it.
                if intent && self.path_holds_intent(id) {
                    if !node.data.read().covers(pos) {
                        return Err(Error::Restart(RestartReason::RelockFail));
                    }
                    let path = self.paths[idx].as_mut().unwrap();
                    path.nodes[0] = Some(NodeRef {
                        id,
                        lock: None,
                        seq: node.lock.seq(),
                    });
                    path.uptodate = true;
                    return Ok(());
                }

                let lock = if intent {
                    if !node.lock.try_lock_intent() {
                        return Err(Error::Restart(RestartReason::WouldBlock));
                    }
                    LockType::Intent
                } else if self.lock_in_order(btree_id, 0, pos) {
                    node.lock.lock_read();
                    LockType::Read
                } else if node.lock.try_lock_read() {
                    LockType::Read
                } else {
                    return Err(Error::Restart(RestartReason::WouldBlock));
                };

                if !node.data.read().covers(pos) {
                    match lock {
                        LockType::Read => node.lock.unlock_read(),
                        LockType::Intent => node.lock.unlock_intent(),
                        LockType::Write => unreachable!(),
                    }
                    // Topology moved underneath us (split or root change).
                    return Err(Error::Restart(RestartReason::RelockFail));
                }

                let path = self.paths[idx].as_mut().unwrap();
                path.nodes[0] = Some(NodeRef {
                    id,
                    lock: Some(lock),
                    seq: node.lock.seq(),
                });
                path.uptodate = true;
                return Ok(());
            }

            // Interior: shared lock just long enough to find the child.
            if self.lock_in_order(btree_id, level, pos) {
                node.lock.lock_read();
            } else if !node.lock.try_lock_read() {
                return Err(Error::Restart(RestartReason::WouldBlock));
            }
            let child = {
                let data = node.data.read();
                if !data.covers(pos) {
                    drop(data);
                    node.lock.unlock_read();
                    return Err(Error::Restart(RestartReason::RelockFail));
                }
                data.find_child(pos)
            };
            let seq = node.lock.seq();
            node.lock.unlock_read();
            let (_, child_ptr) = child?;

            let path = self.paths[idx].as_mut().unwrap();
            path.nodes[level] = Some(NodeRef {
                id,
                lock: None,
                seq,
            });
            ptr = child_ptr;
            level -= 1;
        }
    }

    /// Release any read locks this transaction's own paths hold on `id`,
    /// so a write upgrade on it cannot wait on ourselves.
    pub(crate) fn drop_own_read_locks(&mut self, id: NodeId) {
        for slot in 0..self.paths.len() {
            let holds_read = self
                .paths
                .get(slot)
                .and_then(|p| p.as_ref())
                .and_then(|p| p.nodes[0])
                .map(|r| r.id == id && r.lock == Some(LockType::Read))
                .unwrap_or(false);
            if holds_read {
                if let Ok(node) = self.fs.cache.node(id) {
                    node.lock.unlock_read();
                }
                let path = self.paths[slot].as_mut().unwrap();
                if let Some(node_ref) = path.nodes[0].as_mut() {
                    node_ref.lock = None;
                }
                path.uptodate = false;
            }
        }
    }

    /// The leaf node id a traversed path rests on.
    pub(crate) fn path_leaf(&self, idx: usize) -> Result<NodeId> {
        self.paths
            .get(idx)
            .and_then(|p| p.as_ref())
            .filter(|p| p.uptodate)
            .and_then(|p| p.nodes[0])
            .map(|r| r.id)
            .ok_or(Error::Restart(RestartReason::RelockFail))
    }
}
