//! # Node Cache
//!
//! The resident set of btree nodes. Every node a path touches lives here,
//! addressed two ways:
//!
//! - by **disk location** (`(dev, bucket)`) for traversal: following a
//!   `btree_ptr` consults the index and fills from disk on a miss;
//! - by **[`NodeId`]** (slot index + generation) for paths: paths store ids,
//!   never pointers, and a generation mismatch tells a path its node was
//!   evicted and the slot reused — surfaced as the `lock_node_reused`
//!   restart.
//!
//! ## Eviction
//!
//! SIEVE-style second chance: a hand sweeps the slot array; `visited` is set
//! on every access and cleared by the hand; a clean, unlocked, unvisited
//! node is evicted. Nodes holding any lock are pinned by definition (paths
//! hold locks), and dirty nodes are never evicted — they are written out by
//! the filesystem flush first.
//!
//! When sweeping finds no victim the allocating thread takes the
//! *cannibalize* lock and steals the first clean, unlocked node even if it
//! is hot (visited) or other threads still hold `Arc` references to it:
//! the references keep the memory alive, and the holders' next id
//! resolution fails the generation check and restarts with
//! `lock_node_reused`.
//!
//! Evicted nodes leave `(location → sectors written)` in a side index so a
//! re-read can issue exactly-sized I/O instead of a full-bucket read.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::codec::ChecksumType;
use crate::config::{CACHE_EVICT_SWEEPS, SECTOR_SIZE};
use crate::errors::{Error, RestartReason, Result};
use crate::io::BlockDev;
use crate::key::BtreeId;
use crate::locking::SixLock;
use crate::node::{format, Node};

/// On-disk address of a node: device index and bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskLoc {
    pub dev: u32,
    pub bucket: u64,
}

/// Stable handle to a cache slot. The generation detects slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId {
    idx: u32,
    gen: u32,
}

/// A resident node: protocol lock, data, and bookkeeping.
pub struct CachedNode {
    pub lock: SixLock,
    pub data: RwLock<Node>,
    /// Mirrors `data.seq` so identity checks avoid the data lock.
    pub seq: AtomicU64,
    loc: Mutex<DiskLoc>,
    /// Journal seq of the last commit that touched this node; its bucket
    /// cannot be reused until that seq is flushed.
    pub journal_seq: AtomicU64,
    pub sectors_written: AtomicU32,
    pub read_error: AtomicBool,
    visited: AtomicBool,
}

impl std::fmt::Debug for CachedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedNode").finish_non_exhaustive()
    }
}

impl CachedNode {
    fn new(node: Node, loc: DiskLoc, sectors_written: u32) -> Self {
        Self {
            lock: SixLock::new(),
            seq: AtomicU64::new(node.seq),
            data: RwLock::new(node),
            loc: Mutex::new(loc),
            journal_seq: AtomicU64::new(0),
            sectors_written: AtomicU32::new(sectors_written),
            read_error: AtomicBool::new(false),
            visited: AtomicBool::new(true),
        }
    }

    pub fn loc(&self) -> DiskLoc {
        *self.loc.lock()
    }
}

struct Slot {
    gen: u32,
    node: Option<Arc<CachedNode>>,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub cannibalized: AtomicU64,
}

/// Process-wide resident node table.
pub struct NodeCache {
    slots: RwLock<Vec<Slot>>,
    index: RwLock<HashMap<DiskLoc, NodeId>>,
    evicted: RwLock<HashMap<DiskLoc, u32>>,
    /// Locations retired by COW whose buckets are not yet reusable. A
    /// stale pointer read here must restart, not resurrect the old image
    /// from disk.
    retired: RwLock<hashbrown::HashSet<DiskLoc>>,
    hand: Mutex<usize>,
    fill_lock: Mutex<()>,
    cannibalize_lock: Mutex<()>,
    max_nodes: usize,
    pub stats: CacheStats,
}

impl NodeCache {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            index: RwLock::new(HashMap::new()),
            evicted: RwLock::new(HashMap::new()),
            retired: RwLock::new(hashbrown::HashSet::new()),
            hand: Mutex::new(0),
            fill_lock: Mutex::new(()),
            cannibalize_lock: Mutex::new(()),
            max_nodes,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a path-held id, restarting the holder if the slot moved on.
    pub fn node(&self, id: NodeId) -> Result<Arc<CachedNode>> {
        let slots = self.slots.read();
        match slots.get(id.idx as usize) {
            Some(slot) if slot.gen == id.gen => match &slot.node {
                Some(node) => {
                    node.visited.store(true, Ordering::Relaxed);
                    Ok(Arc::clone(node))
                }
                None => Err(Error::Restart(RestartReason::LockNodeReused)),
            },
            Some(_) => Err(Error::Restart(RestartReason::LockNodeReused)),
            None => Err(Error::Restart(RestartReason::LockNodeReused)),
        }
    }

    pub fn lookup(&self, loc: DiskLoc) -> Option<NodeId> {
        self.index.read().get(&loc).copied()
    }

    /// Insert a freshly created (or freshly read) node.
    pub fn insert(&self, node: Node, loc: DiskLoc, sectors_written: u32) -> Result<NodeId> {
        let entry = Arc::new(CachedNode::new(node, loc, sectors_written));
        let id = self.place(entry)?;
        self.index.write().insert(loc, id);
        self.evicted.write().remove(&loc);
        // A released bucket coming back as a fresh node is live again.
        self.retired.write().remove(&loc);
        Ok(id)
    }

    fn place(&self, entry: Arc<CachedNode>) -> Result<NodeId> {
        // Fast path: a free slot.
        {
            let mut slots = self.slots.write();
            if let Some(idx) = slots.iter().position(|s| s.node.is_none()) {
                slots[idx].node = Some(entry);
                return Ok(NodeId {
                    idx: idx as u32,
                    gen: slots[idx].gen,
                });
            }
            if slots.len() < self.max_nodes {
                slots.push(Slot {
                    gen: 0,
                    node: Some(entry),
                });
                return Ok(NodeId {
                    idx: (slots.len() - 1) as u32,
                    gen: 0,
                });
            }
        }

        for _ in 0..CACHE_EVICT_SWEEPS {
            if self.sieve_evict(false) {
                return self.place(entry);
            }
        }

        // Desperation: steal a clean node out from under shared references.
        let _guard = self.cannibalize_lock.lock();
        if self.sieve_evict(true) {
            self.stats.cannibalized.fetch_add(1, Ordering::Relaxed);
            return self.place(entry);
        }

        // Everything resident is locked or dirty; grow past the bound
        // rather than deadlock, and let future evictions shrink us back.
        warn!(max = self.max_nodes, "node cache over budget, growing");
        let mut slots = self.slots.write();
        slots.push(Slot {
            gen: 0,
            node: Some(entry),
        });
        Ok(NodeId {
            idx: (slots.len() - 1) as u32,
            gen: 0,
        })
    }

    /// One SIEVE hand sweep. In cannibalize mode the visited bit does not
    /// protect a victim; locks and dirt always do.
    fn sieve_evict(&self, cannibalize: bool) -> bool {
        let mut slots = self.slots.write();
        let n = slots.len();
        if n == 0 {
            return false;
        }
        let mut hand = self.hand.lock();

        for _ in 0..2 * n {
            let idx = *hand % n;
            *hand = (*hand + 1) % n;

            let Some(node) = slots[idx].node.as_ref() else {
                continue;
            };
            if node.lock.is_locked() {
                continue;
            }
            let dirty = match node.data.try_read() {
                Some(data) => data.dirty,
                None => true,
            };
            if dirty {
                continue;
            }
            if !cannibalize && node.visited.swap(false, Ordering::Relaxed) {
                continue;
            }

            let node = slots[idx].node.take().unwrap();
            slots[idx].gen = slots[idx].gen.wrapping_add(1);
            drop(slots);

            let loc = node.loc();
            self.index.write().remove(&loc);
            self.evicted
                .write()
                .insert(loc, node.sectors_written.load(Ordering::Relaxed));
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(?loc, cannibalize, "evicted btree node");
            return true;
        }
        false
    }

    /// Traverse to the node at `loc`, filling from `dev` on a miss.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_read(
        &self,
        dev: &dyn BlockDev,
        loc: DiskLoc,
        sector: u64,
        expect: (BtreeId, u8, u64),
        csum_type: ChecksumType,
        node_size: usize,
    ) -> Result<NodeId> {
        if self.retired.read().contains(&loc) {
            // The pointer that led here predates a COW rewrite.
            return Err(Error::Restart(RestartReason::LockNodeReused));
        }
        if let Some(id) = self.lookup(loc) {
            if let Ok(node) = self.node(id) {
                if node.seq.load(Ordering::Acquire) == expect.2 {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(id);
                }
                // Seq moved: the node was COW-rewritten after the caller
                // read its pointer. Retry against the updated parent.
                return Err(Error::Restart(RestartReason::LockNodeReused));
            }
        }

        let _fill = self.fill_lock.lock();
        // Re-check: another thread may have filled (or retired) while we
        // waited.
        if self.retired.read().contains(&loc) {
            return Err(Error::Restart(RestartReason::LockNodeReused));
        }
        if let Some(id) = self.lookup(loc) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        // Evicted nodes remember their written size; otherwise read the
        // whole node area.
        let read_bytes = match self.evicted.read().get(&loc) {
            Some(&sectors) => (sectors as usize * SECTOR_SIZE).min(node_size).max(SECTOR_SIZE),
            None => node_size,
        };
        let mut buf = vec![0u8; node_size];
        dev.read(sector, &mut buf[..read_bytes])?;

        let node = format::decode_node(&buf, csum_type, Some(expect))?;
        node.check_invariants()?;
        let sectors_written = format::peek_sectors_written(&buf)?;
        self.insert(node, loc, sectors_written)
    }

    /// Point the cache at a node's new COW location.
    pub fn relocate(&self, id: NodeId, new_loc: DiskLoc, new_seq: u64, sectors_written: u32) -> Result<()> {
        let node = self.node(id)?;
        let old = {
            let mut loc = node.loc.lock();
            let old = *loc;
            *loc = new_loc;
            old
        };
        // Poison the old location before unlinking it so no reader can
        // slip between and refill the stale image from disk.
        self.retired.write().insert(old);
        node.seq.store(new_seq, Ordering::Release);
        node.sectors_written.store(sectors_written, Ordering::Release);
        {
            let mut index = self.index.write();
            index.remove(&old);
            index.insert(new_loc, id);
        }
        Ok(())
    }

    /// Drop a retired node (after its replacement is journalled); the
    /// location stays poisoned until its bucket is reused for a new node.
    pub fn remove(&self, loc: DiskLoc) {
        self.retired.write().insert(loc);
        let id = self.index.write().remove(&loc);
        if let Some(id) = id {
            let mut slots = self.slots.write();
            if let Some(slot) = slots.get_mut(id.idx as usize) {
                if slot.gen == id.gen {
                    slot.node = None;
                    slot.gen = slot.gen.wrapping_add(1);
                }
            }
        }
        self.evicted.write().remove(&loc);
    }

    /// Ids of all resident dirty nodes, for the flush path.
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        let slots = self.slots.read();
        let mut out = Vec::new();
        for (idx, slot) in slots.iter().enumerate() {
            if let Some(node) = &slot.node {
                let dirty = node.data.try_read().map(|d| d.dirty).unwrap_or(true);
                if dirty {
                    out.push(NodeId {
                        idx: idx as u32,
                        gen: slot.gen,
                    });
                }
            }
        }
        out
    }
}
