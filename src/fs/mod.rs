//! # Filesystem Handle
//!
//! [`Fs`] is the process-wide state every transaction borrows: devices,
//! superblock, node cache, journal, allocator, snapshot table, key cache
//! and the btree roots. Nothing here hides behind module globals — a
//! handle is created by [`Fs::format`] or [`Fs::open`] and passed by
//! reference into every [`Trans`](crate::transaction::Trans).
//!
//! ## Lifecycle
//!
//! - **format** lays down the layout sector, superblock (with a clean
//!   section), journal buckets and one empty root leaf per tree.
//! - **open** reads the best superblock copy. A clean section installs the
//!   saved roots and skips replay; otherwise the journal buckets are
//!   scanned, the contiguous run of jsets is replayed through ordinary
//!   transactions, and the lost tail is blacklisted. Either way the mount
//!   finishes with a flush (all roots journaled) and a superblock rewrite
//!   *without* the clean section, so a crash from here is an unclean mount.
//! - **unmount** flushes and writes the clean section back.
//!
//! ## Flush
//!
//! Dirty nodes live only in the cache; crash consistency between flushes
//! is entirely the journal's. A flush rewrites every dirty node
//! copy-on-write bottom-up (children before parents, parents repointed in
//! memory), journals the new roots in one flush jset, advances the
//! journal's replay horizon, and releases retired buckets whose seqs are
//! now durable. The journal-reclaim restart funnels into the same path.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::WrapErr;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::alloc::{Allocator, DevGeometry, WritePoint};
use crate::codec::ChecksumType;
use crate::config::{CACHE_DEFAULT_NODES, JOURNAL_MIN_BUCKETS};
use crate::errors::{Error, RestartReason, Result, RESTART_REASONS};
use crate::io::{BlockDev, FileDev};
use crate::journal::entry::JEntry;
use crate::journal::{replay, Journal, JournalBucket};
use crate::key::bkey::{Alloc as AllocKey, BkeyVal, BtreePtr, Subvolume};
use crate::key::{Bkey, Bpos, BtreeId, DataType, ALL_BTREES, NR_BTREES, POS_MAX, POS_MIN};
use crate::node::cache::{DiskLoc, NodeCache};
use crate::node::{format as node_format, Node};
use crate::snapshots::Snapshots;
use crate::superblock::{
    self, CleanRoot, CleanSection, FsOpts, SbMember, SuperBlock,
};
use crate::transaction::commit::CommitFlags;
use crate::transaction::key_cache::KeyCache;
use crate::transaction::Trans;

/// Current root of one btree.
#[derive(Debug, Clone, Copy)]
pub struct RootEntry {
    pub ptr: BtreePtr,
    pub level: u8,
}

/// Monotonic event counters, surfaced for instrumentation and tests.
#[derive(Debug, Default)]
pub struct Counters {
    pub restarts: [AtomicU64; RESTART_REASONS.len()],
    pub commits: AtomicU64,
    pub splits: AtomicU64,
    pub compactions: AtomicU64,
    pub trans_created: AtomicU64,
}

impl Counters {
    pub fn note_restart(&self, reason: RestartReason) {
        self.restarts[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn restarts_total(&self) -> u64 {
        self.restarts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

/// What `open` had to do to bring the filesystem up.
#[derive(Debug, Clone, Default)]
pub struct RecoveryInfo {
    pub clean: bool,
    /// Seq range applied from the journal.
    pub replayed: Option<(u64, u64)>,
    /// Seq range lost and blacklisted.
    pub blacklisted: Option<(u64, u64)>,
}

/// Process-wide filesystem state.
pub struct Fs {
    devs: Vec<Arc<dyn BlockDev>>,
    sb: RwLock<SuperBlock>,
    pub(crate) cache: NodeCache,
    pub(crate) journal: Journal,
    pub(crate) alloc: Arc<Allocator>,
    pub snapshots: Snapshots,
    pub(crate) key_cache: KeyCache,
    roots: RwLock<[Option<RootEntry>; NR_BTREES]>,
    node_seq: AtomicU64,
    btree_wp: Mutex<WritePoint>,
    reclaim_lock: Mutex<()>,
    emergency_ro: AtomicBool,
    pub counters: Counters,
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs").finish_non_exhaustive()
    }
}

fn journal_bucket_count(nbuckets: u64) -> u64 {
    (nbuckets / 8).clamp(JOURNAL_MIN_BUCKETS as u64, 64)
}

impl Fs {
    // ------------------------------------------------------------------
    // Accessors used throughout the engine
    // ------------------------------------------------------------------

    pub fn opts(&self) -> FsOpts {
        self.sb.read().opts
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.sb.read().uuid
    }

    pub(crate) fn node_size(&self) -> usize {
        self.sb.read().opts.btree_node_size as usize
    }

    pub(crate) fn csum_type(&self) -> ChecksumType {
        self.sb.read().opts.csum_type
    }

    pub(crate) fn replicas(&self) -> u32 {
        self.sb.read().opts.replicas as u32
    }

    pub(crate) fn dev(&self, dev: u32) -> &dyn BlockDev {
        &*self.devs[dev as usize]
    }

    pub(crate) fn bucket_to_sector(&self, _dev: u32, bucket: u64) -> u64 {
        bucket * self.sb.read().opts.bucket_sectors() as u64
    }

    pub(crate) fn next_node_seq(&self) -> u64 {
        self.node_seq.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn root(&self, btree_id: BtreeId) -> RootEntry {
        self.roots.read()[btree_id as usize].expect("btree root missing")
    }

    pub(crate) fn set_root(&self, btree_id: BtreeId, ptr: BtreePtr, level: u8) {
        self.roots.write()[btree_id as usize] = Some(RootEntry { ptr, level });
    }

    pub fn is_emergency_ro(&self) -> bool {
        self.emergency_ro.load(Ordering::Acquire)
    }

    pub(crate) fn set_emergency_ro(&self) {
        if !self.emergency_ro.swap(true, Ordering::AcqRel) {
            warn!("filesystem entering emergency read-only mode");
        }
    }

    /// Journal seq of the last flush boundary.
    pub fn flushed_seq(&self) -> u64 {
        self.journal.flushed_seq()
    }

    // ------------------------------------------------------------------
    // Format
    // ------------------------------------------------------------------

    /// Create a new filesystem across `devs`.
    pub fn format(devs: Vec<Arc<dyn BlockDev>>, opts: FsOpts) -> Result<Fs> {
        opts.validate()?;
        if devs.is_empty() {
            return Err(Error::UnsupportedFeature("no devices".into()));
        }
        let bucket_sectors = opts.bucket_sectors();

        let mut members = Vec::new();
        let mut geoms = Vec::new();
        for dev in &devs {
            let nbuckets = dev.nr_sectors() / bucket_sectors as u64;
            if nbuckets < JOURNAL_MIN_BUCKETS as u64 + NR_BTREES as u64 + 2 {
                return Err(Error::UnsupportedFeature(format!(
                    "device too small: {nbuckets} buckets"
                )));
            }
            members.push(SbMember {
                uuid: superblock::generate_uuid(),
                nbuckets,
                first_bucket: 1,
                bucket_sectors,
            });
            geoms.push(DevGeometry {
                nbuckets,
                first_bucket: 1,
                bucket_sectors,
            });
        }

        let alloc = Allocator::new(&geoms);
        let nr_journal = journal_bucket_count(geoms[0].nbuckets);
        let journal_buckets: Vec<JournalBucket> = (0..nr_journal)
            .map(|i| JournalBucket {
                dev: 0,
                bucket: geoms[0].first_bucket + i,
            })
            .collect();
        for jb in &journal_buckets {
            alloc.mark_bucket(jb.dev, jb.bucket, DataType::Journal, 0);
        }

        let journal = Journal::new(
            devs.clone(),
            journal_buckets.clone(),
            bucket_sectors,
            opts.csum_type,
            1,
            Vec::new(),
        );

        let mut sb = SuperBlock::new(superblock::generate_uuid(), opts);
        sb.members = members;
        sb.journal = journal_buckets;

        let fs = Fs {
            devs,
            sb: RwLock::new(sb),
            cache: NodeCache::new(CACHE_DEFAULT_NODES),
            journal,
            alloc,
            snapshots: Snapshots::new(),
            key_cache: KeyCache::new(),
            roots: RwLock::new([None; NR_BTREES]),
            node_seq: AtomicU64::new(1),
            btree_wp: Mutex::new(WritePoint::default()),
            reclaim_lock: Mutex::new(()),
            emergency_ro: AtomicBool::new(false),
            counters: Counters::default(),
        };

        // One empty root leaf per tree.
        for btree_id in ALL_BTREES {
            let mut node = Node::empty_root(btree_id, fs.next_node_seq());
            let (loc, sectors) = fs.write_node(&mut node)?;
            let ptr = BtreePtr {
                dev: loc.dev,
                bucket: loc.bucket,
                seq: node.seq,
                sectors_written: sectors,
                min_key: POS_MIN,
            };
            node.dirty = false;
            fs.cache.insert(node, loc, sectors)?;
            fs.set_root(btree_id, ptr, 0);
        }

        // The initial snapshot and subvolume.
        let root_snap = fs.snapshots.create_root(1);
        let record = fs
            .snapshots
            .entry(root_snap)
            .expect("fresh snapshot exists")
            .record();
        Trans::run(&fs, |trans| {
            trans.btree_insert(
                BtreeId::Snapshots,
                Bkey::new(Bpos::new(0, root_snap as u64, 0), BkeyVal::Snapshot(record)),
            )?;
            trans.btree_insert(
                BtreeId::Subvolumes,
                Bkey::new(
                    Bpos::new(0, 1, 0),
                    BkeyVal::Subvolume(Subvolume {
                        root_inode: 4096,
                        snapshot: root_snap,
                        flags: 0,
                    }),
                ),
            )?;
            trans.commit(None, None, CommitFlags::default())
        })?;

        fs.flush()?;
        // The handle stays live, so the on-disk state is already unclean:
        // a crash from here recovers through the journal.
        fs.write_sb(false)?;
        info!(
            devices = fs.devs.len(),
            root_snapshot = root_snap,
            "filesystem formatted"
        );
        Ok(fs)
    }

    /// Create device files of `nr_sectors` each and format across them.
    /// The mount-boundary convenience over [`Fs::format`].
    pub fn format_path(paths: &[&Path], nr_sectors: u64, opts: FsOpts) -> eyre::Result<Fs> {
        let mut devs: Vec<Arc<dyn BlockDev>> = Vec::with_capacity(paths.len());
        for path in paths {
            let dev = FileDev::create(path, nr_sectors)
                .wrap_err_with(|| format!("creating device file {path:?}"))?;
            devs.push(Arc::new(dev));
        }
        Fs::format(devs, opts).wrap_err("formatting filesystem")
    }

    /// Open a filesystem from existing device files.
    pub fn open_path(paths: &[&Path]) -> eyre::Result<(Fs, RecoveryInfo)> {
        let mut devs: Vec<Arc<dyn BlockDev>> = Vec::with_capacity(paths.len());
        for path in paths {
            let dev = FileDev::open(path)
                .wrap_err_with(|| format!("opening device file {path:?}"))?;
            devs.push(Arc::new(dev));
        }
        Fs::open(devs).wrap_err("mounting filesystem")
    }

    // ------------------------------------------------------------------
    // Open / replay
    // ------------------------------------------------------------------

    /// Open an existing filesystem, replaying the journal if the last
    /// shutdown was not clean.
    pub fn open(devs: Vec<Arc<dyn BlockDev>>) -> Result<(Fs, RecoveryInfo)> {
        let sb = superblock::read_superblock(&*devs[0])?;
        if sb.members.len() != devs.len() {
            return Err(Error::UnsupportedFeature(format!(
                "superblock describes {} devices, {} provided",
                sb.members.len(),
                devs.len()
            )));
        }
        let opts = sb.opts;
        let bucket_sectors = opts.bucket_sectors();

        let geoms: Vec<DevGeometry> = sb
            .members
            .iter()
            .map(|m| DevGeometry {
                nbuckets: m.nbuckets,
                first_bucket: m.first_bucket,
                bucket_sectors: m.bucket_sectors,
            })
            .collect();
        let alloc = Allocator::new(&geoms);
        for jb in &sb.journal {
            alloc.mark_bucket(jb.dev, jb.bucket, DataType::Journal, 0);
        }

        let mut recovery = RecoveryInfo {
            clean: sb.clean.is_some(),
            ..RecoveryInfo::default()
        };

        let (journal, clean_roots, plan) = if let Some(clean) = &sb.clean {
            let journal = Journal::new(
                devs.clone(),
                sb.journal.clone(),
                bucket_sectors,
                opts.csum_type,
                clean.journal_seq + 1,
                sb.blacklist.clone(),
            );
            (journal, Some(clean.roots.clone()), None)
        } else {
            let scan = replay::scan_buckets(
                &devs,
                &sb.journal,
                bucket_sectors,
                opts.csum_type,
                &sb.blacklist,
            )?;
            let bucket_max_seq = scan.bucket_max_seq.clone();
            let write_head = scan.write_head;
            let max_seen = scan
                .corrupt
                .iter()
                .copied()
                .chain(scan.jsets.keys().copied())
                .max()
                .unwrap_or(0);
            let plan = replay::plan_replay(scan);
            let start = plan.applied_range().map(|(a, _)| a).unwrap_or(1);
            let journal = Journal::resume(
                devs.clone(),
                sb.journal.clone(),
                bucket_sectors,
                opts.csum_type,
                max_seen + 1,
                start,
                bucket_max_seq,
                write_head,
                sb.blacklist.clone(),
            );
            (journal, None, Some(plan))
        };

        let fs = Fs {
            devs,
            sb: RwLock::new(sb),
            cache: NodeCache::new(CACHE_DEFAULT_NODES),
            journal,
            alloc,
            snapshots: Snapshots::new(),
            key_cache: KeyCache::new(),
            roots: RwLock::new([None; NR_BTREES]),
            node_seq: AtomicU64::new(1),
            btree_wp: Mutex::new(WritePoint::default()),
            reclaim_lock: Mutex::new(()),
            emergency_ro: AtomicBool::new(false),
            counters: Counters::default(),
        };

        if let Some(roots) = clean_roots {
            for root in roots {
                let BkeyVal::BtreePtr(ptr) = root.ptr.val else {
                    return Err(Error::FatalCorruption(
                        "clean section root is not a btree pointer".into(),
                    ));
                };
                fs.set_root(root.btree_id, ptr, root.level);
            }
            fs.require_all_roots()?;
            info!("clean mount; journal replay skipped");
        } else {
            let plan = plan.expect("unclean mount has a replay plan");
            recovery.replayed = plan.applied_range();
            recovery.blacklisted = plan.blacklisted;
            if let Some((start, end)) = plan.blacklisted {
                fs.journal.add_blacklist(start, end);
                warn!(start, end, "mounting degraded: journal tail lost");
            }
            fs.premark_replay(&plan)?;
            fs.require_all_roots()?;
            fs.apply_replay(plan)?;
        }

        if recovery.clean {
            fs.mark_tree_buckets()?;
        }

        // Rebuild in-memory tables from the (replayed) trees.
        fs.rebuild_snapshots()?;
        fs.rebuild_alloc()?;

        // From here the filesystem is live: journal the roots and drop the
        // clean flag so a crash replays correctly.
        fs.flush()?;
        fs.write_sb(false)?;
        info!(clean = recovery.clean, "filesystem opened");
        Ok((fs, recovery))
    }

    /// Walk a subtree, stamping every node bucket as btree-owned so replay
    /// and fresh allocations can never clobber live nodes; returns the
    /// highest node seq seen so the seq counter can resume above it.
    fn mark_subtree(&self, btree_id: BtreeId, ptr: BtreePtr, level: u8) -> Result<u64> {
        self.alloc
            .mark_bucket(ptr.dev, ptr.bucket, DataType::Btree, 0);
        let loc = DiskLoc {
            dev: ptr.dev,
            bucket: ptr.bucket,
        };
        let id = self.cache.get_or_read(
            self.dev(ptr.dev),
            loc,
            self.bucket_to_sector(ptr.dev, ptr.bucket),
            (btree_id, level, ptr.seq),
            self.csum_type(),
            self.node_size(),
        )?;
        let node = self.cache.node(id)?;
        let mut max_seq = ptr.seq;
        if level > 0 {
            let children: Vec<BtreePtr> = {
                let data = node.data.read();
                let mut merge = data.merge_iter(data.min_key)?;
                let mut out = Vec::new();
                while let Some(key) = merge.next()? {
                    if let BkeyVal::BtreePtr(child) = key.val {
                        out.push(child);
                    }
                }
                out
            };
            for child in children {
                max_seq = max_seq.max(self.mark_subtree(btree_id, child, level - 1)?);
            }
        }
        Ok(max_seq)
    }

    fn note_node_seq_floor(&self, seen: u64) {
        self.node_seq.fetch_max(seen + 1, Ordering::AcqRel);
    }

    /// Clean-mount pass: mark every node bucket under the current roots.
    fn mark_tree_buckets(&self) -> Result<()> {
        let mut max_seq = 0;
        for btree_id in ALL_BTREES {
            let root = self.root(btree_id);
            max_seq = max_seq.max(self.mark_subtree(btree_id, root.ptr, root.level)?);
        }
        self.note_node_seq_floor(max_seq);
        Ok(())
    }

    /// Unclean-mount pass: install each tree's starting root (its first
    /// `btree_root` entry in the plan) and mark every node bucket any part
    /// of the plan references, including the children of mid-session
    /// splits, so replay-time allocation cannot reuse them.
    fn premark_replay(&self, plan: &replay::ReplayPlan) -> Result<()> {
        let mut max_seq = 0;
        for jset in &plan.to_apply {
            for entry in &jset.entries {
                match entry {
                    JEntry::BtreeRoot {
                        btree_id,
                        level,
                        ptr,
                    } => {
                        if let BkeyVal::BtreePtr(p) = &ptr.val {
                            if self.roots.read()[*btree_id as usize].is_none() {
                                self.set_root(*btree_id, *p, *level);
                            }
                            max_seq = max_seq.max(self.mark_subtree(*btree_id, *p, *level)?);
                        }
                    }
                    JEntry::BtreeKeys {
                        btree_id,
                        level,
                        keys,
                    } if *level > 0 => {
                        for key in keys {
                            if let BkeyVal::BtreePtr(p) = &key.val {
                                max_seq =
                                    max_seq.max(self.mark_subtree(*btree_id, *p, *level - 1)?);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        self.note_node_seq_floor(max_seq);
        Ok(())
    }

    fn require_all_roots(&self) -> Result<()> {
        let roots = self.roots.read();
        for btree_id in ALL_BTREES {
            if roots[btree_id as usize].is_none() {
                return Err(Error::FatalCorruption(format!(
                    "no root for {btree_id} after recovery"
                )));
            }
        }
        Ok(())
    }

    fn apply_replay(&self, plan: replay::ReplayPlan) -> Result<()> {
        for jset in plan.to_apply {
            for entry in jset.entries {
                match entry {
                    JEntry::BtreeRoot {
                        btree_id,
                        level,
                        ptr,
                    } => {
                        let BkeyVal::BtreePtr(p) = ptr.val else {
                            return Err(Error::FatalCorruption(
                                "btree_root entry is not a pointer".into(),
                            ));
                        };
                        self.set_root(btree_id, p, level);
                    }
                    JEntry::BtreeKeys {
                        btree_id,
                        level: 0,
                        keys,
                    } => {
                        // Bounded sub-commits keep the path array within
                        // its soft limit; a crash mid-way re-replays from
                        // the original jsets, so atomicity is preserved.
                        for chunk in keys.chunks(32) {
                            Trans::run(self, |trans| {
                                trans.bypass_key_cache = true;
                                for key in chunk {
                                    trans.btree_insert_raw(btree_id, key.clone())?;
                                }
                                trans.commit(None, None, CommitFlags::default())
                            })?;
                        }
                    }
                    JEntry::BtreeKeys { btree_id, level, .. } => {
                        // Interior updates journaled by splits; replay
                        // re-splits on its own, so these are stale.
                        debug!(%btree_id, level, "skipping interior replay entry");
                    }
                    JEntry::Blacklist { start, end } => {
                        self.journal.add_blacklist(start, end);
                    }
                    JEntry::Clock { .. } | JEntry::Usage { .. } => {}
                }
            }
        }
        Ok(())
    }

    fn rebuild_snapshots(&self) -> Result<()> {
        let records = Trans::run(self, |trans| {
            crate::transaction::collect_range(trans, BtreeId::Snapshots, POS_MIN, POS_MAX)
        })?;
        let mut table = Vec::new();
        for key in records {
            if let BkeyVal::Snapshot(rec) = key.val {
                table.push((key.pos.offset as u32, rec));
            }
        }
        if !table.is_empty() {
            self.snapshots.rebuild(table);
        }
        Ok(())
    }

    fn rebuild_alloc(&self) -> Result<()> {
        let keys = Trans::run(self, |trans| {
            trans.bypass_key_cache = true;
            crate::transaction::collect_range(trans, BtreeId::Alloc, POS_MIN, POS_MAX)
        })?;
        for key in keys {
            if let BkeyVal::Alloc(a) = key.val {
                if a.data_type != DataType::Free {
                    self.alloc
                        .mark_bucket(key.pos.inode as u32, key.pos.offset, a.data_type, a.gen);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node write-out (COW)
    // ------------------------------------------------------------------

    /// Write `node` to a fresh bucket, stamping the alloc record. The
    /// caller owns cache insertion / relocation.
    pub(crate) fn write_node(&self, node: &mut Node) -> Result<(DiskLoc, u32)> {
        let bucket = {
            let mut wp = self.btree_wp.lock();
            self.alloc.bucket_alloc(&mut wp, DataType::Btree, None)?
        };
        let bytes = node_format::encode_node(node, self.csum_type(), self.node_size())?;
        let loc = DiskLoc {
            dev: bucket.dev,
            bucket: bucket.bucket,
        };
        if let Err(err) = self
            .dev(bucket.dev)
            .write(self.bucket_to_sector(bucket.dev, bucket.bucket), &bytes)
        {
            self.set_emergency_ro();
            return Err(err);
        }
        let sectors = node_format::peek_sectors_written(&bytes)?;

        // One "as-of" seq for this write: the persisted reuse guard and the
        // key-cache flush ordering must agree.
        let seq = self.journal.next_seq();
        self.key_cache.insert_dirty(
            BtreeId::Alloc,
            Bkey::new(
                Bpos::new(bucket.dev as u64, bucket.bucket, 0),
                BkeyVal::Alloc(AllocKey {
                    gen: bucket.gen,
                    data_type: DataType::Btree,
                    dirty_sectors: sectors,
                    cached_sectors: 0,
                    journal_seq_nonempty: seq,
                }),
            ),
            seq,
        );
        Ok((loc, sectors))
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    /// Reclaim journal space: write out dirty nodes and advance the replay
    /// horizon. Invoked by the restart loop on `journal_reclaim`.
    pub(crate) fn journal_reclaim(&self) -> Result<()> {
        if let Some(_guard) = self.reclaim_lock.try_lock() {
            self.flush_nodes_and_roots()?;
        } else {
            // Someone else is already reclaiming; give them the cpu.
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Full flush: key cache into the trees, dirty nodes COW to disk, new
    /// roots journaled with a flush write. Returns the boundary seq.
    pub fn flush(&self) -> Result<u64> {
        self.flush_key_cache()?;
        let _guard = self.reclaim_lock.lock();
        self.flush_nodes_and_roots()
    }

    fn flush_key_cache(&self) -> Result<()> {
        let dirty = self.key_cache.take_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        for chunk in dirty.chunks(32) {
            Trans::run(self, |trans| {
                trans.bypass_key_cache = true;
                for (btree_id, key) in chunk {
                    trans.btree_insert_raw(*btree_id, key.clone())?;
                }
                trans.commit(None, None, CommitFlags::default())
            })?;
        }
        Ok(())
    }

    fn flush_nodes_and_roots(&self) -> Result<u64> {
        let mut entries: Vec<JEntry> = Vec::new();
        for btree_id in ALL_BTREES {
            let root = self.root(btree_id);
            let loc = DiskLoc {
                dev: root.ptr.dev,
                bucket: root.ptr.bucket,
            };
            let (new_ptr, _) = self.rewrite_subtree(btree_id, root.ptr, root.level, loc)?;
            if new_ptr != root.ptr {
                self.set_root(btree_id, new_ptr, root.level);
            }
            entries.push(JEntry::BtreeRoot {
                btree_id,
                level: root.level,
                ptr: Bkey::new(POS_MAX, BkeyVal::BtreePtr(new_ptr)),
            });
        }

        // Every seq so far is now captured in written-out nodes, so the
        // replay horizon can move before the roots jset: that frees ring
        // space for the jset itself when reclaim runs on a full ring.
        self.journal.set_last_seq(self.journal.next_seq());

        let u64s: usize = entries.iter().map(|e| e.u64s()).sum();
        let seq = self
            .journal
            .reserve(u64s)
            .and_then(|res| self.journal.append_and_write(res, entries, true))
            .map_err(|err| {
                if err.is_restart() {
                    // The ring is wedged with every bucket still live; that
                    // is an unrecoverable sizing failure, not a retry.
                    Error::NoSpace
                } else {
                    err
                }
            })?;

        self.journal.set_last_seq(seq);
        self.alloc.reap_retired(self.journal.flushed_seq());
        debug!(seq, "flush complete");
        Ok(seq)
    }

    /// Post-order COW rewrite of every dirty node under `ptr`.
    fn rewrite_subtree(
        &self,
        btree_id: BtreeId,
        ptr: BtreePtr,
        level: u8,
        loc: DiskLoc,
    ) -> Result<(BtreePtr, bool)> {
        let id = self.cache.get_or_read(
            self.dev(ptr.dev),
            loc,
            self.bucket_to_sector(ptr.dev, ptr.bucket),
            (btree_id, level, ptr.seq),
            self.csum_type(),
            self.node_size(),
        )?;
        let node = self.cache.node(id)?;

        // Blocking-in-order intent acquisition: flush descends top-down.
        while !node.lock.try_lock_intent() {
            std::thread::yield_now();
        }

        let result = self.rewrite_subtree_locked(btree_id, ptr, level, loc, id, &node);
        node.lock.unlock_intent();
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn rewrite_subtree_locked(
        &self,
        btree_id: BtreeId,
        ptr: BtreePtr,
        level: u8,
        old_loc: DiskLoc,
        id: crate::node::cache::NodeId,
        node: &Arc<crate::node::cache::CachedNode>,
    ) -> Result<(BtreePtr, bool)> {
        // Children first.
        if level > 0 {
            let children: Vec<(Bpos, BtreePtr)> = {
                let data = node.data.read();
                let mut merge = data.merge_iter(data.min_key)?;
                let mut out = Vec::new();
                while let Some(key) = merge.next()? {
                    if let BkeyVal::BtreePtr(child) = key.val {
                        out.push((key.pos, child));
                    }
                }
                out
            };
            for (pos, child) in children {
                let child_loc = DiskLoc {
                    dev: child.dev,
                    bucket: child.bucket,
                };
                let (new_child, changed) =
                    self.rewrite_subtree(btree_id, child, level - 1, child_loc)?;
                if changed {
                    node.lock.lock_write();
                    let res = node
                        .data
                        .write()
                        .insert(&Bkey::new(pos, BkeyVal::BtreePtr(new_child)));
                    node.lock.unlock_write();
                    res?;
                }
            }
        }

        let dirty = node.data.read().dirty;
        if !dirty {
            return Ok((ptr, false));
        }

        node.lock.lock_write();
        let rewritten = (|| {
            let mut data = node.data.write();
            data.compact()?;
            data.seq = self.next_node_seq();
            let (loc, sectors) = self.write_node(&mut data)?;
            data.dirty = false;
            Ok::<_, Error>((loc, sectors, data.seq, data.min_key))
        })();
        let (new_loc, sectors, new_seq, min_key) = match rewritten {
            Ok(v) => v,
            Err(err) => {
                node.lock.unlock_write();
                return Err(err);
            }
        };
        if let Err(err) = self.cache.relocate(id, new_loc, new_seq, sectors) {
            node.lock.unlock_write();
            return Err(err);
        }
        node.lock.unlock_write();

        let retire_seq = node
            .journal_seq
            .load(Ordering::Acquire)
            .max(self.journal.next_seq());
        self.alloc.retire_bucket(old_loc.dev, old_loc.bucket, retire_seq);

        Ok((
            BtreePtr {
                dev: new_loc.dev,
                bucket: new_loc.bucket,
                seq: new_seq,
                sectors_written: sectors,
                min_key,
            },
            true,
        ))
    }

    // ------------------------------------------------------------------
    // Durability and shutdown
    // ------------------------------------------------------------------

    /// Wait until journal seq `seq` is durable; the engine side of fsync.
    pub fn fsync(&self, seq: u64) -> Result<()> {
        self.journal.flush_seq(seq)?;
        self.alloc.reap_retired(self.journal.flushed_seq());
        Ok(())
    }

    /// Clean shutdown: flush everything and write the clean section so the
    /// next mount skips replay.
    pub fn unmount(self) -> Result<()> {
        self.flush()?;
        self.write_sb(true)?;
        info!("unmounted clean");
        Ok(())
    }

    fn write_sb(&self, clean: bool) -> Result<()> {
        let mut sb = self.sb.write();
        sb.seq += 1;
        sb.blacklist = self.journal.blacklist();
        sb.clean = if clean {
            let roots = self.roots.read();
            Some(CleanSection {
                journal_seq: self.journal.flushed_seq(),
                roots: ALL_BTREES
                    .iter()
                    .map(|&btree_id| {
                        let root = roots[btree_id as usize].expect("root present");
                        CleanRoot {
                            btree_id,
                            level: root.level,
                            ptr: Bkey::new(POS_MAX, BkeyVal::BtreePtr(root.ptr)),
                        }
                    })
                    .collect(),
            })
        } else {
            None
        };
        for dev in &self.devs {
            superblock::write_superblock(&**dev, &sb)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Snapshot ID of the initial subvolume; fresh writes target it.
    pub fn main_snapshot(&self) -> Result<u32> {
        Trans::run(self, |trans| {
            match trans.btree_lookup(BtreeId::Subvolumes, Bpos::new(0, 1, 0))? {
                Some(key) => match key.val {
                    BkeyVal::Subvolume(s) => Ok(s.snapshot),
                    _ => Err(Error::Enoent),
                },
                None => Err(Error::Enoent),
            }
        })
    }

    /// Create a snapshot as a child of `parent`, persisting both records.
    pub fn create_snapshot(&self, parent: u32) -> Result<u32> {
        let child = self.snapshots.create_child(parent, 1)?;
        let parent_rec = self.snapshots.entry(parent).expect("parent exists").record();
        let child_rec = self.snapshots.entry(child).expect("child exists").record();
        Trans::run(self, |trans| {
            trans.btree_insert(
                BtreeId::Snapshots,
                Bkey::new(Bpos::new(0, parent as u64, 0), BkeyVal::Snapshot(parent_rec)),
            )?;
            trans.btree_insert(
                BtreeId::Snapshots,
                Bkey::new(Bpos::new(0, child as u64, 0), BkeyVal::Snapshot(child_rec)),
            )?;
            trans.commit(None, None, CommitFlags::default())
        })?;
        Ok(child)
    }
}
