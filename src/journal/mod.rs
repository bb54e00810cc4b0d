//! # Journal
//!
//! The append-only record that makes commits atomic and ordered. Every
//! commit writes one jset carrying its keys (and any root updates produced
//! by splits); on an unclean mount, replaying jsets in seq order from the
//! newest write's `last_seq` reconstructs every tree exactly.
//!
//! ## Sequences
//!
//! Seqs are assigned monotonically, one per commit, and land on disk
//! gap-free; a gap after a crash is closed by blacklisting the tail (see
//! [`replay`]). `last_seq` is the oldest seq replay still needs: it advances
//! when dirty nodes are written out, and journal buckets whose newest jset
//! is older than `last_seq` become reusable.
//!
//! ## Flush vs noflush
//!
//! Commits write *noflush* jsets: ordered, but not durable. Durability is a
//! separate boundary: [`Journal::flush_seq`] fences the devices and
//! advances `flushed_seq`, and `fsync` maps onto it. Buckets retired by COW
//! cannot be reused until the seq that retired them is flushed — the
//! allocator holds them back against `flushed_seq`.
//!
//! ## Reservation protocol
//!
//! A commit first obtains a [`JournalRes`] sized in u64 words (capacity
//! check; a full ring surfaces as a `journal_reclaim` restart), then hands
//! it back with the actual entries. The reservation bounds the append: by
//! the time node mutation starts, journal space can no longer fail.

pub mod entry;
pub mod replay;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::codec::ChecksumType;
use crate::config::{JOURNAL_BUF_U64S, JOURNAL_ENTRY_MAX_U64S, SECTOR_SIZE};
use crate::errors::{Error, RestartReason, Result};
use crate::io::BlockDev;
use entry::{encode_jset, JEntry, Jset, JSET_HEADER_SIZE};

/// A journal bucket: device index and bucket number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalBucket {
    pub dev: u32,
    pub bucket: u64,
}

/// Capacity reservation for one commit's journal entry.
#[derive(Debug)]
pub struct JournalRes {
    u64s: usize,
}

impl JournalRes {
    pub fn u64s(&self) -> usize {
        self.u64s
    }
}

#[derive(Debug, Default)]
pub struct JournalStats {
    pub writes: AtomicU64,
    pub flushes: AtomicU64,
    pub reclaim_restarts: AtomicU64,
}

struct JournalInner {
    /// Seq the next write will carry.
    cur_seq: u64,
    /// Oldest seq replay still needs.
    last_seq: u64,
    /// Highest seq written to the ring.
    written_seq: u64,
    ring_idx: usize,
    ring_offset: u64,
    /// Highest seq each ring bucket holds.
    bucket_max_seq: Vec<u64>,
    /// Blacklist ranges to persist in the next jset.
    pending_blacklist: Vec<(u64, u64)>,
    blacklist: Vec<(u64, u64)>,
}

/// Process-wide journal state.
pub struct Journal {
    devs: Vec<Arc<dyn BlockDev>>,
    buckets: Vec<JournalBucket>,
    bucket_sectors: u32,
    csum_type: ChecksumType,
    inner: Mutex<JournalInner>,
    flushed_seq: AtomicU64,
    pub stats: JournalStats,
}

impl Journal {
    pub fn new(
        devs: Vec<Arc<dyn BlockDev>>,
        buckets: Vec<JournalBucket>,
        bucket_sectors: u32,
        csum_type: ChecksumType,
        start_seq: u64,
        blacklist: Vec<(u64, u64)>,
    ) -> Self {
        let nr = buckets.len();
        Self {
            devs,
            buckets,
            bucket_sectors,
            csum_type,
            inner: Mutex::new(JournalInner {
                cur_seq: start_seq,
                last_seq: start_seq,
                written_seq: start_seq.saturating_sub(1),
                ring_idx: 0,
                ring_offset: 0,
                bucket_max_seq: vec![0; nr],
                pending_blacklist: Vec::new(),
                blacklist,
            }),
            flushed_seq: AtomicU64::new(start_seq.saturating_sub(1)),
            stats: JournalStats::default(),
        }
    }

    /// Reconstruct journal state after a scan: seqs continue past the
    /// newest entry and the write head resumes just after it, so jsets the
    /// replay still needs are not overwritten while it runs.
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        devs: Vec<Arc<dyn BlockDev>>,
        buckets: Vec<JournalBucket>,
        bucket_sectors: u32,
        csum_type: ChecksumType,
        start_seq: u64,
        last_seq: u64,
        bucket_max_seq: Vec<u64>,
        write_head: Option<(usize, u64)>,
        blacklist: Vec<(u64, u64)>,
    ) -> Self {
        let journal = Self::new(devs, buckets, bucket_sectors, csum_type, start_seq, blacklist);
        {
            let mut inner = journal.inner.lock();
            inner.last_seq = last_seq.max(1);
            if !bucket_max_seq.is_empty() {
                inner.bucket_max_seq = bucket_max_seq;
            }
            if let Some((idx, offset)) = write_head {
                inner.ring_idx = idx;
                inner.ring_offset = offset;
            }
        }
        journal
    }

    pub fn flushed_seq(&self) -> u64 {
        self.flushed_seq.load(Ordering::Acquire)
    }

    pub fn next_seq(&self) -> u64 {
        self.inner.lock().cur_seq
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().last_seq
    }

    pub fn blacklist(&self) -> Vec<(u64, u64)> {
        self.inner.lock().blacklist.clone()
    }

    /// Record seqs lost in a crash; persisted in the superblock and in the
    /// next jset so a second crash still knows about them.
    pub fn add_blacklist(&self, start: u64, end: u64) {
        let mut inner = self.inner.lock();
        inner.blacklist.push((start, end));
        inner.pending_blacklist.push((start, end));
    }

    /// Size check and ring-capacity probe for one commit's entry set.
    pub fn reserve(&self, u64s: usize) -> Result<JournalRes> {
        if u64s > JOURNAL_ENTRY_MAX_U64S {
            return Err(Error::UnsupportedFeature(format!(
                "journal reservation of {u64s} u64s exceeds the per-entry bound"
            )));
        }
        debug_assert!(u64s <= JOURNAL_BUF_U64S);

        let inner = self.inner.lock();
        let sectors = jset_sectors(u64s);
        if !self.ring_has_room(&inner, sectors) {
            self.stats.reclaim_restarts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Restart(RestartReason::JournalReclaim));
        }
        Ok(JournalRes { u64s })
    }

    fn ring_has_room(&self, inner: &JournalInner, sectors: u64) -> bool {
        if self.bucket_sectors as u64 - inner.ring_offset >= sectors {
            return true;
        }
        let next = (inner.ring_idx + 1) % self.buckets.len();
        inner.bucket_max_seq[next] < inner.last_seq
    }

    /// Write one commit's jset. Consumes the reservation; fails only with a
    /// restart (ring filled since the reservation) before touching the
    /// device, or an I/O error from the device itself.
    pub fn append_and_write(
        &self,
        res: JournalRes,
        mut entries: Vec<JEntry>,
        flush: bool,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();

        let actual: usize = entries.iter().map(|e| e.u64s()).sum();
        debug_assert!(
            actual <= res.u64s,
            "journal entries grew past their reservation: {actual} > {}",
            res.u64s
        );

        for (start, end) in std::mem::take(&mut inner.pending_blacklist) {
            entries.push(JEntry::Blacklist { start, end });
        }

        let jset = Jset {
            seq: inner.cur_seq,
            last_seq: inner.last_seq,
            flush,
            entries,
        };
        let bytes = encode_jset(&jset, self.csum_type);
        let sectors = (bytes.len() / SECTOR_SIZE) as u64;
        if sectors > self.bucket_sectors as u64 {
            return Err(Error::UnsupportedFeature(
                "jset larger than a journal bucket".into(),
            ));
        }

        if self.bucket_sectors as u64 - inner.ring_offset < sectors {
            let next = (inner.ring_idx + 1) % self.buckets.len();
            if inner.bucket_max_seq[next] >= inner.last_seq {
                // Every bucket still holds live seqs; caller must reclaim.
                self.stats.reclaim_restarts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Restart(RestartReason::JournalReclaim));
            }
            inner.ring_idx = next;
            inner.ring_offset = 0;
        }

        let slot = self.buckets[inner.ring_idx];
        let sector = slot.bucket * self.bucket_sectors as u64 + inner.ring_offset;
        self.devs[slot.dev as usize].write(sector, &bytes)?;

        inner.ring_offset += sectors;
        let ring_idx = inner.ring_idx;
        inner.bucket_max_seq[ring_idx] = jset.seq;
        inner.written_seq = jset.seq;
        inner.cur_seq += 1;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        debug!(seq = jset.seq, sectors, flush, "journal write");

        if flush {
            for dev in &self.devs {
                dev.flush()?;
            }
            self.flushed_seq.store(jset.seq, Ordering::Release);
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(jset.seq)
    }

    /// Durability fence: make every seq up to `target` flushed. The backing
    /// store of `fsync`.
    pub fn flush_seq(&self, target: u64) -> Result<()> {
        if self.flushed_seq() >= target {
            return Ok(());
        }
        let inner = self.inner.lock();
        if inner.written_seq < target {
            return Err(Error::FatalCorruption(format!(
                "flush of seq {target} which was never written (written {})",
                inner.written_seq
            )));
        }
        for dev in &self.devs {
            dev.flush()?;
        }
        self.flushed_seq
            .fetch_max(inner.written_seq, Ordering::AcqRel);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        info!(seq = inner.written_seq, "journal flushed");
        Ok(())
    }

    /// Advance the replay horizon after dirty nodes (and their new roots)
    /// are safely on disk; frees ring buckets older than `seq`.
    pub fn set_last_seq(&self, seq: u64) {
        let mut inner = self.inner.lock();
        debug_assert!(seq <= inner.cur_seq);
        if seq > inner.last_seq {
            inner.last_seq = seq;
        }
    }
}

fn jset_sectors(u64s: usize) -> u64 {
    (JSET_HEADER_SIZE + u64s * 8).div_ceil(SECTOR_SIZE) as u64
}
