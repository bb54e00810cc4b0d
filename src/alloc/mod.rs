//! # Bucket Allocator Interface
//!
//! The engine consumes space through three calls: `reservation_get` for
//! pre-commit accounting, `bucket_alloc` for COW node and extent placement,
//! and `bucket_release` when a bucket's last referent dies. Policy —
//! copygc, discard scheduling, reclaim ordering — lives outside the core;
//! what is here is the accounting the transaction engine depends on:
//!
//! - a **reservation** pins logical sectors (replica-multiplied) before a
//!   commit reaches its point of no return, and returns them on drop unless
//!   consumed;
//! - **writepoints** keep logically related writers on separate buckets so
//!   they do not interleave: each writepoint rotates devices and fills one
//!   open bucket at a time;
//! - a bucket referenced by a journal seq is **retired, not released**: it
//!   joins a queue keyed by that seq and is only returned to the free list
//!   once the journal reports the seq flushed.
//!
//! Bucket generations increment on every release so stale pointers into a
//! reused bucket are detectable by readers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::key::DataType;

/// Geometry of one member device, from the superblock members section.
#[derive(Debug, Clone, Copy)]
pub struct DevGeometry {
    pub nbuckets: u64,
    /// Buckets below this hold the superblock and layout; never allocated.
    pub first_bucket: u64,
    pub bucket_sectors: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketMeta {
    data_type: DataType,
    gen: u32,
    journal_seq: u64,
}

struct DevAlloc {
    geom: DevGeometry,
    meta: Mutex<Vec<BucketMeta>>,
    free: Mutex<VecDeque<u64>>,
}

/// One successful bucket allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketAlloc {
    pub dev: u32,
    pub bucket: u64,
    pub gen: u32,
}

/// Why a bucket came back; for tracing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Retired,
    Cached,
    Aborted,
}

/// Allocator hint grouping related writes. One per (thread, purpose).
#[derive(Debug, Default)]
pub struct WritePoint {
    next_dev: u32,
    /// Open bucket being filled by sub-bucket sector allocations.
    open: Option<(u32, u64, u32)>,
}

/// Pre-commit space reservation; returns unconsumed sectors on drop.
pub struct DiskReservation {
    alloc: Arc<Allocator>,
    sectors: u64,
}

impl std::fmt::Debug for DiskReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskReservation")
            .field("sectors", &self.sectors)
            .finish_non_exhaustive()
    }
}

impl DiskReservation {
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// Burn part of the reservation for sectors actually written.
    pub fn consume(&mut self, sectors: u64) -> Result<()> {
        if sectors > self.sectors {
            return Err(Error::NoSpace);
        }
        self.sectors -= sectors;
        Ok(())
    }
}

impl Drop for DiskReservation {
    fn drop(&mut self) {
        if self.sectors > 0 {
            self.alloc
                .sectors_free
                .fetch_add(self.sectors as i64, Ordering::AcqRel);
        }
    }
}

/// Process-wide allocator state.
pub struct Allocator {
    devs: Vec<DevAlloc>,
    sectors_free: AtomicI64,
    /// Buckets waiting for a journal seq to flush before reuse.
    retired: Mutex<Vec<(u32, u64, u64)>>,
}

impl Allocator {
    /// Fresh allocator with every allocatable bucket free. Mount-time
    /// reconstruction then marks live buckets via [`Allocator::mark_bucket`].
    pub fn new(geoms: &[DevGeometry]) -> Arc<Self> {
        let mut devs = Vec::with_capacity(geoms.len());
        let mut free_sectors = 0i64;
        for geom in geoms {
            let mut free = VecDeque::new();
            for bucket in geom.first_bucket..geom.nbuckets {
                free.push_back(bucket);
            }
            free_sectors += free.len() as i64 * geom.bucket_sectors as i64;
            let mut meta = vec![BucketMeta::default(); geom.nbuckets as usize];
            for slot in meta.iter_mut().take(geom.first_bucket as usize) {
                slot.data_type = DataType::Sb;
            }
            devs.push(DevAlloc {
                geom: *geom,
                meta: Mutex::new(meta),
                free: Mutex::new(free),
            });
        }
        Arc::new(Self {
            devs,
            sectors_free: AtomicI64::new(free_sectors),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn nr_devs(&self) -> usize {
        self.devs.len()
    }

    pub fn dev_geometry(&self, dev: u32) -> DevGeometry {
        self.devs[dev as usize].geom
    }

    pub fn sectors_free(&self) -> i64 {
        self.sectors_free.load(Ordering::Acquire)
    }

    /// Take `bucket` off the free list and stamp it, during mount-time
    /// reconstruction from the alloc tree.
    pub fn mark_bucket(&self, dev: u32, bucket: u64, data_type: DataType, gen: u32) {
        let d = &self.devs[dev as usize];
        {
            let mut meta = d.meta.lock();
            meta[bucket as usize] = BucketMeta {
                data_type,
                gen,
                journal_seq: 0,
            };
        }
        if data_type != DataType::Free {
            let mut free = d.free.lock();
            if let Some(pos) = free.iter().position(|&b| b == bucket) {
                free.remove(pos);
                self.sectors_free
                    .fetch_sub(d.geom.bucket_sectors as i64, Ordering::AcqRel);
            }
        }
    }

    pub fn bucket_meta(&self, dev: u32, bucket: u64) -> (DataType, u32, u64) {
        let meta = self.devs[dev as usize].meta.lock();
        let m = meta[bucket as usize];
        (m.data_type, m.gen, m.journal_seq)
    }

    /// Pin logical sectors before a commit. Replicas multiply the charge.
    pub fn reservation_get(self: &Arc<Self>, sectors: u64, replicas: u32) -> Result<DiskReservation> {
        let need = (sectors * replicas.max(1) as u64) as i64;
        let mut cur = self.sectors_free.load(Ordering::Acquire);
        loop {
            if cur < need {
                return Err(Error::NoSpace);
            }
            match self.sectors_free.compare_exchange_weak(
                cur,
                cur - need,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(DiskReservation {
                        alloc: Arc::clone(self),
                        sectors: need as u64,
                    })
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Obtain one whole bucket for `data_type`, rotating devices through the
    /// writepoint unless `dev_hint` pins one.
    pub fn bucket_alloc(
        &self,
        wp: &mut WritePoint,
        data_type: DataType,
        dev_hint: Option<u32>,
    ) -> Result<BucketAlloc> {
        let nr = self.devs.len() as u32;
        for attempt in 0..nr {
            let dev = match dev_hint {
                Some(d) => d,
                None => (wp.next_dev + attempt) % nr,
            };
            let da = &self.devs[dev as usize];
            let bucket = da.free.lock().pop_front();
            if let Some(bucket) = bucket {
                self.sectors_free
                    .fetch_sub(da.geom.bucket_sectors as i64, Ordering::AcqRel);
                let gen = {
                    let mut meta = da.meta.lock();
                    meta[bucket as usize].data_type = data_type;
                    meta[bucket as usize].gen
                };
                wp.next_dev = (dev + 1) % nr;
                debug!(dev, bucket, ty = data_type.as_str(), "allocated bucket");
                return Ok(BucketAlloc { dev, bucket, gen });
            }
            if dev_hint.is_some() {
                break;
            }
        }
        Err(Error::NoSpace)
    }

    /// Sub-bucket sector allocation for extent payloads; keeps one open
    /// bucket per writepoint so related writes stay contiguous.
    pub fn alloc_sectors(
        &self,
        wp: &mut WritePoint,
        sectors: u32,
        data_type: DataType,
    ) -> Result<(u32, u64, u32)> {
        if let Some((dev, bucket, used)) = wp.open {
            let cap = self.devs[dev as usize].geom.bucket_sectors;
            if used + sectors <= cap {
                wp.open = Some((dev, bucket, used + sectors));
                return Ok((dev, bucket, used));
            }
        }
        let fresh = self.bucket_alloc(wp, data_type, None)?;
        let cap = self.devs[fresh.dev as usize].geom.bucket_sectors;
        if sectors > cap {
            return Err(Error::NoSpace);
        }
        wp.open = Some((fresh.dev, fresh.bucket, sectors));
        Ok((fresh.dev, fresh.bucket, 0))
    }

    /// Return a bucket to the free pool immediately. Never fails.
    pub fn bucket_release(&self, dev: u32, bucket: u64, reason: ReleaseReason) {
        let da = &self.devs[dev as usize];
        {
            let mut meta = da.meta.lock();
            let m = &mut meta[bucket as usize];
            m.data_type = DataType::Free;
            m.gen = m.gen.wrapping_add(1);
            m.journal_seq = 0;
        }
        da.free.lock().push_back(bucket);
        self.sectors_free
            .fetch_add(da.geom.bucket_sectors as i64, Ordering::AcqRel);
        debug!(dev, bucket, ?reason, "released bucket");
    }

    /// Queue a bucket for release once `journal_seq` is flushed; until then
    /// a crash could still need its old contents on replay.
    pub fn retire_bucket(&self, dev: u32, bucket: u64, journal_seq: u64) {
        {
            let mut meta = self.devs[dev as usize].meta.lock();
            meta[bucket as usize].journal_seq = journal_seq;
        }
        self.retired.lock().push((dev, bucket, journal_seq));
    }

    /// Release every retired bucket whose journal seq is now durable.
    pub fn reap_retired(&self, flushed_seq: u64) {
        let ready: Vec<(u32, u64)> = {
            let mut retired = self.retired.lock();
            let (ready, keep): (Vec<_>, Vec<_>) =
                retired.drain(..).partition(|&(_, _, seq)| seq <= flushed_seq);
            *retired = keep;
            ready.into_iter().map(|(d, b, _)| (d, b)).collect()
        };
        for (dev, bucket) in ready {
            self.bucket_release(dev, bucket, ReleaseReason::Retired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_alloc() -> Arc<Allocator> {
        Allocator::new(&[DevGeometry {
            nbuckets: 8,
            first_bucket: 2,
            bucket_sectors: 8,
        }])
    }

    #[test]
    fn reservation_accounting_and_drop() {
        let alloc = small_alloc();
        let free0 = alloc.sectors_free();

        let mut res = alloc.reservation_get(10, 2).unwrap();
        assert_eq!(alloc.sectors_free(), free0 - 20);

        res.consume(8).unwrap();
        drop(res);
        // Consumed sectors stay gone; the rest returns.
        assert_eq!(alloc.sectors_free(), free0 - 8);
    }

    #[test]
    fn reservation_fails_on_no_space() {
        let alloc = small_alloc();
        let err = alloc.reservation_get(1 << 40, 1).unwrap_err();
        assert!(matches!(err, Error::NoSpace));
    }

    #[test]
    fn bucket_alloc_exhausts_then_fails() {
        let alloc = small_alloc();
        let mut wp = WritePoint::default();
        let mut got = Vec::new();
        while let Ok(b) = alloc.bucket_alloc(&mut wp, DataType::Btree, None) {
            got.push(b);
        }
        assert_eq!(got.len(), 6, "buckets 2..8 are allocatable");
        assert!(matches!(
            alloc.bucket_alloc(&mut wp, DataType::Btree, None),
            Err(Error::NoSpace)
        ));

        // Release one and allocation works again, with a bumped generation.
        let victim = got[0];
        alloc.bucket_release(victim.dev, victim.bucket, ReleaseReason::Aborted);
        let again = alloc.bucket_alloc(&mut wp, DataType::Btree, None).unwrap();
        assert_eq!(again.bucket, victim.bucket);
        assert_eq!(again.gen, victim.gen + 1);
    }

    #[test]
    fn retired_buckets_wait_for_flush() {
        let alloc = small_alloc();
        let mut wp = WritePoint::default();
        let b = alloc.bucket_alloc(&mut wp, DataType::Btree, None).unwrap();

        alloc.retire_bucket(b.dev, b.bucket, 5);
        alloc.reap_retired(4);
        let (ty, _, seq) = alloc.bucket_meta(b.dev, b.bucket);
        assert_eq!(ty, DataType::Btree, "not yet reusable");
        assert_eq!(seq, 5);

        alloc.reap_retired(5);
        let (ty, _, _) = alloc.bucket_meta(b.dev, b.bucket);
        assert_eq!(ty, DataType::Free);
    }

    #[test]
    fn writepoint_keeps_related_writes_contiguous() {
        let alloc = small_alloc();
        let mut wp = WritePoint::default();

        let (d1, b1, o1) = alloc.alloc_sectors(&mut wp, 3, DataType::User).unwrap();
        let (d2, b2, o2) = alloc.alloc_sectors(&mut wp, 3, DataType::User).unwrap();
        assert_eq!((d1, b1), (d2, b2), "same open bucket");
        assert_eq!(o1, 0);
        assert_eq!(o2, 3);

        // Overflow rolls to a fresh bucket.
        let (_, b3, o3) = alloc.alloc_sectors(&mut wp, 4, DataType::User).unwrap();
        assert_ne!(b3, b1);
        assert_eq!(o3, 0);
    }

    #[test]
    fn mark_bucket_removes_from_free_pool() {
        let alloc = small_alloc();
        let free0 = alloc.sectors_free();
        alloc.mark_bucket(0, 3, DataType::Journal, 7);
        assert_eq!(alloc.sectors_free(), free0 - 8);
        let (ty, gen, _) = alloc.bucket_meta(0, 3);
        assert_eq!(ty, DataType::Journal);
        assert_eq!(gen, 7);

        // The marked bucket is never handed out.
        let mut wp = WritePoint::default();
        while let Ok(b) = alloc.bucket_alloc(&mut wp, DataType::Btree, None) {
            assert_ne!(b.bucket, 3);
        }
    }
}
