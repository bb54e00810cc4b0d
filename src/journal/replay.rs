//! # Journal Scan and Replay Planning
//!
//! On an unclean mount the journal buckets are scanned for jsets. Each
//! bucket is read from its start: valid jsets are collected, a jset whose
//! magic matches but whose checksum does not is recorded as corrupt and
//! skipped by its claimed length, and the first sector without magic ends
//! that bucket's run.
//!
//! The replay plan is then:
//!
//! 1. start from the `last_seq` of the newest valid jset — everything older
//!    is already captured in written-out btree nodes;
//! 2. walk seqs upward while each is present and valid;
//! 3. at the first gap (missing or corrupt seq), stop and blacklist every
//!    seq from the gap to the highest seq observed anywhere — those writes
//!    may exist but can no longer be trusted to be ordered.
//!
//! Application of the planned jsets to the trees is the filesystem's job;
//! this module only decides *what* to apply.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::ChecksumType;
use crate::config::SECTOR_SIZE;
use crate::errors::Result;
use crate::io::BlockDev;
use crate::journal::entry::{decode_jset, Jset, JsetDecode};
use crate::journal::JournalBucket;

/// Everything found by scanning the journal buckets.
#[derive(Debug, Default)]
pub struct JournalScan {
    pub jsets: BTreeMap<u64, Jset>,
    pub corrupt: Vec<u64>,
    /// Highest seq found in each scanned bucket, by bucket-list index.
    pub bucket_max_seq: Vec<u64>,
    /// Ring position just past the newest jset: `(bucket index, sector
    /// offset)`. New writes resume here so unreplayed jsets survive a
    /// crash during recovery.
    pub write_head: Option<(usize, u64)>,
}

/// The decision of what to replay.
#[derive(Debug, Default)]
pub struct ReplayPlan {
    /// Jsets to apply, ascending and contiguous in seq.
    pub to_apply: Vec<Jset>,
    /// Seq range lost to the gap, inclusive, if any.
    pub blacklisted: Option<(u64, u64)>,
}

impl ReplayPlan {
    pub fn applied_range(&self) -> Option<(u64, u64)> {
        match (self.to_apply.first(), self.to_apply.last()) {
            (Some(a), Some(b)) => Some((a.seq, b.seq)),
            _ => None,
        }
    }
}

fn blacklisted(blacklist: &[(u64, u64)], seq: u64) -> bool {
    blacklist.iter().any(|&(s, e)| s <= seq && seq <= e)
}

/// Scan every journal bucket for jsets.
pub fn scan_buckets(
    devs: &[Arc<dyn BlockDev>],
    buckets: &[JournalBucket],
    bucket_sectors: u32,
    csum_type: ChecksumType,
    blacklist: &[(u64, u64)],
) -> Result<JournalScan> {
    let mut scan = JournalScan::default();
    scan.bucket_max_seq = vec![0; buckets.len()];
    let mut newest_seq = 0u64;

    for (bucket_idx, slot) in buckets.iter().enumerate() {
        let mut buf = vec![0u8; bucket_sectors as usize * SECTOR_SIZE];
        devs[slot.dev as usize].read(slot.bucket * bucket_sectors as u64, &mut buf)?;

        let mut offset = 0usize;
        while offset < buf.len() {
            match decode_jset(&buf[offset..], csum_type)? {
                JsetDecode::Valid { jset, sectors } => {
                    offset += sectors as usize * SECTOR_SIZE;
                    let max = &mut scan.bucket_max_seq[bucket_idx];
                    *max = (*max).max(jset.seq);
                    if jset.seq > newest_seq {
                        newest_seq = jset.seq;
                        scan.write_head =
                            Some((bucket_idx, (offset / SECTOR_SIZE) as u64));
                    }
                    if blacklisted(blacklist, jset.seq) {
                        warn!(seq = jset.seq, "skipping blacklisted jset");
                        continue;
                    }
                    scan.jsets.entry(jset.seq).or_insert(jset);
                }
                JsetDecode::Corrupt { seq, sectors } => {
                    warn!(seq, "corrupt jset in journal scan");
                    scan.corrupt.push(seq);
                    let skip = (sectors as usize * SECTOR_SIZE).max(SECTOR_SIZE);
                    if offset + skip > buf.len() {
                        break;
                    }
                    offset += skip;
                }
                JsetDecode::NoMagic => break,
            }
        }
    }
    Ok(scan)
}

/// Choose the contiguous run to apply and the range to blacklist.
pub fn plan_replay(scan: JournalScan) -> ReplayPlan {
    let Some((&newest_seq, newest)) = scan.jsets.iter().next_back() else {
        return ReplayPlan::default();
    };

    let start = newest.last_seq.min(newest_seq).max(1);
    let max_seen = scan
        .corrupt
        .iter()
        .copied()
        .chain(scan.jsets.keys().copied())
        .max()
        .unwrap_or(newest_seq);

    let mut jsets = scan.jsets;
    let mut to_apply = Vec::new();
    let mut seq = start;
    while let Some(jset) = jsets.remove(&seq) {
        to_apply.push(jset);
        seq += 1;
    }

    let blacklisted = if seq <= max_seen {
        warn!(
            from = seq,
            to = max_seen,
            "journal gap: blacklisting tail seqs"
        );
        Some((seq, max_seen))
    } else {
        None
    };

    info!(
        applied = to_apply.len(),
        start,
        end = seq.saturating_sub(1),
        "journal replay planned"
    );
    ReplayPlan {
        to_apply,
        blacklisted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDev;
    use crate::journal::entry::{encode_jset, JEntry};
    use crate::journal::Journal;
    use crate::key::bkey::BkeyVal;
    use crate::key::{Bkey, Bpos, BtreeId};

    fn write_seqs(seqs: std::ops::RangeInclusive<u64>) -> (Arc<MemDev>, Vec<JournalBucket>, u32) {
        let bucket_sectors = 64u32;
        let dev = MemDev::new(4 * bucket_sectors as u64);
        let buckets: Vec<JournalBucket> = (0..4u64)
            .map(|bucket| JournalBucket { dev: 0, bucket })
            .collect();
        let journal = Journal::new(
            vec![dev.clone() as Arc<dyn BlockDev>],
            buckets.clone(),
            bucket_sectors,
            ChecksumType::Crc64,
            *seqs.start(),
            Vec::new(),
        );
        for seq in seqs {
            let entries = vec![JEntry::BtreeKeys {
                btree_id: BtreeId::Inodes,
                level: 0,
                keys: vec![Bkey::new(Bpos::new(seq, 0, 0), BkeyVal::Deleted)],
            }];
            let u64s = entries.iter().map(|e| e.u64s()).sum();
            let res = journal.reserve(u64s).unwrap();
            assert_eq!(journal.append_and_write(res, entries, false).unwrap(), seq);
        }
        (dev, buckets, bucket_sectors)
    }

    fn scan(
        dev: &Arc<MemDev>,
        buckets: &[JournalBucket],
        bucket_sectors: u32,
    ) -> JournalScan {
        let devs: Vec<Arc<dyn BlockDev>> = vec![dev.clone()];
        scan_buckets(&devs, buckets, bucket_sectors, ChecksumType::Crc64, &[]).unwrap()
    }

    #[test]
    fn clean_scan_plans_everything() {
        let (dev, buckets, bucket_sectors) = write_seqs(1..=20);
        let plan = plan_replay(scan(&dev, &buckets, bucket_sectors));
        assert_eq!(plan.applied_range(), Some((1, 20)));
        assert!(plan.blacklisted.is_none());
    }

    #[test]
    fn corrupt_mid_run_blacklists_the_tail() {
        let (dev, buckets, bucket_sectors) = write_seqs(1..=100);

        // Find seq 73 and flip a payload byte.
        let devs: Vec<Arc<dyn BlockDev>> = vec![dev.clone()];
        let clean = scan_buckets(&devs, &buckets, bucket_sectors, ChecksumType::Crc64, &[]).unwrap();
        assert!(clean.jsets.contains_key(&73));

        // Locate it on disk by re-walking the buckets.
        'outer: for slot in &buckets {
            let mut buf = vec![0u8; bucket_sectors as usize * SECTOR_SIZE];
            dev.read(slot.bucket * bucket_sectors as u64, &mut buf).unwrap();
            let mut offset = 0usize;
            while offset < buf.len() {
                match decode_jset(&buf[offset..], ChecksumType::Crc64).unwrap() {
                    JsetDecode::Valid { jset, sectors } => {
                        if jset.seq == 73 {
                            let sector =
                                slot.bucket * bucket_sectors as u64 + (offset / SECTOR_SIZE) as u64;
                            dev.corrupt(sector, crate::journal::entry::JSET_HEADER_SIZE + 1);
                            break 'outer;
                        }
                        offset += sectors as usize * SECTOR_SIZE;
                    }
                    _ => break,
                }
            }
        }

        let plan = plan_replay(scan(&dev, &buckets, bucket_sectors));
        assert_eq!(plan.applied_range(), Some((1, 72)));
        assert_eq!(plan.blacklisted, Some((73, 100)));
    }

    #[test]
    fn last_seq_bounds_replay_start() {
        let bucket_sectors = 64u32;
        let dev = MemDev::new(4 * bucket_sectors as u64);
        let buckets: Vec<JournalBucket> = (0..4u64)
            .map(|bucket| JournalBucket { dev: 0, bucket })
            .collect();

        // Hand-write seqs 5..=9 whose last_seq claims 7: replay must start
        // at 7 even though 5 and 6 are present.
        let mut sector = 0u64;
        for seq in 5..=9u64 {
            let jset = Jset {
                seq,
                last_seq: 7,
                flush: false,
                entries: Vec::new(),
            };
            let bytes = encode_jset(&jset, ChecksumType::Crc64);
            dev.write(sector, &bytes).unwrap();
            sector += (bytes.len() / SECTOR_SIZE) as u64;
        }

        let plan = plan_replay(scan(&dev, &buckets, bucket_sectors));
        assert_eq!(plan.applied_range(), Some((7, 9)));
        assert!(plan.blacklisted.is_none());
    }

    #[test]
    fn empty_journal_plans_nothing() {
        let bucket_sectors = 16u32;
        let dev = MemDev::new(64);
        let buckets = vec![JournalBucket { dev: 0, bucket: 0 }];
        let plan = plan_replay(scan(&dev, &buckets, bucket_sectors));
        assert!(plan.to_apply.is_empty());
        assert!(plan.blacklisted.is_none());
    }
}
