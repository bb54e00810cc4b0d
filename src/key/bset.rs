//! # Bsets: Sorted Key Runs
//!
//! A bset is a sorted run of encoded keys sharing one packing format. Nodes
//! are log-structured: the first bset is the large sorted result of the last
//! compaction, later bsets are small append-only runs of recent updates.
//! Readers merge them (see [`merge`](crate::key::merge)); writers only ever
//! append to the newest bset.
//!
//! ## Search index
//!
//! Each bset carries an auxiliary search tree laid out in eytzinger order
//! over 32-bit compressed position prefixes. Lookup descends the implicit
//! tree comparing prefixes only — no key decoding, cache-friendly — and then
//! resolves the exact boundary with a short forward scan that decodes at
//! most the run of keys sharing the boundary prefix.
//!
//! The prefix window is chosen per bset: the 32 bits starting at the highest
//! bit in which the bset's min and max positions differ. When adjacent keys
//! share a prefix the index cannot discriminate between them; such entries
//! are counted as *failed* and lookups degrade to the linear tail scan.
//! Correctness is unaffected; a bset whose keys all collide simply searches
//! linearly.
//!
//! ## Ordering invariant
//!
//! Keys within a bset are strictly sorted by `(position, version)`; `append`
//! rejects violations as corruption since the only writers are the commit
//! path and compaction, both of which must already be ordered.

use crate::errors::{Error, Result};
use crate::key::bkey::Bkey;
use crate::key::packed::{self, BkeyFormat};
use crate::key::pos::Bpos;

/// Don't bother building the prefix index for tiny runs.
const AUX_MIN_KEYS: usize = 16;

/// Total bit width of a position (inode 64 + offset 64 + snapshot 32).
const POS_BITS: u32 = 160;

fn pos_words(pos: Bpos) -> [u64; 3] {
    [pos.inode, pos.offset, (pos.snapshot as u64) << 32]
}

/// Extract the 32 bits of `pos` starting at `shift` (bit 0 = MSB of inode).
fn extract_prefix(pos: Bpos, shift: u32) -> u32 {
    let words = pos_words(pos);
    let mut v: u64 = 0;
    let word = (shift / 64) as usize;
    let bit = shift % 64;
    v |= words[word] << bit;
    if bit != 0 && word + 1 < 3 {
        v |= words[word + 1] >> (64 - bit);
    }
    (v >> 32) as u32
}

/// First bit position where `a` and `b` differ, or `None` when equal.
fn first_diff_bit(a: Bpos, b: Bpos) -> Option<u32> {
    let (wa, wb) = (pos_words(a), pos_words(b));
    for i in 0..3 {
        let x = wa[i] ^ wb[i];
        if x != 0 {
            return Some(i as u32 * 64 + x.leading_zeros());
        }
    }
    None
}

#[derive(Debug, Default)]
struct AuxIndex {
    /// Prefix per eytzinger slot.
    prefixes: Vec<u32>,
    /// Sorted index per eytzinger slot.
    sorted: Vec<u32>,
    shift: u32,
    /// Adjacent key pairs the prefix cannot tell apart.
    failed_entries: usize,
}

/// A sorted run of packed keys.
#[derive(Debug)]
pub struct Bset {
    format: BkeyFormat,
    data: Vec<u8>,
    offsets: Vec<u32>,
    aux: Option<AuxIndex>,
    aux_dirty: bool,
}

impl Bset {
    pub fn new(format: BkeyFormat) -> Self {
        Self {
            format,
            data: Vec::new(),
            offsets: Vec::new(),
            aux: None,
            aux_dirty: false,
        }
    }

    /// Build a bset from keys already in `(position, version)` order.
    pub fn from_sorted(format: BkeyFormat, keys: impl IntoIterator<Item = Bkey>) -> Result<Self> {
        let mut bset = Self::new(format);
        for key in keys {
            bset.append(&key)?;
        }
        bset.build_aux();
        Ok(bset)
    }

    /// Reconstruct from on-disk bytes; `nr_keys` comes from the bset header.
    pub fn from_bytes(format: BkeyFormat, bytes: &[u8], nr_keys: u32) -> Result<Self> {
        let mut bset = Self::new(format);
        let mut off = 0usize;
        let mut prev: Option<(Bpos, u64)> = None;
        for _ in 0..nr_keys {
            match packed::decode_from(&bytes[off..], &format)? {
                None => break,
                Some((key, consumed)) => {
                    if let Some(p) = prev {
                        if (key.pos, key.version) <= p {
                            return Err(Error::FatalCorruption(format!(
                                "bset keys out of order at {}",
                                key.pos
                            )));
                        }
                    }
                    prev = Some((key.pos, key.version));
                    bset.offsets.push(off as u32);
                    off += consumed;
                }
            }
        }
        bset.data = bytes[..off].to_vec();
        // Read-in builds the search index immediately; miss-path fills are
        // the main consumers of large sorted runs.
        bset.build_aux();
        Ok(bset)
    }

    pub fn format(&self) -> &BkeyFormat {
        &self.format
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Encoded size in u64 words.
    pub fn u64s(&self) -> usize {
        self.data.len() / 8
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn key_at(&self, idx: usize) -> Result<Bkey> {
        let off = self.offsets[idx] as usize;
        match packed::decode_from(&self.data[off..], &self.format)? {
            Some((key, _)) => Ok(key),
            None => Err(Error::FatalCorruption(
                "bset offset points at a terminator".into(),
            )),
        }
    }

    pub fn last_key(&self) -> Result<Option<Bkey>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.key_at(self.len() - 1).map(Some)
    }

    /// Append a key strictly greater than the current last `(pos, version)`.
    pub fn append(&mut self, key: &Bkey) -> Result<()> {
        if let Some(last) = self.last_key()? {
            if (key.pos, key.version) <= (last.pos, last.version) {
                return Err(Error::FatalCorruption(format!(
                    "append out of order: {} after {}",
                    key.pos, last.pos
                )));
            }
        }
        self.offsets.push(self.data.len() as u32);
        packed::encode_into(&mut self.data, key, &self.format);
        self.aux_dirty = true;
        Ok(())
    }

    fn build_aux(&mut self) {
        self.aux_dirty = false;
        self.aux = None;
        let n = self.len();
        if n < AUX_MIN_KEYS {
            return;
        }

        let positions: Vec<Bpos> = (0..n)
            .map(|i| self.key_at(i).map(|k| k.pos))
            .collect::<Result<_>>()
            .unwrap_or_default();
        if positions.len() != n {
            return;
        }

        let shift = match first_diff_bit(positions[0], positions[n - 1]) {
            Some(bit) => bit.min(POS_BITS - 32),
            // All keys share a position (version-only runs); index is useless.
            None => return,
        };

        let prefixes_sorted: Vec<u32> = positions.iter().map(|&p| extract_prefix(p, shift)).collect();
        let failed_entries = prefixes_sorted
            .windows(2)
            .filter(|w| w[0] == w[1])
            .count();

        let mut aux = AuxIndex {
            prefixes: vec![0; n],
            sorted: vec![0; n],
            shift,
            failed_entries,
        };

        // In-order traversal of the implicit eytzinger tree visits slots in
        // sorted order.
        fn fill(
            k: usize,
            next: &mut usize,
            n: usize,
            prefixes_sorted: &[u32],
            aux: &mut AuxIndex,
        ) {
            if k >= n {
                return;
            }
            fill(2 * k + 1, next, n, prefixes_sorted, aux);
            aux.sorted[k] = *next as u32;
            aux.prefixes[k] = prefixes_sorted[*next];
            *next += 1;
            fill(2 * k + 2, next, n, prefixes_sorted, aux);
        }
        let mut next = 0usize;
        fill(0, &mut next, n, &prefixes_sorted, &mut aux);

        self.aux = Some(aux);
    }

    /// Number of adjacent keys the prefix index cannot discriminate.
    pub fn failed_prefix_entries(&self) -> usize {
        self.aux.as_ref().map_or(0, |a| a.failed_entries)
    }

    /// Rebuild the prefix index if appends have invalidated it. Called by
    /// compaction and write-out; searches between rebuilds stay correct on
    /// the exact binary-search path.
    pub fn ensure_index(&mut self) {
        if self.aux_dirty {
            self.build_aux();
        }
    }

    /// Index of the first key with `(pos, version) >= (target, version_min)`.
    pub fn lower_bound(&self, target: Bpos, version_min: u64) -> Result<usize> {
        let n = self.len();
        let aux = if self.aux_dirty {
            None
        } else {
            self.aux.as_ref()
        };
        let mut lo = match aux {
            Some(aux) => {
                let tp = extract_prefix(target, aux.shift);
                let mut k = 0usize;
                let mut candidate = n;
                while k < n {
                    if aux.prefixes[k] >= tp {
                        candidate = aux.sorted[k] as usize;
                        k = 2 * k + 1;
                    } else {
                        k = 2 * k + 2;
                    }
                }
                // Keys with a smaller prefix sort strictly before the target;
                // the scan below resolves the equal-prefix run.
                candidate
            }
            None => {
                // Exact binary search over decoded keys.
                let mut lo = 0usize;
                let mut hi = n;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let k = self.key_at(mid)?;
                    if (k.pos, k.version) < (target, version_min) {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                return Ok(lo);
            }
        };

        while lo > 0 {
            // The prefix lower bound can land past equal-prefix predecessors
            // of the target; back up over them.
            let k = self.key_at(lo - 1)?;
            if (k.pos, k.version) >= (target, version_min) {
                lo -= 1;
            } else {
                break;
            }
        }
        while lo < n {
            let k = self.key_at(lo)?;
            if (k.pos, k.version) >= (target, version_min) {
                break;
            }
            lo += 1;
        }
        Ok(lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::bkey::BkeyVal;

    fn bset_of(positions: &[(u64, u64, u32)]) -> Bset {
        let keys = positions
            .iter()
            .map(|&(i, o, s)| Bkey::new(Bpos::new(i, o, s), BkeyVal::Deleted));
        Bset::from_sorted(BkeyFormat::default(), keys).unwrap()
    }

    #[test]
    fn append_rejects_unsorted() {
        let mut bset = Bset::new(BkeyFormat::default());
        bset.append(&Bkey::new(Bpos::new(1, 5, 0), BkeyVal::Deleted))
            .unwrap();
        let err = bset
            .append(&Bkey::new(Bpos::new(1, 4, 0), BkeyVal::Deleted))
            .unwrap_err();
        assert!(matches!(err, Error::FatalCorruption(_)));

        // Equal (pos, version) is also rejected.
        let err = bset
            .append(&Bkey::new(Bpos::new(1, 5, 0), BkeyVal::Deleted))
            .unwrap_err();
        assert!(matches!(err, Error::FatalCorruption(_)));
    }

    #[test]
    fn version_breaks_position_ties() {
        let mut bset = Bset::new(BkeyFormat::default());
        let pos = Bpos::new(1, 5, 0);
        for version in [1, 2, 9] {
            bset.append(&Bkey {
                pos,
                size: 0,
                version,
                val: BkeyVal::Deleted,
            })
            .unwrap();
        }
        assert_eq!(bset.lower_bound(pos, 0).unwrap(), 0);
        assert_eq!(bset.lower_bound(pos, 3).unwrap(), 2);
        assert_eq!(bset.lower_bound(pos, 10).unwrap(), 3);
    }

    #[test]
    fn lower_bound_small_run() {
        let bset = bset_of(&[(1, 10, 0), (1, 20, 0), (2, 0, 0)]);
        assert_eq!(bset.lower_bound(Bpos::new(0, 0, 0), 0).unwrap(), 0);
        assert_eq!(bset.lower_bound(Bpos::new(1, 10, 0), 0).unwrap(), 0);
        assert_eq!(bset.lower_bound(Bpos::new(1, 11, 0), 0).unwrap(), 1);
        assert_eq!(bset.lower_bound(Bpos::new(2, 0, 0), 0).unwrap(), 2);
        assert_eq!(bset.lower_bound(Bpos::new(9, 0, 0), 0).unwrap(), 3);
    }

    #[test]
    fn lower_bound_uses_prefix_index_on_large_runs() {
        let positions: Vec<(u64, u64, u32)> = (0..200).map(|i| (7, i * 3, 0)).collect();
        let bset = bset_of(&positions);
        assert!(bset.aux_dirty || bset.aux.is_some());

        for (idx, &(inode, offset, snap)) in positions.iter().enumerate() {
            let target = Bpos::new(inode, offset, snap);
            assert_eq!(bset.lower_bound(target, 0).unwrap(), idx, "exact {target}");
            assert_eq!(
                bset.lower_bound(Bpos::new(inode, offset + 1, snap), 0).unwrap(),
                idx + 1,
                "successor of {target}"
            );
        }
        assert!(bset.aux.is_some(), "large run should have built the index");
    }

    #[test]
    fn colliding_prefixes_degrade_gracefully() {
        // Keys differing only in the low snapshot bits collide in any 32-bit
        // window anchored at the inode difference.
        let mut positions: Vec<(u64, u64, u32)> = (1..30).map(|s| (1, 0, s)).collect();
        positions.insert(0, (0, 0, 0));
        let bset = bset_of(&positions);

        for (idx, &(inode, offset, snap)) in positions.iter().enumerate() {
            let target = Bpos::new(inode, offset, snap);
            assert_eq!(bset.lower_bound(target, 0).unwrap(), idx);
        }
        assert!(bset.failed_prefix_entries() > 0);
    }

    #[test]
    fn from_bytes_round_trip() {
        let bset = bset_of(&[(1, 1, 0), (1, 2, 0), (3, 0, 4)]);
        let rebuilt =
            Bset::from_bytes(*bset.format(), bset.data(), bset.len() as u32).unwrap();
        assert_eq!(rebuilt.len(), 3);
        for i in 0..3 {
            assert_eq!(rebuilt.key_at(i).unwrap(), bset.key_at(i).unwrap());
        }
    }

    #[test]
    fn from_bytes_rejects_disorder() {
        let a = Bkey::new(Bpos::new(2, 0, 0), BkeyVal::Deleted);
        let b = Bkey::new(Bpos::new(1, 0, 0), BkeyVal::Deleted);
        let fmt = BkeyFormat::default();
        let mut buf = Vec::new();
        packed::encode_into(&mut buf, &a, &fmt);
        packed::encode_into(&mut buf, &b, &fmt);
        let err = Bset::from_bytes(fmt, &buf, 2).unwrap_err();
        assert!(matches!(err, Error::FatalCorruption(_)));
    }
}
