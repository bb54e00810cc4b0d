//! # Jset Format
//!
//! A jset is one journal write: a sector-aligned block with a checksummed
//! header and a list of typed sub-entries.
//!
//! ```text
//! +----------------------+
//! | Jset Header (64B)    |  magic, seq, last_seq, flags, payload length
//! +----------------------+
//! | Entry Header (8B)    |  type, btree id, level, payload words
//! | payload ...          |
//! +----------------------+
//! | Entry Header (8B)    |
//! | payload ...          |
//! +----------------------+
//! | zero fill to sector  |
//! +----------------------+
//! ```
//!
//! Entry kinds: `btree_keys` (keys bound for one tree and level),
//! `btree_root` (a tree's new root pointer), `clock` (I/O time counters),
//! `usage` (accounting), `blacklist` (seq ranges replay must ignore).
//!
//! Keys inside entries are encoded with the identity key format — journal
//! readers know nothing about any node's packing. The jset checksum covers
//! the payload with the seq as nonce, so a jset copied to the wrong slot
//! does not validate.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::codec::{self, ChecksumType};
use crate::config::SECTOR_SIZE;
use crate::errors::{Error, Result};
use crate::key::bkey::BkeyVal;
use crate::key::{packed, Bkey, BkeyFormat, BtreeId, DataType};

pub const JSET_MAGIC: &[u8; 8] = b"bforjrnl";
pub const JSET_HEADER_SIZE: usize = 64;
pub const JENTRY_HEADER_SIZE: usize = 8;

/// Jset `flags` bits.
pub const JSET_FLAG_FLUSH: u32 = 0x1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct JsetHeader {
    magic: [u8; 8],
    csum: U64,
    seq: U64,
    /// Oldest seq still needed for replay when this jset was written.
    last_seq: U64,
    version: U32,
    flags: U32,
    /// Payload length in u64 words (entries only, no header).
    u64s: U32,
    _pad: U32,
    reserved: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<JsetHeader>() == JSET_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct JEntryHeader {
    /// Payload words, excluding this header.
    u64s: U16,
    ty: u8,
    btree_id: u8,
    level: u8,
    _pad: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<JEntryHeader>() == JENTRY_HEADER_SIZE);

const JENTRY_BTREE_KEYS: u8 = 0;
const JENTRY_BTREE_ROOT: u8 = 1;
const JENTRY_CLOCK: u8 = 2;
const JENTRY_USAGE: u8 = 3;
const JENTRY_BLACKLIST: u8 = 4;

/// One journal sub-entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JEntry {
    BtreeKeys {
        btree_id: BtreeId,
        level: u8,
        keys: Vec<Bkey>,
    },
    BtreeRoot {
        btree_id: BtreeId,
        level: u8,
        ptr: Bkey,
    },
    Clock {
        rw: u8,
        time: u64,
    },
    Usage {
        data_type: DataType,
        sectors: u64,
    },
    Blacklist {
        start: u64,
        end: u64,
    },
}

fn journal_key_format() -> BkeyFormat {
    BkeyFormat::default()
}

impl JEntry {
    /// Encoded payload size in u64 words, excluding the entry header.
    pub fn payload_u64s(&self) -> usize {
        match self {
            JEntry::BtreeKeys { keys, .. } => keys
                .iter()
                .map(|k| packed::encoded_u64s(k, &journal_key_format()))
                .sum(),
            JEntry::BtreeRoot { ptr, .. } => packed::encoded_u64s(ptr, &journal_key_format()),
            JEntry::Clock { .. } => 1,
            JEntry::Usage { .. } => 2,
            JEntry::Blacklist { .. } => 2,
        }
    }

    /// Total size including header, in u64 words.
    pub fn u64s(&self) -> usize {
        1 + self.payload_u64s()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let (ty, btree_id, level) = match self {
            JEntry::BtreeKeys {
                btree_id, level, ..
            } => (JENTRY_BTREE_KEYS, *btree_id as u8, *level),
            JEntry::BtreeRoot {
                btree_id, level, ..
            } => (JENTRY_BTREE_ROOT, *btree_id as u8, *level),
            JEntry::Clock { rw, .. } => (JENTRY_CLOCK, *rw, 0),
            JEntry::Usage { data_type, .. } => (JENTRY_USAGE, *data_type as u8, 0),
            JEntry::Blacklist { .. } => (JENTRY_BLACKLIST, 0, 0),
        };
        let header = JEntryHeader {
            u64s: U16::new(self.payload_u64s() as u16),
            ty,
            btree_id,
            level,
            _pad: [0; 3],
        };
        out.extend_from_slice(header.as_bytes());

        match self {
            JEntry::BtreeKeys { keys, .. } => {
                for key in keys {
                    packed::encode_into(out, key, &journal_key_format());
                }
            }
            JEntry::BtreeRoot { ptr, .. } => {
                packed::encode_into(out, ptr, &journal_key_format());
            }
            JEntry::Clock { time, .. } => out.extend_from_slice(&time.to_le_bytes()),
            JEntry::Usage { sectors, .. } => {
                out.extend_from_slice(&sectors.to_le_bytes());
                out.extend_from_slice(&0u64.to_le_bytes());
            }
            JEntry::Blacklist { start, end } => {
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
            }
        }
    }

    fn decode(header: &JEntryHeader, payload: &[u8]) -> Result<JEntry> {
        match header.ty {
            JENTRY_BTREE_KEYS => {
                let btree_id = BtreeId::from_raw(header.btree_id)?;
                let mut keys = Vec::new();
                let mut off = 0usize;
                while off < payload.len() {
                    match packed::decode_from(&payload[off..], &journal_key_format())? {
                        None => break,
                        Some((key, consumed)) => {
                            keys.push(key);
                            off += consumed;
                        }
                    }
                }
                Ok(JEntry::BtreeKeys {
                    btree_id,
                    level: header.level,
                    keys,
                })
            }
            JENTRY_BTREE_ROOT => {
                let btree_id = BtreeId::from_raw(header.btree_id)?;
                let (ptr, _) = packed::decode_from(payload, &journal_key_format())?
                    .ok_or_else(|| Error::FatalCorruption("empty btree_root entry".into()))?;
                if !matches!(ptr.val, BkeyVal::BtreePtr(_)) {
                    return Err(Error::FatalCorruption(format!(
                        "btree_root entry holds {}",
                        ptr.val.type_name()
                    )));
                }
                Ok(JEntry::BtreeRoot {
                    btree_id,
                    level: header.level,
                    ptr,
                })
            }
            JENTRY_CLOCK => {
                if payload.len() < 8 {
                    return Err(Error::FatalCorruption("short clock entry".into()));
                }
                Ok(JEntry::Clock {
                    rw: header.btree_id,
                    time: u64::from_le_bytes(payload[..8].try_into().unwrap()),
                })
            }
            JENTRY_USAGE => {
                if payload.len() < 8 {
                    return Err(Error::FatalCorruption("short usage entry".into()));
                }
                Ok(JEntry::Usage {
                    data_type: DataType::from_raw(header.btree_id)?,
                    sectors: u64::from_le_bytes(payload[..8].try_into().unwrap()),
                })
            }
            JENTRY_BLACKLIST => {
                if payload.len() < 16 {
                    return Err(Error::FatalCorruption("short blacklist entry".into()));
                }
                Ok(JEntry::Blacklist {
                    start: u64::from_le_bytes(payload[..8].try_into().unwrap()),
                    end: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
                })
            }
            ty => Err(Error::FatalCorruption(format!(
                "unknown journal entry type {ty}"
            ))),
        }
    }
}

/// One journal write, in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jset {
    pub seq: u64,
    pub last_seq: u64,
    pub flush: bool,
    pub entries: Vec<JEntry>,
}

impl Jset {
    pub fn payload_u64s(&self) -> usize {
        self.entries.iter().map(|e| e.u64s()).sum()
    }

    /// Encoded size in sectors.
    pub fn sectors(&self) -> u64 {
        ((JSET_HEADER_SIZE + self.payload_u64s() * 8).div_ceil(SECTOR_SIZE)) as u64
    }
}

/// Encode a jset, zero-padded to whole sectors.
pub fn encode_jset(jset: &Jset, csum_type: ChecksumType) -> Vec<u8> {
    let mut payload = Vec::with_capacity(jset.payload_u64s() * 8);
    for entry in &jset.entries {
        entry.encode_into(&mut payload);
    }
    debug_assert_eq!(payload.len(), jset.payload_u64s() * 8);

    let header = JsetHeader {
        magic: *JSET_MAGIC,
        csum: U64::new(codec::checksum(csum_type, jset.seq, &payload)),
        seq: U64::new(jset.seq),
        last_seq: U64::new(jset.last_seq),
        version: U32::new(1),
        flags: U32::new(if jset.flush { JSET_FLAG_FLUSH } else { 0 }),
        u64s: U32::new((payload.len() / 8) as u32),
        _pad: U32::new(0),
        reserved: [0; 16],
    };

    let total = (JSET_HEADER_SIZE + payload.len()).div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    let mut out = vec![0u8; total];
    out[..JSET_HEADER_SIZE].copy_from_slice(header.as_bytes());
    out[JSET_HEADER_SIZE..JSET_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
    out
}

/// Outcome of decoding one jset during a journal scan.
#[derive(Debug)]
pub enum JsetDecode {
    Valid { jset: Jset, sectors: u64 },
    /// No jset magic here: end of the written region.
    NoMagic,
    /// Magic matched but the checksum did not; `sectors` is the claimed
    /// length if sane, letting the scan skip over the damage.
    Corrupt { seq: u64, sectors: u64 },
}

/// Decode the jset at the front of `bytes`.
pub fn decode_jset(bytes: &[u8], csum_type: ChecksumType) -> Result<JsetDecode> {
    if bytes.len() < JSET_HEADER_SIZE {
        return Ok(JsetDecode::NoMagic);
    }
    let header = JsetHeader::ref_from_bytes(&bytes[..JSET_HEADER_SIZE])
        .map_err(|e| Error::FatalCorruption(format!("bad jset header: {e:?}")))?;
    if header.magic != *JSET_MAGIC {
        return Ok(JsetDecode::NoMagic);
    }

    let seq = header.seq.get();
    let payload_len = header.u64s.get() as usize * 8;
    let total = JSET_HEADER_SIZE + payload_len;
    let sectors = total.div_ceil(SECTOR_SIZE) as u64;

    if total > bytes.len() {
        return Ok(JsetDecode::Corrupt { seq, sectors: 1 });
    }
    let payload = &bytes[JSET_HEADER_SIZE..total];
    if codec::checksum(csum_type, seq, payload) != header.csum.get() {
        return Ok(JsetDecode::Corrupt { seq, sectors });
    }

    let mut entries = Vec::new();
    let mut off = 0usize;
    while off + JENTRY_HEADER_SIZE <= payload.len() {
        let eh = JEntryHeader::ref_from_bytes(&payload[off..off + JENTRY_HEADER_SIZE])
            .map_err(|e| Error::FatalCorruption(format!("bad journal entry header: {e:?}")))?;
        off += JENTRY_HEADER_SIZE;
        let elen = eh.u64s.get() as usize * 8;
        if off + elen > payload.len() {
            return Err(Error::FatalCorruption(format!(
                "journal entry overruns jset payload at seq {seq}"
            )));
        }
        entries.push(JEntry::decode(eh, &payload[off..off + elen])?);
        off += elen;
    }

    Ok(JsetDecode::Valid {
        jset: Jset {
            seq,
            last_seq: header.last_seq.get(),
            flush: header.flags.get() & JSET_FLAG_FLUSH != 0,
            entries,
        },
        sectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::bkey::{BtreePtr, Inode};
    use crate::key::Bpos;

    fn sample_jset() -> Jset {
        Jset {
            seq: 9,
            last_seq: 3,
            flush: true,
            entries: vec![
                JEntry::BtreeKeys {
                    btree_id: BtreeId::Inodes,
                    level: 0,
                    keys: vec![
                        Bkey::new(Bpos::new(42, 0, 1), BkeyVal::Inode(Inode::default())),
                        Bkey::deleted(Bpos::new(43, 0, 1)),
                    ],
                },
                JEntry::BtreeRoot {
                    btree_id: BtreeId::Inodes,
                    level: 1,
                    ptr: Bkey::new(
                        crate::key::POS_MAX,
                        BkeyVal::BtreePtr(BtreePtr {
                            dev: 0,
                            bucket: 17,
                            seq: 4,
                            sectors_written: 8,
                            min_key: Bpos::default(),
                        }),
                    ),
                },
                JEntry::Clock { rw: 1, time: 555 },
                JEntry::Usage {
                    data_type: DataType::Btree,
                    sectors: 4096,
                },
                JEntry::Blacklist { start: 73, end: 100 },
            ],
        }
    }

    #[test]
    fn jset_round_trip() {
        let jset = sample_jset();
        let bytes = encode_jset(&jset, ChecksumType::Crc64);
        assert_eq!(bytes.len() % SECTOR_SIZE, 0);

        match decode_jset(&bytes, ChecksumType::Crc64).unwrap() {
            JsetDecode::Valid { jset: back, sectors } => {
                assert_eq!(back, jset);
                assert_eq!(sectors, jset.sectors());
            }
            other => panic!("expected valid jset, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_payload_is_flagged_with_seq() {
        let jset = sample_jset();
        let mut bytes = encode_jset(&jset, ChecksumType::Crc64);
        bytes[JSET_HEADER_SIZE + 5] ^= 0xff;

        match decode_jset(&bytes, ChecksumType::Crc64).unwrap() {
            JsetDecode::Corrupt { seq, .. } => assert_eq!(seq, 9),
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn zeroes_scan_as_end() {
        let bytes = vec![0u8; SECTOR_SIZE * 2];
        assert!(matches!(
            decode_jset(&bytes, ChecksumType::Crc64).unwrap(),
            JsetDecode::NoMagic
        ));
    }

    #[test]
    fn entry_sizes_match_encoding() {
        for entry in sample_jset().entries {
            let mut buf = Vec::new();
            entry.encode_into(&mut buf);
            assert_eq!(buf.len(), entry.u64s() * 8, "{entry:?}");
        }
    }
}
