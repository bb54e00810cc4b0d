//! # Typed Keys
//!
//! A [`Bkey`] is the unit of every btree update: a header (position, size,
//! version) plus a typed value. The value set is closed but appendable — new
//! type tags may be added without invalidating older readers, and unknown
//! tags encountered on disk are preserved verbatim so a newer filesystem can
//! pass through an older implementation unharmed. Current code can never
//! *create* an unknown tag.
//!
//! ## Point keys and extent keys
//!
//! Most keys are point keys: `size == 0`, and the key occupies exactly its
//! position. Extent-style keys (`extent`, `reflink_v`) carry a nonzero size
//! and their position is the *end* of the range: a key at position `P` with
//! size `S` covers the half-open interval `(P-S, P]` in sectors.
//!
//! ## Value encoding
//!
//! Values encode to little-endian byte strings padded to a multiple of eight
//! bytes, so whole keys always occupy an integral number of u64 words — the
//! unit in which journal reservations and node space are accounted.

use std::fmt;

use crate::errors::{Error, Result};
use crate::key::pos::Bpos;

/// On-disk bucket contents, stored in alloc keys and checked against every
/// referring key. Part of the on-disk format; append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataType {
    #[default]
    Free = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
}

impl DataType {
    pub fn from_raw(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => DataType::Free,
            1 => DataType::Sb,
            2 => DataType::Journal,
            3 => DataType::Btree,
            4 => DataType::User,
            5 => DataType::Cached,
            6 => DataType::Parity,
            _ => {
                return Err(Error::FatalCorruption(format!(
                    "invalid bucket data type {raw}"
                )))
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Free => "free",
            DataType::Sb => "sb",
            DataType::Journal => "journal",
            DataType::Btree => "btree",
            DataType::User => "user",
            DataType::Cached => "cached",
            DataType::Parity => "parity",
        }
    }
}

/// Pointer from an interior node (or root) to a child node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BtreePtr {
    pub dev: u32,
    pub bucket: u64,
    /// Sequence number the pointed-to node must carry; detects stale reads
    /// of a reused bucket.
    pub seq: u64,
    pub sectors_written: u32,
    pub min_key: Bpos,
}

/// One replica of an extent's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentPtr {
    pub dev: u32,
    /// Bucket generation at write time; a mismatch means the bucket was
    /// reused and the pointer is dangling.
    pub gen: u32,
    pub bucket: u64,
    pub bucket_offset: u32,
    pub sectors: u32,
}

/// User or metadata payload: one or more replica pointers plus codec info.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extent {
    pub csum_type: u8,
    pub compression_type: u8,
    pub uncompressed_sectors: u32,
    pub csum: u64,
    pub ptrs: Vec<ExtentPtr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inode {
    pub mode: u32,
    pub flags: u32,
    pub size: u64,
    pub sectors: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dirent {
    pub target_inum: u64,
    pub d_type: u8,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Xattr {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// Per-bucket allocation state, one key per bucket in the alloc tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Alloc {
    pub gen: u32,
    pub data_type: DataType,
    pub dirty_sectors: u32,
    pub cached_sectors: u32,
    /// Highest journal seq that referenced this bucket; the bucket cannot be
    /// reused until this seq is flushed.
    pub journal_seq_nonempty: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stripe {
    pub algorithm: u8,
    pub nr_redundant: u8,
    pub sectors: u32,
    pub ptrs: Vec<ExtentPtr>,
}

/// Indirection from a reflinked extent into the reflink tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReflinkP {
    pub idx: u64,
}

/// Shared extent payload; dropped when the refcount reaches zero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReflinkV {
    pub refcount: u64,
    pub csum_type: u8,
    pub compression_type: u8,
    pub uncompressed_sectors: u32,
    pub csum: u64,
    pub ptrs: Vec<ExtentPtr>,
}

/// Membership of the snapshot tree, keyed by snapshot ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotRecord {
    pub parent: u32,
    pub children: [u32; 2],
    pub subvol: u32,
    pub depth: u32,
    pub skip: [u32; 3],
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subvolume {
    pub root_inode: u64,
    pub snapshot: u32,
    pub flags: u32,
}

/// A typed key value. The numeric tags are on-disk format; append only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BkeyVal {
    Deleted,
    Whiteout,
    BtreePtr(BtreePtr),
    Extent(Extent),
    Inode(Inode),
    Dirent(Dirent),
    Xattr(Xattr),
    Alloc(Alloc),
    Stripe(Stripe),
    ReflinkP(ReflinkP),
    ReflinkV(ReflinkV),
    Snapshot(SnapshotRecord),
    Subvolume(Subvolume),
    InlineData(Vec<u8>),
    /// A tag this implementation does not know. Preserved byte-exactly;
    /// cannot be constructed by update paths.
    Unknown { tag: u8, bytes: Vec<u8> },
}

pub const TAG_DELETED: u8 = 0;
pub const TAG_WHITEOUT: u8 = 1;
pub const TAG_BTREE_PTR: u8 = 2;
pub const TAG_EXTENT: u8 = 3;
pub const TAG_INODE: u8 = 4;
pub const TAG_DIRENT: u8 = 5;
pub const TAG_XATTR: u8 = 6;
pub const TAG_ALLOC: u8 = 7;
pub const TAG_STRIPE: u8 = 8;
pub const TAG_REFLINK_P: u8 = 9;
pub const TAG_REFLINK_V: u8 = 10;
pub const TAG_SNAPSHOT: u8 = 11;
pub const TAG_SUBVOLUME: u8 = 12;
pub const TAG_INLINE_DATA: u8 = 13;

impl BkeyVal {
    pub fn tag(&self) -> u8 {
        match self {
            BkeyVal::Deleted => TAG_DELETED,
            BkeyVal::Whiteout => TAG_WHITEOUT,
            BkeyVal::BtreePtr(_) => TAG_BTREE_PTR,
            BkeyVal::Extent(_) => TAG_EXTENT,
            BkeyVal::Inode(_) => TAG_INODE,
            BkeyVal::Dirent(_) => TAG_DIRENT,
            BkeyVal::Xattr(_) => TAG_XATTR,
            BkeyVal::Alloc(_) => TAG_ALLOC,
            BkeyVal::Stripe(_) => TAG_STRIPE,
            BkeyVal::ReflinkP(_) => TAG_REFLINK_P,
            BkeyVal::ReflinkV(_) => TAG_REFLINK_V,
            BkeyVal::Snapshot(_) => TAG_SNAPSHOT,
            BkeyVal::Subvolume(_) => TAG_SUBVOLUME,
            BkeyVal::InlineData(_) => TAG_INLINE_DATA,
            BkeyVal::Unknown { tag, .. } => *tag,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            BkeyVal::Deleted => "deleted",
            BkeyVal::Whiteout => "whiteout",
            BkeyVal::BtreePtr(_) => "btree_ptr_v2",
            BkeyVal::Extent(_) => "extent",
            BkeyVal::Inode(_) => "inode_v3",
            BkeyVal::Dirent(_) => "dirent",
            BkeyVal::Xattr(_) => "xattr",
            BkeyVal::Alloc(_) => "alloc_v4",
            BkeyVal::Stripe(_) => "stripe",
            BkeyVal::ReflinkP(_) => "reflink_p",
            BkeyVal::ReflinkV(_) => "reflink_v",
            BkeyVal::Snapshot(_) => "snapshot",
            BkeyVal::Subvolume(_) => "subvolume",
            BkeyVal::InlineData(_) => "inline_data",
            BkeyVal::Unknown { .. } => "unknown",
        }
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn pad8(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

/// Bounds-checked little-endian reader over a value slice.
struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return Err(Error::FatalCorruption(format!(
                "truncated key value: need {} bytes at offset {}, have {}",
                n,
                self.off,
                self.buf.len()
            )));
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }
}

fn encode_ptrs(out: &mut Vec<u8>, ptrs: &[ExtentPtr]) {
    for p in ptrs {
        put_u32(out, p.dev);
        put_u32(out, p.gen);
        put_u64(out, p.bucket);
        put_u32(out, p.bucket_offset);
        put_u32(out, p.sectors);
    }
}

fn decode_ptrs(r: &mut Reader<'_>, nr: usize) -> Result<Vec<ExtentPtr>> {
    let mut ptrs = Vec::with_capacity(nr);
    for _ in 0..nr {
        ptrs.push(ExtentPtr {
            dev: r.u32()?,
            gen: r.u32()?,
            bucket: r.u64()?,
            bucket_offset: r.u32()?,
            sectors: r.u32()?,
        });
    }
    Ok(ptrs)
}

impl BkeyVal {
    /// Encode to the on-disk little-endian layout, padded to 8 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            BkeyVal::Deleted | BkeyVal::Whiteout => {}
            BkeyVal::BtreePtr(p) => {
                put_u32(&mut out, p.dev);
                put_u32(&mut out, 0);
                put_u64(&mut out, p.bucket);
                put_u64(&mut out, p.seq);
                put_u32(&mut out, p.sectors_written);
                put_u32(&mut out, 0);
                put_u64(&mut out, p.min_key.inode);
                put_u64(&mut out, p.min_key.offset);
                put_u32(&mut out, p.min_key.snapshot);
                put_u32(&mut out, 0);
            }
            BkeyVal::Extent(e) => {
                out.push(e.csum_type);
                out.push(e.compression_type);
                out.push(e.ptrs.len() as u8);
                out.push(0);
                put_u32(&mut out, e.uncompressed_sectors);
                put_u64(&mut out, e.csum);
                encode_ptrs(&mut out, &e.ptrs);
            }
            BkeyVal::Inode(i) => {
                put_u32(&mut out, i.mode);
                put_u32(&mut out, i.flags);
                put_u64(&mut out, i.size);
                put_u64(&mut out, i.sectors);
                put_u32(&mut out, i.nlink);
                put_u32(&mut out, i.uid);
                put_u32(&mut out, i.gid);
                put_u32(&mut out, 0);
                put_u64(&mut out, i.atime);
                put_u64(&mut out, i.mtime);
                put_u64(&mut out, i.ctime);
            }
            BkeyVal::Dirent(d) => {
                put_u64(&mut out, d.target_inum);
                out.push(d.d_type);
                out.push(0);
                put_u16(&mut out, d.name.len() as u16);
                put_u32(&mut out, 0);
                out.extend_from_slice(&d.name);
            }
            BkeyVal::Xattr(x) => {
                put_u16(&mut out, x.name.len() as u16);
                put_u16(&mut out, x.value.len() as u16);
                put_u32(&mut out, 0);
                out.extend_from_slice(&x.name);
                out.extend_from_slice(&x.value);
            }
            BkeyVal::Alloc(a) => {
                put_u32(&mut out, a.gen);
                out.push(a.data_type as u8);
                out.push(0);
                put_u16(&mut out, 0);
                put_u32(&mut out, a.dirty_sectors);
                put_u32(&mut out, a.cached_sectors);
                put_u64(&mut out, a.journal_seq_nonempty);
            }
            BkeyVal::Stripe(s) => {
                out.push(s.algorithm);
                out.push(s.nr_redundant);
                out.push(s.ptrs.len() as u8);
                out.push(0);
                put_u32(&mut out, s.sectors);
                encode_ptrs(&mut out, &s.ptrs);
            }
            BkeyVal::ReflinkP(p) => put_u64(&mut out, p.idx),
            BkeyVal::ReflinkV(v) => {
                put_u64(&mut out, v.refcount);
                out.push(v.csum_type);
                out.push(v.compression_type);
                out.push(v.ptrs.len() as u8);
                out.push(0);
                put_u32(&mut out, v.uncompressed_sectors);
                put_u64(&mut out, v.csum);
                encode_ptrs(&mut out, &v.ptrs);
            }
            BkeyVal::Snapshot(s) => {
                put_u32(&mut out, s.parent);
                put_u32(&mut out, s.flags);
                put_u32(&mut out, s.children[0]);
                put_u32(&mut out, s.children[1]);
                put_u32(&mut out, s.subvol);
                put_u32(&mut out, s.depth);
                put_u32(&mut out, s.skip[0]);
                put_u32(&mut out, s.skip[1]);
                put_u32(&mut out, s.skip[2]);
                put_u32(&mut out, 0);
            }
            BkeyVal::Subvolume(s) => {
                put_u64(&mut out, s.root_inode);
                put_u32(&mut out, s.snapshot);
                put_u32(&mut out, s.flags);
            }
            BkeyVal::InlineData(bytes) => {
                put_u32(&mut out, bytes.len() as u32);
                put_u32(&mut out, 0);
                out.extend_from_slice(bytes);
            }
            BkeyVal::Unknown { bytes, .. } => out.extend_from_slice(bytes),
        }
        pad8(&mut out);
        out
    }

    /// Decode a value of type `tag` from its padded on-disk bytes.
    pub fn decode(tag: u8, bytes: &[u8]) -> Result<BkeyVal> {
        let mut r = Reader::new(bytes);
        Ok(match tag {
            TAG_DELETED => BkeyVal::Deleted,
            TAG_WHITEOUT => BkeyVal::Whiteout,
            TAG_BTREE_PTR => {
                let dev = r.u32()?;
                let _pad = r.u32()?;
                let bucket = r.u64()?;
                let seq = r.u64()?;
                let sectors_written = r.u32()?;
                let _pad = r.u32()?;
                let min_key = Bpos::new(r.u64()?, r.u64()?, r.u32()?);
                BkeyVal::BtreePtr(BtreePtr {
                    dev,
                    bucket,
                    seq,
                    sectors_written,
                    min_key,
                })
            }
            TAG_EXTENT => {
                let csum_type = r.u8()?;
                let compression_type = r.u8()?;
                let nr_ptrs = r.u8()? as usize;
                let _pad = r.u8()?;
                let uncompressed_sectors = r.u32()?;
                let csum = r.u64()?;
                BkeyVal::Extent(Extent {
                    csum_type,
                    compression_type,
                    uncompressed_sectors,
                    csum,
                    ptrs: decode_ptrs(&mut r, nr_ptrs)?,
                })
            }
            TAG_INODE => {
                let mode = r.u32()?;
                let flags = r.u32()?;
                let size = r.u64()?;
                let sectors = r.u64()?;
                let nlink = r.u32()?;
                let uid = r.u32()?;
                let gid = r.u32()?;
                let _pad = r.u32()?;
                BkeyVal::Inode(Inode {
                    mode,
                    flags,
                    size,
                    sectors,
                    nlink,
                    uid,
                    gid,
                    atime: r.u64()?,
                    mtime: r.u64()?,
                    ctime: r.u64()?,
                })
            }
            TAG_DIRENT => {
                let target_inum = r.u64()?;
                let d_type = r.u8()?;
                let _pad = r.u8()?;
                let name_len = r.u16()? as usize;
                let _pad = r.u32()?;
                BkeyVal::Dirent(Dirent {
                    target_inum,
                    d_type,
                    name: r.take(name_len)?.to_vec(),
                })
            }
            TAG_XATTR => {
                let name_len = r.u16()? as usize;
                let val_len = r.u16()? as usize;
                let _pad = r.u32()?;
                BkeyVal::Xattr(Xattr {
                    name: r.take(name_len)?.to_vec(),
                    value: r.take(val_len)?.to_vec(),
                })
            }
            TAG_ALLOC => {
                let gen = r.u32()?;
                let data_type = DataType::from_raw(r.u8()?)?;
                let _pad = r.u8()?;
                let _pad = r.u16()?;
                BkeyVal::Alloc(Alloc {
                    gen,
                    data_type,
                    dirty_sectors: r.u32()?,
                    cached_sectors: r.u32()?,
                    journal_seq_nonempty: r.u64()?,
                })
            }
            TAG_STRIPE => {
                let algorithm = r.u8()?;
                let nr_redundant = r.u8()?;
                let nr_ptrs = r.u8()? as usize;
                let _pad = r.u8()?;
                let sectors = r.u32()?;
                BkeyVal::Stripe(Stripe {
                    algorithm,
                    nr_redundant,
                    sectors,
                    ptrs: decode_ptrs(&mut r, nr_ptrs)?,
                })
            }
            TAG_REFLINK_P => BkeyVal::ReflinkP(ReflinkP { idx: r.u64()? }),
            TAG_REFLINK_V => {
                let refcount = r.u64()?;
                let csum_type = r.u8()?;
                let compression_type = r.u8()?;
                let nr_ptrs = r.u8()? as usize;
                let _pad = r.u8()?;
                let uncompressed_sectors = r.u32()?;
                let csum = r.u64()?;
                BkeyVal::ReflinkV(ReflinkV {
                    refcount,
                    csum_type,
                    compression_type,
                    uncompressed_sectors,
                    csum,
                    ptrs: decode_ptrs(&mut r, nr_ptrs)?,
                })
            }
            TAG_SNAPSHOT => {
                let parent = r.u32()?;
                let flags = r.u32()?;
                let children = [r.u32()?, r.u32()?];
                let subvol = r.u32()?;
                let depth = r.u32()?;
                let skip = [r.u32()?, r.u32()?, r.u32()?];
                BkeyVal::Snapshot(SnapshotRecord {
                    parent,
                    children,
                    subvol,
                    depth,
                    skip,
                    flags,
                })
            }
            TAG_SUBVOLUME => BkeyVal::Subvolume(Subvolume {
                root_inode: r.u64()?,
                snapshot: r.u32()?,
                flags: r.u32()?,
            }),
            TAG_INLINE_DATA => {
                let len = r.u32()? as usize;
                let _pad = r.u32()?;
                BkeyVal::InlineData(r.take(len)?.to_vec())
            }
            tag => BkeyVal::Unknown {
                tag,
                bytes: bytes.to_vec(),
            },
        })
    }
}

/// A complete key: header fields plus typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bkey {
    pub pos: Bpos,
    /// Extent size in sectors; zero for point keys.
    pub size: u32,
    pub version: u64,
    pub val: BkeyVal,
}

impl Bkey {
    pub fn new(pos: Bpos, val: BkeyVal) -> Self {
        Self {
            pos,
            size: 0,
            version: 0,
            val,
        }
    }

    pub fn new_extent(pos: Bpos, size: u32, val: BkeyVal) -> Self {
        Self {
            pos,
            size,
            version: 0,
            val,
        }
    }

    pub fn deleted(pos: Bpos) -> Self {
        Self::new(pos, BkeyVal::Deleted)
    }

    pub fn whiteout(pos: Bpos) -> Self {
        Self::new(pos, BkeyVal::Whiteout)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.val, BkeyVal::Deleted)
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self.val, BkeyVal::Whiteout)
    }

    /// Position where this key's range begins. Point keys begin at their own
    /// position; extent keys begin `size` sectors earlier.
    pub fn start(&self) -> Bpos {
        if self.size == 0 {
            self.pos
        } else {
            Bpos {
                inode: self.pos.inode,
                offset: self.pos.offset.saturating_sub(self.size as u64),
                snapshot: self.pos.snapshot,
            }
        }
    }

    /// Range overlap within the same snapshot line; forbidden for live
    /// extents except during the commit that atomically replaces them.
    pub fn overlaps(&self, other: &Bkey) -> bool {
        if self.pos.inode != other.pos.inode || self.pos.snapshot != other.pos.snapshot {
            return false;
        }
        let (a0, a1) = (self.start().offset, self.pos.offset);
        let (b0, b1) = (other.start().offset, other.pos.offset);
        if self.size == 0 || other.size == 0 {
            return false;
        }
        a0 < b1 && b0 < a1
    }

    /// Structural validity of the key itself (not tree membership; see
    /// `BtreeId::permits` for that).
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::FatalCorruption(msg));
        match &self.val {
            BkeyVal::Extent(e) => {
                if self.size == 0 {
                    return bad(format!("extent at {} with zero size", self.pos));
                }
                if (self.pos.offset as u128) < self.size as u128 {
                    return bad(format!(
                        "extent at {} extends before offset zero",
                        self.pos
                    ));
                }
                if e.ptrs.is_empty() {
                    return bad(format!("extent at {} with no pointers", self.pos));
                }
            }
            BkeyVal::ReflinkV(v) => {
                if self.size == 0 {
                    return bad(format!("reflink_v at {} with zero size", self.pos));
                }
                if v.ptrs.is_empty() {
                    return bad(format!("reflink_v at {} with no pointers", self.pos));
                }
            }
            BkeyVal::Dirent(d) => {
                if d.name.is_empty() {
                    return bad(format!("dirent at {} with empty name", self.pos));
                }
            }
            BkeyVal::Xattr(x) => {
                if x.name.is_empty() {
                    return bad(format!("xattr at {} with empty name", self.pos));
                }
            }
            BkeyVal::Snapshot(s) => {
                if s.parent != 0 && s.parent <= self.pos.offset as u32 {
                    return bad(format!(
                        "snapshot {} has parent {} with a smaller or equal id",
                        self.pos.offset, s.parent
                    ));
                }
            }
            BkeyVal::Stripe(s) => {
                if s.ptrs.is_empty() {
                    return bad(format!("stripe at {} with no blocks", self.pos));
                }
            }
            _ => {
                if self.size != 0
                    && !matches!(self.val, BkeyVal::Deleted | BkeyVal::Whiteout)
                {
                    return bad(format!(
                        "{} key at {} with nonzero size",
                        self.val.type_name(),
                        self.pos
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Bkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.val.type_name(), self.pos)?;
        if self.size != 0 {
            write!(f, " len {}", self.size)?;
        }
        if self.version != 0 {
            write!(f, " ver {}", self.version)?;
        }
        match &self.val {
            BkeyVal::BtreePtr(p) => {
                write!(f, ": dev {} bucket {} seq {}", p.dev, p.bucket, p.seq)
            }
            BkeyVal::Extent(e) => {
                for p in &e.ptrs {
                    write!(f, " ptr {}:{}+{} gen {}", p.dev, p.bucket, p.bucket_offset, p.gen)?;
                }
                Ok(())
            }
            BkeyVal::Inode(i) => write!(f, ": mode {:o} size {}", i.mode, i.size),
            BkeyVal::Dirent(d) => write!(
                f,
                ": {} -> {}",
                String::from_utf8_lossy(&d.name),
                d.target_inum
            ),
            BkeyVal::Alloc(a) => write!(
                f,
                ": gen {} {} dirty {}",
                a.gen,
                a.data_type.as_str(),
                a.dirty_sectors
            ),
            BkeyVal::Snapshot(s) => write!(f, ": parent {} depth {}", s.parent, s.depth),
            BkeyVal::Unknown { tag, bytes } => write!(f, ": tag {} ({} bytes)", tag, bytes.len()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values() -> Vec<BkeyVal> {
        vec![
            BkeyVal::Deleted,
            BkeyVal::Whiteout,
            BkeyVal::BtreePtr(BtreePtr {
                dev: 0,
                bucket: 42,
                seq: 7,
                sectors_written: 512,
                min_key: Bpos::new(1, 2, 3),
            }),
            BkeyVal::Extent(Extent {
                csum_type: 2,
                compression_type: 0,
                uncompressed_sectors: 16,
                csum: 0xdead_beef,
                ptrs: vec![
                    ExtentPtr {
                        dev: 0,
                        gen: 1,
                        bucket: 9,
                        bucket_offset: 0,
                        sectors: 16,
                    },
                    ExtentPtr {
                        dev: 1,
                        gen: 3,
                        bucket: 11,
                        bucket_offset: 16,
                        sectors: 16,
                    },
                ],
            }),
            BkeyVal::Inode(Inode {
                mode: 0o644,
                flags: 0,
                size: 4096,
                sectors: 8,
                nlink: 1,
                uid: 1000,
                gid: 1000,
                atime: 1,
                mtime: 2,
                ctime: 3,
            }),
            BkeyVal::Dirent(Dirent {
                target_inum: 42,
                d_type: 4,
                name: b"hello.txt".to_vec(),
            }),
            BkeyVal::Xattr(Xattr {
                name: b"user.comment".to_vec(),
                value: b"v".to_vec(),
            }),
            BkeyVal::Alloc(Alloc {
                gen: 3,
                data_type: DataType::Btree,
                dirty_sectors: 512,
                cached_sectors: 0,
                journal_seq_nonempty: 99,
            }),
            BkeyVal::Stripe(Stripe {
                algorithm: 1,
                nr_redundant: 1,
                sectors: 128,
                ptrs: vec![ExtentPtr::default(); 3],
            }),
            BkeyVal::ReflinkP(ReflinkP { idx: 1234 }),
            BkeyVal::ReflinkV(ReflinkV {
                refcount: 2,
                csum_type: 2,
                compression_type: 0,
                uncompressed_sectors: 8,
                csum: 5,
                ptrs: vec![ExtentPtr::default()],
            }),
            BkeyVal::Snapshot(SnapshotRecord {
                parent: 100,
                children: [98, 97],
                subvol: 1,
                depth: 2,
                skip: [100, 100, 100],
                flags: 0,
            }),
            BkeyVal::Subvolume(Subvolume {
                root_inode: 4096,
                snapshot: 100,
                flags: 0,
            }),
            BkeyVal::InlineData(b"small file contents".to_vec()),
        ]
    }

    #[test]
    fn value_encode_decode_round_trip() {
        for val in sample_values() {
            let bytes = val.encode();
            assert_eq!(bytes.len() % 8, 0, "{} not word padded", val.type_name());
            let back = BkeyVal::decode(val.tag(), &bytes).unwrap();
            assert_eq!(val, back, "{} did not round trip", val.type_name());
        }
    }

    #[test]
    fn unknown_tag_preserved_verbatim() {
        let raw = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let val = BkeyVal::decode(200, &raw).unwrap();
        match &val {
            BkeyVal::Unknown { tag, bytes } => {
                assert_eq!(*tag, 200);
                assert_eq!(bytes, &raw);
            }
            other => panic!("expected unknown, got {}", other.type_name()),
        }
        assert_eq!(val.encode(), raw);
    }

    #[test]
    fn truncated_value_is_corruption() {
        let inode = BkeyVal::Inode(Inode::default());
        let bytes = inode.encode();
        let err = BkeyVal::decode(TAG_INODE, &bytes[..8]).unwrap_err();
        assert!(matches!(err, Error::FatalCorruption(_)));
    }

    #[test]
    fn extent_interval_and_overlap() {
        let a = Bkey::new_extent(Bpos::new(1, 100, 5), 20, BkeyVal::Deleted);
        assert_eq!(a.start(), Bpos::new(1, 80, 5));

        let b = Bkey::new_extent(Bpos::new(1, 90, 5), 20, BkeyVal::Deleted);
        assert!(a.overlaps(&b));

        // Touching end-to-start is not an overlap.
        let c = Bkey::new_extent(Bpos::new(1, 120, 5), 20, BkeyVal::Deleted);
        assert!(!a.overlaps(&c));

        // Different snapshot lines never overlap.
        let d = Bkey::new_extent(Bpos::new(1, 90, 6), 20, BkeyVal::Deleted);
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn validate_rejects_malformed_keys() {
        let zero_extent = Bkey::new(Bpos::new(1, 8, 0), BkeyVal::Extent(Extent::default()));
        assert!(zero_extent.validate().is_err());

        let sized_inode = Bkey {
            size: 8,
            ..Bkey::new(Bpos::new(1, 0, 0), BkeyVal::Inode(Inode::default()))
        };
        assert!(sized_inode.validate().is_err());

        let empty_dirent = Bkey::new(Bpos::new(1, 0, 0), BkeyVal::Dirent(Dirent::default()));
        assert!(empty_dirent.validate().is_err());

        let ok = Bkey::new(Bpos::new(1, 0, 0), BkeyVal::Inode(Inode::default()));
        assert!(ok.validate().is_ok());
    }
}
