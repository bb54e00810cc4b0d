//! # Superblock
//!
//! The superblock is the bootstrap record: filesystem identity, per-device
//! geometry, format options, the journal bucket list, and — after a clean
//! unmount — the latest btree roots so mount can skip journal replay
//! entirely.
//!
//! ## On-disk layout
//!
//! A layout header at sector 7 names where the superblock copies live
//! (primary at sector 8, backup at sector 24 by default). Each copy is a
//! fixed header followed by TLV fields:
//!
//! ```text
//! +--------------------+
//! | Sb Header (128B)   |  magic, uuid, seq, options, field payload length
//! +--------------------+
//! | Field Header (8B)  |  type, payload words
//! | payload ...        |  members | journal v1 | journal v2 | clean | ...
//! +--------------------+
//! ```
//!
//! Unknown field types are skipped on read (forward compatibility). The
//! journal bucket list has two encodings: v1 lists individual buckets, v2
//! lists ranges; both decode to the same in-memory form and the encoder
//! picks v2 when the buckets are contiguous enough to profit.
//!
//! All integers are little-endian; the whole copy is checksummed with the
//! superblock seq as nonce, and the copy with the highest valid seq wins at
//! mount.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::codec::{self, ChecksumType, CompressionType, StrHashType};
use crate::config::{
    DEFAULT_BLOCK_SIZE, DEFAULT_BTREE_NODE_SIZE, DEFAULT_BUCKET_SIZE, SB_BACKUP_SECTOR,
    SB_LAYOUT_SECTOR, SB_MAX_SECTORS, SB_SECTOR, SECTOR_SIZE,
};
use crate::errors::{Error, Result};
use crate::io::BlockDev;
use crate::journal::JournalBucket;
use crate::key::{packed, Bkey, BkeyFormat, BtreeId};

pub const SB_MAGIC: &[u8; 16] = b"bforest_sb_v1\x00\x00\x00";
pub const LAYOUT_MAGIC: &[u8; 8] = b"bforlayt";
pub const SB_HEADER_SIZE: usize = 128;
pub const SB_FIELD_HEADER_SIZE: usize = 8;
pub const SB_VERSION: u32 = 1;

const FIELD_MEMBERS: u16 = 0;
const FIELD_JOURNAL_V1: u16 = 1;
const FIELD_JOURNAL_V2: u16 = 2;
const FIELD_CLEAN: u16 = 3;
const FIELD_BLACKLIST: u16 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SbHeader {
    magic: [u8; 16],
    csum: U64,
    seq: U64,
    version: U32,
    flags: U32,
    block_size: U32,
    btree_node_size: U32,
    bucket_size: U32,
    nr_devices: U32,
    csum_type: u8,
    compression_type: u8,
    str_hash_type: u8,
    replicas: u8,
    clean: u8,
    _pad0: [u8; 3],
    features: U64,
    /// TLV payload length in u64 words.
    u64s: U32,
    _pad1: U32,
    /// First 16 bytes hold the filesystem UUID.
    reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<SbHeader>() == SB_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SbFieldHeader {
    /// Payload words, excluding this header.
    u64s: U32,
    ty: U16,
    _pad: U16,
}

const _: () = assert!(std::mem::size_of::<SbFieldHeader>() == SB_FIELD_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LayoutHeader {
    magic: [u8; 8],
    nr_superblocks: u8,
    _pad: [u8; 7],
    offsets: [U64; 2],
}

/// Format-time options, persisted in the superblock header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOpts {
    pub block_size: u32,
    pub btree_node_size: u32,
    /// Bucket size in bytes; uniform across devices.
    pub bucket_size: u32,
    pub csum_type: ChecksumType,
    pub compression: CompressionType,
    pub str_hash: StrHashType,
    pub replicas: u8,
}

impl Default for FsOpts {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            btree_node_size: DEFAULT_BTREE_NODE_SIZE as u32,
            bucket_size: DEFAULT_BUCKET_SIZE as u32,
            csum_type: ChecksumType::Crc64,
            compression: CompressionType::None,
            str_hash: StrHashType::Siphash,
            replicas: 1,
        }
    }
}

impl FsOpts {
    pub fn bucket_sectors(&self) -> u32 {
        self.bucket_size / SECTOR_SIZE as u32
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(Error::UnsupportedFeature(msg.into()));
        if self.block_size % SECTOR_SIZE as u32 != 0 {
            return bad("block size must be a sector multiple");
        }
        if self.btree_node_size % SECTOR_SIZE as u32 != 0 {
            return bad("btree node size must be a sector multiple");
        }
        if self.bucket_size < self.btree_node_size {
            return bad("buckets must hold at least one btree node");
        }
        if self.replicas == 0 {
            return bad("replicas must be at least 1");
        }
        Ok(())
    }
}

/// One member device's geometry and identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbMember {
    pub uuid: [u8; 16],
    pub nbuckets: u64,
    pub first_bucket: u64,
    pub bucket_sectors: u32,
}

/// A tree root captured at clean shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanRoot {
    pub btree_id: BtreeId,
    pub level: u8,
    pub ptr: Bkey,
}

/// Written only at unmount; present iff the filesystem is clean.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CleanSection {
    pub journal_seq: u64,
    pub roots: Vec<CleanRoot>,
}

/// In-memory superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub uuid: [u8; 16],
    pub seq: u64,
    pub features: u64,
    pub opts: FsOpts,
    pub members: Vec<SbMember>,
    pub journal: Vec<JournalBucket>,
    pub clean: Option<CleanSection>,
    pub blacklist: Vec<(u64, u64)>,
}

impl SuperBlock {
    pub fn new(uuid: [u8; 16], opts: FsOpts) -> Self {
        Self {
            uuid,
            seq: 1,
            features: 0,
            opts,
            members: Vec::new(),
            journal: Vec::new(),
            clean: None,
            blacklist: Vec::new(),
        }
    }
}

/// Best-effort unique identity without an entropy source: wall clock mixed
/// through crc64, twice.
pub fn generate_uuid() -> [u8; 16] {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let a = codec::checksum(ChecksumType::Crc64, 0x75_69_64, &nanos.to_le_bytes());
    let b = codec::checksum(ChecksumType::Crc64, a, &nanos.to_le_bytes());
    let mut uuid = [0u8; 16];
    uuid[..8].copy_from_slice(&a.to_le_bytes());
    uuid[8..].copy_from_slice(&b.to_le_bytes());
    uuid
}

fn push_field(out: &mut Vec<u8>, ty: u16, payload: &[u8]) {
    let mut body = payload.to_vec();
    while body.len() % 8 != 0 {
        body.push(0);
    }
    let header = SbFieldHeader {
        u64s: U32::new((body.len() / 8) as u32),
        ty: U16::new(ty),
        _pad: U16::new(0),
    };
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
}

fn encode_fields(sb: &SuperBlock) -> Vec<u8> {
    let mut out = Vec::new();

    let mut members = Vec::new();
    for m in &sb.members {
        members.extend_from_slice(&m.uuid);
        members.extend_from_slice(&m.nbuckets.to_le_bytes());
        members.extend_from_slice(&m.first_bucket.to_le_bytes());
        members.extend_from_slice(&m.bucket_sectors.to_le_bytes());
        members.extend_from_slice(&0u32.to_le_bytes());
    }
    push_field(&mut out, FIELD_MEMBERS, &members);

    // Journal buckets: ranges when they compress well, the flat list
    // otherwise.
    let ranges = journal_ranges(&sb.journal);
    if ranges.len() * 3 < sb.journal.len() * 2 {
        let mut payload = Vec::new();
        for (dev, start, count) in &ranges {
            payload.extend_from_slice(&dev.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(&start.to_le_bytes());
            payload.extend_from_slice(&count.to_le_bytes());
        }
        push_field(&mut out, FIELD_JOURNAL_V2, &payload);
    } else {
        let mut payload = Vec::new();
        for jb in &sb.journal {
            payload.extend_from_slice(&jb.dev.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(&jb.bucket.to_le_bytes());
        }
        push_field(&mut out, FIELD_JOURNAL_V1, &payload);
    }

    if let Some(clean) = &sb.clean {
        let mut payload = Vec::new();
        payload.extend_from_slice(&clean.journal_seq.to_le_bytes());
        for root in &clean.roots {
            payload.push(root.btree_id as u8);
            payload.push(root.level);
            payload.extend_from_slice(&[0u8; 6]);
            packed::encode_into(&mut payload, &root.ptr, &BkeyFormat::default());
        }
        push_field(&mut out, FIELD_CLEAN, &payload);
    }

    if !sb.blacklist.is_empty() {
        let mut payload = Vec::new();
        for (start, end) in &sb.blacklist {
            payload.extend_from_slice(&start.to_le_bytes());
            payload.extend_from_slice(&end.to_le_bytes());
        }
        push_field(&mut out, FIELD_BLACKLIST, &payload);
    }

    out
}

fn journal_ranges(buckets: &[JournalBucket]) -> Vec<(u32, u64, u64)> {
    let mut ranges: Vec<(u32, u64, u64)> = Vec::new();
    for jb in buckets {
        match ranges.last_mut() {
            Some((dev, start, count)) if *dev == jb.dev && *start + *count == jb.bucket => {
                *count += 1;
            }
            _ => ranges.push((jb.dev, jb.bucket, 1)),
        }
    }
    ranges
}

/// Encode one superblock copy, zero-padded to whole sectors.
pub fn encode_superblock(sb: &SuperBlock) -> Result<Vec<u8>> {
    sb.opts.validate()?;
    let fields = encode_fields(sb);

    let mut header = SbHeader {
        magic: *SB_MAGIC,
        csum: U64::new(0),
        seq: U64::new(sb.seq),
        version: U32::new(SB_VERSION),
        flags: U32::new(0),
        block_size: U32::new(sb.opts.block_size),
        btree_node_size: U32::new(sb.opts.btree_node_size),
        bucket_size: U32::new(sb.opts.bucket_size),
        nr_devices: U32::new(sb.members.len() as u32),
        csum_type: sb.opts.csum_type as u8,
        compression_type: sb.opts.compression as u8,
        str_hash_type: sb.opts.str_hash as u8,
        replicas: sb.opts.replicas,
        clean: sb.clean.is_some() as u8,
        _pad0: [0; 3],
        features: U64::new(sb.features),
        u64s: U32::new((fields.len() / 8) as u32),
        _pad1: U32::new(0),
        reserved: [0; 48],
    };
    // The uuid lives in the reserved area's first 16 bytes to keep the
    // header exactly 128 bytes with natural alignment.
    header.reserved[..16].copy_from_slice(&sb.uuid);

    let total_len = SB_HEADER_SIZE + fields.len();
    if total_len > (SB_MAX_SECTORS as usize) * SECTOR_SIZE {
        return Err(Error::UnsupportedFeature(format!(
            "superblock of {total_len} bytes exceeds the reserved area"
        )));
    }

    let mut body = Vec::with_capacity(total_len);
    body.extend_from_slice(header.as_bytes());
    body.extend_from_slice(&fields);
    let csum = codec::checksum(sb.opts.csum_type, sb.seq, &body[24..]);
    body[16..24].copy_from_slice(&csum.to_le_bytes());

    let padded = total_len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    body.resize(padded, 0);
    Ok(body)
}

/// Decode and verify one superblock copy.
pub fn decode_superblock(bytes: &[u8]) -> Result<SuperBlock> {
    if bytes.len() < SB_HEADER_SIZE {
        return Err(Error::FatalCorruption("superblock image too small".into()));
    }
    let header = SbHeader::ref_from_bytes(&bytes[..SB_HEADER_SIZE])
        .map_err(|e| Error::FatalCorruption(format!("bad superblock header: {e:?}")))?;
    if header.magic != *SB_MAGIC {
        return Err(Error::FatalCorruption("bad superblock magic".into()));
    }
    if header.version.get() > SB_VERSION {
        return Err(Error::UnsupportedFeature(format!(
            "superblock version {} is newer than this implementation",
            header.version.get()
        )));
    }

    let csum_type = ChecksumType::from_raw(header.csum_type)?;
    let fields_len = header.u64s.get() as usize * 8;
    let total = SB_HEADER_SIZE + fields_len;
    if total > bytes.len() {
        return Err(Error::FatalCorruption(
            "superblock fields extend past the image".into(),
        ));
    }
    let csum = codec::checksum(csum_type, header.seq.get(), &bytes[24..total]);
    if csum != header.csum.get() {
        return Err(Error::FatalCorruption("superblock checksum mismatch".into()));
    }

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&header.reserved[..16]);

    let mut sb = SuperBlock {
        uuid,
        seq: header.seq.get(),
        features: header.features.get(),
        opts: FsOpts {
            block_size: header.block_size.get(),
            btree_node_size: header.btree_node_size.get(),
            bucket_size: header.bucket_size.get(),
            csum_type,
            compression: CompressionType::from_raw(header.compression_type)?,
            str_hash: StrHashType::from_raw(header.str_hash_type)?,
            replicas: header.replicas,
        },
        members: Vec::new(),
        journal: Vec::new(),
        clean: None,
        blacklist: Vec::new(),
    };

    let mut off = SB_HEADER_SIZE;
    while off + SB_FIELD_HEADER_SIZE <= total {
        let fh = SbFieldHeader::ref_from_bytes(&bytes[off..off + SB_FIELD_HEADER_SIZE])
            .map_err(|e| Error::FatalCorruption(format!("bad field header: {e:?}")))?;
        off += SB_FIELD_HEADER_SIZE;
        let len = fh.u64s.get() as usize * 8;
        if off + len > total {
            return Err(Error::FatalCorruption("superblock field overruns".into()));
        }
        let payload = &bytes[off..off + len];
        off += len;

        match fh.ty.get() {
            FIELD_MEMBERS => decode_members(&mut sb, payload)?,
            FIELD_JOURNAL_V1 => decode_journal_v1(&mut sb, payload)?,
            FIELD_JOURNAL_V2 => decode_journal_v2(&mut sb, payload)?,
            FIELD_CLEAN => decode_clean(&mut sb, payload, header.clean != 0)?,
            FIELD_BLACKLIST => decode_blacklist(&mut sb, payload)?,
            // Unknown fields are future format extensions; skip them.
            _ => {}
        }
    }

    if sb.members.len() != header.nr_devices.get() as usize {
        return Err(Error::FatalCorruption(format!(
            "superblock names {} devices but the members section has {}",
            header.nr_devices.get(),
            sb.members.len()
        )));
    }
    Ok(sb)
}

fn decode_members(sb: &mut SuperBlock, payload: &[u8]) -> Result<()> {
    const MEMBER_SIZE: usize = 40;
    if payload.len() % MEMBER_SIZE != 0 {
        return Err(Error::FatalCorruption("ragged members section".into()));
    }
    for chunk in payload.chunks_exact(MEMBER_SIZE) {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&chunk[..16]);
        sb.members.push(SbMember {
            uuid,
            nbuckets: u64::from_le_bytes(chunk[16..24].try_into().unwrap()),
            first_bucket: u64::from_le_bytes(chunk[24..32].try_into().unwrap()),
            bucket_sectors: u32::from_le_bytes(chunk[32..36].try_into().unwrap()),
        });
    }
    Ok(())
}

fn decode_journal_v1(sb: &mut SuperBlock, payload: &[u8]) -> Result<()> {
    if payload.len() % 16 != 0 {
        return Err(Error::FatalCorruption("ragged journal v1 section".into()));
    }
    for chunk in payload.chunks_exact(16) {
        sb.journal.push(JournalBucket {
            dev: u32::from_le_bytes(chunk[..4].try_into().unwrap()),
            bucket: u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
        });
    }
    Ok(())
}

fn decode_journal_v2(sb: &mut SuperBlock, payload: &[u8]) -> Result<()> {
    if payload.len() % 24 != 0 {
        return Err(Error::FatalCorruption("ragged journal v2 section".into()));
    }
    for chunk in payload.chunks_exact(24) {
        let dev = u32::from_le_bytes(chunk[..4].try_into().unwrap());
        let start = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
        let count = u64::from_le_bytes(chunk[16..24].try_into().unwrap());
        for bucket in start..start + count {
            sb.journal.push(JournalBucket { dev, bucket });
        }
    }
    Ok(())
}

fn decode_clean(sb: &mut SuperBlock, payload: &[u8], clean_flag: bool) -> Result<()> {
    if !clean_flag {
        return Ok(());
    }
    if payload.len() < 8 {
        return Err(Error::FatalCorruption("short clean section".into()));
    }
    let mut clean = CleanSection {
        journal_seq: u64::from_le_bytes(payload[..8].try_into().unwrap()),
        roots: Vec::new(),
    };
    let mut off = 8usize;
    while off + 8 <= payload.len() {
        let btree_id = BtreeId::from_raw(payload[off])?;
        let level = payload[off + 1];
        off += 8;
        let (ptr, consumed) = packed::decode_from(&payload[off..], &BkeyFormat::default())?
            .ok_or_else(|| Error::FatalCorruption("truncated clean root".into()))?;
        off += consumed;
        clean.roots.push(CleanRoot {
            btree_id,
            level,
            ptr,
        });
    }
    sb.clean = Some(clean);
    Ok(())
}

fn decode_blacklist(sb: &mut SuperBlock, payload: &[u8]) -> Result<()> {
    if payload.len() % 16 != 0 {
        return Err(Error::FatalCorruption("ragged blacklist section".into()));
    }
    for chunk in payload.chunks_exact(16) {
        sb.blacklist.push((
            u64::from_le_bytes(chunk[..8].try_into().unwrap()),
            u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
        ));
    }
    Ok(())
}

/// Write the layout sector plus primary and backup superblock copies.
pub fn write_superblock(dev: &dyn BlockDev, sb: &SuperBlock) -> Result<()> {
    let layout = LayoutHeader {
        magic: *LAYOUT_MAGIC,
        nr_superblocks: 2,
        _pad: [0; 7],
        offsets: [U64::new(SB_SECTOR), U64::new(SB_BACKUP_SECTOR)],
    };
    let mut sector = vec![0u8; SECTOR_SIZE];
    sector[..std::mem::size_of::<LayoutHeader>()].copy_from_slice(layout.as_bytes());
    dev.write(SB_LAYOUT_SECTOR, &sector)?;

    let body = encode_superblock(sb)?;
    dev.write(SB_SECTOR, &body)?;
    dev.write(SB_BACKUP_SECTOR, &body)?;
    dev.flush()
}

/// Read the best superblock copy, falling back to the backup.
pub fn read_superblock(dev: &dyn BlockDev) -> Result<SuperBlock> {
    let mut layout_buf = vec![0u8; SECTOR_SIZE];
    dev.read(SB_LAYOUT_SECTOR, &mut layout_buf)?;
    let layout = LayoutHeader::ref_from_bytes(&layout_buf[..std::mem::size_of::<LayoutHeader>()])
        .map_err(|e| Error::FatalCorruption(format!("bad layout sector: {e:?}")))?;
    let offsets: Vec<u64> = if layout.magic == *LAYOUT_MAGIC {
        layout.offsets[..layout.nr_superblocks.min(2) as usize]
            .iter()
            .map(|o| o.get())
            .collect()
    } else {
        vec![SB_SECTOR, SB_BACKUP_SECTOR]
    };

    let mut best: Option<SuperBlock> = None;
    let mut last_err = None;
    for offset in offsets {
        let mut buf = vec![0u8; SB_MAX_SECTORS as usize * SECTOR_SIZE];
        dev.read(offset, &mut buf)?;
        match decode_superblock(&buf) {
            Ok(sb) => {
                if best.as_ref().map_or(true, |b| sb.seq > b.seq) {
                    best = Some(sb);
                }
            }
            Err(err) => last_err = Some(err),
        }
    }
    best.ok_or_else(|| {
        last_err.unwrap_or_else(|| Error::FatalCorruption("no valid superblock found".into()))
    })
}
