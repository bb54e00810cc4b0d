//! # On-Disk Node Format
//!
//! A node occupies the front of one bucket:
//!
//! ```text
//! +---------------------+
//! | Node Header (128B)  |  magic, identity, bounds, key format, checksum
//! +---------------------+
//! | Bset Header (24B)   |  length, key count, checksum
//! | key bytes ...       |
//! +---------------------+
//! | Bset Header (24B)   |  (up to MAX_BSETS_BEFORE_COMPACT + 1 runs)
//! | key bytes ...       |
//! +---------------------+
//! | zero fill           |
//! +---------------------+
//! ```
//!
//! All multi-byte integers are little-endian; the headers are zerocopy
//! structs so encode/decode is a bounds check plus a transmute. The header
//! checksum covers the header body (everything after the checksum field,
//! nonce = node seq); each bset checksum covers its key bytes (nonce = node
//! seq + bset index), so a torn write is caught per run and verification
//! proceeds in order until the first bad bset.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::codec::{self, ChecksumType};
use crate::errors::{Error, Result};
use crate::key::{BkeyField, BkeyFormat, Bpos, Bset, BtreeId};
use crate::node::Node;

pub const NODE_MAGIC: &[u8; 8] = b"bfornode";
pub const NODE_DISK_HEADER_SIZE: usize = 128;
pub const BSET_DISK_HEADER_SIZE: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeDiskHeader {
    magic: [u8; 8],
    csum: U64,
    btree_id: u8,
    level: u8,
    flags: U16,
    nr_bsets: U16,
    _pad0: U16,
    seq: U64,
    min_inode: U64,
    min_offset: U64,
    min_snapshot: U32,
    _pad1: U32,
    max_inode: U64,
    max_offset: U64,
    max_snapshot: U32,
    _pad2: U32,
    fmt_offsets: [U64; 4],
    fmt_bits: [u8; 4],
    _pad3: [u8; 4],
    sectors_written: U32,
    _pad4: U32,
}

const _: () = assert!(std::mem::size_of::<NodeDiskHeader>() == NODE_DISK_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BsetDiskHeader {
    /// Key payload length in u64 words.
    u64s: U32,
    nr_keys: U32,
    csum: U64,
    flags: U32,
    _pad: U32,
}

const _: () = assert!(std::mem::size_of::<BsetDiskHeader>() == BSET_DISK_HEADER_SIZE);

/// Encode `node` into a buffer of exactly `node_size` bytes.
pub fn encode_node(node: &Node, csum_type: ChecksumType, node_size: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; node_size];
    let mut off = NODE_DISK_HEADER_SIZE;

    for (idx, bset) in node.bsets.iter().enumerate() {
        let data = bset.data();
        if off + BSET_DISK_HEADER_SIZE + data.len() > node_size {
            return Err(Error::FatalCorruption(format!(
                "{} node seq {} overflows {} byte buffer",
                node.btree_id, node.seq, node_size
            )));
        }
        let header = BsetDiskHeader {
            u64s: U32::new(bset.u64s() as u32),
            nr_keys: U32::new(bset.len() as u32),
            csum: U64::new(codec::checksum(
                csum_type,
                node.seq.wrapping_add(idx as u64),
                data,
            )),
            flags: U32::new(0),
            _pad: U32::new(0),
        };
        out[off..off + BSET_DISK_HEADER_SIZE].copy_from_slice(header.as_bytes());
        off += BSET_DISK_HEADER_SIZE;
        out[off..off + data.len()].copy_from_slice(data);
        off += data.len();
    }

    let sectors_written = off.div_ceil(crate::config::SECTOR_SIZE) as u32;
    let mut header = NodeDiskHeader {
        magic: *NODE_MAGIC,
        csum: U64::new(0),
        btree_id: node.btree_id as u8,
        level: node.level,
        flags: U16::new(0),
        nr_bsets: U16::new(node.bsets.len() as u16),
        _pad0: U16::new(0),
        seq: U64::new(node.seq),
        min_inode: U64::new(node.min_key.inode),
        min_offset: U64::new(node.min_key.offset),
        min_snapshot: U32::new(node.min_key.snapshot),
        _pad1: U32::new(0),
        max_inode: U64::new(node.max_key.inode),
        max_offset: U64::new(node.max_key.offset),
        max_snapshot: U32::new(node.max_key.snapshot),
        _pad2: U32::new(0),
        fmt_offsets: node.format.fields.map(|f| U64::new(f.offset)),
        fmt_bits: node.format.fields.map(|f| f.bits),
        _pad3: [0; 4],
        sectors_written: U32::new(sectors_written),
        _pad4: U32::new(0),
    };
    let body_csum = codec::checksum(csum_type, node.seq, &header.as_bytes()[16..]);
    header.csum = U64::new(body_csum);
    out[..NODE_DISK_HEADER_SIZE].copy_from_slice(header.as_bytes());
    Ok(out)
}

/// Decode and verify a node image. `expect` optionally pins the identity the
/// caller's pointer promised; a mismatch means the bucket was reused.
pub fn decode_node(
    bytes: &[u8],
    csum_type: ChecksumType,
    expect: Option<(BtreeId, u8, u64)>,
) -> Result<Node> {
    if bytes.len() < NODE_DISK_HEADER_SIZE {
        return Err(Error::FatalCorruption("node image too small".into()));
    }
    let header = NodeDiskHeader::ref_from_bytes(&bytes[..NODE_DISK_HEADER_SIZE])
        .map_err(|e| Error::FatalCorruption(format!("bad node header: {e:?}")))?;

    if header.magic != *NODE_MAGIC {
        return Err(Error::FatalCorruption("bad node magic".into()));
    }
    let seq = header.seq.get();
    let body_csum = codec::checksum(csum_type, seq, &bytes[16..NODE_DISK_HEADER_SIZE]);
    if body_csum != header.csum.get() {
        return Err(Error::FatalCorruption(format!(
            "node header checksum mismatch at seq {seq}"
        )));
    }

    let btree_id = BtreeId::from_raw(header.btree_id)?;
    if let Some((want_id, want_level, want_seq)) = expect {
        if btree_id != want_id || header.level != want_level || seq != want_seq {
            return Err(Error::FatalCorruption(format!(
                "node identity mismatch: found {}:{} seq {}, expected {}:{} seq {}",
                btree_id, header.level, seq, want_id, want_level, want_seq
            )));
        }
    }

    let format = BkeyFormat {
        fields: [0, 1, 2, 3].map(|i| BkeyField {
            offset: header.fmt_offsets[i].get(),
            bits: header.fmt_bits[i],
        }),
    };

    let mut node = Node {
        btree_id,
        level: header.level,
        seq,
        min_key: Bpos::new(
            header.min_inode.get(),
            header.min_offset.get(),
            header.min_snapshot.get(),
        ),
        max_key: Bpos::new(
            header.max_inode.get(),
            header.max_offset.get(),
            header.max_snapshot.get(),
        ),
        format,
        bsets: Vec::with_capacity(header.nr_bsets.get() as usize),
        dirty: false,
    };

    let mut off = NODE_DISK_HEADER_SIZE;
    for idx in 0..header.nr_bsets.get() as usize {
        if off + BSET_DISK_HEADER_SIZE > bytes.len() {
            return Err(Error::FatalCorruption(format!(
                "bset {idx} header out of bounds in node seq {seq}"
            )));
        }
        let bh = BsetDiskHeader::ref_from_bytes(&bytes[off..off + BSET_DISK_HEADER_SIZE])
            .map_err(|e| Error::FatalCorruption(format!("bad bset header: {e:?}")))?;
        off += BSET_DISK_HEADER_SIZE;

        let len = bh.u64s.get() as usize * 8;
        if off + len > bytes.len() {
            return Err(Error::FatalCorruption(format!(
                "bset {idx} data out of bounds in node seq {seq}"
            )));
        }
        let data = &bytes[off..off + len];
        let csum = codec::checksum(csum_type, seq.wrapping_add(idx as u64), data);
        if csum != bh.csum.get() {
            return Err(Error::FatalCorruption(format!(
                "bset {idx} checksum mismatch in node seq {seq}"
            )));
        }

        node.bsets.push(Bset::from_bytes(format, data, bh.nr_keys.get())?);
        off += len;
    }

    Ok(node)
}

/// Sector count a node image occupies, read from the header without full
/// decode; lets re-reads of evicted nodes issue exactly-sized I/O.
pub fn peek_sectors_written(bytes: &[u8]) -> Result<u32> {
    let header = NodeDiskHeader::ref_from_bytes(&bytes[..NODE_DISK_HEADER_SIZE])
        .map_err(|e| Error::FatalCorruption(format!("bad node header: {e:?}")))?;
    if header.magic != *NODE_MAGIC {
        return Err(Error::FatalCorruption("bad node magic".into()));
    }
    Ok(header.sectors_written.get())
}
