//! # Keys, Positions and Bsets
//!
//! Everything stored in a btree is a typed key ordered by a three-component
//! position. This module owns the whole key data path:
//!
//! - [`pos`]: the `(inode, offset, snapshot)` position triple and its order
//! - [`bkey`]: typed key values, their little-endian encodings, validation
//! - [`packed`]: dense variable-width key encoding with per-bset formats
//! - [`bset`]: sorted runs of packed keys with an eytzinger prefix index
//! - [`merge`]: the newest-wins merged view across a node's bsets
//!
//! It also defines [`BtreeId`], the closed family of trees every key lives
//! in, together with the per-tree flags (extent semantics, snapshot
//! awareness, key-cache participation) and the key types each tree permits.

pub mod bkey;
pub mod bset;
pub mod merge;
pub mod packed;
pub mod pos;

pub use bkey::{Bkey, BkeyVal, DataType};
pub use bset::Bset;
pub use merge::MergeIter;
pub use packed::{BkeyField, BkeyFormat};
pub use pos::{Bpos, POS_MAX, POS_MIN};

use crate::key::bkey::{
    TAG_ALLOC, TAG_BTREE_PTR, TAG_DELETED, TAG_DIRENT, TAG_EXTENT, TAG_INLINE_DATA, TAG_INODE,
    TAG_REFLINK_P, TAG_REFLINK_V, TAG_SNAPSHOT, TAG_STRIPE, TAG_SUBVOLUME, TAG_WHITEOUT,
    TAG_XATTR,
};
use crate::errors::{Error, Result};

/// Identity of one btree in the fixed family. The numeric values are on-disk
/// format (journal entries and node headers record them); append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
    Xattrs = 3,
    Alloc = 4,
    Stripes = 5,
    Reflink = 6,
    Subvolumes = 7,
    Snapshots = 8,
}

/// Number of btrees; array-per-tree state is sized by this.
pub const NR_BTREES: usize = 9;

/// All tree IDs in numeric order.
pub const ALL_BTREES: [BtreeId; NR_BTREES] = [
    BtreeId::Extents,
    BtreeId::Inodes,
    BtreeId::Dirents,
    BtreeId::Xattrs,
    BtreeId::Alloc,
    BtreeId::Stripes,
    BtreeId::Reflink,
    BtreeId::Subvolumes,
    BtreeId::Snapshots,
];

impl BtreeId {
    pub fn from_raw(raw: u8) -> Result<Self> {
        ALL_BTREES
            .get(raw as usize)
            .copied()
            .ok_or_else(|| Error::FatalCorruption(format!("invalid btree id {raw}")))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BtreeId::Extents => "extents",
            BtreeId::Inodes => "inodes",
            BtreeId::Dirents => "dirents",
            BtreeId::Xattrs => "xattrs",
            BtreeId::Alloc => "alloc",
            BtreeId::Stripes => "stripes",
            BtreeId::Reflink => "reflink",
            BtreeId::Subvolumes => "subvolumes",
            BtreeId::Snapshots => "snapshots",
        }
    }

    /// Keys carry `[start, end)` ranges; iteration advances by extent size.
    pub fn is_extents(self) -> bool {
        matches!(self, BtreeId::Extents | BtreeId::Reflink)
    }

    /// Positions carry live snapshot IDs and lookups walk the ancestor chain.
    pub fn has_snapshots(self) -> bool {
        matches!(
            self,
            BtreeId::Extents | BtreeId::Inodes | BtreeId::Dirents | BtreeId::Xattrs
        )
    }

    /// Reads and writes go through the btree key cache.
    pub fn is_cached(self) -> bool {
        matches!(self, BtreeId::Alloc)
    }

    /// Schema check: which key types this tree stores. `deleted` and
    /// `whiteout` are permitted everywhere; btree pointers live in interior
    /// nodes of every tree.
    pub fn permits(self, tag: u8) -> bool {
        if matches!(tag, TAG_DELETED | TAG_WHITEOUT | TAG_BTREE_PTR) {
            return true;
        }
        match self {
            BtreeId::Extents => matches!(tag, TAG_EXTENT | TAG_REFLINK_P | TAG_INLINE_DATA),
            BtreeId::Inodes => tag == TAG_INODE,
            BtreeId::Dirents => tag == TAG_DIRENT,
            BtreeId::Xattrs => tag == TAG_XATTR,
            BtreeId::Alloc => tag == TAG_ALLOC,
            BtreeId::Stripes => tag == TAG_STRIPE,
            BtreeId::Reflink => matches!(tag, TAG_REFLINK_V | TAG_INLINE_DATA),
            BtreeId::Subvolumes => tag == TAG_SUBVOLUME,
            BtreeId::Snapshots => tag == TAG_SNAPSHOT,
        }
    }
}

impl std::fmt::Display for BtreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
