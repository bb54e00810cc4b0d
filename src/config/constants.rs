//! # bforest Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! SECTOR_SIZE (512 bytes)
//!       │
//!       ├─> DEFAULT_BTREE_NODE_SIZE (must be a multiple)
//!       ├─> DEFAULT_BUCKET_SIZE (must be a multiple, >= node size)
//!       ├─> SB_LAYOUT_SECTOR / SB_SECTOR (fixed on-disk addresses)
//!       └─> JOURNAL_BUF_BYTES (jsets are written in whole sectors)
//!
//! DEFAULT_BTREE_NODE_SIZE (256 KiB)
//!       │
//!       ├─> NODE_HEADER_SIZE + bset payload must fit within it
//!       └─> BKEY_U64S_MAX (a single key must always fit in a half-full node)
//!
//! JOURNAL_BUF_U64S
//!       │
//!       └─> JOURNAL_ENTRY_MAX_U64S + JOURNAL_SPLIT_HEADROOM_U64S must fit,
//!           or a reservation could never be satisfied and commits would
//!           restart forever.
//!
//! BTREE_ITER_MAX_SOFT / BTREE_ITER_MAX_HARD
//!       │
//!       └─> Path arrays are allocated at the hard bound; exceeding the soft
//!           bound returns `too_many_iters` recommending commit + restart.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `DEFAULT_BTREE_NODE_SIZE % SECTOR_SIZE == 0`
//! 2. `DEFAULT_BUCKET_SIZE >= DEFAULT_BTREE_NODE_SIZE`
//! 3. `JOURNAL_ENTRY_MAX_U64S + JOURNAL_SPLIT_HEADROOM_U64S < JOURNAL_BUF_U64S`
//! 4. `BTREE_ITER_MAX_SOFT <= BTREE_ITER_MAX_HARD`

// ============================================================================
// ON-DISK GEOMETRY
// These define the fundamental units of I/O used throughout the engine
// ============================================================================

/// Size of a device sector in bytes. All on-disk addresses are sector-based.
pub const SECTOR_SIZE: usize = 512;

/// Default filesystem block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default size of a btree node in bytes (256 KiB).
/// A node is the unit of btree I/O; it holds one or more bsets.
pub const DEFAULT_BTREE_NODE_SIZE: usize = 256 * 1024;

/// Default size of an allocation bucket in bytes (512 KiB).
/// Buckets are the smallest unit handed out by the allocator; a btree node
/// occupies the front of exactly one bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 512 * 1024;

/// Sector holding the superblock layout header.
pub const SB_LAYOUT_SECTOR: u64 = 7;

/// Sector holding the primary superblock.
pub const SB_SECTOR: u64 = 8;

/// Sector holding the backup superblock.
pub const SB_BACKUP_SECTOR: u64 = 24;

/// Maximum encoded superblock size in sectors (8 KiB).
pub const SB_MAX_SECTORS: u64 = 16;

const _: () = assert!(
    DEFAULT_BTREE_NODE_SIZE % SECTOR_SIZE == 0,
    "btree nodes are written in whole sectors"
);
const _: () = assert!(
    DEFAULT_BUCKET_SIZE >= DEFAULT_BTREE_NODE_SIZE,
    "a btree node must fit in a single bucket"
);

// ============================================================================
// KEY AND NODE LIMITS
// ============================================================================

/// Maximum depth of any btree (level 0 = leaf). Four levels of 256 KiB nodes
/// address far more keys than any filesystem will hold.
pub const BTREE_MAX_DEPTH: usize = 4;

/// Maximum size of a single encoded key in u64 words (header + value).
pub const BKEY_U64S_MAX: usize = 128;

/// Number of bsets a node may accumulate before a compaction merges them.
pub const MAX_BSETS_BEFORE_COMPACT: usize = 3;

/// Fraction (out of 4) of the node payload that may be used before a split
/// is forced. Splitting at 3/4 leaves room for the split keys themselves.
pub const NODE_SPLIT_NUMERATOR: usize = 3;
pub const NODE_SPLIT_DENOMINATOR: usize = 4;

const _: () = assert!(
    BKEY_U64S_MAX * 8 * 2 < DEFAULT_BTREE_NODE_SIZE,
    "a maximal key must fit in each half of a split node"
);

// ============================================================================
// NODE CACHE
// ============================================================================

/// Default bound on resident nodes in the node cache.
pub const CACHE_DEFAULT_NODES: usize = 128;

/// Consecutive SIEVE hand sweeps before a cache allocation gives up and
/// escalates to the cannibalize path.
pub const CACHE_EVICT_SWEEPS: usize = 2;

// ============================================================================
// JOURNAL
// These constants are tightly coupled - changing one may require changing others
// ============================================================================

/// Capacity of one in-memory journal buffer in u64 words (256 KiB).
pub const JOURNAL_BUF_U64S: usize = 32 * 1024;

/// Upper bound on the u64s of a single journal reservation.
pub const JOURNAL_ENTRY_MAX_U64S: usize = 8 * 1024;

/// Headroom added to every commit reservation so that the parent-pointer
/// updates journaled by a leaf split always fit in the same jset.
pub const JOURNAL_SPLIT_HEADROOM_U64S: usize = 64;

/// Minimum number of journal buckets a device must provide.
pub const JOURNAL_MIN_BUCKETS: usize = 4;

const _: () = assert!(
    JOURNAL_ENTRY_MAX_U64S + JOURNAL_SPLIT_HEADROOM_U64S < JOURNAL_BUF_U64S,
    "a maximal reservation plus split headroom must fit in one journal buffer"
);

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Soft bound on the number of paths a transaction may hold. Exceeding it
/// returns `too_many_iters`, recommending commit + restart.
pub const BTREE_ITER_MAX_SOFT: usize = 64;

/// Hard bound on the number of paths; the path array is allocated at this
/// size and never grows.
pub const BTREE_ITER_MAX_HARD: usize = 96;

/// Consecutive restarts of one transaction before the run loop starts
/// applying backoff sleeps.
pub const RESTART_BACKOFF_THRESHOLD: u32 = 8;

/// Upper bound on a single restart backoff sleep, in microseconds.
pub const RESTART_BACKOFF_MAX_US: u64 = 1000;

const _: () = assert!(
    BTREE_ITER_MAX_SOFT <= BTREE_ITER_MAX_HARD,
    "the soft path bound must not exceed the allocated hard bound"
);

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Width of the per-snapshot ancestor bitmap: ancestors within this many IDs
/// are answered by a single bit test, everything further via the skiplist.
pub const IS_ANCESTOR_BITMAP: u32 = 128;

/// Number of skiplist entries per snapshot table entry.
pub const SNAPSHOT_SKIP_ENTRIES: usize = 3;

// ============================================================================
// KEY CACHE
// ============================================================================

/// Number of shards in the btree key cache. More shards, less contention.
pub const KEY_CACHE_SHARDS: usize = 16;

const _: () = assert!(
    KEY_CACHE_SHARDS.is_power_of_two(),
    "shard selection masks the hash, so the count must be a power of two"
);
