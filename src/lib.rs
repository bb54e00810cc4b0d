//! # bforest - Copy-on-Write B+Tree Transaction Engine
//!
//! bforest is the core of a copy-on-write, multi-device filesystem: every
//! on-disk structure — extents, inodes, directory entries, allocation
//! records, snapshots — is a key in a family of ordered B+trees, and every
//! logical operation is a transaction over those trees. This crate
//! prioritizes:
//!
//! - **Crash atomicity**: a write-ahead journal of keys is the only
//!   commit point; nodes are immutable once written (all updates are COW)
//! - **Restart-based concurrency**: no lock ever blocks out of tree
//!   order; contention is resolved by transparently retrying transactions
//! - **Dense on-disk layout**: variable-width packed keys, log-structured
//!   nodes, checksums on every independently readable unit
//!
//! ## Quick Start
//!
//! ```ignore
//! use bforest::{Fs, FsOpts, Trans, BtreeId, Bkey, Bpos, CommitFlags};
//!
//! let fs = Fs::format(devices, FsOpts::default())?;
//!
//! let seq = Trans::run(&fs, |trans| {
//!     let mut seq = 0;
//!     trans.btree_insert(BtreeId::Inodes, inode_key.clone())?;
//!     trans.commit(None, Some(&mut seq), CommitFlags::default())?;
//!     Ok(seq)
//! })?;
//! fs.fsync(seq)?;
//! ```
//!
//! ## Architecture
//!
//! bforest uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Transactions (paths, iterators)        │
//! ├─────────────────────────────────────────┤
//! │   Commit Path   │   Snapshot Overlay     │
//! ├─────────────────┼───────────────────────┤
//! │   Node Cache    │   Btree Key Cache      │
//! ├─────────────────────────────────────────┤
//! │   Nodes (bsets, packed keys, formats)    │
//! ├─────────────────────────────────────────┤
//! │   Journal   │  Allocator  │  Superblock  │
//! ├─────────────────────────────────────────┤
//! │   Block Device Layer (sector I/O)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! ```text
//! device
//! ├── sector 7         # layout header (where the superblocks live)
//! ├── sector 8         # superblock (+ backup at sector 24)
//! ├── journal buckets  # ring of jsets: the write-ahead key log
//! ├── btree buckets    # immutable nodes: header + checksummed bsets
//! └── data buckets     # extent payloads addressed by extent keys
//! ```
//!
//! ## Concurrency Model
//!
//! Transactions are owned by one thread each and never suspend: any
//! acquisition that would block out of tree order, any stale lock
//! sequence, and any resource wait is surfaced as a transaction restart
//! which [`Trans::run`] absorbs by retrying the closure. Blocking happens
//! only in the journal, the block layer, and explicit backoff sleeps —
//! always outside tree locks.
//!
//! ## Module Overview
//!
//! - [`key`]: positions, typed keys, packed encodings, bsets, merging
//! - [`node`]: btree nodes, on-disk node format, the node cache
//! - [`locking`]: the three-level (read/intent/write) node lock
//! - [`journal`]: jsets, reservations, flush boundaries, replay
//! - [`alloc`]: bucket allocator interface and reservations
//! - [`snapshots`]: snapshot table and ancestor queries
//! - [`superblock`]: bootstrap record and format options
//! - [`transaction`]: transactions, paths, iterators, commit, key cache
//! - [`fs`]: the filesystem handle (format / open / flush / unmount)

pub mod alloc;
pub mod codec;
pub mod config;
pub mod errors;
pub mod fs;
pub mod io;
pub mod journal;
pub mod key;
pub mod locking;
pub mod node;
pub mod snapshots;
pub mod superblock;
pub mod transaction;

pub use errors::{Error, RestartReason, Result};
pub use fs::{Counters, Fs, RecoveryInfo};
pub use io::{BlockDev, FileDev, MemDev};
pub use key::{Bkey, BkeyVal, Bpos, BtreeId, DataType, POS_MAX, POS_MIN};
pub use superblock::FsOpts;
pub use transaction::commit::CommitFlags;
pub use transaction::iter::{BtreeIter, IterFlags};
pub use transaction::Trans;
