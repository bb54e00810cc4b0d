//! # Engine Error Types
//!
//! Every fallible operation in the engine returns [`Error`] through the
//! [`Result`] alias. Errors fall into three families with very different
//! propagation rules:
//!
//! - **Restarts** ([`Error::Restart`]) are expected control flow. Any lock
//!   acquisition that would block, any stale lock sequence, and any resource
//!   wait that must happen outside tree locks is expressed as a restart. The
//!   enclosing [`Trans::run`](crate::transaction::Trans::run) loop absorbs
//!   them in the same thread; they are never surfaced past that loop.
//!
//! - **Normal signals** (`Enoent`, `Eexist`, `KeyTypeMismatch`, `NoSpace`)
//!   propagate to the caller without logging.
//!
//! - **Fatal conditions** (`FatalCorruption`, unrecovered I/O errors) flip
//!   the filesystem into emergency read-only; subsequent commits fail fast
//!   with `EmergencyReadonly`.
//!
//! The restart sub-kind ([`RestartReason`]) exists for instrumentation and
//! fault injection: the filesystem handle counts restarts per reason.

use thiserror::Error;

/// Why a transaction restart was requested.
///
/// Restart reasons never change the recovery action (drop all locks, call
/// `begin`, retry); they exist so contention can be attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A lock acquisition out of tree order would have blocked.
    WouldBlock,
    /// A cached node was cannibalized and its slot reused.
    LockNodeReused,
    /// A lock sequence changed between unlock and relock.
    RelockFail,
    /// The journal needs reclaim before a reservation can be granted.
    JournalReclaim,
    /// The current journal buffer is sealed and the next is not yet open.
    JournalFull,
    /// Transaction-owned memory was reallocated, invalidating borrows.
    MemRealloced,
    /// A path needs more locks than it currently holds; retraverse.
    Upgrade,
    /// A leaf split changed the topology; retraverse and retry.
    Split,
    /// Restart propagated out of a nested transaction scope.
    Nested,
}

/// All restart reasons, for iteration over per-reason counters.
pub const RESTART_REASONS: [RestartReason; 9] = [
    RestartReason::WouldBlock,
    RestartReason::LockNodeReused,
    RestartReason::RelockFail,
    RestartReason::JournalReclaim,
    RestartReason::JournalFull,
    RestartReason::MemRealloced,
    RestartReason::Upgrade,
    RestartReason::Split,
    RestartReason::Nested,
];

impl RestartReason {
    pub fn index(self) -> usize {
        match self {
            RestartReason::WouldBlock => 0,
            RestartReason::LockNodeReused => 1,
            RestartReason::RelockFail => 2,
            RestartReason::JournalReclaim => 3,
            RestartReason::JournalFull => 4,
            RestartReason::MemRealloced => 5,
            RestartReason::Upgrade => 6,
            RestartReason::Split => 7,
            RestartReason::Nested => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestartReason::WouldBlock => "would_block",
            RestartReason::LockNodeReused => "lock_node_reused",
            RestartReason::RelockFail => "relock_fail",
            RestartReason::JournalReclaim => "journal_reclaim",
            RestartReason::JournalFull => "journal_full",
            RestartReason::MemRealloced => "mem_realloced",
            RestartReason::Upgrade => "upgrade",
            RestartReason::Split => "split",
            RestartReason::Nested => "nested",
        }
    }
}

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transaction restart: {}", .0.as_str())]
    Restart(RestartReason),

    #[error("no space left on device")]
    NoSpace,

    #[error("read error: {0}")]
    IoRead(String),

    #[error("write error: {0}")]
    IoWrite(String),

    #[error("fatal corruption: {0}")]
    FatalCorruption(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("not found")]
    Enoent,

    #[error("already exists")]
    Eexist,

    #[error("key type mismatch: expected {expected}, found {found}")]
    KeyTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("too many iterators; commit and restart the transaction")]
    TooManyIters,

    #[error("filesystem is in emergency read-only mode")]
    EmergencyReadonly,

    #[error("option can only be changed on an open filesystem")]
    OptionNeedsOpenFs,
}

impl Error {
    /// True for errors the transaction run loop recovers by retrying.
    pub fn is_restart(&self) -> bool {
        matches!(self, Error::Restart(_))
    }

    pub fn restart_reason(&self) -> Option<RestartReason> {
        match self {
            Error::Restart(r) => Some(*r),
            _ => None,
        }
    }

    /// Remap a restart escaping a nested transaction scope so the outer loop
    /// can tell it apart in counters.
    pub fn into_nested(self) -> Error {
        match self {
            Error::Restart(_) => Error::Restart(RestartReason::Nested),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_is_recoverable() {
        let err = Error::Restart(RestartReason::RelockFail);
        assert!(err.is_restart());
        assert_eq!(err.restart_reason(), Some(RestartReason::RelockFail));
        assert!(!Error::NoSpace.is_restart());
    }

    #[test]
    fn nested_remap_preserves_non_restarts() {
        let err = Error::Restart(RestartReason::WouldBlock).into_nested();
        assert_eq!(err.restart_reason(), Some(RestartReason::Nested));

        let err = Error::Enoent.into_nested();
        assert!(matches!(err, Error::Enoent));
    }

    #[test]
    fn reason_indices_are_dense() {
        for (i, reason) in RESTART_REASONS.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }
}
