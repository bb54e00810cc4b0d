//! # Key Positions
//!
//! Every key in every btree is ordered by a three-component position:
//! `(inode, offset, snapshot)`. The total order is lexicographic, which gives
//! each inode a contiguous keyspace range, each file offset a contiguous run
//! of snapshot versions, and makes [`POS_MIN`]/[`POS_MAX`] natural iteration
//! sentinels.
//!
//! Snapshot IDs sort *ascending* within a position, and snapshot children
//! always have smaller IDs than their parents. Together these mean a forward
//! scan over one `(inode, offset)` sees the most specific snapshot override
//! first, which is what the snapshot filter in the iterator relies on.

use std::fmt;

/// A position in the keyspace of a btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
}

/// Smallest position; no valid key sorts before it.
pub const POS_MIN: Bpos = Bpos {
    inode: 0,
    offset: 0,
    snapshot: 0,
};

/// Largest position; used as the open end of full-range iteration.
pub const POS_MAX: Bpos = Bpos {
    inode: u64::MAX,
    offset: u64::MAX,
    snapshot: u32::MAX,
};

impl Bpos {
    pub const fn new(inode: u64, offset: u64, snapshot: u32) -> Self {
        Self {
            inode,
            offset,
            snapshot,
        }
    }

    pub const fn with_snapshot(self, snapshot: u32) -> Self {
        Self { snapshot, ..self }
    }

    /// The immediately following position, saturating at [`POS_MAX`].
    pub fn successor(self) -> Self {
        if self.snapshot < u32::MAX {
            return Self {
                snapshot: self.snapshot + 1,
                ..self
            };
        }
        if self.offset < u64::MAX {
            return Self {
                inode: self.inode,
                offset: self.offset + 1,
                snapshot: 0,
            };
        }
        if self.inode < u64::MAX {
            return Self {
                inode: self.inode + 1,
                offset: 0,
                snapshot: 0,
            };
        }
        POS_MAX
    }

    /// The immediately preceding position, saturating at [`POS_MIN`].
    pub fn predecessor(self) -> Self {
        if self.snapshot > 0 {
            return Self {
                snapshot: self.snapshot - 1,
                ..self
            };
        }
        if self.offset > 0 {
            return Self {
                inode: self.inode,
                offset: self.offset - 1,
                snapshot: u32::MAX,
            };
        }
        if self.inode > 0 {
            return Self {
                inode: self.inode - 1,
                offset: u64::MAX,
                snapshot: u32::MAX,
            };
        }
        POS_MIN
    }

    /// Next offset in the same snapshot line; used by slot iteration, which
    /// walks `(inode, offset)` cells rather than raw positions.
    pub fn successor_same_snapshot(self) -> Self {
        if self.offset < u64::MAX {
            Self {
                inode: self.inode,
                offset: self.offset + 1,
                snapshot: self.snapshot,
            }
        } else {
            Self {
                inode: self.inode.saturating_add(1),
                offset: 0,
                snapshot: self.snapshot,
            }
        }
    }

    /// True when both positions name the same `(inode, offset)` cell,
    /// regardless of snapshot.
    pub fn same_cell(self, other: Bpos) -> bool {
        self.inode == other.inode && self.offset == other.offset
    }
}

impl fmt::Display for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inode, self.offset, self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_lexicographic() {
        assert!(Bpos::new(1, 0, 0) < Bpos::new(2, 0, 0));
        assert!(Bpos::new(1, 5, 9) < Bpos::new(1, 6, 0));
        assert!(Bpos::new(1, 5, 1) < Bpos::new(1, 5, 2));
        assert!(POS_MIN < Bpos::new(0, 0, 1));
        assert!(Bpos::new(u64::MAX, u64::MAX, u32::MAX - 1) < POS_MAX);
    }

    #[test]
    fn successor_carries_components() {
        let p = Bpos::new(1, 1, u32::MAX);
        assert_eq!(p.successor(), Bpos::new(1, 2, 0));

        let p = Bpos::new(1, u64::MAX, u32::MAX);
        assert_eq!(p.successor(), Bpos::new(2, 0, 0));

        assert_eq!(POS_MAX.successor(), POS_MAX);
    }

    #[test]
    fn predecessor_inverts_successor() {
        let positions = [
            Bpos::new(0, 0, 1),
            Bpos::new(1, 2, 0),
            Bpos::new(3, 0, 0),
            Bpos::new(7, 9, 42),
        ];
        for p in positions {
            assert_eq!(p.successor().predecessor(), p);
            assert_eq!(p.predecessor().successor(), p);
        }
        assert_eq!(POS_MIN.predecessor(), POS_MIN);
    }

    #[test]
    fn same_cell_ignores_snapshot() {
        assert!(Bpos::new(1, 2, 3).same_cell(Bpos::new(1, 2, 9)));
        assert!(!Bpos::new(1, 2, 3).same_cell(Bpos::new(1, 3, 3)));
    }
}
