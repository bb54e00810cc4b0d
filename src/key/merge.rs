//! # Merged Bset View
//!
//! A node accumulates several bsets; readers need one totally ordered view.
//! [`MergeIter`] walks a set of bset cursors keyed on
//! `(position, bset index descending)` so that, when the same position
//! appears in several bsets, the key from the newest bset wins and the older
//! keys are consumed silently. A winning `deleted` tombstone therefore
//! suppresses every older key at its position — the caller sees the
//! tombstone itself and decides whether to surface or skip it.
//!
//! Within one bset a position may recur with ascending versions; the merged
//! view yields the highest version, matching latest-wins deduplication.
//!
//! Cursors move strictly forward; [`MergeIter::rewind`] repositions all of
//! them with one bounded search per bset. Backward steps are served by the
//! stateless [`MergeIter::peek_prev`], which is a separate scan rather than
//! a reversal of the forward state machine.

use smallvec::SmallVec;

use crate::errors::Result;
use crate::key::bkey::Bkey;
use crate::key::bset::Bset;
use crate::key::pos::Bpos;

/// Forward-merging cursor over the bsets of one node.
pub struct MergeIter<'a> {
    bsets: &'a [Bset],
    cursors: SmallVec<[usize; 4]>,
}

impl<'a> MergeIter<'a> {
    pub fn new(bsets: &'a [Bset], start: Bpos) -> Result<Self> {
        let mut cursors = SmallVec::with_capacity(bsets.len());
        for bset in bsets {
            cursors.push(bset.lower_bound(start, 0)?);
        }
        Ok(Self { bsets, cursors })
    }

    /// Reposition every cursor at the first key `>= pos`.
    pub fn rewind(&mut self, pos: Bpos) -> Result<()> {
        for (bset, cursor) in self.bsets.iter().zip(self.cursors.iter_mut()) {
            *cursor = bset.lower_bound(pos, 0)?;
        }
        Ok(())
    }

    /// Position of the next merged key, if any.
    fn min_pos(&self) -> Result<Option<Bpos>> {
        let mut min: Option<Bpos> = None;
        for (bset, &cursor) in self.bsets.iter().zip(self.cursors.iter()) {
            if cursor < bset.len() {
                let pos = bset.key_at(cursor)?.pos;
                min = Some(match min {
                    Some(m) if m <= pos => m,
                    _ => pos,
                });
            }
        }
        Ok(min)
    }

    /// Winning key at `pos`: newest bset, highest version.
    fn winner_at(&self, pos: Bpos) -> Result<Option<Bkey>> {
        for (idx, bset) in self.bsets.iter().enumerate().rev() {
            let mut cursor = self.cursors[idx];
            let mut winner = None;
            while cursor < bset.len() {
                let key = bset.key_at(cursor)?;
                if key.pos != pos {
                    break;
                }
                winner = Some(key);
                cursor += 1;
            }
            if winner.is_some() {
                return Ok(winner);
            }
        }
        Ok(None)
    }

    /// The next merged key without consuming it. Tombstones are returned
    /// like any other winner.
    pub fn peek(&self) -> Result<Option<Bkey>> {
        match self.min_pos()? {
            None => Ok(None),
            Some(pos) => self.winner_at(pos),
        }
    }

    /// Consume every key at the current merged position.
    pub fn next(&mut self) -> Result<Option<Bkey>> {
        let winner = self.peek()?;
        if let Some(ref key) = winner {
            for (bset, cursor) in self.bsets.iter().zip(self.cursors.iter_mut()) {
                while *cursor < bset.len() && bset.key_at(*cursor)?.pos == key.pos {
                    *cursor += 1;
                }
            }
        }
        Ok(winner)
    }

    /// Winning key at the greatest position strictly before `pos`, scanning
    /// independently of the forward cursors.
    pub fn peek_prev(&self, pos: Bpos) -> Result<Option<Bkey>> {
        let mut best_pos: Option<Bpos> = None;
        for bset in self.bsets {
            let idx = bset.lower_bound(pos, 0)?;
            if idx > 0 {
                let p = bset.key_at(idx - 1)?.pos;
                best_pos = Some(match best_pos {
                    Some(b) if b >= p => b,
                    _ => p,
                });
            }
        }
        let Some(best) = best_pos else {
            return Ok(None);
        };
        // Winner resolution must see all keys at `best`, so scan each bset
        // from that position.
        for bset in self.bsets.iter().rev() {
            let mut cursor = bset.lower_bound(best, 0)?;
            let mut winner = None;
            while cursor < bset.len() {
                let key = bset.key_at(cursor)?;
                if key.pos != best {
                    break;
                }
                winner = Some(key);
                cursor += 1;
            }
            if winner.is_some() {
                return Ok(winner);
            }
        }
        Ok(None)
    }
}
