//! # Btree Key Cache
//!
//! Trees flagged *cached* (the alloc tree) see far more point updates than
//! scans: every commit touches a handful of bucket records. Routing those
//! through full leaf updates would make every commit dirty an alloc leaf.
//! Instead, reads consult this write-back cache first and commits deposit
//! dirty entries here after journaling them; the entries are flushed into
//! the btree proper in journal-seq order when the journal needs to reclaim
//! or at unmount.
//!
//! Sharded like the page caches this engine grew up with: a hash of the
//! position picks one of [`KEY_CACHE_SHARDS`] independently locked maps.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::KEY_CACHE_SHARDS;
use crate::key::{Bkey, Bpos, BtreeId};

#[derive(Debug, Clone)]
struct CachedKey {
    key: Bkey,
    dirty: bool,
    /// Journal seq of the staging commit; flush applies in this order.
    journal_seq: u64,
}

#[derive(Default)]
struct Shard {
    map: HashMap<(BtreeId, Bpos), CachedKey>,
}

/// Sharded write-back cache of recently updated keys.
pub struct KeyCache {
    shards: Vec<RwLock<Shard>>,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            shards: (0..KEY_CACHE_SHARDS)
                .map(|_| RwLock::new(Shard::default()))
                .collect(),
        }
    }

    fn shard(&self, btree_id: BtreeId, pos: Bpos) -> &RwLock<Shard> {
        let mix = pos
            .inode
            .wrapping_mul(31)
            .wrapping_add(pos.offset)
            .wrapping_add(btree_id as u64);
        &self.shards[(mix as usize) & (KEY_CACHE_SHARDS - 1)]
    }

    pub fn get(&self, btree_id: BtreeId, pos: Bpos) -> Option<Bkey> {
        self.shard(btree_id, pos)
            .read()
            .map
            .get(&(btree_id, pos))
            .map(|c| c.key.clone())
    }

    /// Deposit a journaled update; visible to readers immediately, written
    /// back to the tree later.
    pub fn insert_dirty(&self, btree_id: BtreeId, key: Bkey, journal_seq: u64) {
        let pos = key.pos;
        self.shard(btree_id, pos).write().map.insert(
            (btree_id, pos),
            CachedKey {
                key,
                dirty: true,
                journal_seq,
            },
        );
    }

    /// Prime a clean entry from a tree read.
    pub fn insert_clean(&self, btree_id: BtreeId, key: Bkey) {
        let pos = key.pos;
        let shard = self.shard(btree_id, pos);
        let mut guard = shard.write();
        // Never clobber a dirty entry with stale tree contents.
        match guard.map.get(&(btree_id, pos)) {
            Some(existing) if existing.dirty => {}
            _ => {
                guard.map.insert(
                    (btree_id, pos),
                    CachedKey {
                        key,
                        dirty: false,
                        journal_seq: 0,
                    },
                );
            }
        }
    }

    pub fn nr_dirty(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().map.values().filter(|c| c.dirty).count())
            .sum()
    }

    /// Drain every dirty entry in journal-seq order, marking them clean.
    /// The caller inserts them into the btree before reusing the seqs.
    pub fn take_dirty(&self) -> Vec<(BtreeId, Bkey)> {
        let mut dirty: Vec<(u64, BtreeId, Bkey)> = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.write();
            for ((btree_id, _), cached) in guard.map.iter_mut() {
                if cached.dirty {
                    dirty.push((cached.journal_seq, *btree_id, cached.key.clone()));
                    cached.dirty = false;
                }
            }
        }
        dirty.sort_by_key(|(seq, _, _)| *seq);
        dirty.into_iter().map(|(_, id, k)| (id, k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::bkey::{Alloc, BkeyVal};

    fn alloc_key(bucket: u64, gen: u32) -> Bkey {
        Bkey::new(
            Bpos::new(0, bucket, 0),
            BkeyVal::Alloc(Alloc {
                gen,
                ..Alloc::default()
            }),
        )
    }

    #[test]
    fn dirty_entries_shadow_clean_ones() {
        let cache = KeyCache::new();
        cache.insert_dirty(BtreeId::Alloc, alloc_key(7, 2), 10);

        // A later clean prime from the tree must not hide the dirty value.
        cache.insert_clean(BtreeId::Alloc, alloc_key(7, 1));

        let got = cache.get(BtreeId::Alloc, Bpos::new(0, 7, 0)).unwrap();
        match got.val {
            BkeyVal::Alloc(a) => assert_eq!(a.gen, 2),
            _ => panic!("wrong value type"),
        }
        assert_eq!(cache.nr_dirty(), 1);
    }

    #[test]
    fn take_dirty_orders_by_journal_seq() {
        let cache = KeyCache::new();
        cache.insert_dirty(BtreeId::Alloc, alloc_key(3, 1), 30);
        cache.insert_dirty(BtreeId::Alloc, alloc_key(1, 1), 10);
        cache.insert_dirty(BtreeId::Alloc, alloc_key(2, 1), 20);

        let drained = cache.take_dirty();
        let buckets: Vec<u64> = drained.iter().map(|(_, k)| k.pos.offset).collect();
        assert_eq!(buckets, vec![1, 2, 3]);
        assert_eq!(cache.nr_dirty(), 0);

        // Entries remain readable after the flush drained them.
        assert!(cache.get(BtreeId::Alloc, Bpos::new(0, 2, 0)).is_some());
    }
}
