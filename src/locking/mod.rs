//! # Node Locks
//!
//! Every cached node carries a [`SixLock`]: a three-level lock with the
//! compatibility matrix
//!
//! ```text
//!           read    intent   write
//! read       ok       ok      --
//! intent     ok       --      --
//! write      --       --      --
//! ```
//!
//! *Read* is shared. *Intent* is exclusive among intent holders but
//! compatible with readers — it reserves the right to upgrade without
//! blocking out lookups. *Write* is exclusive with everyone and can only be
//! entered from intent, inside the commit critical section.
//!
//! ## Blocking rules
//!
//! Intent acquisition never blocks: it is trylock-only, and a failed try
//! surfaces as a transaction restart. Read acquisition may block on a write
//! holder only when the caller's lock order allows it (the transaction layer
//! checks order before choosing the blocking path). The intent→write upgrade
//! waits for in-flight readers to drain, which is deadlock-free because
//! upgrades proceed in tree order and readers never block while holding a
//! later-ordered lock.
//!
//! ## Sequence numbers
//!
//! Each lock carries a 32-bit sequence incremented on every write unlock.
//! Readers that drop a lock but keep a pointer to the node revalidate with
//! [`SixLock::relock_read`]: if the sequence moved, the node changed (or was
//! evicted and reused) and the holder must restart.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

/// Lock level requested by a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockType {
    Read,
    Intent,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    intent: bool,
    write: bool,
}

#[derive(Debug, Default)]
pub struct SixLock {
    state: Mutex<LockState>,
    cond: Condvar,
    seq: AtomicU32,
}

impl SixLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence; changes on every write unlock.
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Shared acquisition; may wait for a write holder.
    pub fn lock_read(&self) {
        let mut state = self.state.lock();
        while state.write {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn try_lock_read(&self) -> bool {
        let mut state = self.state.lock();
        if state.write {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn unlock_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "unlock_read without a read lock");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Reacquire a read lock and confirm nothing changed in between.
    pub fn relock_read(&self, expected_seq: u32) -> bool {
        if !self.try_lock_read() {
            return false;
        }
        if self.seq() != expected_seq {
            self.unlock_read();
            return false;
        }
        true
    }

    /// Exclusive-among-intent acquisition; never blocks.
    pub fn try_lock_intent(&self) -> bool {
        let mut state = self.state.lock();
        if state.intent || state.write {
            return false;
        }
        state.intent = true;
        true
    }

    pub fn unlock_intent(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.intent && !state.write, "unlock_intent without intent");
        state.intent = false;
        self.cond.notify_all();
    }

    /// Trade an intent lock for a read lock without a window in which a
    /// competing intent holder could slip in front of us.
    pub fn downgrade_intent_to_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.intent && !state.write);
        state.intent = false;
        state.readers += 1;
        self.cond.notify_all();
    }

    /// Upgrade a held intent lock to write, waiting for readers to drain.
    /// Callers upgrade in tree order, which keeps this wait acyclic.
    pub fn lock_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.intent && !state.write, "write upgrade without intent");
        while state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.write = true;
    }

    /// Release write back down to intent, bumping the sequence so lapsed
    /// readers know the node changed.
    pub fn unlock_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.write);
        state.write = false;
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    /// True when any lock is held; used by cache eviction checks.
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.readers > 0 || state.intent || state.write
    }

    /// True when an intent or write holder exists.
    pub fn is_intent_locked(&self) -> bool {
        let state = self.state.lock();
        state.intent || state.write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_are_shared() {
        let lock = SixLock::new();
        lock.lock_read();
        assert!(lock.try_lock_read());
        lock.unlock_read();
        lock.unlock_read();
        assert!(!lock.is_locked());
    }

    #[test]
    fn intent_excludes_intent_but_not_read() {
        let lock = SixLock::new();
        assert!(lock.try_lock_intent());
        assert!(!lock.try_lock_intent());
        assert!(lock.try_lock_read());
        lock.unlock_read();
        lock.unlock_intent();
        assert!(lock.try_lock_intent());
        lock.unlock_intent();
    }

    #[test]
    fn write_excludes_everyone_and_bumps_seq() {
        let lock = SixLock::new();
        let seq0 = lock.seq();

        assert!(lock.try_lock_intent());
        lock.lock_write();
        assert!(!lock.try_lock_read());
        assert!(!lock.try_lock_intent());

        lock.unlock_write();
        assert_eq!(lock.seq(), seq0 + 1);
        // Back at intent: readers are welcome again.
        assert!(lock.try_lock_read());
        lock.unlock_read();
        lock.unlock_intent();
    }

    #[test]
    fn relock_fails_after_write() {
        let lock = SixLock::new();
        let seq = lock.seq();

        assert!(lock.try_lock_intent());
        lock.lock_write();
        lock.unlock_write();
        lock.unlock_intent();

        assert!(!lock.relock_read(seq));
        assert!(lock.relock_read(seq + 1));
        lock.unlock_read();
    }

    #[test]
    fn write_upgrade_waits_for_readers() {
        let lock = Arc::new(SixLock::new());
        lock.lock_read();
        assert!(lock.try_lock_intent());

        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            contender.lock_write();
            contender.unlock_write();
            contender.unlock_intent();
        });

        // Give the writer a moment to start waiting, then drain the reader.
        thread::sleep(std::time::Duration::from_millis(20));
        lock.unlock_read();
        handle.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn downgrade_keeps_readers_continuous() {
        let lock = SixLock::new();
        assert!(lock.try_lock_intent());
        lock.downgrade_intent_to_read();
        assert!(lock.try_lock_intent());
        lock.unlock_intent();
        lock.unlock_read();
    }
}
