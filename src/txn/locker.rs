//! Row locker
//!
//! Maps row handles to their lock state: the transaction currently holding
//! the row and how many transactions hold or wait for it. Acquisition blocks
//! on a condition variable until the row is free; the map itself is guarded
//! by its own mutex and an entry is dropped when its last user releases.
//!
//! Re-locking a row the transaction already holds is a no-op, so the commit
//! protocol never self-deadlocks.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::types::{RowId, TxnId};

#[derive(Default)]
pub struct Locker {
    locks: Mutex<HashMap<RowId, Arc<LockEntry>>>,
}

struct LockEntry {
    state: Mutex<EntryState>,
    cond: Condvar,
}

struct EntryState {
    holder: Option<TxnId>,
    locked: bool,
    /// Holders plus waiters; the entry leaves the map at zero.
    users: usize,
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `txn` holds the row. No-op if it already does.
    pub fn lock(&self, row: RowId, txn: TxnId) {
        // Register as a user while the map lock is held, so a concurrent
        // unlock cannot drop the entry between clone and wait.
        let entry = {
            let mut locks = self.locks.lock().expect("locker map poisoned");
            let entry = Arc::clone(locks.entry(row).or_insert_with(|| {
                Arc::new(LockEntry {
                    state: Mutex::new(EntryState {
                        holder: None,
                        locked: false,
                        users: 0,
                    }),
                    cond: Condvar::new(),
                })
            }));
            let mut state = entry.state.lock().expect("lock entry poisoned");
            if state.locked && state.holder == Some(txn) {
                return;
            }
            state.users += 1;
            drop(state);
            entry
        };

        let mut state = entry.state.lock().expect("lock entry poisoned");
        while state.locked {
            state = entry.cond.wait(state).expect("lock entry poisoned");
        }
        state.locked = true;
        state.holder = Some(txn);
    }

    /// Release the row. Panics when `txn` does not hold it; that is a bug in
    /// the commit protocol, not a recoverable condition.
    pub fn unlock(&self, row: RowId, txn: TxnId) {
        let mut locks = self.locks.lock().expect("locker map poisoned");
        let entry = match locks.get(&row) {
            Some(e) => Arc::clone(e),
            None => panic!("tried to unlock a row that is not locked"),
        };

        let remove = {
            let mut state = entry.state.lock().expect("lock entry poisoned");
            if state.holder != Some(txn) {
                panic!("tried to unlock another transaction's lock");
            }
            state.locked = false;
            state.holder = None;
            state.users -= 1;
            entry.cond.notify_all();
            state.users == 0
        };

        if remove {
            locks.remove(&row);
        }
    }

    pub fn has_lock(&self, row: RowId, txn: TxnId) -> bool {
        let locks = self.locks.lock().expect("locker map poisoned");
        match locks.get(&row) {
            Some(entry) => {
                let state = entry.state.lock().expect("lock entry poisoned");
                state.locked && state.holder == Some(txn)
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.locks.lock().expect("locker map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_distinct_rows_no_deadlock() {
        let locker = Locker::new();
        locker.lock(1, 10);
        locker.lock(2, 10);
        locker.lock(3, 11);
        // finish without deadlock
    }

    #[test]
    fn test_has_lock() {
        let locker = Locker::new();
        assert!(!locker.has_lock(1, 10));
        locker.lock(1, 10);
        assert!(locker.has_lock(1, 10));
        assert!(!locker.has_lock(1, 11));
    }

    #[test]
    fn test_relock_same_transaction_is_noop() {
        let locker = Locker::new();
        locker.lock(1, 10);
        locker.lock(1, 10);
        locker.unlock(1, 10);
        assert!(!locker.has_lock(1, 10));
        assert_eq!(locker.entry_count(), 0);
    }

    #[test]
    fn test_unlock_allows_waiting_transaction() {
        let locker = Arc::new(Locker::new());
        locker.lock(1, 10);

        let indicator = Arc::new(AtomicUsize::new(0));
        let locker2 = Arc::clone(&locker);
        let indicator2 = Arc::clone(&indicator);
        let handle = thread::spawn(move || {
            indicator2.store(1, Ordering::SeqCst);
            locker2.lock(1, 11);
            indicator2.store(2, Ordering::SeqCst);
            locker2.unlock(1, 11);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(indicator.load(Ordering::SeqCst), 1, "waiter should block");

        locker.unlock(1, 10);
        handle.join().unwrap();
        assert_eq!(indicator.load(Ordering::SeqCst), 2, "waiter should acquire");
        assert_eq!(locker.entry_count(), 0);
    }

    #[test]
    #[should_panic]
    fn test_unlock_unlocked_row_panics() {
        let locker = Locker::new();
        locker.unlock(1, 10);
    }
}
