//! Transaction registry
//!
//! Process-wide map from transaction numbers to live transactions, so a
//! replicated or recovered change-set can rejoin the transaction it belongs
//! to. The immediate transaction (number -1) is never registered; each
//! connection owns its own instance.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::types::TxnId;

use super::transaction::Transaction;

#[derive(Default)]
pub struct TransactionHolder {
    map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    cond: Condvar,
}

impl TransactionHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction. Returns false when the number is taken, which
    /// happens when a replicated Begin arrives for a locally applied one.
    pub fn add(&self, txn: Arc<Transaction>) -> bool {
        let mut map = self.map.lock().expect("holder lock poisoned");
        if map.contains_key(&txn.number()) {
            return false;
        }
        map.insert(txn.number(), txn);
        self.cond.notify_all();
        true
    }

    pub fn get(&self, number: TxnId) -> Option<Arc<Transaction>> {
        self.map
            .lock()
            .expect("holder lock poisoned")
            .get(&number)
            .cloned()
    }

    /// Wait until the transaction appears. Used after proposing a Begin
    /// through the consensus layer, where registration happens on the apply
    /// thread.
    pub fn wait(&self, number: TxnId, timeout: Duration) -> Option<Arc<Transaction>> {
        let deadline = Instant::now() + timeout;
        let mut map = self.map.lock().expect("holder lock poisoned");
        loop {
            if let Some(txn) = map.get(&number) {
                return Some(Arc::clone(txn));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(map, remaining)
                .expect("holder lock poisoned");
            map = guard;
        }
    }

    pub fn remove(&self, number: TxnId) {
        self.map
            .lock()
            .expect("holder lock poisoned")
            .remove(&number);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("holder lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Locker;

    fn new_txn(number: TxnId) -> Arc<Transaction> {
        Transaction::new(number, Arc::new(Locker::new()))
    }

    #[test]
    fn test_add_and_get() {
        let holder = TransactionHolder::new();
        let txn = new_txn(1);
        assert!(holder.add(Arc::clone(&txn)));
        assert_eq!(holder.get(1).unwrap().number(), 1);
        assert!(holder.get(2).is_none());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let holder = TransactionHolder::new();
        assert!(holder.add(new_txn(1)));
        assert!(!holder.add(new_txn(1)));
        assert_eq!(holder.len(), 1);
    }

    #[test]
    fn test_remove() {
        let holder = TransactionHolder::new();
        holder.add(new_txn(1));
        holder.remove(1);
        assert!(holder.get(1).is_none());
        assert!(holder.is_empty());
    }

    #[test]
    fn test_wait_times_out() {
        let holder = TransactionHolder::new();
        assert!(holder.wait(9, Duration::from_millis(30)).is_none());
    }

    #[test]
    fn test_wait_wakes_on_add() {
        use std::thread;
        let holder = Arc::new(TransactionHolder::new());
        let holder2 = Arc::clone(&holder);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            holder2.add(new_txn(4));
        });
        let txn = holder.wait(4, Duration::from_millis(500));
        handle.join().unwrap();
        assert_eq!(txn.unwrap().number(), 4);
    }
}
