//! Transaction mempool
//!
//! FIFO pool of checked transactions awaiting inclusion. Deduplicates by
//! transaction hash and remembers recently included transactions so
//! gossip echoes do not re-enter the pool. The notify handle wakes a
//! lazy aggregator when the pool becomes non-empty.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use crate::types::{Hash, Tx};

const SEEN_CACHE_SIZE: usize = 16384;

fn tx_hash(tx: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(tx);
    hasher.finalize().into()
}

struct MempoolInner {
    queue: VecDeque<Tx>,
    seen: HashSet<Hash>,
    seen_order: VecDeque<Hash>,
}

impl MempoolInner {
    fn mark_seen(&mut self, hash: Hash) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.seen_order.push_back(hash);
        while self.seen_order.len() > SEEN_CACHE_SIZE {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Pool of transactions that passed `CheckTx`.
pub struct Mempool {
    inner: Mutex<MempoolInner>,
    notify: Notify,
    max_txs: usize,
}

impl Mempool {
    pub fn new(max_txs: usize) -> Self {
        Self {
            inner: Mutex::new(MempoolInner {
                queue: VecDeque::new(),
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
            }),
            notify: Notify::new(),
            max_txs,
        }
    }

    /// Add a checked transaction. Returns `false` for duplicates.
    pub fn push(&self, tx: Tx) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= self.max_txs {
            return Err(anyhow!("mempool is full ({} transactions)", self.max_txs));
        }
        if !inner.mark_seen(tx_hash(&tx)) {
            return Ok(false);
        }
        inner.queue.push_back(tx);
        drop(inner);
        self.notify.notify_waiters();
        Ok(true)
    }

    /// Drain up to `max` transactions in arrival order.
    pub fn reap(&self, max: usize) -> Vec<Tx> {
        let mut inner = self.inner.lock().unwrap();
        let count = max.min(inner.queue.len());
        inner.queue.drain(..count).collect()
    }

    /// Drop queued transactions included by someone else and remember
    /// them as seen.
    pub fn remove_committed(&self, txs: &[Tx]) {
        let mut inner = self.inner.lock().unwrap();
        let committed: HashSet<Hash> = txs.iter().map(|tx| tx_hash(tx)).collect();
        inner.queue.retain(|tx| !committed.contains(&tx_hash(tx)));
        for hash in committed {
            inner.mark_seen(hash);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once the pool is non-empty.
    pub async fn wait_for_txs(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_reap_in_order() {
        let mempool = Mempool::new(100);
        assert!(mempool.push(vec![1]).unwrap());
        assert!(mempool.push(vec![2]).unwrap());
        assert!(mempool.push(vec![3]).unwrap());

        let txs = mempool.reap(2);
        assert_eq!(txs, vec![vec![1], vec![2]]);
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mempool = Mempool::new(100);
        assert!(mempool.push(vec![1]).unwrap());
        assert!(!mempool.push(vec![1]).unwrap());
        assert_eq!(mempool.len(), 1);

        // still rejected after inclusion
        mempool.reap(10);
        assert!(!mempool.push(vec![1]).unwrap());
    }

    #[test]
    fn test_full_mempool_errors() {
        let mempool = Mempool::new(2);
        mempool.push(vec![1]).unwrap();
        mempool.push(vec![2]).unwrap();
        assert!(mempool.push(vec![3]).is_err());
    }

    #[test]
    fn test_remove_committed() {
        let mempool = Mempool::new(100);
        mempool.push(vec![1]).unwrap();
        mempool.push(vec![2]).unwrap();

        mempool.remove_committed(&[vec![1]]);
        assert_eq!(mempool.reap(10), vec![vec![2]]);

        // a committed transaction cannot re-enter
        assert!(!mempool.push(vec![1]).unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_txs() {
        let mempool = std::sync::Arc::new(Mempool::new(100));
        let waiter = mempool.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_txs().await;
            waiter.len()
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        mempool.push(vec![9]).unwrap();
        let len = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 1);
    }
}
