//! Read-only view of what the synchronizer has recorded: forged batches and
//! the queue of L1 user txs waiting on the contract.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::types::{BatchNum, BatchRef, L1Tx};

pub trait HistoryDb: Send + Sync {
    fn get_batch(&self, batch_num: BatchNum) -> Result<Option<BatchRef>>;
    /// L1 user txs queued under forge position `to_forge_l1_txs_num`.
    fn unforged_l1_user_txs(&self, to_forge_l1_txs_num: i64) -> Result<Vec<L1Tx>>;
    /// L1 user txs queued after `to_forge_l1_txs_num`.
    fn unforged_l1_user_future_txs(&self, to_forge_l1_txs_num: i64) -> Result<Vec<L1Tx>>;
    /// Total number of L1 user txs not yet forged.
    fn unforged_l1_user_txs_count(&self) -> Result<usize>;
}

#[derive(Default)]
struct MemHistoryInner {
    batches: HashMap<BatchNum, BatchRef>,
    l1_txs: Vec<L1Tx>,
    forged_l1_txs_num: i64,
}

/// In-memory [`HistoryDb`] fed by tests or a local synchronizer stub.
pub struct MemHistoryDb {
    inner: Mutex<MemHistoryInner>,
}

impl Default for MemHistoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemHistoryDb {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemHistoryInner {
                forged_l1_txs_num: -1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemHistoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_batch(&self, batch: BatchRef) {
        self.lock().batches.insert(batch.batch_num, batch);
    }

    /// Queues an L1 user tx; `tx.l1_txs_num` is its forge position.
    pub fn add_l1_user_tx(&self, tx: L1Tx) {
        self.lock().l1_txs.push(tx);
    }

    /// Marks every L1 user tx up to position `l1_txs_num` as forged.
    pub fn set_forged_l1_txs_num(&self, l1_txs_num: i64) {
        self.lock().forged_l1_txs_num = l1_txs_num;
    }
}

impl HistoryDb for MemHistoryDb {
    fn get_batch(&self, batch_num: BatchNum) -> Result<Option<BatchRef>> {
        Ok(self.lock().batches.get(&batch_num).copied())
    }

    fn unforged_l1_user_txs(&self, to_forge_l1_txs_num: i64) -> Result<Vec<L1Tx>> {
        Ok(self
            .lock()
            .l1_txs
            .iter()
            .filter(|tx| tx.l1_txs_num == to_forge_l1_txs_num)
            .cloned()
            .collect())
    }

    fn unforged_l1_user_future_txs(&self, to_forge_l1_txs_num: i64) -> Result<Vec<L1Tx>> {
        Ok(self
            .lock()
            .l1_txs
            .iter()
            .filter(|tx| tx.l1_txs_num > to_forge_l1_txs_num)
            .cloned()
            .collect())
    }

    fn unforged_l1_user_txs_count(&self) -> Result<usize> {
        let inner = self.lock();
        Ok(inner
            .l1_txs
            .iter()
            .filter(|tx| tx.l1_txs_num > inner.forged_l1_txs_num)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l1_tx(l1_txs_num: i64, from_idx: u64) -> L1Tx {
        L1Tx {
            l1_txs_num,
            from_idx,
            to_idx: 300,
            amount: 100,
        }
    }

    #[test]
    fn test_l1_queue_partitioning() {
        let db = MemHistoryDb::new();
        db.add_l1_user_tx(l1_tx(0, 256));
        db.add_l1_user_tx(l1_tx(1, 257));
        db.add_l1_user_tx(l1_tx(1, 258));
        db.add_l1_user_tx(l1_tx(2, 259));

        assert_eq!(db.unforged_l1_user_txs(1).unwrap().len(), 2);
        assert_eq!(db.unforged_l1_user_future_txs(1).unwrap().len(), 1);
        assert_eq!(db.unforged_l1_user_txs_count().unwrap(), 4);

        db.set_forged_l1_txs_num(1);
        assert_eq!(db.unforged_l1_user_txs_count().unwrap(), 1);
    }
}
