//! L2 transaction pool seam.
//!
//! The pipeline marks pool txs as forging when they enter a batch and the
//! submission loop marks them forged once the batch is on chain. A reorg (or
//! a failed batch) flips everything above the last valid batch back to
//! pending. The tokio mutex wrapping the pool is the serialization point
//! between batch forging and external deletes.

use anyhow::{Result, anyhow};
use std::collections::BTreeMap;

use crate::types::{BatchNum, IdxNonce, PoolL2Tx, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTxState {
    Pending,
    Forging,
    Forged,
    Invalid,
}

pub trait L2Pool: Send {
    fn add_tx(&mut self, tx: PoolL2Tx) -> Result<()>;
    fn pending_txs(&self) -> Result<Vec<PoolL2Tx>>;
    /// Distinct sender indexes among pending txs.
    fn pending_unique_from_idxs(&self) -> Result<Vec<u64>>;
    fn start_forging(&mut self, tx_ids: &[TxId], batch_num: BatchNum) -> Result<()>;
    fn done_forging(&mut self, tx_ids: &[TxId], batch_num: BatchNum) -> Result<()>;
    /// Records txs the selector discarded for this batch.
    fn update_txs_info(&mut self, discarded: &[TxId], batch_num: BatchNum, info: &str)
    -> Result<()>;
    /// Invalidates pending txs whose nonce is below their account's.
    fn invalidate_old_nonces(&mut self, idx_nonces: &[IdxNonce], batch_num: BatchNum)
    -> Result<()>;
    /// Returns txs tied to batches above `last_valid_batch` to pending.
    fn reorg(&mut self, last_valid_batch: BatchNum) -> Result<()>;
    /// Drops forged and invalidated txs that are old enough to never be
    /// needed again.
    fn purge(&mut self, current_batch: BatchNum, safety_batches: u64) -> Result<()>;
    /// Drops txs flagged for deletion through the external API.
    fn purge_by_external_delete(&mut self) -> Result<()>;
    fn tx_state(&self, tx_id: &TxId) -> Result<Option<PoolTxState>>;
}

struct PoolEntry {
    tx: PoolL2Tx,
    state: PoolTxState,
    batch_num: Option<BatchNum>,
    info: Option<String>,
    external_delete: bool,
}

/// In-memory [`L2Pool`], keyed by tx id for deterministic iteration.
#[derive(Default)]
pub struct MemL2Pool {
    txs: BTreeMap<TxId, PoolEntry>,
}

impl MemL2Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags a tx for removal by the external-delete purge task.
    pub fn request_external_delete(&mut self, tx_id: &TxId) -> Result<()> {
        let entry = self
            .txs
            .get_mut(tx_id)
            .ok_or_else(|| anyhow!("tx {} not in pool", hex::encode(tx_id)))?;
        entry.external_delete = true;
        Ok(())
    }

    pub fn tx_info(&self, tx_id: &TxId) -> Option<&str> {
        self.txs.get(tx_id).and_then(|e| e.info.as_deref())
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

impl L2Pool for MemL2Pool {
    fn add_tx(&mut self, tx: PoolL2Tx) -> Result<()> {
        if self.txs.contains_key(&tx.tx_id) {
            return Err(anyhow!("tx {} already in pool", hex::encode(tx.tx_id)));
        }
        self.txs.insert(
            tx.tx_id,
            PoolEntry {
                tx,
                state: PoolTxState::Pending,
                batch_num: None,
                info: None,
                external_delete: false,
            },
        );
        Ok(())
    }

    fn pending_txs(&self) -> Result<Vec<PoolL2Tx>> {
        Ok(self
            .txs
            .values()
            .filter(|e| e.state == PoolTxState::Pending)
            .map(|e| e.tx.clone())
            .collect())
    }

    fn pending_unique_from_idxs(&self) -> Result<Vec<u64>> {
        let mut idxs: Vec<u64> = self
            .txs
            .values()
            .filter(|e| e.state == PoolTxState::Pending)
            .map(|e| e.tx.from_idx)
            .collect();
        idxs.sort_unstable();
        idxs.dedup();
        Ok(idxs)
    }

    fn start_forging(&mut self, tx_ids: &[TxId], batch_num: BatchNum) -> Result<()> {
        for tx_id in tx_ids {
            if let Some(entry) = self.txs.get_mut(tx_id) {
                if entry.state == PoolTxState::Pending {
                    entry.state = PoolTxState::Forging;
                    entry.batch_num = Some(batch_num);
                }
            }
        }
        Ok(())
    }

    fn done_forging(&mut self, tx_ids: &[TxId], batch_num: BatchNum) -> Result<()> {
        for tx_id in tx_ids {
            if let Some(entry) = self.txs.get_mut(tx_id) {
                if entry.state == PoolTxState::Forging {
                    entry.state = PoolTxState::Forged;
                    entry.batch_num = Some(batch_num);
                }
            }
        }
        Ok(())
    }

    fn update_txs_info(&mut self, discarded: &[TxId], batch_num: BatchNum, info: &str) -> Result<()> {
        for tx_id in discarded {
            if let Some(entry) = self.txs.get_mut(tx_id) {
                entry.info = Some(format!("batch {batch_num}: {info}"));
            }
        }
        Ok(())
    }

    fn invalidate_old_nonces(&mut self, idx_nonces: &[IdxNonce], batch_num: BatchNum) -> Result<()> {
        for entry in self.txs.values_mut() {
            if entry.state != PoolTxState::Pending {
                continue;
            }
            let below = idx_nonces
                .iter()
                .any(|in_| in_.idx == entry.tx.from_idx && entry.tx.nonce < in_.nonce);
            if below {
                entry.state = PoolTxState::Invalid;
                entry.batch_num = Some(batch_num);
            }
        }
        Ok(())
    }

    fn reorg(&mut self, last_valid_batch: BatchNum) -> Result<()> {
        for entry in self.txs.values_mut() {
            if let Some(batch_num) = entry.batch_num {
                if batch_num > last_valid_batch && entry.state != PoolTxState::Pending {
                    entry.state = PoolTxState::Pending;
                    entry.batch_num = None;
                }
            }
        }
        Ok(())
    }

    fn purge(&mut self, current_batch: BatchNum, safety_batches: u64) -> Result<()> {
        let horizon = current_batch.saturating_sub(safety_batches);
        self.txs.retain(|_, e| {
            let old_enough = e.batch_num.map(|b| b <= horizon).unwrap_or(false);
            !(old_enough && matches!(e.state, PoolTxState::Forged | PoolTxState::Invalid))
        });
        Ok(())
    }

    fn purge_by_external_delete(&mut self) -> Result<()> {
        self.txs.retain(|_, e| {
            !(e.external_delete && matches!(e.state, PoolTxState::Pending | PoolTxState::Invalid))
        });
        Ok(())
    }

    fn tx_state(&self, tx_id: &TxId) -> Result<Option<PoolTxState>> {
        Ok(self.txs.get(tx_id).map(|e| e.state))
    }
}

#[cfg(test)]
pub(crate) fn test_tx(id: u8, from_idx: u64, nonce: u64) -> PoolL2Tx {
    let mut tx_id = [0u8; 32];
    tx_id[31] = id;
    PoolL2Tx {
        tx_id,
        from_idx,
        to_idx: 300,
        amount: 10,
        fee: 1,
        nonce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forging_lifecycle() {
        let mut pool = MemL2Pool::new();
        let tx = test_tx(1, 256, 0);
        pool.add_tx(tx.clone()).unwrap();

        pool.start_forging(&[tx.tx_id], 5).unwrap();
        assert_eq!(pool.tx_state(&tx.tx_id).unwrap(), Some(PoolTxState::Forging));
        assert!(pool.pending_txs().unwrap().is_empty());

        pool.done_forging(&[tx.tx_id], 5).unwrap();
        assert_eq!(pool.tx_state(&tx.tx_id).unwrap(), Some(PoolTxState::Forged));
    }

    #[test]
    fn test_reorg_restores_pending() {
        let mut pool = MemL2Pool::new();
        let a = test_tx(1, 256, 0);
        let b = test_tx(2, 257, 0);
        pool.add_tx(a.clone()).unwrap();
        pool.add_tx(b.clone()).unwrap();
        pool.start_forging(&[a.tx_id], 4).unwrap();
        pool.start_forging(&[b.tx_id], 6).unwrap();
        pool.done_forging(&[b.tx_id], 6).unwrap();

        pool.reorg(5).unwrap();
        // batch 4 untouched, batch 6 restored
        assert_eq!(pool.tx_state(&a.tx_id).unwrap(), Some(PoolTxState::Forging));
        assert_eq!(pool.tx_state(&b.tx_id).unwrap(), Some(PoolTxState::Pending));
    }

    #[test]
    fn test_invalidate_old_nonces() {
        let mut pool = MemL2Pool::new();
        let stale = test_tx(1, 256, 2);
        let fresh = test_tx(2, 256, 8);
        let other = test_tx(3, 257, 0);
        pool.add_tx(stale.clone()).unwrap();
        pool.add_tx(fresh.clone()).unwrap();
        pool.add_tx(other.clone()).unwrap();

        pool.invalidate_old_nonces(&[IdxNonce { idx: 256, nonce: 5 }], 3)
            .unwrap();
        assert_eq!(pool.tx_state(&stale.tx_id).unwrap(), Some(PoolTxState::Invalid));
        assert_eq!(pool.tx_state(&fresh.tx_id).unwrap(), Some(PoolTxState::Pending));
        assert_eq!(pool.tx_state(&other.tx_id).unwrap(), Some(PoolTxState::Pending));
    }

    #[test]
    fn test_purge_drops_old_forged_and_invalid() {
        let mut pool = MemL2Pool::new();
        let forged = test_tx(1, 256, 0);
        let invalid = test_tx(2, 256, 0);
        let recent = test_tx(3, 257, 0);
        let pending = test_tx(4, 258, 0);
        pool.add_tx(forged.clone()).unwrap();
        pool.add_tx(invalid.clone()).unwrap();
        pool.add_tx(recent.clone()).unwrap();
        pool.add_tx(pending.clone()).unwrap();
        pool.start_forging(&[forged.tx_id], 2).unwrap();
        pool.done_forging(&[forged.tx_id], 2).unwrap();
        pool.invalidate_old_nonces(&[IdxNonce { idx: 256, nonce: 9 }], 2)
            .unwrap();
        pool.start_forging(&[recent.tx_id], 9).unwrap();
        pool.done_forging(&[recent.tx_id], 9).unwrap();

        pool.purge(10, 5).unwrap();
        assert!(pool.tx_state(&forged.tx_id).unwrap().is_none());
        assert!(pool.tx_state(&invalid.tx_id).unwrap().is_none());
        // batch 9 is inside the safety window
        assert_eq!(pool.tx_state(&recent.tx_id).unwrap(), Some(PoolTxState::Forged));
        assert_eq!(pool.tx_state(&pending.tx_id).unwrap(), Some(PoolTxState::Pending));
    }

    #[test]
    fn test_purge_by_external_delete() {
        let mut pool = MemL2Pool::new();
        let doomed = test_tx(1, 256, 0);
        let kept = test_tx(2, 257, 0);
        pool.add_tx(doomed.clone()).unwrap();
        pool.add_tx(kept.clone()).unwrap();
        pool.request_external_delete(&doomed.tx_id).unwrap();

        pool.purge_by_external_delete().unwrap();
        assert!(pool.tx_state(&doomed.tx_id).unwrap().is_none());
        assert_eq!(pool.tx_state(&kept.tx_id).unwrap(), Some(PoolTxState::Pending));
    }
}
