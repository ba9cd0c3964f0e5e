//! Pool maintenance rate limiter.
//!
//! Purging and nonce invalidation both walk the whole pool, so they only run
//! once enough blocks or batches have passed since the previous run. The
//! cooldown markers advance only when the action actually triggers.

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use super::l2pool::L2Pool;
use super::selection::TxSelector;
use crate::types::{BatchNum, BlockNum, IdxNonce};

#[derive(Debug, Clone, Copy)]
pub struct PurgerCfg {
    pub purge_batch_delay: i64,
    pub purge_block_delay: i64,
    pub invalidate_batch_delay: i64,
    pub invalidate_block_delay: i64,
    /// Forged/invalid txs stay in the pool this many batches before a purge
    /// drops them.
    pub safety_batches: u64,
}

impl Default for PurgerCfg {
    fn default() -> Self {
        Self {
            purge_batch_delay: 10,
            purge_block_delay: 10,
            invalidate_batch_delay: 20,
            invalidate_block_delay: 20,
            safety_batches: 10,
        }
    }
}

pub struct Purger {
    cfg: PurgerCfg,
    last_purge_block: BlockNum,
    last_purge_batch: i64,
    last_invalidate_block: BlockNum,
    last_invalidate_batch: i64,
}

impl Purger {
    pub fn new(cfg: PurgerCfg) -> Self {
        Self {
            cfg,
            last_purge_block: 0,
            last_purge_batch: 0,
            last_invalidate_block: 0,
            last_invalidate_batch: 0,
        }
    }

    pub fn can_purge(&self, block_num: BlockNum, batch_num: BatchNum) -> bool {
        block_num >= self.last_purge_block + self.cfg.purge_block_delay
            || batch_num as i64 >= self.last_purge_batch + self.cfg.purge_batch_delay
    }

    pub fn can_invalidate(&self, block_num: BlockNum, batch_num: BatchNum) -> bool {
        block_num >= self.last_invalidate_block + self.cfg.invalidate_block_delay
            || batch_num as i64 >= self.last_invalidate_batch + self.cfg.invalidate_batch_delay
    }

    /// Purges the pool if the cooldown has passed. Returns whether it ran.
    pub fn purge_maybe(
        &mut self,
        pool: &mut dyn L2Pool,
        block_num: BlockNum,
        batch_num: BatchNum,
    ) -> Result<bool> {
        if !self.can_purge(block_num, batch_num) {
            return Ok(false);
        }
        self.last_purge_block = block_num;
        self.last_purge_batch = batch_num as i64;
        info!(block_num, batch_num, "purging l2 pool");
        pool.purge(batch_num, self.cfg.safety_batches)?;
        Ok(true)
    }

    /// Invalidates pool txs with outdated nonces if the cooldown has passed.
    /// Returns whether it ran.
    pub fn invalidate_maybe(
        &mut self,
        pool: &mut dyn L2Pool,
        selector: &dyn TxSelector,
        block_num: BlockNum,
        batch_num: BatchNum,
    ) -> Result<bool> {
        if !self.can_invalidate(block_num, batch_num) {
            return Ok(false);
        }
        self.last_invalidate_block = block_num;
        self.last_invalidate_batch = batch_num as i64;
        info!(block_num, batch_num, "invalidating outdated pool txs");

        let mut idx_nonces = Vec::new();
        for idx in pool.pending_unique_from_idxs()? {
            match selector.account_nonce(idx)? {
                Some(nonce) => idx_nonces.push(IdxNonce { idx, nonce }),
                // an index above the last assigned one belongs to an account
                // the selector has not created yet
                None if idx > selector.current_idx() => {}
                None => return Err(anyhow!("account {idx} not found in selection state")),
            }
        }
        debug!(accounts = idx_nonces.len(), "checking pool nonces");
        pool.invalidate_old_nonces(&idx_nonces, batch_num)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::l2pool::{MemL2Pool, PoolTxState, test_tx};
    use crate::coordinator::selection::BasicTxSelector;
    use crate::storage::{CheckpointConfig, CheckpointStore};
    use tempfile::TempDir;

    fn purger(purge_block: i64, purge_batch: i64) -> Purger {
        Purger::new(PurgerCfg {
            purge_batch_delay: purge_batch,
            purge_block_delay: purge_block,
            invalidate_batch_delay: purge_batch,
            invalidate_block_delay: purge_block,
            safety_batches: 0,
        })
    }

    #[test]
    fn test_cooldown_gating() {
        let mut p = purger(10, 4);
        let mut pool = MemL2Pool::new();

        assert!(p.purge_maybe(&mut pool, 10, 0).unwrap());
        // neither delay has passed since block 10 / batch 0
        assert!(!p.purge_maybe(&mut pool, 15, 3).unwrap());
        // batch delay passed
        assert!(p.purge_maybe(&mut pool, 16, 4).unwrap());
        // block delay passed
        assert!(p.purge_maybe(&mut pool, 26, 5).unwrap());
    }

    #[test]
    fn test_markers_only_advance_on_trigger() {
        let mut p = purger(10, 100);
        let mut pool = MemL2Pool::new();
        assert!(p.purge_maybe(&mut pool, 10, 0).unwrap());
        assert!(!p.purge_maybe(&mut pool, 19, 0).unwrap());
        // still measured from block 10, not 19
        assert!(p.purge_maybe(&mut pool, 20, 0).unwrap());
    }

    #[test]
    fn test_invalidate_uses_selection_nonces() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(CheckpointConfig::new(dir.path())).unwrap();
        let mut sel = BasicTxSelector::new(store);
        let idx = sel.create_account(5).unwrap();

        let mut pool = MemL2Pool::new();
        let stale = test_tx(1, idx, 2);
        let fresh = test_tx(2, idx, 5);
        pool.add_tx(stale.clone()).unwrap();
        pool.add_tx(fresh.clone()).unwrap();

        let mut p = purger(1, 1);
        assert!(p.invalidate_maybe(&mut pool, &sel, 5, 2).unwrap());
        assert_eq!(pool.tx_state(&stale.tx_id).unwrap(), Some(PoolTxState::Invalid));
        assert_eq!(pool.tx_state(&fresh.tx_id).unwrap(), Some(PoolTxState::Pending));
    }

    #[test]
    fn test_invalidate_errors_on_missing_account() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(CheckpointConfig::new(dir.path())).unwrap();
        let mut sel = BasicTxSelector::new(store);
        let idx = sel.create_account(0).unwrap();

        let mut pool = MemL2Pool::new();
        // sender below the current idx but with no account in state
        pool.add_tx(test_tx(1, idx - 1, 0)).unwrap();

        let mut p = purger(1, 1);
        assert!(p.invalidate_maybe(&mut pool, &sel, 5, 2).is_err());
    }
}
