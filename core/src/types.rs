//! Shared data model for the coordinator: batch/block/slot numbering,
//! transactions, synchronizer stats and contract variables.

use serde::{Deserialize, Serialize};

/// Sequential rollup batch number. Batch 0 is the genesis state.
pub type BatchNum = u64;

/// L1 block number. Signed so "no block yet" fits naturally as values
/// below genesis.
pub type BlockNum = i64;

/// Auction slot number.
pub type SlotNum = i64;

/// Merkle tree leaf index of an account.
pub type Idx = u64;

/// Account nonce.
pub type Nonce = u64;

/// Pool transaction identifier.
pub type TxId = [u8; 32];

/// L1 address (20 bytes).
pub type Address = [u8; 20];

/// State root of the rollup merkle tree.
pub type StateRoot = [u8; 32];

/// An L1 user transaction queued on the rollup contract, waiting to be
/// forged in an L1 batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1Tx {
    /// Position in the contract queue, assigned at L1.
    pub l1_txs_num: i64,
    pub from_idx: Idx,
    pub to_idx: Idx,
    pub amount: u64,
}

/// A pool L2 transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolL2Tx {
    pub tx_id: TxId,
    pub from_idx: Idx,
    pub to_idx: Idx,
    pub amount: u64,
    pub fee: u64,
    pub nonce: Nonce,
}

/// (account index, nonce) pair used to invalidate pool txs whose nonce
/// is already below the account's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdxNonce {
    pub idx: Idx,
    pub nonce: Nonce,
}

/// Highest nonce per sender among a set of pool txs.
pub fn idxs_nonce_from_pool_txs(txs: &[PoolL2Tx]) -> Vec<IdxNonce> {
    let mut max: std::collections::HashMap<Idx, Nonce> = std::collections::HashMap::new();
    for tx in txs {
        let entry = max.entry(tx.from_idx).or_insert(tx.nonce);
        if tx.nonce > *entry {
            *entry = tx.nonce;
        }
    }
    let mut out: Vec<IdxNonce> = max
        .into_iter()
        .map(|(idx, nonce)| IdxNonce { idx, nonce })
        .collect();
    out.sort_by_key(|in_| in_.idx);
    out
}

/// Inputs handed to a proof server for one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZkInputs {
    #[serde(with = "hex::serde")]
    pub old_state_root: StateRoot,
    #[serde(with = "hex::serde")]
    pub new_state_root: StateRoot,
    pub batch_num: BatchNum,
    pub l1_txs: Vec<L1Tx>,
    pub l2_txs: Vec<PoolL2Tx>,
}

/// Static parameters of the tx processor passed through to selection and
/// batch building.
#[derive(Debug, Clone, Copy)]
pub struct TxProcessorConfig {
    pub max_l1_txs: usize,
    pub max_txs: usize,
    pub max_fee_txs: usize,
    pub nlevels: u32,
}

impl Default for TxProcessorConfig {
    fn default() -> Self {
        Self {
            max_l1_txs: 128,
            max_txs: 376,
            max_fee_txs: 64,
            nlevels: 32,
        }
    }
}

/// An auction slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub slot_num: SlotNum,
    pub start_block: BlockNum,
    pub end_block: BlockNum,
    pub forger: Address,
    /// True once the slot's winner has forged at least one batch in it.
    pub forger_commitment: bool,
}

impl Slot {
    pub fn contains(&self, block_num: BlockNum) -> bool {
        block_num >= self.start_block && block_num <= self.end_block
    }
}

/// A batch as recorded by the synchronizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRef {
    pub batch_num: BatchNum,
    pub forger: Address,
    #[serde(with = "hex::serde")]
    pub state_root: StateRoot,
}

/// Immutable auction constants read from the contract at startup.
#[derive(Debug, Clone, Copy)]
pub struct AuctionConsts {
    pub genesis_block_num: BlockNum,
    pub blocks_per_slot: i64,
}

impl AuctionConsts {
    /// Block offset within the slot that contains `block_num`.
    pub fn relative_block(&self, block_num: BlockNum) -> i64 {
        (block_num - self.genesis_block_num) % self.blocks_per_slot
    }
}

/// Mutable contract variables tracked by the synchronizer.
#[derive(Debug, Clone, Copy)]
pub struct ScVariables {
    /// Blocks after which an L1 batch becomes mandatory.
    pub forge_l1_l2_batch_timeout: i64,
    /// Block offset within a slot after which anyone may forge if the
    /// winner has not committed.
    pub slot_deadline: i64,
}

/// Partial update of [`ScVariables`] carried by synchronizer messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScVariablesUpdate {
    pub forge_l1_l2_batch_timeout: Option<i64>,
    pub slot_deadline: Option<i64>,
}

impl ScVariables {
    pub fn apply(&mut self, update: &ScVariablesUpdate) {
        if let Some(v) = update.forge_l1_l2_batch_timeout {
            self.forge_l1_l2_batch_timeout = v;
        }
        if let Some(v) = update.slot_deadline {
            self.slot_deadline = v;
        }
    }
}

/// Chain-head view.
#[derive(Debug, Clone, Copy, Default)]
pub struct EthStats {
    pub last_block: BlockNum,
    pub last_batch: BatchNum,
}

/// Synchronizer view of the rollup state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRollupStats {
    pub last_block: BlockNum,
    pub last_batch: BatchRef,
    /// Last block at which an L1 batch was forged.
    pub last_l1_batch_block: BlockNum,
    /// Position of the last L1 user tx forged so far.
    pub last_forge_l1_txs_num: i64,
    pub current_slot: Slot,
    pub next_slot: Slot,
}

/// Combined synchronizer stats broadcast with every processed block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub eth: EthStats,
    pub sync: SyncRollupStats,
}

impl SyncStats {
    /// The synchronizer has caught up with the chain head.
    pub fn synced(&self) -> bool {
        self.eth.last_block == self.sync.last_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idxs_nonce_keeps_max_per_sender() {
        let tx = |from_idx, nonce| PoolL2Tx {
            tx_id: [0u8; 32],
            from_idx,
            to_idx: 300,
            amount: 10,
            fee: 1,
            nonce,
        };
        let txs = vec![tx(256, 4), tx(257, 1), tx(256, 7), tx(256, 5)];
        let got = idxs_nonce_from_pool_txs(&txs);
        assert_eq!(
            got,
            vec![
                IdxNonce {
                    idx: 256,
                    nonce: 7
                },
                IdxNonce {
                    idx: 257,
                    nonce: 1
                },
            ]
        );
    }

    #[test]
    fn test_relative_block() {
        let consts = AuctionConsts {
            genesis_block_num: 1000,
            blocks_per_slot: 40,
        };
        assert_eq!(consts.relative_block(1000), 0);
        assert_eq!(consts.relative_block(1039), 39);
        assert_eq!(consts.relative_block(1040), 0);
    }

    #[test]
    fn test_sc_variables_partial_apply() {
        let mut vars = ScVariables {
            forge_l1_l2_batch_timeout: 10,
            slot_deadline: 20,
        };
        vars.apply(&ScVariablesUpdate {
            forge_l1_l2_batch_timeout: Some(12),
            slot_deadline: None,
        });
        assert_eq!(vars.forge_l1_l2_batch_timeout, 12);
        assert_eq!(vars.slot_deadline, 20);
    }
}
