//! Transaction selection and batch building over checkpointed state.
//!
//! Both the selector and the builder advance one checkpoint per batch, so the
//! pipeline can roll either back to any recent batch (`reset`) or rebuild it
//! from the synchronizer's copy of the state when the local state diverged
//! from the chain.
//!
//! The built-in implementations are deliberately simple: the selector only
//! enforces nonce ordering and capacity, the builder derives the next state
//! root as a digest over the previous root and the batch contents. They exist
//! to exercise the pipeline; a production selector replaces them behind the
//! same traits.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::storage::CheckpointStore;
use crate::types::{BatchNum, Idx, L1Tx, Nonce, PoolL2Tx, StateRoot, TxId, TxProcessorConfig, ZkInputs};

const KEY_STATE_ROOT: &[u8] = b"s:root";
const ACCOUNT_NONCE_PREFIX: &[u8] = b"a:nonce:";

/// Result of selecting txs for one batch.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub coord_idxs: Vec<Idx>,
    pub l1_user_txs: Vec<L1Tx>,
    pub l1_coord_txs: Vec<L1Tx>,
    pub pool_txs: Vec<PoolL2Tx>,
    /// Pool txs rejected for this batch, with the reason.
    pub discarded: Vec<(TxId, String)>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.l1_user_txs.is_empty() && self.l1_coord_txs.is_empty() && self.pool_txs.is_empty()
    }

    pub fn discarded_ids(&self) -> Vec<TxId> {
        self.discarded.iter().map(|(id, _)| *id).collect()
    }
}

pub trait TxSelector: Send {
    /// Selects txs for an L1 batch and checkpoints the resulting state.
    fn l1_l2_selection(
        &mut self,
        cfg: &TxProcessorConfig,
        l1_user_txs: &[L1Tx],
        l1_user_future_txs: &[L1Tx],
        pool_txs: &[PoolL2Tx],
    ) -> Result<Selection>;
    /// Selects txs for an L2-only batch and checkpoints the resulting state.
    fn l2_selection(
        &mut self,
        cfg: &TxProcessorConfig,
        l1_user_future_txs: &[L1Tx],
        pool_txs: &[PoolL2Tx],
    ) -> Result<Selection>;
    /// Rolls the selection state back (or forward) to `batch_num`. With
    /// `from_synchronizer` the state is rebuilt from the synchronizer's copy.
    fn reset(&mut self, batch_num: BatchNum, from_synchronizer: bool) -> Result<()>;
    fn checkpoint_exists(&self, batch_num: BatchNum) -> bool;
    fn current_batch(&self) -> BatchNum;
    fn account_nonce(&self, idx: Idx) -> Result<Option<Nonce>>;
    /// Last assigned account index.
    fn current_idx(&self) -> Idx;
}

pub trait BatchBuilder: Send {
    /// Applies the selected txs to the local state, checkpoints it, and
    /// returns the proof inputs for the batch.
    fn build_batch(
        &mut self,
        coord_idxs: &[Idx],
        cfg: &TxProcessorConfig,
        l1_user_txs: &[L1Tx],
        l1_coord_txs: &[L1Tx],
        l2_txs: &[PoolL2Tx],
    ) -> Result<ZkInputs>;
    fn reset(&mut self, batch_num: BatchNum, from_synchronizer: bool) -> Result<()>;
    fn checkpoint_exists(&self, batch_num: BatchNum) -> bool;
    fn local_state_root(&self) -> Result<StateRoot>;
    fn current_batch(&self) -> BatchNum;
}

fn account_nonce_key(idx: Idx) -> Vec<u8> {
    let mut key = ACCOUNT_NONCE_PREFIX.to_vec();
    key.extend_from_slice(&idx.to_be_bytes());
    key
}

fn read_nonce(store: &CheckpointStore, idx: Idx) -> Result<Option<Nonce>> {
    let value = store.get(&account_nonce_key(idx))?;
    Ok(value.map(|v| {
        let mut buf = [0u8; 8];
        let n = v.len().min(8);
        buf[8 - n..].copy_from_slice(&v[v.len() - n..]);
        u64::from_be_bytes(buf)
    }))
}

fn write_nonce(store: &CheckpointStore, idx: Idx, nonce: Nonce) -> Result<()> {
    Ok(store.put(&account_nonce_key(idx), &nonce.to_be_bytes())?)
}

/// Shared rollback/resync logic for the checkpoint-backed implementations.
fn reset_store(
    store: &mut CheckpointStore,
    peer: Option<&Arc<Mutex<CheckpointStore>>>,
    batch_num: BatchNum,
    from_synchronizer: bool,
) -> Result<()> {
    if from_synchronizer {
        match peer {
            Some(peer) => {
                let peer = peer.lock().unwrap_or_else(|e| e.into_inner());
                store
                    .reset_from_peer(&peer, batch_num)
                    .with_context(|| format!("resync to batch {batch_num}"))?;
            }
            None if batch_num == 0 => store.reset(0).context("reset to genesis")?,
            None => {
                return Err(anyhow!(
                    "cannot resync to batch {batch_num}: no synchronizer state available"
                ));
            }
        }
        return Ok(());
    }
    store
        .reset(batch_num)
        .with_context(|| format!("reset to batch {batch_num}"))
}

/// Nonce-ordered, capacity-bounded [`TxSelector`].
pub struct BasicTxSelector {
    store: CheckpointStore,
    peer: Option<Arc<Mutex<CheckpointStore>>>,
}

impl BasicTxSelector {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store, peer: None }
    }

    /// Attaches the synchronizer's state store for resyncs.
    pub fn with_peer(mut self, peer: Arc<Mutex<CheckpointStore>>) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Creates an account at the next free index. Used to seed state.
    pub fn create_account(&mut self, nonce: Nonce) -> Result<Idx> {
        let idx = self.store.current_idx() + 1;
        self.store.set_current_idx(idx)?;
        write_nonce(&self.store, idx, nonce)?;
        Ok(idx)
    }

    fn select(
        &mut self,
        cfg: &TxProcessorConfig,
        l1_user_txs: &[L1Tx],
        pool_txs: &[PoolL2Tx],
    ) -> Result<Selection> {
        let mut selection = Selection {
            l1_user_txs: l1_user_txs.iter().take(cfg.max_l1_txs).cloned().collect(),
            ..Default::default()
        };

        let l2_capacity = cfg.max_txs.saturating_sub(selection.l1_user_txs.len());
        let mut nonces: std::collections::HashMap<Idx, Nonce> = std::collections::HashMap::new();
        for tx in pool_txs {
            if selection.pool_txs.len() >= l2_capacity {
                break;
            }
            let nonce = match nonces.get(&tx.from_idx) {
                Some(n) => *n,
                None => read_nonce(&self.store, tx.from_idx)?.unwrap_or(0),
            };
            if tx.nonce < nonce {
                selection
                    .discarded
                    .push((tx.tx_id, format!("nonce {} below account {}", tx.nonce, nonce)));
            } else if tx.nonce == nonce {
                nonces.insert(tx.from_idx, nonce + 1);
                selection.pool_txs.push(tx.clone());
            }
            // txs with a future nonce stay pending for a later batch
        }

        for tx in &selection.pool_txs {
            write_nonce(&self.store, tx.from_idx, tx.nonce + 1)?;
        }
        self.store.make_checkpoint()?;
        debug!(
            batch_num = self.store.current_batch(),
            l1 = selection.l1_user_txs.len(),
            l2 = selection.pool_txs.len(),
            discarded = selection.discarded.len(),
            "tx selection"
        );
        Ok(selection)
    }
}

impl TxSelector for BasicTxSelector {
    fn l1_l2_selection(
        &mut self,
        cfg: &TxProcessorConfig,
        l1_user_txs: &[L1Tx],
        _l1_user_future_txs: &[L1Tx],
        pool_txs: &[PoolL2Tx],
    ) -> Result<Selection> {
        self.select(cfg, l1_user_txs, pool_txs)
    }

    fn l2_selection(
        &mut self,
        cfg: &TxProcessorConfig,
        _l1_user_future_txs: &[L1Tx],
        pool_txs: &[PoolL2Tx],
    ) -> Result<Selection> {
        self.select(cfg, &[], pool_txs)
    }

    fn reset(&mut self, batch_num: BatchNum, from_synchronizer: bool) -> Result<()> {
        reset_store(&mut self.store, self.peer.as_ref(), batch_num, from_synchronizer)
    }

    fn checkpoint_exists(&self, batch_num: BatchNum) -> bool {
        self.store.checkpoint_exists(batch_num)
    }

    fn current_batch(&self) -> BatchNum {
        self.store.current_batch()
    }

    fn account_nonce(&self, idx: Idx) -> Result<Option<Nonce>> {
        read_nonce(&self.store, idx)
    }

    fn current_idx(&self) -> Idx {
        self.store.current_idx()
    }
}

/// Digest-chained [`BatchBuilder`].
pub struct BasicBatchBuilder {
    store: CheckpointStore,
    peer: Option<Arc<Mutex<CheckpointStore>>>,
}

impl BasicBatchBuilder {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store, peer: None }
    }

    pub fn with_peer(mut self, peer: Arc<Mutex<CheckpointStore>>) -> Self {
        self.peer = Some(peer);
        self
    }

    fn read_root(&self) -> Result<StateRoot> {
        let mut root = StateRoot::default();
        if let Some(v) = self.store.get(KEY_STATE_ROOT)? {
            let n = v.len().min(32);
            root[..n].copy_from_slice(&v[..n]);
        }
        Ok(root)
    }
}

impl BatchBuilder for BasicBatchBuilder {
    fn build_batch(
        &mut self,
        coord_idxs: &[Idx],
        _cfg: &TxProcessorConfig,
        l1_user_txs: &[L1Tx],
        l1_coord_txs: &[L1Tx],
        l2_txs: &[PoolL2Tx],
    ) -> Result<ZkInputs> {
        let old_state_root = self.read_root()?;
        let batch_num = self.store.current_batch() + 1;

        let mut hasher = Sha256::new();
        hasher.update(old_state_root);
        hasher.update(batch_num.to_be_bytes());
        for idx in coord_idxs {
            hasher.update(idx.to_be_bytes());
        }
        for tx in l1_user_txs.iter().chain(l1_coord_txs) {
            hasher.update(tx.from_idx.to_be_bytes());
            hasher.update(tx.to_idx.to_be_bytes());
            hasher.update(tx.amount.to_be_bytes());
        }
        for tx in l2_txs {
            hasher.update(tx.tx_id);
        }
        let new_state_root: StateRoot = hasher.finalize().into();

        self.store.put(KEY_STATE_ROOT, &new_state_root)?;
        self.store.make_checkpoint()?;

        let mut l1_txs = l1_user_txs.to_vec();
        l1_txs.extend_from_slice(l1_coord_txs);
        Ok(ZkInputs {
            old_state_root,
            new_state_root,
            batch_num,
            l1_txs,
            l2_txs: l2_txs.to_vec(),
        })
    }

    fn reset(&mut self, batch_num: BatchNum, from_synchronizer: bool) -> Result<()> {
        reset_store(&mut self.store, self.peer.as_ref(), batch_num, from_synchronizer)
    }

    fn checkpoint_exists(&self, batch_num: BatchNum) -> bool {
        self.store.checkpoint_exists(batch_num)
    }

    fn local_state_root(&self) -> Result<StateRoot> {
        self.read_root()
    }

    fn current_batch(&self) -> BatchNum {
        self.store.current_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CheckpointConfig;
    use tempfile::TempDir;

    fn selector(dir: &TempDir) -> BasicTxSelector {
        let store = CheckpointStore::open(CheckpointConfig::new(dir.path())).unwrap();
        BasicTxSelector::new(store)
    }

    fn builder(dir: &TempDir) -> BasicBatchBuilder {
        let store = CheckpointStore::open(CheckpointConfig::new(dir.path())).unwrap();
        BasicBatchBuilder::new(store)
    }

    fn tx(id: u8, from_idx: Idx, nonce: Nonce) -> PoolL2Tx {
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

    #[test]
    fn test_selection_enforces_nonce_order() {
        let dir = TempDir::new().unwrap();
        let mut sel = selector(&dir);
        let idx = sel.create_account(2).unwrap();

        let cfg = TxProcessorConfig::default();
        let stale = tx(1, idx, 1);
        let next = tx(2, idx, 2);
        let chained = tx(3, idx, 3);
        let future = tx(4, idx, 9);
        let selection = sel
            .l2_selection(
                &cfg,
                &[],
                &[stale.clone(), next.clone(), chained.clone(), future.clone()],
            )
            .unwrap();

        assert_eq!(selection.pool_txs, vec![next, chained]);
        assert_eq!(selection.discarded_ids(), vec![stale.tx_id]);
        // the future-nonce tx is neither selected nor discarded
        assert_eq!(sel.account_nonce(idx).unwrap(), Some(4));
        assert_eq!(sel.current_batch(), 1);
    }

    #[test]
    fn test_selection_capacity() {
        let dir = TempDir::new().unwrap();
        let mut sel = selector(&dir);
        let idx = sel.create_account(0).unwrap();
        let cfg = TxProcessorConfig {
            max_txs: 2,
            ..Default::default()
        };
        let txs: Vec<_> = (0..4).map(|i| tx(i as u8 + 1, idx, i)).collect();
        let selection = sel.l2_selection(&cfg, &[], &txs).unwrap();
        assert_eq!(selection.pool_txs.len(), 2);
    }

    #[test]
    fn test_selection_rollback_on_skip() {
        let dir = TempDir::new().unwrap();
        let mut sel = selector(&dir);
        let idx = sel.create_account(0).unwrap();
        let cfg = TxProcessorConfig::default();

        sel.l2_selection(&cfg, &[], &[tx(1, idx, 0)]).unwrap();
        assert_eq!(sel.current_batch(), 1);

        // an empty selection still checkpoints; a policy skip undoes it
        sel.l2_selection(&cfg, &[], &[]).unwrap();
        assert_eq!(sel.current_batch(), 2);
        sel.reset(1, false).unwrap();
        assert_eq!(sel.current_batch(), 1);
        assert_eq!(sel.account_nonce(idx).unwrap(), Some(1));
    }

    #[test]
    fn test_builder_root_chains() {
        let dir = TempDir::new().unwrap();
        let mut bb = builder(&dir);
        let cfg = TxProcessorConfig::default();

        let z1 = bb.build_batch(&[], &cfg, &[], &[], &[tx(1, 256, 0)]).unwrap();
        assert_eq!(z1.old_state_root, [0u8; 32]);
        assert_eq!(z1.batch_num, 1);
        assert_eq!(bb.local_state_root().unwrap(), z1.new_state_root);

        let z2 = bb.build_batch(&[], &cfg, &[], &[], &[]).unwrap();
        assert_eq!(z2.old_state_root, z1.new_state_root);
        assert_ne!(z2.new_state_root, z1.new_state_root);

        // rollback then rebuild reproduces the same root
        bb.reset(1, false).unwrap();
        let z2b = bb.build_batch(&[], &cfg, &[], &[], &[]).unwrap();
        assert_eq!(z2b.new_state_root, z2.new_state_root);
    }

    #[test]
    fn test_resync_without_peer_fails() {
        let dir = TempDir::new().unwrap();
        let mut sel = selector(&dir);
        assert!(sel.reset(3, true).is_err());
        // genesis resync needs no peer
        sel.reset(0, true).unwrap();
        assert_eq!(sel.current_batch(), 0);
    }
}
