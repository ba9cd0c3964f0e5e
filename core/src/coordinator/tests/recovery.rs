use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::forging::Harness;
use super::{forger_addr, other_addr, stats_at, test_cfg, test_consts, test_vars, wait_until};
use crate::coordinator::eth::MockEthClient;
use crate::coordinator::history::MemHistoryDb;
use crate::coordinator::l2pool::{L2Pool, MemL2Pool, PoolTxState, test_tx};
use crate::coordinator::selection::{BasicBatchBuilder, BasicTxSelector, BatchBuilder, TxSelector};
use crate::coordinator::{Coordinator, Msg};
use crate::storage::{CheckpointConfig, CheckpointStore};
use crate::types::{BatchRef, IdxNonce, TxProcessorConfig};

#[tokio::test]
async fn test_stop_pipeline_reforges_from_last_good_batch() {
    let harness = Harness::start(1).await;
    let tx = test_tx(1, 256, 0);
    harness.pool.lock().await.add_tx(tx.clone()).unwrap();

    harness.sync_block().await;
    let eth = harness.eth.clone();
    wait_until("batch 1 submission", move || eth.sent_batches().contains(&1)).await;

    // Batch 1 failed downstream. The coordinator reverts the pool to batch 0
    // and the next synced block restarts forging from scratch.
    harness
        .handle
        .send_msg(Msg::StopPipeline {
            reason: "receipt failed".into(),
            failed_batch_num: 1,
        })
        .await;
    {
        let pool = harness.pool.clone();
        wait_until("pool revert", move || {
            pool.try_lock()
                .map(|pool| pool.tx_state(&tx.tx_id).unwrap() == Some(PoolTxState::Pending))
                .unwrap_or(false)
        })
        .await;
    }

    harness.sync_block().await;
    let eth = harness.eth.clone();
    wait_until("batch 1 resubmission", move || {
        eth.sent_batches().iter().filter(|b| **b == 1).count() >= 2
    })
    .await;

    // the resubmission used the next network nonce
    let sent = harness.eth.sent_txs();
    assert_eq!(sent.last().unwrap().nonce, sent.len() as u64 - 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_external_batch_evicts_phantom_forged_txs() {
    // A tx was marked forged in batch 5 by a forge tx that never mined,
    // while another coordinator successfully forged that batch number.
    let sel_dir = TempDir::new().unwrap();
    let bb_dir = TempDir::new().unwrap();
    let selector = BasicTxSelector::new(
        CheckpointStore::open(CheckpointConfig::new(sel_dir.path())).unwrap(),
    );
    let builder = BasicBatchBuilder::new(
        CheckpointStore::open(CheckpointConfig::new(bb_dir.path())).unwrap(),
    );
    let pool: Arc<Mutex<dyn L2Pool>> = Arc::new(Mutex::new(MemL2Pool::new()));
    let tx = test_tx(1, 256, 0);
    {
        let mut pool = pool.lock().await;
        pool.add_tx(tx.clone()).unwrap();
        pool.start_forging(&[tx.tx_id], 5).unwrap();
        pool.done_forging(&[tx.tx_id], 5).unwrap();
    }

    let (coordinator, handle) = Coordinator::new(
        test_cfg(forger_addr()),
        test_consts(),
        test_vars(),
        Arc::new(MemHistoryDb::new()),
        pool.clone(),
        Arc::new(Mutex::new(selector)),
        Arc::new(Mutex::new(builder)),
        vec![],
        Arc::new(MockEthClient::new()),
    )
    .await
    .unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    // not yet synced, so no pipeline starts; the external batch alone must
    // drop the phantom forged tx back to pending
    let mut stats = stats_at(10, 5, forger_addr());
    stats.sync.last_block = 9;
    handle
        .send_msg(Msg::SyncBlock {
            stats,
            batches: vec![BatchRef {
                batch_num: 5,
                forger: other_addr(),
                state_root: [7u8; 32],
            }],
            vars: Default::default(),
        })
        .await;

    {
        let pool = pool.clone();
        wait_until("phantom tx eviction", move || {
            pool.try_lock()
                .map(|pool| pool.tx_state(&tx.tx_id).unwrap() == Some(PoolTxState::Pending))
                .unwrap_or(false)
        })
        .await;
    }

    cancel.cancel();
    task.await.unwrap();
}

#[test]
fn test_reorg_rewinds_stores_and_pool_together() {
    let sel_dir = TempDir::new().unwrap();
    let bb_dir = TempDir::new().unwrap();
    let mut selector = BasicTxSelector::new(
        CheckpointStore::open(CheckpointConfig::new(sel_dir.path())).unwrap(),
    );
    let mut builder = BasicBatchBuilder::new(
        CheckpointStore::open(CheckpointConfig::new(bb_dir.path())).unwrap(),
    );
    let mut pool = MemL2Pool::new();
    let cfg = TxProcessorConfig::default();

    // forge batches 1..=5, one tx each, advancing both stores in lockstep
    let txs: Vec<_> = (1..=5u64).map(|b| test_tx(b as u8, 300 + b, 0)).collect();
    for (i, tx) in txs.iter().enumerate() {
        let batch_num = i as u64 + 1;
        pool.add_tx(tx.clone()).unwrap();
        let selection = selector.l2_selection(&cfg, &[], &[tx.clone()]).unwrap();
        builder
            .build_batch(&[], &cfg, &[], &[], &selection.pool_txs)
            .unwrap();
        pool.start_forging(&[tx.tx_id], batch_num).unwrap();
        pool.done_forging(&[tx.tx_id], batch_num).unwrap();
    }
    // plus a tx invalidated at batch 5
    let invalid = test_tx(9, 300, 0);
    pool.add_tx(invalid.clone()).unwrap();
    pool.invalidate_old_nonces(&[IdxNonce { idx: 300, nonce: 4 }], 5)
        .unwrap();
    assert_eq!(selector.current_batch(), 5);
    assert_eq!(builder.current_batch(), 5);

    // batches 4 and 5 were reorged away
    pool.reorg(3).unwrap();
    selector.reset(3, false).unwrap();
    builder.reset(3, false).unwrap();

    assert_eq!(selector.current_batch(), 3);
    assert_eq!(builder.current_batch(), 3);
    for tx in &txs[..3] {
        assert_eq!(pool.tx_state(&tx.tx_id).unwrap(), Some(PoolTxState::Forged));
    }
    for tx in &txs[3..] {
        assert_eq!(pool.tx_state(&tx.tx_id).unwrap(), Some(PoolTxState::Pending));
    }
    assert_eq!(
        pool.tx_state(&invalid.tx_id).unwrap(),
        Some(PoolTxState::Pending)
    );
}
