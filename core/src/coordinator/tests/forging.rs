use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{forger_addr, stats_at, stats_at_slot, test_cfg, test_consts, test_vars, wait_until};
use crate::coordinator::eth::MockEthClient;
use crate::coordinator::history::MemHistoryDb;
use crate::coordinator::l2pool::{L2Pool, MemL2Pool, PoolTxState, test_tx};
use crate::coordinator::prover::MockProverClient;
use crate::coordinator::selection::{BasicBatchBuilder, BasicTxSelector};
use crate::coordinator::{Coordinator, CoordinatorHandle, Msg, prover::ProverClient};
use crate::storage::{CheckpointConfig, CheckpointStore};

pub(super) struct Harness {
    pub pool: Arc<Mutex<dyn L2Pool>>,
    pub eth: Arc<MockEthClient>,
    pub handle: CoordinatorHandle,
    pub cancel: CancellationToken,
    pub task: tokio::task::JoinHandle<()>,
    _dirs: (TempDir, TempDir),
}

impl Harness {
    /// Spawns a coordinator over empty state with `n_provers` mock provers.
    pub(super) async fn start(n_provers: usize) -> Self {
        Self::start_with(test_cfg(forger_addr()), n_provers).await
    }

    pub(super) async fn start_with(cfg: crate::coordinator::Config, n_provers: usize) -> Self {
        let sel_dir = TempDir::new().unwrap();
        let bb_dir = TempDir::new().unwrap();
        let selector = BasicTxSelector::new(
            CheckpointStore::open(CheckpointConfig::new(sel_dir.path())).unwrap(),
        );
        let builder = BasicBatchBuilder::new(
            CheckpointStore::open(CheckpointConfig::new(bb_dir.path())).unwrap(),
        );
        let pool: Arc<Mutex<dyn L2Pool>> = Arc::new(Mutex::new(MemL2Pool::new()));
        let eth = Arc::new(MockEthClient::new());
        eth.set_last_block(1);
        let provers: Vec<Arc<dyn ProverClient>> = (0..n_provers)
            .map(|i| {
                Arc::new(MockProverClient::new(
                    format!("mock://prover-{i}"),
                    Duration::ZERO,
                )) as Arc<dyn ProverClient>
            })
            .collect();

        let (coordinator, handle) = Coordinator::new(
            cfg,
            test_consts(),
            test_vars(),
            Arc::new(MemHistoryDb::new()),
            pool.clone(),
            Arc::new(Mutex::new(selector)),
            Arc::new(Mutex::new(builder)),
            provers,
            eth.clone(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));
        Self {
            pool,
            eth,
            handle,
            cancel,
            task,
            _dirs: (sel_dir, bb_dir),
        }
    }

    pub(super) async fn sync_block(&self) {
        self.handle
            .send_msg(Msg::SyncBlock {
                stats: stats_at(1, 0, forger_addr()),
                batches: vec![],
                vars: Default::default(),
            })
            .await;
    }

    pub(super) async fn shutdown(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }
}

#[tokio::test]
async fn test_forges_and_submits_batch() {
    let harness = Harness::start(2).await;
    let txs = [test_tx(1, 256, 0), test_tx(2, 256, 1), test_tx(3, 257, 0)];
    {
        let mut pool = harness.pool.lock().await;
        for tx in &txs {
            pool.add_tx(tx.clone()).unwrap();
        }
    }

    harness.sync_block().await;

    let eth = harness.eth.clone();
    wait_until("batch 1 submission", move || eth.sent_batches().contains(&1)).await;

    // the submitted batch carries all three txs, in nonce order per sender
    let sent = harness.eth.sent_txs();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].nonce, 0);

    let pool = harness.pool.lock().await;
    for tx in &txs {
        assert_eq!(pool.tx_state(&tx.tx_id).unwrap(), Some(PoolTxState::Forged));
    }
    drop(pool);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_forge_once_per_slot() {
    let cfg = crate::coordinator::Config {
        forge_once_per_slot_if_txs: true,
        ..test_cfg(forger_addr())
    };
    let harness = Harness::start_with(cfg, 1).await;

    // one tx per slot; each slot yields exactly one batch, numbered
    // consecutively, and the slot stays committed until the next one
    for batch_num in 1u64..=3 {
        let slot = batch_num as i64 - 1;
        harness
            .pool
            .lock()
            .await
            .add_tx(test_tx(batch_num as u8, 256, batch_num - 1))
            .unwrap();
        harness
            .handle
            .send_msg(Msg::SyncBlock {
                stats: stats_at_slot(slot, slot * 40 + 1, batch_num - 1, forger_addr()),
                batches: vec![],
                vars: Default::default(),
            })
            .await;
        let eth = harness.eth.clone();
        wait_until("batch submission", move || {
            eth.sent_batches().contains(&batch_num)
        })
        .await;
        let expected: Vec<u64> = (1..=batch_num).collect();
        assert_eq!(harness.eth.sent_batches(), expected);
    }

    // further blocks inside the already-forged slot must not yield a second
    // batch, with or without new txs waiting
    harness
        .pool
        .lock()
        .await
        .add_tx(test_tx(4, 256, 3))
        .unwrap();
    harness
        .handle
        .send_msg(Msg::SyncBlock {
            stats: stats_at_slot(2, 85, 3, forger_addr()),
            batches: vec![],
            vars: Default::default(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.eth.sent_batches(), vec![1, 2, 3]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_empty_batches_are_skipped() {
    let harness = Harness::start(1).await;
    harness.sync_block().await;

    // the pipeline starts with an empty pool; the no-txs policy keeps it
    // from forging anything
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(harness.eth.sent_batches().is_empty());

    // as soon as a tx shows up the next forge attempt goes through
    harness
        .pool
        .lock()
        .await
        .add_tx(test_tx(1, 256, 0))
        .unwrap();
    let eth = harness.eth.clone();
    wait_until("batch 1 submission", move || eth.sent_batches().contains(&1)).await;

    harness.shutdown().await;
}
