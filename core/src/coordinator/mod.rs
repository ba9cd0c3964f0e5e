//! Forging coordinator.
//!
//! The coordinator is an actor fed by the synchronizer. While the forger
//! address is allowed to forge it keeps a [`pipeline::Pipeline`] running,
//! which selects txs, builds batches and collects proofs; proven batches go
//! to the [`tx_manager::TxManager`] for submission. Any failure along the way
//! comes back as a [`Msg::StopPipeline`] and the pipeline is restarted from
//! the last batch known to be good.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::{
    Address, AuctionConsts, BatchNum, BatchRef, BlockNum, ScVariables, ScVariablesUpdate, Slot,
    SyncStats, TxProcessorConfig,
};

pub mod batch;
pub mod eth;
pub mod history;
pub mod l2pool;
pub mod pipeline;
pub mod prover;
pub mod provers_pool;
pub mod purger;
pub mod selection;
pub mod tx_manager;

#[cfg(test)]
mod tests;

use eth::EthClient;
use history::HistoryDb;
use l2pool::L2Pool;
use pipeline::{Pipeline, PipelineCtx};
use prover::ProverClient;
use purger::{Purger, PurgerCfg};
use selection::{BatchBuilder, TxSelector};
use tx_manager::{TxManager, TxManagerHandle};

const QUEUE_LEN: usize = 16;
const STOP_TIMEOUT: Duration = Duration::from_millis(200);
pub(crate) const LONG_WAIT: Duration = Duration::from_secs(3596400);

/// Gas spent by the forge call, per component.
#[derive(Debug, Clone, Copy)]
pub struct ForgeBatchGasCost {
    pub fixed: u64,
    pub l1_user_tx: u64,
    pub l1_coord_tx: u64,
    pub l2_tx: u64,
}

impl Default for ForgeBatchGasCost {
    fn default() -> Self {
        Self {
            fixed: 600_000,
            l1_user_tx: 15_000,
            l1_coord_tx: 7_000,
            l2_tx: 600,
        }
    }
}

/// Runtime configuration of the coordinator and its pipelines.
#[derive(Debug, Clone)]
pub struct Config {
    pub forger_address: Address,
    /// Blocks a forge tx must be buried under before it is dropped from the
    /// confirmation queue.
    pub confirm_blocks: i64,
    /// Fraction of the L1 batch timeout after which the pipeline schedules
    /// an L1 batch on its own.
    pub l1_batch_timeout_perc: f64,
    /// Don't start a pipeline during the first blocks of a slot.
    pub start_slot_blocks_delay: i64,
    /// Also require forging permission this many blocks ahead before
    /// starting a pipeline.
    pub schedule_batch_blocks_ahead_check: i64,
    /// Also require forging permission this many blocks ahead before
    /// submitting a batch.
    pub send_batch_blocks_margin_check: i64,
    pub eth_client_attempts: usize,
    pub eth_client_attempts_delay: Duration,
    /// Resend an unmined forge tx with a higher gas price after this long.
    pub eth_tx_resend_timeout: Duration,
    /// Use a fresh network nonce for every send instead of resending with
    /// the same nonce.
    pub eth_no_reuse_nonce: bool,
    pub max_gas_price: u64,
    pub min_gas_price: u64,
    pub gas_price_inc_perc: u64,
    pub tx_manager_check_interval: Duration,
    /// Forge in slots won by others once their deadline passes without a
    /// commitment.
    pub must_forge_at_slot_deadline: bool,
    /// Forge continuously even before the slot is committed.
    pub ignore_slot_commitment: bool,
    /// Forge exactly one batch per slot, and only if there is work to forge.
    pub forge_once_per_slot_if_txs: bool,
    pub forge_delay: Duration,
    pub forge_no_txs_delay: Duration,
    pub forge_retry_interval: Duration,
    pub sync_retry_interval: Duration,
    pub purge_by_ext_del_interval: Duration,
    /// When set, every batch state change is dumped as JSON under this path.
    pub debug_batch_path: Option<PathBuf>,
    pub purger: PurgerCfg,
    pub verifier_idx: usize,
    pub forge_batch_gas_cost: ForgeBatchGasCost,
    pub tx_processor: TxProcessorConfig,
    pub prover_read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forger_address: [0u8; 20],
            confirm_blocks: 5,
            l1_batch_timeout_perc: 0.6,
            start_slot_blocks_delay: 0,
            schedule_batch_blocks_ahead_check: 0,
            send_batch_blocks_margin_check: 0,
            eth_client_attempts: 5,
            eth_client_attempts_delay: Duration::from_millis(500),
            eth_tx_resend_timeout: Duration::from_secs(120),
            eth_no_reuse_nonce: false,
            max_gas_price: 500_000_000_000,
            min_gas_price: 1_000_000_000,
            gas_price_inc_perc: 0,
            tx_manager_check_interval: Duration::from_secs(1),
            must_forge_at_slot_deadline: true,
            ignore_slot_commitment: false,
            forge_once_per_slot_if_txs: false,
            forge_delay: Duration::ZERO,
            forge_no_txs_delay: Duration::ZERO,
            forge_retry_interval: Duration::from_secs(10),
            sync_retry_interval: Duration::from_secs(1),
            purge_by_ext_del_interval: Duration::from_secs(60),
            debug_batch_path: None,
            purger: PurgerCfg::default(),
            verifier_idx: 0,
            forge_batch_gas_cost: ForgeBatchGasCost::default(),
            tx_processor: TxProcessorConfig::default(),
            prover_read_timeout: Duration::from_secs(20),
        }
    }
}

fn parse_address(s: &str) -> Result<Address> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw).with_context(|| format!("decoding address {s}"))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("address {s} is not 20 bytes"))
}

impl Config {
    /// Maps the file configuration onto the runtime one.
    pub fn from_cfg(cfg: &zkforge_config::ZkforgeConfig) -> Result<Self> {
        let forging = &cfg.forging;
        let eth = &cfg.eth;
        Ok(Self {
            forger_address: parse_address(&forging.forger_address)
                .context("parsing forger address")?,
            confirm_blocks: forging.confirm_blocks,
            l1_batch_timeout_perc: forging.l1_batch_timeout_perc,
            start_slot_blocks_delay: forging.start_slot_blocks_delay,
            schedule_batch_blocks_ahead_check: forging.schedule_batch_blocks_ahead_check,
            send_batch_blocks_margin_check: forging.send_batch_blocks_margin_check,
            eth_client_attempts: eth.client_attempts,
            eth_client_attempts_delay: Duration::from_millis(eth.client_attempts_delay_ms),
            eth_tx_resend_timeout: Duration::from_millis(eth.tx_resend_timeout_ms),
            eth_no_reuse_nonce: eth.no_reuse_nonce,
            max_gas_price: eth.max_gas_price,
            min_gas_price: eth.min_gas_price,
            gas_price_inc_perc: eth.gas_price_inc_perc,
            tx_manager_check_interval: Duration::from_millis(eth.check_interval_ms),
            must_forge_at_slot_deadline: forging.must_forge_at_slot_deadline,
            ignore_slot_commitment: forging.ignore_slot_commitment,
            forge_once_per_slot_if_txs: forging.forge_once_per_slot_if_txs,
            forge_delay: Duration::from_millis(forging.forge_delay_ms),
            forge_no_txs_delay: Duration::from_millis(forging.forge_no_txs_delay_ms),
            forge_retry_interval: Duration::from_millis(forging.forge_retry_interval_ms),
            sync_retry_interval: Duration::from_millis(forging.sync_retry_interval_ms),
            purge_by_ext_del_interval: Duration::from_millis(
                forging.purge_by_external_delete_interval_ms,
            ),
            debug_batch_path: forging.debug_batch_path.as_ref().map(PathBuf::from),
            purger: PurgerCfg {
                purge_batch_delay: cfg.purger.purge_batch_delay,
                purge_block_delay: cfg.purger.purge_block_delay,
                invalidate_batch_delay: cfg.purger.invalidate_batch_delay,
                invalidate_block_delay: cfg.purger.invalidate_block_delay,
                ..PurgerCfg::default()
            },
            prover_read_timeout: Duration::from_millis(cfg.provers.read_timeout_ms),
            ..Self::default()
        })
    }
}

/// Messages handled by the coordinator actor.
#[derive(Debug)]
pub enum Msg {
    /// A new block was synchronized.
    SyncBlock {
        stats: SyncStats,
        /// Batches forged in the block, in order.
        batches: Vec<BatchRef>,
        vars: ScVariablesUpdate,
    },
    /// A chain reorg was synchronized.
    SyncReorg {
        stats: SyncStats,
        vars: ScVariablesUpdate,
    },
    /// A pipeline component failed; restart forging from a good batch.
    /// `failed_batch_num` 0 means the failing batch is unknown and the next
    /// pipeline starts from the synchronizer state.
    StopPipeline {
        reason: String,
        failed_batch_num: BatchNum,
    },
}

/// Decides whether `forger` is allowed to forge at `block_num`. The slot
/// winner always can; once the slot deadline passes without a commitment
/// anyone can, if configured to jump in.
pub(crate) fn can_forge(
    consts: &AuctionConsts,
    slot_deadline: i64,
    current_slot: &Slot,
    next_slot: &Slot,
    forger: &Address,
    block_num: BlockNum,
    must_forge_at_slot_deadline: bool,
) -> bool {
    if block_num < consts.genesis_block_num {
        info!(
            block_num,
            genesis = consts.genesis_block_num,
            "block before auction genesis"
        );
        return false;
    }
    let slot = if current_slot.contains(block_num) {
        current_slot
    } else if next_slot.contains(block_num) {
        next_slot
    } else {
        warn!(block_num, "block outside the current and next slot");
        return false;
    };
    let mut anyone_forge = false;
    if !slot.forger_commitment && consts.relative_block(block_num) >= slot_deadline {
        debug!(block_num, "slot deadline passed without commitment");
        anyone_forge = true;
    }
    slot.forger == *forger || (anyone_forge && must_forge_at_slot_deadline)
}

/// Thread safe entry point for passing messages to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    msg_tx: mpsc::Sender<Msg>,
}

impl CoordinatorHandle {
    pub async fn send_msg(&self, msg: Msg) {
        let _ = self.msg_tx.send(msg).await;
    }
}

pub struct Coordinator {
    cfg: Arc<Config>,
    consts: AuctionConsts,
    vars: ScVariables,
    stats: SyncStats,
    /// Sequential pipeline number; the first pipeline is 1.
    pipeline_num: u64,
    /// Batch the current pipeline was started from.
    pipeline_from_batch: BatchRef,
    last_non_failed_batch_num: BatchNum,

    history: Arc<dyn HistoryDb>,
    pool: Arc<Mutex<dyn L2Pool>>,
    selector: Arc<Mutex<dyn TxSelector>>,
    builder: Arc<Mutex<dyn BatchBuilder>>,
    purger: Arc<Mutex<Purger>>,
    provers: Vec<Arc<dyn ProverClient>>,

    msg_tx: mpsc::Sender<Msg>,
    msg_rx: mpsc::Receiver<Msg>,
    tx_manager: Option<TxManager>,
    tx_manager_handle: TxManagerHandle,
    pipeline: Option<Pipeline>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        cfg: Config,
        consts: AuctionConsts,
        vars: ScVariables,
        history: Arc<dyn HistoryDb>,
        pool: Arc<Mutex<dyn L2Pool>>,
        selector: Arc<Mutex<dyn TxSelector>>,
        builder: Arc<Mutex<dyn BatchBuilder>>,
        provers: Vec<Arc<dyn ProverClient>>,
        eth_client: Arc<dyn EthClient>,
    ) -> Result<(Self, CoordinatorHandle)> {
        if let Some(path) = &cfg.debug_batch_path {
            std::fs::create_dir_all(path).context("creating debug batch dir")?;
        }
        let cfg = Arc::new(cfg);
        let (msg_tx, msg_rx) = mpsc::channel(QUEUE_LEN);
        let (tx_manager, tx_manager_handle) = TxManager::new(
            cfg.clone(),
            consts,
            vars,
            eth_client,
            pool.clone(),
            msg_tx.clone(),
        )
        .await
        .context("creating tx manager")?;

        // last_block starts below genesis so synced() stays false until the
        // first real stats arrive
        let mut stats = SyncStats::default();
        stats.eth.last_block = -1;

        let handle = CoordinatorHandle {
            msg_tx: msg_tx.clone(),
        };
        Ok((
            Self {
                purger: Arc::new(Mutex::new(Purger::new(cfg.purger))),
                cfg,
                consts,
                vars,
                stats,
                pipeline_num: 0,
                pipeline_from_batch: BatchRef::default(),
                last_non_failed_batch_num: 0,
                history,
                pool,
                selector,
                builder,
                provers,
                msg_tx,
                msg_rx,
                tx_manager: Some(tx_manager),
                tx_manager_handle,
                pipeline: None,
            },
            handle,
        ))
    }

    /// Runs the coordinator until `cancel` fires. Spawns the submission
    /// actor and the external-delete purge loop alongside the message loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if let Some(tx_manager) = self.tx_manager.take() {
            tasks.push(tokio::spawn(tx_manager.run(cancel.clone())));
        }
        tasks.push(tokio::spawn(purge_by_external_delete_loop(
            self.pool.clone(),
            self.cfg.purge_by_ext_del_interval,
            cancel.clone(),
        )));

        let timer = tokio::time::sleep(LONG_WAIT);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(msg) = self.msg_rx.recv() => {
                    if let Err(e) = self.handle_msg(msg).await {
                        if cancel.is_cancelled() {
                            continue;
                        }
                        error!(error = %e, "handling coordinator message");
                        timer.as_mut().reset(
                            tokio::time::Instant::now() + self.cfg.sync_retry_interval);
                    }
                }
                _ = timer.as_mut() => {
                    timer.as_mut().reset(tokio::time::Instant::now() + LONG_WAIT);
                    if !self.stats.synced() {
                        continue;
                    }
                    if let Err(e) = self.sync_stats().await {
                        if cancel.is_cancelled() {
                            continue;
                        }
                        error!(error = %e, "updating forging state");
                        timer.as_mut().reset(
                            tokio::time::Instant::now() + self.cfg.sync_retry_interval);
                    }
                }
            }
        }
        info!("coordinator done");
        if let Some(mut pipeline) = self.pipeline.take() {
            if tokio::time::timeout(STOP_TIMEOUT, pipeline.stop()).await.is_err() {
                warn!("pipeline stop timed out");
            }
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn handle_msg(&mut self, msg: Msg) -> Result<()> {
        match msg {
            Msg::SyncBlock {
                stats,
                batches,
                vars,
            } => self
                .handle_sync_block(stats, &batches, vars)
                .await
                .context("handling sync block"),
            Msg::SyncReorg { stats, vars } => self
                .handle_sync_reorg(stats, vars)
                .await
                .context("handling sync reorg"),
            Msg::StopPipeline {
                reason,
                failed_batch_num,
            } => {
                info!(reason, failed_batch_num, "stop pipeline requested");
                self.handle_stop_pipeline(failed_batch_num)
                    .await
                    .context("stopping pipeline")
            }
        }
    }

    async fn handle_sync_block(
        &mut self,
        stats: SyncStats,
        batches: &[BatchRef],
        vars: ScVariablesUpdate,
    ) -> Result<()> {
        self.stats = stats;
        self.vars.apply(&vars);
        self.tx_manager_handle.set_sync_stats_vars(stats, vars).await;
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_sync_stats_vars(stats, vars).await;
        }

        // A batch forged by someone else at a number we attempted means our
        // forge tx lost; drop the phantom forged txs from the pool.
        let first_external = batches
            .iter()
            .find(|b| b.forger != self.cfg.forger_address)
            .map(|b| b.batch_num);
        if let Some(first_external) = first_external {
            let last_valid_batch = first_external - 1;
            if self.pipeline.is_some() {
                info!(last_valid_batch, "synced batches from another forger");
                self.handle_stop_pipeline(last_valid_batch).await?;
            } else {
                self.pool
                    .lock()
                    .await
                    .reorg(last_valid_batch)
                    .context("reverting pool after external batches")?;
            }
        }

        if !self.stats.synced() {
            return Ok(());
        }
        self.sync_stats().await
    }

    async fn handle_sync_reorg(
        &mut self,
        stats: SyncStats,
        vars: ScVariablesUpdate,
    ) -> Result<()> {
        self.stats = stats;
        self.vars.apply(&vars);
        self.tx_manager_handle.set_sync_stats_vars(stats, vars).await;
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_sync_stats_vars(stats, vars).await;
        }
        // The batch the pipeline was started from may have been reorged
        // away. If the new head at that height is someone else's with a
        // different root, everything forged on top of it is invalid.
        if self.stats.sync.last_batch.forger != self.cfg.forger_address
            && self.stats.sync.last_batch.state_root != self.pipeline_from_batch.state_root
        {
            info!(
                batch_num = self.stats.sync.last_batch.batch_num,
                "pipeline start batch reorged away"
            );
            self.tx_manager_handle
                .discard_pipeline(self.pipeline_num)
                .await;
            self.handle_stop_pipeline(0).await?;
        }
        Ok(())
    }

    /// Stops the pipeline and reverts the pool. `failed_batch_num` 0 falls
    /// back to the synchronizer's last batch.
    async fn handle_stop_pipeline(&mut self, failed_batch_num: BatchNum) -> Result<()> {
        let batch_num = if failed_batch_num != 0 {
            failed_batch_num - 1
        } else {
            self.stats.sync.last_batch.batch_num
        };
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }
        self.pool
            .lock()
            .await
            .reorg(batch_num)
            .context("reverting pool after pipeline stop")?;
        self.last_non_failed_batch_num = batch_num;
        Ok(())
    }

    /// Starts or stops the pipeline depending on whether we may forge at the
    /// next block, and runs pool maintenance while no pipeline owns it.
    async fn sync_stats(&mut self) -> Result<()> {
        let next_block = self.stats.eth.last_block + 1;
        let mut can_forge = self.can_forge_at(next_block);
        if self.cfg.schedule_batch_blocks_ahead_check != 0 && can_forge {
            can_forge = self.can_forge_at(next_block + self.cfg.schedule_batch_blocks_ahead_check);
        }
        if self.pipeline.is_none() {
            let relative_block = self.consts.relative_block(next_block);
            if can_forge && relative_block < self.cfg.start_slot_blocks_delay {
                debug!(
                    relative_block,
                    delay = self.cfg.start_slot_blocks_delay,
                    "delaying pipeline start"
                );
            } else if can_forge {
                info!(
                    block_num = next_block,
                    batch_num = self.stats.sync.last_batch.batch_num,
                    "forging state begin"
                );
                self.start_pipeline().await?;
            }
        } else if !can_forge {
            info!(block_num = next_block, "forging state end");
            if let Some(mut pipeline) = self.pipeline.take() {
                pipeline.stop().await;
            }
        }
        if self.pipeline.is_none() {
            let mut pool = self.pool.lock().await;
            let selector = self.selector.lock().await;
            let mut purger = self.purger.lock().await;
            purger
                .invalidate_maybe(
                    &mut *pool,
                    &*selector,
                    self.stats.sync.last_block,
                    self.stats.sync.last_batch.batch_num,
                )
                .context("invalidate maybe")?;
            purger
                .purge_maybe(
                    &mut *pool,
                    self.stats.sync.last_block,
                    self.stats.sync.last_batch.batch_num,
                )
                .context("purge maybe")?;
        }
        Ok(())
    }

    async fn start_pipeline(&mut self) -> Result<()> {
        let mut from_batch = self.stats.sync.last_batch;
        if self.last_non_failed_batch_num > from_batch.batch_num {
            // a batch of ours failed above the synced head; restart over the
            // local state instead of the chain's
            from_batch = BatchRef {
                batch_num: self.last_non_failed_batch_num,
                forger: self.cfg.forger_address,
                state_root: [0u8; 32],
            };
        }
        // Failsafe in case a previous pipeline left txs marked as forging in
        // batches that never mined; handle_stop_pipeline already does this
        // but the synced batch may have moved since.
        self.pool
            .lock()
            .await
            .reorg(from_batch.batch_num)
            .context("reverting pool before pipeline start")?;

        self.pipeline_num += 1;
        let ctx = PipelineCtx {
            cfg: self.cfg.clone(),
            history: self.history.clone(),
            pool: self.pool.clone(),
            selector: self.selector.clone(),
            builder: self.builder.clone(),
            purger: self.purger.clone(),
            coord_msg_tx: self.msg_tx.clone(),
            batch_tx: self.tx_manager_handle.batch_tx.clone(),
        };
        let mut pipeline = Pipeline::new(self.pipeline_num, ctx, self.provers.clone())
            .await
            .context("creating pipeline")?;
        self.pipeline_from_batch = from_batch;
        pipeline
            .start(from_batch.batch_num, self.stats, self.vars)
            .await
            .context("starting pipeline")?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn can_forge_at(&self, block_num: BlockNum) -> bool {
        can_forge(
            &self.consts,
            self.vars.slot_deadline,
            &self.stats.sync.current_slot,
            &self.stats.sync.next_slot,
            &self.cfg.forger_address,
            block_num,
            self.cfg.must_forge_at_slot_deadline,
        )
    }
}

/// Periodically drops pool txs flagged for external deletion. Takes the pool
/// lock so a deletion never races a pipeline mid-selection.
async fn purge_by_external_delete_loop(
    pool: Arc<Mutex<dyn L2Pool>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("external delete purge loop done");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                let mut pool = pool.lock().await;
                if let Err(e) = pool.purge_by_external_delete() {
                    error!(error = %e, "purging externally deleted txs");
                }
            }
        }
    }
}
