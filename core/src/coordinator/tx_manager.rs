//! Forge transaction submission and confirmation.
//!
//! The TxManager owns the account nonce. Proven batches come in over a
//! channel, get a signed forge call pushed to L1, and sit in a round-robin
//! queue until their receipt confirms. Unmined transactions past the resend
//! timeout are resent with the same nonce and a bumped gas price, so at most
//! one chain transaction per batch can ever mine.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch::{BatchInfo, BatchStatus, debug_batch_store, now_ms};
use super::eth::{EthClient, EthClientError, ReceiptStatus, TxAuth};
use super::l2pool::L2Pool;
use super::{Config, Msg, can_forge};
use crate::types::{AuctionConsts, BatchNum, BlockNum, ScVariables, ScVariablesUpdate, SyncStats};

use super::LONG_WAIT;

const QUEUE_LEN: usize = 16;
const OUT_OF_ORDER_REQUEUE_DELAY: std::time::Duration = std::time::Duration::from_millis(500);
const RESEND_GAS_PERC: u64 = 10;

/// Adds `p` percent to `v`, at least 1 so a resend never reuses the exact
/// same gas price.
fn add_perc(v: u64, p: u64) -> u64 {
    let mut r = v / 100 * p + v % 100 * p / 100;
    if r == 0 {
        r = 1;
    }
    v + r
}

/// Channels for feeding the running TxManager.
#[derive(Clone)]
pub struct TxManagerHandle {
    pub batch_tx: mpsc::Sender<BatchInfo>,
    pub stats_tx: mpsc::Sender<(SyncStats, ScVariablesUpdate)>,
    pub discard_tx: mpsc::Sender<u64>,
}

impl TxManagerHandle {
    pub async fn add_batch(&self, batch_info: BatchInfo) {
        let _ = self.batch_tx.send(batch_info).await;
    }

    pub async fn set_sync_stats_vars(&self, stats: SyncStats, vars: ScVariablesUpdate) {
        let _ = self.stats_tx.send((stats, vars)).await;
    }

    /// Notifies that a pipeline was discarded after a reorg; its pending
    /// batches will be dropped from the queue.
    pub async fn discard_pipeline(&self, pipeline_num: u64) {
        let _ = self.discard_tx.send(pipeline_num).await;
    }
}

/// Round-robin queue of batches waiting for confirmation.
#[derive(Default)]
struct Queue {
    list: Vec<BatchInfo>,
    next: usize,
}

impl Queue {
    fn len(&self) -> usize {
        self.list.len()
    }

    /// Position of the next batch to check, advancing the cursor.
    fn next_pos(&mut self) -> Option<usize> {
        if self.list.is_empty() {
            return None;
        }
        let pos = self.next;
        self.next = (self.next + 1) % self.list.len();
        Some(pos)
    }

    fn push(&mut self, batch_info: BatchInfo) {
        self.list.push(batch_info);
    }

    fn remove(&mut self, position: usize) -> BatchInfo {
        let batch_info = self.list.remove(position);
        if self.list.is_empty() {
            self.next = 0;
        } else {
            self.next = position % self.list.len();
        }
        batch_info
    }
}

pub struct TxManager {
    cfg: Arc<Config>,
    consts: AuctionConsts,
    eth_client: Arc<dyn EthClient>,
    pool: Arc<Mutex<dyn L2Pool>>,
    coord_msg_tx: mpsc::Sender<Msg>,
    batch_rx: mpsc::Receiver<BatchInfo>,
    batch_tx: mpsc::Sender<BatchInfo>,
    stats_rx: mpsc::Receiver<(SyncStats, ScVariablesUpdate)>,
    discard_rx: mpsc::Receiver<u64>,
    stats: SyncStats,
    vars: ScVariables,
    queue: Queue,
    /// Batches from pipelines below this number are dropped.
    min_pipeline_num: u64,
    last_sent_l1_batch_block: BlockNum,
    last_success_batch: BatchNum,
    /// Nonce of the last mined transaction plus one.
    acc_nonce: u64,
    /// Nonce the next new transaction will use.
    acc_next_nonce: u64,
}

impl TxManager {
    pub async fn new(
        cfg: Arc<Config>,
        consts: AuctionConsts,
        vars: ScVariables,
        eth_client: Arc<dyn EthClient>,
        pool: Arc<Mutex<dyn L2Pool>>,
        coord_msg_tx: mpsc::Sender<Msg>,
    ) -> Result<(Self, TxManagerHandle)> {
        let acc_nonce = eth_client
            .nonce_at()
            .await
            .map_err(|e| anyhow!("reading account nonce: {e}"))?;
        let (batch_tx, batch_rx) = mpsc::channel(QUEUE_LEN);
        let (stats_tx, stats_rx) = mpsc::channel(QUEUE_LEN);
        let (discard_tx, discard_rx) = mpsc::channel(QUEUE_LEN);
        let handle = TxManagerHandle {
            batch_tx: batch_tx.clone(),
            stats_tx,
            discard_tx,
        };
        Ok((
            Self {
                cfg,
                consts,
                eth_client,
                pool,
                coord_msg_tx,
                batch_rx,
                batch_tx,
                stats_rx,
                discard_rx,
                stats: SyncStats::default(),
                vars,
                queue: Queue::default(),
                min_pipeline_num: 0,
                last_sent_l1_batch_block: 0,
                last_success_batch: 0,
                acc_nonce,
                acc_next_nonce: acc_nonce,
            },
            handle,
        ))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        // nothing can be decided before the first synchronizer snapshot
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = self.stats_rx.recv() => {
                let Some((stats, vars)) = msg else { return };
                self.stats = stats;
                self.vars.apply(&vars);
            }
        }
        info!(
            block = self.stats.eth.last_block,
            batch = self.stats.eth.last_batch,
            "tx manager received initial stats"
        );

        let timer = tokio::time::sleep(LONG_WAIT);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("tx manager done");
                    return;
                }
                Some((stats, vars)) = self.stats_rx.recv() => {
                    self.stats = stats;
                    self.vars.apply(&vars);
                }
                Some(pipeline_num) = self.discard_rx.recv() => {
                    self.min_pipeline_num = pipeline_num + 1;
                    if let Err(e) = self.remove_bad_batch_infos(&cancel).await {
                        if !cancel.is_cancelled() {
                            error!(error = %e, "removing bad batches");
                        }
                    }
                }
                Some(batch_info) = self.batch_rx.recv() => {
                    self.handle_batch(&cancel, batch_info).await;
                    if self.queue.len() != 0 {
                        timer.as_mut().reset(
                            tokio::time::Instant::now() + self.cfg.tx_manager_check_interval);
                    }
                }
                _ = timer.as_mut() => {
                    let Some(pos) = self.queue.next_pos() else {
                        timer.as_mut().reset(tokio::time::Instant::now() + LONG_WAIT);
                        continue;
                    };
                    timer.as_mut().reset(
                        tokio::time::Instant::now() + self.cfg.tx_manager_check_interval);
                    self.check_queued_batch(&cancel, pos).await;
                }
            }
        }
    }

    /// Handles a freshly proven batch arriving from a pipeline.
    async fn handle_batch(&mut self, cancel: &CancellationToken, mut batch_info: BatchInfo) {
        // With several provers a later batch can finish its proof first.
        // Batches must hit the chain in order, so requeue it for later.
        if batch_info.batch_num > self.last_success_batch + 1 && self.last_success_batch != 0 {
            debug!(
                batch_num = batch_info.batch_num,
                last_success = self.last_success_batch,
                "batch out of order, requeueing"
            );
            let tx = self.batch_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(OUT_OF_ORDER_REQUEUE_DELAY).await;
                let _ = tx.send(batch_info).await;
            });
            return;
        }
        if batch_info.pipeline_num < self.min_pipeline_num {
            warn!(
                pipeline_num = batch_info.pipeline_num,
                min_pipeline_num = self.min_pipeline_num,
                "batch from a discarded pipeline"
            );
        }
        if let Err(e) = self.should_send(&batch_info) {
            warn!(batch_num = batch_info.batch_num, error = %e, "should not send forge batch");
            let _ = self
                .coord_msg_tx
                .send(Msg::StopPipeline {
                    reason: format!("forge batch should send: {e:#}"),
                    failed_batch_num: 0,
                })
                .await;
            return;
        }
        let sent = Self::send_forge_batch(
            &self.cfg,
            &*self.eth_client,
            &self.pool,
            &self.stats,
            &mut self.acc_next_nonce,
            &mut self.last_sent_l1_batch_block,
            cancel,
            &mut batch_info,
            false,
        )
        .await;
        match sent {
            Ok(()) => self.queue.push(batch_info),
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(batch_num = batch_info.batch_num, error = %e, "forge batch send failed");
                let _ = self
                    .coord_msg_tx
                    .send(Msg::StopPipeline {
                        reason: format!("forge batch send: {e:#}"),
                        failed_batch_num: 0,
                    })
                    .await;
            }
        }
    }

    /// Periodic receipt check for one queued batch.
    async fn check_queued_batch(&mut self, cancel: &CancellationToken, pos: usize) {
        let receipt_res = Self::check_receipt(
            &*self.eth_client,
            &self.cfg,
            cancel,
            &mut self.queue.list[pos],
        )
        .await;
        if let Err(e) = receipt_res {
            if cancel.is_cancelled() {
                return;
            }
            // the node answered something other than "not found", so the
            // transaction state is unknowable right now
            let _ = self
                .coord_msg_tx
                .send(Msg::StopPipeline {
                    reason: format!("forge batch receipt: {e:#}"),
                    failed_batch_num: 0,
                })
                .await;
        }

        let confirm = Self::handle_receipt(
            &self.cfg,
            &self.stats,
            &mut self.acc_nonce,
            &mut self.last_success_batch,
            &mut self.queue.list[pos],
        );
        let confirm = match confirm {
            Ok(confirm) => confirm,
            Err(e) => {
                if let Err(e) = self.remove_bad_batch_infos(cancel).await {
                    if cancel.is_cancelled() {
                        return;
                    }
                    error!(error = %e, "removing bad batches");
                    return;
                }
                let _ = self
                    .coord_msg_tx
                    .send(Msg::StopPipeline {
                        reason: format!("forge batch rejected: {e:#}"),
                        failed_batch_num: 0,
                    })
                    .await;
                return;
            }
        };

        let resend_timeout = self.cfg.eth_tx_resend_timeout.as_millis() as u64;
        let send_ts = self.queue.list[pos].debug.send_timestamp_ms;
        if !self.cfg.eth_no_reuse_nonce
            && confirm.is_none()
            && now_ms().saturating_sub(send_ts) > resend_timeout
        {
            info!(
                batch_num = self.queue.list[pos].batch_num,
                "forge tx not mined within timeout, resending"
            );
            let resent = Self::send_forge_batch(
                &self.cfg,
                &*self.eth_client,
                &self.pool,
                &self.stats,
                &mut self.acc_next_nonce,
                &mut self.last_sent_l1_batch_block,
                cancel,
                &mut self.queue.list[pos],
                true,
            )
            .await;
            if let Err(e) = resent {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(error = %e, "forge batch resend failed");
                let _ = self
                    .coord_msg_tx
                    .send(Msg::StopPipeline {
                        reason: format!("forge batch resend: {e:#}"),
                        failed_batch_num: 0,
                    })
                    .await;
                return;
            }
        }

        if let Some(confirm) = confirm {
            if confirm >= self.cfg.confirm_blocks {
                let batch_info = self.queue.remove(pos);
                debug!(batch_num = batch_info.batch_num, confirm, "forge batch confirmed");
            }
        }
    }

    /// Signs and submits the forge call, classifying submission errors.
    /// Nonce and gas-price adjustments do not consume a retry attempt.
    #[allow(clippy::too_many_arguments)]
    async fn send_forge_batch(
        cfg: &Config,
        eth_client: &dyn EthClient,
        pool: &Mutex<dyn L2Pool>,
        stats: &SyncStats,
        acc_next_nonce: &mut u64,
        last_sent_l1_batch_block: &mut BlockNum,
        cancel: &CancellationToken,
        batch_info: &mut BatchInfo,
        resend: bool,
    ) -> Result<()> {
        let args = batch_info
            .forge_batch_args
            .clone()
            .ok_or_else(|| anyhow!("batch {} has no forge args", batch_info.batch_num))?;

        let (mut nonce, mut gas_price, gas_limit) = if resend {
            let auth = batch_info
                .auth
                .ok_or_else(|| anyhow!("batch {} was never sent", batch_info.batch_num))?;
            (auth.nonce, add_perc(auth.gas_price, RESEND_GAS_PERC), auth.gas_limit)
        } else {
            let suggested = eth_client
                .suggest_gas_price()
                .await
                .map_err(|e| anyhow!("suggesting gas price: {e}"))?;
            let mut gas_price = suggested.clamp(cfg.min_gas_price, cfg.max_gas_price);
            if cfg.gas_price_inc_perc != 0 {
                gas_price = add_perc(gas_price, cfg.gas_price_inc_perc);
            }
            let gas_limit = cfg.forge_batch_gas_cost.fixed
                + batch_info.l1_user_txs.len() as u64 * cfg.forge_batch_gas_cost.l1_user_tx
                + batch_info.l1_coord_txs.len() as u64 * cfg.forge_batch_gas_cost.l1_coord_tx
                + batch_info.l2_txs.len() as u64 * cfg.forge_batch_gas_cost.l2_tx;
            (*acc_next_nonce, gas_price, gas_limit)
        };

        let mut sent = None;
        let mut last_err = None;
        let mut attempt = 0;
        while attempt < cfg.eth_client_attempts {
            if gas_price > cfg.max_gas_price {
                bail!(
                    "calculated gas price {gas_price} above maximum {}",
                    cfg.max_gas_price
                );
            }
            let auth = TxAuth {
                nonce,
                gas_price,
                gas_limit,
            };
            match eth_client.rollup_forge_batch(&args, &auth).await {
                Ok(tx) => {
                    sent = Some((tx, auth));
                    break;
                }
                Err(EthClientError::NonceTooLow) => {
                    warn!(nonce, batch_num = batch_info.batch_num, "nonce too low, incrementing");
                    nonce += 1;
                }
                Err(EthClientError::NonceTooHigh) => {
                    warn!(nonce, batch_num = batch_info.batch_num, "nonce too high, decrementing");
                    nonce = nonce.saturating_sub(1);
                }
                Err(e @ (EthClientError::Underpriced | EthClientError::ReplaceUnderpriced)) => {
                    warn!(gas_price, batch_num = batch_info.batch_num, error = %e,
                        "transaction underpriced, bumping gas price");
                    gas_price = add_perc(gas_price, RESEND_GAS_PERC);
                }
                Err(e @ EthClientError::Revert(_)) => {
                    return Err(anyhow::Error::from(e)).context("forge call reverted");
                }
                Err(e) => {
                    error!(attempt, batch_num = batch_info.batch_num, error = %e,
                        "forge batch submission failed");
                    last_err = Some(e);
                    attempt += 1;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled while sending forge batch"),
                _ = tokio::time::sleep(cfg.eth_client_attempts_delay) => {}
            }
        }
        let Some((tx, auth)) = sent else {
            return Err(anyhow!(
                "reached max attempts for forge batch submission: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ));
        };

        if !resend {
            *acc_next_nonce = auth.nonce + 1;
        }
        info!(
            batch_num = batch_info.batch_num,
            tx_hash = %hex::encode(tx.hash),
            nonce = auth.nonce,
            resend,
            "forge batch submitted"
        );
        batch_info.auth = Some(auth);
        batch_info.eth_txs.push(tx);
        if resend {
            batch_info.debug.resend_num += 1;
        }
        batch_info.set_status(BatchStatus::Sent);
        batch_info.debug.send_timestamp_ms = now_ms();
        batch_info.debug.send_block_num = stats.eth.last_block + 1;
        batch_info.debug.start_to_send_delay_ms = batch_info
            .debug
            .send_timestamp_ms
            .saturating_sub(batch_info.debug.start_timestamp_ms);
        debug_batch_store(batch_info, cfg.debug_batch_path.as_deref());

        if !resend && batch_info.l1_batch {
            *last_sent_l1_batch_block = stats.eth.last_block + 1;
        }
        let tx_ids: Vec<_> = batch_info.l2_txs.iter().map(|tx| tx.tx_id).collect();
        pool.lock()
            .await
            .done_forging(&tx_ids, batch_info.batch_num)
            .context("marking pool txs forged")?;
        Ok(())
    }

    /// Fetches the receipt of the batch's most recent transaction, falling
    /// back to earlier sends of the same batch.
    async fn check_receipt(
        eth_client: &dyn EthClient,
        cfg: &Config,
        cancel: &CancellationToken,
        batch_info: &mut BatchInfo,
    ) -> Result<()> {
        let mut receipt = None;
        for tx in batch_info.eth_txs.iter().rev() {
            if receipt.is_some() {
                break;
            }
            let mut attempt = 0;
            loop {
                match eth_client.transaction_receipt(&tx.hash).await {
                    Ok(found) => {
                        receipt = found;
                        break;
                    }
                    Err(e) => {
                        error!(attempt, tx_hash = %hex::encode(tx.hash), error = %e,
                            "fetching transaction receipt");
                        attempt += 1;
                        if attempt >= cfg.eth_client_attempts {
                            bail!("reached max attempts fetching receipt: {e}");
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => bail!("cancelled while fetching receipt"),
                    _ = tokio::time::sleep(cfg.eth_client_attempts_delay) => {}
                }
            }
        }
        batch_info.receipt = receipt;
        debug_batch_store(batch_info, cfg.debug_batch_path.as_deref());
        Ok(())
    }

    /// Interprets a stored receipt. Returns the confirmation depth when the
    /// transaction mined successfully, `None` while it is still pending, and
    /// an error when it mined but failed.
    fn handle_receipt(
        cfg: &Config,
        stats: &SyncStats,
        acc_nonce: &mut u64,
        last_success_batch: &mut BatchNum,
        batch_info: &mut BatchInfo,
    ) -> Result<Option<i64>> {
        let Some(receipt) = batch_info.receipt else {
            return Ok(None);
        };
        if let Some(last_tx) = batch_info.eth_txs.last() {
            if last_tx.nonce + 1 > *acc_nonce {
                *acc_nonce = last_tx.nonce + 1;
            }
        }
        match receipt.status {
            ReceiptStatus::Failed => {
                batch_info.set_status(BatchStatus::Failed);
                batch_info
                    .eth_txs_errs
                    .push(format!("receipt failed at block {}", receipt.block_num));
                warn!(
                    batch_num = batch_info.batch_num,
                    block_num = receipt.block_num,
                    "forge transaction receipt is failed"
                );
                if batch_info.batch_num <= *last_success_batch {
                    *last_success_batch = batch_info.batch_num - 1;
                }
                debug_batch_store(batch_info, cfg.debug_batch_path.as_deref());
                Err(anyhow!(
                    "forge transaction failed for batch {}",
                    batch_info.batch_num
                ))
            }
            ReceiptStatus::Success => {
                batch_info.set_status(BatchStatus::Mined);
                batch_info.debug.mine_block_num = receipt.block_num;
                batch_info.debug.start_to_mine_delay_ms =
                    now_ms().saturating_sub(batch_info.debug.start_timestamp_ms);
                debug_batch_store(batch_info, cfg.debug_batch_path.as_deref());
                if batch_info.batch_num > *last_success_batch {
                    *last_success_batch = batch_info.batch_num;
                }
                Ok(Some(stats.eth.last_block - receipt.block_num))
            }
        }
    }

    /// Walks the whole queue after a reorg or a rejected batch, dropping
    /// pending batches of discarded pipelines, then refreshes the next nonce
    /// from the node.
    async fn remove_bad_batch_infos(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut next = 0;
        while next < self.queue.len() {
            let receipt_res = Self::check_receipt(
                &*self.eth_client,
                &self.cfg,
                cancel,
                &mut self.queue.list[next],
            )
            .await;
            if receipt_res.is_err() {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                next += 1;
                continue;
            }
            let confirm = Self::handle_receipt(
                &self.cfg,
                &self.stats,
                &mut self.acc_nonce,
                &mut self.last_success_batch,
                &mut self.queue.list[next],
            );
            match confirm {
                Err(_) => {
                    let pipeline_num = self.queue.list[next].pipeline_num;
                    if self.min_pipeline_num <= pipeline_num {
                        self.min_pipeline_num = pipeline_num + 1;
                    }
                    self.queue.remove(next);
                }
                Ok(None) if self.queue.list[next].pipeline_num < self.min_pipeline_num => {
                    self.queue.remove(next);
                }
                Ok(_) => next += 1,
            }
        }
        let acc_nonce = self
            .eth_client
            .nonce_at()
            .await
            .map_err(|e| anyhow!("reading account nonce: {e}"))?;
        if !self.cfg.eth_no_reuse_nonce {
            self.acc_next_nonce = acc_nonce;
        }
        Ok(())
    }

    fn should_send(&self, batch_info: &BatchInfo) -> Result<()> {
        let next_block = self.stats.eth.last_block + 1;
        if !self.can_forge_at(next_block) {
            bail!("can't forge at the next block {next_block}");
        }
        if self.must_l1_l2_batch(next_block) && !batch_info.l1_batch {
            bail!("can't forge a non-L1 batch at the next block {next_block}");
        }
        let margin = self.cfg.send_batch_blocks_margin_check;
        if margin != 0 {
            if !self.can_forge_at(next_block + margin) {
                bail!("can't forge {margin} blocks after {next_block}");
            }
            if self.must_l1_l2_batch(next_block + margin) && !batch_info.l1_batch {
                bail!("can't forge a non-L1 batch {margin} blocks after {next_block}");
            }
        }
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

    fn must_l1_l2_batch(&self, block_num: BlockNum) -> bool {
        let last_l1 = self
            .last_sent_l1_batch_block
            .max(self.stats.sync.last_l1_batch_block);
        block_num - last_l1 >= self.vars.forge_l1_l2_batch_timeout - 1
    }
}
