//! Batch forging pipeline.
//!
//! Two cooperating loops per pipeline run. The forge loop selects txs,
//! builds the batch over the checkpointed state and hands the inputs to a
//! checked-out prover. The proof loop waits for each proof, prepares the
//! on-chain call arguments and forwards the batch to the submission actor.
//! A sticky error flag freezes both loops on the failed batch number until
//! the coordinator restarts the pipeline from a known-good batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use num_bigint::BigUint;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Config;
use super::Msg;
use super::batch::{BatchInfo, BatchStatus, ForgeBatchArgs, debug_batch_store, now_ms};
use super::history::HistoryDb;
use super::l2pool::L2Pool;
use super::prover::ProverClient;
use super::provers_pool::ProversPool;
use super::purger::Purger;
use super::selection::{BatchBuilder, Selection, TxSelector};
use crate::types::{
    BatchNum, BlockNum, ScVariables, ScVariablesUpdate, SlotNum, SyncStats,
    idxs_nonce_from_pool_txs,
};

const STATS_VARS_QUEUE: usize = 16;
const PROOF_QUEUE: usize = 15;
const PROVER_CANCEL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(200);

/// Decides whether the next batch must include the L1 user tx queue.
///
/// `current_block` is the last block seen; the batch would be forged at
/// `current_block + 1`.
pub(crate) fn should_l1_l2_batch(
    last_scheduled_l1_batch_block: BlockNum,
    last_l1_batch_block: BlockNum,
    current_block: BlockNum,
    forge_l1_l2_batch_timeout: i64,
    l1_batch_timeout_perc: f64,
) -> bool {
    // Start counting from the last scheduled L1 batch if it is ahead of the
    // last one already on chain.
    let last_l1 = last_scheduled_l1_batch_block.max(last_l1_batch_block);
    let threshold = ((forge_l1_l2_batch_timeout - 1) as f64 * l1_batch_timeout_perc) as i64;
    current_block + 1 - last_l1 >= threshold
}

/// Turns a proof into the forge call arguments. The proof server returns the
/// G2 point coordinates in the reverse of the order the contract expects, so
/// each `pi_b` row is swapped.
pub(crate) fn prepare_forge_batch_args(batch_info: &BatchInfo) -> Result<ForgeBatchArgs> {
    let proof = batch_info
        .proof
        .as_ref()
        .ok_or_else(|| anyhow!("batch {} has no proof", batch_info.batch_num))?;
    let zk_inputs = batch_info
        .zk_inputs
        .as_ref()
        .ok_or_else(|| anyhow!("batch {} has no zk inputs", batch_info.batch_num))?;
    let coords = |v: &[BigUint]| -> Result<Vec<BigUint>> {
        if v.len() < 2 {
            bail!("proof element has fewer than 2 coordinates");
        }
        Ok(vec![v[0].clone(), v[1].clone()])
    };
    Ok(ForgeBatchArgs {
        batch_num: batch_info.batch_num,
        proof_a: coords(&proof.pi_a)?,
        proof_b: vec![
            vec![proof.pi_b[0][1].clone(), proof.pi_b[0][0].clone()],
            vec![proof.pi_b[1][1].clone(), proof.pi_b[1][0].clone()],
        ],
        proof_c: coords(&proof.pi_c)?,
        public_inputs: batch_info.public_inputs.clone(),
        new_state_root: zk_inputs.new_state_root,
        l1_user_txs: batch_info.l1_user_txs.clone(),
        l1_coord_txs: batch_info.l1_coord_txs.clone(),
        l2_txs: batch_info.l2_txs.clone(),
        verifier_idx: batch_info.verifier_idx,
        l1_batch: batch_info.l1_batch,
    })
}

enum ForgeAbort {
    Cancelled,
    SkippedByPolicy(String),
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for ForgeAbort {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(e)
    }
}

#[derive(Debug, Clone, Copy)]
struct PipelineState {
    batch_num: BatchNum,
    last_scheduled_l1_batch_block: BlockNum,
    last_forge_l1_txs_num: i64,
    last_slot_forged: SlotNum,
}

/// Shared handles every pipeline component needs.
#[derive(Clone)]
pub struct PipelineCtx {
    pub cfg: Arc<Config>,
    pub history: Arc<dyn HistoryDb>,
    pub pool: Arc<Mutex<dyn L2Pool>>,
    pub selector: Arc<Mutex<dyn TxSelector>>,
    pub builder: Arc<Mutex<dyn BatchBuilder>>,
    pub purger: Arc<Mutex<Purger>>,
    pub coord_msg_tx: mpsc::Sender<Msg>,
    /// Forwards proven batches to the submission actor.
    pub batch_tx: mpsc::Sender<BatchInfo>,
}

pub struct Pipeline {
    num: u64,
    ctx: PipelineCtx,
    provers: Vec<Arc<dyn ProverClient>>,
    provers_pool: Arc<ProversPool>,
    err_at_batch_num: Arc<AtomicU64>,
    stats_vars_tx: Option<mpsc::Sender<(SyncStats, ScVariablesUpdate)>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Pipeline {
    /// Probes each prover and builds the pipeline over the survivors.
    pub async fn new(
        num: u64,
        ctx: PipelineCtx,
        provers: Vec<Arc<dyn ProverClient>>,
    ) -> Result<Self> {
        let mut alive = Vec::new();
        for prover in provers {
            let probe =
                tokio::time::timeout(ctx.cfg.prover_read_timeout, prover.wait_ready()).await;
            match probe {
                Ok(Ok(())) => alive.push(prover),
                Ok(Err(e)) => {
                    warn!(url = prover.url(), error = %e, "prover not ready, excluding")
                }
                Err(_) => {
                    warn!(url = prover.url(), "prover readiness probe timed out, excluding")
                }
            }
        }
        if alive.is_empty() {
            bail!("no provers alive");
        }
        info!(pipeline_num = num, provers = alive.len(), "provers ready");
        let provers_pool = Arc::new(ProversPool::new(alive.len()));
        Ok(Self {
            num,
            ctx,
            provers: alive,
            provers_pool,
            err_at_batch_num: Arc::new(AtomicU64::new(0)),
            stats_vars_tx: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            started: false,
        })
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    /// Feeds fresh synchronizer stats into the running loops without
    /// blocking the caller's message handling.
    pub async fn set_sync_stats_vars(&self, stats: SyncStats, vars: ScVariablesUpdate) {
        if let Some(tx) = &self.stats_vars_tx {
            let _ = tx.send((stats, vars)).await;
        }
    }

    /// Resets the selection and builder state to `batch_num` and spawns the
    /// forge and proof loops.
    pub async fn start(
        &mut self,
        batch_num: BatchNum,
        stats: SyncStats,
        vars: ScVariables,
    ) -> Result<()> {
        if self.started {
            bail!("pipeline already started");
        }
        self.cancel = CancellationToken::new();
        self.err_at_batch_num.store(0, Ordering::SeqCst);

        let state = self.reset(batch_num, &stats).await?;
        for prover in &self.provers {
            self.provers_pool
                .add(&self.cancel, prover.clone())
                .await
                .map_err(|_| anyhow!("provers pool closed during start"))?;
        }

        let (stats_vars_tx, stats_vars_rx) = mpsc::channel(STATS_VARS_QUEUE);
        let (proof_tx, proof_rx) = mpsc::channel(PROOF_QUEUE);
        self.stats_vars_tx = Some(stats_vars_tx);

        let forge_loop = ForgeLoop {
            num: self.num,
            ctx: self.ctx.clone(),
            state,
            stats,
            vars,
            last_forge_time_ms: 0,
            provers_pool: self.provers_pool.clone(),
            err_at_batch_num: self.err_at_batch_num.clone(),
            stats_vars_rx,
            proof_tx,
            cancel: self.cancel.clone(),
        };
        self.tasks.push(tokio::spawn(forge_loop.run()));

        let proof_loop = ProofLoop {
            ctx: self.ctx.clone(),
            provers_pool: self.provers_pool.clone(),
            err_at_batch_num: self.err_at_batch_num.clone(),
            proof_rx,
            cancel: self.cancel.clone(),
        };
        self.tasks.push(tokio::spawn(proof_loop.run()));

        self.started = true;
        info!(pipeline_num = self.num, batch_num, "pipeline started");
        Ok(())
    }

    /// Stops both loops and aborts any in-flight proof computations.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.stats_vars_tx = None;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for prover in &self.provers {
            match tokio::time::timeout(PROVER_CANCEL_TIMEOUT, prover.cancel()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(url = prover.url(), error = %e, "prover cancel failed"),
                Err(_) => warn!(url = prover.url(), "prover cancel timed out"),
            }
        }
        info!(pipeline_num = self.num, "pipeline stopped");
    }

    async fn reset(&self, batch_num: BatchNum, stats: &SyncStats) -> Result<PipelineState> {
        let state = PipelineState {
            batch_num,
            last_scheduled_l1_batch_block: 0,
            last_forge_l1_txs_num: stats.sync.last_forge_l1_txs_num,
            last_slot_forged: -1,
        };

        {
            let mut selector = self.ctx.selector.lock().await;
            let from_synchronizer = !selector.checkpoint_exists(batch_num) && batch_num != 0;
            selector
                .reset(batch_num, from_synchronizer)
                .context("resetting tx selector")?;
        }
        {
            let mut builder = self.ctx.builder.lock().await;
            let from_synchronizer = !builder.checkpoint_exists(batch_num) && batch_num != 0;
            builder
                .reset(batch_num, from_synchronizer)
                .context("resetting batch builder")?;
        }

        // If what we rolled back to disagrees with what is on chain, the
        // local state is unusable and must be rebuilt from the synchronizer.
        if let Some(batch) = self.ctx.history.get_batch(batch_num)? {
            let local_root = self.ctx.builder.lock().await.local_state_root()?;
            if local_root != batch.state_root {
                warn!(
                    batch_num,
                    local_root = %hex::encode(local_root),
                    chain_root = %hex::encode(batch.state_root),
                    "local state root diverged, resyncing"
                );
                self.ctx
                    .selector
                    .lock()
                    .await
                    .reset(batch_num, true)
                    .context("resyncing tx selector")?;
                self.ctx
                    .builder
                    .lock()
                    .await
                    .reset(batch_num, true)
                    .context("resyncing batch builder")?;
            }
        }
        Ok(state)
    }
}

struct ForgeLoop {
    num: u64,
    ctx: PipelineCtx,
    state: PipelineState,
    stats: SyncStats,
    vars: ScVariables,
    last_forge_time_ms: u64,
    provers_pool: Arc<ProversPool>,
    err_at_batch_num: Arc<AtomicU64>,
    stats_vars_rx: mpsc::Receiver<(SyncStats, ScVariablesUpdate)>,
    proof_tx: mpsc::Sender<BatchInfo>,
    cancel: CancellationToken,
}

impl ForgeLoop {
    async fn run(mut self) {
        let timer = tokio::time::sleep(std::time::Duration::ZERO);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                Some((stats, vars)) = self.stats_vars_rx.recv() => {
                    self.stats = stats;
                    self.vars.apply(&vars);
                }
                _ = timer.as_mut() => {
                    timer.as_mut().reset(tokio::time::Instant::now() + self.ctx.cfg.forge_retry_interval);
                    if self.err_at_batch_num.load(Ordering::SeqCst) != 0 {
                        continue;
                    }
                    let batch_num = self.state.batch_num + 1;
                    match self.handle_forge_batch(batch_num).await {
                        Ok(batch_info) => {
                            self.last_forge_time_ms = now_ms();
                            self.state.batch_num = batch_num;
                            if self.proof_tx.send(batch_info).await.is_err() {
                                return;
                            }
                            timer.as_mut().reset(tokio::time::Instant::now());
                        }
                        Err(ForgeAbort::Cancelled) => {
                            self.revert_pool_changes(batch_num).await;
                        }
                        Err(ForgeAbort::SkippedByPolicy(reason)) => {
                            debug!(batch_num, reason, "skipping batch by policy");
                            self.revert_pool_changes(batch_num).await;
                        }
                        Err(ForgeAbort::Failed(e)) => {
                            error!(batch_num, error = %e, "forge batch failed");
                            self.err_at_batch_num.store(batch_num, Ordering::SeqCst);
                            let _ = self.ctx.coord_msg_tx.send(Msg::StopPipeline {
                                reason: format!("forge batch {batch_num}: {e:#}"),
                                failed_batch_num: batch_num,
                            }).await;
                            self.revert_pool_changes(batch_num).await;
                        }
                    }
                }
            }
        }
    }

    /// Returns the failed batch's pool txs to pending.
    async fn revert_pool_changes(&self, failed_batch: BatchNum) {
        revert_pool_changes(&self.ctx.pool, failed_batch).await;
    }

    async fn handle_forge_batch(&mut self, batch_num: BatchNum) -> Result<BatchInfo, ForgeAbort> {
        let prover = self
            .provers_pool
            .get(&self.cancel)
            .await
            .map_err(|_| ForgeAbort::Cancelled)?;

        let mut batch_info = match self.forge_batch(batch_num).await {
            Ok(batch_info) => batch_info,
            Err(abort) => {
                let _ = self.provers_pool.add(&self.cancel, prover).await;
                return Err(abort);
            }
        };
        batch_info.server_proof = Some(prover.clone());

        if let Err(e) = self.send_server_proof(&batch_info).await {
            batch_info.server_proof = None;
            let _ = self.provers_pool.add(&self.cancel, prover).await;
            return Err(ForgeAbort::Failed(e));
        }
        Ok(batch_info)
    }

    /// Selects txs for the batch, applies them to the local state and
    /// produces the proof inputs. Holds the pool lock throughout so nothing
    /// deletes pool txs mid-selection.
    async fn forge_batch(&mut self, batch_num: BatchNum) -> Result<BatchInfo, ForgeAbort> {
        let stats = self.stats;
        let mut pool = self.ctx.pool.lock().await;
        let mut selector = self.ctx.selector.lock().await;

        {
            let mut purger = self.ctx.purger.lock().await;
            purger
                .invalidate_maybe(&mut *pool, &*selector, stats.sync.last_block, batch_num)
                .context("invalidate maybe")?;
            purger
                .purge_maybe(&mut *pool, stats.sync.last_block, batch_num)
                .context("purge maybe")?;
        }

        let mut batch_info = BatchInfo::new(self.num, batch_num);
        batch_info.debug.start_timestamp_ms = now_ms();
        batch_info.debug.start_block_num = stats.eth.last_block + 1;

        if let Some(reason) = self.policy_skip_pre_selection(&stats) {
            return Err(ForgeAbort::SkippedByPolicy(reason));
        }

        let l1_batch = should_l1_l2_batch(
            self.state.last_scheduled_l1_batch_block,
            stats.sync.last_l1_batch_block,
            stats.eth.last_block,
            self.vars.forge_l1_l2_batch_timeout,
            self.ctx.cfg.l1_batch_timeout_perc,
        );
        batch_info.l1_batch = l1_batch;
        batch_info.debug.last_scheduled_l1_batch_block_num = self.state.last_scheduled_l1_batch_block;
        batch_info.debug.l1_batch_block_distance = stats.eth.last_block + 1
            - self
                .state
                .last_scheduled_l1_batch_block
                .max(stats.sync.last_l1_batch_block);

        let pool_txs = pool.pending_txs().context("reading pending pool txs")?;
        let selection = if l1_batch {
            let next = self.state.last_forge_l1_txs_num + 1;
            let l1_user_txs = self
                .ctx
                .history
                .unforged_l1_user_txs(next)
                .context("reading unforged l1 user txs")?;
            let l1_future = self
                .ctx
                .history
                .unforged_l1_user_future_txs(next)
                .context("reading future l1 user txs")?;
            selector.l1_l2_selection(&self.ctx.cfg.tx_processor, &l1_user_txs, &l1_future, &pool_txs)?
        } else {
            let l1_future = self
                .ctx
                .history
                .unforged_l1_user_future_txs(self.state.last_forge_l1_txs_num)
                .context("reading future l1 user txs")?;
            selector.l2_selection(&self.ctx.cfg.tx_processor, &l1_future, &pool_txs)?
        };

        if let Some(reason) = self.policy_skip_post_selection(&stats, l1_batch, &selection)? {
            // undo the checkpoint the selection made
            selector
                .reset(batch_num - 1, false)
                .context("rolling selection back after policy skip")?;
            return Err(ForgeAbort::SkippedByPolicy(reason));
        }

        if l1_batch {
            self.state.last_scheduled_l1_batch_block = stats.eth.last_block + 1;
            self.state.last_forge_l1_txs_num += 1;
        }

        batch_info.coord_idxs = selection.coord_idxs.clone();
        batch_info.l1_user_txs = selection.l1_user_txs.clone();
        batch_info.l1_coord_txs = selection.l1_coord_txs.clone();
        batch_info.l2_txs = selection.pool_txs.clone();
        batch_info.verifier_idx = self.ctx.cfg.verifier_idx;

        let tx_ids: Vec<_> = selection.pool_txs.iter().map(|tx| tx.tx_id).collect();
        pool.start_forging(&tx_ids, batch_num)
            .context("marking pool txs forging")?;
        for (tx_id, reason) in &selection.discarded {
            pool.update_txs_info(std::slice::from_ref(tx_id), batch_num, reason)
                .context("recording discarded txs")?;
        }
        let idx_nonces = idxs_nonce_from_pool_txs(&selection.pool_txs);
        pool.invalidate_old_nonces(&idx_nonces, batch_num)
            .context("invalidating outdated nonces")?;

        let mut builder = self.ctx.builder.lock().await;
        let zk_inputs = builder
            .build_batch(
                &selection.coord_idxs,
                &self.ctx.cfg.tx_processor,
                &selection.l1_user_txs,
                &selection.l1_coord_txs,
                &selection.pool_txs,
            )
            .context("building batch")?;
        batch_info.zk_inputs = Some(zk_inputs);
        batch_info.set_status(BatchStatus::Forged);
        debug_batch_store(&batch_info, self.ctx.cfg.debug_batch_path.as_deref());
        info!(
            pipeline_num = self.num,
            batch_num,
            l1_batch,
            l1_user_txs = batch_info.l1_user_txs.len(),
            l2_txs = batch_info.l2_txs.len(),
            "batch forged"
        );
        self.state.last_slot_forged = stats.sync.current_slot.slot_num;
        Ok(batch_info)
    }

    async fn send_server_proof(&self, batch_info: &BatchInfo) -> Result<()> {
        let prover = batch_info
            .server_proof
            .as_ref()
            .ok_or_else(|| anyhow!("batch {} has no prover", batch_info.batch_num))?;
        let zk_inputs = batch_info
            .zk_inputs
            .as_ref()
            .ok_or_else(|| anyhow!("batch {} has no zk inputs", batch_info.batch_num))?;
        prover
            .calculate_proof(zk_inputs)
            .await
            .context("sending inputs to prover")
    }

    fn slot_committed(&self, stats: &SyncStats) -> bool {
        stats.sync.current_slot.forger_commitment
            || stats.sync.current_slot.slot_num == self.state.last_slot_forged
    }

    fn policy_skip_pre_selection(&self, stats: &SyncStats) -> Option<String> {
        let slot_committed = self.slot_committed(stats);
        if self.ctx.cfg.forge_once_per_slot_if_txs {
            if slot_committed {
                return Some("slot already committed".into());
            }
            return None;
        }
        if !self.ctx.cfg.ignore_slot_commitment && !slot_committed {
            return None;
        }
        let since_forge = now_ms().saturating_sub(self.last_forge_time_ms);
        if since_forge < self.ctx.cfg.forge_delay.as_millis() as u64 {
            return Some("forge delay not reached".into());
        }
        None
    }

    fn policy_skip_post_selection(
        &self,
        stats: &SyncStats,
        l1_batch: bool,
        selection: &Selection,
    ) -> Result<Option<String>> {
        let mut pending_txs = true;
        if selection.is_empty() {
            if l1_batch {
                // an empty L1 batch still advances the queue, so queued
                // future L1 txs count as pending work
                pending_txs = self.ctx.history.unforged_l1_user_txs_count()? != 0;
            } else {
                pending_txs = false;
            }
        }

        let slot_committed = self.slot_committed(stats);
        if self.ctx.cfg.forge_once_per_slot_if_txs {
            if slot_committed {
                return Ok(Some("slot already committed".into()));
            }
            if pending_txs {
                return Ok(None);
            }
            return Ok(Some("no pending txs".into()));
        }
        if !self.ctx.cfg.ignore_slot_commitment && !slot_committed {
            return Ok(None);
        }
        let since_forge = now_ms().saturating_sub(self.last_forge_time_ms);
        if since_forge < self.ctx.cfg.forge_no_txs_delay.as_millis() as u64 && !pending_txs {
            return Ok(Some("no txs and the no-txs forge delay not reached".into()));
        }
        Ok(None)
    }
}

struct ProofLoop {
    ctx: PipelineCtx,
    provers_pool: Arc<ProversPool>,
    err_at_batch_num: Arc<AtomicU64>,
    proof_rx: mpsc::Receiver<BatchInfo>,
    cancel: CancellationToken,
}

impl ProofLoop {
    async fn run(mut self) {
        let mut waiters = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch_info = self.proof_rx.recv() => {
                    let Some(batch_info) = batch_info else { break };
                    let ctx = self.ctx.clone();
                    let provers_pool = self.provers_pool.clone();
                    let err_at = self.err_at_batch_num.clone();
                    let cancel = self.cancel.clone();
                    waiters.spawn(wait_proof(ctx, provers_pool, err_at, cancel, batch_info));
                }
            }
        }
        while waiters.join_next().await.is_some() {}
    }
}

/// Waits for one batch's proof and forwards the batch to the submission
/// actor, returning the prover to the pool.
async fn wait_proof(
    ctx: PipelineCtx,
    provers_pool: Arc<ProversPool>,
    err_at_batch_num: Arc<AtomicU64>,
    cancel: CancellationToken,
    mut batch_info: BatchInfo,
) {
    // A newer batch already failed below this one; this batch will never
    // make it on chain.
    if err_at_batch_num.load(Ordering::SeqCst) != 0 {
        revert_pool_changes(&ctx.pool, batch_info.batch_num).await;
        return;
    }

    let prover = match batch_info.server_proof.clone() {
        Some(prover) => prover,
        None => {
            error!(batch_num = batch_info.batch_num, "batch has no prover handle");
            return;
        }
    };

    let proof = tokio::select! {
        _ = cancel.cancelled() => {
            revert_pool_changes(&ctx.pool, batch_info.batch_num).await;
            return;
        }
        res = prover.get_proof() => res,
    };

    match proof.and_then(|(proof, public_inputs)| {
        batch_info.proof = Some(proof);
        batch_info.public_inputs = public_inputs;
        let args = prepare_forge_batch_args(&batch_info)?;
        batch_info.forge_batch_args = Some(args);
        Ok(())
    }) {
        Ok(()) => {}
        Err(e) => {
            error!(batch_num = batch_info.batch_num, error = %e, "waiting for proof failed");
            err_at_batch_num.store(batch_info.batch_num, Ordering::SeqCst);
            let _ = ctx
                .coord_msg_tx
                .send(Msg::StopPipeline {
                    reason: format!("proof for batch {}: {e:#}", batch_info.batch_num),
                    failed_batch_num: batch_info.batch_num,
                })
                .await;
            revert_pool_changes(&ctx.pool, batch_info.batch_num).await;
            return;
        }
    }

    batch_info.set_status(BatchStatus::Proof);
    debug_batch_store(&batch_info, ctx.cfg.debug_batch_path.as_deref());
    debug!(batch_num = batch_info.batch_num, "proof received");

    batch_info.server_proof = None;
    let _ = provers_pool.add(&cancel, prover).await;
    let _ = ctx.batch_tx.send(batch_info).await;
}

/// Returns the failed batch's pool txs to pending.
async fn revert_pool_changes(pool: &Mutex<dyn L2Pool>, failed_batch: BatchNum) {
    let mut pool = pool.lock().await;
    if let Err(e) = pool.reorg(failed_batch - 1) {
        warn!(batch_num = failed_batch, error = %e, "failed to revert pool changes");
    }
}
