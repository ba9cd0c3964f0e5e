//! Per-batch bookkeeping.
//!
//! A `BatchInfo` accumulates everything known about one batch as it moves
//! through the pipeline: selection results, zk-inputs, the proof, the forge
//! call arguments and the L1 transactions that carried it. When a debug path
//! is configured every status change is written out as JSON.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use num_bigint::BigUint;
use serde::Serialize;
use tracing::warn;

use super::eth::{EthTx, Receipt, TxAuth};
use super::prover::{Proof, ProverClient, PublicInputs, decimal_matrix, decimals};
use crate::types::{BatchNum, BlockNum, Idx, L1Tx, PoolL2Tx, StateRoot, ZkInputs};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Forged,
    Proof,
    Sent,
    Mined,
    Failed,
}

/// Timing and block-height breadcrumbs kept for debugging.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchDebug {
    pub start_timestamp_ms: u64,
    pub send_timestamp_ms: u64,
    pub status_timestamp_ms: u64,
    /// First block at which this batch could have been forged.
    pub start_block_num: BlockNum,
    pub send_block_num: BlockNum,
    pub mine_block_num: BlockNum,
    pub resend_num: u32,
    pub last_scheduled_l1_batch_block_num: BlockNum,
    pub l1_batch_block_distance: i64,
    pub start_to_send_delay_ms: u64,
    pub start_to_mine_delay_ms: u64,
}

/// Arguments of the on-chain forge call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForgeBatchArgs {
    pub batch_num: BatchNum,
    #[serde(with = "decimals")]
    pub proof_a: Vec<BigUint>,
    #[serde(with = "decimal_matrix")]
    pub proof_b: Vec<Vec<BigUint>>,
    #[serde(with = "decimals")]
    pub proof_c: Vec<BigUint>,
    #[serde(with = "decimals")]
    pub public_inputs: Vec<BigUint>,
    #[serde(with = "hex::serde")]
    pub new_state_root: StateRoot,
    pub l1_user_txs: Vec<L1Tx>,
    pub l1_coord_txs: Vec<L1Tx>,
    pub l2_txs: Vec<PoolL2Tx>,
    pub verifier_idx: usize,
    pub l1_batch: bool,
}

#[derive(Serialize)]
pub struct BatchInfo {
    pub pipeline_num: u64,
    pub batch_num: BatchNum,
    pub status: BatchStatus,
    #[serde(skip)]
    pub server_proof: Option<Arc<dyn ProverClient>>,
    pub zk_inputs: Option<ZkInputs>,
    pub proof: Option<Proof>,
    #[serde(with = "decimals")]
    pub public_inputs: PublicInputs,
    pub l1_batch: bool,
    pub verifier_idx: usize,
    pub l1_user_txs: Vec<L1Tx>,
    pub l1_coord_txs: Vec<L1Tx>,
    pub l2_txs: Vec<PoolL2Tx>,
    pub coord_idxs: Vec<Idx>,
    pub forge_batch_args: Option<ForgeBatchArgs>,
    /// Signing parameters of the last send, reused (with a gas bump) on
    /// resends.
    pub auth: Option<TxAuth>,
    pub eth_txs: Vec<EthTx>,
    pub eth_txs_errs: Vec<String>,
    pub receipt: Option<Receipt>,
    pub debug: BatchDebug,
}

impl BatchInfo {
    pub fn new(pipeline_num: u64, batch_num: BatchNum) -> Self {
        Self {
            pipeline_num,
            batch_num,
            status: BatchStatus::Pending,
            server_proof: None,
            zk_inputs: None,
            proof: None,
            public_inputs: Vec::new(),
            l1_batch: false,
            verifier_idx: 0,
            l1_user_txs: Vec::new(),
            l1_coord_txs: Vec::new(),
            l2_txs: Vec::new(),
            coord_idxs: Vec::new(),
            forge_batch_args: None,
            auth: None,
            eth_txs: Vec::new(),
            eth_txs_errs: Vec::new(),
            receipt: None,
            debug: BatchDebug::default(),
        }
    }

    pub fn set_status(&mut self, status: BatchStatus) {
        self.status = status;
        self.debug.status_timestamp_ms = now_ms();
    }

    /// Writes the current snapshot as pretty JSON under `dir`.
    pub fn debug_store(&self, dir: &Path) -> Result<()> {
        let now = now_ms();
        let name = format!("{:08}-{}.{:03}.json", self.batch_num, now / 1000, now % 1000);
        let json = serde_json::to_vec_pretty(self).context("serializing batch info")?;
        fs::create_dir_all(dir)
            .and_then(|_| fs::write(dir.join(&name), json))
            .with_context(|| format!("storing batch debug file {name}"))
    }
}

/// Stores the batch snapshot if a debug path is configured, logging instead
/// of failing the pipeline when the write does not succeed.
pub fn debug_batch_store(batch_info: &BatchInfo, dir: Option<&Path>) {
    if let Some(dir) = dir {
        if let Err(e) = batch_info.debug_store(dir) {
            warn!(batch_num = batch_info.batch_num, error = %e, "failed to store batch debug info");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_debug_store_writes_json() {
        let dir = TempDir::new().unwrap();
        let mut info = BatchInfo::new(1, 42);
        info.set_status(BatchStatus::Forged);
        info.debug_store(dir.path()).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        let name = name.to_str().unwrap();
        assert!(name.starts_with("00000042-"));
        assert!(name.ends_with(".json"));

        let content = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["batch_num"], 42);
        assert_eq!(parsed["status"], "forged");
    }

    #[test]
    fn test_status_change_stamps_time() {
        let mut info = BatchInfo::new(1, 1);
        assert_eq!(info.debug.status_timestamp_ms, 0);
        info.set_status(BatchStatus::Proof);
        assert!(info.debug.status_timestamp_ms > 0);
    }
}
