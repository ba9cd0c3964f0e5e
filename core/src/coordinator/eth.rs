//! Chain client seam.
//!
//! The coordinator only needs four calls against L1: submit a forge batch
//! transaction, fetch a receipt, suggest a gas price and read the account
//! nonce. Errors are typed so the submission loop can classify which ones
//! adjust the nonce or gas price instead of consuming a retry attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::batch::ForgeBatchArgs;
use crate::types::{BatchNum, BlockNum};

#[derive(Debug, thiserror::Error)]
pub enum EthClientError {
    #[error("nonce too low")]
    NonceTooLow,
    #[error("nonce too high")]
    NonceTooHigh,
    #[error("transaction underpriced")]
    Underpriced,
    #[error("replacement transaction underpriced")]
    ReplaceUnderpriced,
    /// Contract revert. Not retryable.
    #[error("execution reverted: {0}")]
    Revert(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

pub type TxHash = [u8; 32];

/// Signing parameters chosen before submission.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TxAuth {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
}

/// A submitted forge transaction.
#[derive(Debug, Clone, Serialize)]
pub struct EthTx {
    #[serde(with = "hex::serde")]
    pub hash: TxHash,
    pub nonce: u64,
    pub gas_price: u64,
    pub batch_num: BatchNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub block_num: BlockNum,
}

#[async_trait]
pub trait EthClient: Send + Sync {
    async fn rollup_forge_batch(
        &self,
        args: &ForgeBatchArgs,
        auth: &TxAuth,
    ) -> Result<EthTx, EthClientError>;
    async fn transaction_receipt(&self, hash: &TxHash)
    -> Result<Option<Receipt>, EthClientError>;
    async fn suggest_gas_price(&self) -> Result<u64, EthClientError>;
    async fn nonce_at(&self) -> Result<u64, EthClientError>;
}

#[derive(Default)]
struct MockEthState {
    nonce: u64,
    suggested_gas_price: u64,
    last_block: BlockNum,
    auto_mine: bool,
    /// Errors returned by the next `rollup_forge_batch` calls, in order.
    send_errors: VecDeque<EthClientError>,
    sent: Vec<(EthTx, ForgeBatchArgs)>,
    receipts: HashMap<TxHash, Receipt>,
}

/// Scriptable in-memory chain client for tests.
pub struct MockEthClient {
    state: Mutex<MockEthState>,
}

impl Default for MockEthClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEthClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockEthState {
                suggested_gas_price: 2_000_000_000,
                auto_mine: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockEthState> {
        // Mutex poisoning only happens if a test panicked while holding it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an error for an upcoming `rollup_forge_batch` call.
    pub fn push_send_error(&self, err: EthClientError) {
        self.lock().send_errors.push_back(err);
    }

    /// When off, sent transactions stay pending until `mine_all`.
    pub fn set_auto_mine(&self, on: bool) {
        self.lock().auto_mine = on;
    }

    pub fn set_last_block(&self, block_num: BlockNum) {
        self.lock().last_block = block_num;
    }

    pub fn set_suggested_gas_price(&self, wei: u64) {
        self.lock().suggested_gas_price = wei;
    }

    /// Mines all pending transactions at the next block.
    pub fn mine_all(&self) {
        let mut state = self.lock();
        state.last_block += 1;
        let block_num = state.last_block;
        let pending: Vec<TxHash> = state
            .sent
            .iter()
            .map(|(tx, _)| tx.hash)
            .filter(|h| !state.receipts.contains_key(h))
            .collect();
        for hash in pending {
            state.receipts.insert(
                hash,
                Receipt {
                    status: ReceiptStatus::Success,
                    block_num,
                },
            );
        }
    }

    /// Overrides the receipt for a hash (e.g. to script a failed tx).
    pub fn set_receipt(&self, hash: TxHash, receipt: Receipt) {
        self.lock().receipts.insert(hash, receipt);
    }

    pub fn sent_batches(&self) -> Vec<BatchNum> {
        self.lock().sent.iter().map(|(tx, _)| tx.batch_num).collect()
    }

    pub fn sent_txs(&self) -> Vec<EthTx> {
        self.lock().sent.iter().map(|(tx, _)| tx.clone()).collect()
    }
}

fn mock_tx_hash(nonce: u64, batch_num: BatchNum, gas_price: u64) -> TxHash {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(batch_num.to_be_bytes());
    hasher.update(gas_price.to_be_bytes());
    hasher.finalize().into()
}

#[async_trait]
impl EthClient for MockEthClient {
    async fn rollup_forge_batch(
        &self,
        args: &ForgeBatchArgs,
        auth: &TxAuth,
    ) -> Result<EthTx, EthClientError> {
        let mut state = self.lock();
        if let Some(err) = state.send_errors.pop_front() {
            return Err(err);
        }
        match auth.nonce.cmp(&state.nonce) {
            std::cmp::Ordering::Less => return Err(EthClientError::NonceTooLow),
            std::cmp::Ordering::Greater => return Err(EthClientError::NonceTooHigh),
            std::cmp::Ordering::Equal => {}
        }
        state.nonce += 1;
        let tx = EthTx {
            hash: mock_tx_hash(auth.nonce, args.batch_num, auth.gas_price),
            nonce: auth.nonce,
            gas_price: auth.gas_price,
            batch_num: args.batch_num,
        };
        state.sent.push((tx.clone(), args.clone()));
        if state.auto_mine {
            state.last_block += 1;
            let receipt = Receipt {
                status: ReceiptStatus::Success,
                block_num: state.last_block,
            };
            state.receipts.insert(tx.hash, receipt);
        }
        Ok(tx)
    }

    async fn transaction_receipt(
        &self,
        hash: &TxHash,
    ) -> Result<Option<Receipt>, EthClientError> {
        Ok(self.lock().receipts.get(hash).copied())
    }

    async fn suggest_gas_price(&self) -> Result<u64, EthClientError> {
        Ok(self.lock().suggested_gas_price)
    }

    async fn nonce_at(&self) -> Result<u64, EthClientError> {
        Ok(self.lock().nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(batch_num: BatchNum) -> ForgeBatchArgs {
        ForgeBatchArgs {
            batch_num,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_nonce_tracking() {
        let client = MockEthClient::new();
        let auth = TxAuth {
            nonce: 0,
            gas_price: 1,
            gas_limit: 1,
        };
        client.rollup_forge_batch(&args(1), &auth).await.unwrap();
        // same nonce again is too low now
        let err = client.rollup_forge_batch(&args(2), &auth).await.unwrap_err();
        assert!(matches!(err, EthClientError::NonceTooLow));
        let err = client
            .rollup_forge_batch(&args(2), &TxAuth { nonce: 5, ..auth })
            .await
            .unwrap_err();
        assert!(matches!(err, EthClientError::NonceTooHigh));
    }

    #[tokio::test]
    async fn test_mock_receipts() {
        let client = MockEthClient::new();
        client.set_auto_mine(false);
        let auth = TxAuth {
            nonce: 0,
            gas_price: 1,
            gas_limit: 1,
        };
        let tx = client.rollup_forge_batch(&args(1), &auth).await.unwrap();
        assert!(client.transaction_receipt(&tx.hash).await.unwrap().is_none());
        client.mine_all();
        let receipt = client.transaction_receipt(&tx.hash).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
    }
}
