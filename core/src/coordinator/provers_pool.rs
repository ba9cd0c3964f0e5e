//! Pool of proof server handles.
//!
//! A bounded channel hands out exclusive access to each prover: `get` checks
//! a handle out for one batch, the proof waiter returns it with `add` once
//! the proof has been collected. Both sides give up when the pipeline is
//! cancelled.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::prover::ProverClient;

/// Returned when the pipeline shut down while waiting on the pool.
#[derive(Debug, thiserror::Error)]
#[error("provers pool is done")]
pub struct PoolDone;

pub struct ProversPool {
    tx: mpsc::Sender<Arc<dyn ProverClient>>,
    rx: Mutex<mpsc::Receiver<Arc<dyn ProverClient>>>,
}

impl ProversPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Returns a prover handle to the pool.
    pub async fn add(
        &self,
        cancel: &CancellationToken,
        prover: Arc<dyn ProverClient>,
    ) -> Result<(), PoolDone> {
        debug!(url = prover.url(), "returning prover to pool");
        tokio::select! {
            res = self.tx.send(prover) => res.map_err(|_| PoolDone),
            _ = cancel.cancelled() => Err(PoolDone),
        }
    }

    /// Checks a prover handle out, blocking until one is free.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<Arc<dyn ProverClient>, PoolDone> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            prover = rx.recv() => {
                let prover = prover.ok_or(PoolDone)?;
                debug!(url = prover.url(), "got prover from pool");
                Ok(prover)
            }
            _ = cancel.cancelled() => Err(PoolDone),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::prover::MockProverClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkout_is_exclusive() {
        let pool = ProversPool::new(2);
        let cancel = CancellationToken::new();
        pool.add(&cancel, Arc::new(MockProverClient::new("mock://0", Duration::ZERO)))
            .await
            .unwrap();

        let first = pool.get(&cancel).await.unwrap();
        // no second handle available until the first is returned
        let empty = tokio::time::timeout(Duration::from_millis(50), pool.get(&cancel)).await;
        assert!(empty.is_err());

        pool.add(&cancel, first).await.unwrap();
        let again = pool.get(&cancel).await.unwrap();
        assert_eq!(again.url(), "mock://0");
    }

    #[tokio::test]
    async fn test_racing_checkouts_share_one_prover() {
        let pool = Arc::new(ProversPool::new(1));
        let cancel = CancellationToken::new();
        pool.add(&cancel, Arc::new(MockProverClient::new("mock://0", Duration::ZERO)))
            .await
            .unwrap();

        // two tasks fight over the single handle; each must hold it alone
        // before handing it back
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let prover = pool.get(&cancel).await.unwrap();
                    // the only handle exists once, so nobody else can get it
                    assert_eq!(Arc::strong_count(&prover), 1);
                    tokio::task::yield_now().await;
                    pool.add(&cancel, prover).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let last = pool.get(&cancel).await.unwrap();
        assert_eq!(last.url(), "mock://0");
    }

    #[tokio::test]
    async fn test_get_unblocks_on_cancel() {
        let pool = ProversPool::new(1);
        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.get(&cancel).await.map(|p| p.url().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let res = waiter.await.unwrap();
        assert!(res.is_err());
    }
}
