//! zkforge core
//!
//! Batch-forging coordinator for a zk-rollup: selects transactions, builds
//! batches over checkpointed state, collects proofs from external proof
//! servers and drives the forge transactions to confirmation on L1.

pub mod coordinator;
pub mod storage;
pub mod types;
