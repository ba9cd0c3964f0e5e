pub mod checkpoint;

pub use checkpoint::{CheckpointConfig, CheckpointError, CheckpointStore};
