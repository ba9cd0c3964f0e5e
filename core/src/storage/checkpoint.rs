//! Checkpointed key-value store.
//!
//! A `CheckpointStore` keeps a mutable RocksDB under `<path>/current/` and a
//! sequence of immutable snapshots under `<path>/BatchNum<N>/`, one per forged
//! batch. `current/` is always re-derivable from a checkpoint, which is what
//! makes batch-level rollback and resync-from-peer cheap: close the db, drop
//! `current/`, copy the wanted checkpoint back and reopen.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rocksdb::checkpoint::Checkpoint;
use rocksdb::{DB, Options};
use tracing::{debug, info};

use crate::types::BatchNum;

const CURRENT_DIR: &str = "current";
const CHECKPOINT_PREFIX: &str = "BatchNum";

/// Bookkeeping key holding the batch number of `current/`.
const KEY_CURRENT_BATCH: &[u8] = b"k:currentbatch";
/// Bookkeeping key holding the last assigned account index.
const KEY_CURRENT_IDX: &[u8] = b"k:idx";

/// First account indexes are reserved; user accounts start above this.
pub const RESERVED_IDX: u64 = 255;

/// Default number of checkpoints kept on disk.
pub const DEFAULT_KEEP: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The checkpoint sequence on disk is not contiguous. Continuing would
    /// silently lose history, so callers treat this as fatal.
    #[error("checkpoint gap at batch {batch_num}")]
    Gap { batch_num: BatchNum },
    #[error("no checkpoint for batch {0}")]
    MissingCheckpoint(BatchNum),
    #[error("store is closed")]
    Closed,
    #[error(transparent)]
    Db(#[from] rocksdb::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Root directory holding `current/` and the checkpoint directories.
    pub path: PathBuf,
    /// Number of checkpoints kept on disk. 0 keeps everything.
    pub keep: usize,
    /// Skip the contiguity check when listing checkpoints.
    pub no_gaps_check: bool,
}

impl CheckpointConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keep: DEFAULT_KEEP,
            no_gaps_check: false,
        }
    }
}

/// RocksDB-backed store with per-batch checkpoints.
pub struct CheckpointStore {
    cfg: CheckpointConfig,
    db: Option<DB>,
    current_batch: BatchNum,
    current_idx: u64,
}

impl CheckpointStore {
    /// Opens the store at `cfg.path`, creating it if missing.
    ///
    /// The `current/` view is always rebuilt from the last checkpoint, so a
    /// crash that left `current/` half-written heals on reopen.
    pub fn open(cfg: CheckpointConfig) -> Result<Self> {
        fs::create_dir_all(&cfg.path)?;
        let mut store = Self {
            cfg,
            db: None,
            current_batch: 0,
            current_idx: RESERVED_IDX,
        };
        store.open_current()?;
        let batch_num = store.read_current_batch()?;
        store.reset(batch_num)?;
        info!(
            path = %store.cfg.path.display(),
            batch_num = store.current_batch,
            "opened checkpoint store"
        );
        Ok(store)
    }

    /// Batch number of the `current/` view.
    pub fn current_batch(&self) -> BatchNum {
        self.current_batch
    }

    /// Last assigned account index.
    pub fn current_idx(&self) -> u64 {
        self.current_idx
    }

    pub fn set_current_idx(&mut self, idx: u64) -> Result<()> {
        self.db()?.put(KEY_CURRENT_IDX, idx.to_be_bytes())?;
        self.current_idx = idx;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db()?.get(key)?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db()?.put(key, value)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db()?.delete(key)?)
    }

    /// Advances to the next batch: bumps the batch counter in `current/` and
    /// snapshots it as `BatchNum<N>/`, then prunes old checkpoints.
    pub fn make_checkpoint(&mut self) -> Result<()> {
        self.current_batch += 1;
        let db = self.db()?;
        db.put(KEY_CURRENT_BATCH, self.current_batch.to_be_bytes())?;

        let dest = self.checkpoint_path(self.current_batch);
        // A stale snapshot with this number can exist after a rollback.
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        Checkpoint::new(self.db()?)?.create_checkpoint(&dest)?;
        debug!(batch_num = self.current_batch, "made checkpoint");

        self.delete_old_checkpoints()
    }

    /// Rolls the `current/` view back (or forward after reopen) to
    /// `batch_num`, deleting every checkpoint above it.
    ///
    /// `batch_num == 0` rewinds to a fresh, empty state.
    pub fn reset(&mut self, batch_num: BatchNum) -> Result<()> {
        self.close();
        let current = self.current_path();
        if current.exists() {
            fs::remove_dir_all(&current)?;
        }

        for cp in self.list_checkpoints()? {
            if cp > batch_num {
                self.delete_checkpoint(cp)?;
            }
        }

        if batch_num == 0 {
            self.open_current()?;
            self.current_batch = 0;
            self.db()?.put(KEY_CURRENT_BATCH, 0u64.to_be_bytes())?;
            self.set_current_idx(RESERVED_IDX)?;
            return Ok(());
        }

        let src = self.checkpoint_path(batch_num);
        if !src.exists() {
            return Err(CheckpointError::MissingCheckpoint(batch_num));
        }
        copy_dir(&src, &current)?;
        self.open_current()?;
        self.current_batch = self.read_current_batch()?;
        self.current_idx = self.read_current_idx()?;
        Ok(())
    }

    /// Discards all local state and rebuilds `current/` from a checkpoint of
    /// `peer`, used when the local state diverged from what is on chain.
    pub fn reset_from_peer(&mut self, peer: &CheckpointStore, batch_num: BatchNum) -> Result<()> {
        self.close();
        let current = self.current_path();
        if current.exists() {
            fs::remove_dir_all(&current)?;
        }
        for cp in self.list_checkpoints()? {
            self.delete_checkpoint(cp)?;
        }

        if batch_num == 0 {
            self.open_current()?;
            self.current_batch = 0;
            self.db()?.put(KEY_CURRENT_BATCH, 0u64.to_be_bytes())?;
            self.set_current_idx(RESERVED_IDX)?;
            return Ok(());
        }

        let own = self.checkpoint_path(batch_num);
        peer.checkpoint_to(batch_num, &own)?;
        copy_dir(&own, &current)?;
        self.open_current()?;
        self.current_batch = self.read_current_batch()?;
        self.current_idx = self.read_current_idx()?;
        Ok(())
    }

    /// Copies the immutable checkpoint `batch_num` to `dest`, replacing
    /// whatever is there.
    pub fn checkpoint_to(&self, batch_num: BatchNum, dest: &Path) -> Result<()> {
        let src = self.checkpoint_path(batch_num);
        if !src.exists() {
            return Err(CheckpointError::MissingCheckpoint(batch_num));
        }
        if dest.exists() {
            fs::remove_dir_all(dest)?;
        }
        copy_dir(&src, dest)
    }

    pub fn checkpoint_exists(&self, batch_num: BatchNum) -> bool {
        self.checkpoint_path(batch_num).exists()
    }

    pub fn delete_checkpoint(&self, batch_num: BatchNum) -> Result<()> {
        let path = self.checkpoint_path(batch_num);
        if !path.exists() {
            return Err(CheckpointError::MissingCheckpoint(batch_num));
        }
        fs::remove_dir_all(&path)?;
        Ok(())
    }

    /// Sorted checkpoint batch numbers on disk. Errors on a gap in the
    /// sequence unless `no_gaps_check` is set.
    pub fn list_checkpoints(&self) -> Result<Vec<BatchNum>> {
        let mut nums = Vec::new();
        for entry in fs::read_dir(&self.cfg.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(num) = name.strip_prefix(CHECKPOINT_PREFIX) {
                if let Ok(num) = num.parse::<BatchNum>() {
                    nums.push(num);
                }
            }
        }
        nums.sort_unstable();
        if !self.cfg.no_gaps_check {
            for pair in nums.windows(2) {
                if pair[1] != pair[0] + 1 {
                    return Err(CheckpointError::Gap {
                        batch_num: pair[0] + 1,
                    });
                }
            }
        }
        Ok(nums)
    }

    fn delete_old_checkpoints(&self) -> Result<()> {
        if self.cfg.keep == 0 {
            return Ok(());
        }
        let list = self.list_checkpoints()?;
        if list.len() > self.cfg.keep {
            for &cp in &list[..list.len() - self.cfg.keep] {
                self.delete_checkpoint(cp)?;
            }
        }
        Ok(())
    }

    fn db(&self) -> Result<&DB> {
        self.db.as_ref().ok_or(CheckpointError::Closed)
    }

    fn close(&mut self) {
        self.db = None;
    }

    fn open_current(&mut self) -> Result<()> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, self.current_path())?;
        self.db = Some(db);
        Ok(())
    }

    fn read_current_batch(&self) -> Result<BatchNum> {
        Ok(self
            .get(KEY_CURRENT_BATCH)?
            .map(|v| u64_from_bytes(&v))
            .unwrap_or(0))
    }

    fn read_current_idx(&self) -> Result<u64> {
        Ok(self
            .get(KEY_CURRENT_IDX)?
            .map(|v| u64_from_bytes(&v))
            .unwrap_or(RESERVED_IDX))
    }

    fn current_path(&self) -> PathBuf {
        self.cfg.path.join(CURRENT_DIR)
    }

    fn checkpoint_path(&self, batch_num: BatchNum) -> PathBuf {
        self.cfg
            .path
            .join(format!("{CHECKPOINT_PREFIX}{batch_num}"))
    }
}

fn u64_from_bytes(v: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = v.len().min(8);
    buf[8 - n..].copy_from_slice(&v[v.len() - n..]);
    u64::from_be_bytes(buf)
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}
