//! zkforge Configuration
//!
//! Shared configuration crate for all zkforge components.
//!
//! Handles loading configuration from:
//! 1. ZF_CONFIG env var (explicit path)
//! 2. ./config.toml (current directory)
//! 3. ~/.zkforge/config.toml (user home)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::{env, fs};

/// Global config instance for convenience access
pub static GLOBAL_CONFIG: OnceLock<ZkforgeConfig> = OnceLock::new();

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = ".zkforge";

// ============================================================================
// Default Constants (avoid repeated allocations)
// ============================================================================

const DEFAULT_DB_PATH: &str = "./zkforge-db";
const DEFAULT_KEEP_CHECKPOINTS: usize = 128;

const DEFAULT_CONFIRM_BLOCKS: i64 = 5;
const DEFAULT_L1_BATCH_TIMEOUT_PERC: f64 = 0.6;
const DEFAULT_FORGE_RETRY_INTERVAL_MS: u64 = 10_000;
const DEFAULT_SYNC_RETRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PURGE_BY_EXT_DEL_INTERVAL_MS: u64 = 60_000;

const DEFAULT_ETH_CLIENT_ATTEMPTS: usize = 5;
const DEFAULT_ETH_CLIENT_ATTEMPTS_DELAY_MS: u64 = 500;
const DEFAULT_ETH_TX_RESEND_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_GAS_PRICE: u64 = 500_000_000_000;
const DEFAULT_MIN_GAS_PRICE: u64 = 1_000_000_000;
const DEFAULT_TX_MANAGER_CHECK_INTERVAL_MS: u64 = 1_000;

const DEFAULT_PROVER_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PROVER_READ_TIMEOUT_MS: u64 = 20_000;

const DEFAULT_PURGE_BATCH_DELAY: i64 = 10;
const DEFAULT_PURGE_BLOCK_DELAY: i64 = 10;
const DEFAULT_INVALIDATE_BATCH_DELAY: i64 = 20;
const DEFAULT_INVALIDATE_BLOCK_DELAY: i64 = 20;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZkforgeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub forging: ForgingConfig,
    #[serde(default)]
    pub eth: EthConfig,
    #[serde(default)]
    pub provers: ProversConfig,
    #[serde(default)]
    pub purger: PurgerConfig,
}

/// Checkpointed state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Number of checkpoints kept per store. 0 keeps everything.
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_DB_PATH.into(),
            keep_checkpoints: DEFAULT_KEEP_CHECKPOINTS,
        }
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.into()
}
fn default_keep_checkpoints() -> usize {
    DEFAULT_KEEP_CHECKPOINTS
}

/// Batch forging policy and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgingConfig {
    /// Address under which this coordinator forges (hex, 20 bytes)
    #[serde(default)]
    pub forger_address: String,
    #[serde(default = "default_confirm_blocks")]
    pub confirm_blocks: i64,
    /// Portion of the L1-batch timeout window after which an L1 batch is
    /// scheduled
    #[serde(default = "default_l1_batch_timeout_perc")]
    pub l1_batch_timeout_perc: f64,
    #[serde(default)]
    pub start_slot_blocks_delay: i64,
    #[serde(default)]
    pub schedule_batch_blocks_ahead_check: i64,
    #[serde(default)]
    pub send_batch_blocks_margin_check: i64,
    #[serde(default = "default_forge_retry_interval")]
    pub forge_retry_interval_ms: u64,
    #[serde(default)]
    pub forge_delay_ms: u64,
    #[serde(default)]
    pub forge_no_txs_delay_ms: u64,
    #[serde(default)]
    pub must_forge_at_slot_deadline: bool,
    #[serde(default)]
    pub ignore_slot_commitment: bool,
    #[serde(default)]
    pub forge_once_per_slot_if_txs: bool,
    #[serde(default = "default_sync_retry_interval")]
    pub sync_retry_interval_ms: u64,
    #[serde(default = "default_purge_by_ext_del_interval")]
    pub purge_by_external_delete_interval_ms: u64,
    /// If set, every batch status change is stored as JSON under this path
    #[serde(default)]
    pub debug_batch_path: Option<String>,
}

impl Default for ForgingConfig {
    fn default() -> Self {
        Self {
            forger_address: String::new(),
            confirm_blocks: DEFAULT_CONFIRM_BLOCKS,
            l1_batch_timeout_perc: DEFAULT_L1_BATCH_TIMEOUT_PERC,
            start_slot_blocks_delay: 0,
            schedule_batch_blocks_ahead_check: 0,
            send_batch_blocks_margin_check: 0,
            forge_retry_interval_ms: DEFAULT_FORGE_RETRY_INTERVAL_MS,
            forge_delay_ms: 0,
            forge_no_txs_delay_ms: 0,
            must_forge_at_slot_deadline: false,
            ignore_slot_commitment: false,
            forge_once_per_slot_if_txs: false,
            sync_retry_interval_ms: DEFAULT_SYNC_RETRY_INTERVAL_MS,
            purge_by_external_delete_interval_ms: DEFAULT_PURGE_BY_EXT_DEL_INTERVAL_MS,
            debug_batch_path: None,
        }
    }
}

fn default_confirm_blocks() -> i64 {
    DEFAULT_CONFIRM_BLOCKS
}
fn default_l1_batch_timeout_perc() -> f64 {
    DEFAULT_L1_BATCH_TIMEOUT_PERC
}
fn default_forge_retry_interval() -> u64 {
    DEFAULT_FORGE_RETRY_INTERVAL_MS
}
fn default_sync_retry_interval() -> u64 {
    DEFAULT_SYNC_RETRY_INTERVAL_MS
}
fn default_purge_by_ext_del_interval() -> u64 {
    DEFAULT_PURGE_BY_EXT_DEL_INTERVAL_MS
}

/// Chain client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthConfig {
    #[serde(default = "default_eth_client_attempts")]
    pub client_attempts: usize,
    #[serde(default = "default_eth_client_attempts_delay")]
    pub client_attempts_delay_ms: u64,
    /// Timeout after which a non-mined transaction is resent with the same
    /// nonce and a bumped gas price
    #[serde(default = "default_eth_tx_resend_timeout")]
    pub tx_resend_timeout_ms: u64,
    #[serde(default)]
    pub no_reuse_nonce: bool,
    /// Maximum gas price in wei for forge transactions
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: u64,
    #[serde(default = "default_min_gas_price")]
    pub min_gas_price: u64,
    /// Percentage increase over the node's suggested gas price
    #[serde(default)]
    pub gas_price_inc_perc: u64,
    #[serde(default = "default_tx_manager_check_interval")]
    pub check_interval_ms: u64,
}

impl Default for EthConfig {
    fn default() -> Self {
        Self {
            client_attempts: DEFAULT_ETH_CLIENT_ATTEMPTS,
            client_attempts_delay_ms: DEFAULT_ETH_CLIENT_ATTEMPTS_DELAY_MS,
            tx_resend_timeout_ms: DEFAULT_ETH_TX_RESEND_TIMEOUT_MS,
            no_reuse_nonce: false,
            max_gas_price: DEFAULT_MAX_GAS_PRICE,
            min_gas_price: DEFAULT_MIN_GAS_PRICE,
            gas_price_inc_perc: 0,
            check_interval_ms: DEFAULT_TX_MANAGER_CHECK_INTERVAL_MS,
        }
    }
}

fn default_eth_client_attempts() -> usize {
    DEFAULT_ETH_CLIENT_ATTEMPTS
}
fn default_eth_client_attempts_delay() -> u64 {
    DEFAULT_ETH_CLIENT_ATTEMPTS_DELAY_MS
}
fn default_eth_tx_resend_timeout() -> u64 {
    DEFAULT_ETH_TX_RESEND_TIMEOUT_MS
}
fn default_max_gas_price() -> u64 {
    DEFAULT_MAX_GAS_PRICE
}
fn default_min_gas_price() -> u64 {
    DEFAULT_MIN_GAS_PRICE
}
fn default_tx_manager_check_interval() -> u64 {
    DEFAULT_TX_MANAGER_CHECK_INTERVAL_MS
}

/// Proof server pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProversConfig {
    /// Base URLs of the proof servers (e.g. "http://localhost:3000")
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_prover_poll_interval")]
    pub poll_interval_ms: u64,
    /// Per-prover readiness probe timeout at pipeline startup
    #[serde(default = "default_prover_read_timeout")]
    pub read_timeout_ms: u64,
}

impl Default for ProversConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            poll_interval_ms: DEFAULT_PROVER_POLL_INTERVAL_MS,
            read_timeout_ms: DEFAULT_PROVER_READ_TIMEOUT_MS,
        }
    }
}

fn default_prover_poll_interval() -> u64 {
    DEFAULT_PROVER_POLL_INTERVAL_MS
}
fn default_prover_read_timeout() -> u64 {
    DEFAULT_PROVER_READ_TIMEOUT_MS
}

/// Pool maintenance cooldowns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgerConfig {
    #[serde(default = "default_purge_batch_delay")]
    pub purge_batch_delay: i64,
    #[serde(default = "default_purge_block_delay")]
    pub purge_block_delay: i64,
    #[serde(default = "default_invalidate_batch_delay")]
    pub invalidate_batch_delay: i64,
    #[serde(default = "default_invalidate_block_delay")]
    pub invalidate_block_delay: i64,
}

impl Default for PurgerConfig {
    fn default() -> Self {
        Self {
            purge_batch_delay: DEFAULT_PURGE_BATCH_DELAY,
            purge_block_delay: DEFAULT_PURGE_BLOCK_DELAY,
            invalidate_batch_delay: DEFAULT_INVALIDATE_BATCH_DELAY,
            invalidate_block_delay: DEFAULT_INVALIDATE_BLOCK_DELAY,
        }
    }
}

fn default_purge_batch_delay() -> i64 {
    DEFAULT_PURGE_BATCH_DELAY
}
fn default_purge_block_delay() -> i64 {
    DEFAULT_PURGE_BLOCK_DELAY
}
fn default_invalidate_batch_delay() -> i64 {
    DEFAULT_INVALIDATE_BATCH_DELAY
}
fn default_invalidate_block_delay() -> i64 {
    DEFAULT_INVALIDATE_BLOCK_DELAY
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

/// Set field from env var if present
fn env_string(key: &str, field: &mut String) {
    if let Ok(v) = env::var(key) {
        *field = v;
    }
}

/// Set Option<String> from env var if present
fn env_option_string(key: &str, field: &mut Option<String>) {
    if let Ok(v) = env::var(key) {
        *field = Some(v);
    }
}

/// Set field from env var if present and parseable
fn env_parse<T: std::str::FromStr>(key: &str, field: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

/// Check if env var is set to a truthy value ("1" or "true")
fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

// ============================================================================
// Implementation
// ============================================================================

impl ZkforgeConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check ZF_CONFIG env var
        if let Ok(path) = env::var("ZF_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 2. Check ./config.toml (current directory)
        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.zkforge/config.toml
        dirs::home_dir()
            .map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Database
        env_string("ZF_DB_PATH", &mut self.database.path);
        env_parse("ZF_KEEP_CHECKPOINTS", &mut self.database.keep_checkpoints);

        // Forging
        env_string("ZF_FORGER_ADDRESS", &mut self.forging.forger_address);
        env_parse("ZF_CONFIRM_BLOCKS", &mut self.forging.confirm_blocks);
        env_parse(
            "ZF_L1_BATCH_TIMEOUT_PERC",
            &mut self.forging.l1_batch_timeout_perc,
        );
        env_parse("ZF_FORGE_DELAY_MS", &mut self.forging.forge_delay_ms);
        env_parse(
            "ZF_FORGE_NO_TXS_DELAY_MS",
            &mut self.forging.forge_no_txs_delay_ms,
        );
        if let Some(v) = env_bool("ZF_FORGE_ONCE_PER_SLOT_IF_TXS") {
            self.forging.forge_once_per_slot_if_txs = v;
        }
        if let Some(v) = env_bool("ZF_MUST_FORGE_AT_SLOT_DEADLINE") {
            self.forging.must_forge_at_slot_deadline = v;
        }
        if let Some(v) = env_bool("ZF_IGNORE_SLOT_COMMITMENT") {
            self.forging.ignore_slot_commitment = v;
        }
        env_option_string("ZF_DEBUG_BATCH_PATH", &mut self.forging.debug_batch_path);

        // Eth client
        env_parse("ZF_ETH_CLIENT_ATTEMPTS", &mut self.eth.client_attempts);
        env_parse("ZF_MAX_GAS_PRICE", &mut self.eth.max_gas_price);
        env_parse("ZF_MIN_GAS_PRICE", &mut self.eth.min_gas_price);
        env_parse("ZF_GAS_PRICE_INC_PERC", &mut self.eth.gas_price_inc_perc);
        if let Some(v) = env_bool("ZF_ETH_NO_REUSE_NONCE") {
            self.eth.no_reuse_nonce = v;
        }

        // Provers
        if let Ok(v) = env::var("ZF_PROVER_URLS") {
            self.provers.urls = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        env_parse(
            "ZF_PROVER_POLL_INTERVAL_MS",
            &mut self.provers.poll_interval_ms,
        );
        env_parse(
            "ZF_PROVER_READ_TIMEOUT_MS",
            &mut self.provers.read_timeout_ms,
        );
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.provers.urls = vec!["http://localhost:3000".into()];
        toml::to_string_pretty(&sample).unwrap_or_default()
    }

    /// Get the global config instance, initializing it if necessary.
    ///
    /// Falls back to defaults if loading fails.
    pub fn global() -> &'static ZkforgeConfig {
        GLOBAL_CONFIG.get_or_init(|| {
            Self::load().unwrap_or_else(|e| {
                log::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            })
        })
    }

    /// Try to get the global config instance.
    ///
    /// Returns `None` if config hasn't been initialized yet.
    pub fn try_global() -> Option<&'static ZkforgeConfig> {
        GLOBAL_CONFIG.get()
    }

    /// Initialize the global config with a specific instance.
    ///
    /// Returns `Err(config)` if already initialized.
    pub fn set_global(config: ZkforgeConfig) -> Result<(), ZkforgeConfig> {
        GLOBAL_CONFIG.set(config)
    }
}

/// Shorthand for `ZkforgeConfig::global()`.
#[inline]
pub fn global_config() -> &'static ZkforgeConfig {
    ZkforgeConfig::global()
}

// ============================================================================
// Tests
// ============================================================================
