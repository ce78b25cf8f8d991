//! Application configuration.
//!
//! Loaded from a TOML file, then overridden by `CUSTODY_*` environment
//! variables (`__` separates nested keys, e.g. `CUSTODY_DATA_DIR`).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use custody_core::{ChainIdentity, ChainKey, MAX_DECIMALS};
use custody_reconciler::ConfirmationPolicy;
use custody_registry::KeySource;
use custody_scanner::ScannerConfig;

use crate::error::{AppError, AppResult};

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "CUSTODY";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Snapshots and journals live under `<data_dir>/<chain>/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Journal entries buffered before a flush.
    #[serde(default = "default_journal_buffer_size")]
    pub journal_buffer_size: usize,
    /// Run every chain against the in-process simulated adapter.
    #[serde(default)]
    pub simulate: bool,
    /// Stop every chain after this many rounds.
    #[serde(default)]
    pub max_rounds: Option<u64>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_journal_buffer_size() -> usize {
    64
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            journal_buffer_size: default_journal_buffer_size(),
            simulate: false,
            max_rounds: None,
            chains: Vec::new(),
        }
    }
}

/// One coin handled on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinConfig {
    pub name: String,
    pub decimals: u32,
    /// Sweep confirmed deposits into the hot wallet each round.
    #[serde(default = "default_true")]
    pub sweep_deposits: bool,
}

fn default_true() -> bool {
    true
}

/// Where a chain's key material comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum KeyConfig {
    EnvVar { var_name: String },
    File { path: PathBuf },
    PublicKey { value: String },
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self::EnvVar {
            var_name: "CUSTODY_SEED_HEX".to_string(),
        }
    }
}

impl From<&KeyConfig> for KeySource {
    fn from(cfg: &KeyConfig) -> Self {
        match cfg {
            KeyConfig::EnvVar { var_name } => KeySource::EnvVar {
                var_name: var_name.clone(),
            },
            KeyConfig::File { path } => KeySource::File { path: path.clone() },
            KeyConfig::PublicKey { value } => KeySource::PublicKey {
                value: value.clone(),
            },
        }
    }
}

/// Per-chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Startup selection key.
    pub key: String,
    #[serde(default)]
    pub name: String,
    /// Numeric chain index (BIP-44 coin type).
    #[serde(default)]
    pub index: u32,
    /// Core coin handled by the default handler.
    pub core_type: String,
    pub coins: Vec<CoinConfig>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: u64,
    /// First block scanned on a fresh store.
    #[serde(default = "default_start_height")]
    pub start_height: u64,
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_drop_timeout_blocks")]
    pub drop_timeout_blocks: u64,
    #[serde(default = "default_derivation_path")]
    pub derivation_path: String,
    /// Cold address per coin.
    #[serde(default)]
    pub cold_addresses: BTreeMap<String, String>,
    /// Seed or public key for address derivation.
    #[serde(default)]
    pub key_material: KeyConfig,
}

fn default_confirmations() -> u64 {
    6
}

fn default_max_reorg_depth() -> u64 {
    64
}

fn default_scan_batch_size() -> u64 {
    100
}

fn default_start_height() -> u64 {
    1
}

fn default_round_interval_ms() -> u64 {
    5_000
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_drop_timeout_blocks() -> u64 {
    20
}

fn default_derivation_path() -> String {
    "m/44'/0'/0'".to_string()
}

impl ChainConfig {
    /// Minimal chain with one coin named after the core type.
    pub fn new(key: impl Into<String>, core_type: impl Into<String>, decimals: u32) -> Self {
        let key = key.into();
        let core_type = core_type.into();
        Self {
            name: key.clone(),
            key,
            index: 0,
            coins: vec![CoinConfig {
                name: core_type.clone(),
                decimals,
                sweep_deposits: true,
            }],
            core_type,
            confirmations: default_confirmations(),
            max_reorg_depth: default_max_reorg_depth(),
            scan_batch_size: default_scan_batch_size(),
            start_height: default_start_height(),
            round_interval_ms: default_round_interval_ms(),
            max_send_attempts: default_max_send_attempts(),
            drop_timeout_blocks: default_drop_timeout_blocks(),
            derivation_path: default_derivation_path(),
            cold_addresses: BTreeMap::new(),
            key_material: KeyConfig::default(),
        }
    }

    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(&self.key)
    }

    pub fn identity(&self) -> ChainIdentity {
        ChainIdentity {
            key: self.chain_key(),
            name: if self.name.is_empty() {
                self.key.clone()
            } else {
                self.name.clone()
            },
            index: self.index,
            core_type: self.core_type.clone(),
        }
    }

    pub fn policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            confirmations: self.confirmations,
            max_reorg_depth: self.max_reorg_depth,
            drop_timeout_blocks: self.drop_timeout_blocks,
            max_send_attempts: self.max_send_attempts,
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            batch_size: self.scan_batch_size,
            start_height: self.start_height,
            ..ScannerConfig::default()
        }
    }

    pub fn key_source(&self) -> KeySource {
        KeySource::from(&self.key_material)
    }

    pub fn coin_names(&self) -> Vec<String> {
        self.coins.iter().map(|c| c.name.clone()).collect()
    }

    fn validate(&self) -> AppResult<()> {
        let fail = |reason: String| -> AppResult<()> {
            Err(AppError::Config(format!("chain {}: {reason}", self.key)))
        };
        if self.key.trim().is_empty() {
            return Err(AppError::Config("chain key must not be empty".to_string()));
        }
        if self.coins.is_empty() {
            return fail("no coins configured".to_string());
        }
        let mut names = HashSet::new();
        for coin in &self.coins {
            if !names.insert(coin.name.as_str()) {
                return fail(format!("coin {} configured twice", coin.name));
            }
            if coin.decimals > MAX_DECIMALS {
                return fail(format!(
                    "coin {} has {} decimals, max {MAX_DECIMALS}",
                    coin.name, coin.decimals
                ));
            }
        }
        if let Some(coin) = self.cold_addresses.keys().find(|c| !names.contains(c.as_str())) {
            return fail(format!("cold address for unconfigured coin {coin}"));
        }
        if self.confirmations == 0 {
            return fail("confirmations must be at least 1".to_string());
        }
        if self.max_reorg_depth < self.confirmations {
            return fail(format!(
                "max_reorg_depth {} is below confirmations {}",
                self.max_reorg_depth, self.confirmations
            ));
        }
        if self.scan_batch_size == 0 || self.round_interval_ms == 0 || self.max_send_attempts == 0
        {
            return fail("batch size, round interval and send attempts must be positive".to_string());
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load from a file plus environment overrides, then validate.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(Path::new(path)))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        let cfg: Self = settings
            .try_deserialize()
            .map_err(|e| AppError::Config(format!("Failed to parse config {path}: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML text without environment overrides.
    pub fn from_toml(text: &str) -> AppResult<Self> {
        let cfg: Self = toml::from_str(text)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> AppResult<()> {
        if self.chains.is_empty() {
            return Err(AppError::Config("no chains configured".to_string()));
        }
        if self.journal_buffer_size == 0 {
            return Err(AppError::Config("journal_buffer_size must be positive".to_string()));
        }
        let mut keys = HashSet::new();
        for chain in &self.chains {
            chain.validate()?;
            if !keys.insert(chain.chain_key()) {
                return Err(AppError::Config(format!("chain {} configured twice", chain.key)));
            }
        }
        Ok(())
    }

    pub fn chain(&self, key: &str) -> Option<&ChainConfig> {
        let key = ChainKey::new(key);
        self.chains.iter().find(|c| c.chain_key() == key)
    }

    /// Directory holding one chain's snapshot and journal.
    pub fn chain_dir(&self, chain: &ChainKey) -> PathBuf {
        Path::new(&self.data_dir).join(chain.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
data_dir = "/tmp/custody"

[[chains]]
key = "ETH"
core_type = "eth"
confirmations = 12
cold_addresses = { eth = "cold1" }

[[chains.coins]]
name = "eth"
decimals = 18

[[chains.coins]]
name = "usdt"
decimals = 6
sweep_deposits = false

[chains.key_material]
source = "public_key"
value = "xpub123"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let cfg = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.journal_buffer_size, 64);
        let chain = cfg.chain("eth").unwrap();
        assert_eq!(chain.chain_key().as_str(), "eth");
        assert_eq!(chain.policy().confirmations, 12);
        assert_eq!(chain.policy().max_reorg_depth, 64);
        assert_eq!(chain.scanner_config().batch_size, 100);
        assert!(!chain.coins[1].sweep_deposits);
        assert_eq!(
            chain.key_source(),
            KeySource::PublicKey {
                value: "xpub123".to_string()
            }
        );
        assert_eq!(cfg.chain_dir(&chain.chain_key()), PathBuf::from("/tmp/custody/eth"));
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        assert!(AppConfig::default().validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.chains.push(ChainConfig::new("sim", "sim", 8));
        assert!(cfg.validate().is_ok());

        cfg.chains[0].max_reorg_depth = 3;
        assert!(cfg.validate().is_err());
        cfg.chains[0].max_reorg_depth = 64;

        cfg.chains[0]
            .cold_addresses
            .insert("btc".to_string(), "cold1".to_string());
        assert!(cfg.validate().is_err());
        cfg.chains[0].cold_addresses.clear();

        cfg.chains.push(ChainConfig::new("SIM", "sim", 8));
        assert!(matches!(cfg.validate(), Err(AppError::Config(msg)) if msg.contains("twice")));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = AppConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.chains.len(), 1);
        assert_eq!(cfg.chains[0].coins.len(), 2);
    }
}
