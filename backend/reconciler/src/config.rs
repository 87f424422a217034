//! Application configuration loaded from environment variables.

use std::path::PathBuf;

use crate::errors::{ReconcileError, Result};

/// Which parent links the charge engine trusts when a stored record matches
/// an incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentPolicy {
    /// Charge suppliers first-in first-out and overwrite stored parents.
    #[default]
    Replay,
    /// Charge exactly the parents the matched record already lists.
    Stored,
}

impl std::str::FromStr for ParentPolicy {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "replay" => Ok(Self::Replay),
            "stored" => Ok(Self::Stored),
            other => Err(ReconcileError::Config(format!(
                "Invalid PARENT_POLICY {other:?} (expected replay | stored)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Ethereum JSON-RPC endpoint of the chain hosting the ledger contract
    pub rpc_url: String,
    /// HTTP endpoint returning the contract's `{ pledges, admins }` state
    pub state_url: String,
    /// Address of the pledge ledger contract
    pub liquid_pledging_address: String,
    /// Blocks to stay behind the chain head when fetching events
    pub required_confirmations: u64,
    /// Block window per `eth_getLogs` request
    pub log_block_range: u64,
    /// Path to the SQLite ledger store
    pub database_url: String,
    /// Directory holding the state and event cache files
    pub cache_dir: PathBuf,
    /// Suffix of the cache file names (one cache per network)
    pub cache_name: String,
    /// JSON whitelist of tokens (`symbol`, `foreignAddress`, `decimals`)
    pub token_whitelist_path: PathBuf,
    /// Optional JSON list of `{ txHash, logIndex }` events to skip
    pub ignored_transactions_path: Option<PathBuf>,
    /// Optional path the JSON conflict report is written to
    pub report_path: Option<PathBuf>,
    /// Maximum concurrent store writes in the final repair pass
    pub write_concurrency: usize,
    pub parent_policy: ParentPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string()),
            state_url: env_var("STATE_URL")
                .unwrap_or_else(|_| "http://localhost:3030/liquidpledging/state".to_string()),
            liquid_pledging_address: env_var("LIQUID_PLEDGING_ADDRESS").map_err(|_| {
                ReconcileError::Config(
                    "LIQUID_PLEDGING_ADDRESS environment variable is required".to_string(),
                )
            })?,
            required_confirmations: env_var("REQUIRED_CONFIRMATIONS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .map_err(|_| ReconcileError::Config("Invalid REQUIRED_CONFIRMATIONS".to_string()))?,
            log_block_range: env_var("LOG_BLOCK_RANGE")
                .unwrap_or_else(|_| "100000".to_string())
                .parse()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| ReconcileError::Config("Invalid LOG_BLOCK_RANGE".to_string()))?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./donations.db".to_string()),
            cache_dir: env_var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("simulation-script")),
            cache_name: env_var("CACHE_NAME").unwrap_or_else(|_| "default".to_string()),
            token_whitelist_path: env_var("TOKEN_WHITELIST_PATH")
                .map(PathBuf::from)
                .map_err(|_| {
                    ReconcileError::Config(
                        "TOKEN_WHITELIST_PATH environment variable is required".to_string(),
                    )
                })?,
            ignored_transactions_path: env_var("IGNORED_TRANSACTIONS_PATH").ok().map(PathBuf::from),
            report_path: env_var("REPORT_PATH").ok().map(PathBuf::from),
            write_concurrency: env_var("WRITE_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| ReconcileError::Config("Invalid WRITE_CONCURRENCY".to_string()))?,
            parent_policy: env_var("PARENT_POLICY")
                .unwrap_or_else(|_| "replay".to_string())
                .parse()?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ReconcileError::Config(format!("Missing env var: {key}")))
}
