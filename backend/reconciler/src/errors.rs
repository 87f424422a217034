//! Application-wide error types.
//!
//! Everything here aborts the run. Reported conflicts (balance mismatch,
//! unused records, drift) are not errors; they end up in the report.

use thiserror::Error;

use crate::amount::Amount;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event parse error: {0}")]
    EventParse(String),

    #[error("Stored donation {id} is malformed: {reason}")]
    MalformedRecord { id: i64, reason: String },

    #[error("RPC hard error {code}: {message}")]
    Rpc { code: i64, message: String },

    // ─── Structural replay conflicts ──────────────────────
    #[error("There is no donation for transfer from {from} to {to} (tx {tx_hash})")]
    NoSupplier { from: u64, to: u64, tx_hash: String },

    #[error("Donations of pledge {pledge} are short by {missing} for tx {tx_hash}")]
    Deficit {
        pledge: u64,
        missing: Amount,
        tx_hash: String,
    },

    #[error("No appropriate parent {parent} found at pledge {pledge} to move donation")]
    MissingParent { parent: i64, pledge: u64 },

    #[error("Pledge {pledge} status {state} is unknown")]
    UnknownPledgeState { pledge: u64, state: String },

    #[error("Pledge {0} is missing from the chain snapshot")]
    MissingPledge(u64),

    #[error("Admin {0} is missing from the chain snapshot")]
    MissingAdmin(u64),

    #[error("No PledgeAdmin record exists for admin {0}")]
    MissingPledgeAdmin(u64),

    #[error("No token found for {0}")]
    MissingToken(String),

    #[error("Block {0} has no known timestamp")]
    MissingTimestamp(u64),

    #[error("Cannot set giverAddress for donation at pledge {0}")]
    GiverAddressUnresolved(u64),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
