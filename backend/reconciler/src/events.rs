//! Event types emitted by the pledge ledger contract, as cached on disk and
//! replayed in chain order.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::amount::Amount;
use crate::chain::de_id;
use crate::errors::{ReconcileError, Result};

/// A contract log as cached on disk, in the shape web3 reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    /// Event name, e.g. `Transfer` or `CancelProject`.
    pub event: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    /// Block timestamp in unix seconds, resolved when the event was fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub return_values: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferValues {
    #[serde(deserialize_with = "de_id")]
    pub from: u64,
    #[serde(deserialize_with = "de_id")]
    pub to: u64,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelProjectValues {
    #[serde(deserialize_with = "de_id")]
    pub id_project: u64,
}

/// Decoded payload of the event kinds replay acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Transfer(TransferValues),
    CancelProject(CancelProjectValues),
    /// Any other contract event; kept in the cache, skipped by replay.
    Other,
}

impl ChainEvent {
    pub fn transfer(meta: (&str, u64, u64, Option<i64>), values: &TransferValues) -> Self {
        Self::build("Transfer", meta, json!(values))
    }

    pub fn cancel_project(meta: (&str, u64, u64, Option<i64>), id_project: u64) -> Self {
        Self::build(
            "CancelProject",
            meta,
            json!({ "idProject": id_project.to_string() }),
        )
    }

    fn build(
        event: &str,
        (tx_hash, log_index, block_number, timestamp): (&str, u64, u64, Option<i64>),
        return_values: Value,
    ) -> Self {
        Self {
            event: event.to_string(),
            transaction_hash: tx_hash.to_string(),
            log_index,
            block_number,
            timestamp,
            return_values,
        }
    }

    /// Decode `returnValues` according to `event`. A recognised event whose
    /// payload does not decode is an error.
    pub fn kind(&self) -> Result<EventKind> {
        let decode_err = |e: serde_json::Error| {
            ReconcileError::EventParse(format!(
                "{} {}#{}: {e}",
                self.event, self.transaction_hash, self.log_index
            ))
        };
        Ok(match self.event.as_str() {
            "Transfer" => EventKind::Transfer(
                TransferValues::deserialize(&self.return_values).map_err(decode_err)?,
            ),
            "CancelProject" => EventKind::CancelProject(
                CancelProjectValues::deserialize(&self.return_values).map_err(decode_err)?,
            ),
            _ => EventKind::Other,
        })
    }

    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// A transfer as seen by the matching engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: u64,
    pub to: u64,
    pub amount: Amount,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: Option<i64>,
}

impl TransferEvent {
    pub fn new(event: &ChainEvent, values: TransferValues) -> Self {
        Self {
            from: values.from,
            to: values.to,
            amount: values.amount,
            tx_hash: event.transaction_hash.clone(),
            log_index: event.log_index,
            block_number: event.block_number,
            timestamp: event.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IgnoredTransaction {
    tx_hash: String,
    log_index: u64,
}

/// Events known in advance to be noise, keyed by `(txHash, logIndex)`.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    entries: HashSet<(String, u64)>,
}

impl IgnoreList {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Accepts either a bare array or `{ "ignoredTransactions": [...] }`.
    pub fn from_json(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Wrapped {
                #[serde(rename = "ignoredTransactions")]
                ignored_transactions: Vec<IgnoredTransaction>,
            },
            Bare(Vec<IgnoredTransaction>),
        }

        let list = match serde_json::from_str::<Shape>(raw)? {
            Shape::Wrapped {
                ignored_transactions,
            } => ignored_transactions,
            Shape::Bare(list) => list,
        };
        Ok(Self {
            entries: list
                .into_iter()
                .map(|t| (t.tx_hash.to_lowercase(), t.log_index))
                .collect(),
        })
    }

    pub fn contains(&self, event: &ChainEvent) -> bool {
        self.entries
            .contains(&(event.transaction_hash.to_lowercase(), event.log_index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
