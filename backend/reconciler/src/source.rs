//! Chain data for a run: the pledge/admin snapshot and the ordered event
//! list, served from the on-disk cache and optionally refreshed from the
//! network first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use reqwest::Client;
use tracing::{debug, info};

use crate::chain::ChainSnapshot;
use crate::config::Config;
use crate::errors::{ReconcileError, Result};
use crate::events::{ChainEvent, EventKind};
use crate::rpc::{self, RpcClient};

#[derive(Debug, Clone)]
pub struct ChainData {
    pub snapshot: ChainSnapshot,
    /// Ordered by `(blockNumber, logIndex)`.
    pub events: Vec<ChainEvent>,
}

pub struct ChainSource {
    rpc: RpcClient,
    state_url: String,
    contract: String,
    required_confirmations: u64,
    log_block_range: u64,
    state_file: PathBuf,
    events_file: PathBuf,
}

impl ChainSource {
    pub fn new(config: &Config, client: Client) -> Self {
        let name = &config.cache_name;
        Self {
            rpc: RpcClient::new(client, config.rpc_url.clone()),
            state_url: config.state_url.clone(),
            contract: config.liquid_pledging_address.clone(),
            required_confirmations: config.required_confirmations,
            log_block_range: config.log_block_range,
            state_file: config
                .cache_dir
                .join(format!("liquidPledgingState_{name}.json")),
            events_file: config
                .cache_dir
                .join(format!("liquidPledgingEvents_{name}.json")),
        }
    }

    /// Load the cached chain data, refreshing it from the network first when
    /// `update` is set. The snapshot and the new events are fetched
    /// concurrently; both must succeed before anything is written.
    pub async fn load(&self, update: bool) -> Result<ChainData> {
        if let Some(dir) = self.state_file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut events: Vec<ChainEvent> = read_json(&self.events_file).await?.unwrap_or_default();

        let snapshot = if update {
            let from_block = events.last().map(|e| e.block_number + 1).unwrap_or(0);
            let (snapshot, new_events) = tokio::try_join!(
                self.rpc.fetch_state(&self.state_url),
                self.fetch_events(from_block),
            )?;
            info!(
                "Fetched snapshot ({} pledges, {} admins) and {} new events",
                snapshot.pledges.len().saturating_sub(1),
                snapshot.admins.len().saturating_sub(1),
                new_events.len()
            );
            tokio::fs::write(&self.state_file, serde_json::to_vec_pretty(&snapshot)?).await?;
            if !new_events.is_empty() {
                events.extend(new_events);
                tokio::fs::write(&self.events_file, serde_json::to_vec_pretty(&events)?).await?;
            }
            snapshot
        } else {
            read_json(&self.state_file).await?.ok_or_else(|| {
                ReconcileError::Config(format!(
                    "No cached snapshot at {}; run with --update-network-cache",
                    self.state_file.display()
                ))
            })?
        };

        events.sort_by_key(ChainEvent::position);
        Ok(ChainData { snapshot, events })
    }

    /// Events from `from_block` up to the confirmed head, with block
    /// timestamps resolved for transfers.
    async fn fetch_events(&self, from_block: u64) -> Result<Vec<ChainEvent>> {
        let head = self.rpc.block_number().await?;
        let to_block = head.saturating_sub(self.required_confirmations);
        if from_block > to_block {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let mut start = from_block;
        while start <= to_block {
            let end = to_block.min(start.saturating_add(self.log_block_range - 1));
            let raw = self.rpc.get_logs(&self.contract, start, end).await?;
            debug!("Blocks {start}..={end}: {} logs", raw.len());
            events.extend(rpc::decode_logs(&raw)?);
            start = end + 1;
        }

        let mut timestamps: HashMap<u64, i64> = HashMap::new();
        for ev in events.iter_mut() {
            if !matches!(ev.kind()?, EventKind::Transfer(_)) {
                continue;
            }
            let ts = match timestamps.get(&ev.block_number) {
                Some(ts) => *ts,
                None => {
                    let ts = self.rpc.block_timestamp(ev.block_number).await?;
                    timestamps.insert(ev.block_number, ts);
                    ts
                }
            };
            ev.timestamp = Some(ts);
        }

        events.sort_by_key(ChainEvent::position);
        Ok(events)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
