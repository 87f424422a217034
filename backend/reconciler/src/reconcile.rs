//! One reconciliation run: load both sides, replay the chain events over
//! the stored records, detect what disagrees, and repair it when asked.

use reqwest::Client;
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::db;
use crate::detect::detect_conflicts;
use crate::errors::Result;
use crate::events::{ChainEvent, EventKind, IgnoreList, TransferEvent};
use crate::index::PledgeIndex;
use crate::matching::Replayer;
use crate::repair::RepairWriter;
use crate::report::ConflictReport;
use crate::source::ChainSource;
use crate::state::ReplayState;
use crate::tokens::TokenRegistry;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Write corrections to the store instead of only reporting them.
    pub apply: bool,
    /// Refresh the snapshot and event cache from the network first.
    pub update_cache: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplayCounts {
    replayed: usize,
    ignored: usize,
}

pub async fn run(
    config: &Config,
    pool: &SqlitePool,
    client: Client,
    options: RunOptions,
) -> Result<ConflictReport> {
    let tokens = TokenRegistry::load(&config.token_whitelist_path)?;
    let ignore = match &config.ignored_transactions_path {
        Some(path) => IgnoreList::load(path)?,
        None => IgnoreList::default(),
    };
    info!("Loaded {} whitelisted tokens", tokens.len());
    if !ignore.is_empty() {
        info!("Ignoring {} listed transactions", ignore.len());
    }

    let source = ChainSource::new(config, client);
    let (chain_data, records) = tokio::try_join!(
        source.load(options.update_cache),
        db::list_donations(pool),
    )?;
    info!(
        "Replaying {} events over {} stored donations",
        chain_data.events.len(),
        records.len()
    );

    let index = PledgeIndex::build(&chain_data.snapshot);
    let writer = RepairWriter::new(pool.clone(), options.apply, config.write_concurrency);
    let mut replayer = Replayer::new(
        chain_data.snapshot,
        ReplayState::from_records(records),
        &index,
        &tokens,
        &writer,
        config.parent_policy,
    );

    let counts = replay_events(&mut replayer, &chain_data.events, &ignore).await?;
    let replayed = replayer.finish();

    let conflicts = detect_conflicts(&replayed.state, &replayed.chain, &index, &tokens)?;
    if !conflicts.balance.is_empty() {
        error!(
            "{} pledges disagree with the chain; these are not repaired",
            conflicts.balance.len()
        );
    }
    writer.apply_end_of_run(&conflicts).await?;

    Ok(ConflictReport::new(
        options.apply,
        counts.replayed,
        counts.ignored,
        conflicts,
        replayed.corrections,
    ))
}

/// Fold the ordered events into the replayer. Ignore-listed events are
/// skipped before matching; event kinds replay doesn't act on are passed
/// over.
async fn replay_events(
    replayer: &mut Replayer<'_>,
    events: &[ChainEvent],
    ignore: &IgnoreList,
) -> Result<ReplayCounts> {
    let mut counts = ReplayCounts::default();
    for event in events {
        if ignore.contains(event) {
            debug!(
                "Ignoring {} {} #{}",
                event.event, event.transaction_hash, event.log_index
            );
            counts.ignored += 1;
            continue;
        }
        match event.kind()? {
            EventKind::Transfer(values) => {
                replayer
                    .apply_transfer(&TransferEvent::new(event, values))
                    .await?;
            }
            EventKind::CancelProject(values) => replayer.cancel_project(values.id_project)?,
            EventKind::Other => {
                debug!("Skipping {} event {}", event.event, event.transaction_hash);
                continue;
            }
        }
        counts.replayed += 1;
        if counts.replayed % 1000 == 0 {
            info!(
                "{} events replayed, {} donations tracked, {} corrections so far",
                counts.replayed,
                replayer.state().items().len(),
                replayer.corrections().len()
            );
        }
    }
    Ok(counts)
}
