//! Post-replay comparison of replayed balances against the chain snapshot
//! and the stored records.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use tracing::{error, info};

use crate::amount::Amount;
use crate::chain::{ChainSnapshot, PledgeState, NO_ID};
use crate::donation::{DonationId, DonationStatus};
use crate::errors::Result;
use crate::index::PledgeIndex;
use crate::state::{ReplayState, Slot};
use crate::tokens::TokenRegistry;

/// Replayed balance of a pledge disagrees with the chain. Never auto-fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceConflict {
    pub pledge_id: u64,
    pub chain_amount: Amount,
    pub replayed_amount: Amount,
    pub donations: Vec<DonationId>,
}

/// A canceled admin still owns pledges holding money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanceledHolding {
    pub admin_id: u64,
    pub pledge_ids: Vec<u64>,
    pub amount: Amount,
}

/// A stored record no transfer accounted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnusedDonation {
    pub id: DonationId,
    pub pledge_id: u64,
    pub amount: Amount,
    pub saved_amount_remaining: Amount,
    pub status: DonationStatus,
    pub tx_hash: String,
}

/// A stored record whose balance differs from the replayed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftedDonation {
    pub id: DonationId,
    pub pledge_id: u64,
    pub saved: Amount,
    pub replayed: Amount,
    pub token_symbol: String,
    /// Recomputed against the token cutoff for `replayed`.
    pub less_than_cutoff: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conflicts {
    pub balance: Vec<BalanceConflict>,
    pub canceled_holdings: Vec<CanceledHolding>,
    pub unused: Vec<UnusedDonation>,
    pub drifted: Vec<DriftedDonation>,
}

pub fn detect_conflicts(
    state: &ReplayState,
    chain: &ChainSnapshot,
    index: &PledgeIndex,
    tokens: &TokenRegistry,
) -> Result<Conflicts> {
    let balance = balance_conflicts(state, chain)?;
    let canceled_holdings = canceled_holdings(state, chain, index)?;
    let (unused, unused_slots) = unused_donations(state);
    let drifted = drifted_donations(state, &unused_slots, tokens)?;
    Ok(Conflicts {
        balance,
        canceled_holdings,
        unused,
        drifted,
    })
}

fn balance_conflicts(state: &ReplayState, chain: &ChainSnapshot) -> Result<Vec<BalanceConflict>> {
    let mut conflicts = Vec::new();
    for (pledge_id, slots) in state.charged_buckets() {
        let pledge = chain.pledge(pledge_id)?;
        let replayed = state.balance(pledge_id);
        if replayed == pledge.amount {
            continue;
        }
        let donations: Vec<DonationId> = slots.iter().filter_map(|s| state.item(*s).id).collect();
        error!(
            "Pledge {pledge_id} amount {} does not equal replayed {replayed} ({donations:?})",
            pledge.amount
        );
        conflicts.push(BalanceConflict {
            pledge_id,
            chain_amount: pledge.amount.clone(),
            replayed_amount: replayed,
            donations,
        });
    }
    Ok(conflicts)
}

/// Pledges of canceled admins whose replayed balance agrees with the chain
/// but that still sit outside Paying or Paid. Pledges replay never charged
/// are not judged here.
fn canceled_holdings(
    state: &ReplayState,
    chain: &ChainSnapshot,
    index: &PledgeIndex,
) -> Result<Vec<CanceledHolding>> {
    let mut agreeing = BTreeSet::new();
    for (pledge_id, _) in state.charged_buckets() {
        if state.balance(pledge_id) == chain.pledge(pledge_id)?.amount {
            agreeing.insert(pledge_id);
        }
    }

    let mut holdings = Vec::new();
    for admin in chain.admins.iter().flatten().filter(|a| a.is_canceled) {
        let pledges: Vec<_> = index
            .pledges_of(admin.id)
            .iter()
            .filter(|id| agreeing.contains(*id))
            .filter_map(|id| chain.pledge(*id).ok())
            .filter(|p| !matches!(p.pledge_state, PledgeState::Paying | PledgeState::Paid))
            .collect();
        if pledges.is_empty() {
            continue;
        }
        let amount: Amount = pledges.iter().map(|p| &p.amount).sum();
        info!(
            "Canceled admin {} still holds {amount} in pledges {:?}",
            admin.id,
            pledges.iter().map(|p| p.id).collect::<Vec<_>>()
        );
        holdings.push(CanceledHolding {
            admin_id: admin.id,
            pledge_ids: pledges.iter().map(|p| p.id).collect(),
            amount,
        });
    }
    Ok(holdings)
}

/// Stored records left in a not-filled bucket. The failed bucket is not
/// judged.
fn unused_donations(state: &ReplayState) -> (Vec<UnusedDonation>, HashSet<Slot>) {
    let mut unused = Vec::new();
    let mut slots = HashSet::new();
    for (pledge_id, bucket) in state.not_filled_buckets() {
        if pledge_id == NO_ID {
            continue;
        }
        for slot in bucket {
            let item = state.item(*slot);
            let Some(id) = item.id else { continue };
            error!("Donation {id} at pledge {pledge_id} was not used by any transfer");
            unused.push(UnusedDonation {
                id,
                pledge_id,
                amount: item.amount.clone(),
                saved_amount_remaining: item.saved_amount_remaining.clone().unwrap_or_default(),
                status: item.status,
                tx_hash: item.tx_hash.clone(),
            });
            slots.insert(*slot);
        }
    }
    (unused, slots)
}

fn drifted_donations(
    state: &ReplayState,
    unused: &HashSet<Slot>,
    tokens: &TokenRegistry,
) -> Result<Vec<DriftedDonation>> {
    let mut drifted = Vec::new();
    for (slot, item) in state.items().iter().enumerate() {
        let Some(id) = item.id else { continue };
        if item.is_failed_bucket() || unused.contains(&slot) {
            continue;
        }
        let saved = item.saved_amount_remaining.clone().unwrap_or_default();
        if saved == item.amount_remaining {
            continue;
        }
        let symbol = item.token_symbol.clone().unwrap_or_default();
        let token = tokens.by_symbol(&symbol)?;
        error!(
            "Donation {id} amountRemaining should be {} but is {saved}",
            item.amount_remaining
        );
        drifted.push(DriftedDonation {
            id,
            pledge_id: item.pledge_id,
            saved,
            replayed: item.amount_remaining.clone(),
            token_symbol: symbol,
            less_than_cutoff: token.is_below_cutoff(&item.amount_remaining),
        });
    }
    Ok(drifted)
}
