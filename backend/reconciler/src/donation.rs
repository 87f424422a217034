//! Donation records: the ledger-store rows and their replay working copies.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::chain::NO_ID;

/// Store-generated donation id.
pub type DonationId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DonationStatus {
    Pending,
    ToApprove,
    Waiting,
    Committed,
    Paying,
    Paid,
    Canceled,
    Rejected,
    Failed,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::ToApprove => "ToApprove",
            Self::Waiting => "Waiting",
            Self::Committed => "Committed",
            Self::Paying => "Paying",
            Self::Paid => "Paid",
            Self::Canceled => "Canceled",
            Self::Rejected => "Rejected",
            Self::Failed => "Failed",
        }
    }

    /// Statuses replay may overwrite on a matched record. Others can still
    /// be revised by later events, so they are left alone.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::Paying | Self::Failed)
    }
}

impl FromStr for DonationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Pending" => Self::Pending,
            "ToApprove" => Self::ToApprove,
            "Waiting" => Self::Waiting,
            "Committed" => Self::Committed,
            "Paying" => Self::Paying,
            "Paid" => Self::Paid,
            "Canceled" => Self::Canceled,
            "Rejected" => Self::Rejected,
            "Failed" => Self::Failed,
            other => return Err(format!("unknown donation status {other:?}")),
        })
    }
}

/// A donation row as held by the ledger store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRecord {
    pub id: DonationId,
    pub amount: Amount,
    pub amount_remaining: Amount,
    pub pledge_id: u64,
    pub status: DonationStatus,
    pub mined: bool,
    pub tx_hash: String,
    pub parent_donations: Vec<DonationId>,
    pub owner_id: u64,
    pub owner_type: String,
    pub owner_type_id: String,
    pub giver_address: Option<String>,
    pub token_symbol: String,
    pub intended_project_id: Option<u64>,
    pub delegate_id: Option<u64>,
    pub less_than_cutoff: bool,
    pub is_return: bool,
    pub created_at: i64,
}

/// Fields of a record about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDonation {
    pub amount: Amount,
    pub amount_remaining: Amount,
    pub pledge_id: u64,
    pub status: DonationStatus,
    pub mined: bool,
    pub tx_hash: String,
    pub parent_donations: Vec<DonationId>,
    pub owner_id: u64,
    pub owner_type: String,
    pub owner_type_id: String,
    pub giver_address: Option<String>,
    pub token_symbol: String,
    pub intended_project_id: Option<u64>,
    pub delegate_id: Option<u64>,
    pub less_than_cutoff: bool,
    pub created_at: i64,
}

/// Replay working copy of a donation.
///
/// `amount_remaining` is what replay has computed so far and starts at zero
/// for every stored record; `saved_amount_remaining` is what the store
/// holds. Items synthesized during a report-only run have no `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationItem {
    pub id: Option<DonationId>,
    pub amount: Amount,
    pub amount_remaining: Amount,
    pub saved_amount_remaining: Option<Amount>,
    pub pledge_id: u64,
    pub status: DonationStatus,
    pub mined: bool,
    pub tx_hash: String,
    pub parent_donations: Vec<DonationId>,
    pub owner_id: u64,
    pub giver_address: Option<String>,
    pub token_symbol: Option<String>,
    pub created_at: i64,
}

impl DonationItem {
    pub fn is_failed_bucket(&self) -> bool {
        self.pledge_id == NO_ID
    }
}

impl From<DonationRecord> for DonationItem {
    fn from(r: DonationRecord) -> Self {
        Self {
            id: Some(r.id),
            amount: r.amount,
            amount_remaining: Amount::zero(),
            saved_amount_remaining: Some(r.amount_remaining),
            pledge_id: r.pledge_id,
            status: r.status,
            mined: r.mined,
            tx_hash: r.tx_hash,
            parent_donations: r.parent_donations,
            owner_id: r.owner_id,
            giver_address: r.giver_address.filter(|a| !a.is_empty()),
            token_symbol: Some(r.token_symbol).filter(|s| !s.is_empty()),
            created_at: r.created_at,
        }
    }
}
