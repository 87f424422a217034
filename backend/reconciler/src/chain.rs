//! Chain-side snapshot of the pledge ledger contract: pledges and admins.
//!
//! The snapshot JSON mirrors what the contract state reader produces. Both
//! arrays are 1-indexed (slot 0 is `null`), numbers may arrive as strings,
//! and project admins are reported as a generic `Project` kind that is split
//! into campaigns and milestones by their parent link.

use serde::{Deserialize, Deserializer, Serialize};

use crate::amount::Amount;
use crate::errors::{ReconcileError, Result};

/// Sentinel pledge / admin id meaning "none".
pub const NO_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PledgeState {
    Pledged,
    Paying,
    Paid,
    /// Anything the contract reported that we don't understand.
    Unknown(String),
}

impl From<String> for PledgeState {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "Pledged" | "0" => Self::Pledged,
            "Paying" | "1" => Self::Paying,
            "Paid" | "2" => Self::Paid,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<PledgeState> for String {
    fn from(state: PledgeState) -> Self {
        state.as_str().to_string()
    }
}

impl PledgeState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pledged => "Pledged",
            Self::Paying => "Paying",
            Self::Paid => "Paid",
            Self::Unknown(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdminType {
    Giver,
    #[serde(rename = "DAC")]
    Dac,
    Campaign,
    Milestone,
}

impl AdminType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Giver => "giver",
            Self::Dac => "dac",
            Self::Campaign => "campaign",
            Self::Milestone => "milestone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pledge {
    pub id: u64,
    pub owner: u64,
    pub amount: Amount,
    pub pledge_state: PledgeState,
    pub delegates: Vec<u64>,
    pub intended_project: u64,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admin {
    pub id: u64,
    #[serde(rename = "type")]
    pub admin_type: AdminType,
    pub addr: String,
    pub parent_project: u64,
    pub is_canceled: bool,
}

/// The pledge/admin arrays as read from the contract at fetch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSnapshot")]
pub struct ChainSnapshot {
    pub pledges: Vec<Option<Pledge>>,
    pub admins: Vec<Option<Admin>>,
}

impl ChainSnapshot {
    pub fn pledge(&self, id: u64) -> Result<&Pledge> {
        slot(&self.pledges, id).ok_or(ReconcileError::MissingPledge(id))
    }

    pub fn admin(&self, id: u64) -> Result<&Admin> {
        slot(&self.admins, id).ok_or(ReconcileError::MissingAdmin(id))
    }

    pub fn admin_mut(&mut self, id: u64) -> Result<&mut Admin> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.admins.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or(ReconcileError::MissingAdmin(id))
    }

    /// Owner admin of a pledge.
    pub fn owner_of(&self, pledge_id: u64) -> Result<&Admin> {
        let pledge = self.pledge(pledge_id)?;
        self.admin(pledge.owner)
    }

    /// A snapshot with no real pledges or admins is treated as a failed
    /// fetch by the chain source.
    pub fn is_populated(&self) -> bool {
        self.pledges.len() > 1 && self.admins.len() > 1
    }
}

fn slot<T>(items: &[Option<T>], id: u64) -> Option<&T> {
    usize::try_from(id)
        .ok()
        .and_then(|i| items.get(i))
        .and_then(Option::as_ref)
}

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    pledges: Vec<Option<RawPledge>>,
    #[serde(default)]
    admins: Vec<Option<RawAdmin>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPledge {
    amount: Amount,
    #[serde(deserialize_with = "de_id")]
    owner: u64,
    pledge_state: PledgeState,
    #[serde(default)]
    delegates: Vec<DelegateRef>,
    #[serde(default, deserialize_with = "de_id")]
    intended_project: u64,
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DelegateRef {
    Object { id: Amount },
    Bare(Amount),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAdmin {
    #[serde(rename = "type")]
    admin_type: String,
    #[serde(default)]
    addr: String,
    #[serde(default, deserialize_with = "de_id")]
    parent_project: u64,
    #[serde(default)]
    is_canceled: bool,
    #[serde(default)]
    canceled: bool,
}

impl From<RawSnapshot> for ChainSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let pledges = raw
            .pledges
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                p.map(|p| Pledge {
                    id: i as u64,
                    owner: p.owner,
                    amount: p.amount,
                    pledge_state: p.pledge_state,
                    delegates: p
                        .delegates
                        .into_iter()
                        .filter_map(|d| match d {
                            DelegateRef::Object { id } | DelegateRef::Bare(id) => id.to_u64(),
                        })
                        .collect(),
                    intended_project: p.intended_project,
                    token: p.token,
                })
            })
            .collect();

        let admins = raw
            .admins
            .into_iter()
            .enumerate()
            .map(|(i, a)| {
                a.map(|a| {
                    let admin_type = match a.admin_type.as_str() {
                        "Giver" => AdminType::Giver,
                        "DAC" | "Delegate" => AdminType::Dac,
                        "Milestone" => AdminType::Milestone,
                        "Campaign" => AdminType::Campaign,
                        // A project with a parent is a milestone under a campaign.
                        _ if a.parent_project != NO_ID => AdminType::Milestone,
                        _ => AdminType::Campaign,
                    };
                    Admin {
                        id: i as u64,
                        admin_type,
                        addr: a.addr,
                        parent_project: a.parent_project,
                        is_canceled: a.is_canceled || a.canceled,
                    }
                })
            })
            .collect();

        Self { pledges, admins }
    }
}

/// Accept ids as JSON numbers or decimal strings.
pub(crate) fn de_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u64, D::Error> {
    let amount = Amount::deserialize(deserializer)?;
    amount
        .to_u64()
        .ok_or_else(|| serde::de::Error::custom(format!("id {amount} does not fit in u64")))
}
