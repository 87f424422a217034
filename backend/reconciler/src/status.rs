//! Mapping from chain pledge state to the donation status the ledger should
//! show.

use crate::chain::{AdminType, ChainSnapshot, PledgeState, NO_ID};
use crate::donation::DonationStatus;
use crate::errors::{ReconcileError, Result};

/// Status a donation sitting at a pledge with the given shape should have.
///
/// Returns `None` for a state we don't recognise.
pub fn status_of(
    state: &PledgeState,
    delegates: &[u64],
    intended_project: u64,
    owner_type: AdminType,
) -> Option<DonationStatus> {
    match state {
        PledgeState::Paying => Some(DonationStatus::Paying),
        PledgeState::Paid => Some(DonationStatus::Paid),
        PledgeState::Pledged => {
            if intended_project != NO_ID {
                Some(DonationStatus::ToApprove)
            } else if owner_type == AdminType::Giver || !delegates.is_empty() {
                Some(DonationStatus::Waiting)
            } else {
                Some(DonationStatus::Committed)
            }
        }
        PledgeState::Unknown(_) => None,
    }
}

/// [`status_of`] for a pledge in the snapshot; an unknown state is fatal.
pub fn expected_status(chain: &ChainSnapshot, pledge_id: u64) -> Result<DonationStatus> {
    let pledge = chain.pledge(pledge_id)?;
    let owner = chain.admin(pledge.owner)?;
    status_of(
        &pledge.pledge_state,
        &pledge.delegates,
        pledge.intended_project,
        owner.admin_type,
    )
    .ok_or_else(|| ReconcileError::UnknownPledgeState {
        pledge: pledge_id,
        state: pledge.pledge_state.as_str().to_string(),
    })
}
