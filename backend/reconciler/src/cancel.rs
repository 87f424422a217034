//! `CancelProject` handling.
//!
//! Cancellation only flags admins. Money held by a canceled project stays
//! where it is until later transfers move it; detection reports it.

use tracing::info;

use crate::chain::ChainSnapshot;
use crate::errors::Result;
use crate::index::PledgeIndex;

/// Mark `project` and its direct children canceled. Grandchildren are not
/// visited. Returns the ids that were flagged.
pub fn cancel_project(
    project: u64,
    chain: &mut ChainSnapshot,
    index: &PledgeIndex,
) -> Result<Vec<u64>> {
    chain.admin_mut(project)?.is_canceled = true;
    let mut canceled = vec![project];
    for child in index.children_of(project) {
        chain.admin_mut(*child)?.is_canceled = true;
        canceled.push(*child);
    }
    info!("Project {project} canceled (admins {canceled:?})");
    Ok(canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::{admin, snapshot};
    use crate::chain::AdminType;
    use crate::errors::ReconcileError;

    #[test]
    fn cancels_project_and_direct_children_only() {
        let mut chain = snapshot(
            vec![],
            vec![
                admin(3, AdminType::Campaign, 0),
                admin(9, AdminType::Milestone, 3),
                admin(10, AdminType::Milestone, 9),
                admin(11, AdminType::Campaign, 0),
            ],
        );
        let index = PledgeIndex::build(&chain);

        let canceled = cancel_project(3, &mut chain, &index).unwrap();
        assert_eq!(canceled, vec![3, 9]);
        assert!(chain.admin(3).unwrap().is_canceled);
        assert!(chain.admin(9).unwrap().is_canceled);
        assert!(!chain.admin(10).unwrap().is_canceled);
        assert!(!chain.admin(11).unwrap().is_canceled);
    }

    #[test]
    fn unknown_project_is_fatal() {
        let mut chain = snapshot(vec![], vec![admin(3, AdminType::Campaign, 0)]);
        let index = PledgeIndex::build(&chain);
        assert!(matches!(
            cancel_project(8, &mut chain, &index),
            Err(ReconcileError::MissingAdmin(8))
        ));
    }
}
