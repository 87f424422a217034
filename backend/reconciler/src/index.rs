//! Read-only lookups derived from the chain snapshot once per run.

use std::collections::BTreeMap;

use crate::chain::{ChainSnapshot, NO_ID};

#[derive(Debug, Clone, Default)]
pub struct PledgeIndex {
    owner_pledges: BTreeMap<u64, Vec<u64>>,
    project_children: BTreeMap<u64, Vec<u64>>,
}

impl PledgeIndex {
    pub fn build(chain: &ChainSnapshot) -> Self {
        let mut index = Self::default();
        for pledge in chain.pledges.iter().flatten() {
            index
                .owner_pledges
                .entry(pledge.owner)
                .or_default()
                .push(pledge.id);
        }
        for admin in chain.admins.iter().flatten() {
            if admin.parent_project != NO_ID {
                index
                    .project_children
                    .entry(admin.parent_project)
                    .or_default()
                    .push(admin.id);
            }
        }
        index
    }

    /// Pledges owned by an admin, in id order.
    pub fn pledges_of(&self, owner: u64) -> &[u64] {
        self.owner_pledges
            .get(&owner)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Admins whose parent project is `project`; one level only.
    pub fn children_of(&self, project: u64) -> &[u64] {
        self.project_children
            .get(&project)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::{admin, pledge, snapshot};
    use crate::chain::{AdminType, PledgeState};

    #[test]
    fn groups_pledges_and_children() {
        let chain = snapshot(
            vec![
                pledge(1, 1, 10, PledgeState::Pledged),
                pledge(2, 3, 10, PledgeState::Pledged),
                pledge(3, 1, 10, PledgeState::Paid),
            ],
            vec![
                admin(1, AdminType::Giver, 0),
                admin(3, AdminType::Campaign, 0),
                admin(4, AdminType::Milestone, 3),
                admin(5, AdminType::Milestone, 4),
            ],
        );
        let index = PledgeIndex::build(&chain);
        assert_eq!(index.pledges_of(1), &[1, 3]);
        assert_eq!(index.pledges_of(3), &[2]);
        assert!(index.pledges_of(9).is_empty());
        assert_eq!(index.children_of(3), &[4]);
        assert_eq!(index.children_of(4), &[5]);
        assert!(index.children_of(1).is_empty());
    }
}
