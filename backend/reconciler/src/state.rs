//! Mutable replay state: every donation item plus the per-pledge buckets
//! replay moves them between.
//!
//! Items live in one arena and buckets hold slots into it, so an item can
//! be found by id, sit in a bucket, and be charged without aliasing.

use std::collections::{BTreeMap, HashMap};

use crate::amount::Amount;
use crate::donation::{DonationId, DonationItem, DonationRecord};
use crate::errors::{ReconcileError, Result};

/// Position of an item in the arena.
pub type Slot = usize;

/// What a charge took from the suppliers of a pledge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drain {
    /// Ids of the suppliers that gave money, in charge order.
    pub used: Vec<DonationId>,
    /// First non-empty giver address among the suppliers.
    pub giver_address: Option<String>,
    /// Part of the requested amount nobody could cover.
    pub uncovered: Amount,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayState {
    items: Vec<DonationItem>,
    /// Stored records that no replayed transfer has filled yet.
    not_filled: BTreeMap<u64, Vec<Slot>>,
    /// Items currently holding replayed money at a pledge, oldest first.
    charged: BTreeMap<u64, Vec<Slot>>,
    by_id: HashMap<DonationId, Slot>,
}

impl ReplayState {
    /// Load stored records, in store order, into the not-filled bucket of
    /// their pledge with a replayed balance of zero.
    pub fn from_records(records: Vec<DonationRecord>) -> Self {
        let mut state = Self::default();
        for record in records {
            let item = DonationItem::from(record);
            let pledge = item.pledge_id;
            let slot = state.insert(item);
            state.push_not_filled(pledge, slot);
        }
        state
    }

    /// Add an item to the arena without placing it in a bucket.
    pub fn insert(&mut self, item: DonationItem) -> Slot {
        let slot = self.items.len();
        if let Some(id) = item.id {
            self.by_id.insert(id, slot);
        }
        self.items.push(item);
        slot
    }

    pub fn items(&self) -> &[DonationItem] {
        &self.items
    }

    pub fn item(&self, slot: Slot) -> &DonationItem {
        &self.items[slot]
    }

    pub fn item_mut(&mut self, slot: Slot) -> &mut DonationItem {
        &mut self.items[slot]
    }

    pub fn by_id(&self, id: DonationId) -> Option<&DonationItem> {
        self.by_id.get(&id).map(|slot| &self.items[*slot])
    }

    pub fn not_filled(&self, pledge: u64) -> &[Slot] {
        self.not_filled
            .get(&pledge)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn charged(&self, pledge: u64) -> &[Slot] {
        self.charged.get(&pledge).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Not-filled buckets in ascending pledge order.
    pub fn not_filled_buckets(&self) -> impl Iterator<Item = (u64, &[Slot])> {
        self.not_filled.iter().map(|(p, s)| (*p, s.as_slice()))
    }

    /// Charged buckets in ascending pledge order.
    pub fn charged_buckets(&self) -> impl Iterator<Item = (u64, &[Slot])> {
        self.charged.iter().map(|(p, s)| (*p, s.as_slice()))
    }

    pub fn push_not_filled(&mut self, pledge: u64, slot: Slot) {
        self.not_filled.entry(pledge).or_default().push(slot);
    }

    pub fn push_charged(&mut self, pledge: u64, slot: Slot) {
        self.charged.entry(pledge).or_default().push(slot);
    }

    /// Take `slot` out of the not-filled bucket of `pledge`. Returns `false`
    /// when it wasn't there.
    pub fn take_not_filled(&mut self, pledge: u64, slot: Slot) -> bool {
        let Some(bucket) = self.not_filled.get_mut(&pledge) else {
            return false;
        };
        match bucket.iter().position(|s| *s == slot) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Sum of replayed balances held at a pledge.
    pub fn balance(&self, pledge: u64) -> Amount {
        self.charged(pledge)
            .iter()
            .map(|slot| &self.items[*slot].amount_remaining)
            .sum()
    }

    /// Charge `amount` from the suppliers of `pledge`, oldest first.
    /// Drained suppliers leave the bucket.
    pub fn drain_fifo(&mut self, pledge: u64, amount: &Amount) -> Drain {
        let mut drain = Drain {
            uncovered: amount.clone(),
            ..Drain::default()
        };
        let Some(suppliers) = self.charged.get_mut(&pledge) else {
            return drain;
        };
        for slot in suppliers.iter() {
            if drain.uncovered.is_zero() {
                break;
            }
            take(&mut self.items[*slot], &mut drain);
        }
        suppliers.retain(|slot| !self.items[*slot].amount_remaining.is_zero());
        drain
    }

    /// Charge `amount` from exactly the listed suppliers of `pledge`, in
    /// the order given. A listed parent that holds nothing at `pledge` is
    /// fatal once money is still owed.
    pub fn drain_parents(
        &mut self,
        pledge: u64,
        parents: &[DonationId],
        amount: &Amount,
    ) -> Result<Drain> {
        let mut drain = Drain {
            uncovered: amount.clone(),
            ..Drain::default()
        };
        let suppliers = self.charged.entry(pledge).or_default();
        for parent in parents {
            if drain.uncovered.is_zero() {
                break;
            }
            let pos = suppliers
                .iter()
                .position(|slot| self.items[*slot].id == Some(*parent))
                .ok_or(ReconcileError::MissingParent {
                    parent: *parent,
                    pledge,
                })?;
            let slot = suppliers[pos];
            take(&mut self.items[slot], &mut drain);
            if self.items[slot].amount_remaining.is_zero() {
                suppliers.remove(pos);
            }
        }
        Ok(drain)
    }
}

fn take(supplier: &mut DonationItem, drain: &mut Drain) {
    let moved = supplier
        .amount_remaining
        .clone()
        .min(drain.uncovered.clone());
    supplier.amount_remaining = supplier
        .amount_remaining
        .checked_sub(&moved)
        .unwrap_or_default();
    drain.uncovered = drain.uncovered.checked_sub(&moved).unwrap_or_default();
    if drain.giver_address.is_none() {
        drain.giver_address = supplier.giver_address.clone();
    }
    if let Some(id) = supplier.id {
        drain.used.push(id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::donation::DonationStatus;

    /// A stored record as the loader would read it.
    pub(crate) fn record(
        id: DonationId,
        pledge_id: u64,
        tx_hash: &str,
        amount: u64,
    ) -> DonationRecord {
        DonationRecord {
            id,
            amount: Amount::from(amount),
            amount_remaining: Amount::from(amount),
            pledge_id,
            status: DonationStatus::Waiting,
            mined: true,
            tx_hash: tx_hash.to_string(),
            parent_donations: vec![],
            owner_id: 1,
            owner_type: "giver".to_string(),
            owner_type_id: "0xgiver".to_string(),
            giver_address: Some("0xgiver".to_string()),
            token_symbol: "ETH".to_string(),
            intended_project_id: None,
            delegate_id: None,
            less_than_cutoff: false,
            is_return: false,
            created_at: 1_600_000_000 + id,
        }
    }

    fn charged_item(
        state: &mut ReplayState,
        id: DonationId,
        pledge: u64,
        remaining: u64,
        giver: Option<&str>,
    ) {
        let mut item = DonationItem::from(record(id, pledge, "0xa", remaining));
        item.amount_remaining = Amount::from(remaining);
        item.giver_address = giver.map(str::to_string);
        let slot = state.insert(item);
        state.push_charged(pledge, slot);
    }

    #[test]
    fn loads_records_into_not_filled_buckets() {
        let state = ReplayState::from_records(vec![
            record(1, 5, "0xa", 10),
            record(2, 0, "0xb", 4),
            record(3, 5, "0xc", 6),
        ]);
        assert_eq!(state.not_filled(5), &[0, 2]);
        assert_eq!(state.not_filled(0), &[1]);
        assert!(state.charged(5).is_empty());
        assert!(state.items().iter().all(|i| i.amount_remaining.is_zero()));
        assert_eq!(state.by_id(3).map(|i| i.pledge_id), Some(5));
    }

    #[test]
    fn fifo_drain_takes_oldest_first_and_drops_drained() {
        let mut state = ReplayState::default();
        charged_item(&mut state, 1, 5, 30, None);
        charged_item(&mut state, 2, 5, 50, Some("0xfirst"));
        charged_item(&mut state, 3, 5, 40, Some("0xsecond"));

        let drain = state.drain_fifo(5, &Amount::from(60));
        assert_eq!(drain.used, vec![1, 2]);
        assert_eq!(drain.giver_address.as_deref(), Some("0xfirst"));
        assert!(drain.uncovered.is_zero());
        assert_eq!(state.charged(5).len(), 2);
        assert_eq!(state.balance(5), Amount::from(60));
    }

    #[test]
    fn fifo_drain_reports_what_it_could_not_cover() {
        let mut state = ReplayState::default();
        charged_item(&mut state, 1, 5, 30, None);
        let drain = state.drain_fifo(5, &Amount::from(45));
        assert_eq!(drain.uncovered, Amount::from(15));
        assert!(state.charged(5).is_empty());
    }

    #[test]
    fn parent_drain_follows_recorded_order() {
        let mut state = ReplayState::default();
        charged_item(&mut state, 1, 5, 30, Some("0xone"));
        charged_item(&mut state, 2, 5, 50, Some("0xtwo"));

        let drain = state.drain_parents(5, &[2, 1], &Amount::from(60)).unwrap();
        assert_eq!(drain.used, vec![2, 1]);
        assert_eq!(drain.giver_address.as_deref(), Some("0xtwo"));
        assert_eq!(state.balance(5), Amount::from(20));

        assert!(matches!(
            state.drain_parents(5, &[9], &Amount::from(1)),
            Err(ReconcileError::MissingParent { parent: 9, pledge: 5 })
        ));
    }

    #[test]
    fn take_not_filled_removes_one_slot() {
        let mut state =
            ReplayState::from_records(vec![record(1, 5, "0xa", 10), record(2, 5, "0xa", 10)]);
        assert!(state.take_not_filled(5, 1));
        assert!(!state.take_not_filled(5, 1));
        assert_eq!(state.not_filled(5), &[0]);
    }
}
