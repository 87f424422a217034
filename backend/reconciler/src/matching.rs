//! Transfer replay: find the record a transfer fills, charge the money from
//! the suppliers at the source pledge, and credit it at the destination.
//!
//! Destination matching runs before any money moves and tries, in order:
//!
//! 1. **refill**: an unfilled record at `to` from the same transaction;
//! 2. **failed retry**: a record parked in the failed bucket (pledge 0) with
//!    the same transaction and amount whose first parent sits at `from`.
//!    It never failed and is moved to `to`.
//!
//! With no match a new record is synthesized.

use tracing::{debug, warn};

use crate::cancel;
use crate::chain::{AdminType, ChainSnapshot, NO_ID};
use crate::config::ParentPolicy;
use crate::donation::{DonationId, DonationItem, DonationStatus};
use crate::errors::{ReconcileError, Result};
use crate::events::TransferEvent;
use crate::index::PledgeIndex;
use crate::repair::RepairWriter;
use crate::report::{rfc3339, Correction};
use crate::state::{ReplayState, Slot};
use crate::status::expected_status;
use crate::tokens::TokenRegistry;

/// What the outflow side of a transfer produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargeOutcome {
    /// Ids of the records the money was taken from.
    pub used_parents: Vec<DonationId>,
    /// Always `false`: cancellation does not reverse funds.
    pub ignored: bool,
    /// First giver address found among the suppliers.
    pub giver_address: Option<String>,
}

/// Result of a full replay, handed to detection.
#[derive(Debug)]
pub struct Replayed {
    pub chain: ChainSnapshot,
    pub state: ReplayState,
    pub corrections: Vec<Correction>,
}

pub struct Replayer<'a> {
    chain: ChainSnapshot,
    state: ReplayState,
    index: &'a PledgeIndex,
    tokens: &'a TokenRegistry,
    writer: &'a RepairWriter,
    policy: ParentPolicy,
    corrections: Vec<Correction>,
}

impl<'a> Replayer<'a> {
    pub fn new(
        chain: ChainSnapshot,
        state: ReplayState,
        index: &'a PledgeIndex,
        tokens: &'a TokenRegistry,
        writer: &'a RepairWriter,
        policy: ParentPolicy,
    ) -> Self {
        Self {
            chain,
            state,
            index,
            tokens,
            writer,
            policy,
            corrections: Vec::new(),
        }
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn corrections(&self) -> &[Correction] {
        &self.corrections
    }

    pub fn finish(self) -> Replayed {
        Replayed {
            chain: self.chain,
            state: self.state,
            corrections: self.corrections,
        }
    }

    pub fn cancel_project(&mut self, project: u64) -> Result<()> {
        cancel::cancel_project(project, &mut self.chain, self.index)?;
        Ok(())
    }

    pub async fn apply_transfer(&mut self, event: &TransferEvent) -> Result<ChargeOutcome> {
        debug!(
            "Transfer {} -> {} of {} (tx {} #{})",
            event.from, event.to, event.amount, event.tx_hash, event.log_index
        );
        self.chain.pledge(event.to)?;
        if event.from != NO_ID {
            self.chain.pledge(event.from)?;
        }

        let candidate = self.match_destination(event).await?;
        let outcome = self.outflow(event, candidate)?;
        if !outcome.ignored {
            match candidate {
                Some(slot) => self.refill(event, slot, &outcome).await?,
                None => self.create(event, &outcome).await?,
            }
        }
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────
    // Destination matching
    // ─────────────────────────────────────────────────────

    async fn match_destination(&mut self, event: &TransferEvent) -> Result<Option<Slot>> {
        if let Some(slot) = self.find_refill(event) {
            return Ok(Some(slot));
        }
        if event.from == NO_ID {
            return Ok(None);
        }
        match self.find_failed_retry(event) {
            Some(slot) => {
                self.unfail(event, slot).await?;
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    fn find_refill(&self, event: &TransferEvent) -> Option<Slot> {
        self.state.not_filled(event.to).iter().copied().find(|slot| {
            let item = self.state.item(*slot);
            item.tx_hash == event.tx_hash
                && item.amount_remaining.is_zero()
                && match self.policy {
                    ParentPolicy::Replay => true,
                    // Stored parents are charged as-is, so they must fit the transfer.
                    ParentPolicy::Stored => {
                        item.parent_donations.is_empty() == (event.from == NO_ID)
                    }
                }
        })
    }

    fn find_failed_retry(&self, event: &TransferEvent) -> Option<Slot> {
        self.state.not_filled(NO_ID).iter().copied().find(|slot| {
            let item = self.state.item(*slot);
            item.tx_hash == event.tx_hash
                && item.amount == event.amount
                && item
                    .parent_donations
                    .first()
                    .and_then(|parent| self.state.by_id(*parent))
                    .is_some_and(|parent| parent.pledge_id == event.from)
        })
    }

    async fn unfail(&mut self, event: &TransferEvent, slot: Slot) -> Result<()> {
        let status = expected_status(&self.chain, event.to)?;
        self.state.take_not_filled(NO_ID, slot);
        let item = self.state.item_mut(slot);
        item.status = status;
        item.pledge_id = event.to;
        item.mined = true;
        let id = item.id;
        self.state.push_not_filled(event.to, slot);

        if let Some(id) = id {
            warn!("Donation {id} hasn't failed, moving it to pledge {}", event.to);
            self.record(Correction::Unfailed {
                id,
                pledge_id: event.to,
                status,
                tx_hash: event.tx_hash.clone(),
            })
            .await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Outflow
    // ─────────────────────────────────────────────────────

    fn outflow(&mut self, event: &TransferEvent, candidate: Option<Slot>) -> Result<ChargeOutcome> {
        if event.from == NO_ID {
            return Ok(ChargeOutcome::default());
        }

        let stored_parents = match (self.policy, candidate) {
            (ParentPolicy::Stored, Some(slot)) => {
                Some(self.state.item(slot).parent_donations.clone()).filter(|p| !p.is_empty())
            }
            _ => None,
        };

        let drain = match stored_parents {
            Some(parents) => self.state.drain_parents(event.from, &parents, &event.amount)?,
            None => {
                if self.state.charged(event.from).is_empty() {
                    return Err(ReconcileError::NoSupplier {
                        from: event.from,
                        to: event.to,
                        tx_hash: event.tx_hash.clone(),
                    });
                }
                self.state.drain_fifo(event.from, &event.amount)
            }
        };

        if !drain.uncovered.is_zero() {
            return Err(ReconcileError::Deficit {
                pledge: event.from,
                missing: drain.uncovered,
                tx_hash: event.tx_hash.clone(),
            });
        }
        debug!("Charged {} from {:?} at pledge {}", event.amount, drain.used, event.from);

        Ok(ChargeOutcome {
            used_parents: drain.used,
            ignored: false,
            giver_address: drain.giver_address,
        })
    }

    // ─────────────────────────────────────────────────────
    // Inflow
    // ─────────────────────────────────────────────────────

    async fn refill(
        &mut self,
        event: &TransferEvent,
        slot: Slot,
        outcome: &ChargeOutcome,
    ) -> Result<()> {
        let expected = expected_status(&self.chain, event.to)?;
        self.state.take_not_filled(event.to, slot);

        let policy = self.policy;
        let item = self.state.item_mut(slot);
        let mut found = Vec::new();
        if let Some(id) = item.id {
            if !item.mined {
                found.push(Correction::Mined { id });
            }
            if policy == ParentPolicy::Replay
                && parents_differ(&item.parent_donations, &outcome.used_parents)
            {
                found.push(Correction::Parents {
                    id,
                    stored: item.parent_donations.clone(),
                    replayed: outcome.used_parents.clone(),
                });
                item.parent_donations = outcome.used_parents.clone();
            }
            // Other statuses may still change with later events.
            let rewritable = item.status.is_settled()
                || matches!(expected, DonationStatus::Paying | DonationStatus::Paid);
            if rewritable && item.status != expected {
                found.push(Correction::Status {
                    id,
                    stored: item.status,
                    expected,
                });
                item.status = expected;
            }
        }
        item.mined = true;
        item.amount_remaining = event.amount.clone();
        item.pledge_id = event.to;
        self.state.push_charged(event.to, slot);

        for correction in found {
            self.record(correction).await?;
        }
        Ok(())
    }

    async fn create(&mut self, event: &TransferEvent, outcome: &ChargeOutcome) -> Result<()> {
        let status = expected_status(&self.chain, event.to)?;
        let pledge = self.chain.pledge(event.to)?;
        let owner = self.chain.owner_of(event.to)?;

        let giver_address = outcome
            .giver_address
            .clone()
            .or_else(|| (owner.admin_type == AdminType::Giver).then(|| owner.addr.clone()));
        if giver_address.is_none() && self.writer.applies() {
            return Err(ReconcileError::GiverAddressUnresolved(event.to));
        }

        let mut item = DonationItem {
            id: None,
            amount: event.amount.clone(),
            amount_remaining: event.amount.clone(),
            saved_amount_remaining: None,
            pledge_id: event.to,
            status,
            mined: true,
            tx_hash: event.tx_hash.clone(),
            parent_donations: outcome.used_parents.clone(),
            owner_id: pledge.owner,
            giver_address,
            token_symbol: self.tokens.by_address(&pledge.token).ok().map(|t| t.symbol.clone()),
            created_at: event.timestamp.unwrap_or_default(),
        };

        let id = self
            .writer
            .create_donation(&self.chain, self.tokens, event, &item)
            .await?;
        match id {
            Some(id) => {
                item.id = Some(id);
                item.saved_amount_remaining = Some(item.amount_remaining.clone());
                warn!("Donation {id} created at pledge {} for tx {}", event.to, event.tx_hash);
            }
            None => warn!(
                "A donation of {} should be created at pledge {} for tx {}",
                event.amount, event.to, event.tx_hash
            ),
        }

        self.corrections.push(Correction::Created {
            id: item.id,
            pledge_id: item.pledge_id,
            tx_hash: item.tx_hash.clone(),
            amount: item.amount.clone(),
            status: item.status,
            parent_donations: item.parent_donations.clone(),
            giver_address: item.giver_address.clone(),
            token_symbol: item.token_symbol.clone(),
            created_at: event.timestamp.and_then(rfc3339),
        });
        let slot = self.state.insert(item);
        self.state.push_charged(event.to, slot);
        Ok(())
    }

    /// Log a replay-time finding, write it through, and keep it for the
    /// report.
    async fn record(&mut self, correction: Correction) -> Result<()> {
        match &correction {
            Correction::Unfailed {
                id,
                pledge_id,
                status,
                ..
            } => self.writer.relocate(*id, *pledge_id, *status).await?,
            Correction::Mined { id } => {
                warn!("Donation {id} mined flag should be true");
                self.writer.set_mined(*id).await?
            }
            Correction::Parents { id, replayed, .. } => {
                warn!("Parent of {id} should be updated to {replayed:?}");
                self.writer.set_parents(*id, replayed).await?
            }
            Correction::Status { id, stored, expected } => {
                warn!(
                    "Donation {id} status is {}, but should be {}",
                    stored.as_str(),
                    expected.as_str()
                );
                self.writer.set_status(*id, *expected).await?
            }
            Correction::Created { .. } => {}
        }
        self.corrections.push(correction);
        Ok(())
    }
}

fn parents_differ(stored: &[DonationId], used: &[DonationId]) -> bool {
    stored.len() != used.len() || used.iter().any(|p| !stored.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::chain::tests::{admin, pledge, snapshot};
    use crate::chain::PledgeState;
    use crate::db::{self, tests::{memory_pool, new_donation}};
    use crate::donation::DonationRecord;
    use crate::state::tests::record;
    use crate::tokens::tests::registry;

    /// Giver 1, delegate 2, campaign 3 with milestone 4.
    /// Pledge 5 is the giver's, 7 the campaign's, 8 a paid milestone pledge.
    fn chain() -> ChainSnapshot {
        snapshot(
            vec![
                pledge(5, 1, 60, PledgeState::Pledged),
                pledge(7, 3, 40, PledgeState::Pledged),
                pledge(8, 4, 100, PledgeState::Paid),
            ],
            vec![
                admin(1, AdminType::Giver, 0),
                admin(2, AdminType::Dac, 0),
                admin(3, AdminType::Campaign, 0),
                admin(4, AdminType::Milestone, 3),
            ],
        )
    }

    fn transfer(from: u64, to: u64, amount: u64, tx_hash: &str) -> TransferEvent {
        TransferEvent {
            from,
            to,
            amount: Amount::from(amount),
            tx_hash: tx_hash.to_string(),
            log_index: 0,
            block_number: 10,
            timestamp: Some(1_600_000_100),
        }
    }

    fn with_parents(mut r: DonationRecord, parents: Vec<DonationId>) -> DonationRecord {
        r.parent_donations = parents;
        r
    }

    async fn replay(
        records: Vec<DonationRecord>,
        events: &[TransferEvent],
        policy: ParentPolicy,
    ) -> Result<Replayed> {
        let chain = chain();
        let index = PledgeIndex::build(&chain);
        let tokens = registry();
        let writer = RepairWriter::new(memory_pool().await, false, 1);
        let mut replayer = Replayer::new(
            chain,
            ReplayState::from_records(records),
            &index,
            &tokens,
            &writer,
            policy,
        );
        for event in events {
            replayer.apply_transfer(event).await?;
        }
        Ok(replayer.finish())
    }

    fn remaining(replayed: &Replayed, id: DonationId) -> Amount {
        replayed.state.by_id(id).unwrap().amount_remaining.clone()
    }

    #[tokio::test]
    async fn unmatched_giver_transfer_synthesizes_a_record() {
        let replayed = replay(vec![], &[transfer(0, 5, 100, "0xa")], ParentPolicy::Replay)
            .await
            .unwrap();

        let slots = replayed.state.charged(5);
        assert_eq!(slots.len(), 1);
        let item = replayed.state.item(slots[0]);
        assert_eq!(item.id, None);
        assert_eq!(item.amount_remaining, Amount::from(100));
        assert_eq!(item.status, DonationStatus::Waiting);
        assert_eq!(item.giver_address.as_deref(), Some("0xadmin1"));
        assert_eq!(item.token_symbol.as_deref(), Some("ETH"));
        assert!(matches!(
            replayed.corrections.as_slice(),
            [Correction::Created { id: None, pledge_id: 5, .. }]
        ));
    }

    #[tokio::test]
    async fn partial_transfer_leaves_remainder_with_supplier() {
        let records = vec![
            record(1, 5, "0xa", 100),
            with_parents(record(2, 7, "0xb", 40), vec![1]),
        ];
        let chain = chain();
        let index = PledgeIndex::build(&chain);
        let tokens = registry();
        let writer = RepairWriter::new(memory_pool().await, false, 1);
        let mut replayer = Replayer::new(
            chain,
            ReplayState::from_records(records),
            &index,
            &tokens,
            &writer,
            ParentPolicy::Replay,
        );

        let first = replayer.apply_transfer(&transfer(0, 5, 100, "0xa")).await.unwrap();
        assert_eq!(first, ChargeOutcome::default());
        let second = replayer.apply_transfer(&transfer(5, 7, 40, "0xb")).await.unwrap();
        assert_eq!(second.used_parents, vec![1]);
        assert_eq!(second.giver_address.as_deref(), Some("0xgiver"));

        assert_eq!(replayer.state().balance(5), Amount::from(60));
        assert_eq!(replayer.state().balance(7), Amount::from(40));
        // Waiting -> Committed is not a settled change, so nothing is corrected.
        assert!(replayer.corrections().is_empty());
    }

    #[tokio::test]
    async fn transfer_without_suppliers_is_fatal() {
        let err = replay(vec![], &[transfer(5, 7, 40, "0xb")], ParentPolicy::Replay)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NoSupplier { from: 5, to: 7, .. }));
    }

    #[tokio::test]
    async fn uncovered_outflow_is_fatal() {
        let err = replay(
            vec![],
            &[transfer(0, 5, 30, "0xa"), transfer(5, 7, 40, "0xb")],
            ParentPolicy::Replay,
        )
        .await
        .unwrap_err();
        match err {
            ReconcileError::Deficit { pledge, missing, .. } => {
                assert_eq!(pledge, 5);
                assert_eq!(missing, Amount::from(10));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn failed_record_that_succeeded_is_moved_back() {
        let pool = memory_pool().await;
        let source = db::insert_donation(&pool, &new_donation(5, "0xa", 100)).await.unwrap();
        let mut failed = new_donation(0, "0xb", 40);
        failed.status = DonationStatus::Failed;
        failed.parent_donations = vec![source];
        failed.created_at += 1;
        let failed = db::insert_donation(&pool, &failed).await.unwrap();

        let chain = chain();
        let index = PledgeIndex::build(&chain);
        let tokens = registry();
        let writer = RepairWriter::new(pool.clone(), true, 1);
        let mut replayer = Replayer::new(
            chain,
            ReplayState::from_records(db::list_donations(&pool).await.unwrap()),
            &index,
            &tokens,
            &writer,
            ParentPolicy::Replay,
        );
        replayer.apply_transfer(&transfer(0, 5, 100, "0xa")).await.unwrap();
        replayer.apply_transfer(&transfer(5, 7, 40, "0xb")).await.unwrap();

        assert_eq!(
            replayer.corrections(),
            &[Correction::Unfailed {
                id: failed,
                pledge_id: 7,
                status: DonationStatus::Committed,
                tx_hash: "0xb".into(),
            }]
        );
        let item = replayer.state().by_id(failed).unwrap();
        assert_eq!(item.pledge_id, 7);
        assert_eq!(item.amount_remaining, Amount::from(40));
        assert!(replayer.state().not_filled(0).is_empty());

        let stored = db::find_donation(&pool, failed).await.unwrap().unwrap();
        assert_eq!(stored.pledge_id, 7);
        assert_eq!(stored.status, DonationStatus::Committed);
    }

    #[tokio::test]
    async fn stored_policy_charges_recorded_parents() {
        let records = vec![
            record(1, 5, "0xa", 50),
            record(2, 5, "0xb", 50),
            with_parents(record(3, 7, "0xc", 30), vec![2]),
        ];
        let events = [
            transfer(0, 5, 50, "0xa"),
            transfer(0, 5, 50, "0xb"),
            transfer(5, 7, 30, "0xc"),
        ];

        let stored = replay(records.clone(), &events, ParentPolicy::Stored).await.unwrap();
        assert_eq!(remaining(&stored, 1), Amount::from(50));
        assert_eq!(remaining(&stored, 2), Amount::from(20));
        assert!(stored.corrections.is_empty());

        let fifo = replay(records, &events, ParentPolicy::Replay).await.unwrap();
        assert_eq!(remaining(&fifo, 1), Amount::from(20));
        assert_eq!(remaining(&fifo, 2), Amount::from(50));
        assert_eq!(
            fifo.corrections,
            vec![Correction::Parents {
                id: 3,
                stored: vec![2],
                replayed: vec![1],
            }]
        );
    }

    #[tokio::test]
    async fn stored_policy_missing_parent_is_fatal() {
        let records = vec![
            record(1, 5, "0xa", 50),
            with_parents(record(3, 7, "0xc", 30), vec![9]),
        ];
        let events = [transfer(0, 5, 50, "0xa"), transfer(5, 7, 30, "0xc")];
        let err = replay(records, &events, ParentPolicy::Stored).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingParent { parent: 9, pledge: 5 }));
    }

    #[tokio::test]
    async fn paid_destination_rewrites_status_and_mined() {
        let mut paid = with_parents(record(2, 8, "0xb", 100), vec![1]);
        paid.mined = false;
        let records = vec![record(1, 5, "0xa", 100), paid];
        let events = [transfer(0, 5, 100, "0xa"), transfer(5, 8, 100, "0xb")];

        let replayed = replay(records, &events, ParentPolicy::Replay).await.unwrap();
        assert_eq!(
            replayed.corrections,
            vec![
                Correction::Mined { id: 2 },
                Correction::Status {
                    id: 2,
                    stored: DonationStatus::Waiting,
                    expected: DonationStatus::Paid,
                },
            ]
        );
        let item = replayed.state.by_id(2).unwrap();
        assert!(item.mined);
        assert_eq!(item.status, DonationStatus::Paid);
    }

    #[tokio::test]
    async fn apply_mode_persists_created_records() {
        let pool = memory_pool().await;
        let chain = chain();
        let index = PledgeIndex::build(&chain);
        let tokens = registry();
        let writer = RepairWriter::new(pool.clone(), true, 1);
        let mut replayer = Replayer::new(
            chain,
            ReplayState::default(),
            &index,
            &tokens,
            &writer,
            ParentPolicy::Replay,
        );

        replayer.apply_transfer(&transfer(0, 5, 100, "0xa")).await.unwrap();
        let Correction::Created { id: Some(id), .. } = replayer.corrections()[0].clone() else {
            panic!("expected a created record");
        };
        db::insert_pledge_admin(
            &pool,
            &db::PledgeAdminRow {
                id: 3,
                admin_type: "campaign".into(),
                type_id: "campaign-3".into(),
            },
        )
        .await
        .unwrap();
        let outcome = replayer.apply_transfer(&transfer(5, 7, 40, "0xb")).await.unwrap();
        assert_eq!(outcome.used_parents, vec![id]);
        assert_eq!(outcome.giver_address.as_deref(), Some("0xadmin1"));

        let rows = db::list_donations(&pool).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].parent_donations, vec![id]);
        assert_eq!(rows[1].giver_address.as_deref(), Some("0xadmin1"));
        assert_eq!(rows[1].status, DonationStatus::Committed);
    }

    #[tokio::test]
    async fn apply_mode_needs_a_giver_address() {
        let pool = memory_pool().await;
        let chain = chain();
        let index = PledgeIndex::build(&chain);
        let tokens = registry();
        let writer = RepairWriter::new(pool, true, 1);
        let mut replayer = Replayer::new(
            chain,
            ReplayState::default(),
            &index,
            &tokens,
            &writer,
            ParentPolicy::Replay,
        );

        assert!(matches!(
            replayer.apply_transfer(&transfer(0, 7, 10, "0xa")).await,
            Err(ReconcileError::GiverAddressUnresolved(7))
        ));
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let records = vec![
            record(1, 5, "0xa", 100),
            record(2, 5, "0xa", 100),
            with_parents(record(3, 7, "0xc", 30), vec![2]),
        ];
        let events = [
            transfer(0, 5, 100, "0xa"),
            transfer(0, 5, 100, "0xa"),
            transfer(5, 7, 30, "0xc"),
            transfer(0, 5, 5, "0xd"),
        ];
        let a = replay(records.clone(), &events, ParentPolicy::Replay).await.unwrap();
        let b = replay(records, &events, ParentPolicy::Replay).await.unwrap();
        assert_eq!(a.state.items(), b.state.items());
        assert_eq!(a.corrections, b.corrections);
        // Identical candidates are filled in load order.
        assert_eq!(remaining(&a, 1), Amount::from(70));
        assert_eq!(remaining(&a, 2), Amount::from(100));
    }
}
