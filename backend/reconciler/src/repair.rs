//! The only path by which the reconciler mutates the ledger store.
//!
//! Replay-time writes go out one at a time, in event order, because later
//! events depend on them (new record ids become parents). The end-of-run
//! deletes and balance fixes are independent of each other and are issued
//! with bounded concurrency.

use futures_util::{stream, StreamExt};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::chain::{AdminType, ChainSnapshot, NO_ID};
use crate::db::{self, PledgeAdminRow};
use crate::detect::Conflicts;
use crate::donation::{DonationId, DonationItem, DonationStatus, NewDonation};
use crate::errors::{ReconcileError, Result};
use crate::events::TransferEvent;
use crate::tokens::TokenRegistry;

/// Counts of end-of-run writes that changed a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub deleted: usize,
    pub updated: usize,
}

pub struct RepairWriter {
    pool: SqlitePool,
    apply: bool,
    concurrency: usize,
}

impl RepairWriter {
    pub fn new(pool: SqlitePool, apply: bool, concurrency: usize) -> Self {
        Self {
            pool,
            apply,
            concurrency: concurrency.max(1),
        }
    }

    /// `false` in report-only runs; every write below is then a no-op.
    pub fn applies(&self) -> bool {
        self.apply
    }

    pub async fn relocate(
        &self,
        id: DonationId,
        pledge_id: u64,
        status: DonationStatus,
    ) -> Result<()> {
        if self.apply {
            db::relocate_donation(&self.pool, id, pledge_id, status).await?;
        }
        Ok(())
    }

    pub async fn set_mined(&self, id: DonationId) -> Result<()> {
        if self.apply {
            db::set_mined(&self.pool, id).await?;
        }
        Ok(())
    }

    pub async fn set_parents(&self, id: DonationId, parents: &[DonationId]) -> Result<()> {
        if self.apply {
            db::set_parents(&self.pool, id, parents).await?;
        }
        Ok(())
    }

    pub async fn set_status(&self, id: DonationId, status: DonationStatus) -> Result<()> {
        if self.apply {
            db::set_status(&self.pool, id, status).await?;
        }
        Ok(())
    }

    /// Persist a record synthesized by replay and return its new id.
    ///
    /// Resolves the owner's pledge-admin row (creating it for givers), the
    /// delegate and intended-project rows, the token of the pledge and the
    /// block timestamp. Any of those missing aborts the run. Returns `None`
    /// in report-only runs.
    pub async fn create_donation(
        &self,
        chain: &ChainSnapshot,
        tokens: &TokenRegistry,
        event: &TransferEvent,
        item: &DonationItem,
    ) -> Result<Option<DonationId>> {
        if !self.apply {
            return Ok(None);
        }
        let pledge = chain.pledge(event.to)?;
        let owner = chain.admin(pledge.owner)?;

        let owner_row = match db::find_pledge_admin(&self.pool, owner.id).await? {
            Some(row) => row,
            None if owner.admin_type == AdminType::Giver => {
                let row = PledgeAdminRow {
                    id: owner.id as i64,
                    admin_type: AdminType::Giver.as_str().to_string(),
                    type_id: owner.addr.clone(),
                };
                db::insert_pledge_admin(&self.pool, &row).await?;
                info!("Created giver pledge admin {}", row.id);
                row
            }
            None => return Err(ReconcileError::MissingPledgeAdmin(owner.id)),
        };

        let delegate_id = match pledge.delegates.first() {
            Some(delegate) => Some(self.admin_row(*delegate).await?.id as u64),
            None => None,
        };
        let intended_project_id = if pledge.intended_project != NO_ID {
            Some(self.admin_row(pledge.intended_project).await?.id as u64)
        } else {
            None
        };

        let token = tokens.by_address(&pledge.token)?;
        let created_at = event
            .timestamp
            .ok_or(ReconcileError::MissingTimestamp(event.block_number))?;

        let record = NewDonation {
            amount: item.amount.clone(),
            amount_remaining: item.amount_remaining.clone(),
            pledge_id: event.to,
            status: item.status,
            mined: true,
            tx_hash: event.tx_hash.clone(),
            parent_donations: item.parent_donations.clone(),
            owner_id: owner_row.id as u64,
            owner_type: owner_row.admin_type,
            owner_type_id: owner_row.type_id,
            giver_address: item.giver_address.clone(),
            token_symbol: token.symbol.clone(),
            intended_project_id,
            delegate_id,
            less_than_cutoff: token.is_below_cutoff(&item.amount_remaining),
            created_at,
        };
        let id = db::insert_donation(&self.pool, &record).await?;
        Ok(Some(id))
    }

    async fn admin_row(&self, admin: u64) -> Result<PledgeAdminRow> {
        db::find_pledge_admin(&self.pool, admin)
            .await?
            .ok_or(ReconcileError::MissingPledgeAdmin(admin))
    }

    /// Delete unused records and overwrite drifted balances.
    pub async fn apply_end_of_run(&self, conflicts: &Conflicts) -> Result<RepairSummary> {
        if !self.apply {
            return Ok(RepairSummary::default());
        }

        enum Write<'a> {
            Delete(DonationId),
            Update(&'a crate::detect::DriftedDonation),
        }

        let writes = conflicts
            .unused
            .iter()
            .map(|u| Write::Delete(u.id))
            .chain(conflicts.drifted.iter().map(Write::Update));

        let pool = &self.pool;
        let results: Vec<Result<Write<'_>>> = stream::iter(writes)
            .map(|write| async move {
                match &write {
                    Write::Delete(id) => {
                        if db::delete_donation(pool, *id).await? {
                            debug!("Deleted unused donation {id}");
                        }
                    }
                    Write::Update(d) => {
                        db::set_amount_remaining(pool, d.id, &d.replayed, d.less_than_cutoff)
                            .await?;
                        debug!("Donation {} amountRemaining set to {}", d.id, d.replayed);
                    }
                }
                Ok::<_, ReconcileError>(write)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = RepairSummary::default();
        for result in results {
            match result? {
                Write::Delete(_) => summary.deleted += 1,
                Write::Update(_) => summary.updated += 1,
            }
        }
        info!(
            "Repair pass: {} unused deleted, {} balances updated",
            summary.deleted, summary.updated
        );
        Ok(summary)
    }
}
