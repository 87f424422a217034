//! Run report: everything replay and detection found, in a shape that can
//! be logged and written as JSON.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::amount::Amount;
use crate::detect::{BalanceConflict, CanceledHolding, Conflicts, DriftedDonation, UnusedDonation};
use crate::donation::{DonationId, DonationStatus};
use crate::errors::Result;

/// A finding made while replaying a single transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Correction {
    /// A record sitting in the failed bucket actually reached `pledge_id`.
    #[serde(rename_all = "camelCase")]
    Unfailed {
        id: DonationId,
        pledge_id: u64,
        status: DonationStatus,
        tx_hash: String,
    },
    /// A matched record was not flagged as mined.
    #[serde(rename_all = "camelCase")]
    Mined { id: DonationId },
    #[serde(rename_all = "camelCase")]
    Parents {
        id: DonationId,
        stored: Vec<DonationId>,
        replayed: Vec<DonationId>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        id: DonationId,
        stored: DonationStatus,
        expected: DonationStatus,
    },
    /// A transfer with no matching record. `id` is set once the record has
    /// been written.
    #[serde(rename_all = "camelCase")]
    Created {
        id: Option<DonationId>,
        pledge_id: u64,
        tx_hash: String,
        amount: Amount,
        status: DonationStatus,
        parent_donations: Vec<DonationId>,
        giver_address: Option<String>,
        token_symbol: Option<String>,
        created_at: Option<String>,
    },
}

/// Render unix seconds as RFC 3339.
pub fn rfc3339(secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|t| t.to_rfc3339())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub generated_at: String,
    /// Whether corrections were written to the store.
    pub applied: bool,
    pub events_replayed: usize,
    pub events_ignored: usize,
    pub balance_conflicts: Vec<BalanceConflict>,
    pub canceled_holdings: Vec<CanceledHolding>,
    pub unused_donations: Vec<UnusedDonation>,
    pub drifted_donations: Vec<DriftedDonation>,
    pub corrections: Vec<Correction>,
}

impl ConflictReport {
    pub fn new(
        applied: bool,
        events_replayed: usize,
        events_ignored: usize,
        conflicts: Conflicts,
        corrections: Vec<Correction>,
    ) -> Self {
        let Conflicts {
            balance,
            canceled_holdings,
            unused,
            drifted,
        } = conflicts;
        Self {
            generated_at: Utc::now().to_rfc3339(),
            applied,
            events_replayed,
            events_ignored,
            balance_conflicts: balance,
            canceled_holdings,
            unused_donations: unused,
            drifted_donations: drifted,
            corrections,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.balance_conflicts.is_empty()
            && self.unused_donations.is_empty()
            && self.drifted_donations.is_empty()
            && self.corrections.is_empty()
    }

    pub fn log_summary(&self) {
        let line = format!(
            "Replayed {} events ({} ignored): {} balance conflicts, {} canceled holdings, \
             {} unused, {} drifted, {} corrections{}",
            self.events_replayed,
            self.events_ignored,
            self.balance_conflicts.len(),
            self.canceled_holdings.len(),
            self.unused_donations.len(),
            self.drifted_donations.len(),
            self.corrections.len(),
            if self.applied { " (applied)" } else { " (dry run)" },
        );
        if self.is_clean() {
            info!("{line}");
        } else {
            warn!("{line}");
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}
