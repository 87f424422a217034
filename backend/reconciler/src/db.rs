//! Ledger store: migrations and the donation / pledge-admin queries the
//! reconciler consumes.

use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use tracing::info;

use crate::amount::Amount;
use crate::donation::{DonationId, DonationRecord, DonationStatus, NewDonation};
use crate::errors::{ReconcileError, Result};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct DonationRow {
    id: i64,
    amount: String,
    amount_remaining: String,
    pledge_id: i64,
    status: String,
    mined: bool,
    tx_hash: String,
    parent_donations: String,
    owner_id: i64,
    owner_type: String,
    owner_type_id: String,
    giver_address: Option<String>,
    token_symbol: String,
    intended_project_id: Option<i64>,
    delegate_id: Option<i64>,
    less_than_cutoff: bool,
    is_return: bool,
    created_at: i64,
}

impl TryFrom<DonationRow> for DonationRecord {
    type Error = ReconcileError;

    fn try_from(row: DonationRow) -> Result<Self> {
        let id = row.id;
        let malformed = |reason: String| ReconcileError::MalformedRecord { id, reason };
        Ok(DonationRecord {
            id,
            amount: row.amount.parse().map_err(malformed)?,
            amount_remaining: row.amount_remaining.parse().map_err(malformed)?,
            pledge_id: row.pledge_id as u64,
            status: row.status.parse().map_err(malformed)?,
            mined: row.mined,
            tx_hash: row.tx_hash,
            parent_donations: serde_json::from_str(&row.parent_donations)
                .map_err(|e| malformed(format!("parent_donations: {e}")))?,
            owner_id: row.owner_id as u64,
            owner_type: row.owner_type,
            owner_type_id: row.owner_type_id,
            giver_address: row.giver_address,
            token_symbol: row.token_symbol,
            intended_project_id: row.intended_project_id.map(|v| v as u64),
            delegate_id: row.delegate_id.map(|v| v as u64),
            less_than_cutoff: row.less_than_cutoff,
            is_return: row.is_return,
            created_at: row.created_at,
        })
    }
}

const DONATION_COLUMNS: &str = "id, amount, amount_remaining, pledge_id, status, mined, tx_hash, \
     parent_donations, owner_id, owner_type, owner_type_id, giver_address, token_symbol, \
     intended_project_id, delegate_id, less_than_cutoff, is_return, created_at";

// ─────────────────────────────────────────────────────────
// Donation reads
// ─────────────────────────────────────────────────────────

/// All donations, oldest first.
pub async fn list_donations(pool: &SqlitePool) -> Result<Vec<DonationRecord>> {
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations ORDER BY created_at ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(DonationRecord::try_from).collect()
}

#[cfg(test)]
pub async fn find_donation(pool: &SqlitePool, id: DonationId) -> Result<Option<DonationRecord>> {
    let row = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(DonationRecord::try_from).transpose()
}

// ─────────────────────────────────────────────────────────
// Donation writes
// ─────────────────────────────────────────────────────────

/// Insert a donation and return the id the store assigned.
pub async fn insert_donation(pool: &SqlitePool, d: &NewDonation) -> Result<DonationId> {
    let parents = serde_json::to_string(&d.parent_donations)?;
    let id = sqlx::query(
        r#"
        INSERT INTO donations
            (amount, amount_remaining, pledge_id, status, mined, tx_hash, parent_donations,
             owner_id, owner_type, owner_type_id, giver_address, token_symbol,
             intended_project_id, delegate_id, less_than_cutoff, is_return, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, ?16)
        "#,
    )
    .bind(d.amount.to_string())
    .bind(d.amount_remaining.to_string())
    .bind(d.pledge_id as i64)
    .bind(d.status.as_str())
    .bind(d.mined)
    .bind(&d.tx_hash)
    .bind(parents)
    .bind(d.owner_id as i64)
    .bind(&d.owner_type)
    .bind(&d.owner_type_id)
    .bind(&d.giver_address)
    .bind(&d.token_symbol)
    .bind(d.intended_project_id.map(|v| v as i64))
    .bind(d.delegate_id.map(|v| v as i64))
    .bind(d.less_than_cutoff)
    .bind(d.created_at)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Returns `true` when a row was removed.
pub async fn delete_donation(pool: &SqlitePool, id: DonationId) -> Result<bool> {
    let affected = sqlx::query("DELETE FROM donations WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected > 0)
}

/// Move a donation that was wrongly left in the failed bucket to the pledge
/// it actually reached.
pub async fn relocate_donation(
    pool: &SqlitePool,
    id: DonationId,
    pledge_id: u64,
    status: DonationStatus,
) -> Result<()> {
    sqlx::query("UPDATE donations SET pledge_id = ?1, status = ?2, mined = 1 WHERE id = ?3")
        .bind(pledge_id as i64)
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_mined(pool: &SqlitePool, id: DonationId) -> Result<()> {
    sqlx::query("UPDATE donations SET mined = 1 WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_parents(pool: &SqlitePool, id: DonationId, parents: &[DonationId]) -> Result<()> {
    sqlx::query("UPDATE donations SET parent_donations = ?1 WHERE id = ?2")
        .bind(serde_json::to_string(parents)?)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_status(pool: &SqlitePool, id: DonationId, status: DonationStatus) -> Result<()> {
    sqlx::query("UPDATE donations SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_amount_remaining(
    pool: &SqlitePool,
    id: DonationId,
    amount_remaining: &Amount,
    less_than_cutoff: bool,
) -> Result<()> {
    sqlx::query("UPDATE donations SET amount_remaining = ?1, less_than_cutoff = ?2 WHERE id = ?3")
        .bind(amount_remaining.to_string())
        .bind(less_than_cutoff)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Pledge admins
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PledgeAdminRow {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub admin_type: String,
    pub type_id: String,
}

pub async fn find_pledge_admin(pool: &SqlitePool, id: u64) -> Result<Option<PledgeAdminRow>> {
    let row = sqlx::query_as::<_, PledgeAdminRow>(
        "SELECT id, type, type_id FROM pledge_admins WHERE id = ?1",
    )
    .bind(id as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn insert_pledge_admin(pool: &SqlitePool, admin: &PledgeAdminRow) -> Result<()> {
    sqlx::query("INSERT INTO pledge_admins (id, type, type_id) VALUES (?1, ?2, ?3)")
        .bind(admin.id)
        .bind(&admin.admin_type)
        .bind(&admin.type_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fresh in-memory store with the real migrations applied. A single
    /// connection keeps every query on the same memory database.
    pub(crate) async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    pub(crate) fn new_donation(pledge_id: u64, tx_hash: &str, amount: u64) -> NewDonation {
        NewDonation {
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
            created_at: 1_600_000_000,
        }
    }

    #[tokio::test]
    async fn insert_then_list_in_creation_order() {
        let pool = memory_pool().await;
        let mut late = new_donation(2, "0xb", 5);
        late.created_at += 10;
        let late_id = insert_donation(&pool, &late).await.unwrap();
        let early_id = insert_donation(&pool, &new_donation(1, "0xa", 7)).await.unwrap();

        let all = list_donations(&pool).await.unwrap();
        assert_eq!(all.iter().map(|d| d.id).collect::<Vec<_>>(), vec![early_id, late_id]);
        assert_eq!(all[0].amount_remaining, Amount::from(7));
        assert_eq!(all[0].status, DonationStatus::Waiting);
        assert!(all[0].mined);
    }

    #[tokio::test]
    async fn field_updates_by_id() {
        let pool = memory_pool().await;
        let id = insert_donation(&pool, &new_donation(0, "0xa", 7)).await.unwrap();

        relocate_donation(&pool, id, 4, DonationStatus::Committed).await.unwrap();
        set_parents(&pool, id, &[11, 12]).await.unwrap();
        set_amount_remaining(&pool, id, &Amount::from(3), true).await.unwrap();
        set_status(&pool, id, DonationStatus::Paid).await.unwrap();

        let d = find_donation(&pool, id).await.unwrap().unwrap();
        assert_eq!(d.pledge_id, 4);
        assert_eq!(d.status, DonationStatus::Paid);
        assert_eq!(d.parent_donations, vec![11, 12]);
        assert_eq!(d.amount_remaining, Amount::from(3));
        assert!(d.less_than_cutoff);
        assert!(d.mined);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_went_away() {
        let pool = memory_pool().await;
        let id = insert_donation(&pool, &new_donation(1, "0xa", 7)).await.unwrap();
        assert!(delete_donation(&pool, id).await.unwrap());
        assert!(!delete_donation(&pool, id).await.unwrap());
        assert!(find_donation(&pool, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_rows_are_rejected() {
        let pool = memory_pool().await;
        let id = insert_donation(&pool, &new_donation(1, "0xa", 7)).await.unwrap();
        sqlx::query("UPDATE donations SET amount_remaining = '-4' WHERE id = ?1")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(matches!(
            list_donations(&pool).await,
            Err(ReconcileError::MalformedRecord { .. })
        ));
    }

    #[tokio::test]
    async fn pledge_admin_lookup() {
        let pool = memory_pool().await;
        assert!(find_pledge_admin(&pool, 3).await.unwrap().is_none());
        let row = PledgeAdminRow {
            id: 3,
            admin_type: "giver".into(),
            type_id: "0xgiver".into(),
        };
        insert_pledge_admin(&pool, &row).await.unwrap();
        assert_eq!(find_pledge_admin(&pool, 3).await.unwrap(), Some(row));
    }
}
