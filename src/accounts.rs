//! Settlement accounts for Bistro POS.
//!
//! Thin surface over the account/ledger collaborator consumed by the
//! payment processor: existence and active checks before a payment,
//! balance credit inside each bill's transaction.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;

/// A settlement account (cash drawer, card terminal, QR wallet).
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub balance: f64,
}

/// Create an account. Returns the account id.
pub fn create_account(db: &DbState, name: &str, is_active: bool) -> Result<String, PosError> {
    let conn = db.lock()?;
    let account_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO accounts (id, name, is_active) VALUES (?1, ?2, ?3)",
        params![account_id, name, is_active as i32],
    )?;
    Ok(account_id)
}

/// Load an account by id.
pub fn get_account(db: &DbState, account_id: &str) -> Result<Account, PosError> {
    let conn = db.lock()?;
    get_account_in_tx(&conn, account_id)
}

pub(crate) fn get_account_in_tx(conn: &Connection, account_id: &str) -> Result<Account, PosError> {
    conn.query_row(
        "SELECT id, name, is_active, balance FROM accounts WHERE id = ?1",
        params![account_id],
        |row| {
            Ok(Account {
                id: row.get(0)?,
                name: row.get(1)?,
                is_active: row.get::<_, i64>(2)? != 0,
                balance: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("Account", account_id))
}

/// Credit a settlement amount to an account, inside the caller's
/// transaction.
pub(crate) fn credit_in_tx(
    conn: &Connection,
    account_id: &str,
    amount: f64,
) -> Result<(), PosError> {
    let updated = conn.execute(
        "UPDATE accounts SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
        params![amount, Utc::now().to_rfc3339(), account_id],
    )?;
    if updated == 0 {
        return Err(PosError::not_found("Account", account_id));
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
