//! Table occupancy tracking for Bistro POS.
//!
//! A table's display status is a pure derivation from its active
//! order's items: it is recomputed on every read and never stored, so
//! it cannot drift from the payment state it summarizes.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;
use crate::types::TableStatus;

/// Register a table. Returns the table id.
pub fn create_table(db: &DbState, name: &str) -> Result<String, PosError> {
    let conn = db.lock()?;
    let table_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO tables (id, name) VALUES (?1, ?2)",
        params![table_id, name],
    )?;
    Ok(table_id)
}

/// Derive a table's occupancy status.
///
/// `free` when no active order is seated; `occupied_paid` when every
/// non-cancelled item across the active order's bills is paid;
/// `occupied_unpaid` otherwise (including an order with no items yet).
pub fn table_status(db: &DbState, table_id: &str) -> Result<TableStatus, PosError> {
    let conn = db.lock()?;
    table_status_in_tx(&conn, table_id)
}

pub(crate) fn table_status_in_tx(
    conn: &Connection,
    table_id: &str,
) -> Result<TableStatus, PosError> {
    let active_order: Option<Option<String>> = conn
        .query_row(
            "SELECT active_order_id FROM tables WHERE id = ?1",
            params![table_id],
            |row| row.get(0),
        )
        .optional()?;

    let order_id = match active_order {
        None => return Err(PosError::not_found("Table", table_id)),
        Some(None) => return Ok(TableStatus::Free),
        Some(Some(id)) => id,
    };

    let (active, unpaid): (i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN payment_status != 'paid' THEN 1 ELSE 0 END), 0)
         FROM order_items
         WHERE order_id = ?1 AND status != 'cancelled'",
        params![order_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if active > 0 && unpaid == 0 {
        Ok(TableStatus::OccupiedPaid)
    } else {
        Ok(TableStatus::OccupiedUnpaid)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
