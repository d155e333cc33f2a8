//! Inventory batch ledger for Bistro POS.
//!
//! Holds FIFO stock batches per product/preparation. Deduction consumes
//! the oldest-acquired batches first and is allowed to drive a batch
//! negative when recorded stock runs out: the kitchen is never blocked
//! from marking an item ready, and the shortage is flagged for a later
//! physical-count reconciliation.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;

/// Quantities below this are treated as zero.
const QTY_EPSILON: f64 = 1e-6;

/// One batch-level slice of a deduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAllocation {
    pub batch_id: String,
    pub batch_number: String,
    pub quantity: f64,
    pub cost_per_unit: f64,
}

impl BatchAllocation {
    pub fn value(&self) -> f64 {
        self.quantity * self.cost_per_unit
    }
}

/// Result of a physical-count reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub item_id: String,
    pub system_quantity: f64,
    pub actual_quantity: f64,
    pub difference: f64,
    pub correction_operation_id: Option<String>,
    pub correction_batch_id: Option<String>,
    pub reconciled_negative_batches: usize,
}

// ---------------------------------------------------------------------------
// Stock receipt
// ---------------------------------------------------------------------------

/// Receive stock into a new batch. Returns the batch id.
pub fn receive_stock(
    db: &DbState,
    item_id: &str,
    quantity: f64,
    cost_per_unit: f64,
    source_type: &str,
) -> Result<String, PosError> {
    if quantity <= 0.0 {
        return Err(PosError::InvalidAmount(quantity));
    }
    let conn = db.lock()?;
    let batch_id = insert_batch(&conn, item_id, quantity, cost_per_unit, source_type, false)?;
    info!(item_id = %item_id, batch_id = %batch_id, quantity = %quantity, "Stock received");
    Ok(batch_id)
}

fn insert_batch(
    conn: &Connection,
    item_id: &str,
    quantity: f64,
    cost_per_unit: f64,
    source_type: &str,
    is_negative: bool,
) -> Result<String, PosError> {
    let batch_id = Uuid::new_v4().to_string();
    let prefix = if is_negative { "NEG" } else { "B" };
    let batch_number = format!("{}-{}", prefix, &batch_id[..8]);
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO storage_batches (
            id, item_id, batch_number, initial_quantity, current_quantity,
            cost_per_unit, receipt_date, source_type, is_negative,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8, ?6, ?6)",
        params![
            batch_id,
            item_id,
            batch_number,
            quantity,
            cost_per_unit,
            now,
            source_type,
            is_negative as i32,
        ],
    )?;
    Ok(batch_id)
}

// ---------------------------------------------------------------------------
// FIFO preview & cost lookup
// ---------------------------------------------------------------------------

/// Plan a FIFO allocation without mutating any batch. Returns the
/// allocations and the quantity that could not be covered by recorded
/// stock (the cost resolver prices that remainder at the last known
/// cost).
pub(crate) fn fifo_preview(
    conn: &Connection,
    item_id: &str,
    quantity: f64,
) -> Result<(Vec<BatchAllocation>, f64), PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, batch_number, current_quantity, cost_per_unit
         FROM storage_batches
         WHERE item_id = ?1 AND reconciled_at IS NULL AND current_quantity > 0
         ORDER BY receipt_date ASC, created_at ASC",
    )?;
    let batches: Vec<(String, String, f64, f64)> = stmt
        .query_map(params![item_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut allocations = Vec::new();
    let mut remaining = quantity;
    for (batch_id, batch_number, available, cost_per_unit) in batches {
        if remaining <= QTY_EPSILON {
            break;
        }
        let take = available.min(remaining);
        allocations.push(BatchAllocation {
            batch_id,
            batch_number,
            quantity: take,
            cost_per_unit,
        });
        remaining -= take;
    }
    Ok((allocations, remaining.max(0.0)))
}

/// Most recent unit cost recorded for an item, across all batches
/// (including reconciled ones). Falls back to 0 with a warning when no
/// cost history exists.
pub(crate) fn last_known_cost(conn: &Connection, item_id: &str) -> f64 {
    let cost: Option<f64> = conn
        .query_row(
            "SELECT cost_per_unit FROM storage_batches
             WHERE item_id = ?1
             ORDER BY receipt_date DESC, created_at DESC
             LIMIT 1",
            params![item_id],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();
    match cost {
        Some(c) => c,
        None => {
            warn!(item_id = %item_id, "No cost history, using 0 for negative batch");
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Deduction
// ---------------------------------------------------------------------------

/// Deduct `quantity` of an item, oldest batch first, inside the caller's
/// transaction. When recorded stock runs out, the most recent batch is
/// driven negative and flagged instead of failing; when no batch exists
/// at all, a negative correction batch is created at the last known
/// cost.
pub(crate) fn deduct_in_tx(
    conn: &Connection,
    item_id: &str,
    quantity: f64,
) -> Result<Vec<BatchAllocation>, PosError> {
    if quantity <= 0.0 {
        return Err(PosError::InvalidAmount(quantity));
    }

    let (mut allocations, remaining) = fifo_preview(conn, item_id, quantity)?;
    let now = Utc::now().to_rfc3339();

    for alloc in &allocations {
        conn.execute(
            "UPDATE storage_batches
             SET current_quantity = current_quantity - ?1, updated_at = ?2
             WHERE id = ?3",
            params![alloc.quantity, now, alloc.batch_id],
        )?;
    }

    if remaining > QTY_EPSILON {
        // Overdraw the most recent batch rather than failing the write-off.
        let newest: Option<(String, String, f64)> = conn
            .query_row(
                "SELECT id, batch_number, cost_per_unit FROM storage_batches
                 WHERE item_id = ?1 AND reconciled_at IS NULL
                 ORDER BY receipt_date DESC, created_at DESC
                 LIMIT 1",
                params![item_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match newest {
            Some((batch_id, batch_number, cost_per_unit)) => {
                conn.execute(
                    "UPDATE storage_batches
                     SET current_quantity = current_quantity - ?1,
                         is_negative = 1, updated_at = ?2
                     WHERE id = ?3",
                    params![remaining, now, batch_id],
                )?;
                warn!(
                    item_id = %item_id,
                    batch_number = %batch_number,
                    shortfall = %remaining,
                    "Insufficient stock, batch driven negative"
                );
                allocations.push(BatchAllocation {
                    batch_id,
                    batch_number,
                    quantity: remaining,
                    cost_per_unit,
                });
            }
            None => {
                let cost_per_unit = last_known_cost(conn, item_id);
                let batch_id =
                    insert_batch(conn, item_id, -remaining, cost_per_unit, "correction", true)?;
                let batch_number: String = conn.query_row(
                    "SELECT batch_number FROM storage_batches WHERE id = ?1",
                    params![batch_id],
                    |row| row.get(0),
                )?;
                warn!(
                    item_id = %item_id,
                    batch_number = %batch_number,
                    shortfall = %remaining,
                    "No stock recorded, created negative batch"
                );
                allocations.push(BatchAllocation {
                    batch_id,
                    batch_number,
                    quantity: remaining,
                    cost_per_unit,
                });
            }
        }
    }

    Ok(merge_allocations(allocations))
}

/// Deduct stock in its own transaction. Public entry point for callers
/// outside the write-off pipeline.
pub fn deduct(db: &DbState, item_id: &str, quantity: f64) -> Result<Vec<BatchAllocation>, PosError> {
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = deduct_in_tx(&conn, item_id, quantity);
    match &result {
        Ok(_) => conn.execute_batch("COMMIT")?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    result
}

/// Collapse duplicate batch slices (a batch both consumed and then
/// overdrawn) into one allocation per batch.
fn merge_allocations(allocations: Vec<BatchAllocation>) -> Vec<BatchAllocation> {
    let mut merged: Vec<BatchAllocation> = Vec::new();
    for alloc in allocations {
        match merged.iter_mut().find(|a| a.batch_id == alloc.batch_id) {
            Some(existing) => existing.quantity += alloc.quantity,
            None => merged.push(alloc),
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Balance & reconciliation
// ---------------------------------------------------------------------------

/// System balance: the sum of quantities across all non-reconciled
/// batches (negative batches included until a count forgives them).
pub fn system_balance(db: &DbState, item_id: &str) -> Result<f64, PosError> {
    let conn = db.lock()?;
    balance_in_tx(&conn, item_id)
}

pub(crate) fn balance_in_tx(conn: &Connection, item_id: &str) -> Result<f64, PosError> {
    let sum: f64 = conn.query_row(
        "SELECT COALESCE(SUM(current_quantity), 0) FROM storage_batches
         WHERE item_id = ?1 AND reconciled_at IS NULL",
        params![item_id],
        |row| row.get(0),
    )?;
    Ok(sum)
}

/// Reconcile the system balance against a physical count.
///
/// When the count disagrees, prior negative batches are stamped
/// `reconciled_at` so they stop counting toward future balances, and the
/// residual difference becomes either a correction write-off (count
/// below system) or a correction receipt batch (count above system).
/// A matching count is a zero-value no-op.
pub fn reconcile(
    db: &DbState,
    item_id: &str,
    actual_quantity: f64,
) -> Result<Reconciliation, PosError> {
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Reconciliation, PosError> {
        let system = balance_in_tx(&conn, item_id)?;
        let difference = actual_quantity - system;

        if difference.abs() <= QTY_EPSILON {
            return Ok(Reconciliation {
                item_id: item_id.to_string(),
                system_quantity: system,
                actual_quantity,
                difference: 0.0,
                correction_operation_id: None,
                correction_batch_id: None,
                reconciled_negative_batches: 0,
            });
        }

        let now = Utc::now().to_rfc3339();

        // Forgive historical negative batches: after a physical count they
        // no longer represent real stock.
        let reconciled = conn.execute(
            "UPDATE storage_batches
             SET reconciled_at = ?1, updated_at = ?1
             WHERE item_id = ?2 AND is_negative = 1 AND reconciled_at IS NULL",
            params![now, item_id],
        )?;

        let balance_after = balance_in_tx(&conn, item_id)?;
        let residual = actual_quantity - balance_after;

        let mut correction_operation_id = None;
        let mut correction_batch_id = None;

        if residual > QTY_EPSILON {
            let cost = last_known_cost(&conn, item_id);
            let batch_id = insert_batch(&conn, item_id, residual, cost, "correction", false)?;
            correction_batch_id = Some(batch_id);
        } else if residual < -QTY_EPSILON {
            let allocations = deduct_in_tx(&conn, item_id, -residual)?;
            let total_value: f64 = allocations.iter().map(BatchAllocation::value).sum();
            let op_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO writeoff_operations (id, reason, total_value, allocations, notes, created_at)
                 VALUES (?1, 'inventory_correction', ?2, ?3, ?4, ?5)",
                params![
                    op_id,
                    total_value,
                    serde_json::to_string(&allocations)
                        .map_err(|e| PosError::Internal(e.to_string()))?,
                    format!("Physical count correction for {item_id}"),
                    now,
                ],
            )?;
            correction_operation_id = Some(op_id);
        }

        info!(
            item_id = %item_id,
            system = %system,
            actual = %actual_quantity,
            reconciled_batches = reconciled,
            "Inventory reconciled"
        );

        Ok(Reconciliation {
            item_id: item_id.to_string(),
            system_quantity: system,
            actual_quantity,
            difference,
            correction_operation_id,
            correction_batch_id,
            reconciled_negative_batches: reconciled,
        })
    })();

    match &result {
        Ok(_) => conn.execute_batch("COMMIT")?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    result
}

/// True when the item has unreconciled negative batches awaiting a
/// physical count.
pub fn has_negative_batches(db: &DbState, item_id: &str) -> Result<bool, PosError> {
    let conn = db.lock()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM storage_batches
         WHERE item_id = ?1 AND is_negative = 1 AND reconciled_at IS NULL",
        params![item_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_db() -> DbState {
        db::init_in_memory().expect("open in-memory db")
    }

    #[test]
    fn test_fifo_consumes_oldest_first() {
        let db = test_db();
        // Two batches at different costs; the first received is consumed first.
        let b1 = receive_stock(&db, "prod-x", 100.0, 10.0, "purchase").unwrap();
        let b2 = receive_stock(&db, "prod-x", 100.0, 12.0, "purchase").unwrap();

        let allocations = deduct(&db, "prod-x", 150.0).unwrap();
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].batch_id, b1);
        assert_eq!(allocations[0].quantity, 100.0);
        assert_eq!(allocations[0].cost_per_unit, 10.0);
        assert_eq!(allocations[1].batch_id, b2);
        assert_eq!(allocations[1].quantity, 50.0);
        assert_eq!(allocations[1].cost_per_unit, 12.0);

        assert_eq!(system_balance(&db, "prod-x").unwrap(), 50.0);
    }

    #[test]
    fn test_overdraw_drives_batch_negative() {
        // Scenario: one batch of 250 at cost 50; deducting 300 leaves the
        // batch at -50, flagged, with full value 300 * 50.
        let db = test_db();
        let b1 = receive_stock(&db, "prod-x", 250.0, 50.0, "purchase").unwrap();

        let allocations = deduct(&db, "prod-x", 300.0).unwrap();
        assert_eq!(allocations.len(), 1, "slices of one batch merge");
        assert_eq!(allocations[0].batch_id, b1);
        assert_eq!(allocations[0].quantity, 300.0);
        let total: f64 = allocations.iter().map(BatchAllocation::value).sum();
        assert_eq!(total, 15000.0);

        let conn = db.conn.lock().unwrap();
        let (qty, negative): (f64, i64) = conn
            .query_row(
                "SELECT current_quantity, is_negative FROM storage_batches WHERE id = ?1",
                params![b1],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(qty, -50.0);
        assert_eq!(negative, 1);
    }

    #[test]
    fn test_deduct_with_no_batches_creates_negative_batch() {
        let db = test_db();
        let allocations = deduct(&db, "prod-ghost", 40.0).unwrap();
        assert_eq!(allocations.len(), 1);
        assert!(allocations[0].batch_number.starts_with("NEG-"));
        assert_eq!(allocations[0].cost_per_unit, 0.0, "no cost history");
        assert_eq!(system_balance(&db, "prod-ghost").unwrap(), -40.0);
        assert!(has_negative_batches(&db, "prod-ghost").unwrap());
    }

    #[test]
    fn test_reconcile_round_trip_is_noop() {
        // deduct then reconcile at the computed balance: zero-value
        // correction, nothing changes.
        let db = test_db();
        receive_stock(&db, "prod-x", 200.0, 5.0, "purchase").unwrap();
        deduct(&db, "prod-x", 100.0).unwrap();

        let balance = system_balance(&db, "prod-x").unwrap();
        let rec = reconcile(&db, "prod-x", balance).unwrap();
        assert_eq!(rec.difference, 0.0);
        assert!(rec.correction_operation_id.is_none());
        assert!(rec.correction_batch_id.is_none());
        assert_eq!(rec.reconciled_negative_batches, 0);
        assert_eq!(system_balance(&db, "prod-x").unwrap(), balance);
    }

    #[test]
    fn test_reconcile_forgives_negative_batches() {
        let db = test_db();
        receive_stock(&db, "prod-x", 250.0, 50.0, "purchase").unwrap();
        deduct(&db, "prod-x", 300.0).unwrap();
        assert_eq!(system_balance(&db, "prod-x").unwrap(), -50.0);

        // Physical count finds 20 units on the shelf.
        let rec = reconcile(&db, "prod-x", 20.0).unwrap();
        assert_eq!(rec.system_quantity, -50.0);
        assert_eq!(rec.reconciled_negative_batches, 1);
        assert!(rec.correction_batch_id.is_some(), "count above forgiven balance");
        assert!(rec.correction_operation_id.is_none());

        // The negative batch no longer corrupts the running balance.
        assert_eq!(system_balance(&db, "prod-x").unwrap(), 20.0);
        assert!(!has_negative_batches(&db, "prod-x").unwrap());
    }

    #[test]
    fn test_reconcile_shrinkage_creates_correction_writeoff() {
        let db = test_db();
        receive_stock(&db, "prod-x", 100.0, 8.0, "purchase").unwrap();

        // Count finds only 70: 30 units vanish as a correction write-off.
        let rec = reconcile(&db, "prod-x", 70.0).unwrap();
        assert_eq!(rec.difference, -30.0);
        let op_id = rec.correction_operation_id.expect("correction op");

        let conn = db.conn.lock().unwrap();
        let (reason, total): (String, f64) = conn
            .query_row(
                "SELECT reason, total_value FROM writeoff_operations WHERE id = ?1",
                params![op_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(reason, "inventory_correction");
        assert_eq!(total, 240.0);
        drop(conn);

        assert_eq!(system_balance(&db, "prod-x").unwrap(), 70.0);
    }

    #[test]
    fn test_receive_rejects_non_positive_quantity() {
        let db = test_db();
        let err = receive_stock(&db, "prod-x", 0.0, 1.0, "purchase").unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
    }
}
