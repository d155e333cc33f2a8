//! Kitchen/bar fulfillment router for Bistro POS.
//!
//! Splits active items into department queues, exposes the per-
//! department transition tables, and applies single-item status writes
//! followed by an immediate recompute of the owning order's derived
//! status. The bar department has no `cooking` state at all: its table
//! maps `waiting` straight to `ready`.
//!
//! Advancing an item to `ready` with the inventory side effect goes
//! through [`crate::writeoff::WriteOffPipeline::mark_item_ready`]; the
//! plain status write here performs no write-off.

use chrono::Utc;
use rusqlite::params;
use serde_json::json;
use tracing::{debug, info};

use crate::db::DbState;
use crate::error::PosError;
use crate::orders;
use crate::sync::{ChangeOp, SyncBridge};
use crate::types::{Department, FulfillmentStatus, StaffRole};

// ---------------------------------------------------------------------------
// Transition tables
// ---------------------------------------------------------------------------

/// Next fulfillment status a department display may advance to.
/// `None` means the department no longer owns the item.
pub fn next_status(
    current: FulfillmentStatus,
    department: Department,
) -> Option<FulfillmentStatus> {
    match (department, current) {
        (Department::Kitchen, FulfillmentStatus::Waiting) => Some(FulfillmentStatus::Cooking),
        (Department::Kitchen, FulfillmentStatus::Cooking) => Some(FulfillmentStatus::Ready),
        // Bar skips cooking entirely
        (Department::Bar, FulfillmentStatus::Waiting) => Some(FulfillmentStatus::Ready),
        _ => None,
    }
}

/// Display label for the advance button.
pub fn button_label(current: FulfillmentStatus, department: Department) -> &'static str {
    match (department, current) {
        (Department::Kitchen, FulfillmentStatus::Waiting) => "Start Cooking",
        (Department::Kitchen, FulfillmentStatus::Cooking) => "Mark Ready",
        (Department::Bar, FulfillmentStatus::Waiting) => "Mark Ready",
        (_, FulfillmentStatus::Ready) => "Ready",
        _ => "",
    }
}

/// True when the department can still advance the item.
pub fn can_advance(current: FulfillmentStatus, department: Department) -> bool {
    next_status(current, department).is_some()
}

/// Departments visible to a user. Admins may pick one or see both;
/// kitchen and bar roles are pinned to their own station regardless of
/// the explicit selection.
pub fn allowed_departments(role: StaffRole, explicit: Option<Department>) -> Vec<Department> {
    match role {
        StaffRole::Admin => match explicit {
            Some(dep) => vec![dep],
            None => vec![Department::Kitchen, Department::Bar],
        },
        StaffRole::Kitchen => vec![Department::Kitchen],
        StaffRole::Bar => vec![Department::Bar],
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// A row in a department queue.
#[derive(Debug, Clone)]
pub struct FulfillmentItem {
    pub id: String,
    pub order_id: String,
    pub item_name: String,
    pub quantity: f64,
    pub department: Department,
    pub status: FulfillmentStatus,
    pub created_at: String,
}

/// Items currently in preparation (`waiting`/`cooking`/`ready`),
/// oldest first, optionally filtered to one department.
pub fn active_fulfillment_items(
    db: &DbState,
    department: Option<Department>,
) -> Result<Vec<FulfillmentItem>, PosError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, order_id, item_name, quantity, department, status, created_at
         FROM order_items
         WHERE status IN ('waiting', 'cooking', 'ready')
           AND (?1 IS NULL OR department = ?1)
         ORDER BY created_at ASC",
    )?;
    let rows: Vec<(String, String, String, f64, String, String, String)> = stmt
        .query_map(params![department.map(|d| d.as_str())], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for (id, order_id, item_name, quantity, dep, status, created_at) in rows {
        items.push(FulfillmentItem {
            id,
            order_id,
            item_name,
            quantity,
            department: Department::parse(&dep)?,
            status: FulfillmentStatus::parse(&status)?,
            created_at,
        });
    }
    Ok(items)
}

// ---------------------------------------------------------------------------
// Status writes
// ---------------------------------------------------------------------------

/// Advance a single item's fulfillment status.
///
/// The write is validated against the item's department transition
/// table, stamps `sent_to_kitchen_at`/`prepared_at` on the first pass
/// through the respective states, and immediately recomputes the owning
/// order's derived status.
pub fn update_item_status(
    db: &DbState,
    bridge: &SyncBridge,
    order_id: &str,
    item_id: &str,
    new_status: FulfillmentStatus,
) -> Result<(), PosError> {
    let conn = db.lock()?;
    let item = orders::load_item(&conn, item_id)?;

    if item.order_id != order_id {
        return Err(PosError::not_found("Item", item_id));
    }
    if next_status(item.status, item.department) != Some(new_status) {
        return Err(PosError::InvalidTransition(format!(
            "{} -> {} is not allowed for {} department",
            item.status.as_str(),
            new_status.as_str(),
            item.department.as_str()
        )));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<(), PosError> {
        apply_status_in_tx(&conn, item_id, new_status, &now)?;
        orders::recompute_order_status_in_tx(&conn, bridge, order_id)?;
        Ok(())
    })();

    match result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    bridge.publish(
        "order_item",
        item_id,
        ChangeOp::Update,
        &now,
        json!({ "orderId": order_id, "status": new_status.as_str() }),
    );
    info!(
        item_id = %item_id,
        status = %new_status.as_str(),
        department = %item.department.as_str(),
        "Item status updated"
    );
    Ok(())
}

/// Single-field status write plus timestamp stamping, inside the
/// caller's transaction. Shared with the write-off pipeline's fast
/// path.
pub(crate) fn apply_status_in_tx(
    conn: &rusqlite::Connection,
    item_id: &str,
    new_status: FulfillmentStatus,
    now: &str,
) -> Result<(), PosError> {
    conn.execute(
        "UPDATE order_items SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![new_status.as_str(), now, item_id],
    )?;
    match new_status {
        FulfillmentStatus::Cooking => {
            conn.execute(
                "UPDATE order_items SET sent_to_kitchen_at = ?1
                 WHERE id = ?2 AND sent_to_kitchen_at IS NULL",
                params![now, item_id],
            )?;
        }
        FulfillmentStatus::Ready => {
            conn.execute(
                "UPDATE order_items SET prepared_at = ?1
                 WHERE id = ?2 AND prepared_at IS NULL",
                params![now, item_id],
            )?;
        }
        _ => {}
    }
    debug!(item_id = %item_id, status = %new_status.as_str(), "status applied");
    Ok(())
}

/// Department-queue snapshot counts, for display headers.
pub fn queue_depths(db: &DbState) -> Result<(usize, usize), PosError> {
    let conn = db.lock()?;
    let kitchen: i64 = conn.query_row(
        "SELECT COUNT(*) FROM order_items
         WHERE status IN ('waiting', 'cooking') AND department = 'kitchen'",
        [],
        |row| row.get(0),
    )?;
    let bar: i64 = conn.query_row(
        "SELECT COUNT(*) FROM order_items
         WHERE status = 'waiting' AND department = 'bar'",
        [],
        |row| row.get(0),
    )?;
    Ok((kitchen as usize, bar as usize))
}

// ===========================================================================
// Tests
// ===========================================================================
