//! Order/bill/item state machine for Bistro POS.
//!
//! An order owns bills, a bill owns items. Order status and bill
//! payment status are derived from items and recomputed after every
//! item mutation; they are never authored directly, so stored and real
//! status cannot diverge. Items are created `waiting`/`unpaid` with a
//! `pending` write-off flag and flow through the kitchen router and the
//! payment processor from there.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;
use crate::sync::{ChangeOp, SyncBridge};
use crate::types::{
    Department, FulfillmentStatus, ItemPaymentStatus, ItemRecord, OrderType, WriteOffStatus,
};

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Create an order, optionally seating it at a table. Returns the order id.
pub fn create_order(
    db: &DbState,
    bridge: &SyncBridge,
    order_type: OrderType,
    table_id: Option<&str>,
) -> Result<String, PosError> {
    let conn = db.lock()?;
    let order_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<(), PosError> {
        conn.execute(
            "INSERT INTO orders (id, order_type, status, table_id, created_at, updated_at)
             VALUES (?1, ?2, 'draft', ?3, ?4, ?4)",
            params![order_id, order_type.as_str(), table_id, now],
        )?;

        if let Some(table) = table_id {
            let seated = conn.execute(
                "UPDATE tables SET active_order_id = ?1, updated_at = ?2
                 WHERE id = ?3 AND active_order_id IS NULL",
                params![order_id, now, table],
            )?;
            if seated == 0 {
                return Err(PosError::InvalidTransition(format!(
                    "table {table} is missing or already occupied"
                )));
            }
        }
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
        "order",
        &order_id,
        ChangeOp::Insert,
        &now,
        json!({ "orderType": order_type.as_str(), "tableId": table_id }),
    );
    info!(order_id = %order_id, order_type = %order_type.as_str(), "Order created");
    Ok(order_id)
}

/// Add a named bill to an order. Returns the bill id.
pub fn add_bill(db: &DbState, order_id: &str, name: &str) -> Result<String, PosError> {
    let conn = db.lock()?;
    ensure_order_open(&conn, order_id)?;

    let bill_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO bills (id, order_id, name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![bill_id, order_id, name, now],
    )?;
    Ok(bill_id)
}

/// Input for a new order line.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub bill_id: String,
    pub menu_item_id: String,
    pub variant_id: Option<String>,
    pub item_name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount_amount: f64,
    pub department: Department,
    pub modifier_ids: Vec<String>,
}

/// Add an item to a bill. The item starts `waiting` with payment status
/// `unpaid` and write-off status `pending`; the owning order's derived
/// status recomputes immediately.
pub fn add_item(db: &DbState, bridge: &SyncBridge, item: &NewItem) -> Result<String, PosError> {
    if item.quantity <= 0.0 {
        return Err(PosError::InvalidAmount(item.quantity));
    }

    let conn = db.lock()?;
    let order_id: String = conn
        .query_row(
            "SELECT order_id FROM bills WHERE id = ?1 AND status = 'active'",
            params![item.bill_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found("Bill", item.bill_id.clone()))?;
    ensure_order_open(&conn, &order_id)?;

    let item_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let modifier_ids = serde_json::to_string(&item.modifier_ids)
        .map_err(|e| PosError::Internal(e.to_string()))?;

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<(), PosError> {
        conn.execute(
            "INSERT INTO order_items (
                id, bill_id, order_id, menu_item_id, variant_id, item_name,
                quantity, unit_price, discount_amount, department,
                status, payment_status, write_off_status, modifier_ids,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                      'waiting', 'unpaid', 'pending', ?11, ?12, ?12)",
            params![
                item_id,
                item.bill_id,
                order_id,
                item.menu_item_id,
                item.variant_id,
                item.item_name,
                item.quantity,
                item.unit_price,
                item.discount_amount,
                item.department.as_str(),
                modifier_ids,
                now,
            ],
        )?;
        recompute_order_status_in_tx(&conn, bridge, &order_id)?;
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
        &item_id,
        ChangeOp::Insert,
        &now,
        json!({
            "billId": item.bill_id,
            "orderId": order_id,
            "name": item.item_name,
            "status": "waiting",
            "department": item.department.as_str(),
        }),
    );
    debug!(item_id = %item_id, order_id = %order_id, "Item added");
    Ok(item_id)
}

fn ensure_order_open(conn: &Connection, order_id: &str) -> Result<(), PosError> {
    let is_closed: Option<i64> = conn
        .query_row(
            "SELECT is_closed FROM orders WHERE id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .optional()?;
    match is_closed {
        None => Err(PosError::not_found("Order", order_id)),
        Some(1) => Err(PosError::InvalidTransition(format!(
            "order {order_id} is closed"
        ))),
        Some(_) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Item loading
// ---------------------------------------------------------------------------

/// Load a fully-typed item row.
pub(crate) fn load_item(conn: &Connection, item_id: &str) -> Result<ItemRecord, PosError> {
    let row = conn
        .query_row(
            "SELECT id, bill_id, order_id, menu_item_id, variant_id, item_name,
                    quantity, unit_price, discount_amount, department, status,
                    payment_status, payment_transaction_id, write_off_status,
                    write_off_operation_id, actual_cost, modifier_ids, updated_at
             FROM order_items WHERE id = ?1",
            params![item_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, Option<String>>(14)?,
                    row.get::<_, Option<f64>>(15)?,
                    row.get::<_, String>(16)?,
                    row.get::<_, String>(17)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| PosError::not_found("Item", item_id))?;

    Ok(ItemRecord {
        id: row.0,
        bill_id: row.1,
        order_id: row.2,
        menu_item_id: row.3,
        variant_id: row.4,
        item_name: row.5,
        quantity: row.6,
        unit_price: row.7,
        discount_amount: row.8,
        department: Department::parse(&row.9)?,
        status: FulfillmentStatus::parse(&row.10)?,
        payment_status: ItemPaymentStatus::parse(&row.11)?,
        payment_transaction_id: row.12,
        write_off_status: WriteOffStatus::parse(&row.13)?,
        write_off_operation_id: row.14,
        actual_cost: row.15,
        modifier_ids: serde_json::from_str(&row.16).unwrap_or_default(),
        updated_at: row.17,
    })
}

// ---------------------------------------------------------------------------
// Derived status
// ---------------------------------------------------------------------------

/// Fold item statuses into the order's derived status.
///
/// The order takes the lowest-priority non-terminal status (`draft <
/// waiting < cooking < ready`). No items at all means `draft`; items
/// that have all moved past the kitchen leave the order `ready`.
pub fn calculate_order_status(statuses: &[FulfillmentStatus]) -> FulfillmentStatus {
    if statuses.is_empty() {
        return FulfillmentStatus::Draft;
    }
    let mut lowest: Option<FulfillmentStatus> = None;
    for status in statuses {
        if let Some(priority) = status.priority() {
            let current = lowest.and_then(|s| s.priority());
            if current.map_or(true, |p| priority < p) {
                lowest = Some(*status);
            }
        }
    }
    lowest.unwrap_or(FulfillmentStatus::Ready)
}

/// Recompute and persist an order's derived status inside the caller's
/// transaction; publishes the change when the status moved.
pub(crate) fn recompute_order_status_in_tx(
    conn: &Connection,
    bridge: &SyncBridge,
    order_id: &str,
) -> Result<FulfillmentStatus, PosError> {
    let mut stmt = conn.prepare("SELECT status FROM order_items WHERE order_id = ?1")?;
    let statuses: Vec<FulfillmentStatus> = stmt
        .query_map(params![order_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .map(|s| FulfillmentStatus::parse(s))
        .collect::<Result<_, _>>()?;

    let computed = calculate_order_status(&statuses);

    let stored: String = conn.query_row(
        "SELECT status FROM orders WHERE id = ?1",
        params![order_id],
        |row| row.get(0),
    )?;

    if stored != computed.as_str() {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![computed.as_str(), now, order_id],
        )?;
        bridge.publish(
            "order",
            order_id,
            ChangeOp::Update,
            &now,
            json!({ "status": computed.as_str() }),
        );
        debug!(order_id = %order_id, status = %computed.as_str(), "Order status recomputed");
    }

    Ok(computed)
}

/// Recompute an order's derived status in its own transaction.
pub fn recompute_order_status(
    db: &DbState,
    bridge: &SyncBridge,
    order_id: &str,
) -> Result<FulfillmentStatus, PosError> {
    let conn = db.lock()?;
    recompute_order_status_in_tx(&conn, bridge, order_id)
}

/// Recompute and persist a bill's payment status from its items.
///
/// `paid` iff every non-cancelled item is paid; `new` when any payment
/// has been recorded against the bill; `unpaid` otherwise.
pub(crate) fn recompute_bill_payment_status_in_tx(
    conn: &Connection,
    bill_id: &str,
) -> Result<ItemPaymentStatus, PosError> {
    let (active, paid): (i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN payment_status = 'paid' THEN 1 ELSE 0 END), 0)
         FROM order_items
         WHERE bill_id = ?1 AND status != 'cancelled'",
        params![bill_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let payments_recorded: i64 = conn.query_row(
        "SELECT COUNT(*) FROM payments WHERE bill_id = ?1 AND status = 'completed'",
        params![bill_id],
        |row| row.get(0),
    )?;

    let status = if active > 0 && paid == active {
        ItemPaymentStatus::Paid
    } else if payments_recorded > 0 || paid > 0 {
        ItemPaymentStatus::New
    } else {
        ItemPaymentStatus::Unpaid
    };

    conn.execute(
        "UPDATE bills SET payment_status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), Utc::now().to_rfc3339(), bill_id],
    )?;
    Ok(status)
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancel an item. Paid items cannot be cancelled; cancellation
/// recomputes the order's derived status.
pub fn cancel_item(
    db: &DbState,
    bridge: &SyncBridge,
    item_id: &str,
    reason: &str,
) -> Result<(), PosError> {
    let conn = db.lock()?;
    let item = load_item(&conn, item_id)?;

    if item.payment_status == ItemPaymentStatus::Paid {
        return Err(PosError::InvalidTransition(format!(
            "cannot cancel paid item {item_id}"
        )));
    }
    if item.status == FulfillmentStatus::Cancelled {
        return Err(PosError::InvalidTransition(format!(
            "item {item_id} is already cancelled"
        )));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<(), PosError> {
        conn.execute(
            "UPDATE order_items
             SET status = 'cancelled', cancelled_reason = ?1, updated_at = ?2
             WHERE id = ?3",
            params![reason, now, item_id],
        )?;
        recompute_order_status_in_tx(&conn, bridge, &item.order_id)?;
        recompute_bill_payment_status_in_tx(&conn, &item.bill_id)?;
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
        json!({ "status": "cancelled", "reason": reason }),
    );
    info!(item_id = %item_id, reason = %reason, "Item cancelled");
    Ok(())
}

// ---------------------------------------------------------------------------
// Bill movement & order close
// ---------------------------------------------------------------------------

/// Move a bill (and its items) to another order. Both orders recompute;
/// a source order left with no bills is closed.
pub fn move_bill(
    db: &DbState,
    bridge: &SyncBridge,
    bill_id: &str,
    target_order_id: &str,
) -> Result<(), PosError> {
    let conn = db.lock()?;

    let source_order_id: String = conn
        .query_row(
            "SELECT order_id FROM bills WHERE id = ?1",
            params![bill_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found("Bill", bill_id))?;
    ensure_order_open(&conn, target_order_id)?;

    if source_order_id == target_order_id {
        return Err(PosError::InvalidTransition(format!(
            "bill {bill_id} already belongs to order {target_order_id}"
        )));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<(), PosError> {
        conn.execute(
            "UPDATE bills SET order_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![target_order_id, now, bill_id],
        )?;
        conn.execute(
            "UPDATE order_items SET order_id = ?1, updated_at = ?2 WHERE bill_id = ?3",
            params![target_order_id, now, bill_id],
        )?;
        recompute_order_status_in_tx(&conn, bridge, &source_order_id)?;
        recompute_order_status_in_tx(&conn, bridge, target_order_id)?;

        // A source order emptied by the move is finished.
        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bills WHERE order_id = ?1",
            params![source_order_id],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            close_order_in_tx(&conn, &source_order_id, &now)?;
        }
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
        "bill",
        bill_id,
        ChangeOp::Update,
        &now,
        json!({ "orderId": target_order_id, "movedFrom": source_order_id }),
    );
    info!(bill_id = %bill_id, from = %source_order_id, to = %target_order_id, "Bill moved");
    Ok(())
}

/// Close the order when every item is paid or cancelled. Returns `true`
/// if the order was closed by this call.
pub fn close_order_if_settled(
    db: &DbState,
    bridge: &SyncBridge,
    order_id: &str,
) -> Result<bool, PosError> {
    let conn = db.lock()?;
    let closed = close_order_if_settled_in_tx(&conn, order_id)?;
    if closed {
        let now = Utc::now().to_rfc3339();
        bridge.publish(
            "order",
            order_id,
            ChangeOp::Update,
            &now,
            json!({ "closed": true }),
        );
    }
    Ok(closed)
}

pub(crate) fn close_order_if_settled_in_tx(
    conn: &Connection,
    order_id: &str,
) -> Result<bool, PosError> {
    let (total, settled): (i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN payment_status = 'paid' OR status = 'cancelled'
                             THEN 1 ELSE 0 END), 0)
         FROM order_items WHERE order_id = ?1",
        params![order_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if total == 0 || settled < total {
        return Ok(false);
    }

    let now = Utc::now().to_rfc3339();
    close_order_in_tx(conn, order_id, &now)?;
    Ok(true)
}

fn close_order_in_tx(conn: &Connection, order_id: &str, now: &str) -> Result<(), PosError> {
    conn.execute(
        "UPDATE orders SET is_closed = 1, closed_at = ?1, updated_at = ?1
         WHERE id = ?2 AND is_closed = 0",
        params![now, order_id],
    )?;
    conn.execute(
        "UPDATE tables SET active_order_id = NULL, updated_at = ?1
         WHERE active_order_id = ?2",
        params![now, order_id],
    )?;
    info!(order_id = %order_id, "Order closed");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn setup() -> (DbState, SyncBridge) {
        (db::init_in_memory().unwrap(), SyncBridge::new(64))
    }

    fn seed_table(db: &DbState, table_id: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tables (id, name) VALUES (?1, ?1)",
            params![table_id],
        )
        .unwrap();
    }

    fn kitchen_item(bill_id: &str, name: &str, price: f64) -> NewItem {
        NewItem {
            bill_id: bill_id.to_string(),
            menu_item_id: format!("mi-{name}"),
            variant_id: None,
            item_name: name.to_string(),
            quantity: 1.0,
            unit_price: price,
            discount_amount: 0.0,
            department: Department::Kitchen,
            modifier_ids: vec![],
        }
    }

    #[test]
    fn test_calculate_order_status_fold() {
        use FulfillmentStatus::*;
        assert_eq!(calculate_order_status(&[]), Draft);
        assert_eq!(calculate_order_status(&[Waiting, Ready]), Waiting);
        assert_eq!(calculate_order_status(&[Cooking, Ready]), Cooking);
        assert_eq!(calculate_order_status(&[Ready, Ready]), Ready);
        // Terminal statuses are excluded from the fold
        assert_eq!(calculate_order_status(&[Ready, Cancelled]), Ready);
        assert_eq!(calculate_order_status(&[Served, Cancelled]), Ready);
        assert_eq!(calculate_order_status(&[Draft, Cooking]), Draft);
    }

    #[test]
    fn test_add_item_recomputes_order_status() {
        let (db, bridge) = setup();
        let order_id = create_order(&db, &bridge, OrderType::DineIn, None).unwrap();
        let bill_id = add_bill(&db, &order_id, "Bill 1").unwrap();

        let conn = db.conn.lock().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM orders WHERE id = ?1", params![order_id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(status, "draft");
        drop(conn);

        add_item(&db, &bridge, &kitchen_item(&bill_id, "soup", 9.0)).unwrap();

        let conn = db.conn.lock().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM orders WHERE id = ?1", params![order_id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(status, "waiting");
    }

    #[test]
    fn test_create_order_rejects_occupied_table() {
        let (db, bridge) = setup();
        seed_table(&db, "t1");
        create_order(&db, &bridge, OrderType::DineIn, Some("t1")).unwrap();
        let err = create_order(&db, &bridge, OrderType::DineIn, Some("t1")).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn test_cancel_item_rules() {
        let (db, bridge) = setup();
        let order_id = create_order(&db, &bridge, OrderType::Takeaway, None).unwrap();
        let bill_id = add_bill(&db, &order_id, "Bill").unwrap();
        let item_id = add_item(&db, &bridge, &kitchen_item(&bill_id, "soup", 9.0)).unwrap();

        cancel_item(&db, &bridge, &item_id, "86'd").unwrap();
        // Double-cancel is a logic error, not a silent no-op
        let err = cancel_item(&db, &bridge, &item_id, "again").unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        // A paid item cannot be cancelled
        let item2 = add_item(&db, &bridge, &kitchen_item(&bill_id, "salad", 7.0)).unwrap();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE order_items SET payment_status = 'paid' WHERE id = ?1",
                params![item2],
            )
            .unwrap();
        }
        let err = cancel_item(&db, &bridge, &item2, "nope").unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn test_move_bill_transfers_items_and_closes_empty_source() {
        let (db, bridge) = setup();
        seed_table(&db, "t1");
        let source = create_order(&db, &bridge, OrderType::DineIn, Some("t1")).unwrap();
        let target = create_order(&db, &bridge, OrderType::DineIn, None).unwrap();
        let bill_id = add_bill(&db, &source, "Movers").unwrap();
        add_item(&db, &bridge, &kitchen_item(&bill_id, "soup", 9.0)).unwrap();

        move_bill(&db, &bridge, &bill_id, &target).unwrap();

        let conn = db.conn.lock().unwrap();
        let owner: String = conn
            .query_row("SELECT order_id FROM bills WHERE id = ?1", params![bill_id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(owner, target);
        let item_owner: String = conn
            .query_row(
                "SELECT DISTINCT order_id FROM order_items WHERE bill_id = ?1",
                params![bill_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(item_owner, target);

        // Source emptied: closed, table freed
        let (is_closed, table_order): (i64, Option<String>) = conn
            .query_row(
                "SELECT o.is_closed, t.active_order_id
                 FROM orders o LEFT JOIN tables t ON t.id = o.table_id
                 WHERE o.id = ?1",
                params![source],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(is_closed, 1);
        assert!(table_order.is_none());
        // Target picked up the moved items' status
        let status: String = conn
            .query_row("SELECT status FROM orders WHERE id = ?1", params![target], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(status, "waiting");
    }

    #[test]
    fn test_close_order_when_all_settled() {
        let (db, bridge) = setup();
        let order_id = create_order(&db, &bridge, OrderType::DineIn, None).unwrap();
        let bill_id = add_bill(&db, &order_id, "Bill").unwrap();
        let paid = add_item(&db, &bridge, &kitchen_item(&bill_id, "soup", 9.0)).unwrap();
        let cancelled = add_item(&db, &bridge, &kitchen_item(&bill_id, "salad", 7.0)).unwrap();

        assert!(!close_order_if_settled(&db, &bridge, &order_id).unwrap());

        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE order_items SET payment_status = 'paid' WHERE id = ?1",
                params![paid],
            )
            .unwrap();
        }
        cancel_item(&db, &bridge, &cancelled, "out of stock").unwrap();

        assert!(close_order_if_settled(&db, &bridge, &order_id).unwrap());
        // Closed orders reject new bills
        let err = add_bill(&db, &order_id, "Late").unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn test_bill_payment_status_recompute() {
        let (db, bridge) = setup();
        let order_id = create_order(&db, &bridge, OrderType::DineIn, None).unwrap();
        let bill_id = add_bill(&db, &order_id, "Bill").unwrap();
        let it1 = add_item(&db, &bridge, &kitchen_item(&bill_id, "soup", 9.0)).unwrap();
        let it2 = add_item(&db, &bridge, &kitchen_item(&bill_id, "salad", 7.0)).unwrap();

        let conn = db.conn.lock().unwrap();
        assert_eq!(
            recompute_bill_payment_status_in_tx(&conn, &bill_id).unwrap(),
            ItemPaymentStatus::Unpaid
        );

        conn.execute(
            "UPDATE order_items SET payment_status = 'paid' WHERE id = ?1",
            params![it1],
        )
        .unwrap();
        assert_eq!(
            recompute_bill_payment_status_in_tx(&conn, &bill_id).unwrap(),
            ItemPaymentStatus::New
        );

        conn.execute(
            "UPDATE order_items SET payment_status = 'paid' WHERE id = ?1",
            params![it2],
        )
        .unwrap();
        assert_eq!(
            recompute_bill_payment_status_in_tx(&conn, &bill_id).unwrap(),
            ItemPaymentStatus::Paid
        );
    }
}
