//! Payment processing for Bistro POS.
//!
//! Validates a payment request (selection mode, account, amount),
//! settles each target bill atomically — one payment row for the full
//! outstanding amount, every covered item marked paid exactly once with
//! a transaction reference — and credits the settlement account.
//! Partial success across bills in one request is allowed and reported;
//! a single bill never mutates partially.
//!
//! Cost of goods rides along on each payment: the cached write-off cost
//! when the ready-trigger already ran (fast path), a fresh FIFO costing
//! otherwise.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::accounts;
use crate::catalog::Catalog;
use crate::db::DbState;
use crate::decompose;
use crate::error::PosError;
use crate::orders;
use crate::sync::{ChangeOp, SyncBridge};
use crate::types::{FulfillmentStatus, ItemPaymentStatus, WriteOffStatus};

const PAYMENT_METHODS: &[&str] = &["cash", "card", "qr"];

/// A payment request from a terminal.
///
/// Selection modes are mutually exclusive: explicit `bill_ids`,
/// explicit `item_ids`, or neither (all unpaid items in the order).
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: String,
    pub account_id: String,
    pub method: String,
    pub amount: f64,
    pub bill_ids: Vec<String>,
    pub item_ids: Vec<String>,
    pub processed_by: Option<String>,
}

/// Settlement result for one bill.
#[derive(Debug, Clone)]
pub struct BillPaymentResult {
    pub bill_id: String,
    pub payment_id: String,
    pub amount: f64,
    pub cost_of_goods: f64,
    pub items_paid: usize,
}

/// Outcome of one payment request.
#[derive(Debug, Clone, Default)]
pub struct PaymentOutcome {
    pub processed_bills: usize,
    pub failed_bills: usize,
    pub total_paid: f64,
    pub total_cost_of_goods: f64,
    pub results: Vec<BillPaymentResult>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Process a payment request.
///
/// Validation failures reject synchronously with a code and no
/// mutation. Each target bill settles in its own transaction; a bill
/// that fails rolls back alone and the rest continue.
pub fn process_payment(
    db: &DbState,
    catalog: &Catalog,
    bridge: &SyncBridge,
    request: &PaymentRequest,
) -> Result<PaymentOutcome, PosError> {
    if request.amount <= 0.0 {
        return Err(PosError::InvalidAmount(request.amount));
    }
    if !PAYMENT_METHODS.contains(&request.method.as_str()) {
        return Err(PosError::InvalidSelection(format!(
            "unknown payment method: {}",
            request.method
        )));
    }

    let conn = db.lock()?;

    let account = accounts::get_account_in_tx(&conn, &request.account_id)?;
    if !account.is_active {
        return Err(PosError::InvalidAccount(request.account_id.clone()));
    }

    ensure_order_exists(&conn, &request.order_id)?;
    let targets = resolve_selection(&conn, request)?;

    let mut outcome = PaymentOutcome::default();
    let mut settled_events = Vec::new();

    for (bill_id, selected_items) in &targets {
        match settle_bill(
            &conn,
            catalog,
            request,
            bill_id,
            selected_items.as_deref(),
        ) {
            Ok(Some(result)) => {
                outcome.total_paid += result.amount;
                outcome.total_cost_of_goods += result.cost_of_goods;
                outcome.processed_bills += 1;
                settled_events.push(result.clone());
                outcome.results.push(result);
            }
            Ok(None) => {
                // Nothing outstanding on this bill; not a failure.
            }
            Err(e) => {
                warn!(bill_id = %bill_id, error = %e, "Bill settlement failed, continuing");
                outcome.failed_bills += 1;
            }
        }
    }

    if outcome.processed_bills == 0 {
        return Err(PosError::NoItemsProcessed);
    }

    orders::close_order_if_settled_in_tx(&conn, &request.order_id)?;
    drop(conn);

    for result in &settled_events {
        let now = Utc::now().to_rfc3339();
        bridge.publish(
            "payment",
            &result.payment_id,
            ChangeOp::Insert,
            &now,
            json!({
                "billId": result.bill_id,
                "orderId": request.order_id,
                "method": request.method,
                "amount": result.amount,
            }),
        );
        bridge.publish(
            "bill",
            &result.bill_id,
            ChangeOp::Update,
            &now,
            json!({ "paymentStatus": "paid" }),
        );
    }

    info!(
        order_id = %request.order_id,
        processed = outcome.processed_bills,
        failed = outcome.failed_bills,
        total = %outcome.total_paid,
        "Payment processed"
    );
    Ok(outcome)
}

fn ensure_order_exists(conn: &Connection, order_id: &str) -> Result<(), PosError> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM orders WHERE id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(PosError::not_found("Order", order_id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Resolve the request's selection mode into target bills, each with an
/// optional explicit item subset (`None` = every unpaid item).
fn resolve_selection(
    conn: &Connection,
    request: &PaymentRequest,
) -> Result<BTreeMap<String, Option<Vec<String>>>, PosError> {
    if !request.bill_ids.is_empty() && !request.item_ids.is_empty() {
        return Err(PosError::InvalidSelection(
            "bill and item selection are mutually exclusive".into(),
        ));
    }

    let mut targets: BTreeMap<String, Option<Vec<String>>> = BTreeMap::new();

    if !request.bill_ids.is_empty() {
        for bill_id in &request.bill_ids {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT order_id FROM bills WHERE id = ?1 AND status = 'active'",
                    params![bill_id],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                Some(order_id) if order_id == request.order_id => {
                    targets.insert(bill_id.clone(), None);
                }
                _ => {
                    return Err(PosError::InvalidSelection(format!(
                        "bill {bill_id} is not an active bill of order {}",
                        request.order_id
                    )));
                }
            }
        }
    } else if !request.item_ids.is_empty() {
        for item_id in &request.item_ids {
            let item = orders::load_item(conn, item_id)?;
            if item.order_id != request.order_id {
                return Err(PosError::InvalidSelection(format!(
                    "item {item_id} does not belong to order {}",
                    request.order_id
                )));
            }
            if item.status == FulfillmentStatus::Cancelled {
                return Err(PosError::InvalidSelection(format!(
                    "item {item_id} is cancelled"
                )));
            }
            if item.payment_status == ItemPaymentStatus::Paid {
                return Err(PosError::InvalidTransition(format!(
                    "item {item_id} is already paid"
                )));
            }
            targets
                .entry(item.bill_id.clone())
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(item_id.clone());
        }
    } else {
        // All unpaid in the order.
        let mut stmt =
            conn.prepare("SELECT id FROM bills WHERE order_id = ?1 AND status = 'active'")?;
        let bill_ids: Vec<String> = stmt
            .query_map(params![request.order_id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        for bill_id in bill_ids {
            targets.insert(bill_id, None);
        }
    }

    Ok(targets)
}

// ---------------------------------------------------------------------------
// Per-bill settlement
// ---------------------------------------------------------------------------

/// Settle one bill all-or-nothing. Returns `Ok(None)` when the bill has
/// nothing outstanding in the selection.
fn settle_bill(
    conn: &Connection,
    catalog: &Catalog,
    request: &PaymentRequest,
    bill_id: &str,
    selected_items: Option<&[String]>,
) -> Result<Option<BillPaymentResult>, PosError> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Option<BillPaymentResult>, PosError> {
        // Covered items: non-cancelled, not yet paid, within the
        // explicit selection when one was given.
        let mut stmt = conn.prepare(
            "SELECT id FROM order_items
             WHERE bill_id = ?1 AND status != 'cancelled' AND payment_status != 'paid'
             ORDER BY created_at ASC",
        )?;
        let mut covered: Vec<String> = stmt
            .query_map(params![bill_id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        if let Some(selection) = selected_items {
            covered.retain(|id| selection.contains(id));
        }

        if covered.is_empty() {
            return Ok(None);
        }

        let mut outstanding = 0.0;
        let mut cost_of_goods = 0.0;
        let mut item_records = Vec::with_capacity(covered.len());
        for item_id in &covered {
            let item = orders::load_item(conn, item_id)?;
            outstanding += item.line_total();
            cost_of_goods += resolve_item_cost(conn, catalog, &item)?;
            item_records.push(item);
        }

        if outstanding <= 0.0 {
            return Ok(None);
        }

        let payment_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO payments (
                id, bill_id, order_id, account_id, method, amount,
                cost_of_goods, status, processed_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'completed', ?8, ?9)",
            params![
                payment_id,
                bill_id,
                request.order_id,
                request.account_id,
                request.method,
                outstanding,
                cost_of_goods,
                request.processed_by,
                now,
            ],
        )?;

        // Mark every covered item paid, exactly once. A miss means the
        // item changed under us: abort the whole bill.
        for item in &item_records {
            let marked = conn.execute(
                "UPDATE order_items
                 SET payment_status = 'paid', payment_transaction_id = ?1,
                     paid_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND payment_status != 'paid' AND status != 'cancelled'",
                params![payment_id, now, item.id],
            )?;
            if marked != 1 {
                return Err(PosError::InvalidTransition(format!(
                    "item {} changed during settlement",
                    item.id
                )));
            }
        }

        conn.execute(
            "INSERT INTO payment_events (bill_id, payment_id, event_type, amount, created_at)
             VALUES (?1, ?2, 'payment', ?3, ?4)",
            params![bill_id, payment_id, outstanding, now],
        )?;

        orders::recompute_bill_payment_status_in_tx(conn, bill_id)?;
        accounts::credit_in_tx(conn, &request.account_id, outstanding)?;

        Ok(Some(BillPaymentResult {
            bill_id: bill_id.to_string(),
            payment_id,
            amount: outstanding,
            cost_of_goods,
            items_paid: item_records.len(),
        }))
    })();

    match result {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Cost of goods for one item: the write-off pipeline's cached cost
/// when it already completed (fast path), otherwise a fresh FIFO
/// costing through the resolver (fallback).
fn resolve_item_cost(
    conn: &Connection,
    catalog: &Catalog,
    item: &crate::types::ItemRecord,
) -> Result<f64, PosError> {
    if item.write_off_status == WriteOffStatus::Completed {
        if let Some(cached) = item.actual_cost {
            return Ok(cached);
        }
    }
    let products = decompose::decompose_item(
        catalog,
        &item.menu_item_id,
        item.variant_id.as_deref(),
        &item.modifier_ids,
        item.quantity,
    )?;
    let breakdown = decompose::price_in_tx(conn, &products)?;
    Ok(breakdown.total_cost)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Payment history rows for a bill, newest first.
pub fn bill_payments(
    db: &DbState,
    bill_id: &str,
) -> Result<Vec<(String, f64, String)>, PosError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, amount, created_at FROM payments
         WHERE bill_id = ?1 AND status = 'completed'
         ORDER BY created_at DESC",
    )?;
    let rows = stmt
        .query_map(params![bill_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

// ===========================================================================
// Tests
// ===========================================================================
