//! Domain types for Bistro POS.
//!
//! Status enums are closed sets stored as snake_case TEXT in SQLite; the
//! `as_str`/`parse` pairs must stay in lockstep with the column defaults
//! in `db.rs`. Derived statuses (order, bill payment, table occupancy)
//! are computed from items, never authored directly.

use serde::{Deserialize, Serialize};

use crate::error::PosError;

// ---------------------------------------------------------------------------
// Fulfillment status
// ---------------------------------------------------------------------------

/// Item/order fulfillment status.
///
/// Kitchen items move `waiting -> cooking -> ready`; bar items skip
/// `cooking` entirely. Everything after `ready` is driven by the POS
/// layer, not the kitchen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Draft,
    Waiting,
    Cooking,
    Ready,
    Served,
    Collected,
    Delivered,
    Cancelled,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Draft => "draft",
            FulfillmentStatus::Waiting => "waiting",
            FulfillmentStatus::Cooking => "cooking",
            FulfillmentStatus::Ready => "ready",
            FulfillmentStatus::Served => "served",
            FulfillmentStatus::Collected => "collected",
            FulfillmentStatus::Delivered => "delivered",
            FulfillmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PosError> {
        match s {
            "draft" => Ok(FulfillmentStatus::Draft),
            "waiting" => Ok(FulfillmentStatus::Waiting),
            "cooking" => Ok(FulfillmentStatus::Cooking),
            "ready" => Ok(FulfillmentStatus::Ready),
            "served" => Ok(FulfillmentStatus::Served),
            "collected" => Ok(FulfillmentStatus::Collected),
            "delivered" => Ok(FulfillmentStatus::Delivered),
            "cancelled" => Ok(FulfillmentStatus::Cancelled),
            other => Err(PosError::Internal(format!(
                "unknown fulfillment status: {other}"
            ))),
        }
    }

    /// Priority used by the order-status fold: `draft < waiting < cooking
    /// < ready`. Terminal states (served and beyond, cancelled) carry no
    /// priority and are excluded from the fold.
    pub fn priority(&self) -> Option<u8> {
        match self {
            FulfillmentStatus::Draft => Some(0),
            FulfillmentStatus::Waiting => Some(1),
            FulfillmentStatus::Cooking => Some(2),
            FulfillmentStatus::Ready => Some(3),
            _ => None,
        }
    }

    /// True for states the kitchen no longer owns.
    pub fn is_terminal(&self) -> bool {
        self.priority().is_none()
    }
}

// ---------------------------------------------------------------------------
// Payment status
// ---------------------------------------------------------------------------

/// Per-item payment status. `paid` is write-once: the transaction
/// reference attached at payment time never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemPaymentStatus {
    Unpaid,
    New,
    Paid,
}

impl ItemPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemPaymentStatus::Unpaid => "unpaid",
            ItemPaymentStatus::New => "new",
            ItemPaymentStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PosError> {
        match s {
            "unpaid" => Ok(ItemPaymentStatus::Unpaid),
            "new" => Ok(ItemPaymentStatus::New),
            "paid" => Ok(ItemPaymentStatus::Paid),
            other => Err(PosError::Internal(format!(
                "unknown payment status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Write-off status
// ---------------------------------------------------------------------------

/// Inventory write-off lifecycle for an item.
///
/// `processing` is a transient lock, not a terminal state: an item moves
/// `pending -> completed` exactly once per lifetime, and any failure or
/// stale crash rolls the flag back to `pending` for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOffStatus {
    Pending,
    Processing,
    Completed,
}

impl WriteOffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOffStatus::Pending => "pending",
            WriteOffStatus::Processing => "processing",
            WriteOffStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PosError> {
        match s {
            "pending" => Ok(WriteOffStatus::Pending),
            "processing" => Ok(WriteOffStatus::Processing),
            "completed" => Ok(WriteOffStatus::Completed),
            other => Err(PosError::Internal(format!(
                "unknown write-off status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Department & roles
// ---------------------------------------------------------------------------

/// Preparation station responsible for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Department {
    Kitchen,
    Bar,
}

impl Department {
    pub fn as_str(&self) -> &'static str {
        match self {
            Department::Kitchen => "kitchen",
            Department::Bar => "bar",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PosError> {
        match s {
            "kitchen" => Ok(Department::Kitchen),
            "bar" => Ok(Department::Bar),
            other => Err(PosError::Internal(format!("unknown department: {other}"))),
        }
    }
}

/// Role of the acting user, used to gate department queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Admin,
    Kitchen,
    Bar,
}

// ---------------------------------------------------------------------------
// Order / bill / table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    DineIn,
    Takeaway,
    Delivery,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::DineIn => "dine_in",
            OrderType::Takeaway => "takeaway",
            OrderType::Delivery => "delivery",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PosError> {
        match s {
            "dine_in" => Ok(OrderType::DineIn),
            "takeaway" => Ok(OrderType::Takeaway),
            "delivery" => Ok(OrderType::Delivery),
            other => Err(PosError::Internal(format!("unknown order type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Active,
    Closed,
    Cancelled,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Active => "active",
            BillStatus::Closed => "closed",
            BillStatus::Cancelled => "cancelled",
        }
    }
}

/// Derived table occupancy. Never stored; recomputed from the active
/// order's items on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Free,
    OccupiedUnpaid,
    OccupiedPaid,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Free => "free",
            TableStatus::OccupiedUnpaid => "occupied_unpaid",
            TableStatus::OccupiedPaid => "occupied_paid",
        }
    }
}

// ---------------------------------------------------------------------------
// Ingredient tree
// ---------------------------------------------------------------------------

/// A component of a sellable item's composition: either a raw product or
/// a nested preparation whose own recipe expands recursively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Component {
    Product(String),
    Preparation(String),
}

impl Component {
    pub fn id(&self) -> &str {
        match self {
            Component::Product(id) | Component::Preparation(id) => id,
        }
    }
}

// ---------------------------------------------------------------------------
// Item record
// ---------------------------------------------------------------------------

/// Fully-typed row from `order_items`.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub id: String,
    pub bill_id: String,
    pub order_id: String,
    pub menu_item_id: String,
    pub variant_id: Option<String>,
    pub item_name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount_amount: f64,
    pub department: Department,
    pub status: FulfillmentStatus,
    pub payment_status: ItemPaymentStatus,
    pub payment_transaction_id: Option<String>,
    pub write_off_status: WriteOffStatus,
    pub write_off_operation_id: Option<String>,
    pub actual_cost: Option<f64>,
    pub modifier_ids: Vec<String>,
    pub updated_at: String,
}

impl ItemRecord {
    /// Line total net of the per-item discount.
    pub fn line_total(&self) -> f64 {
        (self.quantity * self.unit_price - self.discount_amount).max(0.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            "draft",
            "waiting",
            "cooking",
            "ready",
            "served",
            "collected",
            "delivered",
            "cancelled",
        ] {
            assert_eq!(FulfillmentStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(FulfillmentStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(
            FulfillmentStatus::Draft.priority() < FulfillmentStatus::Waiting.priority()
        );
        assert!(
            FulfillmentStatus::Waiting.priority() < FulfillmentStatus::Cooking.priority()
        );
        assert!(
            FulfillmentStatus::Cooking.priority() < FulfillmentStatus::Ready.priority()
        );
        assert!(FulfillmentStatus::Served.is_terminal());
        assert!(FulfillmentStatus::Cancelled.is_terminal());
        assert!(!FulfillmentStatus::Ready.is_terminal());
    }

    #[test]
    fn test_aux_status_strings() {
        assert_eq!(BillStatus::Active.as_str(), "active");
        assert_eq!(BillStatus::Cancelled.as_str(), "cancelled");
        assert_eq!(TableStatus::OccupiedPaid.as_str(), "occupied_paid");
        assert_eq!(OrderType::parse("takeaway").unwrap(), OrderType::Takeaway);
        assert!(OrderType::parse("drive-through").is_err());
    }

    #[test]
    fn test_component_serde_tagging() {
        let c = Component::Preparation("prep-1".into());
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"type":"preparation","id":"prep-1"}"#);
        let back: Component = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_line_total_discount_floor() {
        let item = ItemRecord {
            id: "i1".into(),
            bill_id: "b1".into(),
            order_id: "o1".into(),
            menu_item_id: "m1".into(),
            variant_id: None,
            item_name: "Espresso".into(),
            quantity: 2.0,
            unit_price: 3.5,
            discount_amount: 10.0,
            department: Department::Bar,
            status: FulfillmentStatus::Waiting,
            payment_status: ItemPaymentStatus::Unpaid,
            payment_transaction_id: None,
            write_off_status: WriteOffStatus::Pending,
            write_off_operation_id: None,
            actual_cost: None,
            modifier_ids: vec![],
            updated_at: String::new(),
        };
        // Discount larger than the line never produces a negative total.
        assert_eq!(item.line_total(), 0.0);
    }
}
