//! Ingredient decomposition and cost resolution for Bistro POS.
//!
//! Expands a sold menu item (variant composition plus selected
//! modifiers) into base products, recursing through nested
//! preparations, then prices the expansion against the FIFO batch
//! ledger without mutating it. The write-off pipeline uses the same
//! expansion to drive the actual deduction.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{Catalog, ComponentLine};
use crate::db::DbState;
use crate::error::PosError;
use crate::inventory;
use crate::types::Component;

/// A base product with the total quantity consumed by one sold line.
#[derive(Debug, Clone, PartialEq)]
pub struct DecomposedProduct {
    pub product_id: String,
    pub product_name: String,
    pub quantity: f64,
    pub unit: String,
}

/// Per-product slice of a priced decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCost {
    pub product_id: String,
    pub product_name: String,
    pub quantity: f64,
    pub unit_cost: f64,
    pub total_cost: f64,
}

/// Priced decomposition, cached on the item after a write-off so the
/// payment path can skip recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub products: Vec<ProductCost>,
    pub total_cost: f64,
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

/// Expand a sold item into base products.
///
/// `quantity` is the number of sold portions; component quantities are
/// per portion and multiply down the tree. Duplicate products merge.
pub fn decompose_item(
    catalog: &Catalog,
    menu_item_id: &str,
    variant_id: Option<&str>,
    modifier_ids: &[String],
    quantity: f64,
) -> Result<Vec<DecomposedProduct>, PosError> {
    let menu_item = catalog.menu_item(menu_item_id)?;
    let variant = catalog.variant(menu_item, variant_id)?;

    let mut results = Vec::new();
    let mut path = Vec::new();

    for line in &variant.composition {
        expand_component(catalog, line, quantity, &mut path, &mut results)?;
    }

    for modifier_id in modifier_ids {
        let modifier = catalog.modifier(menu_item, modifier_id)?;
        for line in &modifier.composition {
            expand_component(catalog, line, quantity, &mut path, &mut results)?;
        }
    }

    let merged = merge_products(results);
    debug!(
        menu_item_id = %menu_item_id,
        products = merged.len(),
        "Item decomposed"
    );
    Ok(merged)
}

fn expand_component(
    catalog: &Catalog,
    line: &ComponentLine,
    multiplier: f64,
    path: &mut Vec<String>,
    out: &mut Vec<DecomposedProduct>,
) -> Result<(), PosError> {
    let total_quantity = line.quantity * multiplier;
    match &line.component {
        Component::Product(id) => {
            let product = catalog.product(id)?;
            out.push(DecomposedProduct {
                product_id: product.id.clone(),
                product_name: product.name.clone(),
                quantity: total_quantity,
                unit: product.unit.clone(),
            });
            Ok(())
        }
        Component::Preparation(id) => {
            if path.iter().any(|p| p == id) {
                return Err(PosError::Internal(format!(
                    "preparation cycle detected at {id}"
                )));
            }
            let preparation = catalog.preparation(id)?;
            path.push(id.clone());
            for nested in &preparation.recipe {
                expand_component(catalog, nested, total_quantity, path, out)?;
            }
            path.pop();
            Ok(())
        }
    }
}

fn merge_products(items: Vec<DecomposedProduct>) -> Vec<DecomposedProduct> {
    let mut merged: Vec<DecomposedProduct> = Vec::new();
    for item in items {
        match merged
            .iter_mut()
            .find(|m| m.product_id == item.product_id && m.unit == item.unit)
        {
            Some(existing) => existing.quantity += item.quantity,
            None => merged.push(item),
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Price a decomposition against the ledger's FIFO batches without
/// consuming stock. Any quantity the recorded stock cannot cover is
/// priced at the item's last known cost, mirroring what a real
/// deduction would charge the negative batch.
pub(crate) fn price_in_tx(
    conn: &Connection,
    products: &[DecomposedProduct],
) -> Result<CostBreakdown, PosError> {
    let mut costs = Vec::with_capacity(products.len());
    let mut total = 0.0;

    for product in products {
        let (allocations, shortfall) =
            inventory::fifo_preview(conn, &product.product_id, product.quantity)?;
        let mut cost: f64 = allocations.iter().map(|a| a.quantity * a.cost_per_unit).sum();
        if shortfall > 0.0 {
            cost += shortfall * inventory::last_known_cost(conn, &product.product_id);
        }
        let unit_cost = if product.quantity > 0.0 {
            cost / product.quantity
        } else {
            0.0
        };
        total += cost;
        costs.push(ProductCost {
            product_id: product.product_id.clone(),
            product_name: product.product_name.clone(),
            quantity: product.quantity,
            unit_cost,
            total_cost: cost,
        });
    }

    Ok(CostBreakdown {
        products: costs,
        total_cost: total,
    })
}

/// Decompose and price a sold item in one call (the payment fallback
/// path when no cached cost exists).
pub fn resolve_cost(
    db: &DbState,
    catalog: &Catalog,
    menu_item_id: &str,
    variant_id: Option<&str>,
    modifier_ids: &[String],
    quantity: f64,
) -> Result<CostBreakdown, PosError> {
    let products = decompose_item(catalog, menu_item_id, variant_id, modifier_ids, quantity)?;
    let conn = db.lock()?;
    price_in_tx(&conn, &products)
}

// ===========================================================================
// Tests
// ===========================================================================
