//! Menu catalog registry for Bistro POS.
//!
//! Read-only collaborator consumed by the decomposition and write-off
//! pipeline: sellable menu items with variants, modifier options, and
//! the preparation recipes their compositions reference. Catalog CRUD
//! itself lives outside this crate; this registry is seeded once per
//! process and handed to services by reference.

use std::collections::HashMap;

use crate::error::PosError;
use crate::types::{Component, Department};

/// A raw stock product (base ingredient).
#[derive(Debug, Clone)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub unit: String,
}

/// One line of a composition or recipe: a component and the quantity
/// consumed per single portion of the parent.
#[derive(Debug, Clone)]
pub struct ComponentLine {
    pub component: Component,
    pub quantity: f64,
}

/// A preparation (semi-finished good) with its own recursive recipe.
#[derive(Debug, Clone)]
pub struct Preparation {
    pub id: String,
    pub name: String,
    pub unit: String,
    pub recipe: Vec<ComponentLine>,
}

/// A sellable variant of a menu item.
#[derive(Debug, Clone)]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub composition: Vec<ComponentLine>,
}

/// A modifier option that adds its own composition when selected.
#[derive(Debug, Clone)]
pub struct ModifierOption {
    pub id: String,
    pub name: String,
    pub composition: Vec<ComponentLine>,
}

/// A sellable menu item.
#[derive(Debug, Clone)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    pub department: Department,
    pub variants: Vec<Variant>,
    pub modifiers: Vec<ModifierOption>,
}

/// In-process catalog lookup.
#[derive(Debug, Default)]
pub struct Catalog {
    menu_items: HashMap<String, MenuItem>,
    preparations: HashMap<String, Preparation>,
    products: HashMap<String, Product>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&mut self, product: Product) {
        self.products.insert(product.id.clone(), product);
    }

    pub fn add_preparation(&mut self, preparation: Preparation) {
        self.preparations
            .insert(preparation.id.clone(), preparation);
    }

    pub fn add_menu_item(&mut self, item: MenuItem) {
        self.menu_items.insert(item.id.clone(), item);
    }

    pub fn product(&self, id: &str) -> Result<&Product, PosError> {
        self.products
            .get(id)
            .ok_or_else(|| PosError::not_found("Product", id))
    }

    pub fn preparation(&self, id: &str) -> Result<&Preparation, PosError> {
        self.preparations
            .get(id)
            .ok_or_else(|| PosError::not_found("Preparation", id))
    }

    pub fn menu_item(&self, id: &str) -> Result<&MenuItem, PosError> {
        self.menu_items
            .get(id)
            .ok_or_else(|| PosError::not_found("MenuItem", id))
    }

    /// Resolve a variant of a menu item. A missing `variant_id` selects
    /// the first (default) variant.
    pub fn variant<'a>(
        &'a self,
        item: &'a MenuItem,
        variant_id: Option<&str>,
    ) -> Result<&'a Variant, PosError> {
        match variant_id {
            Some(vid) => item
                .variants
                .iter()
                .find(|v| v.id == vid)
                .ok_or_else(|| PosError::not_found("Variant", vid)),
            None => item
                .variants
                .first()
                .ok_or_else(|| PosError::not_found("Variant", format!("default of {}", item.id))),
        }
    }

    /// Resolve a modifier option on a menu item.
    pub fn modifier<'a>(
        &'a self,
        item: &'a MenuItem,
        modifier_id: &str,
    ) -> Result<&'a ModifierOption, PosError> {
        item.modifiers
            .iter()
            .find(|m| m.id == modifier_id)
            .ok_or_else(|| PosError::not_found("Modifier", modifier_id))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookups() {
        let mut catalog = Catalog::new();
        catalog.add_product(Product {
            id: "prod-flour".into(),
            name: "Flour".into(),
            unit: "g".into(),
        });
        catalog.add_menu_item(MenuItem {
            id: "mi-pasta".into(),
            name: "Pasta".into(),
            department: Department::Kitchen,
            variants: vec![Variant {
                id: "var-regular".into(),
                name: "Regular".into(),
                composition: vec![ComponentLine {
                    component: Component::Product("prod-flour".into()),
                    quantity: 120.0,
                }],
            }],
            modifiers: vec![],
        });

        assert_eq!(catalog.product("prod-flour").unwrap().name, "Flour");
        assert!(catalog.product("prod-missing").is_err());

        let item = catalog.menu_item("mi-pasta").unwrap();
        // Explicit and default variant resolution agree
        let v1 = catalog.variant(item, Some("var-regular")).unwrap();
        let v2 = catalog.variant(item, None).unwrap();
        assert_eq!(v1.id, v2.id);
        assert!(catalog.variant(item, Some("var-missing")).is_err());
    }

    #[test]
    fn test_missing_modifier_is_not_found() {
        let mut catalog = Catalog::new();
        catalog.add_menu_item(MenuItem {
            id: "mi-1".into(),
            name: "Burger".into(),
            department: Department::Kitchen,
            variants: vec![],
            modifiers: vec![],
        });
        let item = catalog.menu_item("mi-1").unwrap();
        let err = catalog.modifier(item, "mod-x").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
