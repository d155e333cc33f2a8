//! Realtime change fan-out for Bistro POS.
//!
//! Propagates order/item/payment/batch mutations to every connected
//! display over a broadcast channel. Delivery is eventually consistent:
//! a consumer may observe an event before or after the authoritative
//! row is queryable, and events can arrive out of order. Consumers
//! de-duplicate with the entity's `updated_at` timestamp via
//! [`EventCache`], never by assuming delivery order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Kind of mutation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One entity mutation, fanned out to all subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entity kind: `order`, `bill`, `order_item`, `payment`, `batch`.
    pub entity: String,
    pub entity_id: String,
    pub op: ChangeOp,
    /// RFC3339 UTC timestamp of the authoritative row at publish time.
    /// The de-duplication key: newer wins, ties are duplicates.
    pub updated_at: String,
    pub payload: Value,
}

/// Broadcast bridge between mutating services and connected displays.
///
/// Cloning is cheap; every service that mutates state holds one. Lagged
/// subscribers drop the oldest events (bounded channel), which is
/// acceptable because consumers re-query on reconnect.
#[derive(Debug, Clone)]
pub struct SyncBridge {
    tx: broadcast::Sender<ChangeEvent>,
}

impl SyncBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe a new display. Events published before subscription are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Publish a change. Returns the number of displays that received
    /// it; zero subscribers is not an error.
    pub fn publish(
        &self,
        entity: &str,
        entity_id: &str,
        op: ChangeOp,
        updated_at: &str,
        payload: Value,
    ) -> usize {
        let event = ChangeEvent {
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            op,
            updated_at: updated_at.to_string(),
            payload,
        };
        trace!(entity = %event.entity, entity_id = %event.entity_id, "publish change");
        self.tx.send(event).unwrap_or(0)
    }

    /// Connected display count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SyncBridge {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Consumer-side de-duplication
// ---------------------------------------------------------------------------

/// Latest-wins event cache for a display.
///
/// `apply` accepts an event only if it is newer than what the cache
/// already holds for that entity. RFC3339 UTC timestamps compare
/// correctly as strings, so no parsing is needed.
#[derive(Debug, Default)]
pub struct EventCache {
    latest: HashMap<(String, String), ChangeEvent>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event; returns `true` when it superseded the cached
    /// state, `false` when it was stale or a duplicate.
    pub fn apply(&mut self, event: ChangeEvent) -> bool {
        let key = (event.entity.clone(), event.entity_id.clone());
        match self.latest.get(&key) {
            Some(existing) if existing.updated_at >= event.updated_at => {
                debug!(
                    entity = %event.entity,
                    entity_id = %event.entity_id,
                    "stale or duplicate event dropped"
                );
                false
            }
            _ => {
                self.latest.insert(key, event);
                true
            }
        }
    }

    pub fn get(&self, entity: &str, entity_id: &str) -> Option<&ChangeEvent> {
        self.latest
            .get(&(entity.to_string(), entity_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
