//! Bistro POS core.
//!
//! Order-to-kitchen-to-payment pipeline for a restaurant: orders break
//! into bills, bills into items; items flow through department
//! preparation queues and, independently, through payment. Marking an
//! item ready triggers an exactly-once FIFO inventory write-off whose
//! cost is cached for the payment path. All derived state (order
//! status, bill payment status, table occupancy) is recomputed from
//! items, never stored authoritatively.
//!
//! Services are constructed once per process and passed by reference;
//! there are no global singletons.

use std::env;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod accounts;
pub mod catalog;
pub mod db;
pub mod decompose;
pub mod error;
pub mod inventory;
pub mod kitchen;
pub mod orders;
pub mod payments;
pub mod sync;
pub mod tables;
pub mod tasks;
pub mod types;
pub mod writeoff;

pub use error::{PosError, PosResult};

/// Default stale-`processing` recovery timeout (seconds).
const DEFAULT_STALE_PROCESSING_TIMEOUT_SECS: i64 = 5 * 60;
/// Default sync channel capacity.
const DEFAULT_SYNC_CHANNEL_CAPACITY: usize = 256;

/// Process-wide configuration, overridable from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Items stuck in `processing` longer than this are reset to
    /// `pending` by the recovery sweep.
    pub stale_processing_timeout_secs: i64,
    /// Bounded capacity of the realtime change channel.
    pub sync_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stale_processing_timeout_secs: DEFAULT_STALE_PROCESSING_TIMEOUT_SECS,
            sync_channel_capacity: DEFAULT_SYNC_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Build from `BISTRO_POS_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stale_processing_timeout_secs: env_parse(
                "BISTRO_POS_STALE_TIMEOUT_SECS",
                defaults.stale_processing_timeout_secs,
            ),
            sync_channel_capacity: env_parse(
                "BISTRO_POS_SYNC_CAPACITY",
                defaults.sync_channel_capacity,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Initialize tracing with an env-filter (`RUST_LOG`) and compact
/// output. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().compact())
        .try_init();
}

// ===========================================================================
// Tests
// ===========================================================================
