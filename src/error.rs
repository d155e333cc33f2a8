//! Error types for Bistro POS.
//!
//! Every error carries a stable machine-readable code (for terminals and
//! logs) plus a human-readable message. Validation failures are rejected
//! synchronously and never mutate state; none of these are used for
//! ordinary control flow.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum PosError {
    /// Payment target account does not exist or is deactivated.
    #[error("Account not found or inactive: {0}")]
    InvalidAccount(String),

    /// Payment selection is empty, ambiguous, or references unknown entities.
    #[error("Invalid payment selection: {0}")]
    InvalidSelection(String),

    /// A payment request matched no payable items.
    #[error("No items were processed")]
    NoItemsProcessed,

    /// Zero or negative payment amount.
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(f64),

    /// Status transition not allowed by the state machine (e.g. paying an
    /// already-paid item, or kitchen skipping the cooking state).
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

impl PosError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            PosError::InvalidAccount(_) => "INVALID_ACCOUNT",
            PosError::InvalidSelection(_) => "INVALID_SELECTION",
            PosError::NoItemsProcessed => "NO_ITEMS_PROCESSED",
            PosError::InvalidAmount(_) => "INVALID_AMOUNT",
            PosError::InvalidTransition(_) => "INVALID_TRANSITION",
            PosError::NotFound { .. } => "NOT_FOUND",
            PosError::Db(_) => "DB_ERROR",
            PosError::Internal(_) => "INTERNAL",
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PosError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result alias used across the crate.
pub type PosResult<T> = Result<T, PosError>;

// ===========================================================================
// Tests
// ===========================================================================
