//! Error types for the stock ledger.
//!
//! Errors are split into two layers mirroring the integrity design:
//!
//! - **[`StoreError`]**: failures at the storage layer: constraint
//!   violations, row-lock timeouts, missing or duplicate records.
//! - **[`InventoryError`]**: failures at the business layer: insufficient
//!   stock, locked batch quantities, disallowed state-machine edges.
//!
//! The conversion between the layers encodes the failure semantics of the
//! enforcement design: a lock timeout stays transient (callers retry with
//! backoff), while a constraint violation reaching the business layer means
//! validation was bypassed and is treated as a defect, not user error.

use std::time::Duration;

use thiserror::Error;

use crate::batch::BlockingMovements;
use crate::integrity::AvailabilityBreakdown;
use crate::store::RowKey;
use crate::transfer::TransferStatus;
use crate::types::{BatchId, TransferId};

/// Errors raised by the storage layer.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A storage-level constraint fired. This layer's job is "never
    /// corrupt", not "explain": reaching it means the validation layer was
    /// bypassed, so callers log it as a defect.
    #[error("constraint '{constraint}' violated: {detail}")]
    ConstraintViolation {
        /// Name of the violated constraint.
        constraint: String,
        /// Context describing the offending write.
        detail: String,
    },

    /// An exclusive row lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    LockTimeout {
        /// The row that could not be locked.
        key: RowKey,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A referenced record does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of record (e.g. "batch", "transfer").
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// An insert collided with an existing record id.
    #[error("{entity} '{id}' already exists")]
    DuplicateKey {
        /// Kind of record.
        entity: &'static str,
        /// The colliding identifier.
        id: String,
    },

    /// An unexpected internal storage failure.
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Errors raised by the business layer.
#[derive(Debug, Clone, Error)]
pub enum InventoryError {
    /// The operation would drive available quantity negative. Carries the
    /// full decomposition so the caller can explain "why" to an operator.
    #[error("insufficient stock: {breakdown}")]
    InsufficientStock {
        /// Decomposed availability figures at validation time.
        breakdown: AvailabilityBreakdown,
    },

    /// An edit was attempted on a batch quantity that movements already
    /// depend on. Corrections must go through an adjustment instead.
    #[error("quantity of batch '{batch_id}' is locked by {blocking}")]
    QuantityLocked {
        /// The batch whose quantity was targeted.
        batch_id: BatchId,
        /// Count and kind of the blocking movements.
        blocking: BlockingMovements,
    },

    /// A mutating edit was attempted on a transfer outside its editable
    /// states.
    #[error("transfer '{transfer_id}' is not editable in status {status}")]
    NotEditable {
        /// The transfer that was targeted.
        transfer_id: TransferId,
        /// Its current status.
        status: TransferStatus,
    },

    /// A state-machine edge that is not permitted.
    #[error("transfer '{transfer_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The transfer that was targeted.
        transfer_id: TransferId,
        /// Current status.
        from: TransferStatus,
        /// Attempted status.
        to: TransferStatus,
    },

    /// A transfer has no line items where at least one is required.
    #[error("transfer '{0}' has no line items")]
    EmptyTransfer(TransferId),

    /// A storage constraint fired despite pre-write validation. Indicates a
    /// bypass of the validation layer; logged distinctly as a defect.
    #[error("integrity constraint reached storage layer: {constraint}: {detail}")]
    ConstraintViolation {
        /// Name of the violated constraint.
        constraint: String,
        /// Context describing the offending write.
        detail: String,
    },

    /// A row lock could not be acquired within the configured timeout,
    /// after the bounded internal retries were exhausted. Transient.
    #[error("lock timeout on {key} after {waited:?}")]
    LockTimeout {
        /// The row that could not be locked.
        key: RowKey,
        /// Wait duration of the final attempt.
        waited: Duration,
    },

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Store(StoreError),
}

/// Type alias for business-layer results.
pub type InventoryResult<T> = Result<T, InventoryError>;

/// Type alias for storage-layer results.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for InventoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation { constraint, detail } => {
                Self::ConstraintViolation { constraint, detail }
            }
            StoreError::LockTimeout { key, waited } => Self::LockTimeout { key, waited },
            other => Self::Store(other),
        }
    }
}

impl InventoryError {
    /// True for failures the caller may retry unchanged (with backoff).
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// True for failures that indicate a system defect rather than a bad
    /// request.
    pub const fn is_defect(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }
}
