//! Inventory availability and movement ledger for multi-location retail.
//!
//! Stock lives in two places with different shapes: warehouses hold
//! *intake batches* (append-only records whose availability is derived,
//! never stored), storefronts hold a *denormalized on-hand row* per
//! product (materialized, mutated only by atomic deltas). Everything that
//! moves quantity between or out of those places (transfers, sales,
//! adjustments) is an append-only source record, and the movement ledger
//! is derived from those sources on demand so history can never disagree
//! with stock.
//!
//! # Engines
//!
//! Each concern is owned by one engine generic over the
//! [`store::InventoryStore`] storage contract:
//!
//! - [`batch::BatchIntake`] records intake batches and their costs.
//! - [`reservation::ReservationManager`] places TTL-bounded holds that
//!   reduce sellable (not physical) stock.
//! - [`sale::SaleStockCoordinator`] runs the atomic deduct-record-release
//!   sequence when a draft sale commits.
//! - [`transfer::TransferEngine`] drives the warehouse-to-storefront
//!   transfer state machine.
//! - [`adjustment::AdjustmentEngine`] applies corrections and shrinkage
//!   write-offs.
//! - [`ledger::MovementLedger`] answers history and aggregation queries.
//!
//! # Integrity
//!
//! Three layers protect quantities (see [`integrity`]): pre-write
//! validation with explanatory [`integrity::AvailabilityBreakdown`]s,
//! storage-level constraints, and exclusive row locks acquired in
//! deterministic order with re-validation under the lock. Lock timeouts
//! are retried internally with jittered exponential backoff.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stockledger::batch::{BatchCosts, BatchIntake, NewBatch};
//!
//! let store = Arc::new(my_store);
//! let intake = BatchIntake::new(Arc::clone(&store));
//! let batch = intake.create_batch(new_batch).await?;
//! ```

pub mod adjustment;
pub mod batch;
pub mod catalog;
pub mod errors;
pub mod integrity;
pub mod ledger;
pub mod reservation;
pub mod sale;
pub mod store;
pub mod transfer;
pub mod types;

pub use adjustment::{
    AdjustmentEngine, AdjustmentKind, AdjustmentScope, AdjustmentTarget, NewAdjustment,
    StockAdjustment,
};
pub use batch::{BatchCosts, BatchIntake, BlockingMovements, NewBatch, StockBatch, UnitTax};
pub use catalog::{Catalog, MapCatalog, ProductInfo};
pub use errors::{InventoryError, InventoryResult, StoreError, StoreResult};
pub use integrity::{AvailabilityBreakdown, IntegrityConfig, RetryConfig};
pub use ledger::{
    MovementDirection, MovementFilter, MovementLedger, MovementPage, MovementRecord, MovementRef,
    MovementSummary, MovementTotals, MovementType, PageRequest, PeriodTotals, TimeBucket,
};
pub use reservation::{
    AvailabilityProbe, ReservationManager, ReservationStatus, ReserveRequest, StockReservation,
    StockScope,
};
pub use sale::{CommittedSale, Payment, SaleCommit, SaleLine, SaleStatus, SaleStockCoordinator};
pub use store::{
    BatchStock, InventoryStore, InventoryTransaction, RowKey, StagedOp, WarehouseStock,
};
pub use transfer::{
    BatchAllocation, NewTransfer, TransferAction, TransferAuditEntry, TransferEngine,
    TransferLine, TransferRequest, TransferStatus,
};
pub use types::{
    ActorId, AdjustmentId, BatchId, Money, MoneyError, ProductId, Quantity, ReservationId, SaleId,
    SessionId, StorefrontId, TransferId, WarehouseId,
};
