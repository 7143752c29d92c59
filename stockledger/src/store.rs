//! Storage abstraction for the stock ledger.
//!
//! The core engines are generic over [`InventoryStore`], which provides two
//! kinds of access:
//!
//! - **Read-committed reads**: lock-free queries that never block on row
//!   locks. They may observe a slightly stale figure; every mutating path
//!   re-validates under lock before writing, which catches staleness in the
//!   unsafe direction.
//! - **Transactions**: [`InventoryStore::begin`] acquires exclusive row
//!   locks for a declared key set, always in sorted, deduplicated order to
//!   prevent circular-wait deadlocks, then exposes snapshot reads and
//!   staged mutations. [`InventoryTransaction::commit`] applies the staged
//!   operations all-or-nothing, enforcing the storage-level constraints
//!   (non-negative quantities, unique keys). Dropping an uncommitted
//!   transaction discards the staging and releases the locks; there is no
//!   manual unlock path.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::adjustment::StockAdjustment;
use crate::batch::{BlockingMovements, StockBatch};
use crate::errors::StoreResult;
use crate::ledger::{
    MovementFilter, MovementPage, MovementSummary, MovementTotals, PageRequest, PeriodTotals,
    TimeBucket,
};
use crate::reservation::StockReservation;
use crate::sale::CommittedSale;
use crate::transfer::TransferRequest;
use crate::types::{BatchId, ProductId, SessionId, StorefrontId, TransferId, WarehouseId};

/// Identifies one lockable row.
///
/// `StockBatch` and `StorefrontInventory` quantities are the only resources
/// requiring exclusive locks; `Product` serializes warehouse-wide operations
/// (dispatch validation, storefront-unlinked reservations) and `Transfer`
/// serializes state-machine transitions of a single transfer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    /// Warehouse-wide operations on one product.
    Product(ProductId),
    /// One intake batch.
    Batch(BatchId),
    /// One (storefront, product) on-hand row.
    Storefront(StorefrontId, ProductId),
    /// One transfer request.
    Transfer(TransferId),
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Product(p) => write!(f, "product/{p}"),
            Self::Batch(b) => write!(f, "batch/{b}"),
            Self::Storefront(s, p) => write!(f, "storefront/{s}/{p}"),
            Self::Transfer(t) => write!(f, "transfer/{t}"),
        }
    }
}

/// Sorts and deduplicates a lock key set into the canonical acquisition
/// order. Every transaction must lock in this order.
pub fn normalize_keys(mut keys: Vec<RowKey>) -> Vec<RowKey> {
    keys.sort();
    keys.dedup();
    keys
}

/// One batch together with the committed movements that consume it.
#[derive(Debug, Clone)]
pub struct BatchStock {
    /// The intake record.
    pub batch: StockBatch,
    /// Signed sum of completed adjustments targeting this batch.
    pub adjusted: i64,
    /// Units allocated out by dispatched, non-cancelled transfers.
    pub allocated_out: u64,
}

impl BatchStock {
    /// Units still physically present in this batch.
    ///
    /// Signed: the storage constraints keep this non-negative, but the
    /// arithmetic is done in `i64` so a corrupted state is visible rather
    /// than wrapped.
    pub fn remaining(&self) -> i64 {
        i64::try_from(self.batch.quantity).unwrap_or(i64::MAX) + self.adjusted
            - i64::try_from(self.allocated_out).unwrap_or(i64::MAX)
    }
}

/// Committed rows backing one product's warehouse-side availability.
///
/// Derived view: warehouse on-hand is never stored, it is recomputed from
/// intake minus adjustments minus transferred-out so historical
/// reconciliations stay valid.
#[derive(Debug, Clone)]
pub struct WarehouseStock {
    /// The warehouse this view covers.
    pub warehouse: WarehouseId,
    /// The product this view covers.
    pub product: ProductId,
    /// Batches ordered by arrival date, then id (FIFO allocation order).
    pub batches: Vec<BatchStock>,
    /// Signed sum of warehouse-scope adjustments not tied to a batch.
    pub loose_adjustments: i64,
}

impl WarehouseStock {
    /// Total units received across all batches.
    pub fn intake(&self) -> u64 {
        self.batches.iter().map(|b| b.batch.quantity).sum()
    }

    /// Signed sum of all completed adjustments at this warehouse.
    pub fn adjusted(&self) -> i64 {
        self.batches.iter().map(|b| b.adjusted).sum::<i64>() + self.loose_adjustments
    }

    /// Units deducted by dispatched, non-cancelled transfers.
    pub fn transferred_out(&self) -> u64 {
        self.batches.iter().map(|b| b.allocated_out).sum()
    }

    /// Physically available units: `intake + adjustments - transferred out`.
    pub fn available(&self) -> i64 {
        self.batches.iter().map(BatchStock::remaining).sum::<i64>() + self.loose_adjustments
    }

    /// Units a transfer dispatch can draw. Allocation takes from batches
    /// only: a positive warehouse-scope correction carries no batch to
    /// draw from and is excluded, while a deficit not yet attributed to a
    /// batch still subtracts.
    pub fn dispatchable(&self) -> i64 {
        self.batches.iter().map(BatchStock::remaining).sum::<i64>() + self.loose_adjustments.min(0)
    }
}

/// A mutation staged inside a transaction, applied atomically at commit.
#[derive(Debug, Clone)]
pub enum StagedOp {
    /// Atomic increment/decrement of a (storefront, product) on-hand row.
    /// The row is created at zero if absent. The non-negative constraint is
    /// checked against the final value at commit.
    AdjustStorefront {
        /// Target storefront.
        storefront: StorefrontId,
        /// Target product.
        product: ProductId,
        /// Signed unit delta.
        delta: i64,
    },
    /// Direct edit of an intake quantity. Only legal while the batch has no
    /// movements; the engine checks that before staging.
    SetBatchQuantity {
        /// Target batch.
        batch: BatchId,
        /// Replacement intake quantity.
        quantity: u64,
    },
    /// Insert or replace a reservation by id.
    UpsertReservation(StockReservation),
    /// Append one completed adjustment record.
    InsertAdjustment(StockAdjustment),
    /// Append one committed sale record.
    InsertSale(CommittedSale),
    /// Replace a transfer record (status, lines, allocations, audit log).
    UpdateTransfer(TransferRequest),
}

/// Exclusive, all-or-nothing unit of stock mutation.
#[async_trait]
pub trait InventoryTransaction: Send {
    /// Reads one batch as of lock acquisition.
    async fn batch(&self, id: &BatchId) -> StoreResult<Option<StockBatch>>;

    /// Reads the warehouse-side stock view for one product.
    async fn warehouse_stock(
        &self,
        warehouse: &WarehouseId,
        product: &ProductId,
    ) -> StoreResult<WarehouseStock>;

    /// Counts the movements that pin a batch's intake quantity.
    async fn batch_movements(&self, id: &BatchId) -> StoreResult<BlockingMovements>;

    /// Warehouse-side stock views for every warehouse holding the product.
    async fn product_stock(&self, product: &ProductId) -> StoreResult<Vec<WarehouseStock>>;

    /// Reads a (storefront, product) on-hand quantity; zero if absent.
    async fn storefront_quantity(
        &self,
        storefront: &StorefrontId,
        product: &ProductId,
    ) -> StoreResult<u64>;

    /// All reservations referencing a product, any status.
    async fn reservations_for_product(
        &self,
        product: &ProductId,
    ) -> StoreResult<Vec<StockReservation>>;

    /// All reservations held by a session, any status.
    async fn reservations_for_session(
        &self,
        session: &SessionId,
    ) -> StoreResult<Vec<StockReservation>>;

    /// Reads one transfer record.
    async fn transfer(&self, id: &TransferId) -> StoreResult<Option<TransferRequest>>;

    /// Stages one mutation for commit.
    fn stage(&mut self, op: StagedOp);

    /// Applies every staged mutation atomically, then releases the locks.
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::StoreError::ConstraintViolation`] if any
    /// staged operation would violate a storage constraint; in that case
    /// nothing is applied.
    async fn commit(self) -> StoreResult<()>;
}

/// Storage contract for the stock ledger.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Transaction type produced by [`Self::begin`].
    type Tx: InventoryTransaction;

    /// Opens a transaction holding exclusive locks on `keys`.
    ///
    /// Implementations must acquire the locks in the order produced by
    /// [`normalize_keys`] and give up with
    /// [`crate::errors::StoreError::LockTimeout`] once `lock_timeout`
    /// elapses on any single lock, releasing everything acquired so far.
    async fn begin(&self, keys: Vec<RowKey>, lock_timeout: Duration) -> StoreResult<Self::Tx>;

    /// Reads one batch.
    async fn batch(&self, id: &BatchId) -> StoreResult<Option<StockBatch>>;

    /// Reads the warehouse-side stock view for one product.
    async fn warehouse_stock(
        &self,
        warehouse: &WarehouseId,
        product: &ProductId,
    ) -> StoreResult<WarehouseStock>;

    /// Counts the movements that pin a batch's intake quantity.
    async fn batch_movements(&self, id: &BatchId) -> StoreResult<BlockingMovements>;

    /// Warehouse-side stock views for every warehouse holding the product.
    async fn product_stock(&self, product: &ProductId) -> StoreResult<Vec<WarehouseStock>>;

    /// Reads a (storefront, product) on-hand quantity; zero if absent.
    async fn storefront_quantity(
        &self,
        storefront: &StorefrontId,
        product: &ProductId,
    ) -> StoreResult<u64>;

    /// All reservations referencing a product, any status.
    async fn reservations_for_product(
        &self,
        product: &ProductId,
    ) -> StoreResult<Vec<StockReservation>>;

    /// All reservations held by a session, any status.
    async fn reservations_for_session(
        &self,
        session: &SessionId,
    ) -> StoreResult<Vec<StockReservation>>;

    /// Reads one transfer record.
    async fn transfer(&self, id: &TransferId) -> StoreResult<Option<TransferRequest>>;

    /// Inserts a new intake batch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::StoreError::DuplicateKey`] if the id exists.
    async fn insert_batch(&self, batch: StockBatch) -> StoreResult<()>;

    /// Inserts a new transfer record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::StoreError::DuplicateKey`] if the id exists.
    async fn insert_transfer(&self, transfer: TransferRequest) -> StoreResult<()>;

    /// Flips reservations whose TTL lapsed before `now` to `Expired`.
    /// Idempotent; returns how many were flipped. Reads never count lapsed
    /// holds regardless, so this only persists what lazy evaluation already
    /// concluded.
    async fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// One page of the derived movement view plus the companion total
    /// count. Pagination happens inside the storage query layer; the full
    /// filtered set is never materialized for the caller.
    async fn list_movements(
        &self,
        filter: &MovementFilter,
        page: &PageRequest,
    ) -> StoreResult<MovementPage>;

    /// Summary over the entire filtered set (not the current page).
    async fn summarize_movements(&self, filter: &MovementFilter) -> StoreResult<MovementSummary>;

    /// Per-warehouse movement totals over the filtered set.
    async fn totals_by_warehouse(
        &self,
        filter: &MovementFilter,
    ) -> StoreResult<HashMap<WarehouseId, MovementTotals>>;

    /// Per-product movement totals over the filtered set.
    async fn totals_by_product(
        &self,
        filter: &MovementFilter,
    ) -> StoreResult<HashMap<ProductId, MovementTotals>>;

    /// Ordered per-period totals over the filtered set.
    async fn movement_time_series(
        &self,
        filter: &MovementFilter,
        bucket: TimeBucket,
    ) -> StoreResult<Vec<PeriodTotals>>;
}
