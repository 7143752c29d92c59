//! In-memory adapter for the stockledger storage contract.
//!
//! This crate provides an in-memory implementation of the
//! [`InventoryStore`] trait from the stockledger crate, useful for testing
//! and single-process deployments where persistence is not required.
//!
//! Row locks are real: [`InventoryStore::begin`] acquires one
//! `tokio::sync::Mutex` per normalized key and gives up with a lock
//! timeout, so concurrency tests against this adapter exercise the same
//! lock discipline a database-backed adapter would.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;

use stockledger::adjustment::{AdjustmentKind, AdjustmentScope, StockAdjustment};
use stockledger::batch::{BlockingMovements, StockBatch};
use stockledger::errors::{StoreError, StoreResult};
use stockledger::ledger::{
    MovementDirection, MovementFilter, MovementPage, MovementRecord, MovementRef, MovementSummary,
    MovementTotals, MovementType, PageRequest, PeriodTotals, TimeBucket,
};
use stockledger::reservation::{ReservationStatus, StockReservation};
use stockledger::sale::CommittedSale;
use stockledger::store::{
    normalize_keys, BatchStock, InventoryStore, InventoryTransaction, RowKey, StagedOp,
    WarehouseStock,
};
use stockledger::transfer::{TransferRequest, TransferStatus};
use stockledger::types::{
    BatchId, Money, ProductId, ReservationId, SessionId, StorefrontId, TransferId, WarehouseId,
};

/// The committed tables. Cloned wholesale at commit time so a failed
/// constraint check leaves the original untouched.
#[derive(Debug, Default, Clone)]
struct State {
    batches: HashMap<BatchId, StockBatch>,
    storefront: HashMap<(StorefrontId, ProductId), u64>,
    reservations: HashMap<ReservationId, StockReservation>,
    adjustments: Vec<StockAdjustment>,
    sales: Vec<CommittedSale>,
    transfers: HashMap<TransferId, TransferRequest>,
}

/// Thread-safe in-memory inventory store.
#[derive(Clone, Default)]
pub struct InMemoryInventoryStore {
    state: Arc<RwLock<State>>,
    locks: Arc<StdMutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl InMemoryInventoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_handle(&self, key: &RowKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.locks.lock().expect("Mutex poisoned");
        Arc::clone(table.entry(key.clone()).or_default())
    }
}

/// Transaction over the in-memory store. Holds its row locks until commit
/// or drop; dropping without commit discards the staged operations.
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    _guards: Vec<OwnedMutexGuard<()>>,
    staged: Vec<StagedOp>,
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self, keys: Vec<RowKey>, lock_timeout: Duration) -> StoreResult<Self::Tx> {
        let keys = normalize_keys(keys);
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let handle = self.lock_handle(&key);
            match tokio::time::timeout(lock_timeout, handle.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    // Guards acquired so far drop here, releasing their rows.
                    tracing::debug!(%key, ?lock_timeout, "row lock timed out");
                    return Err(StoreError::LockTimeout {
                        key,
                        waited: lock_timeout,
                    });
                }
            }
        }
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            _guards: guards,
            staged: Vec::new(),
        })
    }

    async fn batch(&self, id: &BatchId) -> StoreResult<Option<StockBatch>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state.batches.get(id).cloned())
    }

    async fn warehouse_stock(
        &self,
        warehouse: &WarehouseId,
        product: &ProductId,
    ) -> StoreResult<WarehouseStock> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(warehouse_view(&state, warehouse, product))
    }

    async fn batch_movements(&self, id: &BatchId) -> StoreResult<BlockingMovements> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(blocking_movements(&state, id))
    }

    async fn product_stock(&self, product: &ProductId) -> StoreResult<Vec<WarehouseStock>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(product_views(&state, product))
    }

    async fn storefront_quantity(
        &self,
        storefront: &StorefrontId,
        product: &ProductId,
    ) -> StoreResult<u64> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .storefront
            .get(&(storefront.clone(), product.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn reservations_for_product(
        &self,
        product: &ProductId,
    ) -> StoreResult<Vec<StockReservation>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .reservations
            .values()
            .filter(|r| &r.product == product)
            .cloned()
            .collect())
    }

    async fn reservations_for_session(
        &self,
        session: &SessionId,
    ) -> StoreResult<Vec<StockReservation>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .reservations
            .values()
            .filter(|r| &r.session == session)
            .cloned()
            .collect())
    }

    async fn transfer(&self, id: &TransferId) -> StoreResult<Option<TransferRequest>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state.transfers.get(id).cloned())
    }

    async fn insert_batch(&self, batch: StockBatch) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        if state.batches.contains_key(&batch.id) {
            return Err(StoreError::DuplicateKey {
                entity: "batch",
                id: batch.id.to_string(),
            });
        }
        state.batches.insert(batch.id.clone(), batch);
        Ok(())
    }

    async fn insert_transfer(&self, transfer: TransferRequest) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        if state.transfers.contains_key(&transfer.id) {
            return Err(StoreError::DuplicateKey {
                entity: "transfer",
                id: transfer.id.to_string(),
            });
        }
        state.transfers.insert(transfer.id.clone(), transfer);
        Ok(())
    }

    async fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let mut swept = 0;
        for reservation in state.reservations.values_mut() {
            if reservation.status == ReservationStatus::Active && reservation.expires_at <= now {
                reservation.status = ReservationStatus::Expired;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn list_movements(
        &self,
        filter: &MovementFilter,
        page: &PageRequest,
    ) -> StoreResult<MovementPage> {
        let state = self.state.read().expect("RwLock poisoned");
        let mut matching: Vec<MovementRecord> = derive_movements(&state)
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        // Most recent first; occurred_at is not unique, so break ties on the
        // reference for a stable page order.
        matching.sort_by(|a, b| {
            b.occurred_at
                .cmp(&a.occurred_at)
                .then_with(|| a.reference.to_string().cmp(&b.reference.to_string()))
        });
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(MovementPage {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn summarize_movements(&self, filter: &MovementFilter) -> StoreResult<MovementSummary> {
        let state = self.state.read().expect("RwLock poisoned");
        let mut summary = MovementSummary::default();
        for record in derive_movements(&state) {
            if filter.matches(&record) {
                summary.absorb(&record);
            }
        }
        Ok(summary)
    }

    async fn totals_by_warehouse(
        &self,
        filter: &MovementFilter,
    ) -> StoreResult<HashMap<WarehouseId, MovementTotals>> {
        let state = self.state.read().expect("RwLock poisoned");
        let mut totals: HashMap<WarehouseId, MovementTotals> = HashMap::new();
        for record in derive_movements(&state) {
            if !filter.matches(&record) {
                continue;
            }
            if let Some(warehouse) = &record.warehouse {
                totals.entry(warehouse.clone()).or_default().absorb(&record);
            }
        }
        Ok(totals)
    }

    async fn totals_by_product(
        &self,
        filter: &MovementFilter,
    ) -> StoreResult<HashMap<ProductId, MovementTotals>> {
        let state = self.state.read().expect("RwLock poisoned");
        let mut totals: HashMap<ProductId, MovementTotals> = HashMap::new();
        for record in derive_movements(&state) {
            if filter.matches(&record) {
                totals
                    .entry(record.product.clone())
                    .or_default()
                    .absorb(&record);
            }
        }
        Ok(totals)
    }

    async fn movement_time_series(
        &self,
        filter: &MovementFilter,
        bucket: TimeBucket,
    ) -> StoreResult<Vec<PeriodTotals>> {
        let state = self.state.read().expect("RwLock poisoned");
        let mut periods: BTreeMap<DateTime<Utc>, MovementTotals> = BTreeMap::new();
        for record in derive_movements(&state) {
            if filter.matches(&record) {
                periods
                    .entry(bucket.start_of(record.occurred_at))
                    .or_default()
                    .absorb(&record);
            }
        }
        Ok(periods
            .into_iter()
            .map(|(period_start, totals)| PeriodTotals {
                period_start,
                totals,
            })
            .collect())
    }
}

#[async_trait]
impl InventoryTransaction for InMemoryTransaction {
    async fn batch(&self, id: &BatchId) -> StoreResult<Option<StockBatch>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state.batches.get(id).cloned())
    }

    async fn warehouse_stock(
        &self,
        warehouse: &WarehouseId,
        product: &ProductId,
    ) -> StoreResult<WarehouseStock> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(warehouse_view(&state, warehouse, product))
    }

    async fn batch_movements(&self, id: &BatchId) -> StoreResult<BlockingMovements> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(blocking_movements(&state, id))
    }

    async fn product_stock(&self, product: &ProductId) -> StoreResult<Vec<WarehouseStock>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(product_views(&state, product))
    }

    async fn storefront_quantity(
        &self,
        storefront: &StorefrontId,
        product: &ProductId,
    ) -> StoreResult<u64> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .storefront
            .get(&(storefront.clone(), product.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn reservations_for_product(
        &self,
        product: &ProductId,
    ) -> StoreResult<Vec<StockReservation>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .reservations
            .values()
            .filter(|r| &r.product == product)
            .cloned()
            .collect())
    }

    async fn reservations_for_session(
        &self,
        session: &SessionId,
    ) -> StoreResult<Vec<StockReservation>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .reservations
            .values()
            .filter(|r| &r.session == session)
            .cloned()
            .collect())
    }

    async fn transfer(&self, id: &TransferId) -> StoreResult<Option<TransferRequest>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state.transfers.get(id).cloned())
    }

    fn stage(&mut self, op: StagedOp) {
        self.staged.push(op);
    }

    async fn commit(self) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        // Apply to a copy, verify the invariants, then swap. A constraint
        // failure leaves the committed tables untouched.
        let mut next = state.clone();
        apply_ops(&mut next, self.staged)?;
        verify_invariants(&next)?;
        *state = next;
        Ok(())
    }
}

fn apply_ops(state: &mut State, ops: Vec<StagedOp>) -> StoreResult<()> {
    for op in ops {
        match op {
            StagedOp::AdjustStorefront {
                storefront,
                product,
                delta,
            } => {
                let key = (storefront, product);
                let current = i64::try_from(state.storefront.get(&key).copied().unwrap_or(0))
                    .unwrap_or(i64::MAX);
                let next = current + delta;
                let Ok(next) = u64::try_from(next) else {
                    return Err(StoreError::ConstraintViolation {
                        constraint: "storefront_quantity_non_negative".to_owned(),
                        detail: format!(
                            "{}/{} would become {next}",
                            key.0, key.1
                        ),
                    });
                };
                state.storefront.insert(key, next);
            }
            StagedOp::SetBatchQuantity { batch, quantity } => {
                let Some(record) = state.batches.get_mut(&batch) else {
                    return Err(StoreError::NotFound {
                        entity: "batch",
                        id: batch.to_string(),
                    });
                };
                record.quantity = quantity;
            }
            StagedOp::UpsertReservation(reservation) => {
                state
                    .reservations
                    .insert(reservation.id.clone(), reservation);
            }
            StagedOp::InsertAdjustment(adjustment) => {
                state.adjustments.push(adjustment);
            }
            StagedOp::InsertSale(sale) => {
                if state.sales.iter().any(|s| s.sale == sale.sale) {
                    return Err(StoreError::DuplicateKey {
                        entity: "sale",
                        id: sale.sale.to_string(),
                    });
                }
                state.sales.push(sale);
            }
            StagedOp::UpdateTransfer(transfer) => {
                if !state.transfers.contains_key(&transfer.id) {
                    return Err(StoreError::NotFound {
                        entity: "transfer",
                        id: transfer.id.to_string(),
                    });
                }
                state.transfers.insert(transfer.id.clone(), transfer);
            }
        }
    }
    Ok(())
}

/// Storage-level safety net over the derived quantities. Fires only when
/// the validation layer above was bypassed.
fn verify_invariants(state: &State) -> StoreResult<()> {
    for batch in state.batches.values() {
        let view = BatchStock {
            batch: batch.clone(),
            adjusted: batch_adjusted(state, &batch.id),
            allocated_out: batch_allocated_out(state, &batch.id),
        };
        if view.remaining() < 0 {
            return Err(StoreError::ConstraintViolation {
                constraint: "batch_remaining_non_negative".to_owned(),
                detail: format!("batch {} would have {} remaining", batch.id, view.remaining()),
            });
        }
    }
    let mut combos: Vec<(WarehouseId, ProductId)> = state
        .adjustments
        .iter()
        .filter_map(|a| {
            a.scope
                .warehouse()
                .map(|w| (w.clone(), a.product.clone()))
        })
        .collect();
    combos.sort();
    combos.dedup();
    for (warehouse, product) in combos {
        let view = warehouse_view(state, &warehouse, &product);
        if view.available() < 0 {
            return Err(StoreError::ConstraintViolation {
                constraint: "warehouse_available_non_negative".to_owned(),
                detail: format!(
                    "{warehouse}/{product} would have {} available",
                    view.available()
                ),
            });
        }
    }
    Ok(())
}

fn batch_adjusted(state: &State, id: &BatchId) -> i64 {
    state
        .adjustments
        .iter()
        .filter(|a| matches!(&a.scope, AdjustmentScope::Batch { batch, .. } if batch == id))
        .map(|a| a.delta)
        .sum()
}

fn batch_allocated_out(state: &State, id: &BatchId) -> u64 {
    state
        .transfers
        .values()
        .filter(|t| matches!(t.status, TransferStatus::InTransit | TransferStatus::Completed))
        .flat_map(|t| t.lines.iter())
        .flat_map(|line| line.allocations.iter())
        .filter(|alloc| &alloc.batch == id)
        .map(|alloc| alloc.quantity)
        .sum()
}

fn blocking_movements(state: &State, id: &BatchId) -> BlockingMovements {
    let adjustments = state
        .adjustments
        .iter()
        .filter(|a| matches!(&a.scope, AdjustmentScope::Batch { batch, .. } if batch == id))
        .count();
    let transfer_allocations = state
        .transfers
        .values()
        .filter(|t| matches!(t.status, TransferStatus::InTransit | TransferStatus::Completed))
        .flat_map(|t| t.lines.iter())
        .flat_map(|line| line.allocations.iter())
        .filter(|alloc| &alloc.batch == id)
        .count();
    BlockingMovements {
        adjustments,
        transfer_allocations,
    }
}

fn warehouse_view(state: &State, warehouse: &WarehouseId, product: &ProductId) -> WarehouseStock {
    let mut batches: Vec<BatchStock> = state
        .batches
        .values()
        .filter(|b| &b.warehouse == warehouse && &b.product == product)
        .map(|b| BatchStock {
            batch: b.clone(),
            adjusted: batch_adjusted(state, &b.id),
            allocated_out: batch_allocated_out(state, &b.id),
        })
        .collect();
    // FIFO allocation order.
    batches.sort_by(|a, b| {
        a.batch
            .arrival_date
            .cmp(&b.batch.arrival_date)
            .then_with(|| a.batch.id.cmp(&b.batch.id))
    });
    let loose_adjustments = state
        .adjustments
        .iter()
        .filter(|a| {
            a.product == *product
                && matches!(&a.scope, AdjustmentScope::Warehouse { warehouse: w } if w == warehouse)
        })
        .map(|a| a.delta)
        .sum();
    WarehouseStock {
        warehouse: warehouse.clone(),
        product: product.clone(),
        batches,
        loose_adjustments,
    }
}

fn product_views(state: &State, product: &ProductId) -> Vec<WarehouseStock> {
    let mut warehouses: Vec<WarehouseId> = state
        .batches
        .values()
        .filter(|b| &b.product == product)
        .map(|b| b.warehouse.clone())
        .chain(state.adjustments.iter().filter_map(|a| {
            (a.product == *product)
                .then(|| a.scope.warehouse().cloned())
                .flatten()
        }))
        .collect();
    warehouses.sort();
    warehouses.dedup();
    warehouses
        .into_iter()
        .map(|w| warehouse_view(state, &w, product))
        .collect()
}

/// Derives the movement view from the committed source records. Never
/// stored; every query recomputes from the sources so the ledger cannot
/// drift from the stock it explains.
fn derive_movements(state: &State) -> Vec<MovementRecord> {
    let mut records = Vec::new();
    for sale in &state.sales {
        for line in &sale.lines {
            records.push(MovementRecord {
                reference: MovementRef::Sale(sale.sale.clone()),
                movement_type: MovementType::Sale,
                direction: MovementDirection::Out,
                product: line.product.clone(),
                quantity: line.quantity,
                unit_value: Some(line.unit_price),
                warehouse: None,
                storefront: Some(sale.storefront.clone()),
                occurred_at: sale.committed_at,
            });
        }
    }
    for transfer in state.transfers.values() {
        match transfer.status {
            TransferStatus::InTransit => {
                let at = transfer.dispatched_at.unwrap_or(transfer.created_at);
                for line in &transfer.lines {
                    records.push(MovementRecord {
                        reference: MovementRef::Transfer(transfer.id.clone()),
                        movement_type: MovementType::Transfer,
                        direction: MovementDirection::Out,
                        product: line.product.clone(),
                        quantity: line.effective_quantity(),
                        unit_value: allocation_unit_cost(state, line),
                        warehouse: Some(transfer.warehouse.clone()),
                        storefront: None,
                        occurred_at: at,
                    });
                }
            }
            TransferStatus::Completed => {
                let at = transfer.completed_at.unwrap_or(transfer.created_at);
                for line in &transfer.lines {
                    records.push(MovementRecord {
                        reference: MovementRef::Transfer(transfer.id.clone()),
                        movement_type: MovementType::Transfer,
                        direction: MovementDirection::Both,
                        product: line.product.clone(),
                        quantity: line.effective_quantity(),
                        unit_value: allocation_unit_cost(state, line),
                        warehouse: Some(transfer.warehouse.clone()),
                        storefront: Some(transfer.storefront.clone()),
                        occurred_at: at,
                    });
                }
            }
            TransferStatus::Draft
            | TransferStatus::Requested
            | TransferStatus::Approved
            | TransferStatus::Rejected
            | TransferStatus::Cancelled => {}
        }
    }
    for adjustment in &state.adjustments {
        records.push(MovementRecord {
            reference: MovementRef::Adjustment(adjustment.id.clone()),
            movement_type: match adjustment.kind {
                AdjustmentKind::Correction => MovementType::Adjustment,
                AdjustmentKind::Shrinkage => MovementType::Shrinkage,
            },
            direction: if adjustment.delta >= 0 {
                MovementDirection::In
            } else {
                MovementDirection::Out
            },
            product: adjustment.product.clone(),
            quantity: adjustment.delta.unsigned_abs(),
            unit_value: adjustment.unit_cost,
            warehouse: adjustment.scope.warehouse().cloned(),
            storefront: adjustment.scope.storefront().cloned(),
            occurred_at: adjustment.applied_at,
        });
    }
    records
}

/// Allocation-weighted landed unit cost of a transfer line, when every
/// allocated batch is still on record.
fn allocation_unit_cost(
    state: &State,
    line: &stockledger::transfer::TransferLine,
) -> Option<Money> {
    if line.allocations.is_empty() {
        return None;
    }
    let mut units = 0u64;
    let mut total = Decimal::ZERO;
    for alloc in &line.allocations {
        let batch = state.batches.get(&alloc.batch)?;
        units += alloc.quantity;
        total += batch.costs.landed_unit_cost().times(alloc.quantity);
    }
    if units == 0 {
        return None;
    }
    Money::rounded(total / Decimal::from(units)).ok()
}
